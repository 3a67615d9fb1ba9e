//! Project: GuardBSD Winter Saga version 1.0.0
//! Package: ahci
//! Copyright © 2025 Cartesian School. Developed by Siergej Sobolewski.
//! License: BSD-3-Clause
//!
//! Deferred tasks and bounded polling on the single server thread.
//!
//! Tasks receive the driver context and the scheduler itself, so a task
//! never holds a reference into the context across turns. Time is a
//! virtual microsecond counter advanced by the server loop.

use alloc::boxed::Box;
use alloc::collections::BinaryHeap;
use core::cmp::Ordering;

pub type Task<C> = Box<dyn FnOnce(&mut C, &mut Errands<C>)>;

/// Attempt budget of a bounded poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollBudget {
    pub attempts: u32,
    pub interval_us: u64,
}

impl PollBudget {
    #[must_use]
    pub const fn new(attempts: u32, interval_us: u64) -> Self {
        Self {
            attempts,
            interval_us,
        }
    }

    /// Account one failed retry. Returns false once the budget is spent.
    pub fn consume(&mut self) -> bool {
        self.attempts = self.attempts.saturating_sub(1);
        self.attempts > 0
    }
}

struct Timer<C> {
    due: u64,
    seq: u64,
    task: Task<C>,
}

impl<C> PartialEq for Timer<C> {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl<C> Eq for Timer<C> {}

impl<C> PartialOrd for Timer<C> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

// Reversed: BinaryHeap is a max-heap and the earliest timer must pop first.
impl<C> Ord for Timer<C> {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .due
            .cmp(&self.due)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

pub struct Errands<C> {
    now: u64,
    seq: u64,
    timers: BinaryHeap<Timer<C>>,
}

impl<C: 'static> Default for Errands<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: 'static> Errands<C> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            now: 0,
            seq: 0,
            timers: BinaryHeap::new(),
        }
    }

    #[must_use]
    pub fn now(&self) -> u64 {
        self.now
    }

    #[must_use]
    pub fn pending(&self) -> usize {
        self.timers.len()
    }

    #[must_use]
    pub fn next_deadline(&self) -> Option<u64> {
        self.timers.peek().map(|t| t.due)
    }

    /// Run `task` no earlier than `delay_us` from now. Tasks with equal
    /// deadlines run in scheduling order.
    pub fn schedule<F>(&mut self, delay_us: u64, task: F)
    where
        F: FnOnce(&mut C, &mut Errands<C>) + 'static,
    {
        let seq = self.seq;
        self.seq += 1;
        self.timers.push(Timer {
            due: self.now.saturating_add(delay_us),
            seq,
            task: Box::new(task),
        });
    }

    /// Probe now; on failure re-probe every `budget.interval_us` until the
    /// probe succeeds or the budget is spent. `on_done` runs exactly once.
    pub fn poll<P, D>(&mut self, ctx: &mut C, budget: PollBudget, mut probe: P, on_done: D)
    where
        P: FnMut(&mut C, &mut Errands<C>) -> bool + 'static,
        D: FnOnce(&mut C, &mut Errands<C>, bool) + 'static,
    {
        if probe(ctx, self) {
            on_done(ctx, self, true);
            return;
        }
        if budget.attempts == 0 {
            on_done(ctx, self, false);
            return;
        }
        self.retry(budget, probe, on_done);
    }

    fn retry<P, D>(&mut self, budget: PollBudget, probe: P, on_done: D)
    where
        P: FnMut(&mut C, &mut Errands<C>) -> bool + 'static,
        D: FnOnce(&mut C, &mut Errands<C>, bool) + 'static,
    {
        self.schedule(budget.interval_us, move |ctx, errands| {
            let mut budget = budget;
            let mut probe = probe;
            if probe(ctx, errands) {
                on_done(ctx, errands, true);
            } else if budget.consume() {
                errands.retry(budget, probe, on_done);
            } else {
                on_done(ctx, errands, false);
            }
        });
    }

    /// Run every task due at or before `now` and advance the clock to it.
    pub fn run_until(&mut self, ctx: &mut C, now: u64) -> usize {
        let mut ran = 0;
        while self.timers.peek().is_some_and(|t| t.due <= now) {
            let Some(timer) = self.timers.pop() else {
                break;
            };
            if timer.due > self.now {
                self.now = timer.due;
            }
            (timer.task)(ctx, self);
            ran += 1;
        }
        if now > self.now {
            self.now = now;
        }
        ran
    }

    /// Jump to the earliest deadline and run what is due there.
    pub fn run_next(&mut self, ctx: &mut C) -> usize {
        match self.next_deadline() {
            Some(due) => self.run_until(ctx, due.max(self.now)),
            None => 0,
        }
    }
}
