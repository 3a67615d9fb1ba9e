//! Project: GuardBSD Winter Saga version 1.0.0
//! Package: kernel_log
//! Copyright © 2025 Cartesian School. Developed by Siergej Sobolewski.
//! License: BSD-3-Clause
//!
//! Logging handle shared by the storage driver components.
//!
//! There is no global logger. A [`Logger`] is built once from a
//! [`LoggerConfig`] and cloned into every component that wants to log.
//! Clones share the level, the sink and the in-memory ring.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

use alloc::string::String;
use alloc::sync::Arc;
use core::fmt;
use core::fmt::Write;
use core::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};

use spin::Mutex;

// Tunables
pub const MEM_RING_SIZE: usize = 4096;
pub const LOG_MSG_MAX: usize = 192;
pub const LOG_SUBSYS_MAX: usize = 32;

const LINE_MAX: usize = LOG_MSG_MAX + LOG_SUBSYS_MAX + 32;

#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Trace = 0,
    Debug = 1,
    Info = 2,
    Warn = 3,
    Error = 4,
}

impl LogLevel {
    #[inline]
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            LogLevel::Trace => "TRACE",
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
        }
    }

    #[must_use]
    pub const fn from_u8(raw: u8) -> Self {
        match raw {
            0 => LogLevel::Trace,
            1 => LogLevel::Debug,
            2 => LogLevel::Info,
            3 => LogLevel::Warn,
            _ => LogLevel::Error,
        }
    }

    /// One step more verbose, saturating at `Trace`.
    #[must_use]
    pub const fn more_verbose(self) -> Self {
        match self {
            LogLevel::Error => LogLevel::Warn,
            LogLevel::Warn => LogLevel::Info,
            LogLevel::Info => LogLevel::Debug,
            LogLevel::Debug | LogLevel::Trace => LogLevel::Trace,
        }
    }

    /// Parse a level name as written in configuration files.
    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        let level = match name {
            "trace" | "TRACE" => LogLevel::Trace,
            "debug" | "DEBUG" => LogLevel::Debug,
            "info" | "INFO" => LogLevel::Info,
            "warn" | "WARN" | "warning" => LogLevel::Warn,
            "error" | "ERROR" => LogLevel::Error,
            _ => return None,
        };
        Some(level)
    }
}

pub type SinkFn = fn(&[u8]);

#[derive(Copy, Clone)]
pub struct LoggerConfig {
    pub level: LogLevel,
    pub timestamp: fn() -> u64,
    pub sink: Option<SinkFn>,
    pub mem_ring: bool,
}

impl LoggerConfig {
    #[must_use]
    pub const fn default() -> Self {
        Self {
            level: LogLevel::Info,
            timestamp: default_timestamp,
            sink: None,
            mem_ring: true,
        }
    }

    #[must_use]
    pub const fn with_level(mut self, level: LogLevel) -> Self {
        self.level = level;
        self
    }

    #[must_use]
    pub const fn with_sink(mut self, sink: SinkFn) -> Self {
        self.sink = Some(sink);
        self
    }
}

static FALLBACK_COUNTER: AtomicU64 = AtomicU64::new(0);

pub fn default_timestamp() -> u64 {
    FALLBACK_COUNTER.fetch_add(1, Ordering::Relaxed)
}

// --------------------------------------------------------------------------
// Logger handle
// --------------------------------------------------------------------------

struct Inner {
    level: AtomicU8,
    timestamp: fn() -> u64,
    sink: Option<SinkFn>,
    mem_enabled: AtomicBool,
    // Set while a record is being emitted; a sink that logs back into
    // the same handle only reaches the memory ring.
    active: AtomicBool,
    ring: Mutex<MemRing>,
}

#[derive(Clone)]
pub struct Logger {
    inner: Arc<Inner>,
}

impl Logger {
    #[must_use]
    pub fn new(config: LoggerConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                level: AtomicU8::new(config.level as u8),
                timestamp: config.timestamp,
                sink: config.sink,
                mem_enabled: AtomicBool::new(config.mem_ring),
                active: AtomicBool::new(false),
                ring: Mutex::new(MemRing::new()),
            }),
        }
    }

    /// Handle without an external sink; records only land in the memory ring.
    #[must_use]
    pub fn memory_only(level: LogLevel) -> Self {
        Self::new(LoggerConfig::default().with_level(level))
    }

    #[must_use]
    pub fn level(&self) -> LogLevel {
        LogLevel::from_u8(self.inner.level.load(Ordering::Relaxed))
    }

    pub fn set_level(&self, level: LogLevel) {
        self.inner.level.store(level as u8, Ordering::Relaxed);
    }

    #[inline]
    #[must_use]
    pub fn enabled(&self, level: LogLevel) -> bool {
        level >= self.level()
    }

    pub fn enable_mem_ring(&self, enable: bool) {
        self.inner.mem_enabled.store(enable, Ordering::Relaxed);
    }

    pub fn log(&self, level: LogLevel, subsystem: &'static str, args: fmt::Arguments) {
        if !self.enabled(level) {
            return;
        }

        let mut line = LineBuf::new();
        let _ = write!(
            line,
            "[{:>10}][{}][{}] ",
            (self.inner.timestamp)(),
            level.as_str(),
            truncate(subsystem, LOG_SUBSYS_MAX)
        );
        let mut msg = MsgBuf::new();
        let _ = fmt::write(&mut msg, args);
        let _ = line.write_str(msg.as_str());
        let _ = line.write_str("\n");

        let nested = self
            .inner
            .active
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err();

        if self.inner.mem_enabled.load(Ordering::Relaxed) {
            if let Some(mut ring) = self.inner.ring.try_lock() {
                ring.push_bytes(line.as_bytes());
            }
        }

        if nested {
            return;
        }
        if let Some(sink) = self.inner.sink {
            sink(line.as_bytes());
        }
        self.inner.active.store(false, Ordering::Release);
    }

    /// Copy bytes from the in-memory ring buffer for diagnostics.
    #[must_use]
    pub fn copy_out(&self, out: &mut [u8]) -> usize {
        self.inner.ring.lock().copy_out(out)
    }

    /// Current ring contents as text, oldest first.
    #[must_use]
    pub fn snapshot(&self) -> String {
        let ring = self.inner.ring.lock();
        let mut bytes = alloc::vec![0u8; ring.len()];
        let n = ring.copy_out(&mut bytes);
        bytes.truncate(n);
        String::from_utf8_lossy(&bytes).into_owned()
    }

    pub fn clear(&self) {
        self.inner.ring.lock().clear();
    }
}

impl fmt::Debug for Logger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Logger").field("level", &self.level()).finish()
    }
}

// --------------------------------------------------------------------------
// In-memory ring
// --------------------------------------------------------------------------

struct MemRing {
    buf: [u8; MEM_RING_SIZE],
    head: usize,
    tail: usize,
    full: bool,
}

impl MemRing {
    const fn new() -> Self {
        Self {
            buf: [0; MEM_RING_SIZE],
            head: 0,
            tail: 0,
            full: false,
        }
    }

    fn len(&self) -> usize {
        if self.full {
            MEM_RING_SIZE
        } else if self.head >= self.tail {
            self.head - self.tail
        } else {
            MEM_RING_SIZE - self.tail + self.head
        }
    }

    fn push_bytes(&mut self, data: &[u8]) {
        for &b in data {
            self.buf[self.head] = b;
            self.head = (self.head + 1) % MEM_RING_SIZE;
            if self.full {
                self.tail = self.head;
            } else if self.head == self.tail {
                self.full = true;
            }
        }
    }

    fn copy_out(&self, out: &mut [u8]) -> usize {
        let count = core::cmp::min(out.len(), self.len());
        for (i, slot) in out.iter_mut().take(count).enumerate() {
            *slot = self.buf[(self.tail + i) % MEM_RING_SIZE];
        }
        count
    }

    fn clear(&mut self) {
        self.head = 0;
        self.tail = 0;
        self.full = false;
    }
}

// --------------------------------------------------------------------------
// Helpers
// --------------------------------------------------------------------------

fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// Fixed-capacity text buffer; input beyond the capacity is dropped on a
/// character boundary.
struct FixedBuf<const N: usize> {
    buf: [u8; N],
    len: usize,
}

impl<const N: usize> FixedBuf<N> {
    const fn new() -> Self {
        Self { buf: [0; N], len: 0 }
    }

    fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    fn as_str(&self) -> &str {
        core::str::from_utf8(self.as_bytes()).unwrap_or("")
    }
}

impl<const N: usize> fmt::Write for FixedBuf<N> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let room = N - self.len;
        let part = truncate(s, room);
        self.buf[self.len..self.len + part.len()].copy_from_slice(part.as_bytes());
        self.len += part.len();
        Ok(())
    }
}

type MsgBuf = FixedBuf<LOG_MSG_MAX>;
type LineBuf = FixedBuf<LINE_MAX>;

// --------------------------------------------------------------------------
// Macros
// --------------------------------------------------------------------------

#[macro_export]
macro_rules! klog_trace {
    ($logger:expr, $subsystem:expr, $($arg:tt)*) => {
        $crate::Logger::log(&$logger, $crate::LogLevel::Trace, $subsystem, core::format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! klog_debug {
    ($logger:expr, $subsystem:expr, $($arg:tt)*) => {
        $crate::Logger::log(&$logger, $crate::LogLevel::Debug, $subsystem, core::format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! klog_info {
    ($logger:expr, $subsystem:expr, $($arg:tt)*) => {
        $crate::Logger::log(&$logger, $crate::LogLevel::Info, $subsystem, core::format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! klog_warn {
    ($logger:expr, $subsystem:expr, $($arg:tt)*) => {
        $crate::Logger::log(&$logger, $crate::LogLevel::Warn, $subsystem, core::format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! klog_error {
    ($logger:expr, $subsystem:expr, $($arg:tt)*) => {
        $crate::Logger::log(&$logger, $crate::LogLevel::Error, $subsystem, core::format_args!($($arg)*))
    };
}
