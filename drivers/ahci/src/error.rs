//! Project: GuardBSD Winter Saga version 1.0.0
//! Package: ahci
//! Copyright © 2025 Cartesian School. Developed by Siergej Sobolewski.
//! License: BSD-3-Clause
//!
//! Error handling for the AHCI driver.

use core::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Malformed argument or request.
    Invalid,
    /// No free command slot or in-flight limit reached; retry later.
    Busy,
    /// The port exists but does not accept commands right now.
    NotReady,
    NoDevice,
    Io,
    /// Command was aborted by the port before it completed.
    Aborted,
    Exists,
    NoMemory,
    NoSys,
    /// Device scan still running; the name may appear later.
    Again,
    Permission,
    NotFound,
}

impl Error {
    #[must_use]
    pub const fn code(self) -> i64 {
        match self {
            Error::Permission => -1, // EPERM
            Error::NotFound => -2,   // ENOENT
            Error::Io | Error::Aborted => -5, // EIO
            Error::Again | Error::NotReady => -11, // EAGAIN
            Error::NoMemory => -12,  // ENOMEM
            Error::Busy => -16,      // EBUSY
            Error::Exists => -17,    // EEXIST
            Error::NoDevice => -19,  // ENODEV
            Error::Invalid => -22,   // EINVAL
            Error::NoSys => -38,     // ENOSYS
        }
    }

    #[must_use]
    pub const fn from_code(code: i64) -> Self {
        match code {
            -1 => Error::Permission,
            -2 => Error::NotFound,
            -5 => Error::Io,
            -11 => Error::Again,
            -12 => Error::NoMemory,
            -16 => Error::Busy,
            -17 => Error::Exists,
            -19 => Error::NoDevice,
            -38 => Error::NoSys,
            _ => Error::Invalid,
        }
    }

    /// Conditions a caller is expected to retry rather than report.
    #[must_use]
    pub const fn is_transient(self) -> bool {
        matches!(self, Error::Busy | Error::Again)
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Error::Invalid => "invalid argument",
            Error::Busy => "device busy",
            Error::NotReady => "port not ready",
            Error::NoDevice => "no such device",
            Error::Io => "I/O error",
            Error::Aborted => "command aborted",
            Error::Exists => "already exists",
            Error::NoMemory => "out of memory",
            Error::NoSys => "not supported by hardware",
            Error::Again => "try again",
            Error::Permission => "operation not permitted",
            Error::NotFound => "not found",
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub type Result<T> = core::result::Result<T, Error>;
