//! Project: GuardBSD Winter Saga version 1.0.0
//! Package: ahci
//! Copyright © 2025 Cartesian School. Developed by Siergej Sobolewski.
//! License: BSD-3-Clause
//!
//! Driver configuration: command line and `key=value` files.

use alloc::string::String;
use alloc::vec::Vec;

use kernel_log::LogLevel;

use crate::errand::PollBudget;
use crate::error::{Error, Result};
use crate::hba::HbaConfig;
use crate::port::PortConfig;

pub const DEFAULT_LEVEL: LogLevel = LogLevel::Info;
pub const MAX_CLIENT_DS: u32 = 255;

/// A client connected as soon as its device shows up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaticClient {
    pub capability: String,
    /// Disk serial number or partition GUID.
    pub device: String,
    pub num_ds: u32,
}

impl StaticClient {
    /// `capability,device-id,max-dataspaces`
    pub fn parse(text: &str) -> Result<Self> {
        let mut parts = text.split(',');
        let (Some(capability), Some(device), Some(num_ds), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(Error::Invalid);
        };
        let (capability, device) = (capability.trim(), device.trim());
        if capability.is_empty() || device.is_empty() {
            return Err(Error::Invalid);
        }
        let num_ds: u32 = num_ds.trim().parse().map_err(|_| Error::Invalid)?;
        if !(1..=MAX_CLIENT_DS).contains(&num_ds) {
            return Err(Error::Invalid);
        }
        Ok(Self {
            capability: String::from(capability),
            device: String::from(device),
            num_ds,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub log_level: LogLevel,
    pub check_address_width: bool,
    pub verify_gpt_crc: bool,
    /// Register handshakes: engine start/stop, reset.
    pub handshake: PollBudget,
    /// Bring-up reads retried while the port has no free slot.
    pub io_poll: PollBudget,
    pub reset_settle_us: u64,
    /// Per-partition in-flight limit, zero for none.
    pub max_in_flight: u32,
    pub clients: Vec<StaticClient>,
}

impl Config {
    #[must_use]
    pub const fn default() -> Self {
        Self {
            log_level: DEFAULT_LEVEL,
            check_address_width: true,
            verify_gpt_crc: true,
            handshake: PollBudget::new(10, 50_000),
            io_poll: PollBudget::new(10, 10_000),
            reset_settle_us: 5_000,
            max_in_flight: 0,
            clients: Vec::new(),
        }
    }

    /// Parse command line arguments, program name excluded.
    pub fn from_args<I, S>(args: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut cfg = Self::default();
        for arg in args {
            match arg.as_ref() {
                "-v" | "--verbose" => cfg.log_level = cfg.log_level.more_verbose(),
                "-q" | "--quiet" => cfg.log_level = LogLevel::Error,
                "-A" | "--disable-address-check" => cfg.check_address_width = false,
                flag if flag.starts_with('-') => return Err(Error::Invalid),
                client => cfg.clients.push(StaticClient::parse(client)?),
            }
        }
        Ok(cfg)
    }

    /// Apply a whole configuration file.
    pub fn parse(&mut self, text: &str) -> Result<()> {
        text.lines().try_for_each(|line| self.parse_line(line))
    }

    /// Apply one `key=value` line. Blank lines and `#` comments are
    /// skipped, unknown keys ignored.
    pub fn parse_line(&mut self, line: &str) -> Result<()> {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return Ok(());
        }
        let (key, value) = line.split_once('=').ok_or(Error::Invalid)?;
        let value = value.trim();
        match key.trim() {
            "log_level" => self.log_level = LogLevel::parse(value).ok_or(Error::Invalid)?,
            "check_address_width" => self.check_address_width = parse_bool(value)?,
            "verify_gpt_crc" => self.verify_gpt_crc = parse_bool(value)?,
            "max_in_flight" => self.max_in_flight = value.parse().map_err(|_| Error::Invalid)?,
            "client" => self.clients.push(StaticClient::parse(value)?),
            _ => {}
        }
        Ok(())
    }

    #[must_use]
    pub fn port_config(&self) -> PortConfig {
        PortConfig {
            handshake: self.handshake,
            reset_settle_us: self.reset_settle_us,
        }
    }

    #[must_use]
    pub fn hba_config(&self) -> HbaConfig {
        HbaConfig {
            check_address_width: self.check_address_width,
            port: self.port_config(),
        }
    }
}

fn parse_bool(value: &str) -> Result<bool> {
    match value {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(Error::Invalid),
    }
}
