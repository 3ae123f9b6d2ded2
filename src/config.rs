//! Configuration system using Figment
//!
//! Settings are loaded from:
//! 1. `config/rust_visa.toml` (or an explicit path)
//! 2. Environment variables prefixed with `RUSTVISA_`, using `__` between
//!    section and key
//!
//! Every key has a default, so an empty or missing file yields a usable
//! configuration.
//!
//! ```text
//! RUSTVISA_LOGGING__LEVEL=debug
//! RUSTVISA_TRANSPORT__TIMEOUT=500ms
//! RUSTVISA_SESSION__MAX_CONSECUTIVE_ERRORS=5
//! ```
//!
//! # Example
//!
//! ```toml
//! [transport]
//! timeout = "2s"
//! read_termination = "\n"
//! chunk_size = 1048576
//!
//! [serial]
//! baud_rate = 115200
//! parity = "none"
//!
//! [session]
//! discovery_interval = "5s"
//! filter = ["USB?*::INSTR", "ASRL?*::INSTR"]
//! ```

use std::path::Path;
use std::time::Duration;

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::{VisaError, VisaResult};

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "config/rust_visa.toml";

/// Top-level settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Log output settings
    pub logging: LoggingSettings,
    /// Defaults applied to every transport
    pub transport: TransportSettings,
    /// RS-232 line settings
    pub serial: SerialSettings,
    /// Session supervision settings
    pub session: SessionSettings,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Logging level (trace, debug, info, warn, error)
    pub level: String,
    /// Emit JSON lines instead of human-readable output
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

/// Per-transport I/O settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportSettings {
    /// Bound for every blocking operation
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// Terminator that ends a response
    pub read_termination: String,
    /// Terminator appended to every command
    pub write_termination: String,
    /// Fixed delay between the write and the read of a query
    #[serde(with = "humantime_serde")]
    pub query_delay: Option<Duration>,
    /// USB-TMC bulk-in request size
    pub chunk_size: usize,
    /// Consecutive timeouts after which USB/serial links enter `Error` (0 = never)
    pub max_consecutive_timeouts: u32,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(2),
            read_termination: "\n".to_string(),
            write_termination: "\n".to_string(),
            query_delay: None,
            chunk_size: 1024 * 1024,
            max_consecutive_timeouts: 3,
        }
    }
}

/// Parity modes for serial communication
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    /// No parity bit
    #[default]
    None,
    /// Even parity
    Even,
    /// Odd parity
    Odd,
}

/// Flow control modes for serial communication
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlowControl {
    /// No flow control
    #[default]
    None,
    /// XON/XOFF
    Software,
    /// RTS/CTS
    Hardware,
}

/// Configuration for a serial port connection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialSettings {
    /// Baud rate (9600, 115200, etc.)
    pub baud_rate: u32,
    /// Data bits (5 to 8)
    pub data_bits: u8,
    /// Stop bits (1 or 2)
    pub stop_bits: u8,
    /// Parity setting
    pub parity: Parity,
    /// Flow control setting
    pub flow_control: FlowControl,
}

impl Default for SerialSettings {
    fn default() -> Self {
        Self {
            baud_rate: 9600,
            data_bits: 8,
            stop_bits: 1,
            parity: Parity::None,
            flow_control: FlowControl::None,
        }
    }
}

/// Session supervision settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    /// Interval between discovery scans
    #[serde(with = "humantime_serde")]
    pub discovery_interval: Duration,
    /// Failures in a row before a session enters `error`
    pub max_consecutive_errors: u32,
    /// Reopen failed or vanished sessions on the next scan
    pub auto_reconnect: bool,
    /// Default bound for `execute`, including any wait for a reconnect
    #[serde(with = "humantime_serde")]
    pub execute_timeout: Duration,
    /// Resource patterns to supervise (first match wins; empty accepts all)
    pub filter: Option<Vec<String>>,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            discovery_interval: Duration::from_secs(5),
            max_consecutive_errors: 3,
            auto_reconnect: true,
            execute_timeout: Duration::from_secs(5),
            filter: None,
        }
    }
}

impl Settings {
    /// Load from [`DEFAULT_CONFIG_PATH`] and the environment.
    ///
    /// # Errors
    /// Returns [`VisaError::Config`] if the sources cannot be merged and
    /// [`VisaError::Validation`] if the result is inconsistent.
    pub fn load() -> VisaResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load from a specific file path and the environment.
    ///
    /// A missing file is not an error; defaults apply.
    pub fn load_from<P: AsRef<Path>>(path: P) -> VisaResult<Self> {
        Self::extract(Figment::new().merge(Toml::file(path.as_ref())))
    }

    /// Load from a TOML string and the environment.
    pub fn from_toml_str(toml: &str) -> VisaResult<Self> {
        Self::extract(Figment::new().merge(Toml::string(toml)))
    }

    fn extract(figment: Figment) -> VisaResult<Self> {
        let settings: Self = figment
            .merge(Env::prefixed("RUSTVISA_").split("__"))
            .extract()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Validate configuration after loading
    ///
    /// # Errors
    /// [`VisaError::Validation`] describing the first offending value.
    pub fn validate(&self) -> VisaResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.to_ascii_lowercase().as_str()) {
            return Err(VisaError::Validation(format!(
                "Invalid logging level '{}'. Must be one of: {}",
                self.logging.level,
                valid_levels.join(", ")
            )));
        }

        self.transport.validate()?;
        self.serial.validate()?;

        if self.session.max_consecutive_errors == 0 {
            return Err(VisaError::Validation(
                "session.max_consecutive_errors must be > 0".into(),
            ));
        }
        if self.session.discovery_interval.is_zero() || self.session.execute_timeout.is_zero() {
            return Err(VisaError::Validation(
                "session intervals and timeouts must be non-zero".into(),
            ));
        }

        Ok(())
    }
}

impl TransportSettings {
    /// Reject settings no transport can honor.
    pub fn validate(&self) -> VisaResult<()> {
        if self.timeout.is_zero() {
            return Err(VisaError::Validation("transport.timeout must be non-zero".into()));
        }
        if self.read_termination.is_empty() {
            return Err(VisaError::Validation(
                "transport.read_termination cannot be empty".into(),
            ));
        }
        if self.chunk_size <= crate::transport::usbtmc::header::HEADER_SIZE {
            return Err(VisaError::Validation(format!(
                "transport.chunk_size {} must exceed the {}-byte USB-TMC header",
                self.chunk_size,
                crate::transport::usbtmc::header::HEADER_SIZE
            )));
        }
        Ok(())
    }
}

impl SerialSettings {
    /// Reject line settings no UART supports.
    pub fn validate(&self) -> VisaResult<()> {
        if !(5..=8).contains(&self.data_bits) {
            return Err(VisaError::Validation(format!(
                "serial.data_bits {} must be 5-8",
                self.data_bits
            )));
        }
        if !(1..=2).contains(&self.stop_bits) {
            return Err(VisaError::Validation(format!(
                "serial.stop_bits {} must be 1 or 2",
                self.stop_bits
            )));
        }
        if self.baud_rate == 0 {
            return Err(VisaError::Validation("serial.baud_rate must be > 0".into()));
        }
        Ok(())
    }
}
