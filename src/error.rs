//! Custom error types for the instrument communication stack.
//!
//! This module defines the primary error type, `VisaError`, for the whole crate.
//! Using the `thiserror` crate, it provides a centralized and consistent way to handle
//! everything that can go wrong between a caller and an instrument, from a malformed
//! resource string to a USB-TMC header the device should never have sent.
//!
//! ## Error Hierarchy
//!
//! - **`Parse`**: The resource string does not follow the VISA grammar.
//! - **`Connect`**: Opening a resource failed. The [`ConnectErrorKind`] tells callers
//!   whether the device was missing, busy, refused the connection or was already open.
//! - **`NotOpen`**: An I/O primitive was called on a transport that is not in the
//!   `Open` state.
//! - **`Timeout`**: A blocking operation did not complete within its window. The
//!   transport is normally still usable afterwards.
//! - **`Io`**: Wraps `std::io::Error` for faults of the underlying link. A transport
//!   that reports `Io` has moved to its `Error` state and must be closed and reopened.
//! - **`Protocol`**: Malformed USB-TMC headers, binary blocks or status replies.
//! - **`Validation`**: A value was rejected before anything was sent.
//! - **`FeatureNotEnabled`**: The medium needed for a resource was compiled out.
//!
//! By using `#[from]`, `VisaError` can be created from `std::io::Error` and
//! `figment::Error` with the `?` operator.

use std::fmt;

use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type VisaResult<T> = std::result::Result<T, VisaError>;

/// Reason an open request failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectErrorKind {
    /// No device answers to the resource string.
    NotFound,
    /// The physical resource is held by someone else.
    Busy,
    /// The device or the OS actively rejected the connection.
    Refused,
    /// The transport is not in the `Closed` state.
    AlreadyOpen,
    /// The connection attempt did not finish within the transport timeout.
    Timeout,
}

impl fmt::Display for ConnectErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ConnectErrorKind::NotFound => "not found",
            ConnectErrorKind::Busy => "busy",
            ConnectErrorKind::Refused => "refused",
            ConnectErrorKind::AlreadyOpen => "already open",
            ConnectErrorKind::Timeout => "timed out",
        };
        f.write_str(text)
    }
}

/// Errors produced anywhere in the stack.
#[derive(Error, Debug)]
pub enum VisaError {
    /// A resource string could not be parsed.
    #[error("Malformed resource string '{resource}': {reason}")]
    Parse {
        /// The string as given
        resource: String,
        /// What is wrong with it
        reason: String,
    },

    /// A transport could not be opened.
    #[error("Cannot open {resource}: {kind}")]
    Connect {
        /// Canonical resource string
        resource: String,
        /// Why the open failed
        kind: ConnectErrorKind,
    },

    /// An I/O operation was attempted while the transport was not `Open`.
    #[error("Transport is not open")]
    NotOpen,

    /// No complete response arrived within the configured timeout.
    #[error("Operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// Link fault reported by the OS; the transport enters `Error`.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The instrument sent something the framing or codec rejects.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Invalid setting or argument.
    #[error("Validation error: {0}")]
    Validation(String),

    /// The medium needs a cargo feature this build lacks.
    #[error("Feature '{0}' is not enabled. Please build with --features {0}")]
    FeatureNotEnabled(String),

    /// Configuration could not be loaded.
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// The session was closed while work was queued or requested.
    #[error("Session for {0} has been closed")]
    SessionClosed(String),
}

impl VisaError {
    pub(crate) fn parse(resource: &str, reason: impl Into<String>) -> Self {
        VisaError::Parse {
            resource: resource.to_string(),
            reason: reason.into(),
        }
    }

    pub(crate) fn connect(resource: &str, kind: ConnectErrorKind) -> Self {
        VisaError::Connect {
            resource: resource.to_string(),
            kind,
        }
    }

    /// True when the failure left the resource in the `Error` state.
    ///
    /// Callers seeing `true` must `close()` and `open()` the transport again;
    /// everything else leaves the resource usable.
    pub fn requires_reopen(&self) -> bool {
        matches!(self, VisaError::Io(_) | VisaError::SessionClosed(_))
    }

    /// True for operation timeouts and connection attempts that timed out.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            VisaError::Timeout(_)
                | VisaError::Connect {
                    kind: ConnectErrorKind::Timeout,
                    ..
                }
        )
    }

    /// Returns the connect failure kind, if this is a connect error.
    pub fn connect_kind(&self) -> Option<ConnectErrorKind> {
        match self {
            VisaError::Connect { kind, .. } => Some(*kind),
            _ => None,
        }
    }
}

impl From<figment::Error> for VisaError {
    fn from(err: figment::Error) -> Self {
        VisaError::Config(Box::new(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_error_display() {
        let err = VisaError::connect("ASRL3::INSTR", ConnectErrorKind::Busy);
        assert_eq!(err.to_string(), "Cannot open ASRL3::INSTR: busy");
    }

    #[test]
    fn test_reopen_classification() {
        let io = VisaError::from(std::io::Error::new(
            std::io::ErrorKind::BrokenPipe,
            "pipe closed",
        ));
        assert!(io.requires_reopen());
        assert!(!VisaError::Timeout(Duration::from_millis(10)).requires_reopen());
        assert!(!VisaError::NotOpen.requires_reopen());
    }

    #[test]
    fn test_timeout_classification() {
        assert!(VisaError::Timeout(Duration::from_secs(1)).is_timeout());
        assert!(VisaError::connect("TCPIP0::h::5025::SOCKET", ConnectErrorKind::Timeout).is_timeout());
        assert!(!VisaError::Protocol("bad tag".into()).is_timeout());
    }
}
