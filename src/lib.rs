//! Instrument communication stack for the rust_visa toolkit.
//!
//! This library addresses, opens and exchanges messages with laboratory
//! instruments over USB-TMC, RS-232 and TCP/IP using VISA resource strings
//! and SCPI conventions. It is used by the `rust_visa` command-line tool and
//! by applications that supervise long-lived instrument sessions.
//!
//! ```no_run
//! # async fn demo() -> rust_visa::error::VisaResult<()> {
//! use rust_visa::manager::ResourceManager;
//!
//! let manager = ResourceManager::default();
//! let scope = manager.open("TCPIP0::192.168.1.40::5025::SOCKET").await?;
//! let idn = scope.lock().await.query("*IDN?", None).await?;
//! # Ok(())
//! # }
//! ```

pub mod codec;
pub mod config;
pub mod discovery;
pub mod error;
pub mod logging;
pub mod manager;
pub mod resource;
pub mod session;
pub mod transport;

pub use error::{ConnectErrorKind, VisaError, VisaResult};
pub use manager::{ResourceManager, SharedTransport};
pub use resource::ResourceAddress;
pub use session::{DeviceSession, SessionManager, SessionState};
pub use transport::{ScpiTransportExt, Transport, TransportOptions, TransportState};
