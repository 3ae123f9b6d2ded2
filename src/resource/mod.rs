//! VISA resource identifiers
//!
//! Parsing, building and glob matching of resource strings such as
//! `USB0::0x1AB1::0x04CE::DS1ZA123456789::INSTR` or `TCPIP0::10.0.0.5::5025::SOCKET`.

pub mod address;
pub mod pattern;

pub use address::{DevicePath, InterfaceKind, ResourceAddress, SerialPort, UsbSerial};
pub use pattern::{matches_pattern, DEFAULT_QUERY};
