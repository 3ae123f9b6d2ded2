//! Resource address parsing and building
//!
//! Supported forms (interface tag and resource class are case-insensitive,
//! an omitted board number means board 0):
//!
//! ```text
//! USB{n}::{vid}::{pid}[::{serial}[::{interface}]]::INSTR
//! ASRL{n}::INSTR
//! ASRL{device-path}::INSTR
//! TCPIP{n}::{host}::{port}::SOCKET
//! TCPIP{n}::{host}[::{lan-device-name}]::INSTR
//! SIM::{name}::INSTR
//! ```
//!
//! [`ResourceAddress::build`] is the exact inverse of [`ResourceAddress::parse`]:
//! `parse(build(addr)) == addr` for every address, and `build(parse(s))` is the
//! canonical spelling of `s` (upper-case tags, `0x`-prefixed upper-case hex ids,
//! explicit board numbers).

use std::fmt;
use std::str::FromStr;

use crate::error::{VisaError, VisaResult};

const SEPARATOR: &str = "::";

/// Physical interface named by the leading tag of a resource string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InterfaceKind {
    /// `USB`
    Usb,
    /// `ASRL`
    Serial,
    /// `TCPIP::SOCKET`
    TcpipSocket,
    /// `TCPIP::INSTR`
    TcpipInstr,
    /// `SIM`
    Simulated,
}

/// Serial number segment of a USB address, with the optional interface number
/// that may only follow it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UsbSerial {
    serial_number: String,
    interface_number: u8,
}

impl UsbSerial {
    /// # Errors
    /// [`VisaError::Validation`] for an empty serial number or one containing `::`.
    pub fn new(serial_number: impl Into<String>) -> VisaResult<Self> {
        let serial_number = serial_number.into();
        if serial_number.is_empty() || serial_number.contains(SEPARATOR) {
            return Err(VisaError::Validation(format!(
                "'{}' is not a usable USB serial number",
                serial_number
            )));
        }
        Ok(Self {
            serial_number,
            interface_number: 0,
        })
    }

    /// Claim `interface_number` instead of interface 0.
    pub fn with_interface(mut self, interface_number: u8) -> Self {
        self.interface_number = interface_number;
        self
    }

    /// iSerialNumber string of the device
    pub fn serial_number(&self) -> &str {
        &self.serial_number
    }

    /// USB-TMC interface to claim; written out only when non-zero
    pub fn interface_number(&self) -> u8 {
        self.interface_number
    }
}

/// OS device path of a serial port. Never empty and never all digits, so it
/// cannot be confused with the `ASRL{n}` index form.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DevicePath(String);

impl DevicePath {
    /// # Errors
    /// [`VisaError::Validation`] for an empty or purely numeric path, or one
    /// containing the `::` separator.
    pub fn new(path: impl Into<String>) -> VisaResult<Self> {
        let path = path.into();
        if path.is_empty() || path.bytes().all(|b| b.is_ascii_digit()) || path.contains(SEPARATOR) {
            return Err(VisaError::Validation(format!(
                "'{}' is not a serial device path",
                path
            )));
        }
        Ok(Self(path))
    }

    /// The path as given.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DevicePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// How an `ASRL` resource names its port.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SerialPort {
    /// `ASRL3`: the n-th port, resolved against discovery at open time
    Index(u16),
    /// `ASRL/dev/ttyUSB0`, `ASRLCOM4`
    Path(DevicePath),
}

/// A parsed VISA resource identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ResourceAddress {
    /// USB-TMC instrument.
    Usb {
        /// Board number after `USB`
        board: u16,
        /// idVendor
        vendor_id: u16,
        /// idProduct
        product_id: u16,
        /// Serial number and interface, when the resource names them
        serial: Option<UsbSerial>,
    },
    /// RS-232 port, addressed either by index or by OS device path.
    Serial {
        /// Index or path after `ASRL`
        port: SerialPort,
    },
    /// Raw TCP socket on an explicit port.
    TcpipSocket {
        /// Board number after `TCPIP`
        board: u16,
        /// Host name, IPv4 or IPv6 address
        host: String,
        /// TCP port
        port: u16,
    },
    /// LAN instrument; `lan_device_name` is `None` when the segment was omitted.
    TcpipInstr {
        /// Board number after `TCPIP`
        board: u16,
        /// Host name, IPv4 or IPv6 address
        host: String,
        /// `inst0`, `hislip0` and the like
        lan_device_name: Option<String>,
    },
    /// Hardware-free simulated device registered under `name`.
    Simulated {
        /// Name the device was registered under
        name: String,
    },
}

impl ResourceAddress {
    /// Parse a resource string.
    ///
    /// # Errors
    /// Returns [`VisaError::Parse`] when a required segment is missing or malformed.
    pub fn parse(resource: &str) -> VisaResult<Self> {
        let trimmed = resource.trim();
        if trimmed.is_empty() {
            return Err(VisaError::parse(resource, "empty resource string"));
        }

        let segments = split_segments(trimmed);
        if segments.len() < 2 || segments.iter().any(|s| s.is_empty()) {
            return Err(VisaError::parse(resource, "missing resource segments"));
        }

        let head = segments[0];
        let class = segments[segments.len() - 1].to_ascii_uppercase();
        let upper_head = head.to_ascii_uppercase();

        if upper_head == "SIM" {
            return parse_simulated(resource, &segments, &class);
        }
        if let Some(rest) = strip_tag(head, "TCPIP") {
            let board = parse_board(resource, rest)?;
            return parse_tcpip(resource, board, &segments, &class);
        }
        if let Some(rest) = strip_tag(head, "ASRL") {
            return parse_serial(resource, rest, &segments, &class);
        }
        if let Some(rest) = strip_tag(head, "USB") {
            let board = parse_board(resource, rest)?;
            return parse_usb(resource, board, &segments, &class);
        }

        Err(VisaError::parse(
            resource,
            format!("unknown interface type '{}'", head),
        ))
    }

    /// Build the canonical resource string for this address.
    pub fn build(&self) -> String {
        match self {
            ResourceAddress::Usb {
                board,
                vendor_id,
                product_id,
                serial,
            } => {
                let mut out = format!("USB{}::0x{:04X}::0x{:04X}", board, vendor_id, product_id);
                if let Some(serial) = serial {
                    out.push_str(SEPARATOR);
                    out.push_str(serial.serial_number());
                    if serial.interface_number() != 0 {
                        out.push_str(&format!("::{}", serial.interface_number()));
                    }
                }
                out.push_str("::INSTR");
                out
            }
            ResourceAddress::Serial { port } => match port {
                SerialPort::Index(index) => format!("ASRL{}::INSTR", index),
                SerialPort::Path(path) => format!("ASRL{}::INSTR", path),
            },
            ResourceAddress::TcpipSocket { board, host, port } => {
                format!("TCPIP{}::{}::{}::SOCKET", board, format_host(host), port)
            }
            ResourceAddress::TcpipInstr {
                board,
                host,
                lan_device_name,
            } => match lan_device_name {
                Some(device) => format!("TCPIP{}::{}::{}::INSTR", board, format_host(host), device),
                None => format!("TCPIP{}::{}::INSTR", board, format_host(host)),
            },
            ResourceAddress::Simulated { name } => format!("SIM::{}::INSTR", name),
        }
    }

    /// Canonical spelling of a resource string (`build(parse(s))`).
    pub fn normalize(resource: &str) -> VisaResult<String> {
        Ok(Self::parse(resource)?.build())
    }

    /// Interface kind of this address.
    pub fn kind(&self) -> InterfaceKind {
        match self {
            ResourceAddress::Usb { .. } => InterfaceKind::Usb,
            ResourceAddress::Serial { .. } => InterfaceKind::Serial,
            ResourceAddress::TcpipSocket { .. } => InterfaceKind::TcpipSocket,
            ResourceAddress::TcpipInstr { .. } => InterfaceKind::TcpipInstr,
            ResourceAddress::Simulated { .. } => InterfaceKind::Simulated,
        }
    }

    /// Board index. Serial ports report their `ASRL{n}` index; path-addressed
    /// serial and simulated resources report 0.
    pub fn board(&self) -> u16 {
        match self {
            ResourceAddress::Usb { board, .. }
            | ResourceAddress::TcpipSocket { board, .. }
            | ResourceAddress::TcpipInstr { board, .. } => *board,
            ResourceAddress::Serial {
                port: SerialPort::Index(index),
            } => *index,
            ResourceAddress::Serial {
                port: SerialPort::Path(_),
            }
            | ResourceAddress::Simulated { .. } => 0,
        }
    }
}

impl fmt::Display for ResourceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.build())
    }
}

impl FromStr for ResourceAddress {
    type Err = VisaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Split on `::`, keeping bracketed IPv6 hosts (`[fe80::1]`) in one segment.
fn split_segments(resource: &str) -> Vec<&str> {
    let bytes = resource.as_bytes();
    let mut segments = Vec::new();
    let mut start = 0;
    let mut depth = 0usize;
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            b'[' => depth += 1,
            b']' => depth = depth.saturating_sub(1),
            b':' if depth == 0 && bytes.get(i + 1) == Some(&b':') => {
                segments.push(resource[start..i].trim());
                i += 2;
                start = i;
                continue;
            }
            _ => {}
        }
        i += 1;
    }
    segments.push(resource[start..].trim());
    segments
}

/// Case-insensitive prefix strip of an interface tag.
fn strip_tag<'a>(head: &'a str, tag: &str) -> Option<&'a str> {
    if head.len() >= tag.len() && head.is_char_boundary(tag.len()) && head[..tag.len()].eq_ignore_ascii_case(tag) {
        Some(&head[tag.len()..])
    } else {
        None
    }
}

fn parse_board(resource: &str, digits: &str) -> VisaResult<u16> {
    if digits.is_empty() {
        return Ok(0);
    }
    if !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(VisaError::parse(
            resource,
            format!("invalid board number '{}'", digits),
        ));
    }
    digits
        .parse()
        .map_err(|_| VisaError::parse(resource, format!("board number '{}' out of range", digits)))
}

fn parse_hex_id(resource: &str, field: &str, text: &str) -> VisaResult<u16> {
    let digits = text
        .strip_prefix("0x")
        .or_else(|| text.strip_prefix("0X"))
        .unwrap_or(text);
    if digits.is_empty() {
        return Err(VisaError::parse(resource, format!("empty {}", field)));
    }
    u16::from_str_radix(digits, 16)
        .map_err(|_| VisaError::parse(resource, format!("invalid {} '{}'", field, text)))
}

fn expect_class(resource: &str, class: &str, expected: &str) -> VisaResult<()> {
    if class == expected {
        Ok(())
    } else {
        Err(VisaError::parse(
            resource,
            format!("expected resource class {}, found {}", expected, class),
        ))
    }
}

fn parse_usb(resource: &str, board: u16, segments: &[&str], class: &str) -> VisaResult<ResourceAddress> {
    expect_class(resource, class, "INSTR")?;
    if !(4..=6).contains(&segments.len()) {
        return Err(VisaError::parse(
            resource,
            "USB resources need vendor id, product id and optional serial number",
        ));
    }

    let vendor_id = parse_hex_id(resource, "vendor id", segments[1])?;
    let product_id = parse_hex_id(resource, "product id", segments[2])?;
    let serial = match segments.len() {
        5 | 6 => {
            let serial = UsbSerial::new(segments[3]).map_err(|e| VisaError::parse(resource, e.to_string()))?;
            let interface_number = match segments.get(4).filter(|_| segments.len() == 6) {
                Some(segment) => segment.parse::<u8>().map_err(|_| {
                    VisaError::parse(resource, format!("invalid interface number '{}'", segment))
                })?,
                None => 0,
            };
            Some(serial.with_interface(interface_number))
        }
        _ => None,
    };

    Ok(ResourceAddress::Usb {
        board,
        vendor_id,
        product_id,
        serial,
    })
}

fn parse_serial(resource: &str, rest: &str, segments: &[&str], class: &str) -> VisaResult<ResourceAddress> {
    expect_class(resource, class, "INSTR")?;
    if segments.len() != 2 {
        return Err(VisaError::parse(resource, "serial resources take no extra segments"));
    }
    if rest.is_empty() {
        return Err(VisaError::parse(resource, "missing serial port number or path"));
    }
    let port = if rest.bytes().all(|b| b.is_ascii_digit()) {
        SerialPort::Index(parse_board(resource, rest)?)
    } else {
        SerialPort::Path(DevicePath::new(rest).map_err(|e| VisaError::parse(resource, e.to_string()))?)
    };
    Ok(ResourceAddress::Serial { port })
}

fn parse_tcpip(resource: &str, board: u16, segments: &[&str], class: &str) -> VisaResult<ResourceAddress> {
    let host = segments
        .get(1)
        .filter(|_| segments.len() >= 3)
        .map(|h| h.trim_start_matches('[').trim_end_matches(']').to_string())
        .filter(|h| !h.is_empty())
        .ok_or_else(|| VisaError::parse(resource, "missing host"))?;

    match (class, segments.len()) {
        ("SOCKET", 4) => {
            let port = segments[2]
                .parse::<u16>()
                .map_err(|_| VisaError::parse(resource, format!("invalid port '{}'", segments[2])))?;
            Ok(ResourceAddress::TcpipSocket { board, host, port })
        }
        ("SOCKET", _) => Err(VisaError::parse(resource, "SOCKET resources need a port")),
        ("INSTR", 3) => Ok(ResourceAddress::TcpipInstr {
            board,
            host,
            lan_device_name: None,
        }),
        ("INSTR", 4) => Ok(ResourceAddress::TcpipInstr {
            board,
            host,
            lan_device_name: Some(segments[2].to_string()),
        }),
        ("INSTR", _) => Err(VisaError::parse(resource, "too many TCPIP segments")),
        (other, _) => Err(VisaError::parse(
            resource,
            format!("unknown resource class {}", other),
        )),
    }
}

fn parse_simulated(resource: &str, segments: &[&str], class: &str) -> VisaResult<ResourceAddress> {
    expect_class(resource, class, "INSTR")?;
    if segments.len() != 3 {
        return Err(VisaError::parse(resource, "simulated resources are SIM::{name}::INSTR"));
    }
    Ok(ResourceAddress::Simulated {
        name: segments[1].to_string(),
    })
}

fn format_host(host: &str) -> String {
    if host.contains(':') {
        format!("[{}]", host)
    } else {
        host.to_string()
    }
}
