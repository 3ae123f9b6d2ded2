//! Enumeration of attached serial ports and USB-TMC devices
//!
//! [`SystemDiscovery`] asks the OS (through `serialport` and `rusb`, each
//! behind its feature). [`StaticDiscovery`] holds a fixed inventory that can be
//! changed at runtime, which is what tests and simulated benches use.

use std::sync::{PoisonError, RwLock};

use crate::error::VisaResult;
use crate::resource::{DevicePath, ResourceAddress, SerialPort, UsbSerial};

/// A serial port the OS reports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerialPortInfo {
    /// OS device path (`/dev/ttyUSB0`, `COM3`, ...)
    pub path: String,
}

/// A USB device exposing a USB-TMC interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsbDeviceInfo {
    /// idVendor
    pub vendor_id: u16,
    /// idProduct
    pub product_id: u16,
    /// iSerialNumber, when it could be read
    pub serial_number: Option<String>,
    /// bInterfaceNumber of the USB-TMC interface
    pub interface_number: u8,
}

impl SerialPortInfo {
    /// `None` for a path that cannot be told apart from an `ASRL{n}` index.
    pub fn resource_address(&self) -> Option<ResourceAddress> {
        let path = DevicePath::new(self.path.as_str()).ok()?;
        Some(ResourceAddress::Serial {
            port: SerialPort::Path(path),
        })
    }
}

impl UsbDeviceInfo {
    /// The interface number only survives alongside a serial number; without
    /// one the transport claims the first USB-TMC interface it finds.
    pub fn resource_address(&self) -> ResourceAddress {
        ResourceAddress::Usb {
            board: 0,
            vendor_id: self.vendor_id,
            product_id: self.product_id,
            serial: self
                .serial_number
                .as_deref()
                .and_then(|serial| UsbSerial::new(serial).ok())
                .map(|serial| serial.with_interface(self.interface_number)),
        }
    }
}

/// Source of attached hardware.
pub trait Discovery: Send + Sync {
    /// Serial ports currently present.
    fn serial_ports(&self) -> VisaResult<Vec<SerialPortInfo>>;

    /// Attached devices exposing a USB-TMC interface.
    fn usb_devices(&self) -> VisaResult<Vec<UsbDeviceInfo>>;
}

/// Enumerates real hardware.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemDiscovery;

impl Discovery for SystemDiscovery {
    #[cfg(feature = "instrument_serial")]
    fn serial_ports(&self) -> VisaResult<Vec<SerialPortInfo>> {
        let ports = serialport::available_ports().map_err(std::io::Error::from)?;
        Ok(ports
            .into_iter()
            .map(|p| SerialPortInfo { path: p.port_name })
            .collect())
    }

    #[cfg(not(feature = "instrument_serial"))]
    fn serial_ports(&self) -> VisaResult<Vec<SerialPortInfo>> {
        Ok(Vec::new())
    }

    #[cfg(feature = "instrument_usb")]
    fn usb_devices(&self) -> VisaResult<Vec<UsbDeviceInfo>> {
        crate::transport::usbtmc::device::list_devices()
    }

    #[cfg(not(feature = "instrument_usb"))]
    fn usb_devices(&self) -> VisaResult<Vec<UsbDeviceInfo>> {
        Ok(Vec::new())
    }
}

/// In-memory inventory.
#[derive(Debug, Default)]
pub struct StaticDiscovery {
    serial: RwLock<Vec<SerialPortInfo>>,
    usb: RwLock<Vec<UsbDeviceInfo>>,
}

impl StaticDiscovery {
    /// Empty inventory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the reported serial ports.
    pub fn set_serial_ports(&self, ports: Vec<SerialPortInfo>) {
        *self.serial.write().unwrap_or_else(PoisonError::into_inner) = ports;
    }

    /// Replace the reported USB-TMC devices.
    pub fn set_usb_devices(&self, devices: Vec<UsbDeviceInfo>) {
        *self.usb.write().unwrap_or_else(PoisonError::into_inner) = devices;
    }
}

impl Discovery for StaticDiscovery {
    fn serial_ports(&self) -> VisaResult<Vec<SerialPortInfo>> {
        Ok(self.serial.read().unwrap_or_else(PoisonError::into_inner).clone())
    }

    fn usb_devices(&self) -> VisaResult<Vec<UsbDeviceInfo>> {
        Ok(self.usb.read().unwrap_or_else(PoisonError::into_inner).clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_usb_info_builds_resource() {
        let info = UsbDeviceInfo {
            vendor_id: 0x1AB1,
            product_id: 0x04CE,
            serial_number: Some("DS1ZA1".into()),
            interface_number: 0,
        };
        assert_eq!(info.resource_address().build(), "USB0::0x1AB1::0x04CE::DS1ZA1::INSTR");

        let second_interface = UsbDeviceInfo {
            interface_number: 2,
            ..info.clone()
        };
        assert_eq!(
            second_interface.resource_address().build(),
            "USB0::0x1AB1::0x04CE::DS1ZA1::2::INSTR"
        );

        let anonymous = UsbDeviceInfo {
            serial_number: None,
            ..second_interface
        };
        let resource = anonymous.resource_address().build();
        assert_eq!(resource, "USB0::0x1AB1::0x04CE::INSTR");
        assert_eq!(ResourceAddress::parse(&resource).unwrap(), anonymous.resource_address());
    }

    #[test]
    fn test_numeric_serial_path_is_not_listed() {
        let info = SerialPortInfo { path: "7".into() };
        assert_eq!(info.resource_address(), None);
    }

    #[test]
    fn test_static_inventory_updates() {
        let discovery = StaticDiscovery::new();
        assert!(discovery.serial_ports().unwrap().is_empty());
        discovery.set_serial_ports(vec![SerialPortInfo {
            path: "/dev/ttyUSB0".into(),
        }]);
        assert_eq!(discovery.serial_ports().unwrap().len(), 1);
        assert_eq!(
            discovery.serial_ports().unwrap()[0]
                .resource_address()
                .unwrap()
                .build(),
            "ASRL/dev/ttyUSB0::INSTR"
        );
    }
}
