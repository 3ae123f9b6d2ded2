//! libusb-backed [`TmcDevice`] via `rusb`
//!
//! The kernel `usbtmc` driver is detached automatically where the platform
//! supports it. On Windows the interface must be bound to WinUSB (for example
//! with Zadig) before it can be claimed.

use std::io;
use std::time::Duration;

use rusb::{Context, Device, DeviceDescriptor, DeviceHandle, Direction, TransferType, UsbContext};

use super::header::{REQUEST_TYPE_IN, USBTMC_CLASS, USBTMC_SUBCLASS};
use super::{TmcConnector, TmcDevice, UsbSelector};
use crate::discovery::UsbDeviceInfo;
use crate::error::{ConnectErrorKind, VisaError, VisaResult};

const DESCRIPTOR_TIMEOUT: Duration = Duration::from_millis(500);

/// Endpoints of a USB-TMC interface.
#[derive(Debug, Clone, Copy)]
struct TmcInterface {
    number: u8,
    bulk_in: u8,
    bulk_out: u8,
    max_packet_size: usize,
}

fn transfer_error(err: rusb::Error, timeout: Duration) -> VisaError {
    match err {
        rusb::Error::Timeout => VisaError::Timeout(timeout),
        rusb::Error::NoDevice => VisaError::Io(io::Error::new(io::ErrorKind::NotConnected, err)),
        rusb::Error::Pipe => VisaError::Io(io::Error::new(io::ErrorKind::BrokenPipe, err)),
        other => VisaError::Io(io::Error::new(io::ErrorKind::Other, other)),
    }
}

fn open_error(resource: &str, err: rusb::Error) -> VisaError {
    let kind = match err {
        rusb::Error::NoDevice | rusb::Error::NotFound => ConnectErrorKind::NotFound,
        rusb::Error::Busy | rusb::Error::Access => ConnectErrorKind::Busy,
        rusb::Error::Timeout => ConnectErrorKind::Timeout,
        _ => ConnectErrorKind::Refused,
    };
    log::debug!("Opening {} failed: {}", resource, err);
    VisaError::connect(resource, kind)
}

/// Find the first USB-TMC interface of the active configuration.
fn find_tmc_interface<T: UsbContext>(device: &Device<T>) -> Option<TmcInterface> {
    let config = device
        .active_config_descriptor()
        .or_else(|_| device.config_descriptor(0))
        .ok()?;

    for interface in config.interfaces() {
        for descriptor in interface.descriptors() {
            if descriptor.class_code() != USBTMC_CLASS || descriptor.sub_class_code() != USBTMC_SUBCLASS {
                continue;
            }
            let mut bulk_in = None;
            let mut bulk_out = None;
            let mut max_packet_size = 512;
            for endpoint in descriptor.endpoint_descriptors() {
                if endpoint.transfer_type() != TransferType::Bulk {
                    continue;
                }
                match endpoint.direction() {
                    Direction::In => {
                        bulk_in = Some(endpoint.address());
                        max_packet_size = usize::from(endpoint.max_packet_size());
                    }
                    Direction::Out => bulk_out = Some(endpoint.address()),
                }
            }
            if let (Some(bulk_in), Some(bulk_out)) = (bulk_in, bulk_out) {
                return Some(TmcInterface {
                    number: descriptor.interface_number(),
                    bulk_in,
                    bulk_out,
                    max_packet_size,
                });
            }
        }
    }
    None
}

fn read_serial<T: UsbContext>(handle: &DeviceHandle<T>, descriptor: &DeviceDescriptor) -> Option<String> {
    descriptor.serial_number_string_index()?;
    let language = handle.read_languages(DESCRIPTOR_TIMEOUT).ok()?.into_iter().next()?;
    handle
        .read_serial_number_string(language, descriptor, DESCRIPTOR_TIMEOUT)
        .ok()
}

/// List every attached device exposing a USB-TMC interface.
pub fn list_devices() -> VisaResult<Vec<UsbDeviceInfo>> {
    let context = Context::new().map_err(|e| transfer_error(e, DESCRIPTOR_TIMEOUT))?;
    let devices = context
        .devices()
        .map_err(|e| transfer_error(e, DESCRIPTOR_TIMEOUT))?;

    let mut found = Vec::new();
    for device in devices.iter() {
        let Ok(descriptor) = device.device_descriptor() else {
            continue;
        };
        let Some(interface) = find_tmc_interface(&device) else {
            continue;
        };
        // Reading the serial needs the device opened; devices held elsewhere are listed without it.
        let serial_number = device
            .open()
            .ok()
            .and_then(|handle| read_serial(&handle, &descriptor));
        log::debug!(
            "Found USB-TMC device {:04x}:{:04x} interface {} serial {:?}",
            descriptor.vendor_id(),
            descriptor.product_id(),
            interface.number,
            serial_number
        );
        found.push(UsbDeviceInfo {
            vendor_id: descriptor.vendor_id(),
            product_id: descriptor.product_id(),
            serial_number,
            interface_number: interface.number,
        });
    }
    Ok(found)
}

/// Opens devices through a libusb context.
pub struct RusbConnector;

impl RusbConnector {
    /// Connector backed by a fresh `rusb` context.
    pub fn new() -> Self {
        RusbConnector
    }
}

impl Default for RusbConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl TmcConnector for RusbConnector {
    fn connect(&self, selector: &UsbSelector, _timeout: Duration) -> VisaResult<Box<dyn TmcDevice>> {
        let resource = format!(
            "USB::{:#06X}::{:#06X}::{}",
            selector.vendor_id,
            selector.product_id,
            selector.serial_number.as_deref().unwrap_or("*")
        );
        let context = Context::new().map_err(|e| open_error(&resource, e))?;
        let devices = context.devices().map_err(|e| open_error(&resource, e))?;

        for device in devices.iter() {
            let Ok(descriptor) = device.device_descriptor() else {
                continue;
            };
            if descriptor.vendor_id() != selector.vendor_id || descriptor.product_id() != selector.product_id {
                continue;
            }
            let Some(interface) = find_tmc_interface(&device) else {
                continue;
            };
            if selector.interface_number != 0 && interface.number != selector.interface_number {
                continue;
            }

            let mut handle = device.open().map_err(|e| open_error(&resource, e))?;
            if let Some(wanted) = &selector.serial_number {
                if read_serial(&handle, &descriptor).as_deref() != Some(wanted.as_str()) {
                    continue;
                }
            }

            // Not supported on every platform; claiming reports the real failure.
            let _ = handle.set_auto_detach_kernel_driver(true);
            handle
                .claim_interface(interface.number)
                .map_err(|e| open_error(&resource, e))?;
            log::debug!("Claimed USB-TMC interface {} of {}", interface.number, resource);

            return Ok(Box::new(RusbDevice { handle, interface }));
        }

        Err(VisaError::connect(&resource, ConnectErrorKind::NotFound))
    }
}

/// A claimed USB-TMC interface.
pub struct RusbDevice {
    handle: DeviceHandle<Context>,
    interface: TmcInterface,
}

impl TmcDevice for RusbDevice {
    fn write_bulk(&mut self, data: &[u8], timeout: Duration) -> VisaResult<usize> {
        self.handle
            .write_bulk(self.interface.bulk_out, data, timeout)
            .map_err(|e| transfer_error(e, timeout))
    }

    fn read_bulk(&mut self, buf: &mut [u8], timeout: Duration) -> VisaResult<usize> {
        self.handle
            .read_bulk(self.interface.bulk_in, buf, timeout)
            .map_err(|e| transfer_error(e, timeout))
    }

    fn control_in(
        &mut self,
        request: u8,
        value: u16,
        buf: &mut [u8],
        timeout: Duration,
    ) -> VisaResult<usize> {
        self.handle
            .read_control(
                REQUEST_TYPE_IN,
                request,
                value,
                u16::from(self.interface.number),
                buf,
                timeout,
            )
            .map_err(|e| transfer_error(e, timeout))
    }

    fn clear_halt(&mut self) -> VisaResult<()> {
        self.handle
            .clear_halt(self.interface.bulk_out)
            .map_err(|e| transfer_error(e, DESCRIPTOR_TIMEOUT))
    }

    fn max_packet_size(&self) -> usize {
        self.interface.max_packet_size
    }

    fn release(&mut self) {
        if let Err(e) = self.handle.release_interface(self.interface.number) {
            log::warn!("Releasing USB interface {} failed: {}", self.interface.number, e);
        }
    }
}
