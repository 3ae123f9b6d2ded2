//! RS-232 transport (`ASRL` resources)
//!
//! Requires the `instrument_serial` feature; without it `open()` reports
//! [`VisaError::FeatureNotEnabled`].

use async_trait::async_trait;
use tracing::{debug, info};

use super::stream::StreamChannel;
use super::{with_timeout, LinkCore, Transport};
use crate::config::{SerialSettings, TransportSettings};
use crate::discovery::SerialPortInfo;
use crate::error::{VisaError, VisaResult};
use crate::resource::{ResourceAddress, SerialPort};

/// Map an `ASRL{n}` board index to an OS device path.
///
/// Indices are 1-based positions in the discovered port list; beyond the list
/// the platform's conventional name is used.
pub fn resolve_port_name(board: u16, ports: &[SerialPortInfo]) -> String {
    let index = usize::from(board.max(1)) - 1;
    if let Some(port) = ports.get(index) {
        return port.path.clone();
    }
    if cfg!(windows) {
        format!("COM{}", board)
    } else {
        format!("/dev/ttyS{}", board.saturating_sub(1))
    }
}

/// RS-232 transport over `tokio-serial`.
pub struct SerialTransport {
    core: LinkCore,
    port_name: String,
    serial: SerialSettings,
    channel: StreamChannel,
}

impl SerialTransport {
    /// Create a closed transport for `port_name`, addressed as `resource`.
    pub fn new(
        resource: impl Into<String>,
        port_name: impl Into<String>,
        settings: TransportSettings,
        serial: SerialSettings,
    ) -> Self {
        Self {
            core: LinkCore::new(resource, settings, true),
            port_name: port_name.into(),
            serial,
            channel: StreamChannel::new(),
        }
    }

    /// Create a transport for a parsed `ASRL` address.
    ///
    /// # Errors
    /// [`VisaError::Validation`] if `address` is not a serial address.
    pub fn for_address(
        address: &ResourceAddress,
        ports: &[SerialPortInfo],
        settings: TransportSettings,
        serial: SerialSettings,
    ) -> VisaResult<Self> {
        let port_name = match address {
            ResourceAddress::Serial {
                port: SerialPort::Path(path),
            } => path.as_str().to_string(),
            ResourceAddress::Serial {
                port: SerialPort::Index(index),
            } => resolve_port_name(*index, ports),
            other => {
                return Err(VisaError::Validation(format!(
                    "{} is not a serial resource",
                    other
                )))
            }
        };
        Ok(Self::new(address.build(), port_name, settings, serial))
    }

    /// OS device name the port opens.
    pub fn port_name(&self) -> &str {
        &self.port_name
    }

    /// Line settings applied on open.
    pub fn serial_settings(&self) -> &SerialSettings {
        &self.serial
    }

    #[cfg(feature = "instrument_serial")]
    fn connect(&self) -> VisaResult<Box<dyn super::stream::ByteStream>> {
        use crate::config::{FlowControl, Parity};
        use crate::error::ConnectErrorKind;
        use tokio_serial::SerialPortBuilderExt;

        let data_bits = match self.serial.data_bits {
            5 => tokio_serial::DataBits::Five,
            6 => tokio_serial::DataBits::Six,
            7 => tokio_serial::DataBits::Seven,
            _ => tokio_serial::DataBits::Eight,
        };
        let stop_bits = match self.serial.stop_bits {
            2 => tokio_serial::StopBits::Two,
            _ => tokio_serial::StopBits::One,
        };
        let parity = match self.serial.parity {
            Parity::None => tokio_serial::Parity::None,
            Parity::Even => tokio_serial::Parity::Even,
            Parity::Odd => tokio_serial::Parity::Odd,
        };
        let flow_control = match self.serial.flow_control {
            FlowControl::None => tokio_serial::FlowControl::None,
            FlowControl::Software => tokio_serial::FlowControl::Software,
            FlowControl::Hardware => tokio_serial::FlowControl::Hardware,
        };

        let stream = tokio_serial::new(&self.port_name, self.serial.baud_rate)
            .data_bits(data_bits)
            .stop_bits(stop_bits)
            .parity(parity)
            .flow_control(flow_control)
            .timeout(self.core.timeout())
            .open_native_async()
            .map_err(|e| {
                debug!(port = %self.port_name, error = %e, "Serial open failed");
                let kind = match e.kind() {
                    tokio_serial::ErrorKind::NoDevice => ConnectErrorKind::NotFound,
                    tokio_serial::ErrorKind::Io(std::io::ErrorKind::NotFound) => {
                        ConnectErrorKind::NotFound
                    }
                    tokio_serial::ErrorKind::Io(std::io::ErrorKind::PermissionDenied) => {
                        ConnectErrorKind::Busy
                    }
                    _ => ConnectErrorKind::Refused,
                };
                VisaError::connect(self.core.resource(), kind)
            })?;
        Ok(Box::new(stream))
    }

    #[cfg(not(feature = "instrument_serial"))]
    fn connect(&self) -> VisaResult<Box<dyn super::stream::ByteStream>> {
        Err(VisaError::FeatureNotEnabled("instrument_serial".into()))
    }
}

#[async_trait]
impl Transport for SerialTransport {
    fn core(&self) -> &LinkCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut LinkCore {
        &mut self.core
    }

    async fn open(&mut self) -> VisaResult<()> {
        self.core.begin_open()?;
        let result = self.connect();
        let stream = self.core.finish_open(result)?;
        self.channel.attach(stream);
        info!(
            resource = %self.core.resource(),
            port = %self.port_name,
            baud = self.serial.baud_rate,
            "Serial transport opened"
        );
        Ok(())
    }

    async fn close(&mut self) -> VisaResult<()> {
        self.core.begin_close();
        self.channel.shutdown().await;
        self.core.finish_close();
        debug!(resource = %self.core.resource(), "Serial transport closed");
        Ok(())
    }

    async fn write_raw(&mut self, data: &[u8]) -> VisaResult<usize> {
        self.core.ensure_open()?;
        let result = with_timeout(self.core.timeout(), self.channel.write_all(data)).await;
        self.core.record(result)
    }

    async fn read_raw(&mut self, max_size: Option<usize>) -> VisaResult<Vec<u8>> {
        self.core.ensure_open()?;
        let result = with_timeout(self.core.timeout(), self.channel.read_some(max_size)).await;
        self.core.record(result)
    }

    async fn read_bytes(&mut self, count: usize) -> VisaResult<Vec<u8>> {
        self.core.ensure_open()?;
        let result = with_timeout(self.core.timeout(), self.channel.read_exact(count)).await;
        self.core.record(result)
    }

    async fn read_until(&mut self, terminator: &[u8]) -> VisaResult<Vec<u8>> {
        self.core.ensure_open()?;
        let result = with_timeout(self.core.timeout(), self.channel.read_until(terminator)).await;
        self.core.record(result)
    }

    /// Discard the OS input and output buffers and any pending bytes.
    async fn clear(&mut self) -> VisaResult<()> {
        self.core.ensure_open()?;
        let result = self.channel.discard();
        self.core.record(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::testing::assert_io_refused;
    use crate::transport::TransportState;
    use std::time::Duration;
    use tokio::io::{duplex, AsyncWriteExt};

    /// A transport already open over an in-memory pipe.
    fn piped(settings: TransportSettings) -> (SerialTransport, tokio::io::DuplexStream) {
        let (local, remote) = duplex(1024);
        let mut transport =
            SerialTransport::new("ASRL1::INSTR", "/dev/null", settings, SerialSettings::default());
        transport.core.begin_open().unwrap();
        transport.core.finish_open(Ok(())).unwrap();
        transport.channel.attach(Box::new(local));
        (transport, remote)
    }

    #[test]
    fn test_resolve_port_name() {
        let ports = vec![
            SerialPortInfo {
                path: "/dev/ttyUSB0".into(),
            },
            SerialPortInfo {
                path: "/dev/ttyUSB1".into(),
            },
        ];
        assert_eq!(resolve_port_name(1, &ports), "/dev/ttyUSB0");
        assert_eq!(resolve_port_name(2, &ports), "/dev/ttyUSB1");
        if cfg!(windows) {
            assert_eq!(resolve_port_name(3, &ports), "COM3");
        } else {
            assert_eq!(resolve_port_name(3, &ports), "/dev/ttyS2");
        }
    }

    #[test]
    fn test_for_address_with_path() {
        let address = ResourceAddress::parse("ASRL/dev/ttyACM0::INSTR").unwrap();
        let transport = SerialTransport::for_address(
            &address,
            &[],
            TransportSettings::default(),
            SerialSettings::default(),
        )
        .unwrap();
        assert_eq!(transport.port_name(), "/dev/ttyACM0");
    }

    #[tokio::test]
    async fn test_query_round_trip() {
        let (mut transport, mut remote) = piped(TransportSettings::default());
        remote.write_all(b"1.000E+00\n").await.unwrap();
        let reply = transport.query("MEAS:VOLT?", None).await.unwrap();
        assert_eq!(reply, "1.000E+00");

        use tokio::io::AsyncReadExt;
        let mut sent = [0u8; 11];
        remote.read_exact(&mut sent).await.unwrap();
        assert_eq!(&sent, b"MEAS:VOLT?\n");
    }

    #[tokio::test]
    async fn test_repeated_timeouts_enter_error() {
        let settings = TransportSettings {
            timeout: Duration::from_millis(10),
            max_consecutive_timeouts: 2,
            ..TransportSettings::default()
        };
        let (mut transport, _remote) = piped(settings);

        assert!(transport.read().await.unwrap_err().is_timeout());
        assert_eq!(transport.state(), TransportState::Open);
        assert!(transport.read().await.unwrap_err().is_timeout());
        assert_eq!(transport.state(), TransportState::Error);
        assert!(matches!(transport.read().await, Err(VisaError::NotOpen)));

        transport.close().await.unwrap();
        assert_eq!(transport.state(), TransportState::Closed);
    }

    #[tokio::test]
    async fn test_clear_drops_partial_response() {
        let (mut transport, mut remote) = piped(TransportSettings::default());
        remote.write_all(b"stale\npartial").await.unwrap();
        assert_eq!(transport.read().await.unwrap(), "stale");
        transport.clear().await.unwrap();
        remote.write_all(b"fresh\n").await.unwrap();
        assert_eq!(transport.read().await.unwrap(), "fresh");
    }

    #[tokio::test]
    async fn test_io_refused_unless_open() {
        let mut closed =
            SerialTransport::new("ASRL1::INSTR", "/dev/null", TransportSettings::default(), SerialSettings::default());
        assert_io_refused(&mut closed).await;

        let (mut transport, remote) = piped(TransportSettings::default());
        drop(remote);
        assert!(matches!(transport.write("*RST").await, Err(VisaError::Io(_))));
        assert_eq!(transport.state(), TransportState::Error);
        assert_io_refused(&mut transport).await;

        transport.close().await.unwrap();
        assert_io_refused(&mut transport).await;
    }
}
