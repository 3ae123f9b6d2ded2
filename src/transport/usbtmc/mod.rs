//! USB-TMC / USB488 transport (`USB::INSTR` resources)
//!
//! Framing is done against the [`TmcDevice`] trait, a synchronous bulk and
//! control pipe pair. The libusb-backed implementation lives in [`device`]
//! behind the `instrument_usb` feature; tests drive the framing through an
//! in-memory device instead.
//!
//! Blocking USB calls run on the blocking thread pool with the link guarded
//! by a `tokio::sync::Mutex`, the same way the serial adapter hands its port
//! to `spawn_blocking`.
//!
//! ## Message flow
//!
//! - write: one `DEV_DEP_MSG_OUT` transfer per chunk, EOM on the last
//! - read: `REQUEST_DEV_DEP_MSG_IN` then a `DEV_DEP_MSG_IN` reply, repeated
//!   until the device sets EOM
//! - trigger: a header-only `TRIGGER` message
//! - status byte: `READ_STATUS_BYTE` control request
//! - clear: `INITIATE_CLEAR`, poll `CHECK_CLEAR_STATUS`, clear endpoint halt

pub mod header;

#[cfg(feature = "instrument_usb")]
pub mod device;

use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::BytesMut;
use tokio::sync::Mutex;
use tracing::{debug, info, trace, warn};

use self::header::{
    encode_bulk_out_header, encode_dev_dep_msg_out, msg_id, request, status, BulkInHeader,
    TagGenerator, HEADER_SIZE,
};
use super::quirks::{QuirkPolicy, QuirkProfile};
use super::{find_subsequence, LinkCore, Transport};
use crate::config::TransportSettings;
use crate::error::{VisaError, VisaResult};
use crate::resource::{ResourceAddress, UsbSerial};

const CLEAR_POLL_INTERVAL: Duration = Duration::from_millis(10);
const CAPABILITIES_LENGTH: usize = 0x18;

/// Synchronous access to one claimed USB-TMC interface.
pub trait TmcDevice: Send {
    /// Write one bulk-out transfer.
    fn write_bulk(&mut self, data: &[u8], timeout: Duration) -> VisaResult<usize>;

    /// Read one bulk-in transfer into `buf`.
    fn read_bulk(&mut self, buf: &mut [u8], timeout: Duration) -> VisaResult<usize>;

    /// Class request to the interface, device-to-host.
    fn control_in(
        &mut self,
        request: u8,
        value: u16,
        buf: &mut [u8],
        timeout: Duration,
    ) -> VisaResult<usize>;

    /// Clear a halt condition on the bulk endpoints.
    fn clear_halt(&mut self) -> VisaResult<()>;

    /// wMaxPacketSize of the bulk-in endpoint.
    fn max_packet_size(&self) -> usize {
        512
    }

    /// Release the interface. Called once on close.
    fn release(&mut self) {}
}

/// Identifies the USB device and interface to claim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsbSelector {
    /// idVendor
    pub vendor_id: u16,
    /// idProduct
    pub product_id: u16,
    /// Required iSerialNumber; any device matches when `None`
    pub serial_number: Option<String>,
    /// Interface to claim; 0 means the first USB-TMC interface
    pub interface_number: u8,
}

impl UsbSelector {
    /// # Errors
    /// [`VisaError::Validation`] if `address` is not a USB address.
    pub fn from_address(address: &ResourceAddress) -> VisaResult<Self> {
        match address {
            ResourceAddress::Usb {
                vendor_id,
                product_id,
                serial,
                ..
            } => Ok(Self {
                vendor_id: *vendor_id,
                product_id: *product_id,
                serial_number: serial.as_ref().map(|s| s.serial_number().to_string()),
                interface_number: serial.as_ref().map_or(0, UsbSerial::interface_number),
            }),
            other => Err(VisaError::Validation(format!("{} is not a USB resource", other))),
        }
    }
}

/// Opens [`TmcDevice`]s.
pub trait TmcConnector: Send + Sync {
    /// Locate, open and claim the interface named by `selector`.
    ///
    /// # Errors
    /// `Connect { NotFound }` when no device matches and `Connect { Busy }`
    /// when the interface cannot be claimed.
    fn connect(&self, selector: &UsbSelector, timeout: Duration) -> VisaResult<Box<dyn TmcDevice>>;
}

struct UnavailableConnector;

impl TmcConnector for UnavailableConnector {
    fn connect(&self, _selector: &UsbSelector, _timeout: Duration) -> VisaResult<Box<dyn TmcDevice>> {
        Err(VisaError::FeatureNotEnabled("instrument_usb".into()))
    }
}

/// Connector for real hardware, or one reporting `FeatureNotEnabled` when
/// USB support is compiled out.
pub fn default_connector() -> Arc<dyn TmcConnector> {
    #[cfg(feature = "instrument_usb")]
    {
        Arc::new(device::RusbConnector::new())
    }
    #[cfg(not(feature = "instrument_usb"))]
    {
        Arc::new(UnavailableConnector)
    }
}

/// Decoded `GET_CAPABILITIES` reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TmcCapabilities {
    /// USB-TMC revision (BCD)
    pub bcd_usbtmc: u16,
    /// Supports `INDICATOR_PULSE`
    pub indicator_pulse: bool,
    /// Talk-only device
    pub talk_only: bool,
    /// Listen-only device
    pub listen_only: bool,
    /// Supports a termination character on bulk-in
    pub term_char: bool,
    /// USB488 revision (BCD)
    pub bcd_usb488: u16,
    /// USB488.2 interface
    pub usb488_2: bool,
    /// Supports REN_CONTROL, GO_TO_LOCAL and LOCAL_LOCKOUT
    pub remote_local: bool,
    /// Accepts the TRIGGER message
    pub trigger: bool,
    /// Understands SCPI
    pub scpi: bool,
}

impl TmcCapabilities {
    /// Parse a reply including its leading status byte.
    ///
    /// # Errors
    /// [`VisaError::Protocol`] for short replies or a non-success status.
    pub fn parse(buf: &[u8]) -> VisaResult<Self> {
        if buf.len() < 16 {
            return Err(VisaError::Protocol(format!(
                "GET_CAPABILITIES reply of {} bytes is too short",
                buf.len()
            )));
        }
        if buf[0] != status::SUCCESS {
            return Err(VisaError::Protocol(format!(
                "GET_CAPABILITIES failed with status {:#04x}",
                buf[0]
            )));
        }
        Ok(Self {
            bcd_usbtmc: u16::from_le_bytes([buf[2], buf[3]]),
            indicator_pulse: buf[4] & 0x04 != 0,
            talk_only: buf[4] & 0x02 != 0,
            listen_only: buf[4] & 0x01 != 0,
            term_char: buf[5] & 0x01 != 0,
            bcd_usb488: u16::from_le_bytes([buf[12], buf[13]]),
            usb488_2: buf[14] & 0x04 != 0,
            remote_local: buf[14] & 0x02 != 0,
            trigger: buf[14] & 0x01 != 0,
            scpi: buf[15] & 0x08 != 0,
        })
    }
}

/// Claimed device plus the framing state that must survive between calls.
struct TmcLink {
    device: Box<dyn TmcDevice>,
    tags: TagGenerator,
    stb_tag: u8,
    pending: BytesMut,
    scratch: Vec<u8>,
    policy: QuirkPolicy,
    chunk_size: usize,
}

fn remaining(deadline: Instant, limit: Duration) -> VisaResult<Duration> {
    let left = deadline.saturating_duration_since(Instant::now());
    if left.is_zero() {
        Err(VisaError::Timeout(limit))
    } else {
        Ok(left)
    }
}

impl TmcLink {
    fn new(device: Box<dyn TmcDevice>, policy: QuirkPolicy, chunk_size: usize) -> Self {
        Self {
            device,
            tags: TagGenerator::new(),
            stb_tag: 1,
            pending: BytesMut::new(),
            scratch: Vec::new(),
            policy,
            chunk_size,
        }
    }

    fn max_payload(&self) -> usize {
        self.chunk_size - HEADER_SIZE
    }

    fn write_message(&mut self, data: &[u8], timeout: Duration) -> VisaResult<usize> {
        let deadline = Instant::now() + timeout;
        let max_payload = self.max_payload();
        let mut offset = 0;
        loop {
            let end = (offset + max_payload).min(data.len());
            let eom = end == data.len();
            let tag = self.tags.next();
            let transfer = encode_dev_dep_msg_out(tag, &data[offset..end], eom);
            trace!(tag, bytes = end - offset, eom, "DEV_DEP_MSG_OUT");
            self.device.write_bulk(&transfer, remaining(deadline, timeout)?)?;
            offset = end;
            if eom {
                break;
            }
        }
        if !self.policy.inter_command_delay.is_zero() {
            std::thread::sleep(self.policy.inter_command_delay);
        }
        Ok(data.len())
    }

    /// Read one bulk-in transfer answering `tag`, returning its header and payload length.
    fn read_transfer(&mut self, tag: u8, deadline: Instant, timeout: Duration) -> VisaResult<(BulkInHeader, usize)> {
        let packet = self.device.max_packet_size().max(HEADER_SIZE);
        let capacity = (self.chunk_size + 3).div_ceil(packet) * packet;
        if self.scratch.len() < capacity {
            self.scratch.resize(capacity, 0);
        }

        let mut received = self
            .device
            .read_bulk(&mut self.scratch[..capacity], remaining(deadline, timeout)?)?;
        let header = BulkInHeader::decode(&self.scratch[..received])?;
        header.validate(tag, self.policy.strict_tag_check)?;

        let size = header.transfer_size as usize;
        if size > self.max_payload() {
            return Err(VisaError::Protocol(format!(
                "device announced {} bytes, more than the {} requested",
                size,
                self.max_payload()
            )));
        }

        let wanted = HEADER_SIZE + size;
        while received < wanted {
            let n = self
                .device
                .read_bulk(&mut self.scratch[received..capacity], remaining(deadline, timeout)?)?;
            if n == 0 {
                return Err(VisaError::Protocol(format!(
                    "bulk-in transfer ended after {} of {} bytes",
                    received - HEADER_SIZE,
                    size
                )));
            }
            received += n;
        }
        Ok((header, size))
    }

    /// Append one complete device message to the pending buffer.
    fn read_message(&mut self, deadline: Instant, timeout: Duration) -> VisaResult<()> {
        let max_payload = self.max_payload();
        loop {
            let tag = self.tags.next();
            let request =
                encode_bulk_out_header(msg_id::REQUEST_DEV_DEP_MSG_IN, tag, max_payload as u32, false);
            self.device.write_bulk(&request, remaining(deadline, timeout)?)?;

            let (header, size) = self.read_transfer(tag, deadline, timeout)?;
            self.pending
                .extend_from_slice(&self.scratch[HEADER_SIZE..HEADER_SIZE + size]);
            trace!(tag, bytes = size, eom = header.eom, "DEV_DEP_MSG_IN");

            if header.eom {
                return Ok(());
            }
            if self.policy.short_transfer_ends_message && size < max_payload {
                debug!(tag, bytes = size, "Short transfer without EOM treated as end of message");
                return Ok(());
            }
        }
    }

    fn read_raw(&mut self, max_size: Option<usize>, timeout: Duration) -> VisaResult<Vec<u8>> {
        if self.pending.is_empty() {
            self.read_message(Instant::now() + timeout, timeout)?;
        }
        let n = max_size.unwrap_or(self.pending.len()).min(self.pending.len());
        Ok(self.pending.split_to(n).to_vec())
    }

    fn read_bytes(&mut self, count: usize, timeout: Duration) -> VisaResult<Vec<u8>> {
        let deadline = Instant::now() + timeout;
        while self.pending.len() < count {
            self.read_message(deadline, timeout)?;
        }
        Ok(self.pending.split_to(count).to_vec())
    }

    /// Bytes up to the terminator, or the whole message when EOM arrives first.
    fn read_terminated(&mut self, terminator: &[u8], timeout: Duration) -> VisaResult<Vec<u8>> {
        if let Some(pos) = find_subsequence(&self.pending, terminator) {
            return Ok(self.take_through(pos, terminator.len()));
        }
        self.read_message(Instant::now() + timeout, timeout)?;
        match find_subsequence(&self.pending, terminator) {
            Some(pos) => Ok(self.take_through(pos, terminator.len())),
            None => Ok(self.pending.split().to_vec()),
        }
    }

    fn take_through(&mut self, pos: usize, terminator_len: usize) -> Vec<u8> {
        let mut message = self.pending.split_to(pos + terminator_len);
        message.truncate(pos);
        message.to_vec()
    }

    fn trigger(&mut self, timeout: Duration) -> VisaResult<()> {
        let tag = self.tags.next();
        let header = encode_bulk_out_header(msg_id::TRIGGER, tag, 0, false);
        self.device.write_bulk(&header, timeout)?;
        Ok(())
    }

    fn read_stb(&mut self, timeout: Duration) -> VisaResult<u8> {
        self.stb_tag = if self.stb_tag >= 127 { 2 } else { self.stb_tag + 1 };
        let tag = self.stb_tag;
        let mut reply = [0u8; 3];
        let n = self
            .device
            .control_in(request::READ_STATUS_BYTE, u16::from(tag), &mut reply, timeout)?;
        if n < 3 {
            return Err(VisaError::Protocol(format!("READ_STATUS_BYTE reply of {} bytes", n)));
        }
        if reply[0] != status::SUCCESS {
            return Err(VisaError::Protocol(format!(
                "READ_STATUS_BYTE failed with {} ({:#04x})",
                status::name(reply[0]),
                reply[0]
            )));
        }
        if reply[1] != tag {
            return Err(VisaError::Protocol(format!(
                "READ_STATUS_BYTE tag {} does not match request tag {}",
                reply[1], tag
            )));
        }
        Ok(reply[2])
    }

    fn clear(&mut self, timeout: Duration) -> VisaResult<()> {
        let deadline = Instant::now() + timeout;
        let mut reply = [0u8; 1];
        self.device
            .control_in(request::INITIATE_CLEAR, 0, &mut reply, timeout)?;
        if reply[0] != status::SUCCESS {
            return Err(VisaError::Protocol(format!(
                "INITIATE_CLEAR failed with {} ({:#04x})",
                status::name(reply[0]),
                reply[0]
            )));
        }

        loop {
            let mut check = [0u8; 2];
            self.device.control_in(
                request::CHECK_CLEAR_STATUS,
                0,
                &mut check,
                remaining(deadline, timeout)?,
            )?;
            match check[0] {
                status::SUCCESS => break,
                status::PENDING => {
                    // bmClear D0: the device wants the host to drain bulk-in first.
                    if check[1] & 0x01 != 0 {
                        let mut drain = vec![0u8; self.device.max_packet_size().max(HEADER_SIZE)];
                        let _ = self.device.read_bulk(&mut drain, CLEAR_POLL_INTERVAL);
                    }
                    remaining(deadline, timeout)?;
                    std::thread::sleep(CLEAR_POLL_INTERVAL);
                }
                other => {
                    return Err(VisaError::Protocol(format!(
                        "CHECK_CLEAR_STATUS failed with {} ({:#04x})",
                        status::name(other),
                        other
                    )))
                }
            }
        }

        self.device.clear_halt()?;
        self.pending.clear();
        Ok(())
    }

    fn capabilities(&mut self, timeout: Duration) -> VisaResult<TmcCapabilities> {
        let mut reply = [0u8; CAPABILITIES_LENGTH];
        let n = self
            .device
            .control_in(request::GET_CAPABILITIES, 0, &mut reply, timeout)?;
        TmcCapabilities::parse(&reply[..n])
    }
}

fn join_error(err: tokio::task::JoinError) -> VisaError {
    VisaError::Io(io::Error::new(
        io::ErrorKind::Other,
        format!("USB worker task failed: {}", err),
    ))
}

/// USB-TMC transport; bulk and control transfers run on the blocking pool.
pub struct UsbTmcTransport {
    core: LinkCore,
    selector: UsbSelector,
    profile: QuirkProfile,
    connector: Arc<dyn TmcConnector>,
    link: Option<Arc<Mutex<TmcLink>>>,
    capabilities: Option<TmcCapabilities>,
}

impl UsbTmcTransport {
    /// Create a closed transport for a USB address.
    ///
    /// Without an explicit profile the quirk profile follows the vendor id.
    ///
    /// # Errors
    /// [`VisaError::Validation`] if `address` is not a USB address.
    pub fn new(
        address: &ResourceAddress,
        settings: TransportSettings,
        quirks: Option<QuirkProfile>,
        connector: Arc<dyn TmcConnector>,
    ) -> VisaResult<Self> {
        let selector = UsbSelector::from_address(address)?;
        let profile = quirks.unwrap_or_else(|| QuirkProfile::for_vendor(selector.vendor_id));
        Ok(Self {
            core: LinkCore::new(address.build(), settings, true),
            selector,
            profile,
            connector,
            link: None,
            capabilities: None,
        })
    }

    /// Device and interface this transport claims.
    pub fn selector(&self) -> &UsbSelector {
        &self.selector
    }

    /// Vendor workarounds in effect.
    pub fn quirk_profile(&self) -> QuirkProfile {
        self.profile
    }

    /// Capabilities reported by the device when it was opened.
    pub fn capabilities(&self) -> Option<TmcCapabilities> {
        self.capabilities
    }

    /// Run `op` against the link on the blocking pool and account for the result.
    async fn run<T, F>(&mut self, op: F) -> VisaResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut TmcLink, Duration) -> VisaResult<T> + Send + 'static,
    {
        self.core.ensure_open()?;
        let link = self.link.clone().ok_or(VisaError::NotOpen)?;
        let timeout = self.core.timeout();
        let result = tokio::task::spawn_blocking(move || {
            let mut link = link.blocking_lock();
            op(&mut link, timeout)
        })
        .await
        .map_err(join_error)
        .and_then(|r| r);
        self.core.record(result)
    }
}

#[async_trait]
impl Transport for UsbTmcTransport {
    fn core(&self) -> &LinkCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut LinkCore {
        &mut self.core
    }

    async fn open(&mut self) -> VisaResult<()> {
        self.core.begin_open()?;

        let connector = self.connector.clone();
        let selector = self.selector.clone();
        let timeout = self.core.timeout();
        let policy = self.profile.policy();
        let chunk_size = self.profile.effective_chunk_size(self.core.settings().chunk_size);
        let resource = self.core.resource().to_string();

        let result = tokio::task::spawn_blocking(move || -> VisaResult<(TmcLink, Option<TmcCapabilities>)> {
            let device = connector.connect(&selector, timeout)?;
            let mut link = TmcLink::new(device, policy, chunk_size);
            let capabilities = match link.capabilities(timeout) {
                Ok(caps) => Some(caps),
                Err(e) => {
                    warn!(resource = %resource, error = %e, "GET_CAPABILITIES failed, continuing without");
                    None
                }
            };
            Ok((link, capabilities))
        })
        .await
        .map_err(join_error)
        .and_then(|r| r);

        let (link, capabilities) = self.core.finish_open(result)?;
        self.link = Some(Arc::new(Mutex::new(link)));
        self.capabilities = capabilities;
        info!(
            resource = %self.core.resource(),
            profile = %self.profile,
            chunk_size,
            "USB-TMC transport opened"
        );
        Ok(())
    }

    async fn close(&mut self) -> VisaResult<()> {
        self.core.begin_close();
        if let Some(link) = self.link.take() {
            let released = tokio::task::spawn_blocking(move || {
                link.blocking_lock().device.release();
            })
            .await;
            if let Err(e) = released {
                warn!(resource = %self.core.resource(), error = %e, "Releasing USB interface failed");
            }
        }
        self.capabilities = None;
        self.core.finish_close();
        debug!(resource = %self.core.resource(), "USB-TMC transport closed");
        Ok(())
    }

    async fn write_raw(&mut self, data: &[u8]) -> VisaResult<usize> {
        let data = data.to_vec();
        self.run(move |link, timeout| link.write_message(&data, timeout))
            .await
    }

    async fn read_raw(&mut self, max_size: Option<usize>) -> VisaResult<Vec<u8>> {
        self.run(move |link, timeout| link.read_raw(max_size, timeout))
            .await
    }

    async fn read_bytes(&mut self, count: usize) -> VisaResult<Vec<u8>> {
        self.run(move |link, timeout| link.read_bytes(count, timeout))
            .await
    }

    async fn read_until(&mut self, terminator: &[u8]) -> VisaResult<Vec<u8>> {
        let terminator = terminator.to_vec();
        self.run(move |link, timeout| link.read_terminated(&terminator, timeout))
            .await
    }

    async fn clear(&mut self) -> VisaResult<()> {
        self.run(|link, timeout| link.clear(timeout)).await
    }

    /// USB-TMC `TRIGGER` message instead of `*TRG`.
    async fn trigger(&mut self) -> VisaResult<()> {
        self.run(|link, timeout| link.trigger(timeout)).await
    }

    /// USB488 `READ_STATUS_BYTE` control request instead of `*STB?`.
    async fn read_stb(&mut self) -> VisaResult<u8> {
        self.run(|link, timeout| link.read_stb(timeout)).await
    }
}


#[cfg(test)]
mod tests {
    use super::testing::{FakeConnector, FakeInstrument};
    use super::*;
    use crate::transport::testing::assert_io_refused;
    use crate::transport::TransportState;

    const KEYSIGHT: &str = "USB0::0x0957::0x1796::MY123::INSTR";
    const RIGOL: &str = "USB0::0x1AB1::0x04CE::DS1ZA1::INSTR";

    async fn open(resource: &str, device: FakeInstrument, settings: TransportSettings) -> UsbTmcTransport {
        let address = ResourceAddress::parse(resource).unwrap();
        let mut transport =
            UsbTmcTransport::new(&address, settings, None, FakeConnector::new(device)).unwrap();
        transport.open().await.unwrap();
        transport
    }

    #[tokio::test]
    async fn test_query_frames_messages() {
        let device = FakeInstrument::new().reply(b"KEYSIGHT,DSOX1204G,MY123,1.0\n");
        let log = device.log.clone();
        let mut transport = open(KEYSIGHT, device, TransportSettings::default()).await;
        assert_eq!(transport.state(), TransportState::Open);
        assert_eq!(transport.quirk_profile(), QuirkProfile::Standard);

        let reply = transport.query("*IDN?", None).await.unwrap();
        assert_eq!(reply, "KEYSIGHT,DSOX1204G,MY123,1.0");

        let log = log.lock().unwrap();
        let out = &log.bulk_out[0];
        assert_eq!(out[0], msg_id::DEV_DEP_MSG_OUT);
        assert_eq!(out[1], 1);
        assert_eq!(out[2], !1u8);
        assert_eq!(out[8], 0x01);
        assert_eq!(&out[HEADER_SIZE..HEADER_SIZE + 6], b"*IDN?\n");
        assert_eq!(out.len() % 4, 0);

        let request = &log.bulk_out[1];
        assert_eq!(request[0], msg_id::REQUEST_DEV_DEP_MSG_IN);
        assert_eq!(request[1], 2);
    }

    #[tokio::test]
    async fn test_multi_transfer_response_joined_until_eom() {
        let settings = TransportSettings {
            chunk_size: HEADER_SIZE + 8,
            ..TransportSettings::default()
        };
        let device = FakeInstrument::new().reply(b"0.1,0.2,0.3,0.4\n");
        let log = device.log.clone();
        let mut transport = open(KEYSIGHT, device, settings).await;

        assert_eq!(transport.read().await.unwrap(), "0.1,0.2,0.3,0.4");
        let requests = log
            .lock()
            .unwrap()
            .bulk_out
            .iter()
            .filter(|t| t[0] == msg_id::REQUEST_DEV_DEP_MSG_IN)
            .count();
        assert_eq!(requests, 2);
    }

    #[tokio::test]
    async fn test_long_write_split_into_chunks() {
        let settings = TransportSettings {
            chunk_size: HEADER_SIZE + 4,
            ..TransportSettings::default()
        };
        let device = FakeInstrument::new();
        let log = device.log.clone();
        let mut transport = open(KEYSIGHT, device, settings).await;

        transport.write("VOLT 1.5").await.unwrap();
        let log = log.lock().unwrap();
        assert_eq!(log.bulk_out.len(), 3);
        assert_eq!(log.bulk_out[0][8], 0);
        assert_eq!(log.bulk_out[1][8], 0);
        assert_eq!(log.bulk_out[2][8], 1);
        let tags: Vec<u8> = log.bulk_out.iter().map(|t| t[1]).collect();
        assert_eq!(tags, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_tag_mismatch_is_protocol_error() {
        let mut device = FakeInstrument::new().reply(b"1\n");
        device.tag_offset = 1;
        let mut transport = open(KEYSIGHT, device, TransportSettings::default()).await;
        let err = transport.read().await.unwrap_err();
        assert!(matches!(err, VisaError::Protocol(_)));
        assert_eq!(transport.state(), TransportState::Open);
    }

    #[tokio::test]
    async fn test_read_bytes_keeps_remainder() {
        let device = FakeInstrument::new().reply(b"#14abcd\n");
        let mut transport = open(KEYSIGHT, device, TransportSettings::default()).await;
        assert_eq!(transport.read_bytes(2).await.unwrap(), b"#1");
        assert_eq!(transport.read_bytes(1).await.unwrap(), b"4");
        assert_eq!(transport.read_bytes(4).await.unwrap(), b"abcd");
        assert_eq!(transport.read_raw(None).await.unwrap(), b"\n");
    }

    #[tokio::test]
    async fn test_rigol_short_transfer_ends_message() {
        let mut device = FakeInstrument::new().reply(b"DATA\n");
        device.set_eom = false;
        let mut transport = open(RIGOL, device, TransportSettings::default()).await;
        assert_eq!(transport.quirk_profile(), QuirkProfile::Rigol);
        assert_eq!(transport.read().await.unwrap(), "DATA");
    }

    #[tokio::test]
    async fn test_trigger_and_status_byte() {
        let device = FakeInstrument::new().control(request::READ_STATUS_BYTE, &[status::SUCCESS, 0, 0x50]);
        let log = device.log.clone();
        let mut transport = open(KEYSIGHT, device, TransportSettings::default()).await;

        transport.trigger().await.unwrap();
        assert_eq!(transport.read_stb().await.unwrap(), 0x50);

        let log = log.lock().unwrap();
        let trigger = &log.bulk_out[0];
        assert_eq!(trigger.len(), HEADER_SIZE);
        assert_eq!(trigger[0], msg_id::TRIGGER);
        let (req, value) = *log.control.last().unwrap();
        assert_eq!(req, request::READ_STATUS_BYTE);
        assert!((2..=127).contains(&value));
    }

    #[tokio::test]
    async fn test_clear_polls_until_done() {
        let device = FakeInstrument::new()
            .control(request::INITIATE_CLEAR, &[status::SUCCESS])
            .control(request::CHECK_CLEAR_STATUS, &[status::PENDING, 0])
            .control(request::CHECK_CLEAR_STATUS, &[status::SUCCESS, 0]);
        let log = device.log.clone();
        let mut transport = open(KEYSIGHT, device, TransportSettings::default()).await;

        transport.clear().await.unwrap();
        let log = log.lock().unwrap();
        let checks = log
            .control
            .iter()
            .filter(|(r, _)| *r == request::CHECK_CLEAR_STATUS)
            .count();
        assert_eq!(checks, 2);
        assert_eq!(log.halts_cleared, 1);
    }

    #[tokio::test]
    async fn test_failed_clear_names_status() {
        let device = FakeInstrument::new()
            .control(request::INITIATE_CLEAR, &[status::SUCCESS])
            .control(request::CHECK_CLEAR_STATUS, &[status::FAILED, 0]);
        let log = device.log.clone();
        let mut transport = open(KEYSIGHT, device, TransportSettings::default()).await;

        let err = transport.clear().await.unwrap_err();
        assert!(matches!(&err, VisaError::Protocol(m) if m.contains("STATUS_FAILED")));
        assert_eq!(transport.state(), TransportState::Open);
        assert_eq!(log.lock().unwrap().halts_cleared, 0);
    }

    #[tokio::test]
    async fn test_capabilities_read_on_open() {
        let mut caps = [0u8; CAPABILITIES_LENGTH];
        caps[0] = status::SUCCESS;
        caps[2] = 0x00;
        caps[3] = 0x01;
        caps[14] = 0x07;
        caps[15] = 0x08;
        let device = FakeInstrument::new().control(request::GET_CAPABILITIES, &caps);
        let transport = open(KEYSIGHT, device, TransportSettings::default()).await;

        let caps = transport.capabilities().unwrap();
        assert_eq!(caps.bcd_usbtmc, 0x0100);
        assert!(caps.usb488_2 && caps.trigger && caps.scpi);
    }

    #[tokio::test]
    async fn test_close_releases_interface() {
        let device = FakeInstrument::new();
        let log = device.log.clone();
        let mut transport = open(KEYSIGHT, device, TransportSettings::default()).await;
        transport.close().await.unwrap();
        assert_eq!(transport.state(), TransportState::Closed);
        assert!(log.lock().unwrap().released);
        assert!(matches!(transport.write("*RST").await, Err(VisaError::NotOpen)));
    }

    #[tokio::test]
    async fn test_missing_device_is_not_found() {
        let address = ResourceAddress::parse(KEYSIGHT).unwrap();
        let connector = FakeConnector::new(FakeInstrument::new());
        let mut first = UsbTmcTransport::new(&address, TransportSettings::default(), None, connector.clone()).unwrap();
        first.open().await.unwrap();

        let mut second = UsbTmcTransport::new(&address, TransportSettings::default(), None, connector).unwrap();
        let err = second.open().await.unwrap_err();
        assert_eq!(err.connect_kind(), Some(crate::error::ConnectErrorKind::NotFound));
        assert_eq!(second.state(), TransportState::Closed);
    }

    #[tokio::test]
    async fn test_io_refused_unless_open() {
        let address = ResourceAddress::parse(KEYSIGHT).unwrap();
        let connector = FakeConnector::new(FakeInstrument::new());
        let mut transport = UsbTmcTransport::new(&address, TransportSettings::default(), None, connector).unwrap();
        assert_io_refused(&mut transport).await;

        transport.open().await.unwrap();
        transport.close().await.unwrap();
        assert_io_refused(&mut transport).await;
    }

    #[tokio::test]
    async fn test_unplugged_device_refuses_io() {
        let mut device = FakeInstrument::new();
        device.unplugged = true;
        let mut transport = open(KEYSIGHT, device, TransportSettings::default()).await;

        let err = transport.write("*RST").await.unwrap_err();
        assert!(matches!(err, VisaError::Io(_)));
        assert_eq!(transport.state(), TransportState::Error);
        assert_io_refused(&mut transport).await;
    }
}
