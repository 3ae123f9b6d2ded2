//! Transport abstraction over USB-TMC, RS-232, TCP/IP and simulated links
//!
//! Every medium implements [`Transport`]. The cross-cutting parts (state
//! machine, terminators, timeout accounting) live in [`LinkCore`], which each
//! implementation owns; medium-specific framing stays in its own module.
//!
//! # State machine
//!
//! ```text
//! Closed --open()--> Opening --ok--> Open --close()--> Closing --> Closed
//!                       |                                 ^
//!                       +--fail--> Closed                 |
//! any state --I/O fault / repeated timeouts--> Error --close()--+
//! ```
//!
//! # Concurrency
//!
//! A transport performs one logical operation at a time; callers must not
//! pipeline requests. The session layer serializes access for supervised
//! resources.

pub mod ext;
pub mod quirks;
pub mod serial;
pub mod simulated;
pub mod stream;
pub mod tcpip;
pub mod usbtmc;

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use tracing::warn;

use crate::config::{SerialSettings, TransportSettings};
use crate::error::{ConnectErrorKind, VisaError, VisaResult};

pub use ext::ScpiTransportExt;
pub use quirks::{QuirkPolicy, QuirkProfile};
pub use serial::SerialTransport;
pub use simulated::{CommandHandler, HandlerReply, SimulatedTransport};
pub use tcpip::TcpIpTransport;
pub use usbtmc::UsbTmcTransport;

/// Connection state of a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    /// No link held
    Closed,
    /// Link being acquired
    Opening,
    /// Ready for I/O
    Open,
    /// Link being released
    Closing,
    /// Link fault; I/O is refused until the transport is closed
    Error,
}

/// Options used when creating a transport for a resource.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransportOptions {
    /// Timeout, terminators and chunk sizing
    pub settings: TransportSettings,
    /// Line settings, used by serial resources only
    pub serial: SerialSettings,
    /// Quirk profile; USB resources pick one from the vendor id when `None`
    pub quirks: Option<QuirkProfile>,
}

impl TransportOptions {
    /// Options with the given transport settings and defaults elsewhere.
    pub fn with_settings(settings: TransportSettings) -> Self {
        Self {
            settings,
            ..Self::default()
        }
    }
}

/// State and settings shared by every transport implementation.
#[derive(Debug, Clone)]
pub struct LinkCore {
    resource: String,
    state: TransportState,
    settings: TransportSettings,
    consecutive_timeouts: u32,
    escalate_timeouts: bool,
}

impl LinkCore {
    /// `escalate_timeouts` enables the rule that repeated timeouts force `Error`.
    pub fn new(resource: impl Into<String>, settings: TransportSettings, escalate_timeouts: bool) -> Self {
        Self {
            resource: resource.into(),
            state: TransportState::Closed,
            settings,
            consecutive_timeouts: 0,
            escalate_timeouts,
        }
    }

    /// Canonical resource string.
    pub fn resource(&self) -> &str {
        &self.resource
    }

    /// Current connection state.
    pub fn state(&self) -> TransportState {
        self.state
    }

    /// I/O settings in effect.
    pub fn settings(&self) -> &TransportSettings {
        &self.settings
    }

    /// Timeout applied to each I/O operation.
    pub fn timeout(&self) -> Duration {
        self.settings.timeout
    }

    /// Change the I/O timeout.
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.settings.timeout = timeout;
    }

    /// Closed -> Opening, or `AlreadyOpen` from any other state.
    pub fn begin_open(&mut self) -> VisaResult<()> {
        if self.state != TransportState::Closed {
            return Err(VisaError::connect(&self.resource, ConnectErrorKind::AlreadyOpen));
        }
        self.state = TransportState::Opening;
        Ok(())
    }

    /// Opening -> Open on success, back to Closed on failure.
    pub fn finish_open<T>(&mut self, result: VisaResult<T>) -> VisaResult<T> {
        match result {
            Ok(value) => {
                self.state = TransportState::Open;
                self.consecutive_timeouts = 0;
                Ok(value)
            }
            Err(err) => {
                self.state = TransportState::Closed;
                Err(err)
            }
        }
    }

    /// Enter `Closing`.
    pub fn begin_close(&mut self) {
        self.state = TransportState::Closing;
    }

    /// Enter `Closed` and reset the timeout count.
    pub fn finish_close(&mut self) {
        self.state = TransportState::Closed;
        self.consecutive_timeouts = 0;
    }

    /// `NotOpen` unless the state is `Open`.
    pub fn ensure_open(&self) -> VisaResult<()> {
        if self.state == TransportState::Open {
            Ok(())
        } else {
            Err(VisaError::NotOpen)
        }
    }

    /// Account for the outcome of an I/O operation.
    ///
    /// Link faults move the transport to `Error`. Timeouts are counted and,
    /// where escalation is enabled, `max_consecutive_timeouts` of them in a
    /// row also move it to `Error`. Any success resets the count.
    pub fn record<T>(&mut self, result: VisaResult<T>) -> VisaResult<T> {
        match &result {
            Ok(_) => self.consecutive_timeouts = 0,
            Err(VisaError::Io(err)) => {
                warn!(resource = %self.resource, error = %err, "Link fault, transport entering error state");
                self.state = TransportState::Error;
            }
            Err(VisaError::Timeout(_)) => {
                self.consecutive_timeouts += 1;
                let limit = self.settings.max_consecutive_timeouts;
                if self.escalate_timeouts && limit > 0 && self.consecutive_timeouts >= limit {
                    warn!(
                        resource = %self.resource,
                        timeouts = self.consecutive_timeouts,
                        "Repeated timeouts, transport entering error state"
                    );
                    self.state = TransportState::Error;
                }
            }
            Err(_) => {}
        }
        result
    }

    /// Timeouts since the last success.
    pub fn consecutive_timeouts(&self) -> u32 {
        self.consecutive_timeouts
    }
}

/// Bound `operation` by `limit`, mapping expiry to [`VisaError::Timeout`].
pub async fn with_timeout<T, F>(limit: Duration, operation: F) -> VisaResult<T>
where
    F: Future<Output = VisaResult<T>>,
{
    match tokio::time::timeout(limit, operation).await {
        Ok(result) => result,
        Err(_) => Err(VisaError::Timeout(limit)),
    }
}

/// Uniform I/O contract for every physical medium.
///
/// The text primitives (`write`, `read`, `query`) handle termination; the raw
/// primitives (`write_raw`, `read_raw`, `read_bytes`, `read_until`) move bytes
/// untouched.
/// All of them fail with [`VisaError::NotOpen`] unless the state is `Open`.
#[async_trait]
pub trait Transport: Send {
    /// Shared state and settings.
    fn core(&self) -> &LinkCore;

    /// Mutable access to the shared state and settings.
    fn core_mut(&mut self) -> &mut LinkCore;

    /// Canonical resource string this transport was created for.
    fn resource_name(&self) -> &str {
        self.core().resource()
    }

    /// Current connection state.
    fn state(&self) -> TransportState {
        self.core().state()
    }

    /// Current I/O settings.
    fn settings(&self) -> &TransportSettings {
        self.core().settings()
    }

    /// Change the I/O timeout for subsequent operations.
    fn set_timeout(&mut self, timeout: Duration) {
        self.core_mut().set_timeout(timeout);
    }

    /// Acquire the physical link.
    ///
    /// # Errors
    /// `Connect { kind: AlreadyOpen }` unless the transport is `Closed`, or a
    /// medium-specific connect failure.
    async fn open(&mut self) -> VisaResult<()>;

    /// Release the physical link. Always succeeds; OS-level close errors are logged.
    async fn close(&mut self) -> VisaResult<()>;

    /// Send bytes without adding a terminator.
    async fn write_raw(&mut self, data: &[u8]) -> VisaResult<usize>;

    /// Return whatever is available, up to `max_size` bytes, waiting for at least one byte.
    async fn read_raw(&mut self, max_size: Option<usize>) -> VisaResult<Vec<u8>>;

    /// Return exactly `count` bytes, accumulating until they arrive or the timeout expires.
    async fn read_bytes(&mut self, count: usize) -> VisaResult<Vec<u8>>;

    /// Return the bytes before the next `terminator`, consuming the terminator
    /// but nothing after it.
    async fn read_until(&mut self, terminator: &[u8]) -> VisaResult<Vec<u8>>;

    /// Read one response and strip the read terminator.
    async fn read(&mut self) -> VisaResult<String> {
        let terminator = self.settings().read_termination.clone();
        let bytes = self.read_until(terminator.as_bytes()).await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Ask the instrument to flush its I/O buffers and drop local remnants.
    async fn clear(&mut self) -> VisaResult<()>;

    /// Send `text` followed by the write terminator.
    async fn write(&mut self, text: &str) -> VisaResult<()> {
        self.core().ensure_open()?;
        let mut payload = Vec::with_capacity(text.len() + self.settings().write_termination.len());
        payload.extend_from_slice(text.as_bytes());
        payload.extend_from_slice(self.settings().write_termination.as_bytes());
        self.write_raw(&payload).await.map(|_| ())
    }

    /// Write `command`, wait `delay` (or the configured query delay), then read.
    async fn query(&mut self, command: &str, delay: Option<Duration>) -> VisaResult<String> {
        self.write(command).await?;
        if let Some(delay) = delay.or(self.settings().query_delay) {
            tokio::time::sleep(delay).await;
        }
        self.read().await
    }

    /// Send a device trigger (`*TRG` unless the medium has a native trigger).
    async fn trigger(&mut self) -> VisaResult<()> {
        self.write("*TRG").await
    }

    /// Read the IEEE-488.2 status byte (`*STB?` unless the medium has a native request).
    async fn read_stb(&mut self) -> VisaResult<u8> {
        let response = self.query("*STB?", None).await?;
        response
            .trim()
            .parse::<u8>()
            .map_err(|_| VisaError::Protocol(format!("invalid status byte '{}'", response.trim())))
    }
}

/// Index of the first occurrence of `needle` in `haystack`.
pub(crate) fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || needle.len() > haystack.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// Assert that every I/O operation of `transport` is refused with `NotOpen`.
    pub async fn assert_io_refused(transport: &mut dyn Transport) {
        let state = transport.state();
        assert_ne!(state, TransportState::Open);
        assert!(matches!(transport.write("*RST").await, Err(VisaError::NotOpen)), "write in {:?}", state);
        assert!(matches!(transport.read().await, Err(VisaError::NotOpen)), "read in {:?}", state);
        assert!(
            matches!(transport.query("*IDN?", None).await, Err(VisaError::NotOpen)),
            "query in {:?}",
            state
        );
        assert!(matches!(transport.clear().await, Err(VisaError::NotOpen)), "clear in {:?}", state);
        assert!(matches!(transport.trigger().await, Err(VisaError::NotOpen)), "trigger in {:?}", state);
        assert!(matches!(transport.read_stb().await, Err(VisaError::NotOpen)), "read_stb in {:?}", state);
        assert!(matches!(transport.write_raw(b"*CLS\n").await, Err(VisaError::NotOpen)));
        assert!(matches!(transport.read_raw(None).await, Err(VisaError::NotOpen)));
        assert!(matches!(transport.read_bytes(1).await, Err(VisaError::NotOpen)));
        assert!(matches!(transport.read_until(b"\n").await, Err(VisaError::NotOpen)));
        assert_eq!(transport.state(), state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn core() -> LinkCore {
        LinkCore::new("ASRL1::INSTR", TransportSettings::default(), true)
    }

    #[test]
    fn test_open_transitions() {
        let mut core = core();
        assert!(matches!(core.ensure_open(), Err(VisaError::NotOpen)));
        core.begin_open().unwrap();
        assert_eq!(core.state(), TransportState::Opening);
        let err = core.begin_open().unwrap_err();
        assert_eq!(err.connect_kind(), Some(ConnectErrorKind::AlreadyOpen));
        core.finish_open(Ok(())).unwrap();
        assert_eq!(core.state(), TransportState::Open);
        assert!(core.ensure_open().is_ok());
    }

    #[test]
    fn test_failed_open_returns_to_closed() {
        let mut core = core();
        core.begin_open().unwrap();
        let result: VisaResult<()> = core.finish_open(Err(VisaError::connect(
            "ASRL1::INSTR",
            ConnectErrorKind::NotFound,
        )));
        assert!(result.is_err());
        assert_eq!(core.state(), TransportState::Closed);
    }

    #[test]
    fn test_io_fault_enters_error() {
        let mut core = core();
        core.begin_open().unwrap();
        core.finish_open(Ok(())).unwrap();
        let fault: VisaResult<()> = Err(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "gone").into());
        assert!(core.record(fault).is_err());
        assert_eq!(core.state(), TransportState::Error);
        core.begin_close();
        core.finish_close();
        assert_eq!(core.state(), TransportState::Closed);
    }

    #[test]
    fn test_repeated_timeouts_escalate() {
        let mut core = core();
        core.begin_open().unwrap();
        core.finish_open(Ok(())).unwrap();
        let timeout = || -> VisaResult<()> { Err(VisaError::Timeout(Duration::from_millis(1))) };

        let _ = core.record(timeout());
        let _ = core.record(timeout());
        assert_eq!(core.state(), TransportState::Open);
        let _ = core.record(Ok(()));
        assert_eq!(core.consecutive_timeouts(), 0);

        for _ in 0..3 {
            let _ = core.record(timeout());
        }
        assert_eq!(core.state(), TransportState::Error);
    }

    #[test]
    fn test_timeouts_without_escalation() {
        let mut core = LinkCore::new("TCPIP0::h::1::SOCKET", TransportSettings::default(), false);
        core.begin_open().unwrap();
        core.finish_open(Ok(())).unwrap();
        for _ in 0..10 {
            let _ = core.record::<()>(Err(VisaError::Timeout(Duration::from_millis(1))));
        }
        assert_eq!(core.state(), TransportState::Open);
    }

    #[test]
    fn test_find_subsequence() {
        assert_eq!(find_subsequence(b"abc\r\ndef", b"\r\n"), Some(3));
        assert_eq!(find_subsequence(b"abc", b"\n"), None);
        assert_eq!(find_subsequence(b"", b"\n"), None);
    }

    #[tokio::test]
    async fn test_with_timeout_maps_expiry() {
        let result: VisaResult<()> = with_timeout(Duration::from_millis(5), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;
        assert!(matches!(result, Err(VisaError::Timeout(_))));
    }
}
