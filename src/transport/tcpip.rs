//! Raw TCP socket transport (`TCPIP::SOCKET` and `TCPIP::INSTR` resources)
//!
//! `INSTR` resources are reached over the raw SCPI socket on port 5025; no
//! VXI-11 or HiSLIP session is negotiated.

use std::io;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tracing::{debug, info};

use super::stream::StreamChannel;
use super::{with_timeout, LinkCore, Transport};
use crate::config::TransportSettings;
use crate::error::{ConnectErrorKind, VisaError, VisaResult};
use crate::resource::ResourceAddress;

/// Raw SCPI socket port used for `TCPIP::INSTR` resources.
pub const DEFAULT_INSTR_PORT: u16 = 5025;

/// Raw TCP socket transport.
pub struct TcpIpTransport {
    core: LinkCore,
    host: String,
    port: u16,
    channel: StreamChannel,
}

impl TcpIpTransport {
    /// Create a closed transport for a TCP/IP resource.
    ///
    /// # Errors
    /// [`VisaError::Validation`] if `address` is not a TCP/IP address.
    pub fn new(address: &ResourceAddress, settings: TransportSettings) -> VisaResult<Self> {
        let (host, port) = match address {
            ResourceAddress::TcpipSocket { host, port, .. } => (host.clone(), *port),
            ResourceAddress::TcpipInstr { host, .. } => (host.clone(), DEFAULT_INSTR_PORT),
            other => {
                return Err(VisaError::Validation(format!(
                    "{} is not a TCP/IP resource",
                    other
                )))
            }
        };
        Ok(Self {
            core: LinkCore::new(address.build(), settings, false),
            host,
            port,
            channel: StreamChannel::new(),
        })
    }

    /// Host name or address to connect to.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// TCP port to connect to.
    pub fn port(&self) -> u16 {
        self.port
    }
}

// Free function: the transport is not `Sync`, and `open` must stay `Send`.
async fn connect(resource: &str, host: &str, port: u16, limit: Duration) -> VisaResult<TcpStream> {
    let attempt = TcpStream::connect((host, port));
    let stream = match tokio::time::timeout(limit, attempt).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            debug!(resource = %resource, error = %e, "TCP connect failed");
            return Err(VisaError::connect(resource, connect_error_kind(&e)));
        }
        Err(_) => return Err(VisaError::connect(resource, ConnectErrorKind::Timeout)),
    };
    stream.set_nodelay(true)?;
    Ok(stream)
}

fn connect_error_kind(err: &io::Error) -> ConnectErrorKind {
    match err.kind() {
        io::ErrorKind::ConnectionRefused | io::ErrorKind::ConnectionReset => ConnectErrorKind::Refused,
        io::ErrorKind::TimedOut => ConnectErrorKind::Timeout,
        io::ErrorKind::AddrInUse => ConnectErrorKind::Busy,
        _ => ConnectErrorKind::NotFound,
    }
}

#[async_trait]
impl Transport for TcpIpTransport {
    fn core(&self) -> &LinkCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut LinkCore {
        &mut self.core
    }

    async fn open(&mut self) -> VisaResult<()> {
        self.core.begin_open()?;
        let result = connect(self.core.resource(), &self.host, self.port, self.core.timeout()).await;
        let stream = self.core.finish_open(result)?;
        self.channel.attach(Box::new(stream));
        info!(resource = %self.core.resource(), host = %self.host, port = self.port, "TCP/IP transport opened");
        Ok(())
    }

    async fn close(&mut self) -> VisaResult<()> {
        self.core.begin_close();
        self.channel.shutdown().await;
        self.core.finish_close();
        debug!(resource = %self.core.resource(), "TCP/IP transport closed");
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

    async fn clear(&mut self) -> VisaResult<()> {
        self.core.ensure_open()?;
        self.channel.discard()
    }
}
