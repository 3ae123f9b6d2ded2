//! Hardware-free transport driven by a command handler (`SIM::{name}::INSTR`)
//!
//! Every command written is passed to the handler; its replies are queued,
//! each followed by the read terminator, and handed out by later reads. A read
//! with nothing queued times out immediately.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::BytesMut;
use tracing::{debug, trace};

use super::{find_subsequence, LinkCore, Transport};
use crate::config::TransportSettings;
use crate::error::{VisaError, VisaResult};

/// Result of handing one command to a [`CommandHandler`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct HandlerReply {
    /// Whether the handler recognised the command
    pub matched: bool,
    /// Response to queue for the next read, if any
    pub response: Option<String>,
}

impl HandlerReply {
    /// Recognised command without output.
    pub fn ack() -> Self {
        Self {
            matched: true,
            response: None,
        }
    }

    /// Recognised command producing `response`.
    pub fn respond(response: impl Into<String>) -> Self {
        Self {
            matched: true,
            response: Some(response.into()),
        }
    }

    /// Command not recognised.
    pub fn unmatched() -> Self {
        Self::default()
    }
}

/// Produces replies for commands sent to a simulated device.
pub trait CommandHandler: Send + Sync {
    /// Answer one command, without its write terminator.
    fn handle(&self, command: &str) -> HandlerReply;
}

impl<F> CommandHandler for F
where
    F: Fn(&str) -> HandlerReply + Send + Sync,
{
    fn handle(&self, command: &str) -> HandlerReply {
        self(command)
    }
}

/// In-memory transport answered by a [`CommandHandler`].
pub struct SimulatedTransport {
    core: LinkCore,
    handler: Arc<dyn CommandHandler>,
    output: BytesMut,
}

impl SimulatedTransport {
    /// Closed transport for `resource`, answered by `handler`.
    pub fn new(resource: impl Into<String>, handler: Arc<dyn CommandHandler>, settings: TransportSettings) -> Self {
        Self {
            core: LinkCore::new(resource, settings, false),
            handler,
            output: BytesMut::new(),
        }
    }

    fn nothing_queued(&self) -> VisaError {
        VisaError::Timeout(self.core.timeout())
    }
}

#[async_trait]
impl Transport for SimulatedTransport {
    fn core(&self) -> &LinkCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut LinkCore {
        &mut self.core
    }

    async fn open(&mut self) -> VisaResult<()> {
        self.core.begin_open()?;
        self.output.clear();
        self.core.finish_open(Ok(()))?;
        debug!(resource = %self.core.resource(), "Simulated transport opened");
        Ok(())
    }

    async fn close(&mut self) -> VisaResult<()> {
        self.core.begin_close();
        self.output.clear();
        self.core.finish_close();
        Ok(())
    }

    async fn write_raw(&mut self, data: &[u8]) -> VisaResult<usize> {
        self.core.ensure_open()?;
        let text = String::from_utf8_lossy(data);
        let write_term = self.core.settings().write_termination.clone();
        let read_term = self.core.settings().read_termination.clone();

        let commands: Vec<&str> = if write_term.is_empty() {
            vec![text.as_ref()]
        } else {
            text.split(write_term.as_str()).collect()
        };
        for command in commands.into_iter().map(str::trim).filter(|c| !c.is_empty()) {
            let reply = self.handler.handle(command);
            if !reply.matched {
                debug!(resource = %self.core.resource(), command, "Simulated device ignored command");
                continue;
            }
            trace!(resource = %self.core.resource(), command, response = ?reply.response, "Simulated exchange");
            if let Some(response) = reply.response {
                self.output.extend_from_slice(response.as_bytes());
                self.output.extend_from_slice(read_term.as_bytes());
            }
        }
        Ok(data.len())
    }

    async fn read_raw(&mut self, max_size: Option<usize>) -> VisaResult<Vec<u8>> {
        self.core.ensure_open()?;
        if self.output.is_empty() {
            return self.core.record(Err(self.nothing_queued()));
        }
        let n = max_size.unwrap_or(self.output.len()).min(self.output.len());
        Ok(self.output.split_to(n).to_vec())
    }

    async fn read_bytes(&mut self, count: usize) -> VisaResult<Vec<u8>> {
        self.core.ensure_open()?;
        if self.output.len() < count {
            return self.core.record(Err(self.nothing_queued()));
        }
        Ok(self.output.split_to(count).to_vec())
    }

    async fn read_until(&mut self, terminator: &[u8]) -> VisaResult<Vec<u8>> {
        self.core.ensure_open()?;
        match find_subsequence(&self.output, terminator) {
            Some(pos) => {
                let mut message = self.output.split_to(pos + terminator.len());
                message.truncate(pos);
                Ok(message.to_vec())
            }
            None => self.core.record(Err(self.nothing_queued())),
        }
    }

    async fn clear(&mut self) -> VisaResult<()> {
        self.core.ensure_open()?;
        self.output.clear();
        Ok(())
    }
}
