//! SCPI conveniences layered over any [`Transport`]

use async_trait::async_trait;
use tracing::warn;

use super::Transport;
use crate::codec::block::{array_to_binary, binary_to_array, encode_block, ByteOrder, DataType, NumericArray};
use crate::codec::scpi::{parse_error, parse_idn, Identity, ScpiErrorEntry};
use crate::codec::ascii::parse_ascii_values;
use crate::error::{VisaError, VisaResult};

/// Upper bound on `:SYST:ERR?` polls, in case an instrument never reports "No error".
pub const MAX_ERROR_QUEUE_READS: usize = 64;

/// SCPI conveniences available on every [`Transport`].
#[async_trait]
pub trait ScpiTransportExt: Transport {
    /// Send `command` and read the IEEE-488.2 binary block it returns.
    ///
    /// The terminator following a definite-length block is consumed when
    /// present.
    ///
    /// # Errors
    /// [`VisaError::Protocol`] when the response does not start with a block header.
    async fn query_binary_block(&mut self, command: &str) -> VisaResult<Vec<u8>> {
        self.write(command).await?;

        let prefix = self.read_bytes(2).await?;
        if prefix[0] != b'#' || !prefix[1].is_ascii_digit() {
            return Err(VisaError::Protocol(format!(
                "expected binary block header, got {:?}",
                String::from_utf8_lossy(&prefix)
            )));
        }

        let digits = usize::from(prefix[1] - b'0');
        if digits == 0 {
            // Indefinite block: everything up to the closing newline, and no further.
            return self.read_until(b"\n").await;
        }

        let length_digits = self.read_bytes(digits).await?;
        let length = std::str::from_utf8(&length_digits)
            .ok()
            .and_then(|s| s.parse::<usize>().ok())
            .ok_or_else(|| {
                VisaError::Protocol(format!(
                    "invalid block length {:?}",
                    String::from_utf8_lossy(&length_digits)
                ))
            })?;
        let data = self.read_bytes(length).await?;

        let terminator = self.settings().read_termination.clone();
        if !terminator.is_empty() {
            match self.read_bytes(terminator.len()).await {
                Ok(trailer) if trailer == terminator.as_bytes() => {}
                Ok(trailer) => warn!(
                    resource = %self.resource_name(),
                    trailer = ?trailer,
                    "Unexpected bytes after binary block"
                ),
                Err(e) if e.is_timeout() => {}
                Err(e) => return Err(e),
            }
        }
        Ok(data)
    }

    /// Send `command` and decode the returned block as an array of `datatype`.
    async fn query_binary_values(
        &mut self,
        command: &str,
        datatype: DataType,
        order: ByteOrder,
    ) -> VisaResult<NumericArray> {
        let block = self.query_binary_block(command).await?;
        if block.len() % datatype.size() != 0 {
            warn!(
                resource = %self.resource_name(),
                bytes = block.len(),
                element = datatype.size(),
                "Block length is not a multiple of the element size, trailing bytes dropped"
            );
        }
        Ok(binary_to_array(&block, datatype, order))
    }

    /// Send `command` and parse a comma or whitespace separated numeric reply.
    async fn query_ascii_values(&mut self, command: &str) -> VisaResult<Vec<f64>> {
        let response = self.query(command, None).await?;
        Ok(parse_ascii_values(&response))
    }

    /// `*IDN?`
    async fn identify(&mut self) -> VisaResult<Identity> {
        let response = self.query("*IDN?", None).await?;
        parse_idn(&response)
    }

    /// Read `:SYST:ERR?` until the queue reports no error.
    async fn drain_errors(&mut self) -> VisaResult<Vec<ScpiErrorEntry>> {
        let mut errors = Vec::new();
        for _ in 0..MAX_ERROR_QUEUE_READS {
            let entry = parse_error(&self.query(":SYST:ERR?", None).await?)?;
            if entry.is_no_error() {
                return Ok(errors);
            }
            errors.push(entry);
        }
        warn!(resource = %self.resource_name(), "Error queue did not drain");
        Ok(errors)
    }

    /// Send `prefix` followed by `values` as a definite binary block.
    async fn write_binary_values(
        &mut self,
        prefix: &str,
        values: &NumericArray,
        order: ByteOrder,
    ) -> VisaResult<()> {
        let block = encode_block(&array_to_binary(values, order));
        let terminator = self.settings().write_termination.clone();
        let mut payload = Vec::with_capacity(prefix.len() + block.len() + terminator.len());
        payload.extend_from_slice(prefix.as_bytes());
        payload.extend_from_slice(&block);
        payload.extend_from_slice(terminator.as_bytes());
        self.write_raw(&payload).await.map(|_| ())
    }
}

impl<T: Transport + ?Sized> ScpiTransportExt for T {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TransportSettings;
    use crate::transport::simulated::{HandlerReply, SimulatedTransport};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    async fn open(handler: impl Fn(&str) -> HandlerReply + Send + Sync + 'static) -> SimulatedTransport {
        let mut transport =
            SimulatedTransport::new("SIM::scope::INSTR", Arc::new(handler), TransportSettings::default());
        transport.open().await.unwrap();
        transport
    }

    #[tokio::test]
    async fn test_binary_block_query() {
        let mut transport = open(|cmd: &str| match cmd {
            "CURV?" => HandlerReply::respond("#15hello"),
            _ => HandlerReply::unmatched(),
        })
        .await;
        assert_eq!(transport.query_binary_block("CURV?").await.unwrap(), b"hello");
        // The trailing terminator was consumed.
        assert!(transport.read_raw(None).await.is_err());
    }

    #[tokio::test]
    async fn test_indefinite_block_query() {
        let mut transport = open(|cmd: &str| match cmd {
            "CURV?" => HandlerReply::respond("#0abc"),
            _ => HandlerReply::unmatched(),
        })
        .await;
        assert_eq!(transport.query_binary_block("CURV?").await.unwrap(), b"abc");
    }

    #[tokio::test]
    async fn test_indefinite_block_leaves_next_reply() {
        // The instrument answers with the block and an `*OPC?` reply back to back.
        let mut transport = open(|cmd: &str| match cmd {
            "CURV?" => HandlerReply::respond("#0abc\n1"),
            _ => HandlerReply::unmatched(),
        })
        .await;
        assert_eq!(transport.query_binary_block("CURV?").await.unwrap(), b"abc");
        assert_eq!(transport.read().await.unwrap(), "1");
    }

    #[tokio::test]
    async fn test_binary_values_query() {
        let mut transport = open(|cmd: &str| match cmd {
            "WAV:DATA?" => HandlerReply::respond("#14\u{1}\u{2}\u{3}\u{4}"),
            _ => HandlerReply::unmatched(),
        })
        .await;
        let values = transport
            .query_binary_values("WAV:DATA?", DataType::UInt8, ByteOrder::Little)
            .await
            .unwrap();
        assert_eq!(values, NumericArray::U8(vec![1, 2, 3, 4]));
    }

    #[tokio::test]
    async fn test_non_block_response_rejected() {
        let mut transport = open(|_: &str| HandlerReply::respond("1.0,2.0")).await;
        let err = transport.query_binary_block("CURV?").await.unwrap_err();
        assert!(matches!(err, VisaError::Protocol(_)));
    }

    #[tokio::test]
    async fn test_ascii_values_and_identity() {
        let mut transport = open(|cmd: &str| match cmd {
            "TRAC?" => HandlerReply::respond("1.5, 2.5,3.5"),
            "*IDN?" => HandlerReply::respond("ACME,SCOPE,42,2.1"),
            _ => HandlerReply::unmatched(),
        })
        .await;
        assert_eq!(transport.query_ascii_values("TRAC?").await.unwrap(), vec![1.5, 2.5, 3.5]);
        assert_eq!(transport.identify().await.unwrap().model, "SCOPE");
    }

    #[tokio::test]
    async fn test_drain_errors_stops_at_no_error() {
        let reads = Arc::new(AtomicUsize::new(0));
        let counter = reads.clone();
        let mut transport = open(move |cmd: &str| match cmd {
            ":SYST:ERR?" => match counter.fetch_add(1, Ordering::SeqCst) {
                0 => HandlerReply::respond("-113,\"Undefined header\""),
                1 => HandlerReply::respond("-222,\"Data out of range\""),
                _ => HandlerReply::respond("0,\"No error\""),
            },
            _ => HandlerReply::unmatched(),
        })
        .await;

        let errors = transport.drain_errors().await.unwrap();
        assert_eq!(errors.len(), 2);
        assert_eq!(errors[1].code, -222);
        assert_eq!(reads.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_write_binary_values_sends_block() {
        let seen = Arc::new(std::sync::Mutex::new(String::new()));
        let sink = seen.clone();
        let mut transport = open(move |cmd: &str| {
            *sink.lock().unwrap() = cmd.to_string();
            HandlerReply::ack()
        })
        .await;

        transport
            .write_binary_values("DATA:DAC ", &NumericArray::U8(vec![0x41, 0x42]), ByteOrder::Little)
            .await
            .unwrap();
        assert_eq!(seen.lock().unwrap().as_str(), "DATA:DAC #12AB");
    }
}
