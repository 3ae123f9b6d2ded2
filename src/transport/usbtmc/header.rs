//! USB-TMC bulk header framing and protocol constants
//!
//! Every bulk transfer starts with a 12-byte header:
//!
//! ```text
//! 0      msg id
//! 1      bTag (1..=255)
//! 2      !bTag
//! 3      reserved
//! 4..8   transfer size, little-endian, excluding header and padding
//! 8      bmTransferAttributes (bit 0 = EOM)
//! 9..12  reserved
//! ```

use crate::error::{VisaError, VisaResult};

/// Size of a bulk-out or bulk-in header.
pub const HEADER_SIZE: usize = 12;

/// USB class code of test and measurement interfaces.
pub const USBTMC_CLASS: u8 = 0xFE;
/// USB subclass code of USB-TMC interfaces.
pub const USBTMC_SUBCLASS: u8 = 0x03;

/// Bulk message ids.
pub mod msg_id {
    /// Host to device message
    pub const DEV_DEP_MSG_OUT: u8 = 1;
    /// Request for a device to host message
    pub const REQUEST_DEV_DEP_MSG_IN: u8 = 2;
    /// Device to host message
    pub const DEV_DEP_MSG_IN: u8 = 2;
    /// USB488 trigger
    pub const TRIGGER: u8 = 128;
}

/// Class-specific control requests.
pub mod request {
    /// Abort the device input and output buffers
    pub const INITIATE_CLEAR: u8 = 5;
    /// Poll a pending clear
    pub const CHECK_CLEAR_STATUS: u8 = 6;
    /// Read the capability block
    pub const GET_CAPABILITIES: u8 = 7;
    /// USB488 status byte
    pub const READ_STATUS_BYTE: u8 = 128;
}

/// Status byte returned by control requests.
pub mod status {
    /// `STATUS_SUCCESS`
    pub const SUCCESS: u8 = 0x01;
    /// `STATUS_PENDING`
    pub const PENDING: u8 = 0x02;
    /// `STATUS_FAILED`
    pub const FAILED: u8 = 0x80;

    /// Name of a status code for error messages.
    pub fn name(code: u8) -> &'static str {
        match code {
            SUCCESS => "STATUS_SUCCESS",
            PENDING => "STATUS_PENDING",
            FAILED => "STATUS_FAILED",
            0x81 => "STATUS_TRANSFER_NOT_IN_PROGRESS",
            0x82 => "STATUS_SPLIT_NOT_IN_PROGRESS",
            0x83 => "STATUS_SPLIT_IN_PROGRESS",
            _ => "unknown status",
        }
    }
}

/// bmRequestType for class requests to the interface, device-to-host.
pub const REQUEST_TYPE_IN: u8 = 0xA1;

/// Rolling bTag counter: 1, 2, ... 255, 1, ... Never yields 0.
#[derive(Debug, Clone)]
pub struct TagGenerator {
    next: u8,
}

impl Default for TagGenerator {
    fn default() -> Self {
        Self { next: 1 }
    }
}

impl TagGenerator {
    /// Generator whose first tag is 1.
    pub fn new() -> Self {
        Self::default()
    }

    /// Next tag, skipping 0.
    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> u8 {
        let tag = self.next;
        self.next = (tag % 255) + 1;
        tag
    }
}

/// Bulk-out header for `msg_id`.
///
/// For `DEV_DEP_MSG_OUT` the transfer size is the payload length; for
/// `REQUEST_DEV_DEP_MSG_IN` it is the maximum number of bytes the device may send.
pub fn encode_bulk_out_header(msg_id: u8, tag: u8, transfer_size: u32, eom: bool) -> [u8; HEADER_SIZE] {
    let mut header = [0u8; HEADER_SIZE];
    header[0] = msg_id;
    header[1] = tag;
    header[2] = !tag;
    header[4..8].copy_from_slice(&transfer_size.to_le_bytes());
    if eom {
        header[8] = 0x01;
    }
    header
}

/// A complete `DEV_DEP_MSG_OUT` transfer: header, payload and zero padding to a
/// 4-byte boundary.
pub fn encode_dev_dep_msg_out(tag: u8, payload: &[u8], eom: bool) -> Vec<u8> {
    let padded = (payload.len() + 3) & !3;
    let mut transfer = Vec::with_capacity(HEADER_SIZE + padded);
    transfer.extend_from_slice(&encode_bulk_out_header(
        msg_id::DEV_DEP_MSG_OUT,
        tag,
        payload.len() as u32,
        eom,
    ));
    transfer.extend_from_slice(payload);
    transfer.resize(HEADER_SIZE + padded, 0);
    transfer
}

/// Decoded bulk-in header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BulkInHeader {
    /// MsgID
    pub msg_id: u8,
    /// bTag
    pub tag: u8,
    /// bTagInverse
    pub tag_inverse: u8,
    /// Payload bytes in this transfer
    pub transfer_size: u32,
    /// End of message
    pub eom: bool,
}

impl BulkInHeader {
    /// Decode the header at the start of `buf`.
    ///
    /// # Errors
    /// [`VisaError::Protocol`] when `buf` is shorter than [`HEADER_SIZE`].
    pub fn decode(buf: &[u8]) -> VisaResult<Self> {
        if buf.len() < HEADER_SIZE {
            return Err(VisaError::Protocol(format!(
                "bulk-in transfer of {} bytes is shorter than the USB-TMC header",
                buf.len()
            )));
        }
        Ok(Self {
            msg_id: buf[0],
            tag: buf[1],
            tag_inverse: buf[2],
            transfer_size: u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]),
            eom: buf[8] & 0x01 != 0,
        })
    }

    /// Check the header answers a request sent with `expected_tag`.
    pub fn validate(&self, expected_tag: u8, strict: bool) -> VisaResult<()> {
        if self.msg_id != msg_id::DEV_DEP_MSG_IN {
            return Err(VisaError::Protocol(format!(
                "unexpected bulk-in msg id {} (expected {})",
                self.msg_id,
                msg_id::DEV_DEP_MSG_IN
            )));
        }
        if self.tag != expected_tag {
            return Err(VisaError::Protocol(format!(
                "bulk-in tag {} does not match request tag {}",
                self.tag, expected_tag
            )));
        }
        if strict && self.tag_inverse != !self.tag {
            return Err(VisaError::Protocol(format!(
                "bulk-in tag inverse {:#04x} does not match tag {}",
                self.tag_inverse, self.tag
            )));
        }
        Ok(())
    }
}
