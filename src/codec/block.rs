//! IEEE-488.2 binary blocks and typed numeric arrays
//!
//! Wire format:
//!
//! ```text
//! definite:    #<n><n decimal digits: length><length bytes>
//! indefinite:  #0<bytes>\n
//! ```
//!
//! A definite block's declared length comes from the instrument and is never
//! trusted on its own: [`decode_block`] bounds it by the bytes actually present.

use std::borrow::Cow;

use crate::error::{VisaError, VisaResult};

/// Location of the payload inside a buffer that starts with a block header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeader {
    /// Bytes taken by `#`, the digit count and the length digits.
    pub header_length: usize,
    /// Payload length (declared for definite blocks, measured for indefinite ones).
    pub data_length: usize,
    /// False for `#0` blocks.
    pub definite: bool,
}

/// Parse the header of a binary block at the start of `buf`.
///
/// Returns `None` when `buf` does not start with `#`, the digit-count byte is
/// not an ASCII digit, or `buf` is too short to hold the declared header.
///
/// For indefinite blocks the data length runs to the first `\n` after the
/// header, or to the end of `buf` if no terminator has arrived yet. That
/// fallback cannot tell a complete block from a truncated one; callers reading
/// incrementally must keep reading until they see the terminator.
pub fn parse_block_header(buf: &[u8]) -> Option<BlockHeader> {
    if buf.len() < 2 || buf[0] != b'#' {
        return None;
    }

    match buf[1] {
        b'0' => {
            let data_length = buf[2..]
                .iter()
                .position(|&b| b == b'\n')
                .unwrap_or(buf.len() - 2);
            Some(BlockHeader {
                header_length: 2,
                data_length,
                definite: false,
            })
        }
        digit @ b'1'..=b'9' => {
            let digits = usize::from(digit - b'0');
            let header_length = 2 + digits;
            if buf.len() < header_length {
                return None;
            }
            let length_field = &buf[2..header_length];
            if !length_field.iter().all(u8::is_ascii_digit) {
                return None;
            }
            let data_length = std::str::from_utf8(length_field).ok()?.parse().ok()?;
            Some(BlockHeader {
                header_length,
                data_length,
                definite: true,
            })
        }
        _ => None,
    }
}

/// Definite-form header for a payload of `data_length` bytes, e.g. `#3100`.
pub fn create_block_header(data_length: usize) -> String {
    let digits = data_length.to_string();
    format!("#{}{}", digits.len(), digits)
}

/// Header followed by `data`, ready to be sent after a command prefix.
pub fn encode_block(data: &[u8]) -> Vec<u8> {
    let header = create_block_header(data.len());
    let mut out = Vec::with_capacity(header.len() + data.len());
    out.extend_from_slice(header.as_bytes());
    out.extend_from_slice(data);
    out
}

/// Payload slice of the block at the start of `buf`.
///
/// # Errors
/// [`VisaError::Protocol`] when the header is malformed or a definite block
/// declares more bytes than `buf` holds.
pub fn decode_block(buf: &[u8]) -> VisaResult<&[u8]> {
    let header = parse_block_header(buf)
        .ok_or_else(|| VisaError::Protocol("missing or malformed binary block header".into()))?;
    let start = header.header_length;
    let end = start + header.data_length;
    if end > buf.len() {
        return Err(VisaError::Protocol(format!(
            "binary block declares {} bytes but only {} are available",
            header.data_length,
            buf.len() - start
        )));
    }
    Ok(&buf[start..end])
}

/// Element type of a binary array.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataType {
    /// Signed byte (`b`)
    Int8,
    /// Unsigned byte (`B`)
    UInt8,
    /// `h`
    Int16,
    /// `H`
    UInt16,
    /// `i`
    Int32,
    /// `I`
    UInt32,
    /// IEEE 754 single (`f`)
    Float32,
    /// IEEE 754 double (`d`)
    Float64,
}

impl DataType {
    /// Bytes per element.
    pub fn size(self) -> usize {
        match self {
            DataType::Int8 | DataType::UInt8 => 1,
            DataType::Int16 | DataType::UInt16 => 2,
            DataType::Int32 | DataType::UInt32 | DataType::Float32 => 4,
            DataType::Float64 => 8,
        }
    }
}

/// Byte order of multi-byte elements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ByteOrder {
    /// Most significant byte first
    Big,
    /// Least significant byte first; what most instruments send
    #[default]
    Little,
}

/// Decoded numeric array, kept in its native element type.
#[derive(Debug, Clone, PartialEq)]
pub enum NumericArray {
    /// `i8` elements
    I8(Vec<i8>),
    /// `u8` elements
    U8(Vec<u8>),
    /// `i16` elements
    I16(Vec<i16>),
    /// `u16` elements
    U16(Vec<u16>),
    /// `i32` elements
    I32(Vec<i32>),
    /// `u32` elements
    U32(Vec<u32>),
    /// `f32` elements
    F32(Vec<f32>),
    /// `f64` elements
    F64(Vec<f64>),
}

impl NumericArray {
    /// Element type of this array.
    pub fn data_type(&self) -> DataType {
        match self {
            NumericArray::I8(_) => DataType::Int8,
            NumericArray::U8(_) => DataType::UInt8,
            NumericArray::I16(_) => DataType::Int16,
            NumericArray::U16(_) => DataType::UInt16,
            NumericArray::I32(_) => DataType::Int32,
            NumericArray::U32(_) => DataType::UInt32,
            NumericArray::F32(_) => DataType::Float32,
            NumericArray::F64(_) => DataType::Float64,
        }
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        match self {
            NumericArray::I8(v) => v.len(),
            NumericArray::U8(v) => v.len(),
            NumericArray::I16(v) => v.len(),
            NumericArray::U16(v) => v.len(),
            NumericArray::I32(v) => v.len(),
            NumericArray::U32(v) => v.len(),
            NumericArray::F32(v) => v.len(),
            NumericArray::F64(v) => v.len(),
        }
    }

    /// Returns true if the array holds no elements.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Values as f64, borrowing when the array already is f64.
    pub fn as_f64(&self) -> Cow<'_, [f64]> {
        match self {
            NumericArray::I8(v) => Cow::Owned(v.iter().map(|&x| f64::from(x)).collect()),
            NumericArray::U8(v) => Cow::Owned(v.iter().map(|&x| f64::from(x)).collect()),
            NumericArray::I16(v) => Cow::Owned(v.iter().map(|&x| f64::from(x)).collect()),
            NumericArray::U16(v) => Cow::Owned(v.iter().map(|&x| f64::from(x)).collect()),
            NumericArray::I32(v) => Cow::Owned(v.iter().map(|&x| f64::from(x)).collect()),
            NumericArray::U32(v) => Cow::Owned(v.iter().map(|&x| f64::from(x)).collect()),
            NumericArray::F32(v) => Cow::Owned(v.iter().map(|&x| f64::from(x)).collect()),
            NumericArray::F64(v) => Cow::Borrowed(v.as_slice()),
        }
    }
}

macro_rules! decode_elements {
    ($buf:expr, $order:expr, $ty:ty) => {{
        const SIZE: usize = std::mem::size_of::<$ty>();
        $buf.chunks_exact(SIZE)
            .map(|chunk| {
                let mut raw = [0u8; SIZE];
                raw.copy_from_slice(chunk);
                match $order {
                    ByteOrder::Big => <$ty>::from_be_bytes(raw),
                    ByteOrder::Little => <$ty>::from_le_bytes(raw),
                }
            })
            .collect()
    }};
}

macro_rules! encode_elements {
    ($values:expr, $order:expr) => {{
        $values
            .iter()
            .flat_map(|v| match $order {
                ByteOrder::Big => v.to_be_bytes().to_vec(),
                ByteOrder::Little => v.to_le_bytes().to_vec(),
            })
            .collect()
    }};
}

/// Decode `buf` into `floor(len / element size)` elements; trailing partial
/// bytes are ignored.
pub fn binary_to_array(buf: &[u8], datatype: DataType, order: ByteOrder) -> NumericArray {
    match datatype {
        DataType::Int8 => NumericArray::I8(decode_elements!(buf, order, i8)),
        DataType::UInt8 => NumericArray::U8(buf.to_vec()),
        DataType::Int16 => NumericArray::I16(decode_elements!(buf, order, i16)),
        DataType::UInt16 => NumericArray::U16(decode_elements!(buf, order, u16)),
        DataType::Int32 => NumericArray::I32(decode_elements!(buf, order, i32)),
        DataType::UInt32 => NumericArray::U32(decode_elements!(buf, order, u32)),
        DataType::Float32 => NumericArray::F32(decode_elements!(buf, order, f32)),
        DataType::Float64 => NumericArray::F64(decode_elements!(buf, order, f64)),
    }
}

/// Encode `values` in the given byte order.
pub fn array_to_binary(values: &NumericArray, order: ByteOrder) -> Vec<u8> {
    match values {
        NumericArray::I8(v) => v.iter().map(|&x| x as u8).collect(),
        NumericArray::U8(v) => v.clone(),
        NumericArray::I16(v) => encode_elements!(v, order),
        NumericArray::U16(v) => encode_elements!(v, order),
        NumericArray::I32(v) => encode_elements!(v, order),
        NumericArray::U32(v) => encode_elements!(v, order),
        NumericArray::F32(v) => encode_elements!(v, order),
        NumericArray::F64(v) => encode_elements!(v, order),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_definite_header() {
        assert_eq!(
            parse_block_header(b"#15hello"),
            Some(BlockHeader {
                header_length: 3,
                data_length: 5,
                definite: true
            })
        );

        let mut buf = b"#3100".to_vec();
        buf.extend(std::iter::repeat(0xAA).take(100));
        let header = parse_block_header(&buf).unwrap();
        assert_eq!((header.header_length, header.data_length), (5, 100));
    }

    #[test]
    fn test_indefinite_header() {
        let header = parse_block_header(b"#0hello world\n").unwrap();
        assert_eq!((header.header_length, header.data_length), (2, 11));
        assert!(!header.definite);

        let open_ended = b"#0nodata";
        let header = parse_block_header(open_ended).unwrap();
        assert_eq!(header.data_length, open_ended.len() - 2);
    }

    #[test]
    fn test_rejected_headers() {
        assert_eq!(parse_block_header(b""), None);
        assert_eq!(parse_block_header(b"15hello"), None);
        assert_eq!(parse_block_header(b"#"), None);
        assert_eq!(parse_block_header(b"#A12"), None);
        assert_eq!(parse_block_header(b"#41"), None);
        assert_eq!(parse_block_header(b"#2x5ab"), None);
    }

    #[test]
    fn test_create_header() {
        assert_eq!(create_block_header(5), "#15");
        assert_eq!(create_block_header(100), "#3100");
        assert_eq!(create_block_header(0), "#10");
        assert_eq!(encode_block(b"abc"), b"#13abc".to_vec());
    }

    #[test]
    fn test_decode_block_bounds_declared_length() {
        assert_eq!(decode_block(b"#15hello\n").unwrap(), b"hello");
        let err = decode_block(b"#19abc").unwrap_err();
        assert!(matches!(err, VisaError::Protocol(_)));
    }

    #[test]
    fn test_element_sizes() {
        let sizes: Vec<usize> = [
            DataType::Int8,
            DataType::UInt8,
            DataType::Int16,
            DataType::UInt16,
            DataType::Int32,
            DataType::UInt32,
            DataType::Float32,
            DataType::Float64,
        ]
        .iter()
        .map(|d| d.size())
        .collect();
        assert_eq!(sizes, vec![1, 1, 2, 2, 4, 4, 4, 8]);
    }

    #[test]
    fn test_binary_to_array_byte_order() {
        let buf = [0x01, 0x02, 0xFF, 0xFE];
        assert_eq!(
            binary_to_array(&buf, DataType::UInt16, ByteOrder::Big),
            NumericArray::U16(vec![0x0102, 0xFFFE])
        );
        assert_eq!(
            binary_to_array(&buf, DataType::Int16, ByteOrder::Little),
            NumericArray::I16(vec![0x0201, -257])
        );
    }

    #[test]
    fn test_trailing_partial_element_is_dropped() {
        let mut buf = 1.5f32.to_le_bytes().to_vec();
        buf.extend_from_slice(&[0x00, 0x01, 0x02]);
        let values = binary_to_array(&buf, DataType::Float32, ByteOrder::Little);
        assert_eq!(values, NumericArray::F32(vec![1.5]));
    }

    #[test]
    fn test_array_to_binary() {
        let values = NumericArray::I32(vec![1, -1]);
        assert_eq!(
            array_to_binary(&values, ByteOrder::Big),
            vec![0, 0, 0, 1, 0xFF, 0xFF, 0xFF, 0xFF]
        );
        let doubles = NumericArray::F64(vec![0.25]);
        let bytes = array_to_binary(&doubles, ByteOrder::Little);
        assert_eq!(binary_to_array(&bytes, DataType::Float64, ByteOrder::Little), doubles);
    }

    #[test]
    fn test_as_f64_borrows_f64() {
        let values = NumericArray::F64(vec![1.0, 2.0]);
        assert!(matches!(values.as_f64(), Cow::Borrowed(_)));
        let bytes = NumericArray::I8(vec![-3, 4]);
        assert_eq!(bytes.as_f64().as_ref(), &[-3.0, 4.0]);
    }
}
