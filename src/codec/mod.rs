//! Stateless codecs for instrument payloads
//!
//! - `block` - IEEE-488.2 binary blocks and typed numeric arrays
//! - `ascii` - separator-delimited ASCII numeric arrays
//! - `scpi` - SCPI scalars, `*IDN?` and `:SYST:ERR?` grammars

pub mod ascii;
pub mod block;
pub mod scpi;

pub use ascii::{parse_ascii_values, parse_ascii_values_with, Separator};
pub use block::{
    array_to_binary, binary_to_array, create_block_header, decode_block, encode_block,
    parse_block_header, BlockHeader, ByteOrder, DataType, NumericArray,
};
pub use scpi::{parse_bool, parse_error, parse_idn, parse_number, Identity, ScpiErrorEntry};
