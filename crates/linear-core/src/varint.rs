//! Variable-length Integer Encoding (Varint)
//!
//! Segment blocks prefix every value with its length. Instead of always using
//! 8 bytes, a varint uses only as many bytes as needed:
//! - Small numbers (0-127) use just 1 byte
//! - Larger numbers use 2-10 bytes depending on magnitude
//! - Each byte uses 7 bits for data and 1 bit as a "continuation" flag
//!
//! Decoding is checked: blocks come from disk or the network, so a truncated
//! or overlong varint is reported as `InvalidSegment` instead of panicking.

use bytes::{Buf, BufMut};

use crate::{Error, Result};

/// Maximum encoded length of a u64
pub const MAX_VARINT_LEN: usize = 10;

/// Encode an unsigned integer as a varint
pub fn encode_varint_u64(buf: &mut impl BufMut, mut value: u64) {
    loop {
        let mut byte = (value & 0x7F) as u8;
        value >>= 7;

        if value != 0 {
            byte |= 0x80; // Set continuation bit
        }

        buf.put_u8(byte);

        if value == 0 {
            break;
        }
    }
}

/// Number of bytes `value` occupies once encoded
pub fn encoded_len(value: u64) -> usize {
    let bits = 64 - value.leading_zeros() as usize;
    bits.max(1).div_ceil(7)
}

/// Decode a varint to an unsigned integer
pub fn decode_varint_u64(buf: &mut impl Buf) -> Result<u64> {
    let mut value: u64 = 0;
    let mut shift = 0;

    loop {
        if !buf.has_remaining() {
            return Err(Error::InvalidSegment("truncated varint".to_string()));
        }
        let byte = buf.get_u8();

        if shift == 63 && byte > 1 {
            return Err(Error::InvalidSegment("varint overflows u64".to_string()));
        }
        value |= ((byte & 0x7F) as u64) << shift;

        if (byte & 0x80) == 0 {
            return Ok(value);
        }

        shift += 7;
        if shift > 63 {
            return Err(Error::InvalidSegment("varint too long".to_string()));
        }
    }
}
