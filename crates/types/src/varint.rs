// Path: crates/types/src/varint.rs

//! Varint encoding in the protobuf wire format.
//!
//! Unsigned varints back every length prefix in the KV log and commit info
//! files; zigzag varints appear only in the node hash preimage.

use crate::error::StoreError;
use prost::encoding::{decode_varint, encode_varint};

/// Appends `value` as an unsigned varint.
pub fn put_uvarint(buf: &mut Vec<u8>, value: u64) {
    encode_varint(value, buf);
}

/// Appends `value` as a zigzag-encoded signed varint.
pub fn put_varint(buf: &mut Vec<u8>, value: i64) {
    let zigzag = ((value << 1) ^ (value >> 63)) as u64;
    encode_varint(zigzag, buf);
}

/// Appends `bytes` prefixed with its unsigned varint length.
pub fn put_bytes(buf: &mut Vec<u8>, bytes: &[u8]) {
    put_uvarint(buf, bytes.len() as u64);
    buf.extend_from_slice(bytes);
}

/// Reads an unsigned varint from the front of `cursor`, advancing it.
pub fn read_uvarint(cursor: &mut &[u8]) -> Result<u64, StoreError> {
    decode_varint(cursor).map_err(|e| StoreError::Decode(format!("varint: {e}")))
}

/// Reads a length-prefixed byte string from the front of `cursor`.
pub fn read_bytes<'a>(cursor: &mut &'a [u8]) -> Result<&'a [u8], StoreError> {
    let len = read_uvarint(cursor)?;
    let len = usize::try_from(len)
        .map_err(|_| StoreError::Decode(format!("length {len} overflows usize")))?;
    take(cursor, len)
}

/// Splits `n` bytes off the front of `cursor`.
pub fn take<'a>(cursor: &mut &'a [u8], n: usize) -> Result<&'a [u8], StoreError> {
    if cursor.len() < n {
        return Err(StoreError::Decode(format!(
            "unexpected end of input: wanted {n} bytes, have {}",
            cursor.len()
        )));
    }
    let (head, tail) = cursor.split_at(n);
    *cursor = tail;
    Ok(head)
}
