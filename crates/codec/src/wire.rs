//! Varint and field-level primitives shared by all message bodies.
//!
//! Integers travel as LEB128 varints (7 bits per byte, little-endian
//! continuation). Structured bodies use `(field << 3) | wire_type` keys so
//! that readers can skip fields they do not know about.

use bytes::{BufMut, BytesMut};

use crate::Error;

pub const VARINT: u8 = 0;
pub const FIXED64: u8 = 1;
pub const LEN: u8 = 2;
pub const FIXED32: u8 = 5;

/// Append a LEB128 varint.
///
/// # Test
///
/// ```
/// use bytes::BytesMut;
/// use bithorde_codec::wire;
///
/// let mut buf = BytesMut::new();
///
/// wire::put_uvarint(&mut buf, 1);
/// wire::put_uvarint(&mut buf, 300);
///
/// assert_eq!(&buf[..], &[0x01, 0xac, 0x02]);
/// ```
pub fn put_uvarint(buf: &mut BytesMut, mut value: u64) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;

        if value == 0 {
            buf.put_u8(byte);
            return;
        }

        buf.put_u8(byte | 0x80);
    }
}

/// Read a LEB128 varint, advancing the cursor past it.
///
/// # Test
///
/// ```
/// use bithorde_codec::wire;
///
/// let mut bytes: &[u8] = &[0xac, 0x02, 0xff];
///
/// assert_eq!(wire::get_uvarint(&mut bytes).unwrap(), 300);
/// assert_eq!(bytes, &[0xff]);
/// ```
pub fn get_uvarint(buf: &mut &[u8]) -> Result<u64, Error> {
    match try_get_uvarint(buf)? {
        Some(value) => Ok(value),
        None => Err(Error::InvalidInput),
    }
}

/// Like [`get_uvarint`], but distinguishes "more bytes needed" (`None`) from
/// malformed input. The cursor is only advanced on a complete varint.
pub fn try_get_uvarint(buf: &mut &[u8]) -> Result<Option<u64>, Error> {
    let mut value = 0u64;
    let mut shift = 0u32;

    for (index, &byte) in buf.iter().enumerate() {
        // A u64 holds at most ten varint bytes, and the tenth may only carry
        // a single payload bit.
        if shift == 63 && byte & 0x7e != 0 {
            return Err(Error::InvalidInput);
        }

        value |= ((byte & 0x7f) as u64) << shift;
        if byte & 0x80 == 0 {
            *buf = &buf[index + 1..];
            return Ok(Some(value));
        }

        shift += 7;
        if shift > 63 {
            return Err(Error::InvalidInput);
        }
    }

    Ok(None)
}

/// Read a field key, returning `(field_number, wire_type)`.
pub fn get_key(buf: &mut &[u8]) -> Result<(u32, u8), Error> {
    let key = get_uvarint(buf)?;
    let field = u32::try_from(key >> 3).map_err(|_| Error::InvalidInput)?;
    Ok((field, (key & 0x7) as u8))
}

/// Read a varint value narrowed to u32.
pub fn get_u32(buf: &mut &[u8]) -> Result<u32, Error> {
    u32::try_from(get_uvarint(buf)?).map_err(|_| Error::InvalidInput)
}

/// Read a length-delimited value, returning the payload slice.
pub fn get_len<'a>(buf: &mut &'a [u8]) -> Result<&'a [u8], Error> {
    let size = usize::try_from(get_uvarint(buf)?).map_err(|_| Error::InvalidInput)?;
    if buf.len() < size {
        return Err(Error::InvalidInput);
    }

    let (head, rest) = buf.split_at(size);
    *buf = rest;
    Ok(head)
}

/// Skip over one value of the given wire type.
pub fn skip(buf: &mut &[u8], wire_type: u8) -> Result<(), Error> {
    match wire_type {
        VARINT => get_uvarint(buf).map(|_| ()),
        LEN => get_len(buf).map(|_| ()),
        FIXED64 => take(buf, 8),
        FIXED32 => take(buf, 4),
        _ => Err(Error::InvalidInput),
    }
}

fn take(buf: &mut &[u8], size: usize) -> Result<(), Error> {
    if buf.len() < size {
        return Err(Error::InvalidInput);
    }

    *buf = &buf[size..];
    Ok(())
}

fn put_key(buf: &mut BytesMut, field: u32, wire_type: u8) {
    put_uvarint(buf, ((field as u64) << 3) | wire_type as u64);
}

/// Append a varint field.
pub fn put_varint(buf: &mut BytesMut, field: u32, value: u64) {
    put_key(buf, field, VARINT);
    put_uvarint(buf, value);
}

/// Append a length-delimited field.
pub fn put_len(buf: &mut BytesMut, field: u32, value: &[u8]) {
    put_key(buf, field, LEN);
    put_uvarint(buf, value.len() as u64);
    buf.extend_from_slice(value);
}

/// Append an embedded message field, encoded through `body`.
pub fn put_message(buf: &mut BytesMut, field: u32, body: impl FnOnce(&mut BytesMut)) {
    let mut scratch = BytesMut::new();
    body(&mut scratch);
    put_len(buf, field, &scratch);
}
