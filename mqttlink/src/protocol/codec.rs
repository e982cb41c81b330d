//! MQTT packet encoding/decoding primitives.
//!
//! Low-level helpers for the remaining-length integer, big-endian `u16`,
//! length-prefixed strings and the fixed header.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};

/// Largest value a 4-byte remaining length can carry.
pub const MAX_REMAINING_LENGTH: u32 = 268_435_455;

/// Longest string/binary field a 2-byte length prefix can describe.
pub const MAX_STRING_LENGTH: usize = u16::MAX as usize;

/// Parsed fixed header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedHeader {
    /// High nibble of the first byte (raw, may be a type this client ignores).
    pub packet_type: u8,
    /// Low nibble of the first byte.
    pub flags: u8,
    /// Body length following the header.
    pub remaining_length: u32,
    /// Bytes occupied by the header itself (1 + remaining-length bytes).
    pub header_length: usize,
}

impl FixedHeader {
    /// Header plus body length.
    pub fn frame_length(&self) -> usize {
        self.header_length + self.remaining_length as usize
    }
}

/// Read a variable-length integer (remaining length encoding).
///
/// Returns `(value, bytes_consumed)`, or `None` when no terminating byte is
/// found within the available bytes (at most 4 are examined). `None` means
/// "wait for more data", never "malformed".
pub fn read_variable_int(buf: &[u8]) -> Option<(u32, usize)> {
    let mut multiplier = 1u32;
    let mut value = 0u32;

    for (i, &byte) in buf.iter().take(4).enumerate() {
        value += (byte & 0x7F) as u32 * multiplier;

        if byte & 0x80 == 0 {
            return Some((value, i + 1));
        }

        multiplier *= 128;
    }

    None
}

/// Write a variable-length integer.
///
/// Returns the number of bytes written. Values above
/// [`MAX_REMAINING_LENGTH`] would need a fifth byte and are rejected.
pub fn write_variable_int(buf: &mut BytesMut, mut value: u32) -> Result<usize> {
    if value > MAX_REMAINING_LENGTH {
        return Err(Error::PacketTooLarge(value as usize));
    }

    let mut written = 0;
    loop {
        let mut byte = (value % 128) as u8;
        value /= 128;

        if value > 0 {
            byte |= 0x80;
        }

        buf.put_u8(byte);
        written += 1;

        if value == 0 {
            break;
        }
    }

    Ok(written)
}

/// Calculate the number of bytes needed for a variable-length integer.
pub const fn variable_int_len(value: u32) -> usize {
    if value < 128 {
        1
    } else if value < 128 * 128 {
        2
    } else if value < 128 * 128 * 128 {
        3
    } else {
        4
    }
}

/// Read a 2-byte big-endian u16.
pub fn read_u16(buf: &[u8]) -> Option<u16> {
    if buf.len() < 2 {
        return None;
    }
    Some(u16::from_be_bytes([buf[0], buf[1]]))
}

/// Read a UTF-8 string (2-byte length prefix + data).
///
/// Invalid UTF-8 is replaced rather than rejected.
pub fn read_string(buf: &[u8]) -> Option<(String, usize)> {
    let len = read_u16(buf)? as usize;

    if buf.len() < 2 + len {
        return None;
    }

    let s = String::from_utf8_lossy(&buf[2..2 + len]).into_owned();
    Some((s, 2 + len))
}

/// Write a UTF-8 string (2-byte length prefix + data).
///
/// The prefix is the UTF-8 byte length, not the character count.
pub fn write_string(buf: &mut BytesMut, s: &str) -> Result<()> {
    write_binary(buf, s.as_bytes())
}

/// Write binary data (2-byte length prefix + data).
pub fn write_binary(buf: &mut BytesMut, data: &[u8]) -> Result<()> {
    if data.len() > MAX_STRING_LENGTH {
        return Err(Error::StringTooLong(data.len()));
    }

    buf.put_u16(data.len() as u16);
    buf.put_slice(data);
    Ok(())
}

/// Encoded size of a length-prefixed field.
pub const fn string_len(len: usize) -> usize {
    2 + len
}

/// Parse a fixed header from the front of `buf`.
///
/// Returns `None` until the first byte and a terminated remaining length
/// are available.
pub fn read_fixed_header(buf: &[u8]) -> Option<FixedHeader> {
    let (&first_byte, rest) = buf.split_first()?;
    let (remaining_length, var_len) = read_variable_int(rest)?;

    Some(FixedHeader {
        packet_type: first_byte >> 4,
        flags: first_byte & 0x0F,
        remaining_length,
        header_length: 1 + var_len,
    })
}

/// Write a fixed header.
pub fn write_fixed_header(
    buf: &mut BytesMut,
    packet_type: u8,
    flags: u8,
    remaining_length: usize,
) -> Result<usize> {
    if remaining_length > MAX_REMAINING_LENGTH as usize {
        return Err(Error::PacketTooLarge(remaining_length));
    }

    buf.put_u8((packet_type << 4) | (flags & 0x0F));
    let var_len = write_variable_int(buf, remaining_length as u32)?;

    Ok(1 + var_len)
}

/// Split the next complete frame off the front of `buf`.
///
/// Returns the header and the body (without the header). The buffer is
/// advanced past the whole frame. When the header or body is still partial
/// the buffer is left untouched and `None` is returned.
pub fn take_frame(buf: &mut BytesMut) -> Option<(FixedHeader, Bytes)> {
    if buf.len() < 2 {
        return None;
    }

    let header = read_fixed_header(buf)?;
    if buf.len() < header.frame_length() {
        return None;
    }

    let mut frame = buf.split_to(header.frame_length());
    let body = frame.split_off(header.header_length).freeze();
    Some((header, body))
}

#[cfg(test)]
mod tests {
    use super::*;

    const BOUNDARIES: [(u32, usize); 8] = [
        (0, 1),
        (127, 1),
        (128, 2),
        (16_383, 2),
        (16_384, 3),
        (2_097_151, 3),
        (2_097_152, 4),
        (268_435_455, 4),
    ];

    #[test]
    fn test_variable_int_boundaries() {
        for (value, expected_len) in BOUNDARIES {
            let mut buf = BytesMut::new();
            let written = write_variable_int(&mut buf, value).unwrap();
            assert_eq!(written, expected_len, "length for {value}");
            assert_eq!(variable_int_len(value), expected_len);

            let (decoded, consumed) = read_variable_int(&buf).unwrap();
            assert_eq!(decoded, value);
            assert_eq!(consumed, written);
        }
    }

    #[test]
    fn test_variable_int_known_bytes() {
        let mut buf = BytesMut::new();
        write_variable_int(&mut buf, 321).unwrap();
        assert_eq!(&buf[..], &[0xC1, 0x02]);

        buf.clear();
        write_variable_int(&mut buf, 268_435_455).unwrap();
        assert_eq!(&buf[..], &[0xFF, 0xFF, 0xFF, 0x7F]);
    }

    #[test]
    fn test_variable_int_too_large() {
        let mut buf = BytesMut::new();
        let err = write_variable_int(&mut buf, 268_435_456).unwrap_err();
        assert!(matches!(err, Error::PacketTooLarge(268_435_456)));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_variable_int_incomplete() {
        assert_eq!(read_variable_int(&[]), None);
        assert_eq!(read_variable_int(&[0x80]), None);
        assert_eq!(read_variable_int(&[0xFF, 0xFF, 0xFF]), None);
        // Four continuation bytes never terminate; still "incomplete".
        assert_eq!(read_variable_int(&[0xFF, 0xFF, 0xFF, 0xFF, 0x01]), None);
    }

    #[test]
    fn test_u16() {
        assert_eq!(read_u16(&[0x12, 0x34]), Some(0x1234));
        assert_eq!(read_u16(&[0x12]), None);
    }

    #[test]
    fn test_string_roundtrip() {
        for s in ["", "hello", "温度/传感器", "ünïcödé ✓"] {
            let mut buf = BytesMut::new();
            write_string(&mut buf, s).unwrap();
            assert_eq!(read_u16(&buf).unwrap() as usize, s.len());
            assert_eq!(buf.len(), string_len(s.len()));

            let (decoded, consumed) = read_string(&buf).unwrap();
            assert_eq!(decoded, s);
            assert_eq!(consumed, buf.len());
        }
    }

    #[test]
    fn test_string_prefix_is_byte_length() {
        let mut buf = BytesMut::new();
        write_string(&mut buf, "é").unwrap();
        assert_eq!(&buf[..], &[0x00, 0x02, 0xC3, 0xA9]);
    }

    #[test]
    fn test_string_too_long() {
        let long = "x".repeat(MAX_STRING_LENGTH + 1);
        let mut buf = BytesMut::new();
        let err = write_string(&mut buf, &long).unwrap_err();
        assert!(matches!(err, Error::StringTooLong(65536)));

        let max = "x".repeat(MAX_STRING_LENGTH);
        assert!(write_string(&mut buf, &max).is_ok());
    }

    #[test]
    fn test_fixed_header() {
        let mut buf = BytesMut::new();
        let len = write_fixed_header(&mut buf, 3, 0x0B, 200).unwrap();
        assert_eq!(len, 3);

        let header = read_fixed_header(&buf).unwrap();
        assert_eq!(header.packet_type, 3);
        assert_eq!(header.flags, 0x0B);
        assert_eq!(header.remaining_length, 200);
        assert_eq!(header.header_length, 3);
        assert_eq!(header.frame_length(), 203);
    }

    #[test]
    fn test_take_frame_waits_for_body() {
        let mut buf = BytesMut::from(&[0x90, 0x03, 0x00][..]);
        assert!(take_frame(&mut buf).is_none());
        assert_eq!(buf.len(), 3);

        buf.extend_from_slice(&[0x01, 0x00, 0xD0]);
        let (header, body) = take_frame(&mut buf).unwrap();
        assert_eq!(header.packet_type, 9);
        assert_eq!(&body[..], &[0x00, 0x01, 0x00]);
        // Next frame's first byte stays buffered.
        assert_eq!(&buf[..], &[0xD0]);
    }
}
