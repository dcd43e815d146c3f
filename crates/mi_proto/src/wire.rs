//! Wire primitives and the server frame header.
//!
//! All integers are little-endian and fixed-width. A `string` is
//! `u16 len || bytes` (UTF-8, at most 65535 bytes). A `bytes` field is
//! `u32 len || bytes`. A server frame is `type(u8) || payload_len(u32) ||
//! payload`.
//!
//! Readers take `(data, &mut offset)` and never move the offset past
//! `data.len()`; on short or malformed input they return [`WireError`]
//! and leave the offset where it was.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    #[error("invalid wire data")]
    Invalid,
    #[error("value too large for wire encoding")]
    Oversize,
}

pub const MAX_STRING_BYTES: usize = 0xFFFF;
pub const FRAME_HEADER_BYTES: usize = 5;

// ── Frame types ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    Login = 1,
    Logout = 2,
    Heartbeat = 3,
    DeviceList = 4,
    DeviceKick = 5,
    PreKeyPublish = 6,
    PreKeyFetch = 7,
    Encrypted = 8,
}

impl TryFrom<u8> for FrameType {
    type Error = WireError;

    fn try_from(v: u8) -> Result<Self, WireError> {
        Ok(match v {
            1 => Self::Login,
            2 => Self::Logout,
            3 => Self::Heartbeat,
            4 => Self::DeviceList,
            5 => Self::DeviceKick,
            6 => Self::PreKeyPublish,
            7 => Self::PreKeyFetch,
            8 => Self::Encrypted,
            _ => return Err(WireError::Invalid),
        })
    }
}

// ── Writers ──────────────────────────────────────────────────────────────────

pub fn put_u16(v: u16, out: &mut Vec<u8>) {
    out.extend_from_slice(&v.to_le_bytes());
}

pub fn put_u32(v: u32, out: &mut Vec<u8>) {
    out.extend_from_slice(&v.to_le_bytes());
}

pub fn put_u64(v: u64, out: &mut Vec<u8>) {
    out.extend_from_slice(&v.to_le_bytes());
}

pub fn put_string(s: &str, out: &mut Vec<u8>) -> Result<(), WireError> {
    if s.len() > MAX_STRING_BYTES {
        return Err(WireError::Oversize);
    }
    put_u16(s.len() as u16, out);
    out.extend_from_slice(s.as_bytes());
    Ok(())
}

pub fn put_bytes(b: &[u8], out: &mut Vec<u8>) -> Result<(), WireError> {
    if b.len() > u32::MAX as usize {
        return Err(WireError::Oversize);
    }
    put_u32(b.len() as u32, out);
    out.extend_from_slice(b);
    Ok(())
}

// ── Readers ──────────────────────────────────────────────────────────────────

pub fn get_u8(data: &[u8], offset: &mut usize) -> Result<u8, WireError> {
    if *offset >= data.len() {
        return Err(WireError::Invalid);
    }
    let v = data[*offset];
    *offset += 1;
    Ok(v)
}

pub fn get_u16(data: &[u8], offset: &mut usize) -> Result<u16, WireError> {
    let end = offset.checked_add(2).ok_or(WireError::Invalid)?;
    if end > data.len() {
        return Err(WireError::Invalid);
    }
    let v = u16::from_le_bytes(data[*offset..end].try_into().unwrap());
    *offset = end;
    Ok(v)
}

pub fn get_u32(data: &[u8], offset: &mut usize) -> Result<u32, WireError> {
    let end = offset.checked_add(4).ok_or(WireError::Invalid)?;
    if end > data.len() {
        return Err(WireError::Invalid);
    }
    let v = u32::from_le_bytes(data[*offset..end].try_into().unwrap());
    *offset = end;
    Ok(v)
}

pub fn get_u64(data: &[u8], offset: &mut usize) -> Result<u64, WireError> {
    let end = offset.checked_add(8).ok_or(WireError::Invalid)?;
    if end > data.len() {
        return Err(WireError::Invalid);
    }
    let v = u64::from_le_bytes(data[*offset..end].try_into().unwrap());
    *offset = end;
    Ok(v)
}

pub fn get_string(data: &[u8], offset: &mut usize) -> Result<String, WireError> {
    let mut probe = *offset;
    let len = get_u16(data, &mut probe)? as usize;
    let end = probe.checked_add(len).ok_or(WireError::Invalid)?;
    if end > data.len() {
        return Err(WireError::Invalid);
    }
    let s = std::str::from_utf8(&data[probe..end]).map_err(|_| WireError::Invalid)?;
    *offset = end;
    Ok(s.to_string())
}

pub fn get_bytes(data: &[u8], offset: &mut usize) -> Result<Vec<u8>, WireError> {
    let mut probe = *offset;
    let len = get_u32(data, &mut probe)? as usize;
    let end = probe.checked_add(len).ok_or(WireError::Invalid)?;
    if end > data.len() {
        return Err(WireError::Invalid);
    }
    let out = data[probe..end].to_vec();
    *offset = end;
    Ok(out)
}

pub fn get_fixed<const N: usize>(data: &[u8], offset: &mut usize) -> Result<[u8; N], WireError> {
    let end = offset.checked_add(N).ok_or(WireError::Invalid)?;
    if end > data.len() {
        return Err(WireError::Invalid);
    }
    let out: [u8; N] = data[*offset..end].try_into().unwrap();
    *offset = end;
    Ok(out)
}

// ── Frames ───────────────────────────────────────────────────────────────────

pub fn encode_frame(frame_type: FrameType, payload: &[u8]) -> Result<Vec<u8>, WireError> {
    if payload.len() > u32::MAX as usize {
        return Err(WireError::Oversize);
    }
    let mut out = Vec::with_capacity(FRAME_HEADER_BYTES + payload.len());
    out.push(frame_type as u8);
    put_u32(payload.len() as u32, &mut out);
    out.extend_from_slice(payload);
    Ok(out)
}

pub fn decode_frame_header(data: &[u8]) -> Result<(FrameType, u32), WireError> {
    if data.len() < FRAME_HEADER_BYTES {
        return Err(WireError::Invalid);
    }
    let frame_type = FrameType::try_from(data[0])?;
    let payload_len = u32::from_le_bytes(data[1..5].try_into().unwrap());
    Ok((frame_type, payload_len))
}

/// Decode a complete frame; the payload length must match exactly.
pub fn decode_frame(data: &[u8]) -> Result<(FrameType, &[u8]), WireError> {
    let (frame_type, payload_len) = decode_frame_header(data)?;
    let expected = FRAME_HEADER_BYTES
        .checked_add(payload_len as usize)
        .ok_or(WireError::Invalid)?;
    if data.len() != expected {
        return Err(WireError::Invalid);
    }
    Ok((frame_type, &data[FRAME_HEADER_BYTES..]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn primitive_roundtrips() {
        let mut out = Vec::new();
        put_u32(0xDEADBEEF, &mut out);
        put_u64(0x0102030405060708, &mut out);
        put_string("hello", &mut out).unwrap();
        put_bytes(&[1, 2, 3], &mut out).unwrap();

        let mut off = 0;
        assert_eq!(get_u32(&out, &mut off).unwrap(), 0xDEADBEEF);
        assert_eq!(get_u64(&out, &mut off).unwrap(), 0x0102030405060708);
        assert_eq!(get_string(&out, &mut off).unwrap(), "hello");
        assert_eq!(get_bytes(&out, &mut off).unwrap(), vec![1, 2, 3]);
        assert_eq!(off, out.len());
    }

    #[test]
    fn short_input_leaves_offset_untouched() {
        let data = [0x01u8, 0x02];
        let mut off = 0;
        assert_eq!(get_u32(&data, &mut off), Err(WireError::Invalid));
        assert_eq!(off, 0);

        // String whose declared length overruns the buffer.
        let mut bad = Vec::new();
        put_u16(10, &mut bad);
        bad.extend_from_slice(b"abc");
        let mut off = 0;
        assert_eq!(get_string(&bad, &mut off), Err(WireError::Invalid));
        assert_eq!(off, 0);
    }

    #[test]
    fn string_length_cap() {
        let big = "x".repeat(MAX_STRING_BYTES + 1);
        let mut out = Vec::new();
        assert_eq!(put_string(&big, &mut out), Err(WireError::Oversize));
    }

    #[test]
    fn frame_roundtrip_and_shape_checks() {
        let frame = encode_frame(FrameType::Login, b"payload").unwrap();
        assert_eq!(frame.len(), FRAME_HEADER_BYTES + 7);
        let (t, p) = decode_frame(&frame).unwrap();
        assert_eq!(t, FrameType::Login);
        assert_eq!(p, b"payload");

        // Truncated and oversized frames reject.
        assert!(decode_frame(&frame[..frame.len() - 1]).is_err());
        let mut long = frame.clone();
        long.push(0);
        assert!(decode_frame(&long).is_err());

        // Unknown type byte rejects.
        let mut unknown = frame;
        unknown[0] = 0xEE;
        assert!(decode_frame(&unknown).is_err());
    }
}
