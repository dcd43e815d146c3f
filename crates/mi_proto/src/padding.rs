//! Size-bucket padding for envelope plaintexts.
//!
//! Before AEAD encryption, a chat envelope is wrapped as
//!
//!   `MIPD || u32_le(plain_len) || plaintext || random_tail`
//!
//! and padded to the smallest bucket in {256, 512, 1024, 2048, 4096, 8192,
//! 16384} that holds header + plaintext; anything larger rounds up to the
//! next 4 KiB multiple. The tail is CSPRNG output, not zeros.
//!
//! Unpadding is tolerant: a buffer without the magic is returned verbatim,
//! so pre-padding peers keep interoperating.

use rand::{rngs::OsRng, RngCore};

use crate::wire::WireError;

pub const PAD_MAGIC: [u8; 4] = *b"MIPD";
pub const PAD_HEADER_BYTES: usize = 8;
pub const PAD_BUCKETS: [usize; 7] = [256, 512, 1024, 2048, 4096, 8192, 16384];

/// The padded length for a given `header + plaintext` length.
pub fn pad_target(min_len: usize) -> usize {
    for bucket in PAD_BUCKETS {
        if bucket >= min_len {
            return bucket;
        }
    }
    min_len.div_ceil(4096) * 4096
}

pub fn pad_payload(plain: &[u8]) -> Result<Vec<u8>, WireError> {
    if plain.len() > u32::MAX as usize {
        return Err(WireError::Oversize);
    }
    let target = pad_target(PAD_HEADER_BYTES + plain.len());
    let mut out = Vec::with_capacity(target);
    out.extend_from_slice(&PAD_MAGIC);
    out.extend_from_slice(&(plain.len() as u32).to_le_bytes());
    out.extend_from_slice(plain);
    if out.len() < target {
        let start = out.len();
        out.resize(target, 0);
        OsRng.fill_bytes(&mut out[start..]);
    }
    Ok(out)
}

pub fn unpad_payload(padded: &[u8]) -> Result<Vec<u8>, WireError> {
    if padded.len() < PAD_HEADER_BYTES || padded[..4] != PAD_MAGIC {
        return Ok(padded.to_vec());
    }
    let len = u32::from_le_bytes(padded[4..8].try_into().unwrap()) as usize;
    let end = PAD_HEADER_BYTES.checked_add(len).ok_or(WireError::Invalid)?;
    if end > padded.len() {
        return Err(WireError::Invalid);
    }
    Ok(padded[PAD_HEADER_BYTES..end].to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_payload_lands_in_first_bucket() {
        let padded = pad_payload(b"hello").unwrap();
        assert_eq!(padded.len(), 256);
        assert_eq!(unpad_payload(&padded).unwrap(), b"hello");
    }

    #[test]
    fn bucket_ladder() {
        for (plain_len, expect) in [
            (0usize, 256usize),
            (248, 256),
            (249, 512),
            (1000, 1024),
            (5000, 8192),
            (16376, 16384),
        ] {
            let padded = pad_payload(&vec![0xAB; plain_len]).unwrap();
            assert_eq!(padded.len(), expect, "plain_len={plain_len}");
        }
    }

    #[test]
    fn oversize_rounds_to_next_4k() {
        // 8 + 20000 = 20008 → next 4 KiB multiple is 20480.
        let padded = pad_payload(&[0u8; 20_000]).unwrap();
        assert_eq!(padded.len(), 20_480);
        assert_eq!(unpad_payload(&padded).unwrap().len(), 20_000);
    }

    #[test]
    fn unpad_without_magic_is_verbatim() {
        let raw = b"no magic here".to_vec();
        assert_eq!(unpad_payload(&raw).unwrap(), raw);
    }

    #[test]
    fn corrupt_length_rejected() {
        let mut padded = pad_payload(b"x").unwrap();
        padded[4..8].copy_from_slice(&u32::MAX.to_le_bytes());
        assert!(unpad_payload(&padded).is_err());
    }
}
