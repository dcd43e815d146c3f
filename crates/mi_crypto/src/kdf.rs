//! Key derivation functions
//!
//! Every chain in the system flows through one of these HKDF-SHA256 (or
//! HMAC-SHA256) derivations, each under its own info label so key material
//! never crosses domains:
//!
//!   `mi_e2ee_ratchet_root_v1`        — X3DH + KEM secret → initial root key
//!   `mi_root_key` / `mi_chain_key`   — DH ratchet step
//!   chain constants 0x01 / 0x02      — symmetric ratchet step (Signal style)
//!   `mi_e2ee_group_sender_ck_v1`     — group sender chain, 64-byte split
//!   `mi_e2ee_device_sync_ratchet_v1` — device-sync key ratchet
//!   `mi_e2ee_media_root_v1`          — per-call media root

use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::error::CryptoError;

type HmacSha256 = Hmac<Sha256>;

/// Expand `ikm` + `info` into `output.len()` bytes of key material.
/// `salt` may be `None` (HKDF uses a zeroed salt).
pub fn hkdf_expand(
    ikm: &[u8],
    salt: Option<&[u8]>,
    info: &[u8],
    output: &mut [u8],
) -> Result<(), CryptoError> {
    let hk = Hkdf::<Sha256>::new(salt, ikm);
    hk.expand(info, output)
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))
}

/// Derive the initial 32-byte ratchet root from the X3DH/KEM secret mix.
pub fn ratchet_root(ikm: &[u8]) -> Result<[u8; 32], CryptoError> {
    let mut key = [0u8; 32];
    hkdf_expand(ikm, Some(&[0u8; 32]), b"mi_e2ee_ratchet_root_v1", &mut key)?;
    Ok(key)
}

/// KDF_RK: mix a DH output into the root key.
/// Returns (new_root_key, new_chain_key).
pub fn kdf_rk(rk: &[u8; 32], dh_output: &[u8]) -> Result<([u8; 32], [u8; 32]), CryptoError> {
    let hk = Hkdf::<Sha256>::new(Some(rk), dh_output);
    let mut new_rk = [0u8; 32];
    let mut ck = [0u8; 32];
    hk.expand(b"mi_root_key", &mut new_rk)
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
    hk.expand(b"mi_chain_key", &mut ck)
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
    Ok((new_rk, ck))
}

/// KDF_CK: chain key → (next_chain_key, message_key).
/// HMAC-based derivation with distinct constants per the Signal spec.
pub fn kdf_ck(ck: &[u8; 32]) -> Result<([u8; 32], [u8; 32]), CryptoError> {
    let mut mac_ck = HmacSha256::new_from_slice(ck)
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
    mac_ck.update(&[0x01]);
    let new_ck: [u8; 32] = mac_ck.finalize().into_bytes().into();

    let mut mac_mk = HmacSha256::new_from_slice(ck)
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
    mac_mk.update(&[0x02]);
    let mk: [u8; 32] = mac_mk.finalize().into_bytes().into();

    Ok((new_ck, mk))
}

/// Group sender chain step: one 64-byte HKDF output split 32/32 into
/// (next_chain_key, message_key).
pub fn group_chain_step(ck: &[u8; 32]) -> Result<([u8; 32], [u8; 32]), CryptoError> {
    let mut buf = [0u8; 64];
    hkdf_expand(ck, None, b"mi_e2ee_group_sender_ck_v1", &mut buf)?;
    let mut next_ck = [0u8; 32];
    let mut mk = [0u8; 32];
    next_ck.copy_from_slice(&buf[..32]);
    mk.copy_from_slice(&buf[32..]);
    Ok((next_ck, mk))
}

/// Device-sync key ratchet: advance the shared key by one counter step.
pub fn device_sync_ratchet(key: &[u8; 32], counter: u64) -> Result<[u8; 32], CryptoError> {
    let mut info = Vec::with_capacity(30 + 8);
    info.extend_from_slice(b"mi_e2ee_device_sync_ratchet_v1");
    info.extend_from_slice(&counter.to_le_bytes());
    let mut out = [0u8; 32];
    hkdf_expand(key, None, &info, &mut out)?;
    Ok(out)
}

/// Per-call media root, bound to the peer session root key and the call id.
pub fn media_root(session_root: &[u8; 32], call_id: &[u8; 16]) -> Result<[u8; 32], CryptoError> {
    let mut info = Vec::with_capacity(21 + 16);
    info.extend_from_slice(b"mi_e2ee_media_root_v1");
    info.extend_from_slice(call_id);
    let mut out = [0u8; 32];
    hkdf_expand(session_root, None, &info, &mut out)?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chain_step_is_deterministic_and_forward_only() {
        let ck = [3u8; 32];
        let (ck1a, mk1a) = kdf_ck(&ck).unwrap();
        let (ck1b, mk1b) = kdf_ck(&ck).unwrap();
        assert_eq!(ck1a, ck1b);
        assert_eq!(mk1a, mk1b);
        assert_ne!(ck1a, ck);
        assert_ne!(ck1a, mk1a);
    }

    #[test]
    fn group_split_halves_differ() {
        let (ck, mk) = group_chain_step(&[5u8; 32]).unwrap();
        assert_ne!(ck, mk);
        // advancing again yields new material
        let (ck2, _) = group_chain_step(&ck).unwrap();
        assert_ne!(ck2, ck);
    }

    #[test]
    fn device_sync_ratchet_depends_on_counter() {
        let k = [1u8; 32];
        assert_ne!(
            device_sync_ratchet(&k, 0).unwrap(),
            device_sync_ratchet(&k, 1).unwrap()
        );
    }
}
