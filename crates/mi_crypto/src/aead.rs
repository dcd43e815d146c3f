//! Authenticated Encryption with Associated Data
//!
//! Uses XChaCha20-Poly1305 (192-bit nonce).
//! Key size: 32 bytes.  Nonce: 24 bytes.  Tag: 16 bytes.
//!
//! Two forms are exposed:
//!   - *attached*: `[ nonce (24) | ciphertext + tag ]`, random nonce — used
//!     for self-contained payloads (device-sync events, trust blobs).
//!   - *detached*: caller supplies the nonce and receives `(ciphertext, mac)`
//!     separately — used by every chained format (ratchet messages, group
//!     cipher, file blob chunks, the session channel) where the nonce is
//!     derived from a counter and the MAC has its own wire slot.

use chacha20poly1305::{
    aead::{Aead, AeadCore, AeadInPlace, KeyInit, OsRng as AeadOsRng, Payload},
    XChaCha20Poly1305, XNonce,
};
use zeroize::Zeroizing;

use crate::error::CryptoError;

pub const KEY_BYTES: usize = 32;
pub const NONCE_BYTES: usize = 24;
pub const MAC_BYTES: usize = 16;

fn cipher(key: &[u8; KEY_BYTES]) -> Result<XChaCha20Poly1305, CryptoError> {
    XChaCha20Poly1305::new_from_slice(key).map_err(|_| CryptoError::AeadEncrypt)
}

// ── Attached form ────────────────────────────────────────────────────────────

/// Encrypt `plaintext`, prepending a random 24-byte nonce.
pub fn encrypt(key: &[u8; KEY_BYTES], plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher = cipher(key)?;
    let nonce = XChaCha20Poly1305::generate_nonce(&mut AeadOsRng);
    let ciphertext = cipher
        .encrypt(&nonce, Payload { msg: plaintext, aad })
        .map_err(|_| CryptoError::AeadEncrypt)?;

    let mut out = Vec::with_capacity(NONCE_BYTES + ciphertext.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Decrypt wire-format bytes (nonce || ciphertext+tag).
pub fn decrypt(
    key: &[u8; KEY_BYTES],
    data: &[u8],
    aad: &[u8],
) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    if data.len() < NONCE_BYTES + MAC_BYTES {
        return Err(CryptoError::AeadDecrypt);
    }
    let (nonce_bytes, ct) = data.split_at(NONCE_BYTES);
    let nonce = XNonce::from_slice(nonce_bytes);
    let cipher = cipher(key)?;
    let plaintext = cipher
        .decrypt(nonce, Payload { msg: ct, aad })
        .map_err(|_| CryptoError::AeadDecrypt)?;
    Ok(Zeroizing::new(plaintext))
}

// ── Detached form ────────────────────────────────────────────────────────────

/// Seal with a caller-supplied nonce. Returns (ciphertext, mac).
pub fn seal_detached(
    key: &[u8; KEY_BYTES],
    nonce: &[u8; NONCE_BYTES],
    plaintext: &[u8],
    aad: &[u8],
) -> Result<(Vec<u8>, [u8; MAC_BYTES]), CryptoError> {
    let cipher = cipher(key)?;
    let mut buf = plaintext.to_vec();
    let tag = cipher
        .encrypt_in_place_detached(XNonce::from_slice(nonce), aad, &mut buf)
        .map_err(|_| CryptoError::AeadEncrypt)?;
    Ok((buf, tag.into()))
}

/// Open a detached ciphertext. Returns the plaintext, wiped on drop.
pub fn open_detached(
    key: &[u8; KEY_BYTES],
    nonce: &[u8; NONCE_BYTES],
    ciphertext: &[u8],
    mac: &[u8; MAC_BYTES],
    aad: &[u8],
) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    let cipher = cipher(key)?;
    let mut buf = Zeroizing::new(ciphertext.to_vec());
    cipher
        .decrypt_in_place_detached(
            XNonce::from_slice(nonce),
            aad,
            buf.as_mut_slice(),
            mac.into(),
        )
        .map_err(|_| CryptoError::AeadDecrypt)?;
    Ok(buf)
}

/// Seal with a caller-supplied nonce, tag appended (nonce NOT included).
pub fn seal_with_nonce(
    key: &[u8; KEY_BYTES],
    nonce: &[u8; NONCE_BYTES],
    plaintext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let cipher = cipher(key)?;
    cipher
        .encrypt(XNonce::from_slice(nonce), Payload { msg: plaintext, aad })
        .map_err(|_| CryptoError::AeadEncrypt)
}

/// Open a ciphertext sealed by [`seal_with_nonce`].
pub fn open_with_nonce(
    key: &[u8; KEY_BYTES],
    nonce: &[u8; NONCE_BYTES],
    data: &[u8],
    aad: &[u8],
) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    let cipher = cipher(key)?;
    let plaintext = cipher
        .decrypt(XNonce::from_slice(nonce), Payload { msg: data, aad })
        .map_err(|_| CryptoError::AeadDecrypt)?;
    Ok(Zeroizing::new(plaintext))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attached_roundtrip() {
        let key = [7u8; 32];
        let ct = encrypt(&key, b"hello", b"ad").unwrap();
        let pt = decrypt(&key, &ct, b"ad").unwrap();
        assert_eq!(pt.as_slice(), b"hello");
    }

    #[test]
    fn attached_rejects_wrong_aad() {
        let key = [7u8; 32];
        let ct = encrypt(&key, b"hello", b"ad").unwrap();
        assert!(decrypt(&key, &ct, b"other").is_err());
    }

    #[test]
    fn detached_roundtrip_and_tamper() {
        let key = [1u8; 32];
        let nonce = [2u8; 24];
        let (ct, mac) = seal_detached(&key, &nonce, b"payload", b"hdr").unwrap();
        let pt = open_detached(&key, &nonce, &ct, &mac, b"hdr").unwrap();
        assert_eq!(pt.as_slice(), b"payload");

        let mut bad = ct.clone();
        bad[0] ^= 1;
        assert!(open_detached(&key, &nonce, &bad, &mac, b"hdr").is_err());
    }

    #[test]
    fn nonce_changes_ciphertext() {
        let key = [9u8; 32];
        let a = seal_with_nonce(&key, &[0u8; 24], b"x", b"").unwrap();
        let b = seal_with_nonce(&key, &[1u8; 24], b"x", b"").unwrap();
        assert_ne!(a, b);
        let pt = open_with_nonce(&key, &[0u8; 24], &a, b"").unwrap();
        assert_eq!(pt.as_slice(), b"x");
    }
}
