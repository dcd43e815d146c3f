//! The authenticated channel above the transport.
//!
//! After login both sides hold the server-issued key material. It expands
//! (HKDF, label `mi_e2ee_channel_v1`) into one 32-byte AEAD key and two
//! 16-byte nonce bases, one per direction, so the two monotonic sequence
//! counters can never collide on a nonce.
//!
//! Request layout: `frame = header(type) || string(token) ||
//! AEAD(key, nonce = dir_base || u64_le(seq), ad = type, plaintext)`.
//!
//! `send_seq` starts at 0 at login and only ever increments; overflow is an
//! error, not a rollover. The response token is compared in constant time;
//! a mismatch (or a `Logout`-typed response) invalidates the session.

use subtle::ConstantTimeEq;
use zeroize::{Zeroize, Zeroizing};

use mi_crypto::{aead, kdf};
use mi_proto::wire::FrameType;

use crate::error::{CoreError, Result};

pub struct SecureChannel {
    key: [u8; 32],
    send_base: [u8; 16],
    recv_base: [u8; 16],
    send_seq: u64,
    recv_seq: u64,
}

impl Drop for SecureChannel {
    fn drop(&mut self) {
        self.key.zeroize();
        self.send_base.zeroize();
        self.recv_base.zeroize();
    }
}

fn direction_nonce(base: &[u8; 16], seq: u64) -> [u8; 24] {
    let mut nonce = [0u8; 24];
    nonce[..16].copy_from_slice(base);
    nonce[16..].copy_from_slice(&seq.to_le_bytes());
    nonce
}

impl SecureChannel {
    /// Expand the login key material into the channel secrets.
    pub fn from_material(material: &[u8]) -> Result<Self> {
        if material.is_empty() {
            return Err(CoreError::Auth("channel key material empty".into()));
        }
        let mut okm = Zeroizing::new([0u8; 64]);
        kdf::hkdf_expand(material, None, b"mi_e2ee_channel_v1", okm.as_mut())?;
        let mut key = [0u8; 32];
        let mut send_base = [0u8; 16];
        let mut recv_base = [0u8; 16];
        key.copy_from_slice(&okm[..32]);
        send_base.copy_from_slice(&okm[32..48]);
        recv_base.copy_from_slice(&okm[48..64]);
        Ok(Self {
            key,
            send_base,
            recv_base,
            send_seq: 0,
            recv_seq: 0,
        })
    }

    pub fn send_seq(&self) -> u64 {
        self.send_seq
    }

    /// Encrypt one request body, consuming the next send sequence number.
    pub fn encrypt(&mut self, frame_type: FrameType, plain: &[u8]) -> Result<Vec<u8>> {
        let seq = self.send_seq;
        self.send_seq = self
            .send_seq
            .checked_add(1)
            .ok_or_else(|| CoreError::State("channel send sequence overflow".into()))?;
        let nonce = direction_nonce(&self.send_base, seq);
        Ok(aead::seal_with_nonce(&self.key, &nonce, plain, &[frame_type as u8])?)
    }

    /// Decrypt one response body, consuming the next receive sequence number.
    /// The counter does not advance on a failed open, so a lost or corrupt
    /// response cannot desynchronize the replay guard.
    pub fn decrypt(&mut self, frame_type: FrameType, cipher: &[u8]) -> Result<Vec<u8>> {
        let seq = self.recv_seq;
        let next = seq
            .checked_add(1)
            .ok_or_else(|| CoreError::State("channel recv sequence overflow".into()))?;
        let nonce = direction_nonce(&self.recv_base, seq);
        let plain = aead::open_with_nonce(&self.key, &nonce, cipher, &[frame_type as u8])?;
        self.recv_seq = next;
        Ok(plain.to_vec())
    }

    /// Constant-time token equality, for the response echo check.
    pub fn token_matches(expected: &str, received: &str) -> bool {
        expected.as_bytes().ct_eq(received.as_bytes()).into()
    }
}

/// Server-side mirror of the channel, used by loopback tests: the server
/// decrypts with the client's send direction and encrypts with its recv
/// direction.
#[cfg(test)]
pub struct ServerChannel {
    inner: SecureChannel,
}

#[cfg(test)]
impl ServerChannel {
    pub fn from_material(material: &[u8]) -> Result<Self> {
        Ok(Self {
            inner: SecureChannel::from_material(material)?,
        })
    }

    pub fn decrypt_request(&mut self, frame_type: FrameType, cipher: &[u8]) -> Result<Vec<u8>> {
        let seq = self.inner.send_seq;
        self.inner.send_seq += 1;
        let nonce = direction_nonce(&self.inner.send_base, seq);
        let plain = aead::open_with_nonce(&self.inner.key, &nonce, cipher, &[frame_type as u8])?;
        Ok(plain.to_vec())
    }

    pub fn encrypt_response(&mut self, frame_type: FrameType, plain: &[u8]) -> Result<Vec<u8>> {
        let seq = self.inner.recv_seq;
        self.inner.recv_seq += 1;
        let nonce = direction_nonce(&self.inner.recv_base, seq);
        Ok(aead::seal_with_nonce(&self.inner.key, &nonce, plain, &[frame_type as u8])?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_response_roundtrip() {
        let material = b"login-material";
        let mut client = SecureChannel::from_material(material).unwrap();
        let mut server = ServerChannel::from_material(material).unwrap();

        for i in 0..5u8 {
            let request = client.encrypt(FrameType::Heartbeat, &[i]).unwrap();
            let seen = server.decrypt_request(FrameType::Heartbeat, &request).unwrap();
            assert_eq!(seen, [i]);

            let response = server.encrypt_response(FrameType::Heartbeat, &[i, i]).unwrap();
            let got = client.decrypt(FrameType::Heartbeat, &response).unwrap();
            assert_eq!(got, [i, i]);
        }
        assert_eq!(client.send_seq(), 5);
    }

    #[test]
    fn replayed_response_rejected() {
        let material = b"m";
        let mut client = SecureChannel::from_material(material).unwrap();
        let mut server = ServerChannel::from_material(material).unwrap();

        let _ = client.encrypt(FrameType::Heartbeat, b"a").unwrap();
        let r1 = server.encrypt_response(FrameType::Heartbeat, b"one").unwrap();
        assert_eq!(client.decrypt(FrameType::Heartbeat, &r1).unwrap(), b"one");

        // Replaying the same ciphertext hits a new nonce and fails.
        assert!(client.decrypt(FrameType::Heartbeat, &r1).is_err());
    }

    #[test]
    fn failed_decrypt_does_not_advance_recv_seq() {
        let material = b"m";
        let mut client = SecureChannel::from_material(material).unwrap();
        let mut server = ServerChannel::from_material(material).unwrap();

        assert!(client.decrypt(FrameType::Heartbeat, b"garbage").is_err());
        let r = server.encrypt_response(FrameType::Heartbeat, b"real").unwrap();
        assert_eq!(client.decrypt(FrameType::Heartbeat, &r).unwrap(), b"real");
    }

    #[test]
    fn frame_type_is_bound_as_ad() {
        let material = b"m";
        let mut client = SecureChannel::from_material(material).unwrap();
        let mut server = ServerChannel::from_material(material).unwrap();

        let _ = client.encrypt(FrameType::Heartbeat, b"x").unwrap();
        let r = server.encrypt_response(FrameType::Heartbeat, b"y").unwrap();
        assert!(client.decrypt(FrameType::Logout, &r).is_err());
    }

    #[test]
    fn direction_separation() {
        // Same material, seq 0 in both directions: nonces must differ.
        let c = SecureChannel::from_material(b"m").unwrap();
        assert_ne!(
            direction_nonce(&c.send_base, 0),
            direction_nonce(&c.recv_base, 0)
        );
    }

    #[test]
    fn token_compare() {
        assert!(SecureChannel::token_matches("tok", "tok"));
        assert!(!SecureChannel::token_matches("tok", "tok2"));
        assert!(!SecureChannel::token_matches("tok", "kot"));
    }
}
