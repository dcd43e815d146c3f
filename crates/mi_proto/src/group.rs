//! The `MIGC` group cipher wire format and the group signature messages.
//!
//! A group message is sealed with a sender-chain message key and then framed
//! as
//!
//!   `MIGC || ver(1) || u32 version || u32 iteration || string group_id ||
//!    string sender || bytes nonce(24) || bytes mac(16) || bytes cipher ||
//!    bytes signature`
//!
//! The Ed25519 signature covers every byte before its own length field, so
//! a relay can neither splice ciphertexts between senders nor replay one
//! under different chain coordinates. The AEAD additionally binds
//! `(group, sender, version, iteration)` through its AD.

use crate::wire::{self, WireError};

pub const GROUP_CIPHER_MAGIC: [u8; 4] = *b"MIGC";
pub const GROUP_CIPHER_VERSION: u8 = 1;
pub const GROUP_NONCE_BYTES: usize = 24;
pub const GROUP_MAC_BYTES: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupCipherMessage {
    pub sender_key_version: u32,
    pub sender_key_iteration: u32,
    pub group_id: String,
    pub sender: String,
    pub nonce: [u8; GROUP_NONCE_BYTES],
    pub mac: [u8; GROUP_MAC_BYTES],
    pub cipher: Vec<u8>,
    pub signature: Vec<u8>,
}

impl GroupCipherMessage {
    /// Everything the sender signs: the full frame up to the signature field.
    pub fn signed_bytes(&self) -> Result<Vec<u8>, WireError> {
        let mut out = Vec::with_capacity(
            4 + 1 + 4 + 4 + 2 + self.group_id.len() + 2 + self.sender.len()
                + 4 + GROUP_NONCE_BYTES + 4 + GROUP_MAC_BYTES + 4 + self.cipher.len(),
        );
        out.extend_from_slice(&GROUP_CIPHER_MAGIC);
        out.push(GROUP_CIPHER_VERSION);
        wire::put_u32(self.sender_key_version, &mut out);
        wire::put_u32(self.sender_key_iteration, &mut out);
        wire::put_string(&self.group_id, &mut out)?;
        wire::put_string(&self.sender, &mut out)?;
        wire::put_bytes(&self.nonce, &mut out)?;
        wire::put_bytes(&self.mac, &mut out)?;
        wire::put_bytes(&self.cipher, &mut out)?;
        Ok(out)
    }

    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        let mut out = self.signed_bytes()?;
        wire::put_bytes(&self.signature, &mut out)?;
        Ok(out)
    }

    /// Decode a frame. Also returns the length of the signed span so the
    /// caller can verify `signature` over `payload[..signed_len]`.
    pub fn decode(payload: &[u8]) -> Result<(Self, usize), WireError> {
        if payload.len() < 5 || payload[..4] != GROUP_CIPHER_MAGIC {
            return Err(WireError::Invalid);
        }
        if payload[4] != GROUP_CIPHER_VERSION {
            return Err(WireError::Invalid);
        }
        let mut off = 5usize;
        let sender_key_version = wire::get_u32(payload, &mut off)?;
        let sender_key_iteration = wire::get_u32(payload, &mut off)?;
        let group_id = wire::get_string(payload, &mut off)?;
        let sender = wire::get_string(payload, &mut off)?;
        let nonce_bytes = wire::get_bytes(payload, &mut off)?;
        let mac_bytes = wire::get_bytes(payload, &mut off)?;
        let cipher = wire::get_bytes(payload, &mut off)?;
        let nonce: [u8; GROUP_NONCE_BYTES] =
            nonce_bytes.as_slice().try_into().map_err(|_| WireError::Invalid)?;
        let mac: [u8; GROUP_MAC_BYTES] =
            mac_bytes.as_slice().try_into().map_err(|_| WireError::Invalid)?;
        let signed_len = off;
        let signature = wire::get_bytes(payload, &mut off)?;
        if off != payload.len() {
            return Err(WireError::Invalid);
        }
        Ok((
            Self {
                sender_key_version,
                sender_key_iteration,
                group_id,
                sender,
                nonce,
                mac,
                cipher,
                signature,
            },
            signed_len,
        ))
    }
}

/// AD for the group AEAD:
/// `"MI_GMSG_AD_V1" || string group || string sender || u32 ver || u32 iter`.
pub fn build_group_cipher_ad(
    group_id: &str,
    sender: &str,
    version: u32,
    iteration: u32,
) -> Result<Vec<u8>, WireError> {
    let mut out = Vec::with_capacity(13 + 2 + group_id.len() + 2 + sender.len() + 8);
    out.extend_from_slice(b"MI_GMSG_AD_V1");
    wire::put_string(group_id, &mut out)?;
    wire::put_string(sender, &mut out)?;
    wire::put_u32(version, &mut out);
    wire::put_u32(iteration, &mut out);
    Ok(out)
}

/// Signature message for a sender-key distribution:
/// `"MI_GSKD_V1" || string group || u32 version || u32 iteration || bytes ck`.
pub fn build_sender_key_dist_sig_message(
    group_id: &str,
    version: u32,
    iteration: u32,
    ck: &[u8; 32],
) -> Result<Vec<u8>, WireError> {
    let mut out = Vec::with_capacity(10 + 2 + group_id.len() + 4 + 4 + 4 + 32);
    out.extend_from_slice(b"MI_GSKD_V1");
    wire::put_string(group_id, &mut out)?;
    wire::put_u32(version, &mut out);
    wire::put_u32(iteration, &mut out);
    wire::put_bytes(ck, &mut out)?;
    Ok(out)
}

/// Signature message for a call-key distribution:
/// `"MI_GCKD_V1" || string group || call_id(16) || u32 key_id || bytes key`.
pub fn build_call_key_dist_sig_message(
    group_id: &str,
    call_id: &[u8; 16],
    key_id: u32,
    call_key: &[u8; 32],
) -> Result<Vec<u8>, WireError> {
    let mut out = Vec::with_capacity(10 + 2 + group_id.len() + 16 + 4 + 4 + 32);
    out.extend_from_slice(b"MI_GCKD_V1");
    wire::put_string(group_id, &mut out)?;
    out.extend_from_slice(call_id);
    wire::put_u32(key_id, &mut out);
    wire::put_bytes(call_key, &mut out)?;
    Ok(out)
}
