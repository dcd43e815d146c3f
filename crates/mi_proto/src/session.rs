//! Wire form of a 1:1 ratchet message.
//!
//! `MIRM || ver(1) || flags(1) || [x3dh init block] || dh_pub(32) ||
//!  u64 n || u64 pn || nonce_prefix(8) || bytes cipher`
//!
//! Flag bit 0 marks a session-initiating message and prepends the X3DH
//! block: `ik_sig(32) || ik_dh(32) || ek(32) || opk_index(1, 0xFF = none)
//! || bytes kem_ct`. Everything else is the ratchet header the receiver
//! needs to advance, plus the sealed envelope.

use mi_crypto::ratchet::RatchetHeader;
use mi_crypto::x3dh::X3dhHeader;

use crate::wire::{self, WireError};

pub const SESSION_MAGIC: [u8; 4] = *b"MIRM";
pub const SESSION_VERSION: u8 = 1;

const FLAG_HAS_X3DH: u8 = 0x01;
const OPK_NONE: u8 = 0xFF;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RatchetMessage {
    /// Present only on the first message of a session.
    pub x3dh: Option<X3dhHeader>,
    pub header: RatchetHeader,
    pub cipher: Vec<u8>,
}

impl RatchetMessage {
    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        let x3dh_len = self
            .x3dh
            .as_ref()
            .map_or(0, |h| 32 + 32 + 32 + 1 + 4 + h.kem_ct.len());
        let mut out =
            Vec::with_capacity(4 + 1 + 1 + x3dh_len + 32 + 8 + 8 + 8 + 4 + self.cipher.len());
        out.extend_from_slice(&SESSION_MAGIC);
        out.push(SESSION_VERSION);
        out.push(if self.x3dh.is_some() { FLAG_HAS_X3DH } else { 0 });
        if let Some(x3dh) = &self.x3dh {
            out.extend_from_slice(&x3dh.ik_sig_pub);
            out.extend_from_slice(&x3dh.ik_dh_pub);
            out.extend_from_slice(&x3dh.ek_pub);
            out.push(x3dh.opk_index.unwrap_or(OPK_NONE));
            wire::put_bytes(&x3dh.kem_ct, &mut out)?;
        }
        out.extend_from_slice(&self.header.dh_pub);
        wire::put_u64(self.header.n, &mut out);
        wire::put_u64(self.header.pn, &mut out);
        out.extend_from_slice(&self.header.nonce_prefix);
        wire::put_bytes(&self.cipher, &mut out)?;
        Ok(out)
    }

    pub fn decode(payload: &[u8]) -> Result<Self, WireError> {
        if payload.len() < 6 || payload[..4] != SESSION_MAGIC {
            return Err(WireError::Invalid);
        }
        if payload[4] != SESSION_VERSION {
            return Err(WireError::Invalid);
        }
        let flags = payload[5];
        let mut off = 6usize;

        let x3dh = if flags & FLAG_HAS_X3DH != 0 {
            let ik_sig_pub = wire::get_fixed::<32>(payload, &mut off)?;
            let ik_dh_pub = wire::get_fixed::<32>(payload, &mut off)?;
            let ek_pub = wire::get_fixed::<32>(payload, &mut off)?;
            let opk = wire::get_u8(payload, &mut off)?;
            let kem_ct = wire::get_bytes(payload, &mut off)?;
            Some(X3dhHeader {
                ik_sig_pub,
                ik_dh_pub,
                ek_pub,
                opk_index: (opk != OPK_NONE).then_some(opk),
                kem_ct,
            })
        } else {
            None
        };

        let dh_pub = wire::get_fixed::<32>(payload, &mut off)?;
        let n = wire::get_u64(payload, &mut off)?;
        let pn = wire::get_u64(payload, &mut off)?;
        let nonce_prefix = wire::get_fixed::<8>(payload, &mut off)?;
        let cipher = wire::get_bytes(payload, &mut off)?;
        if off != payload.len() {
            return Err(WireError::Invalid);
        }
        Ok(Self {
            x3dh,
            header: RatchetHeader { dh_pub, n, pn, nonce_prefix },
            cipher,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header() -> RatchetHeader {
        RatchetHeader {
            dh_pub: [3; 32],
            n: 7,
            pn: 2,
            nonce_prefix: [9; 8],
        }
    }

    #[test]
    fn plain_message_roundtrip() {
        let msg = RatchetMessage {
            x3dh: None,
            header: header(),
            cipher: vec![1, 2, 3],
        };
        let bytes = msg.encode().unwrap();
        assert_eq!(RatchetMessage::decode(&bytes).unwrap(), msg);
    }

    #[test]
    fn init_message_roundtrip() {
        let msg = RatchetMessage {
            x3dh: Some(X3dhHeader {
                ik_sig_pub: [1; 32],
                ik_dh_pub: [2; 32],
                ek_pub: [3; 32],
                opk_index: Some(0),
                kem_ct: vec![7; 1088],
            }),
            header: header(),
            cipher: vec![4, 5],
        };
        let bytes = msg.encode().unwrap();
        assert_eq!(RatchetMessage::decode(&bytes).unwrap(), msg);

        // Without an OPK the sentinel survives the roundtrip as None.
        let msg2 = RatchetMessage {
            x3dh: Some(X3dhHeader {
                ik_sig_pub: [1; 32],
                ik_dh_pub: [2; 32],
                ek_pub: [3; 32],
                opk_index: None,
                kem_ct: vec![7; 1088],
            }),
            ..msg
        };
        let bytes = msg2.encode().unwrap();
        assert_eq!(RatchetMessage::decode(&bytes).unwrap(), msg2);
    }

    #[test]
    fn malformed_rejects() {
        let msg = RatchetMessage {
            x3dh: None,
            header: header(),
            cipher: vec![1],
        };
        let bytes = msg.encode().unwrap();
        assert!(RatchetMessage::decode(&bytes[..bytes.len() - 1]).is_err());
        let mut bad = bytes.clone();
        bad[4] = 2;
        assert!(RatchetMessage::decode(&bad).is_err());
        let mut long = bytes;
        long.push(0);
        assert!(RatchetMessage::decode(&long).is_err());
    }
}
