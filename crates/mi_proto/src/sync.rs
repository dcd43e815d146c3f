//! Device-sync event bodies.
//!
//! Every local action that sibling devices must observe is serialized as one
//! of these events, AEAD-sealed under the device-sync key, and uploaded for
//! server-side fan-out. The bodies are tiny hand-rolled binary records:
//! a type byte, an optional flags byte, then length-prefixed fields.
//!
//! `RotateKey` is special: its body is the raw next 32-byte key, and it is
//! always sealed under the OLD key so draining devices can still follow.

use crate::envelope::MsgId;
use crate::wire::{self, WireError};

pub const EVENT_SEND_PRIVATE: u8 = 1;
pub const EVENT_SEND_GROUP: u8 = 2;
pub const EVENT_MESSAGE: u8 = 3;
pub const EVENT_DELIVERY: u8 = 4;
pub const EVENT_GROUP_NOTICE: u8 = 5;
pub const EVENT_ROTATE_KEY: u8 = 6;
pub const EVENT_HISTORY_SNAPSHOT: u8 = 7;

pub const MAX_HISTORY_ENTRIES: usize = 4096;

const FLAG_IS_GROUP: u8 = 0x01;
const FLAG_OUTGOING: u8 = 0x02;
const FLAG_IS_READ: u8 = 0x02;

const HISTORY_KIND_ENVELOPE: u8 = 1;
const HISTORY_KIND_SYSTEM: u8 = 2;

// ── History snapshot entries ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum HistoryStatus {
    Sending = 0,
    Sent = 1,
    Delivered = 2,
    Read = 3,
    Failed = 4,
}

impl TryFrom<u8> for HistoryStatus {
    type Error = WireError;

    fn try_from(v: u8) -> Result<Self, WireError> {
        Ok(match v {
            0 => Self::Sending,
            1 => Self::Sent,
            2 => Self::Delivered,
            3 => Self::Read,
            4 => Self::Failed,
            _ => return Err(WireError::Invalid),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HistoryBody {
    /// A stored envelope, replayable through the normal decode path.
    Envelope { sender: String, envelope: Vec<u8> },
    /// A locally generated system line (joins, kicks, rotations).
    System { text: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryMessage {
    pub is_group: bool,
    pub outgoing: bool,
    pub status: HistoryStatus,
    pub timestamp_sec: u64,
    pub conv_id: String,
    pub body: HistoryBody,
}

// ── Group notices ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GroupNotice {
    Join { target: String },
    Leave { target: String },
    Kick { target: String },
    RoleSet { target: String, role: u8 },
}

impl GroupNotice {
    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        let (kind, target, role) = match self {
            Self::Join { target } => (1u8, target, None),
            Self::Leave { target } => (2, target, None),
            Self::Kick { target } => (3, target, None),
            Self::RoleSet { target, role } => (4, target, Some(*role)),
        };
        let mut out = Vec::with_capacity(1 + 2 + target.len() + 1);
        out.push(kind);
        wire::put_string(target, &mut out)?;
        if let Some(role) = role {
            out.push(role);
        }
        Ok(out)
    }

    pub fn decode(payload: &[u8]) -> Result<Self, WireError> {
        let mut off = 0usize;
        let kind = wire::get_u8(payload, &mut off)?;
        let target = wire::get_string(payload, &mut off)?;
        let notice = match kind {
            1 => Self::Join { target },
            2 => Self::Leave { target },
            3 => Self::Kick { target },
            4 => Self::RoleSet {
                target,
                role: wire::get_u8(payload, &mut off)?,
            },
            _ => return Err(WireError::Invalid),
        };
        if off != payload.len() {
            return Err(WireError::Invalid);
        }
        Ok(notice)
    }
}

// ── Events ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceSyncEvent {
    /// This device sent a 1:1 envelope; siblings mirror it as outgoing.
    SendPrivate { peer: String, envelope: Vec<u8> },
    /// This device sent a group envelope.
    SendGroup { group_id: String, envelope: Vec<u8> },
    /// An inbound (or mirrored) message for a conversation.
    Message {
        is_group: bool,
        outgoing: bool,
        conv_id: String,
        sender: String,
        envelope: Vec<u8>,
    },
    /// Delivery / read state advanced for one message.
    Delivery {
        is_group: bool,
        is_read: bool,
        conv_id: String,
        msg_id: MsgId,
    },
    /// Membership change observed in a group.
    GroupNotice {
        group_id: String,
        actor: String,
        payload: Vec<u8>,
    },
    /// Install this key after draining in-flight ciphertexts.
    RotateKey { key: [u8; 32] },
    /// Bulk history transfer to a newly linked device.
    HistorySnapshot {
        target_device_id: String,
        history: Vec<HistoryMessage>,
    },
}

impl DeviceSyncEvent {
    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        let mut out = Vec::new();
        match self {
            Self::SendPrivate { peer, envelope } => {
                out.push(EVENT_SEND_PRIVATE);
                wire::put_string(peer, &mut out)?;
                wire::put_bytes(envelope, &mut out)?;
            }
            Self::SendGroup { group_id, envelope } => {
                out.push(EVENT_SEND_GROUP);
                wire::put_string(group_id, &mut out)?;
                wire::put_bytes(envelope, &mut out)?;
            }
            Self::Message { is_group, outgoing, conv_id, sender, envelope } => {
                out.push(EVENT_MESSAGE);
                let mut flags = 0u8;
                if *is_group {
                    flags |= FLAG_IS_GROUP;
                }
                if *outgoing {
                    flags |= FLAG_OUTGOING;
                }
                out.push(flags);
                wire::put_string(conv_id, &mut out)?;
                wire::put_string(sender, &mut out)?;
                wire::put_bytes(envelope, &mut out)?;
            }
            Self::Delivery { is_group, is_read, conv_id, msg_id } => {
                out.push(EVENT_DELIVERY);
                let mut flags = 0u8;
                if *is_group {
                    flags |= FLAG_IS_GROUP;
                }
                if *is_read {
                    flags |= FLAG_IS_READ;
                }
                out.push(flags);
                wire::put_string(conv_id, &mut out)?;
                out.extend_from_slice(msg_id);
            }
            Self::GroupNotice { group_id, actor, payload } => {
                out.push(EVENT_GROUP_NOTICE);
                wire::put_string(group_id, &mut out)?;
                wire::put_string(actor, &mut out)?;
                wire::put_bytes(payload, &mut out)?;
            }
            Self::RotateKey { key } => {
                out.push(EVENT_ROTATE_KEY);
                out.extend_from_slice(key);
            }
            Self::HistorySnapshot { target_device_id, history } => {
                if history.len() > MAX_HISTORY_ENTRIES {
                    return Err(WireError::Oversize);
                }
                out.push(EVENT_HISTORY_SNAPSHOT);
                wire::put_string(target_device_id, &mut out)?;
                wire::put_u32(history.len() as u32, &mut out);
                for msg in history {
                    encode_history_entry(msg, &mut out)?;
                }
            }
        }
        Ok(out)
    }

    pub fn decode(plain: &[u8]) -> Result<Self, WireError> {
        let mut off = 0usize;
        let event_type = wire::get_u8(plain, &mut off)?;
        let event = match event_type {
            EVENT_SEND_PRIVATE => Self::SendPrivate {
                peer: wire::get_string(plain, &mut off)?,
                envelope: wire::get_bytes(plain, &mut off)?,
            },
            EVENT_SEND_GROUP => Self::SendGroup {
                group_id: wire::get_string(plain, &mut off)?,
                envelope: wire::get_bytes(plain, &mut off)?,
            },
            EVENT_MESSAGE => {
                let flags = wire::get_u8(plain, &mut off)?;
                Self::Message {
                    is_group: flags & FLAG_IS_GROUP != 0,
                    outgoing: flags & FLAG_OUTGOING != 0,
                    conv_id: wire::get_string(plain, &mut off)?,
                    sender: wire::get_string(plain, &mut off)?,
                    envelope: wire::get_bytes(plain, &mut off)?,
                }
            }
            EVENT_DELIVERY => {
                let flags = wire::get_u8(plain, &mut off)?;
                Self::Delivery {
                    is_group: flags & FLAG_IS_GROUP != 0,
                    is_read: flags & FLAG_IS_READ != 0,
                    conv_id: wire::get_string(plain, &mut off)?,
                    msg_id: wire::get_fixed::<16>(plain, &mut off)?,
                }
            }
            EVENT_GROUP_NOTICE => Self::GroupNotice {
                group_id: wire::get_string(plain, &mut off)?,
                actor: wire::get_string(plain, &mut off)?,
                payload: wire::get_bytes(plain, &mut off)?,
            },
            EVENT_ROTATE_KEY => Self::RotateKey {
                key: wire::get_fixed::<32>(plain, &mut off)?,
            },
            EVENT_HISTORY_SNAPSHOT => {
                let target_device_id = wire::get_string(plain, &mut off)?;
                let count = wire::get_u32(plain, &mut off)? as usize;
                if count > MAX_HISTORY_ENTRIES {
                    return Err(WireError::Invalid);
                }
                let mut history = Vec::with_capacity(count);
                for _ in 0..count {
                    history.push(decode_history_entry(plain, &mut off)?);
                }
                Self::HistorySnapshot { target_device_id, history }
            }
            _ => return Err(WireError::Invalid),
        };
        if off != plain.len() {
            return Err(WireError::Invalid);
        }
        Ok(event)
    }
}

fn encode_history_entry(msg: &HistoryMessage, out: &mut Vec<u8>) -> Result<(), WireError> {
    if msg.conv_id.is_empty() {
        return Err(WireError::Invalid);
    }
    match &msg.body {
        HistoryBody::Envelope { sender, envelope } => {
            if sender.is_empty() || envelope.is_empty() {
                return Err(WireError::Invalid);
            }
            out.push(HISTORY_KIND_ENVELOPE);
        }
        HistoryBody::System { text } => {
            if text.is_empty() {
                return Err(WireError::Invalid);
            }
            out.push(HISTORY_KIND_SYSTEM);
        }
    }
    let mut flags = 0u8;
    if msg.is_group {
        flags |= FLAG_IS_GROUP;
    }
    if msg.outgoing {
        flags |= FLAG_OUTGOING;
    }
    out.push(flags);
    out.push(msg.status as u8);
    wire::put_u64(msg.timestamp_sec, out);
    wire::put_string(&msg.conv_id, out)?;
    match &msg.body {
        HistoryBody::Envelope { sender, envelope } => {
            wire::put_string(sender, out)?;
            wire::put_bytes(envelope, out)?;
        }
        HistoryBody::System { text } => {
            wire::put_string(text, out)?;
        }
    }
    Ok(())
}

fn decode_history_entry(plain: &[u8], off: &mut usize) -> Result<HistoryMessage, WireError> {
    let kind = wire::get_u8(plain, off)?;
    let flags = wire::get_u8(plain, off)?;
    let status = HistoryStatus::try_from(wire::get_u8(plain, off)?)?;
    let timestamp_sec = wire::get_u64(plain, off)?;
    let conv_id = wire::get_string(plain, off)?;
    if conv_id.is_empty() {
        return Err(WireError::Invalid);
    }
    let body = match kind {
        HISTORY_KIND_ENVELOPE => {
            let sender = wire::get_string(plain, off)?;
            let envelope = wire::get_bytes(plain, off)?;
            if sender.is_empty() || envelope.is_empty() {
                return Err(WireError::Invalid);
            }
            HistoryBody::Envelope { sender, envelope }
        }
        HISTORY_KIND_SYSTEM => {
            let text = wire::get_string(plain, off)?;
            if text.is_empty() {
                return Err(WireError::Invalid);
            }
            HistoryBody::System { text }
        }
        _ => return Err(WireError::Invalid),
    };
    Ok(HistoryMessage {
        is_group: flags & FLAG_IS_GROUP != 0,
        outgoing: flags & FLAG_OUTGOING != 0,
        status,
        timestamp_sec,
        conv_id,
        body,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(event: DeviceSyncEvent) {
        let bytes = event.encode().unwrap();
        assert_eq!(DeviceSyncEvent::decode(&bytes).unwrap(), event);
    }

    #[test]
    fn all_event_kinds_roundtrip() {
        roundtrip(DeviceSyncEvent::SendPrivate {
            peer: "bob".into(),
            envelope: vec![1, 2, 3],
        });
        roundtrip(DeviceSyncEvent::SendGroup {
            group_id: "g".into(),
            envelope: vec![4, 5],
        });
        roundtrip(DeviceSyncEvent::Message {
            is_group: true,
            outgoing: false,
            conv_id: "g".into(),
            sender: "carol".into(),
            envelope: vec![6],
        });
        roundtrip(DeviceSyncEvent::Delivery {
            is_group: false,
            is_read: true,
            conv_id: "bob".into(),
            msg_id: [7; 16],
        });
        roundtrip(DeviceSyncEvent::GroupNotice {
            group_id: "g".into(),
            actor: "admin".into(),
            payload: GroupNotice::Kick { target: "mallory".into() }.encode().unwrap(),
        });
        roundtrip(DeviceSyncEvent::RotateKey { key: [8; 32] });
        roundtrip(DeviceSyncEvent::HistorySnapshot {
            target_device_id: "abcd".into(),
            history: vec![
                HistoryMessage {
                    is_group: false,
                    outgoing: true,
                    status: HistoryStatus::Read,
                    timestamp_sec: 1_700_000_000,
                    conv_id: "bob".into(),
                    body: HistoryBody::Envelope {
                        sender: "me".into(),
                        envelope: vec![9, 9],
                    },
                },
                HistoryMessage {
                    is_group: true,
                    outgoing: false,
                    status: HistoryStatus::Sent,
                    timestamp_sec: 1_700_000_100,
                    conv_id: "g".into(),
                    body: HistoryBody::System { text: "carol joined".into() },
                },
            ],
        });
    }

    #[test]
    fn group_notice_roundtrip_and_validation() {
        for notice in [
            GroupNotice::Join { target: "a".into() },
            GroupNotice::Leave { target: "b".into() },
            GroupNotice::Kick { target: "c".into() },
            GroupNotice::RoleSet { target: "d".into(), role: 2 },
        ] {
            let bytes = notice.encode().unwrap();
            assert_eq!(GroupNotice::decode(&bytes).unwrap(), notice);
        }
        assert!(GroupNotice::decode(&[]).is_err());
        assert!(GroupNotice::decode(&[9, 0, 0]).is_err());
    }

    #[test]
    fn malformed_events_reject() {
        assert!(DeviceSyncEvent::decode(&[]).is_err());
        assert!(DeviceSyncEvent::decode(&[0xAA]).is_err());

        // RotateKey with a short key.
        let mut bytes = DeviceSyncEvent::RotateKey { key: [1; 32] }.encode().unwrap();
        bytes.pop();
        assert!(DeviceSyncEvent::decode(&bytes).is_err());

        // Trailing bytes.
        let mut bytes = DeviceSyncEvent::Delivery {
            is_group: false,
            is_read: false,
            conv_id: "x".into(),
            msg_id: [0; 16],
        }
        .encode()
        .unwrap();
        bytes.push(0);
        assert!(DeviceSyncEvent::decode(&bytes).is_err());
    }

    #[test]
    fn history_entry_validation() {
        let bad = HistoryMessage {
            is_group: false,
            outgoing: false,
            status: HistoryStatus::Sent,
            timestamp_sec: 0,
            conv_id: String::new(), // empty conv id is invalid
            body: HistoryBody::System { text: "t".into() },
        };
        assert!(DeviceSyncEvent::HistorySnapshot {
            target_device_id: "d".into(),
            history: vec![bad],
        }
        .encode()
        .is_err());
    }
}
