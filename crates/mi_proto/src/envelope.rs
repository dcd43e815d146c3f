//! The `MICH` chat envelope family.
//!
//! Every end-to-end payload starts with the fixed header
//! `MICH || version(1) || type(1) || msg_id(16)` followed by a type-specific
//! body. The envelope is what a ratchet (or group) cipher seals; the server
//! only ever sees the sealed form.
//!
//! Decoders consume the entire payload; trailing bytes are a protocol error.

use crate::wire::{self, WireError};

pub const CHAT_MAGIC: [u8; 4] = *b"MICH";
pub const CHAT_VERSION: u8 = 1;
pub const CHAT_HEADER_BYTES: usize = 4 + 1 + 1 + 16;

pub type MsgId = [u8; 16];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ChatType {
    Text = 1,
    Ack = 2,
    File = 3,
    GroupText = 4,
    GroupInvite = 5,
    GroupFile = 6,
    GroupSenderKeyDist = 7,
    GroupSenderKeyReq = 8,
    Rich = 9,
    ReadReceipt = 10,
    Typing = 11,
    Sticker = 12,
    Presence = 13,
    GroupCallKeyDist = 14,
    GroupCallKeyReq = 15,
}

impl TryFrom<u8> for ChatType {
    type Error = WireError;

    fn try_from(v: u8) -> Result<Self, WireError> {
        Ok(match v {
            1 => Self::Text,
            2 => Self::Ack,
            3 => Self::File,
            4 => Self::GroupText,
            5 => Self::GroupInvite,
            6 => Self::GroupFile,
            7 => Self::GroupSenderKeyDist,
            8 => Self::GroupSenderKeyReq,
            9 => Self::Rich,
            10 => Self::ReadReceipt,
            11 => Self::Typing,
            12 => Self::Sticker,
            13 => Self::Presence,
            14 => Self::GroupCallKeyDist,
            15 => Self::GroupCallKeyReq,
            _ => return Err(WireError::Invalid),
        })
    }
}

// ── Body payloads ────────────────────────────────────────────────────────────

/// File announcement: the blob itself travels out of band under `file_key`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileMeta {
    pub file_size: u64,
    pub file_name: String,
    pub file_id: String,
    pub file_key: [u8; 32],
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SenderKeyDist {
    pub group_id: String,
    pub version: u32,
    pub iteration: u32,
    pub ck: [u8; 32],
    pub signature: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallKeyDist {
    pub group_id: String,
    pub call_id: [u8; 16],
    pub key_id: u32,
    pub call_key: [u8; 32],
    pub signature: Vec<u8>,
}

const RICH_KIND_TEXT: u8 = 1;
const RICH_KIND_LOCATION: u8 = 2;
const RICH_KIND_CONTACT_CARD: u8 = 3;
const RICH_FLAG_HAS_REPLY: u8 = 0x01;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub reply_to: MsgId,
    pub preview: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RichContent {
    Text { text: String },
    /// Coordinates are degrees × 1e7.
    Location { lat_e7: i32, lon_e7: i32, label: String },
    ContactCard { username: String, display: String },
}

// ── Envelope ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatEnvelope {
    Text { msg_id: MsgId, text: String },
    Ack { msg_id: MsgId },
    File { msg_id: MsgId, file: FileMeta },
    GroupText { msg_id: MsgId, group_id: String, text: String },
    GroupInvite { msg_id: MsgId, group_id: String },
    GroupFile { msg_id: MsgId, group_id: String, file: FileMeta },
    GroupSenderKeyDist { msg_id: MsgId, dist: SenderKeyDist },
    GroupSenderKeyReq { msg_id: MsgId, group_id: String, want_version: u32 },
    Rich { msg_id: MsgId, reply: Option<Reply>, content: RichContent },
    ReadReceipt { msg_id: MsgId },
    Typing { msg_id: MsgId, typing: bool },
    Sticker { msg_id: MsgId, sticker_id: String },
    Presence { msg_id: MsgId, online: bool },
    GroupCallKeyDist { msg_id: MsgId, dist: CallKeyDist },
    GroupCallKeyReq { msg_id: MsgId, group_id: String, call_id: [u8; 16], want_key_id: u32 },
}

impl ChatEnvelope {
    pub fn chat_type(&self) -> ChatType {
        match self {
            Self::Text { .. } => ChatType::Text,
            Self::Ack { .. } => ChatType::Ack,
            Self::File { .. } => ChatType::File,
            Self::GroupText { .. } => ChatType::GroupText,
            Self::GroupInvite { .. } => ChatType::GroupInvite,
            Self::GroupFile { .. } => ChatType::GroupFile,
            Self::GroupSenderKeyDist { .. } => ChatType::GroupSenderKeyDist,
            Self::GroupSenderKeyReq { .. } => ChatType::GroupSenderKeyReq,
            Self::Rich { .. } => ChatType::Rich,
            Self::ReadReceipt { .. } => ChatType::ReadReceipt,
            Self::Typing { .. } => ChatType::Typing,
            Self::Sticker { .. } => ChatType::Sticker,
            Self::Presence { .. } => ChatType::Presence,
            Self::GroupCallKeyDist { .. } => ChatType::GroupCallKeyDist,
            Self::GroupCallKeyReq { .. } => ChatType::GroupCallKeyReq,
        }
    }

    pub fn msg_id(&self) -> &MsgId {
        match self {
            Self::Text { msg_id, .. }
            | Self::Ack { msg_id }
            | Self::File { msg_id, .. }
            | Self::GroupText { msg_id, .. }
            | Self::GroupInvite { msg_id, .. }
            | Self::GroupFile { msg_id, .. }
            | Self::GroupSenderKeyDist { msg_id, .. }
            | Self::GroupSenderKeyReq { msg_id, .. }
            | Self::Rich { msg_id, .. }
            | Self::ReadReceipt { msg_id }
            | Self::Typing { msg_id, .. }
            | Self::Sticker { msg_id, .. }
            | Self::Presence { msg_id, .. }
            | Self::GroupCallKeyDist { msg_id, .. }
            | Self::GroupCallKeyReq { msg_id, .. } => msg_id,
        }
    }

    // ── Encode ───────────────────────────────────────────────────────────

    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        let mut out = Vec::with_capacity(CHAT_HEADER_BYTES + self.body_size_hint());
        out.extend_from_slice(&CHAT_MAGIC);
        out.push(CHAT_VERSION);
        out.push(self.chat_type() as u8);
        out.extend_from_slice(self.msg_id());

        match self {
            Self::Text { text, .. } => {
                wire::put_string(text, &mut out)?;
            }
            Self::Ack { .. } | Self::ReadReceipt { .. } => {}
            Self::File { file, .. } => {
                encode_file_meta(file, &mut out)?;
            }
            Self::GroupText { group_id, text, .. } => {
                wire::put_string(group_id, &mut out)?;
                wire::put_string(text, &mut out)?;
            }
            Self::GroupInvite { group_id, .. } => {
                wire::put_string(group_id, &mut out)?;
            }
            Self::GroupFile { group_id, file, .. } => {
                wire::put_string(group_id, &mut out)?;
                encode_file_meta(file, &mut out)?;
            }
            Self::GroupSenderKeyDist { dist, .. } => {
                wire::put_string(&dist.group_id, &mut out)?;
                wire::put_u32(dist.version, &mut out);
                wire::put_u32(dist.iteration, &mut out);
                wire::put_bytes(&dist.ck, &mut out)?;
                wire::put_bytes(&dist.signature, &mut out)?;
            }
            Self::GroupSenderKeyReq { group_id, want_version, .. } => {
                wire::put_string(group_id, &mut out)?;
                wire::put_u32(*want_version, &mut out);
            }
            Self::Rich { reply, content, .. } => {
                let kind = match content {
                    RichContent::Text { .. } => RICH_KIND_TEXT,
                    RichContent::Location { .. } => RICH_KIND_LOCATION,
                    RichContent::ContactCard { .. } => RICH_KIND_CONTACT_CARD,
                };
                out.push(kind);
                out.push(if reply.is_some() { RICH_FLAG_HAS_REPLY } else { 0 });
                if let Some(reply) = reply {
                    out.extend_from_slice(&reply.reply_to);
                    wire::put_string(&reply.preview, &mut out)?;
                }
                match content {
                    RichContent::Text { text } => {
                        wire::put_string(text, &mut out)?;
                    }
                    RichContent::Location { lat_e7, lon_e7, label } => {
                        wire::put_u32(*lat_e7 as u32, &mut out);
                        wire::put_u32(*lon_e7 as u32, &mut out);
                        wire::put_string(label, &mut out)?;
                    }
                    RichContent::ContactCard { username, display } => {
                        wire::put_string(username, &mut out)?;
                        wire::put_string(display, &mut out)?;
                    }
                }
            }
            Self::Typing { typing, .. } => {
                out.push(u8::from(*typing));
            }
            Self::Sticker { sticker_id, .. } => {
                wire::put_string(sticker_id, &mut out)?;
            }
            Self::Presence { online, .. } => {
                out.push(u8::from(*online));
            }
            Self::GroupCallKeyDist { dist, .. } => {
                wire::put_string(&dist.group_id, &mut out)?;
                out.extend_from_slice(&dist.call_id);
                wire::put_u32(dist.key_id, &mut out);
                wire::put_bytes(&dist.call_key, &mut out)?;
                wire::put_bytes(&dist.signature, &mut out)?;
            }
            Self::GroupCallKeyReq { group_id, call_id, want_key_id, .. } => {
                wire::put_string(group_id, &mut out)?;
                out.extend_from_slice(call_id);
                wire::put_u32(*want_key_id, &mut out);
            }
        }
        Ok(out)
    }

    fn body_size_hint(&self) -> usize {
        match self {
            Self::Text { text, .. } => 2 + text.len(),
            Self::Ack { .. } | Self::ReadReceipt { .. } => 0,
            Self::File { file, .. } => file_meta_size(file),
            Self::GroupText { group_id, text, .. } => 2 + group_id.len() + 2 + text.len(),
            Self::GroupInvite { group_id, .. } => 2 + group_id.len(),
            Self::GroupFile { group_id, file, .. } => 2 + group_id.len() + file_meta_size(file),
            Self::GroupSenderKeyDist { dist, .. } => {
                2 + dist.group_id.len() + 4 + 4 + 4 + 32 + 4 + dist.signature.len()
            }
            Self::GroupSenderKeyReq { group_id, .. } => 2 + group_id.len() + 4,
            Self::Rich { reply, content, .. } => {
                let reply_len = reply.as_ref().map_or(0, |r| 16 + 2 + r.preview.len());
                2 + reply_len
                    + match content {
                        RichContent::Text { text } => 2 + text.len(),
                        RichContent::Location { label, .. } => 8 + 2 + label.len(),
                        RichContent::ContactCard { username, display } => {
                            2 + username.len() + 2 + display.len()
                        }
                    }
            }
            Self::Typing { .. } | Self::Presence { .. } => 1,
            Self::Sticker { sticker_id, .. } => 2 + sticker_id.len(),
            Self::GroupCallKeyDist { dist, .. } => {
                2 + dist.group_id.len() + 16 + 4 + 4 + 32 + 4 + dist.signature.len()
            }
            Self::GroupCallKeyReq { group_id, .. } => 2 + group_id.len() + 16 + 4,
        }
    }

    // ── Decode ───────────────────────────────────────────────────────────

    pub fn decode(payload: &[u8]) -> Result<Self, WireError> {
        let (chat_type, msg_id, mut off) = decode_header(payload)?;
        let env = match chat_type {
            ChatType::Text => Self::Text {
                msg_id,
                text: wire::get_string(payload, &mut off)?,
            },
            ChatType::Ack => Self::Ack { msg_id },
            ChatType::File => Self::File {
                msg_id,
                file: decode_file_meta(payload, &mut off)?,
            },
            ChatType::GroupText => Self::GroupText {
                msg_id,
                group_id: wire::get_string(payload, &mut off)?,
                text: wire::get_string(payload, &mut off)?,
            },
            ChatType::GroupInvite => Self::GroupInvite {
                msg_id,
                group_id: wire::get_string(payload, &mut off)?,
            },
            ChatType::GroupFile => {
                let group_id = wire::get_string(payload, &mut off)?;
                Self::GroupFile {
                    msg_id,
                    group_id,
                    file: decode_file_meta(payload, &mut off)?,
                }
            }
            ChatType::GroupSenderKeyDist => {
                let group_id = wire::get_string(payload, &mut off)?;
                let version = wire::get_u32(payload, &mut off)?;
                let iteration = wire::get_u32(payload, &mut off)?;
                let ck_bytes = wire::get_bytes(payload, &mut off)?;
                let ck: [u8; 32] = ck_bytes.as_slice().try_into().map_err(|_| WireError::Invalid)?;
                let signature = wire::get_bytes(payload, &mut off)?;
                Self::GroupSenderKeyDist {
                    msg_id,
                    dist: SenderKeyDist { group_id, version, iteration, ck, signature },
                }
            }
            ChatType::GroupSenderKeyReq => Self::GroupSenderKeyReq {
                msg_id,
                group_id: wire::get_string(payload, &mut off)?,
                want_version: wire::get_u32(payload, &mut off)?,
            },
            ChatType::Rich => {
                let kind = wire::get_u8(payload, &mut off)?;
                let flags = wire::get_u8(payload, &mut off)?;
                let reply = if flags & RICH_FLAG_HAS_REPLY != 0 {
                    let reply_to = wire::get_fixed::<16>(payload, &mut off)?;
                    let preview = wire::get_string(payload, &mut off)?;
                    Some(Reply { reply_to, preview })
                } else {
                    None
                };
                let content = match kind {
                    RICH_KIND_TEXT => RichContent::Text {
                        text: wire::get_string(payload, &mut off)?,
                    },
                    RICH_KIND_LOCATION => RichContent::Location {
                        lat_e7: wire::get_u32(payload, &mut off)? as i32,
                        lon_e7: wire::get_u32(payload, &mut off)? as i32,
                        label: wire::get_string(payload, &mut off)?,
                    },
                    RICH_KIND_CONTACT_CARD => RichContent::ContactCard {
                        username: wire::get_string(payload, &mut off)?,
                        display: wire::get_string(payload, &mut off)?,
                    },
                    _ => return Err(WireError::Invalid),
                };
                Self::Rich { msg_id, reply, content }
            }
            ChatType::ReadReceipt => Self::ReadReceipt { msg_id },
            ChatType::Typing => Self::Typing {
                msg_id,
                typing: wire::get_u8(payload, &mut off)? != 0,
            },
            ChatType::Sticker => Self::Sticker {
                msg_id,
                sticker_id: wire::get_string(payload, &mut off)?,
            },
            ChatType::Presence => Self::Presence {
                msg_id,
                online: wire::get_u8(payload, &mut off)? != 0,
            },
            ChatType::GroupCallKeyDist => {
                let group_id = wire::get_string(payload, &mut off)?;
                let call_id = wire::get_fixed::<16>(payload, &mut off)?;
                let key_id = wire::get_u32(payload, &mut off)?;
                let key_bytes = wire::get_bytes(payload, &mut off)?;
                let call_key: [u8; 32] =
                    key_bytes.as_slice().try_into().map_err(|_| WireError::Invalid)?;
                let signature = wire::get_bytes(payload, &mut off)?;
                Self::GroupCallKeyDist {
                    msg_id,
                    dist: CallKeyDist { group_id, call_id, key_id, call_key, signature },
                }
            }
            ChatType::GroupCallKeyReq => Self::GroupCallKeyReq {
                msg_id,
                group_id: wire::get_string(payload, &mut off)?,
                call_id: wire::get_fixed::<16>(payload, &mut off)?,
                want_key_id: wire::get_u32(payload, &mut off)?,
            },
        };
        if off != payload.len() {
            return Err(WireError::Invalid);
        }
        Ok(env)
    }
}

/// Parse just the fixed header. Returns (type, msg_id, body offset).
pub fn decode_header(payload: &[u8]) -> Result<(ChatType, MsgId, usize), WireError> {
    if payload.len() < CHAT_HEADER_BYTES || payload[..4] != CHAT_MAGIC {
        return Err(WireError::Invalid);
    }
    if payload[4] != CHAT_VERSION {
        return Err(WireError::Invalid);
    }
    let chat_type = ChatType::try_from(payload[5])?;
    let msg_id: MsgId = payload[6..22].try_into().unwrap();
    Ok((chat_type, msg_id, CHAT_HEADER_BYTES))
}

fn file_meta_size(file: &FileMeta) -> usize {
    8 + 2 + file.file_name.len() + 2 + file.file_id.len() + 32
}

fn encode_file_meta(file: &FileMeta, out: &mut Vec<u8>) -> Result<(), WireError> {
    wire::put_u64(file.file_size, out);
    wire::put_string(&file.file_name, out)?;
    wire::put_string(&file.file_id, out)?;
    out.extend_from_slice(&file.file_key);
    Ok(())
}

fn decode_file_meta(payload: &[u8], off: &mut usize) -> Result<FileMeta, WireError> {
    Ok(FileMeta {
        file_size: wire::get_u64(payload, off)?,
        file_name: wire::get_string(payload, off)?,
        file_id: wire::get_string(payload, off)?,
        file_key: wire::get_fixed::<32>(payload, off)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(env: ChatEnvelope) {
        let bytes = env.encode().unwrap();
        assert_eq!(&bytes[..4], &CHAT_MAGIC);
        assert_eq!(bytes[5], env.chat_type() as u8);
        let decoded = ChatEnvelope::decode(&bytes).unwrap();
        assert_eq!(decoded, env);
    }

    #[test]
    fn text_and_hints() {
        roundtrip(ChatEnvelope::Text { msg_id: [1; 16], text: "hi 你好".into() });
        roundtrip(ChatEnvelope::Ack { msg_id: [2; 16] });
        roundtrip(ChatEnvelope::ReadReceipt { msg_id: [3; 16] });
        roundtrip(ChatEnvelope::Typing { msg_id: [4; 16], typing: true });
        roundtrip(ChatEnvelope::Presence { msg_id: [5; 16], online: false });
        roundtrip(ChatEnvelope::Sticker { msg_id: [6; 16], sticker_id: "pack/7".into() });
    }

    #[test]
    fn group_bodies() {
        roundtrip(ChatEnvelope::GroupText {
            msg_id: [7; 16],
            group_id: "g-1".into(),
            text: "all".into(),
        });
        roundtrip(ChatEnvelope::GroupInvite { msg_id: [8; 16], group_id: "g-2".into() });
        roundtrip(ChatEnvelope::GroupSenderKeyDist {
            msg_id: [9; 16],
            dist: SenderKeyDist {
                group_id: "g-3".into(),
                version: 4,
                iteration: 17,
                ck: [0xCC; 32],
                signature: vec![1; 64],
            },
        });
        roundtrip(ChatEnvelope::GroupSenderKeyReq {
            msg_id: [10; 16],
            group_id: "g-3".into(),
            want_version: 4,
        });
        roundtrip(ChatEnvelope::GroupCallKeyDist {
            msg_id: [11; 16],
            dist: CallKeyDist {
                group_id: "g-4".into(),
                call_id: [0xAB; 16],
                key_id: 2,
                call_key: [0xDD; 32],
                signature: vec![2; 64],
            },
        });
        roundtrip(ChatEnvelope::GroupCallKeyReq {
            msg_id: [12; 16],
            group_id: "g-4".into(),
            call_id: [0xAB; 16],
            want_key_id: 2,
        });
    }

    #[test]
    fn files() {
        let file = FileMeta {
            file_size: 123456,
            file_name: "report.pdf".into(),
            file_id: "blob-1".into(),
            file_key: [0x11; 32],
        };
        roundtrip(ChatEnvelope::File { msg_id: [13; 16], file: file.clone() });
        roundtrip(ChatEnvelope::GroupFile {
            msg_id: [14; 16],
            group_id: "g-5".into(),
            file,
        });
    }

    #[test]
    fn rich_variants() {
        roundtrip(ChatEnvelope::Rich {
            msg_id: [15; 16],
            reply: None,
            content: RichContent::Text { text: "plain".into() },
        });
        roundtrip(ChatEnvelope::Rich {
            msg_id: [16; 16],
            reply: Some(Reply { reply_to: [9; 16], preview: "earlier".into() }),
            content: RichContent::Text { text: "answer".into() },
        });
        roundtrip(ChatEnvelope::Rich {
            msg_id: [17; 16],
            reply: None,
            content: RichContent::Location {
                lat_e7: -226_162_520,
                lon_e7: 431_398_440,
                label: "somewhere".into(),
            },
        });
        roundtrip(ChatEnvelope::Rich {
            msg_id: [18; 16],
            reply: None,
            content: RichContent::ContactCard {
                username: "carol".into(),
                display: "Carol C".into(),
            },
        });
    }

    #[test]
    fn malformed_payloads_reject() {
        let good = ChatEnvelope::Text { msg_id: [1; 16], text: "x".into() }
            .encode()
            .unwrap();

        // Bad magic / version / type.
        let mut bad = good.clone();
        bad[0] = b'X';
        assert!(ChatEnvelope::decode(&bad).is_err());
        let mut bad = good.clone();
        bad[4] = 9;
        assert!(ChatEnvelope::decode(&bad).is_err());
        let mut bad = good.clone();
        bad[5] = 200;
        assert!(ChatEnvelope::decode(&bad).is_err());

        // Truncated body and trailing garbage.
        assert!(ChatEnvelope::decode(&good[..good.len() - 1]).is_err());
        let mut long = good;
        long.push(0);
        assert!(ChatEnvelope::decode(&long).is_err());
    }
}
