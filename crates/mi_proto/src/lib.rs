//! mi_proto — wire types, envelopes, and codecs for the Michat E2EE core
//!
//! Everything on the wire is hand-specified little-endian binary; there is no
//! self-describing serialization between client and server. Each format
//! carries a magic + version so it can evolve without breaking peers.
//!
//! # Modules
//! - `wire`     — primitive readers/writers and the server frame header
//! - `envelope` — the `MICH` chat envelope family (text, acks, groups, …)
//! - `padding`  — `MIPD` size-bucket padding for envelope plaintexts
//! - `group`    — the `MIGC` group cipher wire format and signature messages
//! - `session`  — the `MIRM` 1:1 ratchet message wire form
//! - `blob`     — the `MIF1` encrypted file blob codec (v1–v4)
//! - `sync`     — device-sync event bodies fanned out to sibling devices

pub mod blob;
pub mod envelope;
pub mod group;
pub mod padding;
pub mod session;
pub mod sync;
pub mod wire;

pub use envelope::{ChatEnvelope, ChatType, MsgId};
pub use wire::{FrameType, WireError};
