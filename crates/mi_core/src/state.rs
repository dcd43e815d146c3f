//! Persisted ratchet and group state — the `MIRS` record file.
//!
//! Layout (all little-endian, wire primitives from `mi_proto`):
//!
//! ```text
//! "MIRS" || u8 version
//!   identity:  sig_secret(32) || dh_secret(32) || u64 created_at
//!   u32 legacy_count || { sig(32) || dh(32) || u64 created || u64 retain }*
//!   prekeys:   spk_secret(32) || spk_sig(64) || u8 opk_count || opk(32)*
//!              || bytes kem_pub || bytes kem_secret || u8 needs_republish
//!   u32 session_count || session records
//!   u32 owned_group_count || owned records
//!   u32 tracked_group_count || tracked records
//! ```
//!
//! The file lives under `e2ee_state/` with private mode and is replaced
//! atomically. A shape mismatch on load is a hard `State` error — silently
//! dropping ratchet state would break every conversation.

use std::path::Path;

use mi_crypto::group::GroupChainSnapshot;
use mi_crypto::ratchet::RatchetSnapshot;
use mi_proto::wire;

use crate::engine::{EngineSnapshot, LegacySnapshot};
use crate::error::{CoreError, Result};
use crate::fsutil;
use crate::group_engine::{GroupEngineSnapshot, OwnedChainSnapshot};

const STATE_MAGIC: [u8; 4] = *b"MIRS";
const STATE_VERSION: u8 = 1;
const MAX_STATE_BYTES: u64 = 64 * 1024 * 1024;

pub struct PersistedState {
    pub engine: EngineSnapshot,
    pub groups: GroupEngineSnapshot,
}

pub fn save(path: &Path, state: &PersistedState) -> Result<()> {
    let bytes = encode(state)?;
    fsutil::write_atomic(path, &bytes)
        .map_err(|e| CoreError::State(format!("write ratchet state: {e}")))
}

pub fn load(path: &Path) -> Result<Option<PersistedState>> {
    if !path.exists() {
        return Ok(None);
    }
    let bytes = fsutil::read_limited(path, MAX_STATE_BYTES)
        .map_err(|e| CoreError::State(format!("read ratchet state: {e}")))?;
    decode(&bytes).map(Some)
}

// ── Encoding ─────────────────────────────────────────────────────────────────

fn encode(state: &PersistedState) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(4096);
    out.extend_from_slice(&STATE_MAGIC);
    out.push(STATE_VERSION);

    let engine = &state.engine;
    out.extend_from_slice(&engine.identity_sig_secret);
    out.extend_from_slice(&engine.identity_dh_secret);
    wire::put_u64(engine.identity_created_at_ms, &mut out);

    wire::put_u32(engine.legacy.len() as u32, &mut out);
    for legacy in &engine.legacy {
        out.extend_from_slice(&legacy.sig_secret);
        out.extend_from_slice(&legacy.dh_secret);
        wire::put_u64(legacy.created_at_ms, &mut out);
        wire::put_u64(legacy.retain_until_ms, &mut out);
    }

    out.extend_from_slice(&engine.spk_secret);
    out.extend_from_slice(&engine.spk_sig);
    out.push(engine.one_time.len() as u8);
    for opk in &engine.one_time {
        out.extend_from_slice(opk);
    }
    wire::put_bytes(&engine.kem_pub, &mut out)?;
    wire::put_bytes(&engine.kem_secret, &mut out)?;
    out.push(u8::from(engine.needs_republish));

    wire::put_u32(engine.sessions.len() as u32, &mut out);
    for session in &engine.sessions {
        encode_session(session, &mut out)?;
    }

    wire::put_u32(state.groups.owned.len() as u32, &mut out);
    for owned in &state.groups.owned {
        wire::put_string(&owned.group_id, &mut out)?;
        encode_group_chain(&owned.chain, &mut out);
        wire::put_u64(owned.message_count, &mut out);
        wire::put_u64(owned.created_at_ms, &mut out);
    }

    wire::put_u32(state.groups.tracked.len() as u32, &mut out);
    for (key, chain) in &state.groups.tracked {
        wire::put_string(key, &mut out)?;
        encode_group_chain(chain, &mut out);
    }

    Ok(out)
}

fn encode_session(session: &RatchetSnapshot, out: &mut Vec<u8>) -> Result<()> {
    wire::put_string(&session.peer_id, out)?;
    out.extend_from_slice(&session.root_key);
    out.extend_from_slice(&session.dh_send_secret);
    out.extend_from_slice(&session.dh_send_pub);
    out.extend_from_slice(&session.send_ck);
    out.push(u8::from(session.send_ready));
    wire::put_u64(session.send_n, out);
    out.extend_from_slice(&session.send_nonce_prefix);
    match session.dh_recv_pub {
        Some(pk) => {
            out.push(1);
            out.extend_from_slice(&pk);
        }
        None => out.push(0),
    }
    out.extend_from_slice(&session.recv_ck);
    wire::put_u64(session.recv_n, out);
    wire::put_u64(session.prev_send_n, out);
    wire::put_u32(session.skipped.len() as u32, out);
    for (dh_pub, n, mk) in &session.skipped {
        out.extend_from_slice(dh_pub);
        wire::put_u64(*n, out);
        out.extend_from_slice(mk);
    }
    Ok(())
}

fn encode_group_chain(chain: &GroupChainSnapshot, out: &mut Vec<u8>) {
    out.extend_from_slice(&chain.ck);
    wire::put_u32(chain.next_iteration, out);
    wire::put_u32(chain.version, out);
    wire::put_u32(chain.skipped.len() as u32, out);
    for (n, mk) in &chain.skipped {
        wire::put_u32(*n, out);
        out.extend_from_slice(mk);
    }
}

// ── Decoding ─────────────────────────────────────────────────────────────────

fn bad() -> CoreError {
    CoreError::State("ratchet state corrupt".into())
}

fn decode(bytes: &[u8]) -> Result<PersistedState> {
    if bytes.len() < 5 || bytes[..4] != STATE_MAGIC || bytes[4] != STATE_VERSION {
        return Err(bad());
    }
    let mut off = 5usize;
    let data = bytes;

    let identity_sig_secret = wire::get_fixed::<32>(data, &mut off).map_err(|_| bad())?;
    let identity_dh_secret = wire::get_fixed::<32>(data, &mut off).map_err(|_| bad())?;
    let identity_created_at_ms = wire::get_u64(data, &mut off).map_err(|_| bad())?;

    let legacy_count = wire::get_u32(data, &mut off).map_err(|_| bad())? as usize;
    if legacy_count > 64 {
        return Err(bad());
    }
    let mut legacy = Vec::with_capacity(legacy_count);
    for _ in 0..legacy_count {
        legacy.push(LegacySnapshot {
            sig_secret: wire::get_fixed::<32>(data, &mut off).map_err(|_| bad())?,
            dh_secret: wire::get_fixed::<32>(data, &mut off).map_err(|_| bad())?,
            created_at_ms: wire::get_u64(data, &mut off).map_err(|_| bad())?,
            retain_until_ms: wire::get_u64(data, &mut off).map_err(|_| bad())?,
        });
    }

    let spk_secret = wire::get_fixed::<32>(data, &mut off).map_err(|_| bad())?;
    let spk_sig = wire::get_fixed::<64>(data, &mut off).map_err(|_| bad())?;
    let opk_count = wire::get_u8(data, &mut off).map_err(|_| bad())? as usize;
    let mut one_time = Vec::with_capacity(opk_count);
    for _ in 0..opk_count {
        one_time.push(wire::get_fixed::<32>(data, &mut off).map_err(|_| bad())?);
    }
    let kem_pub = wire::get_bytes(data, &mut off).map_err(|_| bad())?;
    let kem_secret = wire::get_bytes(data, &mut off).map_err(|_| bad())?;
    let needs_republish = wire::get_u8(data, &mut off).map_err(|_| bad())? != 0;

    let session_count = wire::get_u32(data, &mut off).map_err(|_| bad())? as usize;
    if session_count > 100_000 {
        return Err(bad());
    }
    let mut sessions = Vec::with_capacity(session_count);
    for _ in 0..session_count {
        sessions.push(decode_session(data, &mut off)?);
    }

    let owned_count = wire::get_u32(data, &mut off).map_err(|_| bad())? as usize;
    if owned_count > 100_000 {
        return Err(bad());
    }
    let mut owned = Vec::with_capacity(owned_count);
    for _ in 0..owned_count {
        let group_id = wire::get_string(data, &mut off).map_err(|_| bad())?;
        let chain = decode_group_chain(data, &mut off)?;
        owned.push(OwnedChainSnapshot {
            group_id,
            chain,
            message_count: wire::get_u64(data, &mut off).map_err(|_| bad())?,
            created_at_ms: wire::get_u64(data, &mut off).map_err(|_| bad())?,
        });
    }

    let tracked_count = wire::get_u32(data, &mut off).map_err(|_| bad())? as usize;
    if tracked_count > 100_000 {
        return Err(bad());
    }
    let mut tracked = Vec::with_capacity(tracked_count);
    for _ in 0..tracked_count {
        let key = wire::get_string(data, &mut off).map_err(|_| bad())?;
        tracked.push((key, decode_group_chain(data, &mut off)?));
    }

    if off != data.len() {
        return Err(bad());
    }

    Ok(PersistedState {
        engine: EngineSnapshot {
            identity_sig_secret,
            identity_dh_secret,
            identity_created_at_ms,
            legacy,
            spk_secret,
            spk_sig,
            one_time,
            kem_pub,
            kem_secret,
            needs_republish,
            sessions,
        },
        groups: GroupEngineSnapshot { owned, tracked },
    })
}

fn decode_session(data: &[u8], off: &mut usize) -> Result<RatchetSnapshot> {
    let peer_id = wire::get_string(data, off).map_err(|_| bad())?;
    let root_key = wire::get_fixed::<32>(data, off).map_err(|_| bad())?;
    let dh_send_secret = wire::get_fixed::<32>(data, off).map_err(|_| bad())?;
    let dh_send_pub = wire::get_fixed::<32>(data, off).map_err(|_| bad())?;
    let send_ck = wire::get_fixed::<32>(data, off).map_err(|_| bad())?;
    let send_ready = wire::get_u8(data, off).map_err(|_| bad())? != 0;
    let send_n = wire::get_u64(data, off).map_err(|_| bad())?;
    let send_nonce_prefix = wire::get_fixed::<8>(data, off).map_err(|_| bad())?;
    let dh_recv_pub = match wire::get_u8(data, off).map_err(|_| bad())? {
        0 => None,
        1 => Some(wire::get_fixed::<32>(data, off).map_err(|_| bad())?),
        _ => return Err(bad()),
    };
    let recv_ck = wire::get_fixed::<32>(data, off).map_err(|_| bad())?;
    let recv_n = wire::get_u64(data, off).map_err(|_| bad())?;
    let prev_send_n = wire::get_u64(data, off).map_err(|_| bad())?;
    let skipped_count = wire::get_u32(data, off).map_err(|_| bad())? as usize;
    if skipped_count > mi_crypto::ratchet::MAX_SKIPPED_TOTAL {
        return Err(bad());
    }
    let mut skipped = Vec::with_capacity(skipped_count);
    for _ in 0..skipped_count {
        let dh_pub = wire::get_fixed::<32>(data, off).map_err(|_| bad())?;
        let n = wire::get_u64(data, off).map_err(|_| bad())?;
        let mk = wire::get_fixed::<32>(data, off).map_err(|_| bad())?;
        skipped.push((dh_pub, n, mk));
    }
    Ok(RatchetSnapshot {
        peer_id,
        root_key,
        dh_send_secret,
        dh_send_pub,
        send_ck,
        send_ready,
        send_n,
        send_nonce_prefix,
        dh_recv_pub,
        recv_ck,
        recv_n,
        prev_send_n,
        skipped,
    })
}

fn decode_group_chain(data: &[u8], off: &mut usize) -> Result<GroupChainSnapshot> {
    let ck = wire::get_fixed::<32>(data, off).map_err(|_| bad())?;
    let next_iteration = wire::get_u32(data, off).map_err(|_| bad())?;
    let version = wire::get_u32(data, off).map_err(|_| bad())?;
    let skipped_count = wire::get_u32(data, off).map_err(|_| bad())? as usize;
    if skipped_count > mi_crypto::group::MAX_GROUP_SKIPPED_MESSAGE_KEYS {
        return Err(bad());
    }
    let mut skipped = Vec::with_capacity(skipped_count);
    for _ in 0..skipped_count {
        let n = wire::get_u32(data, off).map_err(|_| bad())?;
        let mk = wire::get_fixed::<32>(data, off).map_err(|_| bad())?;
        skipped.push((n, mk));
    }
    Ok(GroupChainSnapshot {
        ck,
        next_iteration,
        version,
        skipped,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::PeerEngine;
    use crate::group_engine::GroupEngine;
    use mi_crypto::identity::IdentityPolicy;

    #[test]
    fn full_state_survives_a_save_load_cycle() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ratchet_state.bin");

        // Build an engine with a live session and group chains.
        let alice = PeerEngine::new(IdentityPolicy::default(), 0, 7).unwrap();
        let bob = PeerEngine::new(IdentityPolicy::default(), 0, 7).unwrap();
        let bob_bundle =
            mi_crypto::x3dh::PrekeyBundle::decode(&bob.build_publish_bundle().unwrap()).unwrap();
        let w = alice.encrypt_to_peer("bob", Some(&bob_bundle), b"persist me").unwrap();
        bob.decrypt_from_peer("alice", &w).unwrap();

        let groups = GroupEngine::new("alice".into());
        let identity_sign = |m: &[u8]| alice.sign(m);
        let (_, _) = groups
            .encrypt_group_message("team", &identity_sign, b"seed", 7)
            .unwrap();

        save(
            &path,
            &PersistedState {
                engine: alice.snapshot(),
                groups: groups.snapshot(),
            },
        )
        .unwrap();

        let restored = load(&path).unwrap().expect("state file present");
        let alice2 = PeerEngine::restore(IdentityPolicy::default(), &restored.engine).unwrap();
        let groups2 = GroupEngine::restore("alice".into(), &restored.groups);

        // Fingerprint and the live session survive.
        assert_eq!(alice.identity_fingerprint(), alice2.identity_fingerprint());
        assert!(alice2.has_session("bob"));

        // The restored ratchet continues the same chain.
        let w2 = alice2.encrypt_to_peer("bob", None, b"after restart").unwrap();
        assert_eq!(bob.decrypt_from_peer("alice", &w2).unwrap(), b"after restart");

        // The restored group chain continues at the same iteration.
        let snap = groups2.snapshot();
        assert_eq!(snap.owned.len(), 1);
        assert_eq!(snap.owned[0].chain.next_iteration, 1);
        assert_eq!(snap.owned[0].message_count, 1);
    }

    #[test]
    fn corrupt_state_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s.bin");
        let engine = PeerEngine::new(IdentityPolicy::default(), 0, 0).unwrap();
        let groups = GroupEngine::new("a".into());
        save(
            &path,
            &PersistedState {
                engine: engine.snapshot(),
                groups: groups.snapshot(),
            },
        )
        .unwrap();

        let mut bytes = std::fs::read(&path).unwrap();
        bytes.truncate(bytes.len() - 3);
        std::fs::write(&path, &bytes).unwrap();
        assert!(matches!(load(&path), Err(CoreError::State(_))));
    }

    #[test]
    fn missing_file_is_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load(&dir.path().join("nope.bin")).unwrap().is_none());
    }
}
