//! Group sender-key engine.
//!
//! One owned chain per group we speak in, one tracked chain per
//! (group, sender) we listen to, and one key per (group, call). The wire
//! format and signature messages live in `mi_proto::group`; the chain
//! arithmetic lives in `mi_crypto::group`; this module owns state,
//! signatures, and rotation policy:
//!
//!   - rotation at 10 000 messages, at 7 days of chain age, and on every
//!     membership change (a device kick rotates every owned chain at once);
//!   - a distribution whose `(version, iteration)` does not advance the
//!     tracked chain is discarded;
//!   - inbound messages verify the sender's Ed25519 signature over the
//!     signed span before any chain state moves.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use rand::{rngs::OsRng, RngCore};

use mi_crypto::group::{OwnedSenderChain, SenderChain};
use mi_crypto::identity::IdentityKeyPair;
use mi_crypto::{aead, CryptoError};
use mi_proto::envelope::{CallKeyDist, SenderKeyDist};
use mi_proto::group as wire;

use crate::error::{CoreError, Result};

fn chain_key_of(group_id: &str, sender: &str) -> String {
    format!("{group_id}|{sender}")
}

fn call_key_of(group_id: &str, call_id: &[u8; 16]) -> String {
    format!("{group_id}|{}", hex::encode(call_id))
}

#[derive(Clone)]
pub struct CallKey {
    pub key_id: u32,
    pub call_key: [u8; 32],
}

pub struct GroupEngine {
    username: String,
    owned: RwLock<HashMap<String, Arc<Mutex<OwnedSenderChain>>>>,
    tracked: RwLock<HashMap<String, Arc<Mutex<SenderChain>>>>,
    call_keys: Mutex<HashMap<String, CallKey>>,
}

impl GroupEngine {
    pub fn new(username: String) -> Self {
        Self {
            username,
            owned: RwLock::new(HashMap::new()),
            tracked: RwLock::new(HashMap::new()),
            call_keys: Mutex::new(HashMap::new()),
        }
    }

    fn owned_chain(&self, group_id: &str, now_ms: u64) -> Arc<Mutex<OwnedSenderChain>> {
        if let Some(chain) = self.owned.read().get(group_id) {
            return Arc::clone(chain);
        }
        let mut owned = self.owned.write();
        Arc::clone(
            owned
                .entry(group_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(OwnedSenderChain::fresh(1, now_ms)))),
        )
    }

    // ── Distributions ────────────────────────────────────────────────────

    /// Signed distribution of our current chain for `group_id`.
    pub fn make_sender_key_dist(
        &self,
        group_id: &str,
        identity: &dyn Fn(&[u8]) -> [u8; 64],
        now_ms: u64,
    ) -> Result<SenderKeyDist> {
        let chain = self.owned_chain(group_id, now_ms);
        let chain = chain.lock();
        let version = chain.chain.version;
        let iteration = chain.chain.next_iteration;
        let ck = *chain.chain.chain_key();
        let message = wire::build_sender_key_dist_sig_message(group_id, version, iteration, &ck)?;
        Ok(SenderKeyDist {
            group_id: group_id.to_string(),
            version,
            iteration,
            ck,
            signature: identity(&message).to_vec(),
        })
    }

    /// Accept (or discard) a peer's distribution after verifying its
    /// signature against the sender's pinned identity key.
    pub fn handle_sender_key_dist(
        &self,
        sender: &str,
        sender_sig_pk: &[u8; 32],
        dist: &SenderKeyDist,
    ) -> Result<bool> {
        let message = wire::build_sender_key_dist_sig_message(
            &dist.group_id,
            dist.version,
            dist.iteration,
            &dist.ck,
        )?;
        IdentityKeyPair::verify(sender_sig_pk, &message, &dist.signature)?;

        let key = chain_key_of(&dist.group_id, sender);
        let tracked = {
            let map = self.tracked.read();
            map.get(&key).cloned()
        };
        match tracked {
            Some(chain) => Ok(chain.lock().accept_dist(dist.version, dist.iteration, dist.ck)),
            None => {
                self.tracked.write().insert(
                    key,
                    Arc::new(Mutex::new(SenderChain::new(dist.ck, dist.version, dist.iteration))),
                );
                Ok(true)
            }
        }
    }

    /// Answer a joiner's `GroupSenderKeyReq`.
    pub fn handle_sender_key_req(
        &self,
        group_id: &str,
        identity: &dyn Fn(&[u8]) -> [u8; 64],
        now_ms: u64,
    ) -> Result<SenderKeyDist> {
        self.make_sender_key_dist(group_id, identity, now_ms)
    }

    // ── Messaging ────────────────────────────────────────────────────────

    /// Seal one padded envelope for the group. When a rotation trigger fired
    /// the chain is replaced first and the fresh dist is returned alongside
    /// for rebroadcast.
    pub fn encrypt_group_message(
        &self,
        group_id: &str,
        identity: &dyn Fn(&[u8]) -> [u8; 64],
        plaintext: &[u8],
        now_ms: u64,
    ) -> Result<(Vec<u8>, Option<SenderKeyDist>)> {
        let chain = self.owned_chain(group_id, now_ms);
        let mut chain = chain.lock();

        let mut new_dist = None;
        if chain.needs_rotation(now_ms) {
            chain.rotate(now_ms);
            let version = chain.chain.version;
            let iteration = chain.chain.next_iteration;
            let ck = *chain.chain.chain_key();
            let message =
                wire::build_sender_key_dist_sig_message(group_id, version, iteration, &ck)?;
            new_dist = Some(SenderKeyDist {
                group_id: group_id.to_string(),
                version,
                iteration,
                ck,
                signature: identity(&message).to_vec(),
            });
            tracing::debug!(group = group_id, version, "rotated group sender key");
        }

        let version = chain.chain.version;
        let (iteration, mut mk) = chain.advance()?;

        let mut nonce = [0u8; 24];
        OsRng.fill_bytes(&mut nonce);
        let ad = wire::build_group_cipher_ad(group_id, &self.username, version, iteration)?;
        let sealed = aead::seal_detached(&mk, &nonce, plaintext, &ad);
        mi_crypto::identity::wipe32(&mut mk);
        let (cipher, mac) = sealed?;

        let mut message = mi_proto::group::GroupCipherMessage {
            sender_key_version: version,
            sender_key_iteration: iteration,
            group_id: group_id.to_string(),
            sender: self.username.clone(),
            nonce,
            mac,
            cipher,
            signature: Vec::new(),
        };
        message.signature = identity(&message.signed_bytes()?).to_vec();
        Ok((message.encode()?, new_dist))
    }

    /// Open one group wire message from `sender`.
    pub fn decrypt_group_message(
        &self,
        payload: &[u8],
        sender_sig_pk: &[u8; 32],
    ) -> Result<(String, String, Vec<u8>)> {
        let (message, signed_len) = wire::GroupCipherMessage::decode(payload)?;
        IdentityKeyPair::verify(sender_sig_pk, &payload[..signed_len], &message.signature)?;

        let key = chain_key_of(&message.group_id, &message.sender);
        let chain = self
            .tracked
            .read()
            .get(&key)
            .cloned()
            .ok_or_else(|| CoreError::State(format!("no sender key for {key}")))?;
        let mut chain = chain.lock();
        if message.sender_key_version != chain.version {
            return Err(CoreError::State(format!(
                "sender key version mismatch for {key}"
            )));
        }

        let mut mk = chain.message_key(message.sender_key_iteration)?;
        let ad = wire::build_group_cipher_ad(
            &message.group_id,
            &message.sender,
            message.sender_key_version,
            message.sender_key_iteration,
        )?;
        let plain = aead::open_detached(&mk, &message.nonce, &message.cipher, &message.mac, &ad);
        mi_crypto::identity::wipe32(&mut mk);
        let plain = plain.map_err(|_| CoreError::Crypto(CryptoError::AeadDecrypt))?;

        Ok((message.group_id, message.sender, plain.to_vec()))
    }

    // ── Membership / rotation ────────────────────────────────────────────

    /// Membership changed in one group: rotate its owned chain now.
    pub fn rotate_group(
        &self,
        group_id: &str,
        identity: &dyn Fn(&[u8]) -> [u8; 64],
        now_ms: u64,
    ) -> Result<SenderKeyDist> {
        let chain = self.owned_chain(group_id, now_ms);
        {
            let mut chain = chain.lock();
            chain.rotate(now_ms);
        }
        self.make_sender_key_dist(group_id, identity, now_ms)
    }

    /// A kick invalidates every owned chain at once.
    pub fn rotate_all_owned(
        &self,
        identity: &dyn Fn(&[u8]) -> [u8; 64],
        now_ms: u64,
    ) -> Result<Vec<SenderKeyDist>> {
        let groups: Vec<String> = self.owned.read().keys().cloned().collect();
        groups
            .iter()
            .map(|g| self.rotate_group(g, identity, now_ms))
            .collect()
    }

    // ── Call keys ────────────────────────────────────────────────────────

    /// Fresh random key for a call we start; key_id increments per call in
    /// the same (group, call) slot.
    pub fn new_call_key(&self, group_id: &str, call_id: &[u8; 16]) -> CallKey {
        let mut call_keys = self.call_keys.lock();
        let slot = call_key_of(group_id, call_id);
        let key_id = call_keys.get(&slot).map_or(1, |k| k.key_id + 1);
        let mut key = [0u8; 32];
        OsRng.fill_bytes(&mut key);
        let call_key = CallKey { key_id, call_key: key };
        call_keys.insert(slot, call_key.clone());
        call_key
    }

    pub fn make_call_key_dist(
        &self,
        group_id: &str,
        call_id: &[u8; 16],
        identity: &dyn Fn(&[u8]) -> [u8; 64],
    ) -> Result<CallKeyDist> {
        let call_key = self
            .call_key(group_id, call_id)
            .ok_or_else(|| CoreError::State("no call key for this call".into()))?;
        let message = wire::build_call_key_dist_sig_message(
            group_id,
            call_id,
            call_key.key_id,
            &call_key.call_key,
        )?;
        Ok(CallKeyDist {
            group_id: group_id.to_string(),
            call_id: *call_id,
            key_id: call_key.key_id,
            call_key: call_key.call_key,
            signature: identity(&message).to_vec(),
        })
    }

    /// Verify and store a peer's call-key distribution; stale key ids are
    /// discarded.
    pub fn handle_call_key_dist(
        &self,
        sender_sig_pk: &[u8; 32],
        dist: &CallKeyDist,
    ) -> Result<bool> {
        let message = wire::build_call_key_dist_sig_message(
            &dist.group_id,
            &dist.call_id,
            dist.key_id,
            &dist.call_key,
        )?;
        IdentityKeyPair::verify(sender_sig_pk, &message, &dist.signature)?;

        let mut call_keys = self.call_keys.lock();
        let slot = call_key_of(&dist.group_id, &dist.call_id);
        if let Some(existing) = call_keys.get(&slot) {
            if dist.key_id <= existing.key_id {
                return Ok(false);
            }
        }
        call_keys.insert(
            slot,
            CallKey {
                key_id: dist.key_id,
                call_key: dist.call_key,
            },
        );
        Ok(true)
    }

    pub fn call_key(&self, group_id: &str, call_id: &[u8; 16]) -> Option<CallKey> {
        self.call_keys.lock().get(&call_key_of(group_id, call_id)).cloned()
    }

    pub fn clear(&self) {
        self.owned.write().clear();
        self.tracked.write().clear();
        self.call_keys.lock().clear();
    }

    // ── Persistence ──────────────────────────────────────────────────────

    pub fn snapshot(&self) -> GroupEngineSnapshot {
        GroupEngineSnapshot {
            owned: self
                .owned
                .read()
                .iter()
                .map(|(group, chain)| {
                    let chain = chain.lock();
                    OwnedChainSnapshot {
                        group_id: group.clone(),
                        chain: chain.chain.snapshot(),
                        message_count: chain.message_count,
                        created_at_ms: chain.created_at_ms,
                    }
                })
                .collect(),
            tracked: self
                .tracked
                .read()
                .iter()
                .map(|(key, chain)| (key.clone(), chain.lock().snapshot()))
                .collect(),
        }
    }

    pub fn restore(username: String, snapshot: &GroupEngineSnapshot) -> Self {
        let owned = snapshot
            .owned
            .iter()
            .map(|o| {
                (
                    o.group_id.clone(),
                    Arc::new(Mutex::new(OwnedSenderChain {
                        chain: SenderChain::restore(&o.chain),
                        message_count: o.message_count,
                        created_at_ms: o.created_at_ms,
                    })),
                )
            })
            .collect();
        let tracked = snapshot
            .tracked
            .iter()
            .map(|(key, chain)| (key.clone(), Arc::new(Mutex::new(SenderChain::restore(chain)))))
            .collect();
        Self {
            username,
            owned: RwLock::new(owned),
            tracked: RwLock::new(tracked),
            call_keys: Mutex::new(HashMap::new()),
        }
    }
}

/// Plain-data group state for the storage layer. Call keys are per-call
/// ephemera and are not persisted.
pub struct GroupEngineSnapshot {
    pub owned: Vec<OwnedChainSnapshot>,
    pub tracked: Vec<(String, mi_crypto::group::GroupChainSnapshot)>,
}

pub struct OwnedChainSnapshot {
    pub group_id: String,
    pub chain: mi_crypto::group::GroupChainSnapshot,
    pub message_count: u64,
    pub created_at_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use mi_crypto::group::ROTATION_MESSAGE_THRESHOLD;

    struct Member {
        identity: IdentityKeyPair,
        engine: GroupEngine,
    }

    impl Member {
        fn new(name: &str) -> Self {
            Self {
                identity: IdentityKeyPair::generate(0),
                engine: GroupEngine::new(name.to_string()),
            }
        }

        fn signer(&self) -> impl Fn(&[u8]) -> [u8; 64] + '_ {
            |m: &[u8]| self.identity.sign(m)
        }
    }

    #[test]
    fn dist_then_message_flow() {
        let alice = Member::new("alice");
        let bob = Member::new("bob");

        // Alice distributes, Bob accepts, Alice sends, Bob reads.
        let dist = alice.engine.make_sender_key_dist("g", &alice.signer(), 0).unwrap();
        assert!(bob
            .engine
            .handle_sender_key_dist("alice", alice.identity.sig_public(), &dist)
            .unwrap());

        let (payload, rotated) = alice
            .engine
            .encrypt_group_message("g", &alice.signer(), b"hi group", 0)
            .unwrap();
        assert!(rotated.is_none());

        let (group, sender, plain) = bob
            .engine
            .decrypt_group_message(&payload, alice.identity.sig_public())
            .unwrap();
        assert_eq!(group, "g");
        assert_eq!(sender, "alice");
        assert_eq!(plain, b"hi group");
    }

    #[test]
    fn signature_by_wrong_identity_rejected() {
        let alice = Member::new("alice");
        let bob = Member::new("bob");
        let mallory = IdentityKeyPair::generate(0);

        let dist = alice.engine.make_sender_key_dist("g", &alice.signer(), 0).unwrap();
        assert!(bob
            .engine
            .handle_sender_key_dist("alice", mallory.sig_public(), &dist)
            .is_err());

        bob.engine
            .handle_sender_key_dist("alice", alice.identity.sig_public(), &dist)
            .unwrap();
        let (payload, _) = alice
            .engine
            .encrypt_group_message("g", &alice.signer(), b"m", 0)
            .unwrap();
        assert!(bob
            .engine
            .decrypt_group_message(&payload, mallory.sig_public())
            .is_err());
    }

    #[test]
    fn out_of_order_group_messages() {
        let alice = Member::new("alice");
        let bob = Member::new("bob");
        let dist = alice.engine.make_sender_key_dist("g", &alice.signer(), 0).unwrap();
        bob.engine
            .handle_sender_key_dist("alice", alice.identity.sig_public(), &dist)
            .unwrap();

        let mut wires = Vec::new();
        for i in 0..4u8 {
            let (w, _) = alice
                .engine
                .encrypt_group_message("g", &alice.signer(), &[i], 0)
                .unwrap();
            wires.push(w);
        }
        // Deliver in reverse.
        for (i, w) in wires.iter().enumerate().rev() {
            let (_, _, plain) = bob
                .engine
                .decrypt_group_message(w, alice.identity.sig_public())
                .unwrap();
            assert_eq!(plain, [i as u8]);
        }
        // Replay is a duplicate.
        assert!(bob
            .engine
            .decrypt_group_message(&wires[0], alice.identity.sig_public())
            .is_err());
    }

    #[test]
    fn stale_dist_discarded() {
        let alice = Member::new("alice");
        let bob = Member::new("bob");
        let dist = alice.engine.make_sender_key_dist("g", &alice.signer(), 0).unwrap();
        bob.engine
            .handle_sender_key_dist("alice", alice.identity.sig_public(), &dist)
            .unwrap();
        // The same dist again does not advance anything.
        assert!(!bob
            .engine
            .handle_sender_key_dist("alice", alice.identity.sig_public(), &dist)
            .unwrap());
    }

    #[test]
    fn rotation_on_message_threshold() {
        let alice = Member::new("alice");
        let chain = alice.engine.owned_chain("g", 0);
        chain.lock().message_count = ROTATION_MESSAGE_THRESHOLD;

        let (_, dist) = alice
            .engine
            .encrypt_group_message("g", &alice.signer(), b"x", 0)
            .unwrap();
        let dist = dist.expect("threshold must force a rotation");
        assert_eq!(dist.version, 2);
    }

    #[test]
    fn kick_rotates_every_owned_group() {
        let alice = Member::new("alice");
        for g in ["g1", "g2", "g3"] {
            let (_, _) = alice
                .engine
                .encrypt_group_message(g, &alice.signer(), b"seed", 0)
                .unwrap();
        }
        let dists = alice.engine.rotate_all_owned(&alice.signer(), 1000).unwrap();
        assert_eq!(dists.len(), 3);
        for dist in &dists {
            assert_eq!(dist.version, 2);
            assert_eq!(dist.iteration, 0);
        }

        // Old messages remain decryptable on the receiver via the skip
        // window until the new dist replaces the chain.
        let bob = Member::new("bob");
        let d1 = alice.engine.make_sender_key_dist("g1", &alice.signer(), 1000).unwrap();
        bob.engine
            .handle_sender_key_dist("alice", alice.identity.sig_public(), &d1)
            .unwrap();
        let (w, _) = alice
            .engine
            .encrypt_group_message("g1", &alice.signer(), b"fresh", 1000)
            .unwrap();
        let (_, _, plain) = bob
            .engine
            .decrypt_group_message(&w, alice.identity.sig_public())
            .unwrap();
        assert_eq!(plain, b"fresh");
    }

    #[test]
    fn call_key_flow() {
        let alice = Member::new("alice");
        let bob = Member::new("bob");
        let call_id = [7u8; 16];

        let key = alice.engine.new_call_key("g", &call_id);
        assert_eq!(key.key_id, 1);
        let dist = alice
            .engine
            .make_call_key_dist("g", &call_id, &alice.signer())
            .unwrap();
        assert!(bob
            .engine
            .handle_call_key_dist(alice.identity.sig_public(), &dist)
            .unwrap());
        assert_eq!(
            bob.engine.call_key("g", &call_id).unwrap().call_key,
            key.call_key
        );

        // Stale key id does not replace a newer one.
        let newer = alice.engine.new_call_key("g", &call_id);
        assert_eq!(newer.key_id, 2);
        let newer_dist = alice
            .engine
            .make_call_key_dist("g", &call_id, &alice.signer())
            .unwrap();
        bob.engine
            .handle_call_key_dist(alice.identity.sig_public(), &newer_dist)
            .unwrap();
        assert!(!bob
            .engine
            .handle_call_key_dist(alice.identity.sig_public(), &dist)
            .unwrap());
    }
}
