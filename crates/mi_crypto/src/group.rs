//! Group sender-key chains.
//!
//! Every (group, sender) pair owns one symmetric chain: a 32-byte chain key
//! advanced by HKDF once per message (`mi_e2ee_group_sender_ck_v1`, 64-byte
//! output split into next-chain-key / message-key). Receivers track the same
//! chain and keep a bounded FIFO window of skipped message keys so reordered
//! group traffic still decrypts.
//!
//! A chain is replaced — fresh random chain key, `version + 1` — when any of
//! the rotation triggers fires: message count, chain age, or a membership
//! change. Distributions whose `(version, iteration)` do not advance the
//! observed state are discarded.

use std::collections::{HashMap, VecDeque};

use rand::{rngs::OsRng, RngCore};
use zeroize::Zeroize;

use crate::{error::CryptoError, kdf};

pub const MAX_GROUP_SKIPPED_MESSAGE_KEYS: usize = 2048;
pub const MAX_GROUP_SKIP: u32 = 4096;
pub const ROTATION_MESSAGE_THRESHOLD: u64 = 10_000;
pub const ROTATION_INTERVAL_SEC: u64 = 7 * 24 * 60 * 60;

// ── Receiving / shared chain state ───────────────────────────────────────────

/// Chain state for one (group, sender).
#[derive(Clone)]
pub struct SenderChain {
    ck: [u8; 32],
    pub next_iteration: u32,
    pub version: u32,
    skipped: HashMap<u32, [u8; 32]>,
    skipped_order: VecDeque<u32>,
}

impl Drop for SenderChain {
    fn drop(&mut self) {
        self.ck.zeroize();
        for (_, mk) in self.skipped.iter_mut() {
            mk.zeroize();
        }
    }
}

impl SenderChain {
    pub fn new(ck: [u8; 32], version: u32, iteration: u32) -> Self {
        Self {
            ck,
            next_iteration: iteration,
            version,
            skipped: HashMap::new(),
            skipped_order: VecDeque::new(),
        }
    }

    pub fn chain_key(&self) -> &[u8; 32] {
        &self.ck
    }

    /// Replace the chain from a sender-key distribution.
    /// Returns false (state untouched) if `(version, iteration)` regresses.
    pub fn accept_dist(&mut self, version: u32, iteration: u32, ck: [u8; 32]) -> bool {
        if (version, iteration) <= (self.version, self.next_iteration) {
            return false;
        }
        if version != self.version {
            // New chain generation: the old skip window is useless.
            for (_, mk) in self.skipped.iter_mut() {
                mk.zeroize();
            }
            self.skipped.clear();
            self.skipped_order.clear();
        }
        self.ck.zeroize();
        self.ck = ck;
        self.version = version;
        self.next_iteration = iteration;
        true
    }

    /// Sender side: advance once. Returns (iteration used, message key).
    pub fn advance(&mut self) -> Result<(u32, [u8; 32]), CryptoError> {
        let iteration = self.next_iteration;
        let (next_ck, mk) = kdf::group_chain_step(&self.ck)?;
        self.ck.zeroize();
        self.ck = next_ck;
        self.next_iteration = self
            .next_iteration
            .checked_add(1)
            .ok_or_else(|| CryptoError::RatchetStep("group iteration overflow".into()))?;
        Ok((iteration, mk))
    }

    /// Receiver side: derive the key for `iteration`, skipping forward and
    /// caching gap keys (bounded) as needed.
    pub fn message_key(&mut self, iteration: u32) -> Result<[u8; 32], CryptoError> {
        if iteration < self.next_iteration {
            return match self.skipped.remove(&iteration) {
                Some(mk) => {
                    self.skipped_order.retain(|n| *n != iteration);
                    Ok(mk)
                }
                None => Err(CryptoError::DuplicateMessage),
            };
        }
        if iteration - self.next_iteration > MAX_GROUP_SKIP {
            return Err(CryptoError::SkippedKeyLimit);
        }

        while self.next_iteration < iteration {
            let (next_ck, mk) = kdf::group_chain_step(&self.ck)?;
            self.skipped.insert(self.next_iteration, mk);
            self.skipped_order.push_back(self.next_iteration);
            self.ck.zeroize();
            self.ck = next_ck;
            self.next_iteration += 1;
            self.enforce_skipped_limit();
        }

        let (next_ck, mk) = kdf::group_chain_step(&self.ck)?;
        self.ck.zeroize();
        self.ck = next_ck;
        self.next_iteration += 1;
        Ok(mk)
    }

    fn enforce_skipped_limit(&mut self) {
        while self.skipped.len() > MAX_GROUP_SKIPPED_MESSAGE_KEYS {
            match self.skipped_order.pop_front() {
                Some(oldest) => {
                    if let Some(mut mk) = self.skipped.remove(&oldest) {
                        mk.zeroize();
                    }
                }
                None => {
                    self.skipped.clear();
                    return;
                }
            }
        }
    }

    pub fn skipped_len(&self) -> usize {
        self.skipped.len()
    }

    /// Copy the chain state out for persistence (skipped keys in FIFO order).
    pub fn snapshot(&self) -> GroupChainSnapshot {
        GroupChainSnapshot {
            ck: self.ck,
            next_iteration: self.next_iteration,
            version: self.version,
            skipped: self
                .skipped_order
                .iter()
                .filter_map(|n| self.skipped.get(n).map(|mk| (*n, *mk)))
                .collect(),
        }
    }

    /// Rebuild a chain from a persisted snapshot.
    pub fn restore(snapshot: &GroupChainSnapshot) -> Self {
        let mut skipped = HashMap::with_capacity(snapshot.skipped.len());
        let mut skipped_order = VecDeque::with_capacity(snapshot.skipped.len());
        for (n, mk) in &snapshot.skipped {
            skipped.insert(*n, *mk);
            skipped_order.push_back(*n);
        }
        Self {
            ck: snapshot.ck,
            next_iteration: snapshot.next_iteration,
            version: snapshot.version,
            skipped,
            skipped_order,
        }
    }
}

/// Plain-data form of a sender chain for the storage layer.
pub struct GroupChainSnapshot {
    pub ck: [u8; 32],
    pub next_iteration: u32,
    pub version: u32,
    pub skipped: Vec<(u32, [u8; 32])>,
}

impl Drop for GroupChainSnapshot {
    fn drop(&mut self) {
        self.ck.zeroize();
        for (_, mk) in self.skipped.iter_mut() {
            mk.zeroize();
        }
    }
}

// ── Owned (sending) chain ────────────────────────────────────────────────────

/// The local member's own chain for a group, plus rotation bookkeeping.
pub struct OwnedSenderChain {
    pub chain: SenderChain,
    pub message_count: u64,
    pub created_at_ms: u64,
}

impl OwnedSenderChain {
    pub fn fresh(version: u32, now_ms: u64) -> Self {
        let mut ck = [0u8; 32];
        OsRng.fill_bytes(&mut ck);
        Self {
            chain: SenderChain::new(ck, version, 0),
            message_count: 0,
            created_at_ms: now_ms,
        }
    }

    pub fn needs_rotation(&self, now_ms: u64) -> bool {
        if self.message_count >= ROTATION_MESSAGE_THRESHOLD {
            return true;
        }
        let age_sec = now_ms.saturating_sub(self.created_at_ms) / 1000;
        age_sec >= ROTATION_INTERVAL_SEC
    }

    /// Fresh random chain key, next version, zeroed counters.
    pub fn rotate(&mut self, now_ms: u64) {
        let version = self.chain.version + 1;
        *self = Self::fresh(version, now_ms);
    }

    pub fn advance(&mut self) -> Result<(u32, [u8; 32]), CryptoError> {
        let out = self.chain.advance()?;
        self.message_count += 1;
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sender_receiver_stay_in_sync() {
        let ck = [9u8; 32];
        let mut sender = SenderChain::new(ck, 1, 0);
        let mut receiver = SenderChain::new(ck, 1, 0);

        for _ in 0..5 {
            let (iter, mk_s) = sender.advance().unwrap();
            let mk_r = receiver.message_key(iter).unwrap();
            assert_eq!(mk_s, mk_r);
        }
    }

    #[test]
    fn out_of_order_within_window() {
        let ck = [1u8; 32];
        let mut sender = SenderChain::new(ck, 1, 0);
        let mut receiver = SenderChain::new(ck, 1, 0);

        let mut keys = Vec::new();
        for _ in 0..4 {
            keys.push(sender.advance().unwrap());
        }
        // Deliver iteration 3 first, then 0..2.
        let (i3, mk3) = keys[3];
        assert_eq!(receiver.message_key(i3).unwrap(), mk3);
        assert_eq!(receiver.skipped_len(), 3);
        for &(i, mk) in &keys[..3] {
            assert_eq!(receiver.message_key(i).unwrap(), mk);
        }
        // Replay of a consumed iteration is a duplicate.
        assert!(matches!(
            receiver.message_key(0),
            Err(CryptoError::DuplicateMessage)
        ));
    }

    #[test]
    fn skip_window_bounds() {
        let mut receiver = SenderChain::new([2u8; 32], 1, 0);
        assert!(matches!(
            receiver.message_key(MAX_GROUP_SKIP + 1),
            Err(CryptoError::SkippedKeyLimit)
        ));

        // A large in-bounds jump evicts the oldest keys FIFO.
        receiver.message_key(MAX_GROUP_SKIP).unwrap();
        assert_eq!(receiver.skipped_len(), MAX_GROUP_SKIPPED_MESSAGE_KEYS);
        // Iteration 0 was evicted; a late arrival reads as duplicate.
        assert!(matches!(
            receiver.message_key(0),
            Err(CryptoError::DuplicateMessage)
        ));
    }

    #[test]
    fn dist_regression_is_discarded() {
        let mut chain = SenderChain::new([3u8; 32], 2, 10);
        assert!(!chain.accept_dist(2, 10, [4u8; 32]));
        assert!(!chain.accept_dist(1, 50, [4u8; 32]));
        assert!(chain.accept_dist(2, 11, [4u8; 32]));
        assert!(chain.accept_dist(3, 0, [5u8; 32]));
        assert_eq!(chain.version, 3);
        assert_eq!(chain.next_iteration, 0);
    }

    #[test]
    fn rotation_triggers() {
        let mut owned = OwnedSenderChain::fresh(1, 0);
        assert!(!owned.needs_rotation(1000));

        owned.message_count = ROTATION_MESSAGE_THRESHOLD;
        assert!(owned.needs_rotation(1000));

        let mut aged = OwnedSenderChain::fresh(1, 0);
        assert!(aged.needs_rotation(ROTATION_INTERVAL_SEC * 1000));

        let old_version = aged.chain.version;
        let old_ck = *aged.chain.chain_key();
        aged.rotate(5000);
        assert_eq!(aged.chain.version, old_version + 1);
        assert_ne!(*aged.chain.chain_key(), old_ck);
        assert_eq!(aged.message_count, 0);
    }
}
