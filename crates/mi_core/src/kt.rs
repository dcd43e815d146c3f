//! Key-Transparency state machine.
//!
//! Wraps the pure proof verification from `mi_crypto::kt` with the client's
//! local view of the log: the last accepted `(tree_size, root)`, the
//! configured root public key, and the gossip-mismatch accounting.
//!
//! A fetched bundle is accepted only when
//!   1. the inclusion proof reproduces the advertised root,
//!   2. the advertised tree extends the local view (equal size → equal
//!      root with an empty proof; larger size → valid consistency proof;
//!      smaller size → rollback, always fatal),
//!   3. the STH signature verifies, when required.
//!
//! Any rejection increments the gossip counter; at the configured threshold
//! the sticky alert flag raises so the UI can warn about a split view. The
//! local view moves forward and persists (atomically) only after all checks
//! pass. KT failures are never recovered internally.

use std::path::PathBuf;

use mi_crypto::identity::IdentityKeyPair;
use mi_crypto::kt as ktproof;

use crate::config::KtSettings;
use crate::error::{CoreError, Result};
use crate::fsutil;

const KT_STATE_MAGIC: [u8; 4] = *b"MIKT";
const KT_STATE_VERSION: u8 = 1;
const KT_STATE_BYTES: usize = 4 + 1 + 8 + 32;
pub const STH_SIGNATURE_BYTES: usize = ktproof::STH_SIGNATURE_BYTES;

/// Proof fields carried by a `PreKeyFetch` response.
#[derive(Debug, Clone)]
pub struct KtProof {
    pub tree_size: u64,
    pub root: [u8; 32],
    pub leaf_index: u64,
    pub audit_path: Vec<[u8; 32]>,
    pub consistency_path: Vec<[u8; 32]>,
    pub sth_signature: Vec<u8>,
}

pub struct KtVerifier {
    state_path: PathBuf,
    tree_size: u64,
    root: [u8; 32],
    require_signature: bool,
    root_pubkey: Option<Vec<u8>>,
    gossip_alert_threshold: u32,
    gossip_mismatch_count: u32,
    gossip_alerted: bool,
}

impl KtVerifier {
    pub fn load(state_path: PathBuf, settings: &KtSettings, root_pubkey: Option<Vec<u8>>) -> Result<Self> {
        let mut verifier = Self {
            state_path,
            tree_size: 0,
            root: [0u8; 32],
            require_signature: settings.require_signature,
            root_pubkey,
            gossip_alert_threshold: settings.gossip_alert_threshold,
            gossip_mismatch_count: 0,
            gossip_alerted: false,
        };
        verifier.load_state()?;
        Ok(verifier)
    }

    pub fn tree_size(&self) -> u64 {
        self.tree_size
    }

    pub fn root(&self) -> &[u8; 32] {
        &self.root
    }

    pub fn gossip_mismatch_count(&self) -> u32 {
        self.gossip_mismatch_count
    }

    pub fn gossip_alerted(&self) -> bool {
        self.gossip_alerted
    }

    fn load_state(&mut self) -> Result<()> {
        if !self.state_path.exists() {
            return Ok(());
        }
        let bytes = fsutil::read_limited(&self.state_path, 4096)
            .map_err(|e| CoreError::Kt(format!("read kt state: {e}")))?;
        if bytes.len() != KT_STATE_BYTES
            || bytes[..4] != KT_STATE_MAGIC
            || bytes[4] != KT_STATE_VERSION
        {
            return Err(CoreError::Kt("kt state corrupt".into()));
        }
        self.tree_size = u64::from_le_bytes(bytes[5..13].try_into().unwrap());
        self.root.copy_from_slice(&bytes[13..45]);
        Ok(())
    }

    fn save_state(&self) -> Result<()> {
        let mut bytes = Vec::with_capacity(KT_STATE_BYTES);
        bytes.extend_from_slice(&KT_STATE_MAGIC);
        bytes.push(KT_STATE_VERSION);
        bytes.extend_from_slice(&self.tree_size.to_le_bytes());
        bytes.extend_from_slice(&self.root);
        fsutil::write_atomic(&self.state_path, &bytes)
            .map_err(|e| CoreError::Kt(format!("write kt state: {e}")))
    }

    fn mismatch(&mut self, what: &str) -> CoreError {
        self.gossip_mismatch_count = self.gossip_mismatch_count.saturating_add(1);
        if self.gossip_mismatch_count >= self.gossip_alert_threshold {
            if !self.gossip_alerted {
                tracing::warn!(
                    count = self.gossip_mismatch_count,
                    "kt gossip mismatches crossed alert threshold"
                );
            }
            self.gossip_alerted = true;
        }
        CoreError::Kt(what.into())
    }

    /// Verify one fetched bundle against its proof; commit and persist the
    /// advanced view on success.
    pub fn verify_and_commit(
        &mut self,
        peer_username: &str,
        bundle_bytes: &[u8],
        proof: &KtProof,
    ) -> Result<()> {
        if proof.tree_size == 0 || proof.leaf_index >= proof.tree_size {
            return Err(self.mismatch("kt response invalid"));
        }

        // The leaf commits to the bundle's identity-key prefix.
        let (id_sig_pk, id_dh_pk) = bundle_identity_keys(bundle_bytes)?;
        let leaf = ktproof::leaf_hash(peer_username, &id_sig_pk, &id_dh_pk);

        let computed =
            ktproof::root_from_audit_path(&leaf, proof.leaf_index, proof.tree_size, &proof.audit_path);
        if computed != Some(proof.root) {
            return Err(self.mismatch("kt inclusion proof invalid"));
        }

        if self.tree_size > 0 {
            if proof.tree_size < self.tree_size {
                return Err(self.mismatch("kt tree rolled back"));
            }
            if proof.tree_size == self.tree_size {
                if proof.root != self.root || !proof.consistency_path.is_empty() {
                    return Err(self.mismatch("kt split view"));
                }
            } else if !ktproof::verify_consistency(
                self.tree_size,
                proof.tree_size,
                &self.root,
                &proof.root,
                &proof.consistency_path,
            ) {
                return Err(self.mismatch("kt consistency proof invalid"));
            }
        }

        if self.require_signature {
            let pubkey = match &self.root_pubkey {
                Some(k) => k.clone(),
                None => return Err(CoreError::Kt("kt root pubkey missing".into())),
            };
            if proof.sth_signature.len() != STH_SIGNATURE_BYTES {
                return Err(self.mismatch("kt signature size invalid"));
            }
            let message = ktproof::sth_signature_message(proof.tree_size, &proof.root);
            if IdentityKeyPair::verify(&pubkey, &message, &proof.sth_signature).is_err() {
                return Err(self.mismatch("kt signature invalid"));
            }
        }

        self.gossip_mismatch_count = 0;
        self.gossip_alerted = false;
        self.tree_size = proof.tree_size;
        self.root = proof.root;
        self.save_state()
    }
}

/// Pull the identity keys out of a bundle's fixed prefix without a full
/// decode: `version(1) || id_sig_pk(32) || id_dh_pk(32) || …`.
fn bundle_identity_keys(bundle: &[u8]) -> Result<([u8; 32], [u8; 32])> {
    if bundle.len() < 1 + 32 + 32 {
        return Err(CoreError::Protocol("bundle too short for kt leaf".into()));
    }
    let sig: [u8; 32] = bundle[1..33].try_into().unwrap();
    let dh: [u8; 32] = bundle[33..65].try_into().unwrap();
    Ok((sig, dh))
}

#[cfg(test)]
mod tests {
    use super::*;
    use sha2::{Digest, Sha256};

    // Reference RFC 6962 tree over user bundles, mirroring the server side.

    struct TestLog {
        leaves: Vec<Vec<u8>>, // raw leaf_data (pre 0x00-prefix)
    }

    fn leaf_data(username: &str, sig: &[u8; 32], dh: &[u8; 32]) -> Vec<u8> {
        let mut d = Vec::new();
        d.extend_from_slice(b"mi_e2ee_kt_leaf_v1");
        d.push(0);
        d.extend_from_slice(username.as_bytes());
        d.push(0);
        d.extend_from_slice(sig);
        d.extend_from_slice(dh);
        d
    }

    fn hash_leaf(data: &[u8]) -> [u8; 32] {
        let mut h = Sha256::new();
        h.update([0u8]);
        h.update(data);
        h.finalize().into()
    }

    fn hash_node(l: &[u8; 32], r: &[u8; 32]) -> [u8; 32] {
        let mut h = Sha256::new();
        h.update([1u8]);
        h.update(l);
        h.update(r);
        h.finalize().into()
    }

    fn split(n: usize) -> usize {
        let mut k = 1;
        while k << 1 < n {
            k <<= 1;
        }
        k
    }

    impl TestLog {
        fn mth(&self, lo: usize, hi: usize) -> [u8; 32] {
            if hi - lo == 1 {
                return hash_leaf(&self.leaves[lo]);
            }
            let k = split(hi - lo);
            hash_node(&self.mth(lo, lo + k), &self.mth(lo + k, hi))
        }

        fn audit(&self, m: usize, lo: usize, hi: usize) -> Vec<[u8; 32]> {
            if hi - lo <= 1 {
                return Vec::new();
            }
            let k = split(hi - lo);
            if m - lo < k {
                let mut p = self.audit(m, lo, lo + k);
                p.insert(0, self.mth(lo + k, hi));
                p
            } else {
                let mut p = self.audit(m, lo + k, hi);
                p.insert(0, self.mth(lo, lo + k));
                p
            }
        }

        fn consistency(&self, old: usize) -> Vec<[u8; 32]> {
            fn sub(log: &TestLog, m: usize, lo: usize, hi: usize, b: bool) -> Vec<[u8; 32]> {
                let n = hi - lo;
                if m == n {
                    return if b { Vec::new() } else { vec![log.mth(lo, hi)] };
                }
                let k = split(n);
                if m <= k {
                    let mut p = sub(log, m, lo, lo + k, b);
                    p.insert(0, log.mth(lo + k, hi));
                    p
                } else {
                    let mut p = sub(log, m - k, lo + k, hi, false);
                    p.insert(0, log.mth(lo, lo + k));
                    p
                }
            }
            sub(self, old, 0, self.leaves.len(), true)
        }

        fn proof_for(&self, index: usize, old_size: usize) -> KtProof {
            KtProof {
                tree_size: self.leaves.len() as u64,
                root: self.mth(0, self.leaves.len()),
                leaf_index: index as u64,
                audit_path: self.audit(index, 0, self.leaves.len()),
                consistency_path: if old_size > 0 && old_size < self.leaves.len() {
                    self.consistency(old_size)
                } else {
                    Vec::new()
                },
                sth_signature: Vec::new(),
            }
        }
    }

    fn bundle_for(sig: &[u8; 32], dh: &[u8; 32]) -> Vec<u8> {
        let mut b = vec![1u8];
        b.extend_from_slice(sig);
        b.extend_from_slice(dh);
        b
    }

    fn log_of(n: usize) -> (TestLog, Vec<Vec<u8>>) {
        let mut leaves = Vec::new();
        let mut bundles = Vec::new();
        for i in 0..n {
            let sig = [i as u8; 32];
            let dh = [0x80 | i as u8; 32];
            leaves.push(leaf_data(&format!("user-{i}"), &sig, &dh));
            bundles.push(bundle_for(&sig, &dh));
        }
        (TestLog { leaves }, bundles)
    }

    fn verifier(dir: &tempfile::TempDir, settings: KtSettings) -> KtVerifier {
        KtVerifier::load(dir.path().join("kt_state.bin"), &settings, None).unwrap()
    }

    #[test]
    fn accepts_and_advances_then_persists() {
        let dir = tempfile::tempdir().unwrap();
        let mut kt = verifier(&dir, KtSettings::default());

        let (log, bundles) = log_of(5);
        kt.verify_and_commit("user-2", &bundles[2], &log.proof_for(2, 0)).unwrap();
        assert_eq!(kt.tree_size(), 5);

        // Growing the log with a consistency proof advances the view.
        let (log9, bundles9) = log_of(9);
        kt.verify_and_commit("user-7", &bundles9[7], &log9.proof_for(7, 5)).unwrap();
        assert_eq!(kt.tree_size(), 9);
        assert_eq!(kt.gossip_mismatch_count(), 0);

        // The committed view survives a reload.
        let kt2 = verifier(&dir, KtSettings::default());
        assert_eq!(kt2.tree_size(), 9);
        assert_eq!(kt2.root(), kt.root());
    }

    #[test]
    fn rollback_is_fatal_and_counted() {
        let dir = tempfile::tempdir().unwrap();
        let mut kt = verifier(&dir, KtSettings::default());

        let (log, bundles) = log_of(100);
        kt.verify_and_commit("user-3", &bundles[3], &log.proof_for(3, 0)).unwrap();
        assert_eq!(kt.tree_size(), 100);

        let (log95, bundles95) = log_of(95);
        let err = kt
            .verify_and_commit("user-3", &bundles95[3], &log95.proof_for(3, 0))
            .unwrap_err();
        assert!(matches!(err, CoreError::Kt(ref m) if m.contains("rolled back")));
        // State unchanged, mismatch counted.
        assert_eq!(kt.tree_size(), 100);
        assert_eq!(kt.gossip_mismatch_count(), 1);
        assert!(!kt.gossip_alerted());
    }

    #[test]
    fn split_view_and_alert_threshold() {
        let dir = tempfile::tempdir().unwrap();
        let mut kt = verifier(&dir, KtSettings::default());

        let (log, bundles) = log_of(4);
        kt.verify_and_commit("user-1", &bundles[1], &log.proof_for(1, 0)).unwrap();

        // Same size, different root: a split view, three strikes → alert.
        let (forked, fbundles) = {
            let mut leaves = Vec::new();
            let mut bundles = Vec::new();
            for i in 0..4 {
                let sig = [0x40 | i as u8; 32];
                let dh = [0xC0 | i as u8; 32];
                leaves.push(leaf_data(&format!("user-{i}"), &sig, &dh));
                bundles.push(bundle_for(&sig, &dh));
            }
            (TestLog { leaves }, bundles)
        };
        for strike in 1..=3u32 {
            let err = kt
                .verify_and_commit("user-1", &fbundles[1], &forked.proof_for(1, 0))
                .unwrap_err();
            assert!(matches!(err, CoreError::Kt(_)));
            assert_eq!(kt.gossip_mismatch_count(), strike);
        }
        assert!(kt.gossip_alerted());

        // A clean fetch clears the accounting.
        let (log8, bundles8) = log_of(8);
        kt.verify_and_commit("user-6", &bundles8[6], &log8.proof_for(6, 4)).unwrap();
        assert_eq!(kt.gossip_mismatch_count(), 0);
        assert!(!kt.gossip_alerted());
    }

    #[test]
    fn tampered_audit_path_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut kt = verifier(&dir, KtSettings::default());
        let (log, bundles) = log_of(7);
        let mut proof = log.proof_for(4, 0);
        proof.audit_path[0][5] ^= 1;
        assert!(kt.verify_and_commit("user-4", &bundles[4], &proof).is_err());
        assert_eq!(kt.tree_size(), 0);
    }

    #[test]
    fn sth_signature_enforced_when_required() {
        let dir = tempfile::tempdir().unwrap();
        let root_key = IdentityKeyPair::generate(0);
        let settings = KtSettings {
            require_signature: true,
            ..Default::default()
        };
        let mut kt = KtVerifier::load(
            dir.path().join("kt_state.bin"),
            &settings,
            Some(root_key.sig_public().to_vec()),
        )
        .unwrap();

        let (log, bundles) = log_of(3);
        let mut proof = log.proof_for(0, 0);

        // Unsigned proof rejects.
        assert!(kt.verify_and_commit("user-0", &bundles[0], &proof).is_err());

        // Properly signed proof accepts.
        let message = ktproof::sth_signature_message(proof.tree_size, &proof.root);
        proof.sth_signature = root_key.sign(&message).to_vec();
        kt.verify_and_commit("user-0", &bundles[0], &proof).unwrap();

        // A signature by another key rejects.
        let (log4, bundles4) = log_of(4);
        let mut proof4 = log4.proof_for(3, 3);
        let rogue = IdentityKeyPair::generate(0);
        let message4 = ktproof::sth_signature_message(proof4.tree_size, &proof4.root);
        proof4.sth_signature = rogue.sign(&message4).to_vec();
        assert!(kt.verify_and_commit("user-3", &bundles4[3], &proof4).is_err());
    }
}
