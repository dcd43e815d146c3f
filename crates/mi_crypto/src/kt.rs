//! Key-Transparency Merkle proof verification.
//!
//! The server maintains an append-only Merkle tree over user → identity-key
//! mappings (RFC 6962 hashing: leaves under a 0x00 prefix, inner nodes under
//! 0x01). A prekey-bundle fetch arrives with:
//!
//!   - an *inclusion* (audit) path proving the peer's leaf is in the tree the
//!     signed root describes, and
//!   - a *consistency* path proving the new tree is an append-only extension
//!     of the tree size/root this client last accepted.
//!
//! Both verifications are pure functions here; rollback detection, gossip
//! accounting, and state persistence live in the core.
//!
//! The consistency recursion mirrors RFC 6962 §2.1.2: it starts from the old
//! boundary node with the "is on the old boundary" flag true, and the tree
//! size argument at entry is the OLD size. Paths are consumed back-to-front;
//! a path that is not fully consumed is a rejection.

use sha2::{Digest, Sha256};

pub type Sha256Hash = [u8; 32];

pub const STH_SIGNATURE_BYTES: usize = 64;

fn largest_power_of_two_less_than(n: u64) -> u64 {
    if n <= 1 {
        return 0;
    }
    let mut k = 1u64;
    while (k << 1) < n {
        k <<= 1;
    }
    k
}

fn hash_node(left: &Sha256Hash, right: &Sha256Hash) -> Sha256Hash {
    let mut h = Sha256::new();
    h.update([0x01]);
    h.update(left);
    h.update(right);
    h.finalize().into()
}

fn hash_leaf(leaf_data: &[u8]) -> Sha256Hash {
    let mut h = Sha256::new();
    h.update([0x00]);
    h.update(leaf_data);
    h.finalize().into()
}

/// Leaf for a user's identity entry:
/// `SHA-256(0x00 || "mi_e2ee_kt_leaf_v1" || 0x00 || username || 0x00 ||
/// id_sig_pk || id_dh_pk)`.
pub fn leaf_hash(username: &str, id_sig_pk: &[u8; 32], id_dh_pk: &[u8; 32]) -> Sha256Hash {
    let mut data = Vec::with_capacity(18 + 1 + username.len() + 1 + 64);
    data.extend_from_slice(b"mi_e2ee_kt_leaf_v1");
    data.push(0);
    data.extend_from_slice(username.as_bytes());
    data.push(0);
    data.extend_from_slice(id_sig_pk);
    data.extend_from_slice(id_dh_pk);
    hash_leaf(&data)
}

// ── Inclusion ────────────────────────────────────────────────────────────────

fn root_rec(
    leaf: &Sha256Hash,
    m: u64,
    n: u64,
    path: &[Sha256Hash],
    end: &mut usize,
) -> Option<Sha256Hash> {
    if n == 1 {
        if *end != 0 {
            return None;
        }
        return Some(*leaf);
    }
    if *end == 0 {
        return None;
    }
    let k = largest_power_of_two_less_than(n);
    if k == 0 {
        return None;
    }
    let sibling = path[*end - 1];
    *end -= 1;
    if m < k {
        let left = root_rec(leaf, m, k, path, end)?;
        Some(hash_node(&left, &sibling))
    } else {
        let right = root_rec(leaf, m - k, n - k, path, end)?;
        Some(hash_node(&sibling, &right))
    }
}

/// Recompute the root implied by an audit path.
///
/// Returns `None` on malformed input (bad index, wrong path length). The
/// caller compares the result against the signed root.
pub fn root_from_audit_path(
    leaf_hash: &Sha256Hash,
    leaf_index: u64,
    tree_size: u64,
    audit_path: &[Sha256Hash],
) -> Option<Sha256Hash> {
    if tree_size == 0 || leaf_index >= tree_size {
        return None;
    }
    let mut end = audit_path.len();
    let root = root_rec(leaf_hash, leaf_index, tree_size, audit_path, &mut end)?;
    if end != 0 {
        return None;
    }
    Some(root)
}

// ── Consistency ──────────────────────────────────────────────────────────────

#[allow(clippy::too_many_arguments)]
fn consistency_rec(
    m: u64,
    n: u64,
    on_old_boundary: bool,
    old_root: &Sha256Hash,
    proof: &[Sha256Hash],
    end: &mut usize,
) -> Option<(Sha256Hash, Sha256Hash)> {
    if m == 0 || n == 0 || m > n {
        return None;
    }
    if m == n {
        if on_old_boundary {
            return Some((*old_root, *old_root));
        }
        if *end == 0 {
            return None;
        }
        let node = proof[*end - 1];
        *end -= 1;
        return Some((node, node));
    }
    let k = largest_power_of_two_less_than(n);
    if k == 0 || *end == 0 {
        return None;
    }
    if m <= k {
        let right = proof[*end - 1];
        *end -= 1;
        let (left_old, left_new) =
            consistency_rec(m, k, on_old_boundary, old_root, proof, end)?;
        Some((left_old, hash_node(&left_new, &right)))
    } else {
        let left = proof[*end - 1];
        *end -= 1;
        let (right_old, right_new) =
            consistency_rec(m - k, n - k, false, old_root, proof, end)?;
        Some((hash_node(&left, &right_old), hash_node(&left, &right_new)))
    }
}

/// Verify that `(new_size, new_root)` extends `(old_size, old_root)`.
pub fn verify_consistency(
    old_size: u64,
    new_size: u64,
    old_root: &Sha256Hash,
    new_root: &Sha256Hash,
    proof: &[Sha256Hash],
) -> bool {
    if old_size == 0 || new_size == 0 || old_size > new_size {
        return false;
    }
    if old_size == new_size {
        return proof.is_empty() && old_root == new_root;
    }
    let mut end = proof.len();
    match consistency_rec(old_size, new_size, true, old_root, proof, &mut end) {
        Some((calc_old, calc_new)) => {
            end == 0 && &calc_old == old_root && &calc_new == new_root
        }
        None => false,
    }
}

// ── Signed tree head ─────────────────────────────────────────────────────────

/// Byte string the KT root key signs: `"MI_KT_STH_V1" || u64_le(tree_size)
/// || root`.
pub fn sth_signature_message(tree_size: u64, root: &Sha256Hash) -> Vec<u8> {
    let mut msg = Vec::with_capacity(12 + 8 + 32);
    msg.extend_from_slice(b"MI_KT_STH_V1");
    msg.extend_from_slice(&tree_size.to_le_bytes());
    msg.extend_from_slice(root);
    msg
}

#[cfg(test)]
mod tests {
    use super::*;

    // RFC 6962 reference construction over raw leaf blobs, used to exercise
    // the verifiers against honestly-built trees.

    fn mth(leaves: &[Vec<u8>]) -> Sha256Hash {
        match leaves.len() {
            0 => Sha256::digest([]).into(),
            1 => hash_leaf(&leaves[0]),
            n => {
                let k = largest_power_of_two_less_than(n as u64) as usize;
                let left = mth(&leaves[..k]);
                let right = mth(&leaves[k..]);
                hash_node(&left, &right)
            }
        }
    }

    fn audit_path(m: u64, leaves: &[Vec<u8>]) -> Vec<Sha256Hash> {
        let n = leaves.len() as u64;
        if n <= 1 {
            return Vec::new();
        }
        let k = largest_power_of_two_less_than(n);
        if m < k {
            let mut p = audit_path(m, &leaves[..k as usize]);
            p.insert(0, mth(&leaves[k as usize..]));
            p
        } else {
            let mut p = audit_path(m - k, &leaves[k as usize..]);
            p.insert(0, mth(&leaves[..k as usize]));
            p
        }
    }

    fn consistency_proof(m: u64, leaves: &[Vec<u8>]) -> Vec<Sha256Hash> {
        fn subproof(m: u64, leaves: &[Vec<u8>], b: bool) -> Vec<Sha256Hash> {
            let n = leaves.len() as u64;
            if m == n {
                return if b { Vec::new() } else { vec![mth(leaves)] };
            }
            let k = largest_power_of_two_less_than(n);
            if m <= k {
                let mut p = subproof(m, &leaves[..k as usize], b);
                p.insert(0, mth(&leaves[k as usize..]));
                p
            } else {
                let mut p = subproof(m - k, &leaves[k as usize..], false);
                p.insert(0, mth(&leaves[..k as usize]));
                p
            }
        }
        subproof(m, leaves, true)
    }

    fn leaves(n: usize) -> Vec<Vec<u8>> {
        (0..n).map(|i| format!("leaf-{i}").into_bytes()).collect()
    }

    #[test]
    fn inclusion_accepts_honest_paths() {
        for n in [1usize, 2, 3, 5, 7, 8, 13] {
            let ls = leaves(n);
            let root = mth(&ls);
            for m in 0..n as u64 {
                let path = audit_path(m, &ls);
                let leaf = hash_leaf(&ls[m as usize]);
                let calc = root_from_audit_path(&leaf, m, n as u64, &path).unwrap();
                assert_eq!(calc, root, "n={n} m={m}");
            }
        }
    }

    #[test]
    fn inclusion_rejects_bit_flips_and_bad_shapes() {
        let ls = leaves(7);
        let root = mth(&ls);
        let mut path = audit_path(3, &ls);
        let leaf = hash_leaf(&ls[3]);

        path[1][0] ^= 0x01;
        let calc = root_from_audit_path(&leaf, 3, 7, &path).unwrap();
        assert_ne!(calc, root);
        path[1][0] ^= 0x01;

        // Wrong length, out-of-range index, empty tree.
        assert!(root_from_audit_path(&leaf, 3, 7, &path[..path.len() - 1]).is_none());
        assert!(root_from_audit_path(&leaf, 7, 7, &path).is_none());
        assert!(root_from_audit_path(&leaf, 0, 0, &[]).is_none());
    }

    #[test]
    fn consistency_accepts_honest_extensions() {
        for (old, new) in [(1usize, 2usize), (2, 5), (3, 7), (4, 8), (6, 13), (8, 8)] {
            let ls = leaves(new);
            let old_root = mth(&ls[..old]);
            let new_root = mth(&ls);
            let proof = if old == new {
                Vec::new()
            } else {
                consistency_proof(old as u64, &ls)
            };
            assert!(
                verify_consistency(old as u64, new as u64, &old_root, &new_root, &proof),
                "old={old} new={new}"
            );
        }
    }

    #[test]
    fn consistency_rejects_tampering() {
        let ls = leaves(9);
        let old_root = mth(&ls[..5]);
        let new_root = mth(&ls);
        let proof = consistency_proof(5, &ls);
        assert!(verify_consistency(5, 9, &old_root, &new_root, &proof));

        // Any single-bit flip in the proof must reject.
        for i in 0..proof.len() {
            let mut bad = proof.clone();
            bad[i][0] ^= 1;
            assert!(!verify_consistency(5, 9, &old_root, &new_root, &bad));
        }
        // Shrinking trees and size games reject too.
        assert!(!verify_consistency(9, 5, &new_root, &old_root, &proof));
        assert!(!verify_consistency(0, 9, &old_root, &new_root, &proof));
        assert!(!verify_consistency(5, 5, &old_root, &new_root, &proof));
    }

    #[test]
    fn leaf_hash_separates_fields() {
        let a = leaf_hash("alice", &[1u8; 32], &[2u8; 32]);
        let b = leaf_hash("alice", &[2u8; 32], &[1u8; 32]);
        let c = leaf_hash("alicf", &[1u8; 32], &[2u8; 32]);
        assert_ne!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn sth_message_layout() {
        let msg = sth_signature_message(0x0102, &[7u8; 32]);
        assert_eq!(&msg[..12], b"MI_KT_STH_V1");
        assert_eq!(&msg[12..20], &0x0102u64.to_le_bytes());
        assert_eq!(&msg[20..], &[7u8; 32]);
    }
}
