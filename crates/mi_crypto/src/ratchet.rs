//! Double Ratchet with DH ratchet steps.
//!
//! References:
//!   - Signal Double Ratchet spec: <https://signal.org/docs/specifications/doubleratchet/>
//!
//! State separation (non-negotiable):
//!   RK  — root key (updated on every DH ratchet step)
//!   CKs — sending chain key (updated per message)
//!   CKr — receiving chain key (updated per message)
//!   MK  — message key (derived from CK, used once, then DELETED)
//!
//! Nonce scheme: each sending chain fixes an 8-byte random prefix at chain
//! start; the per-message nonce is `prefix || 0*8 || u64_le(counter)`. The
//! prefix travels in the (AEAD-authenticated) header, so the receiver can
//! reconstruct the nonce for in-order and skipped messages alike.
//!
//! Skip bounds: at most 2048 skipped keys per chain jump, at most 4096
//! stored per session, FIFO eviction by insertion order. A counter that was
//! already consumed and is absent from the skipped map is a duplicate.
//!
//! Decryption is transactional: all ratchet work happens on a scratch copy
//! of the state which replaces the live state only after the AEAD opens.
//! A forged or corrupted message can therefore never advance a chain.

use std::collections::{HashMap, VecDeque};

use rand::{rngs::OsRng, RngCore};
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};
use zeroize::{Zeroize, Zeroizing};

use crate::{aead, error::CryptoError, kdf};

/// Maximum skipped message keys derived in a single gap.
pub const MAX_SKIP: u64 = 2048;
/// Maximum skipped message keys stored per session.
pub const MAX_SKIPPED_TOTAL: usize = 4096;

// ── Ratchet header (sent alongside every ciphertext) ─────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RatchetHeader {
    /// Sender's current DH ratchet public key.
    pub dh_pub: [u8; 32],
    /// Message number in the current sending chain.
    pub n: u64,
    /// Length of the previous sending chain (for skip handling).
    pub pn: u64,
    /// Nonce prefix fixed at chain start.
    pub nonce_prefix: [u8; 8],
}

fn message_nonce(prefix: &[u8; 8], counter: u64) -> [u8; 24] {
    let mut nonce = [0u8; 24];
    nonce[..8].copy_from_slice(prefix);
    nonce[16..].copy_from_slice(&counter.to_le_bytes());
    nonce
}

/// AD binds the peer identity and the full header so a relay can neither
/// re-address nor re-number a ciphertext.
fn build_ad(peer_id: &str, dh_pub: &[u8; 32], n: u64, pn: u64) -> Vec<u8> {
    let mut ad = Vec::with_capacity(11 + 2 + peer_id.len() + 32 + 8 + 8);
    ad.extend_from_slice(b"MI_DR_AD_V1");
    ad.extend_from_slice(&(peer_id.len() as u16).to_le_bytes());
    ad.extend_from_slice(peer_id.as_bytes());
    ad.extend_from_slice(dh_pub);
    ad.extend_from_slice(&n.to_le_bytes());
    ad.extend_from_slice(&pn.to_le_bytes());
    ad
}

// ── Session state ────────────────────────────────────────────────────────────

/// Complete Double Ratchet session state for one peer.
#[derive(Clone)]
pub struct RatchetSession {
    pub peer_id: String,

    root_key: [u8; 32],

    dh_send_secret: [u8; 32],
    dh_send_pub: [u8; 32],
    send_ck: [u8; 32],
    send_ready: bool,
    pub send_n: u64,
    send_nonce_prefix: [u8; 8],

    dh_recv_pub: Option<[u8; 32]>,
    recv_ck: [u8; 32],
    pub recv_n: u64,
    pub prev_send_n: u64,

    /// (ratchet public, message number) → message key.
    skipped: HashMap<([u8; 32], u64), [u8; 32]>,
    skipped_order: VecDeque<([u8; 32], u64)>,
}

impl Drop for RatchetSession {
    fn drop(&mut self) {
        self.root_key.zeroize();
        self.dh_send_secret.zeroize();
        self.send_ck.zeroize();
        self.recv_ck.zeroize();
        for (_, mk) in self.skipped.iter_mut() {
            mk.zeroize();
        }
    }
}

fn random_prefix() -> [u8; 8] {
    let mut p = [0u8; 8];
    OsRng.fill_bytes(&mut p);
    p
}

impl RatchetSession {
    /// Create a session as the INITIATOR.
    ///
    /// The initiator holds the X3DH shared key and the peer's signed prekey
    /// (which becomes the first received ratchet key); the first DH ratchet
    /// step runs immediately so the first message already rides a fresh chain.
    pub fn init_initiator(
        peer_id: String,
        shared_key: [u8; 32],
        peer_spk_pub: &[u8; 32],
    ) -> Result<Self, CryptoError> {
        let dh_send_secret = StaticSecret::random_from_rng(OsRng);
        let dh_send_pub = X25519Public::from(&dh_send_secret).to_bytes();

        let dh_out = dh_send_secret.diffie_hellman(&X25519Public::from(*peer_spk_pub));
        let (root_key, send_ck) = kdf::kdf_rk(&shared_key, dh_out.as_bytes())?;

        Ok(Self {
            peer_id,
            root_key,
            dh_send_secret: dh_send_secret.to_bytes(),
            dh_send_pub,
            send_ck,
            send_ready: true,
            send_n: 0,
            send_nonce_prefix: random_prefix(),
            dh_recv_pub: Some(*peer_spk_pub),
            recv_ck: [0u8; 32],
            recv_n: 0,
            prev_send_n: 0,
            skipped: HashMap::new(),
            skipped_order: VecDeque::new(),
        })
    }

    /// Create a session as the RESPONDER.
    ///
    /// The responder's signed-prekey secret doubles as the first ratchet key;
    /// no sending chain exists until the initiator's first message arrives.
    pub fn init_responder(
        peer_id: String,
        shared_key: [u8; 32],
        my_spk_secret: &StaticSecret,
    ) -> Result<Self, CryptoError> {
        let spk_pub = X25519Public::from(my_spk_secret).to_bytes();
        Ok(Self {
            peer_id,
            root_key: shared_key,
            dh_send_secret: my_spk_secret.to_bytes(),
            dh_send_pub: spk_pub,
            send_ck: [0u8; 32],
            send_ready: false,
            send_n: 0,
            send_nonce_prefix: random_prefix(),
            dh_recv_pub: None,
            recv_ck: [0u8; 32],
            recv_n: 0,
            prev_send_n: 0,
            skipped: HashMap::new(),
            skipped_order: VecDeque::new(),
        })
    }

    pub fn our_ratchet_pub(&self) -> [u8; 32] {
        self.dh_send_pub
    }

    /// Root key accessor for derivations bound to the session (media root).
    pub fn root_key(&self) -> &[u8; 32] {
        &self.root_key
    }

    // ── Encrypt ──────────────────────────────────────────────────────────

    /// Encrypt one message. Returns the header and `ciphertext || tag`.
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<(RatchetHeader, Vec<u8>), CryptoError> {
        if !self.send_ready {
            return Err(CryptoError::RatchetStep(
                "responder has no sending chain before first receive".into(),
            ));
        }
        let (next_ck, mut mk) = kdf::kdf_ck(&self.send_ck)?;
        self.send_ck = next_ck;
        let header = RatchetHeader {
            dh_pub: self.dh_send_pub,
            n: self.send_n,
            pn: self.prev_send_n,
            nonce_prefix: self.send_nonce_prefix,
        };
        self.send_n += 1;

        let nonce = message_nonce(&header.nonce_prefix, header.n);
        let ad = build_ad(&self.peer_id, &header.dh_pub, header.n, header.pn);
        let out = aead::seal_with_nonce(&mk, &nonce, plaintext, &ad);
        mk.zeroize();
        Ok((header, out?))
    }

    // ── Decrypt ──────────────────────────────────────────────────────────

    /// Decrypt one message. State advances only if authentication succeeds.
    pub fn decrypt(
        &mut self,
        header: &RatchetHeader,
        ciphertext: &[u8],
    ) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
        let mut trial = self.clone();
        let mut mk = trial.message_key_for(header)?;

        let nonce = message_nonce(&header.nonce_prefix, header.n);
        let ad = build_ad(&self.peer_id, &header.dh_pub, header.n, header.pn);
        let plain = aead::open_with_nonce(&mk, &nonce, ciphertext, &ad);
        mk.zeroize();
        let plain = plain?;

        *self = trial;
        Ok(plain)
    }

    /// Derive the message key for a received header, advancing chains and
    /// populating the skipped-key map as needed.
    ///
    /// Handles three cases:
    ///   1. message from the current receiving chain (normal)
    ///   2. skipped message in the current or a previous chain
    ///   3. new ratchet public key → full DH ratchet turn
    fn message_key_for(&mut self, header: &RatchetHeader) -> Result<[u8; 32], CryptoError> {
        // Case 2: skipped keys first.
        if let Some(mk) = self.skipped.remove(&(header.dh_pub, header.n)) {
            self.skipped_order.retain(|k| k != &(header.dh_pub, header.n));
            return Ok(mk);
        }

        let need_dh_ratchet = match self.dh_recv_pub {
            Some(ref current) => current != &header.dh_pub,
            None => true,
        };

        if need_dh_ratchet {
            if self.dh_recv_pub.is_some() {
                self.skip_message_keys(header.pn)?;
            }
            self.dh_ratchet(&header.dh_pub)?;
        } else if header.n < self.recv_n {
            // Counter already consumed and key no longer stored.
            return Err(CryptoError::DuplicateMessage);
        }

        // Case 1 (and tail of case 3): walk to header.n.
        self.skip_message_keys(header.n)?;
        let (next_ck, mk) = kdf::kdf_ck(&self.recv_ck)?;
        self.recv_ck = next_ck;
        self.recv_n += 1;
        Ok(mk)
    }

    fn dh_ratchet(&mut self, peer_dh_pub: &[u8; 32]) -> Result<(), CryptoError> {
        self.dh_recv_pub = Some(*peer_dh_pub);
        let peer_dh = X25519Public::from(*peer_dh_pub);

        // Receiving side of the turn.
        let dh_recv = StaticSecret::from(self.dh_send_secret).diffie_hellman(&peer_dh);
        let (rk, recv_ck) = kdf::kdf_rk(&self.root_key, dh_recv.as_bytes())?;
        self.root_key = rk;
        self.recv_ck = recv_ck;
        self.recv_n = 0;

        // Sending side: fresh ratchet keypair and a fresh nonce prefix.
        self.prev_send_n = self.send_n;
        self.send_n = 0;
        let new_dh = StaticSecret::random_from_rng(OsRng);
        self.dh_send_pub = X25519Public::from(&new_dh).to_bytes();
        let dh_send = new_dh.diffie_hellman(&peer_dh);
        let (rk2, send_ck) = kdf::kdf_rk(&self.root_key, dh_send.as_bytes())?;
        self.root_key = rk2;
        self.send_ck = send_ck;
        self.dh_send_secret = new_dh.to_bytes();
        self.send_nonce_prefix = random_prefix();
        self.send_ready = true;
        Ok(())
    }

    /// Store skipped message keys from `recv_n` up to (not including) `until`.
    fn skip_message_keys(&mut self, until: u64) -> Result<(), CryptoError> {
        if until < self.recv_n {
            return Ok(());
        }
        if until - self.recv_n > MAX_SKIP {
            return Err(CryptoError::SkippedKeyLimit);
        }
        let chain_pub = self.dh_recv_pub.unwrap_or([0u8; 32]);
        while self.recv_n < until {
            let (next_ck, mk) = kdf::kdf_ck(&self.recv_ck)?;
            self.recv_ck = next_ck;
            self.skipped.insert((chain_pub, self.recv_n), mk);
            self.skipped_order.push_back((chain_pub, self.recv_n));
            self.recv_n += 1;
            while self.skipped.len() > MAX_SKIPPED_TOTAL {
                if let Some(oldest) = self.skipped_order.pop_front() {
                    if let Some(mut old_mk) = self.skipped.remove(&oldest) {
                        old_mk.zeroize();
                    }
                } else {
                    self.skipped.clear();
                }
            }
        }
        Ok(())
    }

    pub fn skipped_len(&self) -> usize {
        self.skipped.len()
    }

    // ── Persistence ──────────────────────────────────────────────────────

    /// Copy the full session state out for persistence. The snapshot wipes
    /// its secrets on drop; the storage layer owns the encoding.
    pub fn snapshot(&self) -> RatchetSnapshot {
        RatchetSnapshot {
            peer_id: self.peer_id.clone(),
            root_key: self.root_key,
            dh_send_secret: self.dh_send_secret,
            dh_send_pub: self.dh_send_pub,
            send_ck: self.send_ck,
            send_ready: self.send_ready,
            send_n: self.send_n,
            send_nonce_prefix: self.send_nonce_prefix,
            dh_recv_pub: self.dh_recv_pub,
            recv_ck: self.recv_ck,
            recv_n: self.recv_n,
            prev_send_n: self.prev_send_n,
            skipped: self
                .skipped_order
                .iter()
                .filter_map(|key| self.skipped.get(key).map(|mk| (key.0, key.1, *mk)))
                .collect(),
        }
    }

    /// Rebuild a session from a persisted snapshot.
    pub fn restore(snapshot: &RatchetSnapshot) -> Self {
        let mut skipped = HashMap::with_capacity(snapshot.skipped.len());
        let mut skipped_order = VecDeque::with_capacity(snapshot.skipped.len());
        for (dh_pub, n, mk) in &snapshot.skipped {
            skipped.insert((*dh_pub, *n), *mk);
            skipped_order.push_back((*dh_pub, *n));
        }
        Self {
            peer_id: snapshot.peer_id.clone(),
            root_key: snapshot.root_key,
            dh_send_secret: snapshot.dh_send_secret,
            dh_send_pub: snapshot.dh_send_pub,
            send_ck: snapshot.send_ck,
            send_ready: snapshot.send_ready,
            send_n: snapshot.send_n,
            send_nonce_prefix: snapshot.send_nonce_prefix,
            dh_recv_pub: snapshot.dh_recv_pub,
            recv_ck: snapshot.recv_ck,
            recv_n: snapshot.recv_n,
            prev_send_n: snapshot.prev_send_n,
            skipped,
            skipped_order,
        }
    }
}

/// Plain-data form of a session, ordered for stable persistence.
pub struct RatchetSnapshot {
    pub peer_id: String,
    pub root_key: [u8; 32],
    pub dh_send_secret: [u8; 32],
    pub dh_send_pub: [u8; 32],
    pub send_ck: [u8; 32],
    pub send_ready: bool,
    pub send_n: u64,
    pub send_nonce_prefix: [u8; 8],
    pub dh_recv_pub: Option<[u8; 32]>,
    pub recv_ck: [u8; 32],
    pub recv_n: u64,
    pub prev_send_n: u64,
    /// (chain ratchet public, message number, message key) in FIFO order.
    pub skipped: Vec<([u8; 32], u64, [u8; 32])>,
}

impl Drop for RatchetSnapshot {
    fn drop(&mut self) {
        self.root_key.zeroize();
        self.dh_send_secret.zeroize();
        self.send_ck.zeroize();
        self.recv_ck.zeroize();
        for (_, _, mk) in self.skipped.iter_mut() {
            mk.zeroize();
        }
    }
}
