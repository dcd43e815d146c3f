//! X3DH-like asynchronous key agreement, PQ-hybrid.
//!
//! References:
//!   - Signal X3DH spec: <https://signal.org/docs/specifications/x3dh/>
//!   - RFC 7748 (X25519), RFC 5869 (HKDF), FIPS 203 (ML-KEM)
//!
//! Protocol:
//!   Alice (initiator) fetches Bob's published prekey bundle:
//!     IK_B  (Ed25519 signing public — verifies the SPK signature)
//!     IKdh_B (X25519 identity DH public)
//!     SPK_B (signed prekey, X25519) + Ed25519 signature over SPK_B
//!     OPK_B (optional one-time prekey, X25519)
//!     KEM_B (ML-KEM-768 encapsulation key)
//!
//!   Alice generates ONE ephemeral keypair EK_A and one KEM encapsulation:
//!     DH1 = DH(IKdh_A, SPK_B)   — mutual authentication
//!     DH2 = DH(EK_A,  IKdh_B)   — forward secrecy
//!     DH3 = DH(EK_A,  SPK_B)    — replay protection
//!     DH4 = DH(EK_A,  OPK_B)    — one-time forward secrecy [optional]
//!     SS  = ML-KEM-768 encapsulated secret — post-quantum hybrid term
//!
//!   SK = HKDF(salt=0, ikm = 0xFF*32 || DH1 || DH2 || DH3 [|| DH4] || SS,
//!             info = "mi_e2ee_ratchet_root_v1")
//!
//! Non-negotiable:
//!   - Alice MUST verify the SPK signature before computing any DH.
//!   - The KEM ciphertext travels in the init header; Bob decapsulates with
//!     his stored decapsulation key and mixes the same SS.
//!   - SK feeds the Double Ratchet as the initial root key.

use fips203::ml_kem_768;
use fips203::traits::{Decaps, Encaps, KeyGen, SerDes};
use rand::rngs::OsRng;
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};
use zeroize::{Zeroize, Zeroizing};

use crate::{error::CryptoError, identity::IdentityKeyPair, kdf};

pub const KEM_PUBLIC_KEY_BYTES: usize = ml_kem_768::EK_LEN;
pub const KEM_SECRET_KEY_BYTES: usize = ml_kem_768::DK_LEN;
pub const KEM_CIPHERTEXT_BYTES: usize = ml_kem_768::CT_LEN;

const BUNDLE_VERSION: u8 = 1;
const MAX_ONE_TIME_PREKEYS: usize = 100;

// ── Prekey bundle ────────────────────────────────────────────────────────────

/// Published by each user, consumed by session initiators.
///
/// Binary layout (v1):
///   `u8 version || id_sig_pk(32) || id_dh_pk(32) || spk_pub(32) ||
///    spk_sig(64) || u8 opk_count || opk_pub(32)* || kem_pub(1184)`
///
/// The `version || id_sig_pk || id_dh_pk` prefix is exactly what the
/// Key-Transparency leaf commits to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrekeyBundle {
    pub id_sig_pk: [u8; 32],
    pub id_dh_pk: [u8; 32],
    pub spk_pub: [u8; 32],
    pub spk_sig: [u8; 64],
    pub one_time_prekeys: Vec<[u8; 32]>,
    pub kem_pub: Vec<u8>,
}

impl PrekeyBundle {
    pub fn encode(&self) -> Result<Vec<u8>, CryptoError> {
        if self.one_time_prekeys.len() > MAX_ONE_TIME_PREKEYS {
            return Err(CryptoError::BundleMalformed("too many one-time prekeys".into()));
        }
        if self.kem_pub.len() != KEM_PUBLIC_KEY_BYTES {
            return Err(CryptoError::BundleMalformed("kem key wrong length".into()));
        }
        let mut out = Vec::with_capacity(
            1 + 32 + 32 + 32 + 64 + 1 + 32 * self.one_time_prekeys.len() + self.kem_pub.len(),
        );
        out.push(BUNDLE_VERSION);
        out.extend_from_slice(&self.id_sig_pk);
        out.extend_from_slice(&self.id_dh_pk);
        out.extend_from_slice(&self.spk_pub);
        out.extend_from_slice(&self.spk_sig);
        out.push(self.one_time_prekeys.len() as u8);
        for opk in &self.one_time_prekeys {
            out.extend_from_slice(opk);
        }
        out.extend_from_slice(&self.kem_pub);
        Ok(out)
    }

    pub fn decode(data: &[u8]) -> Result<Self, CryptoError> {
        fn take<'a>(data: &'a [u8], off: &mut usize, n: usize) -> Result<&'a [u8], CryptoError> {
            let end = off
                .checked_add(n)
                .filter(|&end| end <= data.len())
                .ok_or_else(|| CryptoError::BundleMalformed("truncated".into()))?;
            let s = &data[*off..end];
            *off = end;
            Ok(s)
        }
        let malformed = |what: &str| CryptoError::BundleMalformed(what.into());

        if data.len() < 1 + 32 + 32 + 32 + 64 + 1 {
            return Err(malformed("truncated"));
        }
        if data[0] != BUNDLE_VERSION {
            return Err(malformed("unknown version"));
        }
        let mut off = 1usize;
        let id_sig_pk: [u8; 32] = take(data, &mut off, 32)?.try_into().unwrap();
        let id_dh_pk: [u8; 32] = take(data, &mut off, 32)?.try_into().unwrap();
        let spk_pub: [u8; 32] = take(data, &mut off, 32)?.try_into().unwrap();
        let spk_sig: [u8; 64] = take(data, &mut off, 64)?.try_into().unwrap();
        let opk_count = take(data, &mut off, 1)?[0] as usize;
        if opk_count > MAX_ONE_TIME_PREKEYS {
            return Err(malformed("too many one-time prekeys"));
        }
        let mut one_time_prekeys = Vec::with_capacity(opk_count);
        for _ in 0..opk_count {
            one_time_prekeys.push(take(data, &mut off, 32)?.try_into().unwrap());
        }
        let kem_pub = take(data, &mut off, KEM_PUBLIC_KEY_BYTES)?.to_vec();
        if off != data.len() {
            return Err(malformed("trailing bytes"));
        }
        Ok(Self {
            id_sig_pk,
            id_dh_pk,
            spk_pub,
            spk_sig,
            one_time_prekeys,
            kem_pub,
        })
    }
}

// ── Receiver-side prekey secrets ─────────────────────────────────────────────

/// The secret halves backing a published bundle. Wiped on drop.
pub struct PrekeySecrets {
    pub spk_secret: StaticSecret,
    pub opk_secrets: Vec<StaticSecret>,
    pub kem_secret: Zeroizing<Vec<u8>>,
}

/// Generate a signed prekey: X25519 keypair, public half signed by the
/// identity Ed25519 key.
pub fn generate_signed_prekey(identity: &IdentityKeyPair) -> (StaticSecret, [u8; 32], [u8; 64]) {
    let secret = StaticSecret::random_from_rng(OsRng);
    let public = X25519Public::from(&secret).to_bytes();
    let sig = identity.sign(&public);
    (secret, public, sig)
}

/// Generate a batch of one-time prekeys.
pub fn generate_one_time_prekeys(count: usize) -> Vec<(StaticSecret, [u8; 32])> {
    (0..count)
        .map(|_| {
            let s = StaticSecret::random_from_rng(OsRng);
            let p = X25519Public::from(&s).to_bytes();
            (s, p)
        })
        .collect()
}

/// Generate an ML-KEM-768 keypair as raw bytes (encaps, decaps).
pub fn generate_kem_keypair() -> Result<(Vec<u8>, Zeroizing<Vec<u8>>), CryptoError> {
    let (ek, dk) = ml_kem_768::KG::try_keygen().map_err(|e| CryptoError::Kem(e.into()))?;
    Ok((
        ek.into_bytes().to_vec(),
        Zeroizing::new(dk.into_bytes().to_vec()),
    ))
}

// ── Init message header ──────────────────────────────────────────────────────

/// Sent alongside the first ciphertext so the responder can derive SK.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct X3dhHeader {
    /// Alice's Ed25519 identity signing public key.
    pub ik_sig_pub: [u8; 32],
    /// Alice's X25519 identity DH public key.
    pub ik_dh_pub: [u8; 32],
    /// Alice's ephemeral X25519 public key.
    pub ek_pub: [u8; 32],
    /// Index of the consumed one-time prekey in Bob's bundle, if any.
    pub opk_index: Option<u8>,
    /// ML-KEM-768 ciphertext for Bob to decapsulate.
    pub kem_ct: Vec<u8>,
}

/// Result of the initiator handshake.
pub struct X3dhResult {
    /// 32-byte shared key → initial Double Ratchet root key.
    pub shared_key: [u8; 32],
    pub header: X3dhHeader,
}

// ── Initiator ────────────────────────────────────────────────────────────────

/// Alice initiates a session against Bob's bundle.
///
/// The SPK signature check happens before any DH; a bad bundle never touches
/// key material.
pub fn initiate(my_ik: &IdentityKeyPair, bundle: &PrekeyBundle) -> Result<X3dhResult, CryptoError> {
    IdentityKeyPair::verify(&bundle.id_sig_pk, &bundle.spk_pub, &bundle.spk_sig)?;

    let spk_b = X25519Public::from(bundle.spk_pub);
    let ik_b_dh = X25519Public::from(bundle.id_dh_pk);

    let ek_a = StaticSecret::random_from_rng(OsRng);
    let ek_a_pub = X25519Public::from(&ek_a).to_bytes();

    let dh1 = my_ik.dh_secret().diffie_hellman(&spk_b);
    let dh2 = ek_a.diffie_hellman(&ik_b_dh);
    let dh3 = ek_a.diffie_hellman(&spk_b);

    let mut ikm = Zeroizing::new(vec![0xFFu8; 32]);
    ikm.extend_from_slice(dh1.as_bytes());
    ikm.extend_from_slice(dh2.as_bytes());
    ikm.extend_from_slice(dh3.as_bytes());

    let mut opk_index = None;
    if let Some((idx, opk)) = bundle.one_time_prekeys.first().map(|k| (0u8, *k)) {
        let dh4 = ek_a.diffie_hellman(&X25519Public::from(opk));
        ikm.extend_from_slice(dh4.as_bytes());
        opk_index = Some(idx);
    }

    // Post-quantum hybrid term.
    let kem_pub: [u8; KEM_PUBLIC_KEY_BYTES] = bundle
        .kem_pub
        .as_slice()
        .try_into()
        .map_err(|_| CryptoError::BundleMalformed("kem key wrong length".into()))?;
    let ek = ml_kem_768::EncapsKey::try_from_bytes(kem_pub)
        .map_err(|e| CryptoError::Kem(e.into()))?;
    let (ssk, ct) = ek.try_encaps().map_err(|e| CryptoError::Kem(e.into()))?;
    let mut ss = ssk.into_bytes();
    ikm.extend_from_slice(&ss);
    ss.zeroize();

    let shared_key = kdf::ratchet_root(&ikm)?;

    Ok(X3dhResult {
        shared_key,
        header: X3dhHeader {
            ik_sig_pub: *my_ik.sig_public(),
            ik_dh_pub: *my_ik.dh_public(),
            ek_pub: ek_a_pub,
            opk_index,
            kem_ct: ct.into_bytes().to_vec(),
        },
    })
}

// ── Responder ────────────────────────────────────────────────────────────────

/// Bob reconstructs SK from an init header and his stored prekey secrets.
pub fn respond(
    my_ik: &IdentityKeyPair,
    my_spk_secret: &StaticSecret,
    my_opk_secret: Option<&StaticSecret>,
    kem_secret: &[u8],
    header: &X3dhHeader,
) -> Result<[u8; 32], CryptoError> {
    let ek_a = X25519Public::from(header.ek_pub);
    let ik_a_dh = X25519Public::from(header.ik_dh_pub);

    // Mirror Alice's DH order exactly (commutativity).
    let dh1 = my_spk_secret.diffie_hellman(&ik_a_dh);
    let dh2 = my_ik.dh_secret().diffie_hellman(&ek_a);
    let dh3 = my_spk_secret.diffie_hellman(&ek_a);

    let mut ikm = Zeroizing::new(vec![0xFFu8; 32]);
    ikm.extend_from_slice(dh1.as_bytes());
    ikm.extend_from_slice(dh2.as_bytes());
    ikm.extend_from_slice(dh3.as_bytes());

    if let Some(opk) = my_opk_secret {
        let dh4 = opk.diffie_hellman(&ek_a);
        ikm.extend_from_slice(dh4.as_bytes());
    }

    let dk_bytes: [u8; KEM_SECRET_KEY_BYTES] = kem_secret
        .try_into()
        .map_err(|_| CryptoError::InvalidKey("kem decaps key wrong length".into()))?;
    let ct_bytes: [u8; KEM_CIPHERTEXT_BYTES] = header
        .kem_ct
        .as_slice()
        .try_into()
        .map_err(|_| CryptoError::Kem("kem ciphertext wrong length".into()))?;
    let dk = ml_kem_768::DecapsKey::try_from_bytes(dk_bytes)
        .map_err(|e| CryptoError::Kem(e.into()))?;
    let ct = ml_kem_768::CipherText::try_from_bytes(ct_bytes)
        .map_err(|e| CryptoError::Kem(e.into()))?;
    let mut ss = dk
        .try_decaps(&ct)
        .map_err(|e| CryptoError::Kem(e.into()))?
        .into_bytes();
    ikm.extend_from_slice(&ss);
    ss.zeroize();

    kdf::ratchet_root(&ikm)
}
