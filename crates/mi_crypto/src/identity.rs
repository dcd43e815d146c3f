//! Identity key management
//!
//! Each user carries one long-term Ed25519 signing keypair and one long-term
//! X25519 DH keypair. Both participate in the prekey bundle and the
//! Key-Transparency leaf, so rotating them is a visible, policy-driven event:
//!
//!   - rotation is due once the pair's age reaches `rotation_days`;
//!   - the retired secret halves are kept for `legacy_retention_days` so
//!     inbound traffic sealed against the old keys still decrypts;
//!   - after retention the legacy secrets are wiped.
//!
//! The `tpm_*` flags request a hardware-wrapped secret-at-rest. This build
//! exposes that as a stub surface only; `tpm_require` therefore fails closed
//! at init time in the core.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier as _, VerifyingKey};
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::CryptoError;

pub const SIG_PUBLIC_KEY_BYTES: usize = 32;
pub const DH_PUBLIC_KEY_BYTES: usize = 32;
pub const SIGNATURE_BYTES: usize = 64;

// ── Rotation policy ──────────────────────────────────────────────────────────

/// Identity rotation policy, sourced from the `[identity]` config section.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdentityPolicy {
    pub rotation_days: u32,
    pub legacy_retention_days: u32,
    pub tpm_enable: bool,
    pub tpm_require: bool,
}

impl Default for IdentityPolicy {
    fn default() -> Self {
        Self {
            rotation_days: 90,
            legacy_retention_days: 30,
            tpm_enable: false,
            tpm_require: false,
        }
    }
}

// ── Identity keypair ─────────────────────────────────────────────────────────

/// Long-term identity: Ed25519 signing + X25519 DH halves.
/// Secret bytes are wiped on drop.
#[derive(ZeroizeOnDrop)]
pub struct IdentityKeyPair {
    sig_secret: [u8; 32],
    dh_secret: [u8; 32],
    #[zeroize(skip)]
    sig_public: [u8; SIG_PUBLIC_KEY_BYTES],
    #[zeroize(skip)]
    dh_public: [u8; DH_PUBLIC_KEY_BYTES],
    /// Wall-clock creation time, milliseconds since the unix epoch.
    #[zeroize(skip)]
    pub created_at_ms: u64,
}

impl IdentityKeyPair {
    pub fn generate(created_at_ms: u64) -> Self {
        let signing = SigningKey::generate(&mut OsRng);
        let dh = StaticSecret::random_from_rng(OsRng);
        let sig_public = signing.verifying_key().to_bytes();
        let dh_public = X25519Public::from(&dh).to_bytes();
        Self {
            sig_secret: signing.to_bytes(),
            dh_secret: dh.to_bytes(),
            sig_public,
            dh_public,
            created_at_ms,
        }
    }

    /// Rebuild from persisted secret halves.
    pub fn from_secret_bytes(
        sig_secret: &[u8],
        dh_secret: &[u8],
        created_at_ms: u64,
    ) -> Result<Self, CryptoError> {
        let sig: [u8; 32] = sig_secret
            .try_into()
            .map_err(|_| CryptoError::InvalidKey("identity sig secret must be 32 bytes".into()))?;
        let dh: [u8; 32] = dh_secret
            .try_into()
            .map_err(|_| CryptoError::InvalidKey("identity dh secret must be 32 bytes".into()))?;
        let signing = SigningKey::from_bytes(&sig);
        let dh_secret = StaticSecret::from(dh);
        let sig_public = signing.verifying_key().to_bytes();
        let dh_public = X25519Public::from(&dh_secret).to_bytes();
        Ok(Self {
            sig_secret: sig,
            dh_secret: dh,
            sig_public,
            dh_public,
            created_at_ms,
        })
    }

    pub fn sig_public(&self) -> &[u8; SIG_PUBLIC_KEY_BYTES] {
        &self.sig_public
    }

    pub fn dh_public(&self) -> &[u8; DH_PUBLIC_KEY_BYTES] {
        &self.dh_public
    }

    pub fn sig_secret_bytes(&self) -> &[u8; 32] {
        &self.sig_secret
    }

    pub fn dh_secret(&self) -> StaticSecret {
        StaticSecret::from(self.dh_secret)
    }

    /// Sign arbitrary bytes; returns the 64-byte raw Ed25519 signature.
    pub fn sign(&self, msg: &[u8]) -> [u8; SIGNATURE_BYTES] {
        SigningKey::from_bytes(&self.sig_secret).sign(msg).to_bytes()
    }

    /// Verify a detached signature made by any Ed25519 public key.
    pub fn verify(public: &[u8], msg: &[u8], sig: &[u8]) -> Result<(), CryptoError> {
        let vk = VerifyingKey::from_bytes(
            public
                .try_into()
                .map_err(|_| CryptoError::InvalidKey("bad pubkey length".into()))?,
        )
        .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
        let sig = Signature::from_bytes(
            sig.try_into()
                .map_err(|_| CryptoError::InvalidKey("bad signature length".into()))?,
        );
        vk.verify(msg, &sig)
            .map_err(|_| CryptoError::SignatureVerification)
    }

    /// SHA-256 hex of the signing public key — the identity pin stored in
    /// the trust store and compared against KT leaves.
    pub fn fingerprint_hex(&self) -> String {
        fingerprint_hex(&self.sig_public)
    }

    /// Age in whole days at `now_ms`.
    pub fn age_days(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.created_at_ms) / (24 * 60 * 60 * 1000)
    }

    /// True once the policy says this pair must be replaced.
    pub fn rotation_due(&self, policy: &IdentityPolicy, now_ms: u64) -> bool {
        policy.rotation_days > 0 && self.age_days(now_ms) >= u64::from(policy.rotation_days)
    }
}

/// SHA-256 hex fingerprint of an identity signing public key.
pub fn fingerprint_hex(sig_public: &[u8]) -> String {
    hex::encode(Sha256::digest(sig_public))
}

// ── Legacy (retired) identity ────────────────────────────────────────────────

/// A rotated-out identity kept alive for inbound decryption only.
pub struct LegacyIdentity {
    pub keypair: IdentityKeyPair,
    /// Wall-clock expiry; once past, the secrets are wiped and dropped.
    pub retain_until_ms: u64,
}

impl LegacyIdentity {
    pub fn expired(&self, now_ms: u64) -> bool {
        now_ms >= self.retain_until_ms
    }
}

/// Wipe helper for transient 32-byte secrets held on the stack.
pub fn wipe32(buf: &mut [u8; 32]) {
    buf.zeroize();
}

#[cfg(test)]
mod tests {
    use super::*;

    const DAY_MS: u64 = 24 * 60 * 60 * 1000;

    #[test]
    fn sign_verify_roundtrip() {
        let id = IdentityKeyPair::generate(0);
        let sig = id.sign(b"bundle");
        IdentityKeyPair::verify(id.sig_public(), b"bundle", &sig).unwrap();
        assert!(IdentityKeyPair::verify(id.sig_public(), b"other", &sig).is_err());
    }

    #[test]
    fn persist_roundtrip_keeps_publics() {
        let id = IdentityKeyPair::generate(77);
        let restored = IdentityKeyPair::from_secret_bytes(
            id.sig_secret_bytes(),
            &id.dh_secret().to_bytes(),
            id.created_at_ms,
        )
        .unwrap();
        assert_eq!(id.sig_public(), restored.sig_public());
        assert_eq!(id.dh_public(), restored.dh_public());
        assert_eq!(restored.created_at_ms, 77);
    }

    #[test]
    fn rotation_due_follows_policy() {
        let id = IdentityKeyPair::generate(0);
        let policy = IdentityPolicy {
            rotation_days: 30,
            ..Default::default()
        };
        assert!(!id.rotation_due(&policy, 29 * DAY_MS));
        assert!(id.rotation_due(&policy, 30 * DAY_MS));
        // rotation_days == 0 disables rotation
        let never = IdentityPolicy {
            rotation_days: 0,
            ..Default::default()
        };
        assert!(!id.rotation_due(&never, 1000 * DAY_MS));
    }

    #[test]
    fn fingerprint_is_sha256_of_sig_public() {
        let id = IdentityKeyPair::generate(0);
        let fp = id.fingerprint_hex();
        assert_eq!(fp.len(), 64);
        assert_eq!(fp, fingerprint_hex(id.sig_public()));
    }
}
