//! mi_crypto — Michat E2EE core cryptographic primitives
//!
//! # Design principles
//! - NO custom crypto; all primitives come from audited Rust crates.
//! - Zeroize all secret material on drop.
//! - Fixed-size byte arrays for keys; the wire layer owns all framing.
//!
//! # Module layout
//! - `identity` — long-term Ed25519 signing + X25519 DH identity, rotation policy
//! - `x3dh`     — prekey bundles and the hybrid X3DH + ML-KEM-768 handshake
//! - `ratchet`  — Double Ratchet with DH steps and bounded skipped-key maps
//! - `group`    — per-(group, sender) symmetric chains with skip windows
//! - `kt`       — Key-Transparency Merkle proofs (inclusion + consistency)
//! - `aead`     — XChaCha20-Poly1305 helpers (attached and detached forms)
//! - `kdf`      — HKDF-SHA256 derivations for every chain in the system
//! - `sas`      — short authentication string derivation for cert pinning
//! - `error`    — unified error type

pub mod aead;
pub mod error;
pub mod group;
pub mod identity;
pub mod kdf;
pub mod kt;
pub mod ratchet;
pub mod sas;
pub mod x3dh;

pub use error::CryptoError;
