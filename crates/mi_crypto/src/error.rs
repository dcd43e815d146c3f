use thiserror::Error;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Key generation failed: {0}")]
    KeyGeneration(String),

    #[error("Signature verification failed")]
    SignatureVerification,

    #[error("AEAD encryption failed")]
    AeadEncrypt,

    #[error("AEAD decryption failed (authentication tag mismatch — possible tampering)")]
    AeadDecrypt,

    #[error("Key derivation failed: {0}")]
    KeyDerivation(String),

    #[error("Invalid key material: {0}")]
    InvalidKey(String),

    #[error("KEM operation failed: {0}")]
    Kem(String),

    #[error("Ratchet step failed: {0}")]
    RatchetStep(String),

    #[error("Too many skipped message keys")]
    SkippedKeyLimit,

    #[error("Duplicate message")]
    DuplicateMessage,

    #[error("Prekey bundle malformed: {0}")]
    BundleMalformed(String),

    #[error("Transparency proof rejected: {0}")]
    ProofRejected(&'static str),
}
