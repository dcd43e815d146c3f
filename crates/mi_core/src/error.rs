//! Error taxonomy surfaced to callers.
//!
//! Every public method returns `Result<T, CoreError>`; the core never
//! prints. `last_error()` on the facade mirrors the most recent failure as
//! a display string for the UI.

use thiserror::Error;

use mi_crypto::CryptoError;
use mi_proto::blob::BlobError;
use mi_proto::WireError;

pub type Result<T> = std::result::Result<T, CoreError>;

#[derive(Debug, Error)]
pub enum CoreError {
    /// Malformed or missing required configuration.
    #[error("config: {0}")]
    Config(String),

    /// Connect/send/recv failures, timeouts, cookie failures.
    #[error("transport: {0}")]
    Transport(String),

    /// Server not trusted, fingerprint changed, SAS pending.
    #[error("trust: {0}")]
    Trust(String),

    /// Login failed, session invalid, token mismatch.
    #[error("auth: {0}")]
    Auth(String),

    /// Frame or envelope shape invalid.
    #[error("protocol: {0}")]
    Protocol(String),

    /// AEAD, signature, bundle, or KEM failure.
    #[error("crypto: {0}")]
    Crypto(#[from] CryptoError),

    /// Inclusion/consistency/signature failure, rollback, split view.
    #[error("key transparency: {0}")]
    Kt(String),

    /// Counter overflow, duplicate message, skipped-key overflow.
    #[error("state: {0}")]
    State(String),

    /// File codec failures.
    #[error("codec: {0}")]
    Codec(String),

    /// Device-sync key/ratchet/event failures.
    #[error("device sync: {0}")]
    DeviceSync(String),
}

impl From<WireError> for CoreError {
    fn from(e: WireError) -> Self {
        CoreError::Protocol(e.to_string())
    }
}

impl From<BlobError> for CoreError {
    fn from(e: BlobError) -> Self {
        match e {
            BlobError::Crypto(inner) => CoreError::Crypto(inner),
            other => CoreError::Codec(other.to_string()),
        }
    }
}
