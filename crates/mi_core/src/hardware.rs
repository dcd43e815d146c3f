//! Hardware-backed secret-at-rest wrap surface.
//!
//! The `[identity] tpm_enable` / `tpm_require` flags request that identity
//! secrets be wrapped by a platform key store (TPM, Secure Enclave, OS
//! credential vault) before touching disk.
//!
//! Implementation status: stub. This build reports the surface as
//! unsupported; `tpm_require=1` therefore fails closed at init, and
//! `tpm_enable=1` degrades to plain (private-mode) files with a warning.

use crate::error::{CoreError, Result};

/// Whether a hardware wrap provider is available on this build/platform.
pub fn is_supported() -> bool {
    false
}

/// Wrap a 32-byte secret for storage. Stub: always unsupported.
pub fn wrap_secret(_secret: &[u8; 32]) -> Result<Vec<u8>> {
    Err(CoreError::Config("hardware key wrap unsupported".into()))
}

/// Unwrap a previously wrapped secret. Stub: always unsupported.
pub fn unwrap_secret(_wrapped: &[u8]) -> Result<[u8; 32]> {
    Err(CoreError::Config("hardware key wrap unsupported".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stub_fails_closed() {
        assert!(!is_supported());
        assert!(wrap_secret(&[0u8; 32]).is_err());
        assert!(unwrap_secret(&[]).is_err());
    }
}
