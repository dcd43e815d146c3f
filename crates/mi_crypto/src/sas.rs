//! Short authentication string derivation.
//!
//! When the trust store has no pin for a server (or the presented
//! certificate changed), the UI shows a 20-hex-char SAS that both sides can
//! read out of band before the fingerprint is persisted:
//!
//!   SAS-80 = first 20 hex chars of
//!            SHA-256("MI_SERVER_CERT_SAS_V1" || fingerprint_bytes)
//!
//! rendered as `XXXX-XXXX-XXXX-XXXX-XXXX`.

use sha2::{Digest, Sha256};

const SAS_CONTEXT: &[u8] = b"MI_SERVER_CERT_SAS_V1";

/// Group a hex string into dash-separated blocks of four.
pub fn group_hex4(hex: &str) -> String {
    let chars: Vec<char> = hex.chars().collect();
    chars
        .chunks(4)
        .map(|c| c.iter().collect::<String>())
        .collect::<Vec<_>>()
        .join("-")
}

/// Derive the display SAS from a certificate SHA-256 fingerprint (hex).
/// Returns `None` if the input is not a 32-byte hex digest.
pub fn sas80_from_fingerprint_hex(fingerprint_hex: &str) -> Option<String> {
    let bytes = hex::decode(fingerprint_hex).ok()?;
    if bytes.len() != 32 {
        return None;
    }
    let mut h = Sha256::new();
    h.update(SAS_CONTEXT);
    h.update(&bytes);
    let digest = hex::encode(h.finalize());
    Some(group_hex4(&digest[..20].to_uppercase()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grouping() {
        assert_eq!(group_hex4("A1B2C3D4E5F6A7B8C9D0"), "A1B2-C3D4-E5F6-A7B8-C9D0");
    }

    #[test]
    fn sas_shape_and_determinism() {
        let fp = "aa".repeat(32);
        let sas = sas80_from_fingerprint_hex(&fp).unwrap();
        assert_eq!(sas.len(), 24); // 20 hex + 4 dashes
        assert_eq!(sas.matches('-').count(), 4);
        assert!(sas
            .chars()
            .all(|c| c == '-' || c.is_ascii_digit() || c.is_ascii_uppercase()));
        assert_eq!(sas, sas80_from_fingerprint_hex(&fp).unwrap());

        // Different fingerprints give different strings.
        let other = sas80_from_fingerprint_hex(&"bb".repeat(32)).unwrap();
        assert_ne!(sas, other);
    }

    #[test]
    fn rejects_non_fingerprint_input() {
        assert!(sas80_from_fingerprint_hex("zz").is_none());
        assert!(sas80_from_fingerprint_hex("aabb").is_none());
    }
}
