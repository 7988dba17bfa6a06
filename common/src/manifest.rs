use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Signed firmware-update manifest, delivered over the cloud job channel or
/// the local channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub url: String,
    /// SHA-256 of the image, 64 hex characters.
    pub digest: String,
    /// Base64 DER ECDSA signature over the raw 32 digest bytes.
    pub signature: String,
    pub version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_required: Option<u32>,
    /// Base64 DER signer certificate; must chain to the trust-root CA.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signer_cert_b64: Option<String>,
    /// SHA-256 of the signer certificate DER, 64 hex characters.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signer_keyid_hex: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allow_rollback: Option<bool>,
}

impl Manifest {
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|_| Error::InvalidArgument("manifest json"))
    }

    /// Decodes the digest, enforcing the exact 64-hex-character length.
    pub fn digest_bytes(&self) -> Result<[u8; 32]> {
        if self.digest.len() != 64 {
            return Err(Error::InvalidArgument("digest length"));
        }
        let raw = hex::decode(&self.digest).map_err(|_| Error::InvalidArgument("digest hex"))?;
        Ok(raw.try_into().expect("64 hex chars decode to 32 bytes"))
    }

    pub fn signature_der(&self) -> Result<Vec<u8>> {
        BASE64
            .decode(&self.signature)
            .map_err(|_| Error::InvalidArgument("signature base64"))
    }

    pub fn signer_cert_der(&self) -> Result<Option<Vec<u8>>> {
        match &self.signer_cert_b64 {
            None => Ok(None),
            Some(b64) => BASE64
                .decode(b64)
                .map(Some)
                .map_err(|_| Error::InvalidArgument("signer cert base64")),
        }
    }

    pub fn allow_rollback(&self) -> bool {
        self.allow_rollback.unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_json(digest: &str) -> String {
        format!(
            r#"{{"url":"https://firmware.example/app.bin","digest":"{digest}","signature":"AA==","version":4,"min_required":3}}"#
        )
    }

    #[test]
    fn parses_required_and_optional_fields() {
        let m = Manifest::from_json(&minimal_json(&"ab".repeat(32))).unwrap();
        assert_eq!(m.version, 4);
        assert_eq!(m.min_required, Some(3));
        assert!(!m.allow_rollback());
        assert_eq!(m.digest_bytes().unwrap(), [0xab; 32]);
        assert_eq!(m.signature_der().unwrap(), vec![0]);
    }

    #[test]
    fn digest_length_is_exact() {
        let short = Manifest::from_json(&minimal_json(&"ab".repeat(16))).unwrap();
        assert!(short.digest_bytes().is_err());

        let bad_hex = Manifest::from_json(&minimal_json(&"zz".repeat(32))).unwrap();
        assert!(bad_hex.digest_bytes().is_err());
    }

    #[test]
    fn missing_required_field_fails_parse() {
        assert!(Manifest::from_json(r#"{"url":"https://x","version":1}"#).is_err());
    }
}
