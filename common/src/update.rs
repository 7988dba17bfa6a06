//! Firmware-update pipeline: manifest verification against the trust root,
//! anti-rollback policy, streamed image hashing into the alternate slot, and
//! atomic commit.

use std::sync::Arc;

use log::{info, warn};
use thiserror::Error;
use x509_parser::prelude::{FromDer, X509Certificate};

use crate::crypto::{cert_keyid_hex, ecdsa_p256_verify_digest, ecdsa_p256_verify_message, Sha256Stream};
use crate::error::Error as CoreError;
use crate::manifest::Manifest;
use crate::store::{keys, Store};
use crate::trust::TrustRoot;

/// Outcomes surfaced to the audit stream; anything before commit leaves the
/// device on the previous slot.
#[derive(Debug, Error)]
pub enum UpdateError {
    #[error("manifest invalid: {0}")]
    ManifestInvalid(&'static str),
    #[error("manifest signature invalid")]
    SignatureInvalid,
    #[error("signer certificate chain invalid")]
    ChainInvalid,
    #[error("signer key-id mismatch")]
    KeyIdMismatch,
    #[error("version rejected: new={new} current={current}")]
    VersionRejected { new: u32, current: u32 },
    #[error("download incomplete: {0}")]
    DownloadIncomplete(String),
    #[error("image digest mismatch")]
    DigestMismatch,
    #[error("commit failed: {0}")]
    CommitFailed(String),
    #[error("no signer key available")]
    Unauthorized,
}

impl UpdateError {
    /// Stable label for audit lines and the shadow `reported` block.
    pub fn audit_label(&self) -> &'static str {
        match self {
            Self::ManifestInvalid(_) => "ManifestInvalid",
            Self::SignatureInvalid => "SignatureInvalid",
            Self::ChainInvalid => "ChainInvalid",
            Self::KeyIdMismatch => "KeyIdMismatch",
            Self::VersionRejected { .. } => "VersionRejected",
            Self::DownloadIncomplete(_) => "DownloadIncomplete",
            Self::DigestMismatch => "DigestMismatch",
            Self::CommitFailed(_) => "CommitFailed",
            Self::Unauthorized => "Unauthorized",
        }
    }
}

/// Streams an image from its URL, handing every received chunk to `sink` in
/// order. Implementations pin TLS to `ca_pem` when one is supplied.
pub trait ImageFetcher {
    fn fetch(
        &mut self,
        url: &str,
        ca_pem: Option<&[u8]>,
        sink: &mut dyn FnMut(&[u8]) -> Result<(), CoreError>,
    ) -> Result<u64, CoreError>;
}

/// The alternate application slot.
pub trait ImageSlot {
    fn write(&mut self, chunk: &[u8]) -> Result<(), CoreError>;
    /// Marks the written image as the one to boot next.
    fn set_pending(&mut self) -> Result<(), CoreError>;
    /// Discards a partially or wrongly written image.
    fn invalidate(&mut self);
}

pub struct UpdatePipeline {
    store: Arc<Store>,
    trust: TrustRoot,
}

/// Result of a committed update: the caller persists nothing further, it just
/// requests the reset.
#[derive(Debug, PartialEq, Eq)]
pub struct Committed {
    pub version: u32,
}

impl UpdatePipeline {
    pub fn new(store: Arc<Store>, trust: TrustRoot) -> Self {
        Self { store, trust }
    }

    pub fn stored_version(&self) -> u32 {
        self.store.load_u32(keys::OTA_VERSION).unwrap_or(0)
    }

    /// Full manifest verification: digest shape, signature decode, signer
    /// resolution (manifest cert chained to the trust-root CA, or the
    /// trust-root device cert), optional key-id pin, ECDSA over the digest.
    pub fn verify_manifest(&self, manifest: &Manifest) -> Result<(), UpdateError> {
        let digest = manifest
            .digest_bytes()
            .map_err(|_| UpdateError::ManifestInvalid("digest"))?;
        let signature = manifest
            .signature_der()
            .map_err(|_| UpdateError::ManifestInvalid("signature"))?;

        let signer_point = self.resolve_signer_key(manifest)?;
        ecdsa_p256_verify_digest(&signer_point, &digest, &signature)
            .map_err(|_| UpdateError::SignatureInvalid)?;
        Ok(())
    }

    fn resolve_signer_key(&self, manifest: &Manifest) -> Result<Vec<u8>, UpdateError> {
        let signer_der = manifest
            .signer_cert_der()
            .map_err(|_| UpdateError::ManifestInvalid("signer cert"))?;

        if let Some(signer_der) = signer_der {
            if let Some(expected) = &manifest.signer_keyid_hex {
                let actual = cert_keyid_hex(&signer_der);
                if !actual.eq_ignore_ascii_case(expected) {
                    return Err(UpdateError::KeyIdMismatch);
                }
            }

            let ca_der = self
                .trust
                .ca
                .as_deref()
                .map(cert_der_bytes)
                .transpose()?
                .ok_or(UpdateError::ChainInvalid)?;
            verify_issued_by(&signer_der, &ca_der)?;
            return public_point(&signer_der);
        }

        // No cert in the manifest: the signer key must come from the
        // trust-root device-cert slot.
        let device_der = self
            .trust
            .device_cert
            .as_deref()
            .map(cert_der_bytes)
            .transpose()?
            .ok_or(UpdateError::Unauthorized)?;
        public_point(&device_der)
    }

    /// Anti-rollback: equal or older versions are refused unless rollback is
    /// explicitly allowed, except that a device below `min_required` must
    /// update even onto an equal version.
    pub fn check_version_policy(&self, manifest: &Manifest) -> Result<(), UpdateError> {
        let current = self.stored_version();
        let new = manifest.version;
        let required = manifest.min_required.is_some_and(|min| current < min);

        if !manifest.allow_rollback() {
            if new < current || (new == current && !required) {
                return Err(UpdateError::VersionRejected { new, current });
            }
        }
        Ok(())
    }

    /// Runs the whole pipeline through commit. On success the anti-rollback
    /// version is already persisted; the caller only issues the reset.
    pub fn apply(
        &self,
        manifest: &Manifest,
        fetcher: &mut dyn ImageFetcher,
        slot: &mut dyn ImageSlot,
    ) -> Result<Committed, UpdateError> {
        self.verify_manifest(manifest)?;
        self.check_version_policy(manifest)?;
        let expected = manifest
            .digest_bytes()
            .map_err(|_| UpdateError::ManifestInvalid("digest"))?;

        let mut hasher = Sha256Stream::new();
        let mut landed: u64 = 0;
        let fetched = fetcher.fetch(&manifest.url, self.trust.ca_pem(), &mut |chunk| {
            slot.write(chunk)?;
            // Hash exactly the bytes that landed in the slot.
            hasher.update(chunk);
            landed += chunk.len() as u64;
            Ok(())
        });

        let total = match fetched {
            Ok(total) => total,
            Err(err) => {
                slot.invalidate();
                return Err(UpdateError::DownloadIncomplete(err.to_string()));
            }
        };
        if total == 0 || total != landed {
            slot.invalidate();
            return Err(UpdateError::DownloadIncomplete(format!(
                "expected {total} bytes, landed {landed}"
            )));
        }

        if hasher.finish() != expected {
            warn!("update: image digest mismatch, discarding slot");
            slot.invalidate();
            return Err(UpdateError::DigestMismatch);
        }

        slot.set_pending().map_err(|err| {
            slot.invalidate();
            UpdateError::CommitFailed(err.to_string())
        })?;

        // Version bump strictly before the reset: a crash in between leaves
        // the old slot running with a higher stored version, which only
        // strengthens anti-rollback.
        let previous = self.stored_version();
        self.store
            .save_u32(keys::OTA_VERSION, manifest.version)
            .map_err(|err| UpdateError::CommitFailed(err.to_string()))?;

        info!(
            "update: image committed, version {previous} -> {}",
            manifest.version
        );
        Ok(Committed {
            version: manifest.version,
        })
    }
}

/// Decides what an incoming cloud job document means for the update pipeline.
#[derive(Debug, PartialEq)]
pub enum JobDecision {
    /// Job carried a full manifest; run the pipeline.
    Manifest(Box<Manifest>),
    /// Nothing actionable in the document.
    Ignored,
}

/// Extracts the manifest from a jobs notify-next body. The legacy
/// `{jobId, ota_url, signature}` shape signs only the URL, not the image, and
/// is refused unless the compatibility flag is set; even then it is only
/// audited, never executed without a manifest.
pub fn decode_job_document(
    body: &str,
    accept_legacy: bool,
) -> Result<JobDecision, UpdateError> {
    let value: serde_json::Value =
        serde_json::from_str(body).map_err(|_| UpdateError::ManifestInvalid("job json"))?;

    if let Some(manifest) = value.get("manifest") {
        let manifest: Manifest = serde_json::from_value(manifest.clone())
            .map_err(|_| UpdateError::ManifestInvalid("job manifest"))?;
        return Ok(JobDecision::Manifest(Box::new(manifest)));
    }

    let looks_legacy = value.get("jobId").is_some()
        && value.get("ota_url").is_some()
        && value.get("signature").is_some();
    if looks_legacy {
        if !accept_legacy {
            return Err(UpdateError::Unauthorized);
        }
        warn!("update: legacy ota_url job accepted by compatibility flag, not executed");
        return Ok(JobDecision::Ignored);
    }

    Ok(JobDecision::Ignored)
}

fn cert_der_bytes(raw: &[u8]) -> Result<Vec<u8>, UpdateError> {
    if raw.windows(10).any(|w| w == b"-----BEGIN") {
        let (_, pem) =
            x509_parser::pem::parse_x509_pem(raw).map_err(|_| UpdateError::ChainInvalid)?;
        Ok(pem.contents)
    } else {
        Ok(raw.to_vec())
    }
}

fn public_point(cert_der: &[u8]) -> Result<Vec<u8>, UpdateError> {
    let (_, cert) =
        X509Certificate::from_der(cert_der).map_err(|_| UpdateError::ChainInvalid)?;
    Ok(cert.public_key().subject_public_key.data.to_vec())
}

/// Verifies that `leaf_der` was signed by the key in `ca_der`. Both the
/// factory CA and signer certificates are ECDSA-P256.
fn verify_issued_by(leaf_der: &[u8], ca_der: &[u8]) -> Result<(), UpdateError> {
    let (_, leaf) = X509Certificate::from_der(leaf_der).map_err(|_| UpdateError::ChainInvalid)?;
    let ca_point = public_point(ca_der)?;

    let tbs = leaf.tbs_certificate.as_ref();
    let signature = leaf.signature_value.data.as_ref();
    ecdsa_p256_verify_message(&ca_point, tbs, signature).map_err(|_| UpdateError::ChainInvalid)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::sha256;
    use crate::store::MemoryBackend;
    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine as _;
    use p256::ecdsa::signature::hazmat::PrehashSigner;
    use p256::ecdsa::{Signature, SigningKey};
    use p256::pkcs8::DecodePrivateKey;
    use rcgen::{BasicConstraints, CertificateParams, DistinguishedName, DnType, IsCa, KeyPair};

    struct TestPki {
        ca_der: Vec<u8>,
        signer_der: Vec<u8>,
        signer_key: SigningKey,
    }

    fn make_pki() -> TestPki {
        let ca_key = KeyPair::generate().unwrap();
        let mut ca_params = CertificateParams::default();
        ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, "Factory Root");
        ca_params.distinguished_name = dn;
        let ca_cert = ca_params.self_signed(&ca_key).unwrap();

        let signer_key_pair = KeyPair::generate().unwrap();
        let mut signer_params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, "Firmware Signer");
        signer_params.distinguished_name = dn;
        let signer_cert = signer_params
            .signed_by(&signer_key_pair, &ca_cert, &ca_key)
            .unwrap();

        TestPki {
            ca_der: ca_cert.der().as_ref().to_vec(),
            signer_der: signer_cert.der().as_ref().to_vec(),
            signer_key: SigningKey::from_pkcs8_der(&signer_key_pair.serialize_der()).unwrap(),
        }
    }

    fn signed_manifest(pki: &TestPki, image: &[u8], version: u32) -> Manifest {
        let digest = sha256(image);
        let signature: Signature = pki.signer_key.sign_prehash(&digest).unwrap();
        Manifest {
            url: "https://firmware.example/app.bin".into(),
            digest: hex::encode(digest),
            signature: BASE64.encode(signature.to_der().as_bytes()),
            version,
            min_required: None,
            signer_cert_b64: Some(BASE64.encode(&pki.signer_der)),
            signer_keyid_hex: None,
            allow_rollback: None,
        }
    }

    fn pipeline_with(pki: &TestPki, current_version: Option<u32>) -> UpdatePipeline {
        let store = Arc::new(Store::new(Box::new(MemoryBackend::new())));
        if let Some(v) = current_version {
            store.save_u32(keys::OTA_VERSION, v).unwrap();
        }
        let trust = TrustRoot {
            ca: Some(pki.ca_der.clone()),
            device_cert: None,
            device_key: None,
        };
        UpdatePipeline::new(store, trust)
    }

    struct VecFetcher {
        image: Vec<u8>,
        fail_after: Option<usize>,
    }

    impl ImageFetcher for VecFetcher {
        fn fetch(
            &mut self,
            _url: &str,
            _ca_pem: Option<&[u8]>,
            sink: &mut dyn FnMut(&[u8]) -> Result<(), CoreError>,
        ) -> Result<u64, CoreError> {
            let mut sent = 0usize;
            for chunk in self.image.chunks(7) {
                if let Some(limit) = self.fail_after {
                    if sent >= limit {
                        return Err(CoreError::Io("connection reset".into()));
                    }
                }
                sink(chunk)?;
                sent += chunk.len();
            }
            Ok(sent as u64)
        }
    }

    #[derive(Default)]
    struct MemSlot {
        data: Vec<u8>,
        pending: bool,
        invalidated: bool,
    }

    impl ImageSlot for MemSlot {
        fn write(&mut self, chunk: &[u8]) -> Result<(), CoreError> {
            self.data.extend_from_slice(chunk);
            Ok(())
        }

        fn set_pending(&mut self) -> Result<(), CoreError> {
            self.pending = true;
            Ok(())
        }

        fn invalidate(&mut self) {
            self.invalidated = true;
            self.data.clear();
        }
    }

    const IMAGE: &[u8] = b"this stands in for a firmware image of a few dozen bytes....";

    #[test]
    fn happy_path_commits_and_persists_version() {
        let pki = make_pki();
        let pipeline = pipeline_with(&pki, Some(3));
        let manifest = signed_manifest(&pki, IMAGE, 4);

        let mut fetcher = VecFetcher {
            image: IMAGE.to_vec(),
            fail_after: None,
        };
        let mut slot = MemSlot::default();

        let committed = pipeline.apply(&manifest, &mut fetcher, &mut slot).unwrap();
        assert_eq!(committed.version, 4);
        assert!(slot.pending);
        assert_eq!(slot.data, IMAGE);
        assert_eq!(pipeline.stored_version(), 4);
    }

    #[test]
    fn truncated_download_invalidates_slot_and_keeps_version() {
        let pki = make_pki();
        let pipeline = pipeline_with(&pki, Some(3));
        let manifest = signed_manifest(&pki, IMAGE, 4);

        let mut fetcher = VecFetcher {
            image: IMAGE.to_vec(),
            fail_after: Some(14),
        };
        let mut slot = MemSlot::default();

        let err = pipeline.apply(&manifest, &mut fetcher, &mut slot).unwrap_err();
        assert_eq!(err.audit_label(), "DownloadIncomplete");
        assert!(slot.invalidated);
        assert!(!slot.pending);
        assert_eq!(pipeline.stored_version(), 3);
    }

    #[test]
    fn digest_mismatch_aborts_even_with_a_valid_signature() {
        let pki = make_pki();
        let pipeline = pipeline_with(&pki, Some(3));
        let manifest = signed_manifest(&pki, IMAGE, 4);

        let mut fetcher = VecFetcher {
            image: b"a different payload entirely".to_vec(),
            fail_after: None,
        };
        let mut slot = MemSlot::default();

        let err = pipeline.apply(&manifest, &mut fetcher, &mut slot).unwrap_err();
        assert_eq!(err.audit_label(), "DigestMismatch");
        assert!(slot.invalidated);
        assert_eq!(pipeline.stored_version(), 3);
    }

    #[test]
    fn equal_version_is_rejected_without_rollback_flag() {
        let pki = make_pki();
        let pipeline = pipeline_with(&pki, Some(4));
        let manifest = signed_manifest(&pki, IMAGE, 4);
        assert!(matches!(
            pipeline.check_version_policy(&manifest),
            Err(UpdateError::VersionRejected { new: 4, current: 4 })
        ));
    }

    #[test]
    fn equal_version_is_forced_when_below_min_required() {
        let pki = make_pki();
        let pipeline = pipeline_with(&pki, Some(4));
        let mut manifest = signed_manifest(&pki, IMAGE, 4);
        manifest.min_required = Some(5);
        assert!(pipeline.check_version_policy(&manifest).is_ok());
    }

    #[test]
    fn older_version_is_rejected_even_below_min_required() {
        let pki = make_pki();
        let pipeline = pipeline_with(&pki, Some(4));
        let mut manifest = signed_manifest(&pki, IMAGE, 2);
        manifest.min_required = Some(5);
        assert!(matches!(
            pipeline.check_version_policy(&manifest),
            Err(UpdateError::VersionRejected { .. })
        ));
    }

    #[test]
    fn rollback_flag_admits_an_older_version() {
        let pki = make_pki();
        let pipeline = pipeline_with(&pki, Some(4));
        let mut manifest = signed_manifest(&pki, IMAGE, 2);
        manifest.allow_rollback = Some(true);
        assert!(pipeline.check_version_policy(&manifest).is_ok());
    }

    #[test]
    fn broken_chain_is_rejected() {
        let pki = make_pki();
        let other = make_pki();
        let pipeline = pipeline_with(&other, None);
        // Signer chains to `pki`'s CA, but the trust root holds `other`'s.
        let manifest = signed_manifest(&pki, IMAGE, 1);
        let err = pipeline.verify_manifest(&manifest).unwrap_err();
        assert_eq!(err.audit_label(), "ChainInvalid");
    }

    #[test]
    fn keyid_pin_is_case_insensitive_and_enforced() {
        let pki = make_pki();
        let pipeline = pipeline_with(&pki, None);

        let mut manifest = signed_manifest(&pki, IMAGE, 1);
        manifest.signer_keyid_hex = Some(cert_keyid_hex(&pki.signer_der).to_uppercase());
        assert!(pipeline.verify_manifest(&manifest).is_ok());

        manifest.signer_keyid_hex = Some("00".repeat(32));
        assert!(matches!(
            pipeline.verify_manifest(&manifest),
            Err(UpdateError::KeyIdMismatch)
        ));
    }

    #[test]
    fn tampered_signature_is_rejected() {
        let pki = make_pki();
        let pipeline = pipeline_with(&pki, None);
        let mut manifest = signed_manifest(&pki, IMAGE, 1);
        manifest.digest = hex::encode(sha256(b"some other image"));
        assert!(matches!(
            pipeline.verify_manifest(&manifest),
            Err(UpdateError::SignatureInvalid)
        ));
    }

    #[test]
    fn device_cert_signs_when_manifest_carries_no_cert() {
        let pki = make_pki();
        let store = Arc::new(Store::new(Box::new(MemoryBackend::new())));
        let trust = TrustRoot {
            ca: None,
            device_cert: Some(pki.signer_der.clone()),
            device_key: None,
        };
        let pipeline = UpdatePipeline::new(store, trust);

        let mut manifest = signed_manifest(&pki, IMAGE, 1);
        manifest.signer_cert_b64 = None;
        assert!(pipeline.verify_manifest(&manifest).is_ok());
    }

    #[test]
    fn no_signer_anywhere_is_unauthorized() {
        let pki = make_pki();
        let store = Arc::new(Store::new(Box::new(MemoryBackend::new())));
        let pipeline = UpdatePipeline::new(store, TrustRoot::default());
        let mut manifest = signed_manifest(&pki, IMAGE, 1);
        manifest.signer_cert_b64 = None;
        assert!(matches!(
            pipeline.verify_manifest(&manifest),
            Err(UpdateError::Unauthorized)
        ));
    }

    #[test]
    fn job_documents_route_to_the_manifest_path_only() {
        let body = r#"{"manifest":{"url":"https://x/a.bin","digest":"00","signature":"AA==","version":1}}"#;
        assert!(matches!(
            decode_job_document(body, false).unwrap(),
            JobDecision::Manifest(_)
        ));

        let legacy = r#"{"jobId":"j1","ota_url":"https://x/a.bin","signature":"AA=="}"#;
        assert!(matches!(
            decode_job_document(legacy, false),
            Err(UpdateError::Unauthorized)
        ));
        assert_eq!(decode_job_document(legacy, true).unwrap(), JobDecision::Ignored);

        assert_eq!(
            decode_job_document(r#"{"unrelated":true}"#, false).unwrap(),
            JobDecision::Ignored
        );
    }
}
