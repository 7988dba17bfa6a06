//! Thin wrappers over the RustCrypto primitives the rest of the core uses:
//! ephemeral P-256 key agreement, HKDF-SHA256, AES-256-GCM framing, SHA-256
//! (one-shot and streaming) and ECDSA-P256 verification.

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use hkdf::Hkdf;
use p256::ecdh::EphemeralSecret;
use p256::ecdsa::signature::hazmat::PrehashVerifier;
use p256::ecdsa::signature::Verifier;
use p256::ecdsa::{Signature, VerifyingKey};
use p256::elliptic_curve::sec1::ToEncodedPoint;
use p256::PublicKey;
use rand_core::OsRng;
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

pub const AEAD_KEY_LEN: usize = 32;
pub const AEAD_IV_LEN: usize = 12;
pub const AEAD_TAG_LEN: usize = 16;
/// Uncompressed X9.62 P-256 point length.
pub const P256_POINT_LEN: usize = 65;

/// Device-side half of an ECDH exchange. The secret key never leaves this
/// handle and is dropped with it.
pub struct EcdhKeypair {
    secret: EphemeralSecret,
    public: [u8; P256_POINT_LEN],
}

impl EcdhKeypair {
    pub fn generate() -> Self {
        let secret = EphemeralSecret::random(&mut OsRng);
        let point = secret.public_key().to_encoded_point(false);
        let mut public = [0u8; P256_POINT_LEN];
        public.copy_from_slice(point.as_bytes());
        Self { secret, public }
    }

    /// Uncompressed public point, `0x04 ‖ X ‖ Y`.
    pub fn public_bytes(&self) -> &[u8; P256_POINT_LEN] {
        &self.public
    }

    /// Raw X-coordinate shared secret with the peer's uncompressed point.
    pub fn shared_secret(self, peer_pub: &[u8]) -> Result<[u8; 32]> {
        let peer = PublicKey::from_sec1_bytes(peer_pub)
            .map_err(|_| Error::Crypto("bad peer public key"))?;
        let shared = self.secret.diffie_hellman(&peer);
        let mut out = [0u8; 32];
        out.copy_from_slice(shared.raw_secret_bytes().as_slice());
        Ok(out)
    }
}

pub fn hkdf_sha256(salt: &[u8], ikm: &[u8], info: &[u8], len: usize) -> Result<Vec<u8>> {
    let hk = Hkdf::<Sha256>::new(Some(salt), ikm);
    let mut okm = vec![0u8; len];
    hk.expand(info, &mut okm)
        .map_err(|_| Error::Crypto("hkdf expand"))?;
    Ok(okm)
}

/// Seals `plaintext`, returning `ciphertext ‖ tag[16]` ready for the wire.
pub fn aes256_gcm_seal(
    key: &[u8; AEAD_KEY_LEN],
    iv: &[u8; AEAD_IV_LEN],
    aad: &[u8],
    plaintext: &[u8],
) -> Result<Vec<u8>> {
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| Error::Crypto("aead key"))?;
    cipher
        .encrypt(
            Nonce::from_slice(iv),
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|_| Error::Crypto("aead seal"))
}

/// Opens `ciphertext ‖ tag[16]`. The tag comparison is constant-time inside
/// the AEAD; any failure surfaces as [`Error::Auth`].
pub fn aes256_gcm_open(
    key: &[u8; AEAD_KEY_LEN],
    iv: &[u8; AEAD_IV_LEN],
    aad: &[u8],
    ciphertext_and_tag: &[u8],
) -> Result<Vec<u8>> {
    if ciphertext_and_tag.len() < AEAD_TAG_LEN {
        return Err(Error::InvalidArgument("sealed frame too short"));
    }
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| Error::Crypto("aead key"))?;
    cipher
        .decrypt(
            Nonce::from_slice(iv),
            Payload {
                msg: ciphertext_and_tag,
                aad,
            },
        )
        .map_err(|_| Error::Auth)
}

pub fn sha256(data: &[u8]) -> [u8; 32] {
    let digest = Sha256::digest(data);
    digest.into()
}

/// Streaming SHA-256 for image hashing.
#[derive(Default)]
pub struct Sha256Stream {
    inner: Sha256,
}

impl Sha256Stream {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, chunk: &[u8]) {
        self.inner.update(chunk);
    }

    pub fn finish(self) -> [u8; 32] {
        self.inner.finalize().into()
    }
}

/// Verifies a DER ECDSA-P256 signature over an already-computed SHA-256
/// digest, as used for manifest signatures.
pub fn ecdsa_p256_verify_digest(
    public_point: &[u8],
    digest: &[u8; 32],
    signature_der: &[u8],
) -> Result<()> {
    let key = VerifyingKey::from_sec1_bytes(public_point)
        .map_err(|_| Error::Crypto("bad verifying key"))?;
    let signature =
        Signature::from_der(signature_der).map_err(|_| Error::Crypto("bad signature encoding"))?;
    key.verify_prehash(digest, &signature)
        .map_err(|_| Error::Auth)
}

/// Verifies a DER ECDSA-P256 signature over a message (hashed with SHA-256),
/// as used for certificate TBS verification.
pub fn ecdsa_p256_verify_message(
    public_point: &[u8],
    message: &[u8],
    signature_der: &[u8],
) -> Result<()> {
    let key = VerifyingKey::from_sec1_bytes(public_point)
        .map_err(|_| Error::Crypto("bad verifying key"))?;
    let signature =
        Signature::from_der(signature_der).map_err(|_| Error::Crypto("bad signature encoding"))?;
    key.verify(message, &signature).map_err(|_| Error::Auth)
}

/// SHA-256 of a certificate's DER bytes, in lowercase hex. Used to pin a
/// manifest to a specific signer certificate.
pub fn cert_keyid_hex(cert_der: &[u8]) -> String {
    hex::encode(sha256(cert_der))
}
