//! Factory-installed trust-root blob: a `SPCF` TLV container holding the CA
//! certificate, the device certificate, and the device private key. The
//! device only ever reads it; the image builder exists for the host-side
//! provisioning path.

use crate::error::{Error, Result};

const MAGIC: [u8; 5] = [b'S', b'P', b'C', b'F', 0x01];

const TLV_CA: u8 = 1;
const TLV_DEVICE_CERT: u8 = 2;
const TLV_DEVICE_KEY: u8 = 3;

/// Parsed trust-root contents. Unknown TLV types are skipped; a truncated
/// final record ends parsing without error.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrustRoot {
    pub ca: Option<Vec<u8>>,
    pub device_cert: Option<Vec<u8>>,
    pub device_key: Option<Vec<u8>>,
}

impl TrustRoot {
    pub fn parse(blob: &[u8]) -> Result<Self> {
        if blob.len() < MAGIC.len() || blob[..MAGIC.len()] != MAGIC {
            return Err(Error::InvalidArgument("trust-root magic"));
        }

        let mut root = TrustRoot::default();
        let mut idx = MAGIC.len();
        while idx + 5 <= blob.len() {
            let tlv_type = blob[idx];
            let len = u32::from_le_bytes(blob[idx + 1..idx + 5].try_into().unwrap()) as usize;
            idx += 5;
            if len == 0 || idx + len > blob.len() {
                break;
            }
            let value = blob[idx..idx + len].to_vec();
            match tlv_type {
                TLV_CA => root.ca = Some(value),
                TLV_DEVICE_CERT => root.device_cert = Some(value),
                TLV_DEVICE_KEY => root.device_key = Some(value),
                _ => {}
            }
            idx += len;
        }
        Ok(root)
    }

    /// Builds a flashable image, optionally padded with zeros to a partition
    /// size. Counterpart of `parse`, used by the provisioning tool path.
    pub fn to_image(&self, pad_to: usize) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&MAGIC);
        for (tlv_type, value) in [
            (TLV_CA, &self.ca),
            (TLV_DEVICE_CERT, &self.device_cert),
            (TLV_DEVICE_KEY, &self.device_key),
        ] {
            if let Some(value) = value {
                out.push(tlv_type);
                out.extend_from_slice(&(value.len() as u32).to_le_bytes());
                out.extend_from_slice(value);
            }
        }
        if out.len() < pad_to {
            out.resize(pad_to, 0);
        }
        out
    }

    /// CA bytes only if they look like a PEM bundle, which is what the TLS
    /// stack expects for server pinning.
    pub fn ca_pem(&self) -> Option<&[u8]> {
        self.ca
            .as_deref()
            .filter(|ca| ca.windows(10).any(|w| w == b"-----BEGIN"))
    }
}
