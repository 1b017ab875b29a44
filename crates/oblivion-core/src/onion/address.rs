//! Onion address validation
//!
//! Version 3: 56 base32 characters encoding `pubkey(32) || checksum(2) ||
//! version(1)`, where the checksum is the first two bytes of
//! `SHA3-256(".onion checksum" || pubkey || version)`.
//! Version 2 (deprecated): 16 base32 characters, the truncated key hash.

use sha3::{Digest, Sha3_256};

use super::base32;
use crate::error::{CoreError, CoreResult};

pub const ONION_SUFFIX: &str = ".onion";
pub const V2_LENGTH: usize = 16;
pub const V3_LENGTH: usize = 56;
const V3_VERSION: u8 = 3;

/// Address format version
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OnionVersion {
    V2,
    V3,
}

impl OnionVersion {
    pub fn number(&self) -> u8 {
        match self {
            OnionVersion::V2 => 2,
            OnionVersion::V3 => 3,
        }
    }
}

/// A validated onion address
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OnionAddress {
    /// Normalized `<label>.onion`
    address: String,
    version: OnionVersion,
    /// Ed25519 key (v3) or truncated key hash (v2)
    public_key: Vec<u8>,
}

fn v3_checksum(public_key: &[u8], version: u8) -> [u8; 2] {
    let mut hasher = Sha3_256::new();
    hasher.update(b".onion checksum");
    hasher.update(public_key);
    hasher.update([version]);
    let digest = hasher.finalize();
    [digest[0], digest[1]]
}

impl OnionAddress {
    /// Validate shape, alphabet and (v3) checksum
    pub fn parse(input: &str) -> CoreResult<Self> {
        let normalized = input.trim().to_ascii_lowercase();
        let label = normalized
            .strip_suffix(ONION_SUFFIX)
            .ok_or_else(|| CoreError::InvalidAddress(format!("'{}' lacks .onion suffix", input)))?;

        let version = match label.len() {
            V2_LENGTH => OnionVersion::V2,
            V3_LENGTH => OnionVersion::V3,
            n => {
                return Err(CoreError::InvalidAddress(format!(
                    "{} characters, expected {} or {}",
                    n, V2_LENGTH, V3_LENGTH
                )))
            }
        };

        let decoded = base32::decode(label)
            .ok_or_else(|| CoreError::InvalidAddress(format!("'{}' is not base32", label)))?;

        let public_key = match version {
            OnionVersion::V2 => decoded,
            OnionVersion::V3 => {
                let (key, rest) = decoded.split_at(32);
                let (checksum, ver) = rest.split_at(2);
                if ver != [V3_VERSION] {
                    return Err(CoreError::InvalidAddress(format!(
                        "unsupported version byte {}",
                        ver.first().copied().unwrap_or_default()
                    )));
                }
                if checksum != v3_checksum(key, V3_VERSION) {
                    return Err(CoreError::InvalidAddress("checksum mismatch".into()));
                }
                key.to_vec()
            }
        };

        Ok(Self {
            address: normalized,
            version,
            public_key,
        })
    }

    /// v3 address for an ed25519 public key
    pub fn from_public_key(public_key: &[u8; 32]) -> Self {
        let mut raw = Vec::with_capacity(35);
        raw.extend_from_slice(public_key);
        raw.extend_from_slice(&v3_checksum(public_key, V3_VERSION));
        raw.push(V3_VERSION);
        Self {
            address: format!("{}{}", base32::encode(&raw), ONION_SUFFIX),
            version: OnionVersion::V3,
            public_key: public_key.to_vec(),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.address
    }

    pub fn version(&self) -> OnionVersion {
        self.version
    }

    pub fn public_key(&self) -> &[u8] {
        &self.public_key
    }
}

impl std::fmt::Display for OnionAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.address)
    }
}
