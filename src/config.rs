/// Keystore configuration: base directory, identity digest, and the
/// parameters used when generating fresh key material.
use std::path::PathBuf;

use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use serde::Deserialize;

/// Digest used to derive persona and kex-key identities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DigestAlgo {
    Sha256,
    Sha512,
}

impl DigestAlgo {
    pub(crate) fn md(self) -> MessageDigest {
        match self {
            DigestAlgo::Sha256 => MessageDigest::sha256(),
            DigestAlgo::Sha512 => MessageDigest::sha512(),
        }
    }

    /// Length of the lowercase hex form of one digest.
    pub fn hex_len(self) -> usize {
        match self {
            DigestAlgo::Sha256 => 64,
            DigestAlgo::Sha512 => 128,
        }
    }
}

/// Named curves supported for EC personas and their ephemeral ECDH keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum EcCurve {
    #[serde(rename = "prime256v1")]
    Prime256v1,
    #[serde(rename = "secp384r1")]
    Secp384r1,
    #[serde(rename = "secp521r1")]
    Secp521r1,
    #[serde(rename = "brainpoolP320r1")]
    BrainpoolP320r1,
}

impl EcCurve {
    pub(crate) fn nid(self) -> Nid {
        match self {
            EcCurve::Prime256v1 => Nid::X9_62_PRIME256V1,
            EcCurve::Secp384r1 => Nid::SECP384R1,
            EcCurve::Secp521r1 => Nid::SECP521R1,
            EcCurve::BrainpoolP320r1 => Nid::BRAINPOOL_P320R1,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Base directory all personas live under.
    pub base_dir: PathBuf,
    /// Identity digest; hex ids are `digest.hex_len()` characters long.
    pub digest: DigestAlgo,
    /// Modulus length for fresh RSA personas.
    pub rsa_bits: u32,
    /// RSA public exponent as a decimal string.
    pub rsa_exponent: String,
    /// Curve for EC personas.
    pub curve: EcCurve,
    /// Prime length for fresh DH parameters.
    pub dh_bits: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            base_dir: PathBuf::from(".persona-vault"),
            digest: DigestAlgo::Sha256,
            rsa_bits: 4096,
            rsa_exponent: "65537".to_string(),
            curve: EcCurve::Secp521r1,
            dh_bits: 2048,
        }
    }
}

impl Config {
    /// Configuration rooted at `base`, defaults everywhere else.
    pub fn at(base: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base.into(),
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = Config::default();
        assert_eq!(cfg.digest, DigestAlgo::Sha256);
        assert_eq!(cfg.rsa_bits, 4096);
        assert_eq!(cfg.rsa_exponent, "65537");
        assert_eq!(cfg.dh_bits, 2048);
    }

    #[test]
    fn test_hex_len_matches_digest() {
        assert_eq!(DigestAlgo::Sha256.hex_len(), 64);
        assert_eq!(DigestAlgo::Sha512.hex_len(), 128);
    }
}
