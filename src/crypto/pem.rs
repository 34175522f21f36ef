/// Canonical PEM handling and the identity digests derived from it.
///
/// A persona's id is the digest of its public key in canonical form: a
/// single BEGIN/END frame with prefix and suffix garbage stripped and
/// exactly one trailing newline. The canonical bytes are what lands on
/// disk, so `sha256sum rsa.pub.pem` inside the store reproduces the id.
use openssl::hash::hash;
use openssl::pkey::{Id, PKeyRef};

use crate::config::DigestAlgo;
use crate::error::{Result, StoreError};
use crate::hexid::blob_to_hex;

pub const PUB_BEGIN: &str = "-----BEGIN PUBLIC KEY-----";
pub const PUB_END: &str = "-----END PUBLIC KEY-----";

/// Key classes the store distinguishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyClass {
    Rsa,
    Ec,
    Dh,
    Other,
}

impl KeyClass {
    /// On-disk filename prefix for long-term keys of this class.
    pub(crate) fn marker(self) -> Option<&'static str> {
        match self {
            KeyClass::Rsa => Some("rsa"),
            KeyClass::Ec => Some("ec"),
            _ => None,
        }
    }
}

pub fn classify<T>(key: &PKeyRef<T>) -> KeyClass {
    match key.id() {
        Id::RSA => KeyClass::Rsa,
        Id::EC => KeyClass::Ec,
        Id::DH => KeyClass::Dh,
        _ => KeyClass::Other,
    }
}

/// Put a public-key blob into its canonical single-frame form.
///
/// Stable under prefix garbage, trailing garbage and trailing-newline
/// variance; a blob containing more than one public-key frame is rejected.
pub fn normalize_pubkey(pem: &str) -> Result<String> {
    let start = pem
        .find(PUB_BEGIN)
        .ok_or_else(|| StoreError::Malformed("public key blob has no BEGIN marker".into()))?;
    let s = &pem[start..];
    if s[PUB_BEGIN.len()..].contains(PUB_BEGIN) {
        return Err(StoreError::Malformed(
            "more than one public key in blob".into(),
        ));
    }
    let end = s
        .find(PUB_END)
        .ok_or_else(|| StoreError::Malformed("public key blob has no END marker".into()))?;
    let mut out = s[..end + PUB_END.len()].to_string();
    out.push('\n');
    Ok(out)
}

/// Canonicalize `pem` and digest the canonical bytes.
///
/// Returns the canonical form together with its lowercase hex digest, the
/// derived identity of the key.
pub fn normalize_and_hash(md: DigestAlgo, pem: &str) -> Result<(String, String)> {
    let norm = normalize_pubkey(pem)?;
    let digest = hash(md.md(), norm.as_bytes())?;
    Ok((norm, blob_to_hex(&digest)))
}

/// Digest the raw big-endian byte serialization of a DH public integer.
///
/// Finite-field DH public keys are a single big number, so they are hashed
/// by value rather than over a PEM frame.
pub fn hash_bignum(md: DigestAlgo, bytes: &[u8]) -> Result<String> {
    if bytes.is_empty() {
        return Err(StoreError::Malformed("empty public integer".into()));
    }
    let digest = hash(md.md(), bytes)?;
    Ok(blob_to_hex(&digest))
}

#[cfg(test)]
mod tests {
    use super::*;

    const FRAME: &str = "-----BEGIN PUBLIC KEY-----\nMFkwEwYHKoZI\n-----END PUBLIC KEY-----";

    #[test]
    fn test_normalize_strips_prefix_and_suffix_garbage() {
        let dirty = format!("X-Mailer: junk\n{FRAME}\ntrailing garbage");
        let norm = normalize_pubkey(&dirty).unwrap();
        assert_eq!(norm, format!("{FRAME}\n"));
    }

    #[test]
    fn test_normalize_is_idempotent() {
        let once = normalize_pubkey(FRAME).unwrap();
        let twice = normalize_pubkey(&once).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn test_normalize_appends_exactly_one_newline() {
        let norm = normalize_pubkey(&format!("{FRAME}\n\n\n")).unwrap();
        assert!(norm.ends_with("-----END PUBLIC KEY-----\n"));
        assert!(!norm.ends_with("\n\n"));
    }

    #[test]
    fn test_normalize_rejects_two_frames() {
        let double = format!("{FRAME}\n{FRAME}\n");
        assert!(matches!(
            normalize_pubkey(&double),
            Err(StoreError::Malformed(_))
        ));
    }

    #[test]
    fn test_normalize_rejects_missing_markers() {
        assert!(normalize_pubkey("no key here").is_err());
        assert!(normalize_pubkey("-----BEGIN PUBLIC KEY-----\ntruncated").is_err());
    }

    #[test]
    fn test_hash_matches_digest_length() {
        let (_, hex) = normalize_and_hash(DigestAlgo::Sha256, FRAME).unwrap();
        assert_eq!(hex.len(), DigestAlgo::Sha256.hex_len());
        assert!(crate::hexid::is_hex_hash(&hex));

        let (_, hex) = normalize_and_hash(DigestAlgo::Sha512, FRAME).unwrap();
        assert_eq!(hex.len(), DigestAlgo::Sha512.hex_len());
    }

    #[test]
    fn test_garbage_wrapped_blob_hashes_identically() {
        let (_, clean) = normalize_and_hash(DigestAlgo::Sha256, FRAME).unwrap();
        let dirty = format!("garbage\n{FRAME}\ntrailing");
        let (_, wrapped) = normalize_and_hash(DigestAlgo::Sha256, &dirty).unwrap();
        assert_eq!(clean, wrapped);
    }

    #[test]
    fn test_hash_bignum_rejects_empty() {
        assert!(hash_bignum(DigestAlgo::Sha256, &[]).is_err());
        let hex = hash_bignum(DigestAlgo::Sha256, &[0x02, 0xff]).unwrap();
        assert_eq!(hex.len(), 64);
    }
}
