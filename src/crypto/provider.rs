/// Key generation behind a pluggable provider seam.
///
/// The trait speaks PEM strings and raw bytes only, so stores can be driven
/// by deterministic doubles in tests while production uses OpenSSL.
use std::io::Write;

use openssl::bn::BigNum;
use openssl::dh::Dh;
use openssl::ec::{EcGroup, EcKey};
use openssl::nid::Nid;
use openssl::pkey::PKey;
use openssl::rsa::Rsa;

use crate::config::Config;
use crate::crypto::sensitive::SecretPem;
use crate::error::{Result, StoreError};

/// Generator fixed by the wire format of existing stores.
const DH_GENERATOR: u32 = 5;

/// A freshly generated long-term keypair in PEM form.
pub struct PemKeyPair {
    pub public: String,
    pub private: SecretPem,
}

/// A freshly generated finite-field DH keypair.
#[derive(Debug)]
pub struct DhKexMaterial {
    pub public: String,
    pub private: SecretPem,
    /// Raw big-endian bytes of the public integer; hashed for the kex id.
    pub public_bytes: Vec<u8>,
}

pub trait KeyProvider {
    /// Keypair on the configured named curve. Public key is emitted in
    /// SubjectPublicKeyInfo form, private key as unencrypted PKCS#8.
    fn generate_ec(&self) -> Result<PemKeyPair>;

    /// RSA keypair with the configured modulus length and public exponent.
    fn generate_rsa(&self) -> Result<PemKeyPair>;

    /// Fresh safe-prime DH parameters as a DHparams PEM.
    fn generate_dh_params(&self) -> Result<String>;

    /// Fresh keypair drawn from the given DHparams PEM.
    fn generate_dh_keypair(&self, params_pem: &str) -> Result<DhKexMaterial>;
}

/// OpenSSL-backed provider. Entropy comes from OpenSSL's auto-seeded CSPRNG.
pub struct OpenSslProvider {
    rsa_bits: u32,
    rsa_exponent: String,
    curve: Nid,
    dh_bits: u32,
}

impl OpenSslProvider {
    pub fn new(cfg: &Config) -> Self {
        Self {
            rsa_bits: cfg.rsa_bits,
            rsa_exponent: cfg.rsa_exponent.clone(),
            curve: cfg.curve.nid(),
            dh_bits: cfg.dh_bits,
        }
    }
}

/// Keygen progress markers on stderr, same alphabet the message tools show
/// during long prime searches.
fn progress(marker: &str) {
    let _ = std::io::stderr().write_all(marker.as_bytes());
}

fn pem_string(bytes: Vec<u8>) -> Result<String> {
    String::from_utf8(bytes).map_err(|_| StoreError::Malformed("emitted PEM is not UTF-8".into()))
}

impl KeyProvider for OpenSslProvider {
    fn generate_ec(&self) -> Result<PemKeyPair> {
        let group = EcGroup::from_curve_name(self.curve)?;
        let key = EcKey::generate(&group)?;
        key.check_key()?;
        let pkey = PKey::from_ec_key(key)?;
        Ok(PemKeyPair {
            public: pem_string(pkey.public_key_to_pem()?)?,
            private: SecretPem::new(pem_string(pkey.private_key_to_pem_pkcs8()?)?),
        })
    }

    fn generate_rsa(&self) -> Result<PemKeyPair> {
        let e = BigNum::from_dec_str(&self.rsa_exponent)
            .map_err(|_| StoreError::Crypto(format!("bad RSA exponent {:?}", self.rsa_exponent)))?;
        progress("o");
        let rsa = Rsa::generate_with_e(self.rsa_bits, &e)?;
        progress("O");
        if !rsa.check_key()? {
            return Err(StoreError::Crypto("generated RSA key failed self-check".into()));
        }
        progress("+");
        let pkey = PKey::from_rsa(rsa)?;
        let pair = PemKeyPair {
            public: pem_string(pkey.public_key_to_pem()?)?,
            private: SecretPem::new(pem_string(pkey.private_key_to_pem_pkcs8()?)?),
        };
        progress(".");
        Ok(pair)
    }

    fn generate_dh_params(&self) -> Result<String> {
        progress("o");
        let dh = Dh::generate_params(self.dh_bits, DH_GENERATOR)?;
        progress("O");
        let g = BigNum::from_u32(DH_GENERATOR)?;
        if dh.prime_p().num_bits() as u32 != self.dh_bits || dh.generator() != &*g {
            return Err(StoreError::Crypto(
                "generated DH parameters failed consistency check".into(),
            ));
        }
        progress("+");
        let pem = pem_string(dh.params_to_pem()?)?;
        progress(".");
        Ok(pem)
    }

    fn generate_dh_keypair(&self, params_pem: &str) -> Result<DhKexMaterial> {
        let params = Dh::params_from_pem(params_pem.as_bytes())
            .map_err(|e| StoreError::Malformed(format!("DH parameters: {e}")))?;
        let dh = params.generate_key()?;

        // the public key must lie strictly between 1 and p-1
        let one = BigNum::from_u32(1)?;
        let mut p_minus_1 = BigNum::new()?;
        p_minus_1.checked_sub(dh.prime_p(), &one)?;
        let pub_key = dh.public_key();
        if pub_key <= &*one || pub_key >= &*p_minus_1 {
            return Err(StoreError::Crypto(
                "generated DH key failed consistency check".into(),
            ));
        }

        let public_bytes = pub_key.to_vec();
        let pkey = PKey::from_dh(dh)?;
        Ok(DhKexMaterial {
            public: pem_string(pkey.public_key_to_pem()?)?,
            private: SecretPem::new(pem_string(pkey.private_key_to_pem_pkcs8()?)?),
            public_bytes,
        })
    }
}
