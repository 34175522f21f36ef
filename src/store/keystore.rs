/// Directory-scoped collection of personas keyed by hex identifier.
///
/// The keystore never trusts the base directory to be clean: enumeration
/// skips entries that do not look like persona ids and personas that fail
/// to load, so one corrupted or half-created directory cannot take the
/// whole store down.
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use openssl::pkey::PKey;
use tracing::debug;

use crate::config::{Config, DigestAlgo};
use crate::crypto::pem;
use crate::crypto::provider::{KeyProvider, OpenSslProvider, PemKeyPair};
use crate::crypto::sensitive::SecretPem;
use crate::error::{Result, StoreError};
use crate::hexid::{is_hex_hash, SHORT_ID_LEN};
use crate::store::fsio::Staging;
use crate::store::persona::{KeyBox, Persona};

pub struct Keystore {
    base: PathBuf,
    md: DigestAlgo,
    provider: Box<dyn KeyProvider>,
    personas: BTreeMap<String, Persona>,
}

impl Keystore {
    /// Open a keystore over the configured base directory.
    pub fn open(cfg: &Config) -> Self {
        Self::with_provider(cfg, Box::new(OpenSslProvider::new(cfg)))
    }

    /// Open with a custom key provider (deterministic doubles in tests).
    pub fn with_provider(cfg: &Config, provider: Box<dyn KeyProvider>) -> Self {
        Self {
            base: cfg.base_dir.clone(),
            md: cfg.digest,
            provider,
            personas: BTreeMap::new(),
        }
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    pub fn digest(&self) -> DigestAlgo {
        self.md
    }

    pub fn personas(&self) -> impl Iterator<Item = &Persona> {
        self.personas.values()
    }

    /// Enumerate the base directory and load every persona found there.
    /// Personas that fail to load are skipped, not fatal.
    pub fn load(&mut self) -> Result<()> {
        let entries = fs::read_dir(&self.base)
            .map_err(|e| StoreError::io(format!("opendir {}", self.base.display()), e))?;
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(hex) = name.to_str() else { continue };
            if !is_hex_hash(hex) {
                continue;
            }
            let mut p = Persona::new(&self.base, hex, None);
            match p.load(None) {
                Ok(()) => {
                    self.personas.insert(hex.to_string(), p);
                }
                Err(e) => debug!(persona = %hex, error = %e, "skipping persona that failed to load"),
            }
        }
        Ok(())
    }

    /// Load one persona by its full hex id.
    pub fn load_persona(&mut self, hex: &str) -> Result<&Persona> {
        if !is_hex_hash(hex) {
            return Err(StoreError::InvalidId(hex.to_string()));
        }
        let mut p = Persona::new(&self.base, hex, None);
        p.load(None)?;
        self.personas.insert(hex.to_string(), p);
        self.personas
            .get(hex)
            .ok_or_else(|| StoreError::NotFound(format!("persona {hex}")))
    }

    /// Resolve a full or 16-character short-form id to the map key.
    fn resolve_id(&self, hex: &str) -> Result<String> {
        if !is_hex_hash(hex) {
            return Err(StoreError::InvalidId(hex.to_string()));
        }
        if hex.len() == SHORT_ID_LEN {
            if let Some(k) = self.personas.keys().find(|k| k.starts_with(hex)) {
                return Ok(k.clone());
            }
        }
        if self.personas.contains_key(hex) {
            Ok(hex.to_string())
        } else {
            Err(StoreError::NotFound(format!("no such persona {hex}")))
        }
    }

    /// Look up a persona by full id, or by the 16-character short form
    /// (first persona whose id starts with it).
    pub fn find_persona(&self, hex: &str) -> Result<&Persona> {
        let key = self.resolve_id(hex)?;
        self.personas
            .get(&key)
            .ok_or_else(|| StoreError::NotFound(format!("no such persona {hex}")))
    }

    pub fn find_persona_mut(&mut self, hex: &str) -> Result<&mut Persona> {
        let key = self.resolve_id(hex)?;
        self.personas
            .get_mut(&key)
            .ok_or_else(|| StoreError::NotFound(format!("no such persona {hex}")))
    }

    /// Generate an ephemeral kex key for a persona, using the keystore's
    /// provider and identity digest.
    pub fn generate_kex(&mut self, hex: &str, peer: Option<&str>) -> Result<&KeyBox> {
        let md = self.md;
        let key = self.resolve_id(hex)?;
        let p = self
            .personas
            .get_mut(&key)
            .ok_or_else(|| StoreError::NotFound(format!("no such persona {hex}")))?;
        p.generate_kex_key(self.provider.as_ref(), md, peer)
    }

    /// Generate fresh DH parameters for an RSA persona.
    pub fn new_dh_params(&mut self, hex: &str) -> Result<()> {
        let key = self.resolve_id(hex)?;
        let p = self
            .personas
            .get_mut(&key)
            .ok_or_else(|| StoreError::NotFound(format!("no such persona {hex}")))?;
        p.new_dh_params(self.provider.as_ref())?;
        Ok(())
    }

    /// Create a new persona from externally supplied PEM material.
    ///
    /// The identity is the digest of the canonical public PEM; the persona
    /// is staged under the base directory and renamed into place, so a
    /// concurrent creation of the same identity resolves to exactly one
    /// winner and one `Conflict`. With `dh_pem` of `"new"` an RSA persona
    /// gets freshly generated DH parameters, any other value is installed
    /// as provided; both are ignored for EC personas.
    pub fn add_persona(
        &mut self,
        name: &str,
        pub_pem: &str,
        priv_pem: Option<&str>,
        dh_pem: Option<&str>,
    ) -> Result<&Persona> {
        let (norm_pub, hex) = pem::normalize_and_hash(self.md, pub_pem)?;

        let pub_key = PKey::public_key_from_pem(norm_pub.as_bytes())
            .map_err(|e| StoreError::Malformed(format!("public key blob: {e}")))?;
        let class = pem::classify(&pub_key);
        let marker = class.marker().ok_or_else(|| {
            StoreError::UnsupportedKeyType("persona keys are RSA or EC".into())
        })?;

        let priv_pem = priv_pem.filter(|s| !s.is_empty());
        let mut priv_parsed = None;
        if let Some(ppem) = priv_pem {
            let key = PKey::private_key_from_pem(ppem.as_bytes())
                .map_err(|e| StoreError::Malformed(format!("private key blob: {e}")))?;
            let pmarker = pem::classify(&key).marker().ok_or_else(|| {
                StoreError::UnsupportedKeyType("persona keys are RSA or EC".into())
            })?;
            if pmarker != marker {
                return Err(StoreError::KeyTypeMismatch {
                    public: marker,
                    private: pmarker,
                });
            }
            priv_parsed = Some(key);
        }

        let mut staging = Staging::new(&self.base)?;
        if !name.is_empty() {
            staging.write("name", format!("{name}\n").as_bytes())?;
        }
        staging.write(&format!("{marker}.pub.pem"), norm_pub.as_bytes())?;
        if let Some(ppem) = priv_pem {
            staging.write(&format!("{marker}.priv.pem"), ppem.as_bytes())?;
        }
        staging.publish(&self.base.join(&hex))?;

        let mut kb = KeyBox::new(hex.clone());
        kb.pub_key = Some(pub_key);
        kb.priv_key = priv_parsed;
        kb.pub_pem = norm_pub;
        kb.priv_pem = priv_pem.map(SecretPem::new).unwrap_or_default();

        let mut persona = Persona::new(
            &self.base,
            hex.as_str(),
            (!name.is_empty()).then(|| name.to_string()),
        );
        persona.install_identity(class, kb);
        self.personas.insert(hex.clone(), persona);

        if let Some(dh) = dh_pem.filter(|s| !s.is_empty()) {
            if let Some(p) = self.personas.get_mut(&hex) {
                if p.is_rsa() {
                    if dh == "new" {
                        p.new_dh_params(self.provider.as_ref())?;
                    } else {
                        p.import_dh_params(dh)?;
                    }
                }
            }
        }

        self.personas
            .get(&hex)
            .ok_or_else(|| StoreError::NotFound(format!("persona {hex}")))
    }

    /// Fresh EC keypair in PEM form, not yet persisted.
    pub fn generate_ec(&self) -> Result<PemKeyPair> {
        self.provider.generate_ec()
    }

    /// Fresh RSA keypair in PEM form, not yet persisted.
    pub fn generate_rsa(&self) -> Result<PemKeyPair> {
        self.provider.generate_rsa()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EcCurve;
    use crate::crypto::pem::normalize_and_hash;
    use tempfile::TempDir;

    fn test_config(base: &Path) -> Config {
        Config {
            rsa_bits: 1024,
            dh_bits: 512,
            curve: EcCurve::Prime256v1,
            ..Config::at(base)
        }
    }

    fn dir_entries(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn test_create_rsa_persona_with_fresh_dh_params() {
        let tmp = TempDir::new().unwrap();
        let cfg = test_config(tmp.path());
        let mut ks = Keystore::open(&cfg);
        let pair = ks.generate_rsa().unwrap();

        let hex = ks
            .add_persona("alice", &pair.public, Some(pair.private.as_str()), Some("new"))
            .unwrap()
            .id()
            .to_string();

        // identity is the digest of the canonical public PEM
        let (_, expected) = normalize_and_hash(cfg.digest, &pair.public).unwrap();
        assert_eq!(hex, expected);

        let dir = tmp.path().join(&hex);
        assert_eq!(
            dir_entries(&dir),
            vec!["dhparams.pem", "name", "rsa.priv.pem", "rsa.pub.pem"]
        );
        assert_eq!(fs::read_to_string(dir.join("name")).unwrap(), "alice\n");

        let p = ks.find_persona(&hex).unwrap();
        assert!(p.is_rsa());
        assert!(p.dh_params().is_some());
        assert!(p.long_term_key().unwrap().has_private());
    }

    #[test]
    fn test_garbage_wrapped_pem_yields_same_identity() {
        let tmp1 = TempDir::new().unwrap();
        let cfg1 = test_config(tmp1.path());
        let mut ks1 = Keystore::open(&cfg1);
        let pair = ks1.generate_ec().unwrap();
        let clean_hex = ks1
            .add_persona("", &pair.public, None, None)
            .unwrap()
            .id()
            .to_string();

        let tmp2 = TempDir::new().unwrap();
        let cfg2 = test_config(tmp2.path());
        let mut ks2 = Keystore::open(&cfg2);
        let dirty = format!("Received: from mail relay\n{}\n-- \nsig", pair.public);
        let dirty_hex = ks2
            .add_persona("", &dirty, None, None)
            .unwrap()
            .id()
            .to_string();

        assert_eq!(clean_hex, dirty_hex);
        // the stored file is the canonical form, not the dirty input
        let stored =
            fs::read_to_string(tmp2.path().join(&dirty_hex).join("ec.pub.pem")).unwrap();
        let (norm, _) = normalize_and_hash(cfg2.digest, &pair.public).unwrap();
        assert_eq!(stored, norm);
    }

    #[test]
    fn test_duplicate_persona_is_a_conflict() {
        let tmp = TempDir::new().unwrap();
        let cfg = test_config(tmp.path());
        let mut ks = Keystore::open(&cfg);
        let pair = ks.generate_ec().unwrap();

        let hex = ks
            .add_persona("first", &pair.public, Some(pair.private.as_str()), None)
            .unwrap()
            .id()
            .to_string();
        let before = dir_entries(&tmp.path().join(&hex));

        let err = ks
            .add_persona("second", &pair.public, None, None)
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));

        // the existing persona directory is untouched
        assert_eq!(dir_entries(&tmp.path().join(&hex)), before);
        assert_eq!(
            fs::read_to_string(tmp.path().join(&hex).join("name")).unwrap(),
            "first\n"
        );
        // and no staging leftovers remain in the base directory
        assert_eq!(fs::read_dir(tmp.path()).unwrap().count(), 1);
    }

    #[test]
    fn test_short_form_lookup() {
        let tmp = TempDir::new().unwrap();
        let cfg = test_config(tmp.path());
        let mut ks = Keystore::open(&cfg);

        let pair_a = ks.generate_ec().unwrap();
        let pair_b = ks.generate_ec().unwrap();
        let hex_a = ks
            .add_persona("a", &pair_a.public, None, None)
            .unwrap()
            .id()
            .to_string();
        let hex_b = ks
            .add_persona("b", &pair_b.public, None, None)
            .unwrap()
            .id()
            .to_string();

        let found = ks.find_persona(&hex_a[..SHORT_ID_LEN]).unwrap();
        assert_eq!(found.id(), hex_a);
        let found = ks.find_persona(&hex_b[..SHORT_ID_LEN]).unwrap();
        assert_eq!(found.id(), hex_b);

        // a short id matching nothing is NotFound, not InvalidId
        assert!(matches!(
            ks.find_persona("ffffffffffffffff"),
            Err(StoreError::NotFound(_))
        ));
        assert!(matches!(
            ks.find_persona("Not-Hex"),
            Err(StoreError::InvalidId(_))
        ));
    }

    #[test]
    fn test_load_enumerates_and_tolerates_junk() {
        let tmp = TempDir::new().unwrap();
        let cfg = test_config(tmp.path());
        {
            let mut ks = Keystore::open(&cfg);
            let pair_a = ks.generate_ec().unwrap();
            let pair_b = ks.generate_ec().unwrap();
            ks.add_persona("a", &pair_a.public, None, None).unwrap();
            ks.add_persona("b", &pair_b.public, Some(pair_b.private.as_str()), None)
                .unwrap();
        }
        // junk the enumerator must skip: a non-hex name and a hex-named
        // directory with no key material
        fs::create_dir(tmp.path().join("not a persona")).unwrap();
        fs::create_dir(tmp.path().join("d".repeat(64))).unwrap();

        let mut ks = Keystore::open(&cfg);
        ks.load().unwrap();
        assert_eq!(ks.personas().count(), 2);
    }

    #[test]
    fn test_load_persona_errors() {
        let tmp = TempDir::new().unwrap();
        let cfg = test_config(tmp.path());
        let mut ks = Keystore::open(&cfg);

        assert!(matches!(
            ks.load_persona("not hex"),
            Err(StoreError::InvalidId(_))
        ));
        assert!(matches!(
            ks.load_persona(&"e".repeat(64)),
            Err(StoreError::NotFound(_))
        ));
        assert_eq!(ks.personas().count(), 0);
    }

    #[test]
    fn test_add_persona_key_type_mismatch() {
        let tmp = TempDir::new().unwrap();
        let cfg = test_config(tmp.path());
        let mut ks = Keystore::open(&cfg);
        let ec_pair = ks.generate_ec().unwrap();
        let rsa_pair = ks.generate_rsa().unwrap();

        let err = ks
            .add_persona("x", &ec_pair.public, Some(rsa_pair.private.as_str()), None)
            .unwrap_err();
        assert!(matches!(
            err,
            StoreError::KeyTypeMismatch {
                public: "ec",
                private: "rsa"
            }
        ));
        // nothing was published
        assert_eq!(fs::read_dir(tmp.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_add_persona_rejects_keyless_blob() {
        let tmp = TempDir::new().unwrap();
        let cfg = test_config(tmp.path());
        let mut ks = Keystore::open(&cfg);
        let err = ks.add_persona("x", "no pem here", None, None).unwrap_err();
        assert!(matches!(err, StoreError::Malformed(_)));
    }

    #[test]
    fn test_dh_pem_is_ignored_for_ec_personas() {
        let tmp = TempDir::new().unwrap();
        let cfg = test_config(tmp.path());
        let mut ks = Keystore::open(&cfg);
        let pair = ks.generate_ec().unwrap();

        let hex = ks
            .add_persona("e", &pair.public, None, Some("new"))
            .unwrap()
            .id()
            .to_string();
        assert!(!tmp.path().join(&hex).join("dhparams.pem").exists());
        assert!(ks.find_persona(&hex).unwrap().dh_params().is_none());
    }

    #[test]
    fn test_reload_sees_created_personas() {
        let tmp = TempDir::new().unwrap();
        let cfg = test_config(tmp.path());
        let hex = {
            let mut ks = Keystore::open(&cfg);
            let pair = ks.generate_ec().unwrap();
            ks.add_persona("carol", &pair.public, Some(pair.private.as_str()), None)
                .unwrap()
                .id()
                .to_string()
        };

        let mut ks = Keystore::open(&cfg);
        let p = ks.load_persona(&hex).unwrap();
        assert_eq!(p.name(), Some("carol"));
        assert!(p.is_ec());
        assert!(p.long_term_key().unwrap().has_private());
    }
}
