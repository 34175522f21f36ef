/// One long-term identity on disk: its keypair, optional DH parameters and
/// the ephemeral kex keys derived for it.
///
/// A persona directory is `<base>/<hex>/` where `hex` is the digest of the
/// canonical long-term public PEM. Kex keys live in per-key subdirectories
/// named by their own derived hex id. Loading is deliberately tolerant:
/// stale or half-deleted kex entries must not take the persona down.
use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

use openssl::dh::Dh;
use openssl::pkey::{PKey, Params, Private, Public};
use tracing::debug;

use crate::config::DigestAlgo;
use crate::crypto::pem::{self, KeyClass};
use crate::crypto::provider::KeyProvider;
use crate::crypto::sensitive::SecretPem;
use crate::error::{Result, StoreError};
use crate::hexid::{self, is_hex_hash};
use crate::store::fsio::{self, Staging};

/// Public/private key material addressed by its derived hex id.
///
/// Deletion mutates capabilities (`has_public`/`has_private`), never the
/// identity: a box whose private half was shredded keeps its hex and its
/// public half.
#[derive(Debug)]
pub struct KeyBox {
    pub(crate) hex: String,
    pub(crate) pub_key: Option<PKey<Public>>,
    pub(crate) priv_key: Option<PKey<Private>>,
    pub(crate) pub_pem: String,
    pub(crate) priv_pem: SecretPem,
    pub(crate) peer_id: Option<String>,
}

impl KeyBox {
    pub(crate) fn new(hex: String) -> Self {
        Self {
            hex,
            pub_key: None,
            priv_key: None,
            pub_pem: String::new(),
            priv_pem: SecretPem::default(),
            peer_id: None,
        }
    }

    pub fn hex(&self) -> &str {
        &self.hex
    }

    pub fn has_public(&self) -> bool {
        self.pub_key.is_some()
    }

    pub fn has_private(&self) -> bool {
        self.priv_key.is_some()
    }

    pub fn public_pem(&self) -> &str {
        &self.pub_pem
    }

    pub fn private_pem(&self) -> &SecretPem {
        &self.priv_pem
    }

    pub fn public_key(&self) -> Option<&PKey<Public>> {
        self.pub_key.as_ref()
    }

    pub fn private_key(&self) -> Option<&PKey<Private>> {
        self.priv_key.as_ref()
    }

    /// Persona this key is bound to, if a designated peer was recorded.
    pub fn peer_id(&self) -> Option<&str> {
        self.peer_id.as_deref()
    }
}

/// DH domain parameters of an RSA persona, kept alongside their PEM form.
pub struct DhParams {
    pub(crate) params: Dh<Params>,
    pub(crate) pem: String,
}

impl std::fmt::Debug for DhParams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DhParams").field("pem", &self.pem).finish()
    }
}

impl DhParams {
    pub fn pem(&self) -> &str {
        &self.pem
    }

    pub fn params(&self) -> &Dh<Params> {
        &self.params
    }
}

/// Key-type state machine of a persona.
///
/// DH parameters only exist in the RSA state; EC personas run ECDH with
/// ephemeral EC keypairs and need none.
#[derive(Debug)]
pub enum PersonaKind {
    Unknown,
    Rsa { dh_params: Option<DhParams> },
    Ec,
}

impl PersonaKind {
    fn marker(&self) -> Option<&'static str> {
        match self {
            PersonaKind::Rsa { .. } => Some("rsa"),
            PersonaKind::Ec => Some("ec"),
            PersonaKind::Unknown => None,
        }
    }
}

#[derive(Debug)]
pub struct Persona {
    base: PathBuf,
    id: String,
    name: Option<String>,
    kind: PersonaKind,
    pkey: Option<KeyBox>,
    keys: BTreeMap<String, KeyBox>,
    link_src: Option<String>,
}

impl Persona {
    /// Pure constructor; nothing touches the disk until `load` or one of
    /// the mutating operations runs.
    pub fn new(base: impl Into<PathBuf>, id: impl Into<String>, name: Option<String>) -> Self {
        Self {
            base: base.into(),
            id: id.into(),
            name,
            kind: PersonaKind::Unknown,
            pkey: None,
            keys: BTreeMap::new(),
            link_src: None,
        }
    }

    fn dir(&self) -> PathBuf {
        self.base.join(&self.id)
    }

    fn kex_dir(&self, hex: &str) -> PathBuf {
        self.dir().join(hex)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn is_rsa(&self) -> bool {
        matches!(self.kind, PersonaKind::Rsa { .. })
    }

    pub fn is_ec(&self) -> bool {
        matches!(self.kind, PersonaKind::Ec)
    }

    /// On-disk type marker, `"rsa"` or `"ec"`, once the type is known.
    pub fn type_marker(&self) -> Option<&'static str> {
        self.kind.marker()
    }

    pub fn long_term_key(&self) -> Option<&KeyBox> {
        self.pkey.as_ref()
    }

    pub fn dh_params(&self) -> Option<&DhParams> {
        match &self.kind {
            PersonaKind::Rsa { dh_params } => dh_params.as_ref(),
            _ => None,
        }
    }

    /// Persona this one was linked to as its default source, if any.
    pub fn linked_source(&self) -> Option<&str> {
        self.link_src.as_deref()
    }

    pub fn kex_keys(&self) -> impl Iterator<Item = &KeyBox> {
        self.keys.values()
    }

    pub fn kex_count(&self) -> usize {
        self.keys.len()
    }

    pub(crate) fn install_identity(&mut self, class: KeyClass, key: KeyBox) {
        self.kind = match class {
            KeyClass::Rsa => PersonaKind::Rsa { dh_params: None },
            KeyClass::Ec => PersonaKind::Ec,
            _ => PersonaKind::Unknown,
        };
        self.pkey = Some(key);
    }

    /// Probe the persona directory for `rsa.pub.pem`, then `ec.pub.pem`,
    /// and set the type accordingly.
    pub fn check_type(&mut self) -> Result<()> {
        if !is_hex_hash(&self.id) {
            return Err(StoreError::InvalidId(self.id.clone()));
        }
        let dir = self.dir();
        if dir.join("rsa.pub.pem").exists() {
            if !self.is_rsa() {
                self.kind = PersonaKind::Rsa { dh_params: None };
            }
        } else if dir.join("ec.pub.pem").exists() {
            self.kind = PersonaKind::Ec;
        } else {
            return Err(StoreError::NotFound(format!(
                "neither RSA nor EC public key for persona {}",
                self.id
            )));
        }
        Ok(())
    }

    /// Reconstruct the persona from disk.
    ///
    /// With `kex_hex` given, only that kex key is loaded (a reserved
    /// sentinel loads none). Otherwise every directory entry that looks
    /// like a kex id is tried; individual kex failures are tolerated so
    /// stale entries cannot take the persona down.
    pub fn load(&mut self, kex_hex: Option<&str>) -> Result<()> {
        if !is_hex_hash(&self.id) {
            return Err(StoreError::InvalidId(self.id.clone()));
        }
        if let Some(k) = kex_hex {
            if !is_hex_hash(k) {
                return Err(StoreError::InvalidId(k.to_string()));
            }
        }
        if matches!(self.kind, PersonaKind::Unknown) {
            self.check_type()?;
        }
        let dir = self.dir();

        if let Some(name) = fsio::first_line(&dir.join("name")) {
            if !name.is_empty() {
                self.name = Some(name);
            }
        }
        if let Some(src) = fsio::first_line(&dir.join("srclink")) {
            if !src.is_empty() {
                self.link_src = Some(src);
            }
        }

        let marker = match self.kind.marker() {
            Some(m) => m,
            None => return Err(StoreError::NotFound(format!("no key type for {}", self.id))),
        };

        let pub_path = dir.join(format!("{marker}.pub.pem"));
        let pub_pem = match fs::read_to_string(&pub_path) {
            Ok(pem) => pem,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound(format!(
                    "public key file for persona {}",
                    self.id
                )))
            }
            Err(e) => return Err(StoreError::io(format!("read {}", pub_path.display()), e)),
        };
        let pub_key = PKey::public_key_from_pem(pub_pem.as_bytes()).map_err(|e| {
            StoreError::Malformed(format!("public key for persona {}: {e}", self.id))
        })?;

        let mut kb = KeyBox::new(self.id.clone());
        kb.pub_key = Some(pub_key);
        kb.pub_pem = pub_pem;

        let priv_path = dir.join(format!("{marker}.priv.pem"));
        match fs::read_to_string(&priv_path) {
            Ok(priv_pem) => {
                let key = PKey::private_key_from_pem(priv_pem.as_bytes()).map_err(|e| {
                    StoreError::Malformed(format!("private key for persona {}: {e}", self.id))
                })?;
                kb.priv_key = Some(key);
                kb.priv_pem = SecretPem::new(priv_pem);
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(StoreError::io(format!("read {}", priv_path.display()), e)),
        }
        self.pkey = Some(kb);

        if let PersonaKind::Rsa { dh_params } = &mut self.kind {
            let params_path = dir.join("dhparams.pem");
            match fs::read_to_string(&params_path) {
                Ok(pem) => {
                    let params = Dh::params_from_pem(pem.as_bytes()).map_err(|e| {
                        StoreError::Malformed(format!("DH params for persona {}: {e}", self.id))
                    })?;
                    *dh_params = Some(DhParams { params, pem });
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(StoreError::io(format!("read {}", params_path.display()), e))
                }
            }
        }

        if let Some(k) = kex_hex {
            if hexid::is_kex_sentinel(k) {
                return Ok(());
            }
            return self.load_kex(k);
        }

        let entries = fs::read_dir(&dir)
            .map_err(|e| StoreError::io(format!("opendir {}", dir.display()), e))?;
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(hex) = name.to_str() else { continue };
            if !is_hex_hash(hex) {
                continue;
            }
            if let Err(e) = self.load_kex(hex) {
                debug!(persona = %self.id, kex = %hex, error = %e, "skipping stale kex entry");
            }
        }
        Ok(())
    }

    /// Load one kex key, tolerating missing halves.
    ///
    /// An empty kex directory is a deletion tombstone (the key was imported
    /// once and later erased): nothing is inserted and the call succeeds. A
    /// present-but-unreadable public half is dropped silently; a malformed
    /// private half is an error.
    pub fn load_kex(&mut self, hex: &str) -> Result<()> {
        if !is_hex_hash(hex) {
            return Err(StoreError::InvalidId(hex.to_string()));
        }
        let kdir = self.kex_dir(hex);

        let mut kb = KeyBox::new(hex.to_string());
        let mut has_pub = false;
        if let Ok(pem) = fs::read_to_string(kdir.join("dh.pub.pem")) {
            if !pem.is_empty() {
                if let Ok(key) = PKey::public_key_from_pem(pem.as_bytes()) {
                    kb.pub_key = Some(key);
                    kb.pub_pem = pem;
                    has_pub = true;
                }
            }
        }
        self.keys.insert(hex.to_string(), kb);

        let mut has_priv = false;
        match fs::read_to_string(kdir.join("dh.priv.pem")) {
            Ok(pem) if pem.is_empty() => {
                return Err(StoreError::Malformed(format!("empty kex private key {hex}")))
            }
            Ok(pem) => {
                let key = PKey::private_key_from_pem(pem.as_bytes()).map_err(|e| {
                    StoreError::Malformed(format!("kex private key {hex}: {e}"))
                })?;
                if let Some(kb) = self.keys.get_mut(hex) {
                    kb.priv_key = Some(key);
                    kb.priv_pem = SecretPem::new(pem);
                }
                has_priv = true;
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(StoreError::io(
                    format!("read {}", kdir.join("dh.priv.pem").display()),
                    e,
                ))
            }
        }

        if !has_pub && !has_priv {
            self.keys.remove(hex);
            return Ok(());
        }

        if let Some(peer) = fsio::first_line(&kdir.join("peer")) {
            if is_hex_hash(&peer) {
                if let Some(kb) = self.keys.get_mut(hex) {
                    kb.peer_id = Some(peer);
                }
            }
        }
        Ok(())
    }

    /// Generate a fresh ephemeral kex key, bound to a designated peer if
    /// one is given.
    ///
    /// EC personas draw an EC keypair and hash its canonical public PEM;
    /// RSA personas need DH parameters and hash the raw public integer.
    /// Re-deriving an id that already exists returns the existing box.
    pub fn generate_kex_key(
        &mut self,
        provider: &dyn KeyProvider,
        md: DigestAlgo,
        peer: Option<&str>,
    ) -> Result<&KeyBox> {
        let (pub_pem, priv_pem, hex) = match &self.kind {
            PersonaKind::Ec => {
                let pair = provider.generate_ec()?;
                let (norm, hex) = pem::normalize_and_hash(md, &pair.public)?;
                (norm, pair.private, hex)
            }
            PersonaKind::Rsa { dh_params } => {
                let params = dh_params.as_ref().ok_or_else(|| {
                    StoreError::PreconditionFailed(format!(
                        "no DH parameters for persona {}",
                        self.id
                    ))
                })?;
                let material = provider.generate_dh_keypair(&params.pem)?;
                let hex = pem::hash_bignum(md, &material.public_bytes)?;
                (material.public, material.private, hex)
            }
            PersonaKind::Unknown => {
                return Err(StoreError::PreconditionFailed(format!(
                    "persona {} has no key type",
                    self.id
                )))
            }
        };

        if !self.keys.contains_key(&hex) {
            let pub_key = PKey::public_key_from_pem(pub_pem.as_bytes())
                .map_err(|e| StoreError::Malformed(format!("generated kex public key: {e}")))?;
            let priv_key = PKey::private_key_from_pem(priv_pem.as_bytes())
                .map_err(|e| StoreError::Malformed(format!("generated kex private key: {e}")))?;

            let peer_id = peer.filter(|p| is_hex_hash(p)).map(str::to_string);

            let mut staging = Staging::new(&self.dir())?;
            staging.write("dh.pub.pem", pub_pem.as_bytes())?;
            staging.write("dh.priv.pem", priv_pem.as_bytes())?;
            if let Some(p) = &peer_id {
                // a kex key without its peer binding is still usable
                staging.write_optional("peer", format!("{p}\n").as_bytes());
            }
            staging.publish_if_absent(&self.kex_dir(&hex))?;

            let mut kb = KeyBox::new(hex.clone());
            kb.pub_key = Some(pub_key);
            kb.priv_key = Some(priv_key);
            kb.pub_pem = pub_pem;
            kb.priv_pem = priv_pem;
            kb.peer_id = peer_id;
            self.keys.insert(hex.clone(), kb);
        }

        self.keys
            .get(&hex)
            .ok_or_else(|| StoreError::NotFound(format!("kex key {hex}")))
    }

    /// Import an ephemeral public key received from this persona.
    ///
    /// DH keys are hashed over the raw public integer, EC keys over the
    /// canonical PEM. Importing the same key twice returns the existing
    /// box and leaves the single on-disk directory alone.
    pub fn add_kex_pubkey(&mut self, md: DigestAlgo, pub_pem: &str) -> Result<&KeyBox> {
        let key = PKey::public_key_from_pem(pub_pem.as_bytes())
            .map_err(|e| StoreError::Malformed(format!("kex public key: {e}")))?;

        let (stored_pem, hex) = match pem::classify(&key) {
            KeyClass::Dh => {
                let dh = key
                    .dh()
                    .map_err(|e| StoreError::Malformed(format!("kex DH public key: {e}")))?;
                let hex = pem::hash_bignum(md, &dh.public_key().to_vec())?;
                (pub_pem.to_string(), hex)
            }
            KeyClass::Ec => pem::normalize_and_hash(md, pub_pem)?,
            KeyClass::Rsa | KeyClass::Other => {
                return Err(StoreError::UnsupportedKeyType(
                    "kex import accepts DH or EC public keys".into(),
                ))
            }
        };

        if !self.keys.contains_key(&hex) {
            let mut staging = Staging::new(&self.dir())?;
            staging.write("dh.pub.pem", stored_pem.as_bytes())?;
            staging.publish_if_absent(&self.kex_dir(&hex))?;

            let mut kb = KeyBox::new(hex.clone());
            kb.pub_key = Some(key);
            kb.pub_pem = stored_pem;
            self.keys.insert(hex.clone(), kb);
        }

        self.keys
            .get(&hex)
            .ok_or_else(|| StoreError::NotFound(format!("kex key {hex}")))
    }

    /// Remove a kex key and its directory. Reserved sentinels are no-ops.
    pub fn delete_kex(&mut self, hex: &str) -> Result<()> {
        if !is_hex_hash(hex) {
            return Err(StoreError::InvalidId(hex.to_string()));
        }
        if hexid::is_kex_sentinel(hex) {
            return Ok(());
        }
        self.keys.remove(hex);
        let dir = self.kex_dir(hex);
        fs::remove_dir(&dir).map_err(|e| StoreError::io(format!("rmdir {}", dir.display()), e))
    }

    /// Shred and unlink the private half of a kex key, along with its
    /// `used` and `peer` files. The public half and the directory stay.
    pub fn delete_kex_private(&mut self, hex: &str) -> Result<()> {
        if !is_hex_hash(hex) {
            return Err(StoreError::InvalidId(hex.to_string()));
        }
        if hexid::is_kex_sentinel(hex) {
            return Ok(());
        }
        let kdir = self.kex_dir(hex);
        let priv_path = kdir.join("dh.priv.pem");
        if fs::symlink_metadata(&priv_path).is_err() {
            return Err(StoreError::NotFound(format!(
                "no private key file for kex {hex}"
            )));
        }
        fsio::shred(&priv_path)?;
        let _ = fs::remove_file(kdir.join("used"));
        let _ = fs::remove_file(kdir.join("peer"));

        if let Some(kb) = self.keys.get_mut(hex) {
            kb.priv_pem.clear();
            kb.priv_key = None;
        }
        Ok(())
    }

    /// Unlink the public half of a kex key. The private half stays so a
    /// pending decryption can still complete.
    pub fn delete_kex_public(&mut self, hex: &str) -> Result<()> {
        if !is_hex_hash(hex) {
            return Err(StoreError::InvalidId(hex.to_string()));
        }
        if hexid::is_kex_sentinel(hex) {
            return Ok(());
        }
        let _ = fs::remove_file(self.kex_dir(hex).join("dh.pub.pem"));
        if let Some(kb) = self.keys.get_mut(hex) {
            kb.pub_pem.clear();
            kb.pub_key = None;
        }
        Ok(())
    }

    /// Set or clear the `used` marker of a kex key. Invalid ids and the
    /// reserved sentinels are silently ignored.
    pub fn mark_used(&self, hex: &str, used: bool) {
        if !is_hex_hash(hex) || hexid::is_kex_sentinel(hex) {
            return;
        }
        let marker = self.kex_dir(hex).join("used");
        if used {
            fsio::touch_excl(&marker);
        } else {
            let _ = fs::remove_file(&marker);
        }
    }

    /// Record `hex` as this persona's default linked source.
    pub fn link_source(&mut self, hex: &str) -> Result<()> {
        if !is_hex_hash(hex) {
            return Err(StoreError::InvalidId(hex.to_string()));
        }
        fsio::write_trunc(&self.dir().join("srclink"), format!("{hex}\n").as_bytes())?;
        self.link_src = Some(hex.to_string());
        Ok(())
    }

    /// Generate fresh DH parameters for an RSA persona, replacing any
    /// previous set.
    pub fn new_dh_params(&mut self, provider: &dyn KeyProvider) -> Result<&DhParams> {
        if !self.is_rsa() {
            return Err(StoreError::PreconditionFailed(format!(
                "persona {} is not RSA",
                self.id
            )));
        }
        let pem = provider.generate_dh_params()?;
        self.install_dh_params(pem)
    }

    /// Install externally supplied DH parameters.
    pub fn import_dh_params(&mut self, pem: &str) -> Result<&DhParams> {
        if !self.is_rsa() {
            return Err(StoreError::PreconditionFailed(format!(
                "persona {} is not RSA",
                self.id
            )));
        }
        self.install_dh_params(pem.to_string())
    }

    fn install_dh_params(&mut self, pem: String) -> Result<&DhParams> {
        let path = self.dir().join("dhparams.pem");
        fsio::write_trunc(&path, pem.as_bytes())?;
        // parse back what actually landed on disk as verification
        let stored = fs::read_to_string(&path)
            .map_err(|e| StoreError::io(format!("read {}", path.display()), e))?;
        let params = Dh::params_from_pem(stored.as_bytes()).map_err(|e| {
            StoreError::Malformed(format!("DH params for persona {}: {e}", self.id))
        })?;
        match &mut self.kind {
            PersonaKind::Rsa { dh_params } => Ok(dh_params.insert(DhParams {
                params,
                pem: stored,
            })),
            _ => Err(StoreError::PreconditionFailed(format!(
                "persona {} is not RSA",
                self.id
            ))),
        }
    }

    /// Look up a kex key. On an EC persona the EC sentinel falls back to
    /// the long-term key, for peers that ran out of ephemerals.
    pub fn find_kex(&self, hex: &str) -> Result<&KeyBox> {
        if hex == hexid::EC_KEX_ID && self.is_ec() {
            return self
                .pkey
                .as_ref()
                .ok_or_else(|| StoreError::NotFound(format!("no long-term key for {}", self.id)));
        }
        self.keys
            .get(hex)
            .ok_or_else(|| StoreError::NotFound(format!("no such kex key {hex}")))
    }
}
