/// On-disk persona store.
///
/// `keystore` owns the base directory and its personas; `persona` owns one
/// identity and its ephemeral kex keys; `fsio` is the shared filesystem
/// discipline (staging-and-rename publication, exclusive writes, shredding).
pub(crate) mod fsio;
pub mod keystore;
pub mod persona;

pub use keystore::Keystore;
pub use persona::{DhParams, KeyBox, Persona, PersonaKind};
