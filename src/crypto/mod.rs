/// Cryptographic building blocks behind the keystore.
///
/// `provider` is the only module that generates key material; `pem` owns the
/// canonical form public keys are hashed in; `sensitive` wraps private PEM
/// text so it is zeroized before release.
pub mod pem;
pub mod provider;
pub mod sensitive;
