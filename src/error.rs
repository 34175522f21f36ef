use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("invalid hex id: {0:?}")]
    InvalidId(String),

    #[error("malformed key material: {0}")]
    Malformed(String),

    #[error("unsupported key type: {0}")]
    UnsupportedKeyType(String),

    #[error("key type mismatch: public key is {public}, private key is {private}")]
    KeyTypeMismatch {
        public: &'static str,
        private: &'static str,
    },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("crypto backend failure: {0}")]
    Crypto(String),
}

impl StoreError {
    /// Wrap an I/O error with the path or operation it came from. The OS
    /// errno stays reachable through the error source chain.
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        StoreError::Io {
            context: context.into(),
            source,
        }
    }
}

impl From<openssl::error::ErrorStack> for StoreError {
    fn from(e: openssl::error::ErrorStack) -> Self {
        StoreError::Crypto(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;
