pub mod canonical;
pub mod identity;
pub mod token;

pub use canonical::canonicalize;
pub use identity::{random_token, verify_signature, BridgeIdentity};
pub use token::{TokenClaims, TokenSigner};

use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("failed to generate keypair: {0}")]
    Generate(rsa::Error),
    #[error("failed to sign payload: {0}")]
    Sign(rsa::Error),
    #[error("malformed private key at {path}: {source}")]
    PrivateKeyFormat {
        path: PathBuf,
        source: rsa::pkcs8::Error,
    },
    #[error("private key {0} is world-readable; refusing to start")]
    KeyFileWorldReadable(PathBuf),
    #[error("key storage error: {0}")]
    Io(#[from] std::io::Error),
    #[error("key encoding error: {0}")]
    Encode(#[from] rsa::pkcs8::Error),
    #[error("public key encoding error: {0}")]
    EncodePublic(#[from] rsa::pkcs8::spki::Error),
    #[error("malformed bearer token")]
    TokenFormat,
    #[error("bearer token signature mismatch")]
    TokenSignature,
    #[error("bearer token expired")]
    TokenExpired,
}
