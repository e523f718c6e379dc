use std::fs;
use std::path::{Path, PathBuf};

use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine as _;
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::{Pkcs1v15Sign, RsaPrivateKey, RsaPublicKey};
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::CryptoError;

const KEY_BITS: usize = 2048;

/// The daemon's long-lived RSA keypair. Generated on first start, loaded on
/// every later start, never rotated automatically.
#[derive(Debug)]
pub struct BridgeIdentity {
    private: RsaPrivateKey,
    public_pem: String,
}

impl BridgeIdentity {
    pub fn load_or_generate(state_dir: &Path) -> Result<Self, CryptoError> {
        let keys_dir = state_dir.join("keys");
        let private_path = keys_dir.join("private.pem");
        let public_path = keys_dir.join("public.pem");

        if private_path.exists() {
            check_owner_only(&private_path)?;
            let pem = fs::read_to_string(&private_path)?;
            let private = RsaPrivateKey::from_pkcs8_pem(&pem).map_err(|source| {
                CryptoError::PrivateKeyFormat {
                    path: private_path.clone(),
                    source,
                }
            })?;
            let public_pem = RsaPublicKey::from(&private).to_public_key_pem(LineEnding::LF)?;
            info!(path = %private_path.display(), "loaded bridge identity");
            return Ok(Self {
                private,
                public_pem,
            });
        }

        fs::create_dir_all(&keys_dir)?;
        let mut rng = rand::thread_rng();
        let private = RsaPrivateKey::new(&mut rng, KEY_BITS).map_err(CryptoError::Generate)?;
        let public = RsaPublicKey::from(&private);

        let private_pem = private.to_pkcs8_pem(LineEnding::LF)?;
        let public_pem = public.to_public_key_pem(LineEnding::LF)?;
        write_owner_only(&private_path, private_pem.as_bytes())?;
        write_owner_only(&public_path, public_pem.as_bytes())?;
        info!(path = %keys_dir.display(), "generated new bridge identity");

        Ok(Self {
            private,
            public_pem,
        })
    }

    pub fn public_key_pem(&self) -> &str {
        &self.public_pem
    }

    /// RSA-PKCS#1 v1.5 over SHA-256, base64 standard encoding.
    pub fn sign(&self, payload: &[u8]) -> Result<String, CryptoError> {
        let digest = Sha256::digest(payload);
        let signature = self
            .private
            .sign(Pkcs1v15Sign::new::<Sha256>(), &digest)
            .map_err(CryptoError::Sign)?;
        Ok(STANDARD.encode(signature))
    }
}

/// Signature check against a client's PEM public key. The signature bytes are
/// never logged; a malformed key or signature simply fails the check.
pub fn verify_signature(payload: &[u8], signature_b64: &str, public_key_pem: &str) -> bool {
    let Ok(public) = RsaPublicKey::from_public_key_pem(public_key_pem) else {
        return false;
    };
    let Ok(signature) = STANDARD.decode(signature_b64) else {
        return false;
    };
    let digest = Sha256::digest(payload);
    public
        .verify(Pkcs1v15Sign::new::<Sha256>(), &digest, &signature)
        .is_ok()
}

/// `n` cryptographic-quality random bytes, base64url without padding.
pub fn random_token(n: usize) -> String {
    use rand::RngCore;
    let mut bytes = vec![0u8; n];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

#[cfg(unix)]
fn check_owner_only(path: &Path) -> Result<(), CryptoError> {
    use std::os::unix::fs::PermissionsExt;
    let mode = fs::metadata(path)?.permissions().mode();
    if mode & 0o004 != 0 {
        return Err(CryptoError::KeyFileWorldReadable(PathBuf::from(path)));
    }
    if mode & 0o040 != 0 {
        warn!(path = %path.display(), "private key is group-readable");
    }
    Ok(())
}

#[cfg(not(unix))]
fn check_owner_only(_path: &Path) -> Result<(), CryptoError> {
    Ok(())
}

#[cfg(unix)]
fn write_owner_only(path: &Path, contents: &[u8]) -> Result<(), CryptoError> {
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;
    let mut file = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    file.write_all(contents)?;
    Ok(())
}

#[cfg(not(unix))]
fn write_owner_only(path: &Path, contents: &[u8]) -> Result<(), CryptoError> {
    fs::write(path, contents)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_then_verify_round_trips() {
        let dir = tempfile::tempdir().expect("tempdir");
        let identity = BridgeIdentity::load_or_generate(dir.path()).expect("identity");
        let payload = b"{\"type\":\"git-status\"}";
        let signature = identity.sign(payload).expect("sign");
        assert!(verify_signature(payload, &signature, identity.public_key_pem()));
    }

    #[test]
    fn verify_rejects_tampered_payload() {
        let dir = tempfile::tempdir().expect("tempdir");
        let identity = BridgeIdentity::load_or_generate(dir.path()).expect("identity");
        let signature = identity.sign(b"payload-a").expect("sign");
        assert!(!verify_signature(
            b"payload-b",
            &signature,
            identity.public_key_pem()
        ));
    }

    #[test]
    fn verify_rejects_garbage_key_and_signature() {
        assert!(!verify_signature(b"x", "!!!", "not a pem"));
    }

    #[test]
    fn identity_is_stable_across_restarts() {
        let dir = tempfile::tempdir().expect("tempdir");
        let first = BridgeIdentity::load_or_generate(dir.path()).expect("first");
        let second = BridgeIdentity::load_or_generate(dir.path()).expect("second");
        assert_eq!(first.public_key_pem(), second.public_key_pem());
    }

    #[cfg(unix)]
    #[test]
    fn world_readable_private_key_is_fatal() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().expect("tempdir");
        let _ = BridgeIdentity::load_or_generate(dir.path()).expect("identity");
        let key_path = dir.path().join("keys").join("private.pem");
        let mut perms = fs::metadata(&key_path).expect("meta").permissions();
        perms.set_mode(0o644);
        fs::set_permissions(&key_path, perms).expect("chmod");
        let err = BridgeIdentity::load_or_generate(dir.path()).expect_err("must refuse");
        assert!(matches!(err, CryptoError::KeyFileWorldReadable(_)));
    }

    #[cfg(unix)]
    #[test]
    fn generated_key_files_are_owner_only() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().expect("tempdir");
        let _ = BridgeIdentity::load_or_generate(dir.path()).expect("identity");
        let mode = fs::metadata(dir.path().join("keys").join("private.pem"))
            .expect("meta")
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn random_tokens_are_url_safe_and_unique() {
        let a = random_token(32);
        let b = random_token(32);
        assert_ne!(a, b);
        assert!(!a.contains('='));
        assert!(!a.contains('+'));
        assert!(!a.contains('/'));
    }
}
