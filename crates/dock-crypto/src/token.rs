use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::Utc;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::{canonicalize, CryptoError};

type HmacSha256 = Hmac<Sha256>;

pub const TOKEN_TTL_SECS: i64 = 60 * 60;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TokenClaims {
    pub session_id: String,
    pub app_name: String,
    pub app_url: String,
    pub exp: i64,
}

/// Mints and checks session bearer tokens. The secret is 64 random bytes
/// drawn at process start and never persisted, so a daemon restart
/// invalidates every outstanding token.
pub struct TokenSigner {
    secret: [u8; 64],
}

impl TokenSigner {
    pub fn new() -> Self {
        use rand::RngCore;
        let mut secret = [0u8; 64];
        rand::rngs::OsRng.fill_bytes(&mut secret);
        Self { secret }
    }

    pub fn issue(&self, session_id: &str, app_name: &str, app_url: &str) -> String {
        let claims = TokenClaims {
            session_id: session_id.to_string(),
            app_name: app_name.to_string(),
            app_url: app_url.to_string(),
            exp: Utc::now().timestamp() + TOKEN_TTL_SECS,
        };
        self.issue_claims(&claims)
    }

    fn issue_claims(&self, claims: &TokenClaims) -> String {
        let payload = canonicalize(&serde_json::to_value(claims).unwrap_or_default());
        let body = URL_SAFE_NO_PAD.encode(payload.as_bytes());
        let tag = URL_SAFE_NO_PAD.encode(self.mac(body.as_bytes()));
        format!("{body}.{tag}")
    }

    pub fn verify(&self, token: &str) -> Result<TokenClaims, CryptoError> {
        let (body, tag) = token.split_once('.').ok_or(CryptoError::TokenFormat)?;
        let presented = URL_SAFE_NO_PAD
            .decode(tag)
            .map_err(|_| CryptoError::TokenFormat)?;
        let mut mac = HmacSha256::new_from_slice(&self.secret).map_err(|_| CryptoError::TokenSignature)?;
        mac.update(body.as_bytes());
        mac.verify_slice(&presented)
            .map_err(|_| CryptoError::TokenSignature)?;

        let payload = URL_SAFE_NO_PAD
            .decode(body)
            .map_err(|_| CryptoError::TokenFormat)?;
        let claims: TokenClaims =
            serde_json::from_slice(&payload).map_err(|_| CryptoError::TokenFormat)?;
        if claims.exp <= Utc::now().timestamp() {
            return Err(CryptoError::TokenExpired);
        }
        Ok(claims)
    }

    fn mac(&self, data: &[u8]) -> Vec<u8> {
        let mut mac = match HmacSha256::new_from_slice(&self.secret) {
            Ok(mac) => mac,
            Err(_) => return Vec::new(),
        };
        mac.update(data);
        mac.finalize().into_bytes().to_vec()
    }
}

impl Default for TokenSigner {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn issued_token_verifies_with_same_signer() {
        let signer = TokenSigner::new();
        let token = signer.issue("s-1", "X", "https://x.test");
        let claims = signer.verify(&token).expect("valid token");
        assert_eq!(claims.session_id, "s-1");
        assert_eq!(claims.app_name, "X");
        assert!(claims.exp > Utc::now().timestamp());
    }

    #[test]
    fn another_process_secret_rejects_the_token() {
        let minted_by = TokenSigner::new();
        let restarted = TokenSigner::new();
        let token = minted_by.issue("s-1", "X", "https://x.test");
        assert!(matches!(
            restarted.verify(&token),
            Err(CryptoError::TokenSignature)
        ));
    }

    #[test]
    fn expired_claims_are_rejected() {
        let signer = TokenSigner::new();
        let claims = TokenClaims {
            session_id: "s-1".into(),
            app_name: "X".into(),
            app_url: "https://x.test".into(),
            exp: Utc::now().timestamp() - 1,
        };
        let token = signer.issue_claims(&claims);
        assert!(matches!(signer.verify(&token), Err(CryptoError::TokenExpired)));
    }

    #[test]
    fn tampered_body_fails_the_mac() {
        let signer = TokenSigner::new();
        let token = signer.issue("s-1", "X", "https://x.test");
        let (body, tag) = token.split_once('.').expect("two parts");
        let mut payload = URL_SAFE_NO_PAD.decode(body).expect("decode");
        payload[10] ^= 1;
        let forged = format!("{}.{}", URL_SAFE_NO_PAD.encode(payload), tag);
        assert!(signer.verify(&forged).is_err());
    }

    #[test]
    fn garbage_tokens_are_format_errors() {
        let signer = TokenSigner::new();
        assert!(matches!(
            signer.verify("no-dot-here"),
            Err(CryptoError::TokenFormat)
        ));
    }
}
