use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::debug;

const PAIRING_TTL_MINUTES: i64 = 5;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PairingCode {
    pub code: String,
    pub app_name: String,
    pub app_url: String,
    pub bridge_public_key: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    #[serde(skip)]
    used: bool,
}

/// What a successful redemption hands to the session layer.
#[derive(Debug, Clone)]
pub struct Redemption {
    pub app_name: String,
    pub app_url: String,
    pub client_public_key: String,
}

/// Short-lived single-use pairing codes. A code admits at most one
/// successful redemption; expired entries are swept on every call.
#[derive(Clone)]
pub struct PairingRegistry {
    codes: Arc<Mutex<HashMap<String, PairingCode>>>,
}

impl PairingRegistry {
    pub fn new() -> Self {
        Self {
            codes: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub async fn issue(
        &self,
        app_name: &str,
        app_url: &str,
        bridge_public_key: &str,
    ) -> PairingCode {
        let mut codes = self.codes.lock().await;
        sweep_expired(&mut codes);

        let now = Utc::now();
        let code = PairingCode {
            code: generate_code(),
            app_name: app_name.to_string(),
            app_url: app_url.to_string(),
            bridge_public_key: bridge_public_key.to_string(),
            created_at: now,
            expires_at: now + Duration::minutes(PAIRING_TTL_MINUTES),
            used: false,
        };
        codes.insert(code.code.clone(), code.clone());
        debug!(app_name, "issued pairing code");
        code
    }

    /// Returns `Some` exactly once per code. Removal happens in the same
    /// locked section, so a concurrent second redemption observes absence.
    /// Callers surface every `None` as the same "invalid or expired" answer.
    pub async fn redeem(&self, code: &str, client_public_key: &str) -> Option<Redemption> {
        if client_public_key.trim().is_empty() {
            return None;
        }
        let mut codes = self.codes.lock().await;
        sweep_expired(&mut codes);

        let entry = codes.get(code)?;
        if entry.used || entry.expires_at <= Utc::now() {
            return None;
        }
        let entry = codes.remove(code)?;
        Some(Redemption {
            app_name: entry.app_name,
            app_url: entry.app_url,
            client_public_key: client_public_key.to_string(),
        })
    }

    pub async fn pending_count(&self) -> usize {
        let mut codes = self.codes.lock().await;
        sweep_expired(&mut codes);
        codes.len()
    }
}

impl Default for PairingRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn sweep_expired(codes: &mut HashMap<String, PairingCode>) {
    let now = Utc::now();
    codes.retain(|_, code| code.expires_at > now && !code.used);
}

/// Three groups of four uppercase hex characters, e.g. `A1B2-C3D4-E5F6`.
fn generate_code() -> String {
    let mut rng = rand::thread_rng();
    format!(
        "{:04X}-{:04X}-{:04X}",
        rng.gen::<u16>(),
        rng.gen::<u16>(),
        rng.gen::<u16>()
    )
}
