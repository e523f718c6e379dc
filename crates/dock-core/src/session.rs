use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;
use tracing::{info, warn};

use dock_crypto::{canonicalize, CryptoError, TokenSigner};

use crate::{AuditLog, Redemption, SecurityConfig};

const RATE_WINDOW_SECS: i64 = 60;
const MAX_BACKOFF_SECS: u64 = 60;
const RECENT_HISTORY_LIMIT: usize = 100;
const MAX_REFRESH_THRESHOLD_MS: u64 = 15 * 60 * 1000;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("not authenticated")]
    NotAuthenticated,
    #[error("session expired")]
    Expired,
}

#[derive(Debug, thiserror::Error)]
pub enum AdmitError {
    #[error("rate limit exceeded; retry in {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },
    #[error("replayed command")]
    Replay,
    #[error("unknown session")]
    UnknownSession,
}

#[derive(Debug, Clone)]
struct RateState {
    count: u32,
    window_reset_at: DateTime<Utc>,
    penalty_level: u32,
    backoff_until: Option<DateTime<Utc>>,
}

impl RateState {
    fn fresh(now: DateTime<Utc>) -> Self {
        Self {
            count: 0,
            window_reset_at: now + Duration::seconds(RATE_WINDOW_SECS),
            penalty_level: 0,
            backoff_until: None,
        }
    }
}

#[derive(Debug, Clone)]
struct Session {
    id: String,
    app_name: String,
    app_url: String,
    client_public_key: String,
    created_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    last_activity: DateTime<Utc>,
    token: String,
    token_issued_at: DateTime<Utc>,
    executed_fingerprints: HashSet<String>,
    recent_commands: VecDeque<String>,
    rate: RateState,
    command_count: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub id: String,
    pub app_name: String,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

/// Snapshot returned by `create` and `resolve_by_token`. Carries the latest
/// bearer token; when `rotated` is set the caller MUST relay the new token
/// to the client.
#[derive(Debug, Clone)]
pub struct ResolvedSession {
    pub id: String,
    pub app_name: String,
    pub app_url: String,
    pub client_public_key: String,
    pub token: String,
    pub rotated: bool,
    pub expires_at: DateTime<Utc>,
}

/// The only component that mutates session fields. All mutation happens
/// under the store lock; callers get value snapshots.
#[derive(Clone)]
pub struct SessionStore {
    sessions: Arc<RwLock<HashMap<String, Session>>>,
    signer: Arc<TokenSigner>,
    audit: AuditLog,
    session_timeout_ms: u64,
    max_commands_per_minute: u32,
}

impl SessionStore {
    pub fn new(signer: Arc<TokenSigner>, audit: AuditLog, security: &SecurityConfig) -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            signer,
            audit,
            session_timeout_ms: security.session_timeout,
            max_commands_per_minute: security.max_commands_per_minute,
        }
    }

    pub async fn create(&self, redemption: Redemption) -> ResolvedSession {
        let now = Utc::now();
        let id = uuid::Uuid::new_v4().to_string();
        let token = self
            .signer
            .issue(&id, &redemption.app_name, &redemption.app_url);
        let session = Session {
            id: id.clone(),
            app_name: redemption.app_name.clone(),
            app_url: redemption.app_url.clone(),
            client_public_key: redemption.client_public_key,
            created_at: now,
            expires_at: now + self.timeout(),
            last_activity: now,
            token: token.clone(),
            token_issued_at: now,
            executed_fingerprints: HashSet::new(),
            recent_commands: VecDeque::new(),
            rate: RateState::fresh(now),
            command_count: 0,
        };
        let resolved = ResolvedSession {
            id: id.clone(),
            app_name: session.app_name.clone(),
            app_url: session.app_url.clone(),
            client_public_key: session.client_public_key.clone(),
            token,
            rotated: false,
            expires_at: session.expires_at,
        };
        self.sessions.write().await.insert(id.clone(), session);
        self.audit
            .append(
                "session_created",
                json!({"sessionId": id, "appName": redemption.app_name}),
            )
            .await;
        info!(session_id = %id, "session created");
        resolved
    }

    /// Read-only lookup used for signature-key selection. No sliding, no
    /// rotation; `resolve_by_token` does the mutating admission afterwards.
    pub async fn peek_by_token(&self, presented: &str) -> Result<ResolvedSession, SessionError> {
        let claims = self.signer.verify(presented).map_err(|error| match error {
            CryptoError::TokenExpired => SessionError::Expired,
            _ => SessionError::NotAuthenticated,
        })?;
        let sessions = self.sessions.read().await;
        let session = sessions
            .get(&claims.session_id)
            .ok_or(SessionError::NotAuthenticated)?;
        if session.token != presented {
            return Err(SessionError::NotAuthenticated);
        }
        if session.expires_at <= Utc::now() {
            return Err(SessionError::Expired);
        }
        Ok(ResolvedSession {
            id: session.id.clone(),
            app_name: session.app_name.clone(),
            app_url: session.app_url.clone(),
            client_public_key: session.client_public_key.clone(),
            token: session.token.clone(),
            rotated: false,
            expires_at: session.expires_at,
        })
    }

    /// Validates the presented bearer token, slides the expiry window, and
    /// rotates the token once it is older than the refresh threshold. The
    /// old token stops validating the instant rotation happens.
    pub async fn resolve_by_token(&self, presented: &str) -> Result<ResolvedSession, SessionError> {
        let claims = self.signer.verify(presented).map_err(|error| match error {
            CryptoError::TokenExpired => SessionError::Expired,
            _ => SessionError::NotAuthenticated,
        })?;

        let mut sessions = self.sessions.write().await;
        let now = Utc::now();
        let session = sessions
            .get_mut(&claims.session_id)
            .ok_or(SessionError::NotAuthenticated)?;
        if session.token != presented {
            return Err(SessionError::NotAuthenticated);
        }
        if session.expires_at <= now {
            sessions.remove(&claims.session_id);
            return Err(SessionError::Expired);
        }

        session.last_activity = now;
        session.expires_at = now + self.timeout();

        let mut rotated = false;
        if now - session.token_issued_at >= self.refresh_threshold() {
            session.token = self
                .signer
                .issue(&session.id, &session.app_name, &session.app_url);
            session.token_issued_at = now;
            rotated = true;
        }

        Ok(ResolvedSession {
            id: session.id.clone(),
            app_name: session.app_name.clone(),
            app_url: session.app_url.clone(),
            client_public_key: session.client_public_key.clone(),
            token: session.token.clone(),
            rotated,
            expires_at: session.expires_at,
        })
    }

    /// One atomic admission decision per command: rate limit, then replay,
    /// then admit. The fingerprint covers the command id and the canonical
    /// form of its data.
    pub async fn admit_command(
        &self,
        session_id: &str,
        command_id: &str,
        data: &Value,
    ) -> Result<(), AdmitError> {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(session_id)
            .ok_or(AdmitError::UnknownSession)?;
        let now = Utc::now();

        if let Some(until) = session.rate.backoff_until {
            if now < until {
                let remaining = (until - now).num_seconds().max(1) as u64;
                return Err(AdmitError::RateLimited {
                    retry_after_secs: remaining,
                });
            }
            session.rate.backoff_until = None;
        }

        // A command at exactly the window boundary already counts against
        // the fresh window.
        if now >= session.rate.window_reset_at {
            session.rate.count = 0;
            session.rate.window_reset_at = now + Duration::seconds(RATE_WINDOW_SECS);
            session.rate.penalty_level = session.rate.penalty_level.saturating_sub(1);
        }

        session.rate.count += 1;
        if session.rate.count > self.max_commands_per_minute {
            session.rate.penalty_level += 1;
            let backoff_secs =
                MAX_BACKOFF_SECS.min(1u64 << session.rate.penalty_level.min(6));
            session.rate.backoff_until = Some(now + Duration::seconds(backoff_secs as i64));
            session.rate.count = 0;
            session.rate.window_reset_at = now + Duration::seconds(RATE_WINDOW_SECS);
            warn!(session_id, backoff_secs, "rate limit exceeded");
            return Err(AdmitError::RateLimited {
                retry_after_secs: backoff_secs,
            });
        }

        let fingerprint = command_fingerprint(command_id, data);
        if session.executed_fingerprints.contains(&fingerprint) {
            self.audit
                .append(
                    "replay_attack_detected",
                    json!({"sessionId": session_id, "commandId": command_id}),
                )
                .await;
            return Err(AdmitError::Replay);
        }

        session.executed_fingerprints.insert(fingerprint);
        session.command_count += 1;
        session.recent_commands.push_back(command_id.to_string());
        while session.recent_commands.len() > RECENT_HISTORY_LIMIT {
            session.recent_commands.pop_front();
        }
        Ok(())
    }

    pub async fn client_public_key(&self, session_id: &str) -> Option<String> {
        self.sessions
            .read()
            .await
            .get(session_id)
            .map(|s| s.client_public_key.clone())
    }

    pub async fn revoke(&self, session_id: &str) -> bool {
        let removed = self.sessions.write().await.remove(session_id).is_some();
        if removed {
            self.audit
                .append("session_revoked", json!({"sessionId": session_id}))
                .await;
        }
        removed
    }

    /// Drains every session at once. Returns the terminated ids.
    pub async fn emergency_kill(&self, reason: &str) -> Vec<String> {
        let drained: Vec<String> = {
            let mut sessions = self.sessions.write().await;
            let ids = sessions.keys().cloned().collect();
            sessions.clear();
            ids
        };
        self.audit
            .append(
                "emergency_kill_switch",
                json!({"terminatedSessions": drained, "reason": reason}),
            )
            .await;
        drained
    }

    pub async fn sweep(&self) -> Vec<String> {
        let now = Utc::now();
        let mut sessions = self.sessions.write().await;
        let expired: Vec<String> = sessions
            .iter()
            .filter(|(_, s)| s.expires_at <= now)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &expired {
            sessions.remove(id);
        }
        expired
    }

    pub async fn list(&self) -> Vec<SessionInfo> {
        let sessions = self.sessions.read().await;
        let mut infos: Vec<SessionInfo> = sessions
            .values()
            .map(|s| SessionInfo {
                id: s.id.clone(),
                app_name: s.app_name.clone(),
                created_at: s.created_at,
                last_activity: s.last_activity,
            })
            .collect();
        infos.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        infos
    }

    pub async fn count(&self) -> usize {
        self.sessions.read().await.len()
    }

    fn timeout(&self) -> Duration {
        Duration::milliseconds(self.session_timeout_ms as i64)
    }

    fn refresh_threshold(&self) -> Duration {
        let half = self.session_timeout_ms / 2;
        Duration::milliseconds(half.min(MAX_REFRESH_THRESHOLD_MS) as i64)
    }

    /// Test support: ages the current token so the next resolve rotates it.
    #[doc(hidden)]
    pub async fn backdate_token(&self, session_id: &str, by: Duration) {
        let mut sessions = self.sessions.write().await;
        if let Some(session) = sessions.get_mut(session_id) {
            session.token_issued_at -= by;
        }
    }

    #[cfg(test)]
    async fn backdate_window(&self, session_id: &str, by: Duration) {
        let mut sessions = self.sessions.write().await;
        if let Some(session) = sessions.get_mut(session_id) {
            session.rate.window_reset_at -= by;
            if let Some(until) = session.rate.backoff_until.as_mut() {
                *until -= by;
            }
        }
    }
}

fn command_fingerprint(command_id: &str, data: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(command_id.as_bytes());
    hasher.update(canonicalize(data).as_bytes());
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}
