use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use serde_json::{json, Value};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::warn;

/// Append-only JSON-lines audit trail at `<state-dir>/audit.log`. All writers
/// serialise on one file handle.
#[derive(Clone)]
pub struct AuditLog {
    file: Arc<Mutex<tokio::fs::File>>,
    path: PathBuf,
}

impl AuditLog {
    pub async fn open(state_dir: &Path) -> std::io::Result<Self> {
        tokio::fs::create_dir_all(state_dir).await?;
        let path = state_dir.join("audit.log");
        let file = open_append_owner_only(&path).await?;
        Ok(Self {
            file: Arc::new(Mutex::new(file)),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn append(&self, action: &str, data: Value) {
        let entry = json!({
            "timestamp": Utc::now().to_rfc3339(),
            "action": action,
            "data": data,
        });
        let mut line = entry.to_string();
        line.push('\n');
        let mut file = self.file.lock().await;
        if let Err(error) = file.write_all(line.as_bytes()).await {
            warn!(%action, "audit append failed: {error}");
        }
    }
}

#[cfg(unix)]
async fn open_append_owner_only(path: &Path) -> std::io::Result<tokio::fs::File> {
    use std::os::unix::fs::OpenOptionsExt;
    let std_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .mode(0o600)
        .open(path)?;
    Ok(tokio::fs::File::from_std(std_file))
}

#[cfg(not(unix))]
async fn open_append_owner_only(path: &Path) -> std::io::Result<tokio::fs::File> {
    tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn entries_are_one_json_object_per_line() {
        let dir = tempfile::tempdir().expect("tempdir");
        let audit = AuditLog::open(dir.path()).await.expect("open");
        audit
            .append("session_created", json!({"sessionId": "s-1"}))
            .await;
        audit
            .append("session_revoked", json!({"sessionId": "s-1"}))
            .await;

        let raw = tokio::fs::read_to_string(audit.path()).await.expect("read");
        let lines: Vec<&str> = raw.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: Value = serde_json::from_str(lines[0]).expect("json line");
        assert_eq!(first["action"], "session_created");
        assert_eq!(first["data"]["sessionId"], "s-1");
        assert!(first["timestamp"].is_string());
    }

    #[tokio::test]
    async fn reopening_appends_rather_than_truncates() {
        let dir = tempfile::tempdir().expect("tempdir");
        {
            let audit = AuditLog::open(dir.path()).await.expect("open");
            audit.append("emergency_kill_switch", json!({})).await;
        }
        let audit = AuditLog::open(dir.path()).await.expect("reopen");
        audit.append("session_created", json!({})).await;
        let raw = tokio::fs::read_to_string(audit.path()).await.expect("read");
        assert_eq!(raw.lines().count(), 2);
    }
}
