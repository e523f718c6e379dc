use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Serialize;
use tokio::process::Command;
use tracing::debug;

use dock_types::AgentKind;

use crate::AgentError;

const VERSION_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentBinary {
    pub name: String,
    pub version: String,
    pub path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub beta: Option<bool>,
}

/// Finds agent binaries: a user-configured path wins, then a short list of
/// well-known install locations, then the process search path.
#[derive(Clone)]
pub struct AgentCatalog {
    configured_paths: HashMap<String, String>,
}

impl AgentCatalog {
    pub fn new(configured_paths: HashMap<String, String>) -> Self {
        Self { configured_paths }
    }

    pub async fn locate(&self, kind: AgentKind) -> Result<AgentBinary, AgentError> {
        if let Some(configured) = self.configured_paths.get(kind.as_str()) {
            let path = PathBuf::from(configured);
            if is_executable(&path) {
                return Ok(self.describe(kind, path).await);
            }
            debug!(agent = kind.as_str(), path = %configured, "configured agent path is not executable");
            return Err(AgentError::NotInstalled(kind));
        }

        for dir in well_known_dirs() {
            let candidate = dir.join(kind.binary_name());
            if is_executable(&candidate) {
                return Ok(self.describe(kind, candidate).await);
            }
        }

        if let Some(found) = search_path(kind.binary_name()) {
            return Ok(self.describe(kind, found).await);
        }

        Err(AgentError::NotInstalled(kind))
    }

    pub async fn list_installed(&self) -> Vec<AgentBinary> {
        let mut out = Vec::new();
        for kind in [AgentKind::ClaudeCode, AgentKind::Codex, AgentKind::Gemini] {
            if let Ok(binary) = self.locate(kind).await {
                out.push(binary);
            }
        }
        out
    }

    async fn describe(&self, kind: AgentKind, path: PathBuf) -> AgentBinary {
        let version = probe_version(&path).await.unwrap_or_else(|| "unknown".to_string());
        AgentBinary {
            name: kind.as_str().to_string(),
            version,
            path: path.to_string_lossy().into_owned(),
            beta: matches!(kind, AgentKind::Gemini).then_some(true),
        }
    }
}

async fn probe_version(path: &Path) -> Option<String> {
    let output = tokio::time::timeout(
        VERSION_PROBE_TIMEOUT,
        Command::new(path)
            .arg("--version")
            .stdin(std::process::Stdio::null())
            .output(),
    )
    .await
    .ok()?
    .ok()?;
    let text = String::from_utf8_lossy(&output.stdout);
    text.lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .map(|l| l.to_string())
}

fn well_known_dirs() -> Vec<PathBuf> {
    let mut dirs = Vec::new();
    if let Some(home) = dirs::home_dir() {
        dirs.push(home.join(".local").join("bin"));
        dirs.push(home.join(".npm-global").join("bin"));
    }
    dirs.push(PathBuf::from("/usr/local/bin"));
    dirs.push(PathBuf::from("/opt/homebrew/bin"));
    dirs
}

fn search_path(binary_name: &str) -> Option<PathBuf> {
    let path_var = std::env::var_os("PATH")?;
    for dir in std::env::split_paths(&path_var) {
        let candidate = dir.join(binary_name);
        if is_executable(&candidate) {
            return Some(candidate);
        }
    }
    None
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.is_file()
        && std::fs::metadata(path)
            .map(|m| m.permissions().mode() & 0o111 != 0)
            .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unknown_agent_reports_not_installed() {
        let catalog = AgentCatalog::new(HashMap::from([(
            "claude-code".to_string(),
            "/definitely/not/here".to_string(),
        )]));
        let err = catalog.locate(AgentKind::ClaudeCode).await.expect_err("missing");
        assert!(matches!(err, AgentError::NotInstalled(AgentKind::ClaudeCode)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn configured_path_wins_and_reports_version() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().expect("tempdir");
        let script = dir.path().join("claude");
        std::fs::write(&script, "#!/bin/sh\necho fake-agent 9.9.9\n").expect("write");
        let mut perms = std::fs::metadata(&script).expect("meta").permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&script, perms).expect("chmod");

        let catalog = AgentCatalog::new(HashMap::from([(
            "claude-code".to_string(),
            script.to_string_lossy().into_owned(),
        )]));
        let binary = catalog.locate(AgentKind::ClaudeCode).await.expect("locate");
        assert_eq!(binary.name, "claude-code");
        assert_eq!(binary.version, "fake-agent 9.9.9");
    }
}
