mod git;
mod watch;

pub use git::GitWorkspace;
pub use watch::WorkspaceWatch;

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use dock_types::ErrorCode;

#[derive(Debug, thiserror::Error)]
pub enum WorkspaceError {
    #[error("working directory does not exist: {0}")]
    MissingWorkdir(PathBuf),
    #[error("working directory is not writable: {0}")]
    ReadOnlyWorkdir(PathBuf),
    #[error("git failed: {0}")]
    Git(String),
    #[error("required tool not found: {0}")]
    ToolMissing(String),
    #[error("watch error: {0}")]
    Watch(#[from] notify::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl WorkspaceError {
    pub fn code(&self) -> ErrorCode {
        ErrorCode::WorkspaceError
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceStatus {
    pub branch: String,
    pub clean: bool,
    pub staged: Vec<String>,
    pub modified: Vec<String>,
    pub untracked: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorktreeInfo {
    pub path: String,
    pub branch: String,
    pub head: String,
}

#[derive(Debug, Clone, Default)]
pub struct PullRequestOptions {
    pub title: Option<String>,
    pub description: Option<String>,
    pub base_branch: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PullRequestInfo {
    pub url: String,
    pub branch: String,
}

/// The enumerated `git-command` verbs a client may invoke directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GitVerb {
    CreateBranch,
    SwitchBranch,
    Stash,
}

impl GitVerb {
    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "create-branch" => Self::CreateBranch,
            "switch-branch" => Self::SwitchBranch,
            "stash" => Self::Stash,
            _ => return None,
        })
    }
}

/// Boundary through which the coordinator observes and mutates the user's
/// source tree. Everything behind it is replaceable.
#[async_trait]
pub trait WorkspaceAdapter: Send + Sync {
    async fn status(&self, workdir: &Path) -> Result<WorkspaceStatus, WorkspaceError>;

    /// Best-effort snapshot before an execution; `None` when there is
    /// nothing to snapshot.
    async fn create_backup_snapshot(&self, workdir: &Path)
        -> Result<Option<String>, WorkspaceError>;

    async fn create_worktree(
        &self,
        workdir: &Path,
        base_branch: &str,
        metadata: &HashMap<String, Value>,
    ) -> Result<WorktreeInfo, WorkspaceError>;

    async fn delete_worktree(
        &self,
        workdir: &Path,
        worktree_path: &Path,
        branch_name: &str,
        force: bool,
    ) -> Result<(), WorkspaceError>;

    async fn list_worktrees(&self, workdir: &Path) -> Result<Vec<WorktreeInfo>, WorkspaceError>;

    async fn commit(
        &self,
        workdir: &Path,
        message: &str,
        files: &[String],
    ) -> Result<Option<String>, WorkspaceError>;

    async fn diff(&self, file: &str, workdir: &Path) -> Result<String, WorkspaceError>;

    async fn generate_pull_request(
        &self,
        workdir: &Path,
        options: &PullRequestOptions,
    ) -> Result<PullRequestInfo, WorkspaceError>;

    async fn git_command(
        &self,
        workdir: &Path,
        verb: GitVerb,
        args: &[String],
    ) -> Result<String, WorkspaceError>;

    async fn watch(&self, workdir: &Path) -> Result<WorkspaceWatch, WorkspaceError>;
}

/// Existence and writability gate applied before any plan request touches a
/// working directory.
pub fn validate_workdir(workdir: &Path) -> Result<(), WorkspaceError> {
    if !workdir.is_dir() {
        return Err(WorkspaceError::MissingWorkdir(workdir.to_path_buf()));
    }
    let metadata = std::fs::metadata(workdir)?;
    if metadata.permissions().readonly() {
        return Err(WorkspaceError::ReadOnlyWorkdir(workdir.to_path_buf()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn git_verbs_parse_only_the_enumerated_set() {
        assert_eq!(GitVerb::parse("create-branch"), Some(GitVerb::CreateBranch));
        assert_eq!(GitVerb::parse("switch-branch"), Some(GitVerb::SwitchBranch));
        assert_eq!(GitVerb::parse("stash"), Some(GitVerb::Stash));
        assert_eq!(GitVerb::parse("push"), None);
        assert_eq!(GitVerb::parse("rebase"), None);
    }

    #[test]
    fn missing_workdir_is_rejected() {
        let err = validate_workdir(Path::new("/definitely/not/here")).expect_err("missing");
        assert!(matches!(err, WorkspaceError::MissingWorkdir(_)));
    }

    #[test]
    fn existing_tempdir_validates() {
        let dir = tempfile::tempdir().expect("tempdir");
        assert!(validate_workdir(dir.path()).is_ok());
    }
}
