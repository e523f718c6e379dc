use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::{
    GitVerb, PullRequestInfo, PullRequestOptions, WorkspaceAdapter, WorkspaceError,
    WorkspaceStatus, WorkspaceWatch, WorktreeInfo,
};

/// Git-backed workspace adapter. Every operation shells out to `git` in the
/// target working directory; pull requests go through `gh` when present.
#[derive(Clone)]
pub struct GitWorkspace {
    flags: HashMap<String, Value>,
}

impl GitWorkspace {
    pub fn new(flags: HashMap<String, Value>) -> Self {
        Self { flags }
    }

    fn flag_enabled(&self, name: &str) -> bool {
        self.flags
            .get(name)
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }

    async fn git(&self, workdir: &Path, args: &[&str]) -> Result<String, WorkspaceError> {
        let output = Command::new("git")
            .arg("-C")
            .arg(workdir)
            .args(args)
            .output()
            .await
            .map_err(|error| {
                if error.kind() == std::io::ErrorKind::NotFound {
                    WorkspaceError::ToolMissing("git".to_string())
                } else {
                    WorkspaceError::Io(error)
                }
            })?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(WorkspaceError::Git(stderr));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl WorkspaceAdapter for GitWorkspace {
    async fn status(&self, workdir: &Path) -> Result<WorkspaceStatus, WorkspaceError> {
        let raw = self
            .git(workdir, &["status", "--porcelain=v1", "--branch"])
            .await?;
        Ok(parse_porcelain_status(&raw))
    }

    async fn create_backup_snapshot(
        &self,
        workdir: &Path,
    ) -> Result<Option<String>, WorkspaceError> {
        // `stash create` leaves the working tree untouched.
        let raw = self.git(workdir, &["stash", "create"]).await?;
        let sha = raw.trim();
        if sha.is_empty() {
            return Ok(None);
        }
        debug!(snapshot = sha, "created backup snapshot");
        Ok(Some(sha.to_string()))
    }

    async fn create_worktree(
        &self,
        workdir: &Path,
        base_branch: &str,
        metadata: &HashMap<String, Value>,
    ) -> Result<WorktreeInfo, WorkspaceError> {
        let slug = metadata
            .get("executionId")
            .and_then(|v| v.as_str())
            .unwrap_or("task");
        let branch = format!("prompt-dock/{slug}-{}", Utc::now().timestamp());
        let path = workdir.join(".prompt-dock").join("worktrees").join(&branch.replace('/', "-"));
        let path_str = path.to_string_lossy().into_owned();
        self.git(
            workdir,
            &["worktree", "add", "-b", &branch, &path_str, base_branch],
        )
        .await?;
        let head = self
            .git(&path, &["rev-parse", "HEAD"])
            .await
            .map(|s| s.trim().to_string())
            .unwrap_or_default();
        Ok(WorktreeInfo {
            path: path_str,
            branch,
            head,
        })
    }

    async fn delete_worktree(
        &self,
        workdir: &Path,
        worktree_path: &Path,
        branch_name: &str,
        force: bool,
    ) -> Result<(), WorkspaceError> {
        let path_str = worktree_path.to_string_lossy().into_owned();
        let mut args = vec!["worktree", "remove"];
        if force {
            args.push("--force");
        }
        args.push(&path_str);
        self.git(workdir, &args).await?;
        if !branch_name.is_empty() {
            if let Err(error) = self.git(workdir, &["branch", "-D", branch_name]).await {
                warn!(branch = branch_name, "failed to delete worktree branch: {error}");
            }
        }
        Ok(())
    }

    async fn list_worktrees(&self, workdir: &Path) -> Result<Vec<WorktreeInfo>, WorkspaceError> {
        let raw = self
            .git(workdir, &["worktree", "list", "--porcelain"])
            .await?;
        Ok(parse_worktree_list(&raw))
    }

    async fn commit(
        &self,
        workdir: &Path,
        message: &str,
        files: &[String],
    ) -> Result<Option<String>, WorkspaceError> {
        if files.is_empty() {
            self.git(workdir, &["add", "--all"]).await?;
        } else {
            let mut args = vec!["add", "--"];
            args.extend(files.iter().map(String::as_str));
            self.git(workdir, &args).await?;
        }

        let staged = self.git(workdir, &["diff", "--cached", "--name-only"]).await?;
        if staged.trim().is_empty() {
            return Ok(None);
        }

        let mut commit_args = vec!["commit", "-m", message];
        if self.flag_enabled("signCommits") {
            commit_args.push("-S");
        }
        self.git(workdir, &commit_args).await?;
        let head = self.git(workdir, &["rev-parse", "HEAD"]).await?;
        Ok(Some(head.trim().to_string()))
    }

    async fn diff(&self, file: &str, workdir: &Path) -> Result<String, WorkspaceError> {
        self.git(workdir, &["diff", "HEAD", "--", file]).await
    }

    async fn generate_pull_request(
        &self,
        workdir: &Path,
        options: &PullRequestOptions,
    ) -> Result<PullRequestInfo, WorkspaceError> {
        let branch = self
            .git(workdir, &["branch", "--show-current"])
            .await?
            .trim()
            .to_string();

        let title = options.title.clone().unwrap_or_else(|| branch.clone());
        let body = options.description.clone().unwrap_or_default();
        let mut args: Vec<String> = vec![
            "pr".into(),
            "create".into(),
            "--title".into(),
            title,
            "--body".into(),
            body,
        ];
        if let Some(base) = &options.base_branch {
            args.push("--base".into());
            args.push(base.clone());
        }

        let output = Command::new("gh")
            .current_dir(workdir)
            .args(&args)
            .output()
            .await
            .map_err(|error| {
                if error.kind() == std::io::ErrorKind::NotFound {
                    WorkspaceError::ToolMissing("gh".to_string())
                } else {
                    WorkspaceError::Io(error)
                }
            })?;
        if !output.status.success() {
            return Err(WorkspaceError::Git(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }
        let url = String::from_utf8_lossy(&output.stdout).trim().to_string();
        Ok(PullRequestInfo { url, branch })
    }

    async fn git_command(
        &self,
        workdir: &Path,
        verb: GitVerb,
        args: &[String],
    ) -> Result<String, WorkspaceError> {
        let first = args.first().map(String::as_str);
        match verb {
            GitVerb::CreateBranch => {
                let name = first.ok_or_else(|| {
                    WorkspaceError::Git("create-branch requires a branch name".to_string())
                })?;
                self.git(workdir, &["switch", "-c", name]).await
            }
            GitVerb::SwitchBranch => {
                let name = first.ok_or_else(|| {
                    WorkspaceError::Git("switch-branch requires a branch name".to_string())
                })?;
                self.git(workdir, &["switch", name]).await
            }
            GitVerb::Stash => {
                let mut git_args = vec!["stash", "push"];
                if let Some(message) = first {
                    git_args.push("-m");
                    git_args.push(message);
                }
                self.git(workdir, &git_args).await
            }
        }
    }

    async fn watch(&self, workdir: &Path) -> Result<WorkspaceWatch, WorkspaceError> {
        WorkspaceWatch::start(workdir)
    }
}

fn parse_porcelain_status(raw: &str) -> WorkspaceStatus {
    let mut branch = String::new();
    let mut staged = Vec::new();
    let mut modified = Vec::new();
    let mut untracked = Vec::new();

    for line in raw.lines() {
        if let Some(rest) = line.strip_prefix("## ") {
            branch = rest
                .split("...")
                .next()
                .unwrap_or(rest)
                .trim()
                .to_string();
            continue;
        }
        if line.len() < 3 {
            continue;
        }
        let (code, path) = line.split_at(2);
        let path = path.trim().to_string();
        if code == "??" {
            untracked.push(path);
            continue;
        }
        let mut chars = code.chars();
        let x = chars.next().unwrap_or(' ');
        let y = chars.next().unwrap_or(' ');
        if x != ' ' {
            staged.push(path.clone());
        }
        if y != ' ' {
            modified.push(path);
        }
    }

    let clean = staged.is_empty() && modified.is_empty() && untracked.is_empty();
    WorkspaceStatus {
        branch,
        clean,
        staged,
        modified,
        untracked,
    }
}

fn parse_worktree_list(raw: &str) -> Vec<WorktreeInfo> {
    let mut out = Vec::new();
    let mut path = String::new();
    let mut head = String::new();
    let mut branch = String::new();
    for line in raw.lines().chain(std::iter::once("")) {
        if line.is_empty() {
            if !path.is_empty() {
                out.push(WorktreeInfo {
                    path: std::mem::take(&mut path),
                    branch: std::mem::take(&mut branch),
                    head: std::mem::take(&mut head),
                });
            }
            continue;
        }
        if let Some(rest) = line.strip_prefix("worktree ") {
            path = rest.to_string();
        } else if let Some(rest) = line.strip_prefix("HEAD ") {
            head = rest.to_string();
        } else if let Some(rest) = line.strip_prefix("branch ") {
            branch = rest.trim_start_matches("refs/heads/").to_string();
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn porcelain_status_parses_branch_and_buckets() {
        let raw = "## main...origin/main\nM  staged.rs\n M dirty.rs\nMM both.rs\n?? new.rs\n";
        let status = parse_porcelain_status(raw);
        assert_eq!(status.branch, "main");
        assert!(!status.clean);
        assert_eq!(status.staged, vec!["staged.rs", "both.rs"]);
        assert_eq!(status.modified, vec!["dirty.rs", "both.rs"]);
        assert_eq!(status.untracked, vec!["new.rs"]);
    }

    #[test]
    fn clean_tree_reports_clean() {
        let status = parse_porcelain_status("## main\n");
        assert!(status.clean);
        assert_eq!(status.branch, "main");
    }

    #[test]
    fn worktree_porcelain_parses_entries() {
        let raw = "worktree /repo\nHEAD abc123\nbranch refs/heads/main\n\nworktree /repo/.wt/x\nHEAD def456\nbranch refs/heads/prompt-dock/x\n";
        let list = parse_worktree_list(raw);
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].path, "/repo");
        assert_eq!(list[0].branch, "main");
        assert_eq!(list[1].branch, "prompt-dock/x");
        assert_eq!(list[1].head, "def456");
    }

    async fn git_available() -> bool {
        Command::new("git")
            .arg("--version")
            .output()
            .await
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    async fn init_repo(dir: &Path) {
        for args in [
            vec!["init", "-b", "main"],
            vec!["config", "user.email", "dev@example.test"],
            vec!["config", "user.name", "Dev"],
        ] {
            let status = Command::new("git")
                .arg("-C")
                .arg(dir)
                .args(&args)
                .output()
                .await
                .expect("git");
            assert!(status.status.success(), "git {args:?} failed");
        }
        std::fs::write(dir.join("README.md"), "# repo\n").expect("seed file");
        for args in [vec!["add", "."], vec!["commit", "-m", "init"]] {
            let status = Command::new("git")
                .arg("-C")
                .arg(dir)
                .args(&args)
                .output()
                .await
                .expect("git");
            assert!(status.status.success());
        }
    }

    #[tokio::test]
    async fn status_and_commit_round_trip_in_a_real_repo() {
        if !git_available().await {
            return;
        }
        let dir = tempfile::tempdir().expect("tempdir");
        init_repo(dir.path()).await;
        let workspace = GitWorkspace::new(HashMap::new());

        let status = workspace.status(dir.path()).await.expect("status");
        assert_eq!(status.branch, "main");
        assert!(status.clean);

        std::fs::write(dir.path().join("new.txt"), "data\n").expect("write");
        let status = workspace.status(dir.path()).await.expect("status");
        assert_eq!(status.untracked, vec!["new.txt"]);

        let sha = workspace
            .commit(dir.path(), "add new.txt", &["new.txt".to_string()])
            .await
            .expect("commit");
        assert!(sha.is_some());
        let status = workspace.status(dir.path()).await.expect("status");
        assert!(status.clean);

        // Nothing staged the second time around.
        let nothing = workspace
            .commit(dir.path(), "noop", &[])
            .await
            .expect("commit");
        assert!(nothing.is_none());
    }

    #[tokio::test]
    async fn snapshot_is_none_on_a_clean_tree() {
        if !git_available().await {
            return;
        }
        let dir = tempfile::tempdir().expect("tempdir");
        init_repo(dir.path()).await;
        let workspace = GitWorkspace::new(HashMap::new());
        assert!(workspace
            .create_backup_snapshot(dir.path())
            .await
            .expect("snapshot")
            .is_none());

        std::fs::write(dir.path().join("README.md"), "# changed\n").expect("write");
        assert!(workspace
            .create_backup_snapshot(dir.path())
            .await
            .expect("snapshot")
            .is_some());
    }

    #[tokio::test]
    async fn branch_verbs_create_and_switch() {
        if !git_available().await {
            return;
        }
        let dir = tempfile::tempdir().expect("tempdir");
        init_repo(dir.path()).await;
        let workspace = GitWorkspace::new(HashMap::new());

        workspace
            .git_command(dir.path(), GitVerb::CreateBranch, &["feature-x".to_string()])
            .await
            .expect("create branch");
        let status = workspace.status(dir.path()).await.expect("status");
        assert_eq!(status.branch, "feature-x");

        workspace
            .git_command(dir.path(), GitVerb::SwitchBranch, &["main".to_string()])
            .await
            .expect("switch branch");
        let status = workspace.status(dir.path()).await.expect("status");
        assert_eq!(status.branch, "main");
    }
}
