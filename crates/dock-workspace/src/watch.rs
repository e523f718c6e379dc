use std::path::{Path, PathBuf};

use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::debug;

use crate::WorkspaceError;

/// Live filesystem watch over a workspace. Paths under `.git` are filtered
/// out; dropping the handle stops the watcher.
pub struct WorkspaceWatch {
    rx: mpsc::UnboundedReceiver<PathBuf>,
    _watcher: RecommendedWatcher,
}

impl WorkspaceWatch {
    pub fn start(workdir: &Path) -> Result<Self, WorkspaceError> {
        let (raw_tx, raw_rx) = std::sync::mpsc::channel::<Result<Event, notify::Error>>();
        let mut watcher = RecommendedWatcher::new(raw_tx, notify::Config::default())?;
        watcher.watch(workdir, RecursiveMode::Recursive)?;

        let (tx, rx) = mpsc::unbounded_channel();
        let root = workdir.to_path_buf();
        std::thread::spawn(move || {
            for result in raw_rx {
                let event = match result {
                    Ok(event) => event,
                    Err(error) => {
                        debug!("workspace watch error: {error}");
                        continue;
                    }
                };
                for path in event.paths {
                    if path
                        .strip_prefix(&root)
                        .map(|rel| rel.components().any(|c| c.as_os_str() == ".git"))
                        .unwrap_or(false)
                    {
                        continue;
                    }
                    if tx.send(path).is_err() {
                        return;
                    }
                }
            }
        });

        Ok(Self {
            rx,
            _watcher: watcher,
        })
    }

    pub async fn recv(&mut self) -> Option<PathBuf> {
        self.rx.recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn reports_file_changes_and_skips_git_internals() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::create_dir_all(dir.path().join(".git")).expect("git dir");
        let mut watch = WorkspaceWatch::start(dir.path()).expect("watch");

        // Give the backend a beat to arm before mutating.
        tokio::time::sleep(Duration::from_millis(200)).await;
        std::fs::write(dir.path().join(".git").join("index.lock"), b"x").expect("git write");
        std::fs::write(dir.path().join("tracked.txt"), b"hello").expect("write");

        let mut saw_tracked = false;
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while tokio::time::Instant::now() < deadline {
            match tokio::time::timeout(Duration::from_millis(500), watch.recv()).await {
                Ok(Some(path)) => {
                    assert!(!path.components().any(|c| c.as_os_str() == ".git"));
                    if path.ends_with("tracked.txt") {
                        saw_tracked = true;
                        break;
                    }
                }
                Ok(None) => break,
                Err(_) => continue,
            }
        }
        assert!(saw_tracked);
    }
}
