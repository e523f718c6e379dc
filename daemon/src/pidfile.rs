use std::path::{Path, PathBuf};

fn pid_path(state_dir: &Path) -> PathBuf {
    state_dir.join("prompt-dock.pid")
}

pub fn write(state_dir: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(state_dir)?;
    std::fs::write(pid_path(state_dir), std::process::id().to_string())
}

pub fn remove(state_dir: &Path) {
    let _ = std::fs::remove_file(pid_path(state_dir));
}

pub fn read(state_dir: &Path) -> Option<u32> {
    std::fs::read_to_string(pid_path(state_dir))
        .ok()?
        .trim()
        .parse()
        .ok()
}

/// Politely terminates the daemon named by the pid file. Returns whether a
/// running daemon was found.
#[cfg(unix)]
pub fn stop(state_dir: &Path) -> anyhow::Result<bool> {
    let Some(pid) = read(state_dir) else {
        return Ok(false);
    };
    // SAFETY: signalling a pid read from our own pid file.
    let alive = unsafe { libc::kill(pid as libc::pid_t, 0) } == 0;
    if !alive {
        remove(state_dir);
        return Ok(false);
    }
    unsafe {
        libc::kill(pid as libc::pid_t, libc::SIGTERM);
    }
    remove(state_dir);
    Ok(true)
}

#[cfg(not(unix))]
pub fn stop(state_dir: &Path) -> anyhow::Result<bool> {
    // Without signals we can only report what the pid file says.
    let was_running = read(state_dir).is_some();
    remove(state_dir);
    Ok(was_running)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_read_remove_round_trip() {
        let dir = tempfile::tempdir().expect("tempdir");
        write(dir.path()).expect("write");
        assert_eq!(read(dir.path()), Some(std::process::id()));
        remove(dir.path());
        assert_eq!(read(dir.path()), None);
    }
}
