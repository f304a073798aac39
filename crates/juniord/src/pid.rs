//! PID file and process signalling.

use std::path::{Path, PathBuf};

use tracing::{info, warn};

/// Holds the daemon PID file and removes it on drop.
#[derive(Debug)]
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    /// Write the current process id to `path`.
    pub fn create(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        std::fs::write(&path, std::process::id().to_string())?;
        Ok(Self { path })
    }

    pub fn read(path: impl AsRef<Path>) -> std::io::Result<u32> {
        let content = std::fs::read_to_string(path)?;
        content
            .trim()
            .parse()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    pub fn remove(&self) -> std::io::Result<()> {
        if self.path.exists() {
            std::fs::remove_file(&self.path)?;
        }
        Ok(())
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        let _ = self.remove();
    }
}

/// Return the PID of a live daemon recorded in `path`.
///
/// A file naming a dead (or unparsable) process is stale and is removed.
pub fn check_existing(path: &Path) -> Option<u32> {
    if !path.exists() {
        return None;
    }
    match PidFile::read(path) {
        Ok(pid) if is_process_running(pid) => Some(pid),
        Ok(pid) => {
            info!(pid, path = %path.display(), "removing stale pid file");
            remove_stale(path);
            None
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "unreadable pid file; removing");
            remove_stale(path);
            None
        }
    }
}

fn remove_stale(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        warn!(path = %path.display(), error = %e, "failed to remove stale pid file");
    }
}

/// Whether a process with this id exists.
pub fn is_process_running(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    if pid <= 0 {
        return false;
    }
    // SAFETY: signal 0 performs only the existence and permission check.
    let rc = unsafe { libc::kill(pid, 0) };
    rc == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

/// Send `signal` to `pid`.
pub fn send_signal(pid: u32, signal: libc::c_int) -> std::io::Result<()> {
    let pid = libc::pid_t::try_from(pid)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
    if pid <= 0 {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "refusing to signal a process group",
        ));
    }
    // SAFETY: kill has no memory-safety preconditions; pid is a positive id.
    let rc = unsafe { libc::kill(pid, signal) };
    if rc == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}
