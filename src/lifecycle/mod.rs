use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

/// Exclusive per-host instance lock.
///
/// Two bridge instances would duplicate every reply, so startup takes this
/// lock before anything else. The file holds the owner's PID on its first
/// line; a lock left behind by a dead process is reclaimed.
#[derive(Debug)]
pub struct SingletonLock {
    path: PathBuf,
}

impl SingletonLock {
    /// Acquire the lock or fail fatally.
    ///
    /// A stale file (dead PID) is removed and acquisition retried once; a
    /// live PID is a hard error so the supervisor can act on the exit code.
    pub fn acquire(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create lock directory: {}", parent.display()))?;
        }

        for attempt in 0..2 {
            match fs::OpenOptions::new().write(true).create_new(true).open(path) {
                Ok(file) => {
                    use std::io::Write;
                    let mut file = file;
                    writeln!(file, "{}", std::process::id())
                        .with_context(|| format!("Failed to write PID to {}", path.display()))?;
                    return Ok(Self {
                        path: path.to_path_buf(),
                    });
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    let holder = read_lock_pid(path)?;
                    match holder {
                        Some(pid) if is_pid_alive(pid) => {
                            anyhow::bail!(
                                "Another instance (PID {pid}) holds the lock at {}",
                                path.display()
                            );
                        }
                        _ => {
                            if attempt > 0 {
                                anyhow::bail!(
                                    "Failed to reclaim stale lock at {}",
                                    path.display()
                                );
                            }
                            tracing::warn!(
                                "Reclaiming stale lock at {} (holder is gone)",
                                path.display()
                            );
                            fs::remove_file(path).with_context(|| {
                                format!("Failed to remove stale lock: {}", path.display())
                            })?;
                        }
                    }
                }
                Err(e) => {
                    return Err(e)
                        .with_context(|| format!("Failed to create lock: {}", path.display()))
                }
            }
        }

        anyhow::bail!("Failed to acquire lock at {}", path.display())
    }
}

impl Drop for SingletonLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

/// Parse the PID from the first line of a lock file. A garbled file reads as
/// `None` so it can be reclaimed.
fn read_lock_pid(path: &Path) -> Result<Option<u32>> {
    match fs::read_to_string(path) {
        Ok(content) => Ok(content.lines().next().and_then(|l| l.trim().parse().ok())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e).with_context(|| format!("Failed to read lock: {}", path.display())),
    }
}

/// Check if a process with the given PID exists.
///
/// Uses `kill(pid, 0)`. EPERM means the process exists but we cannot signal
/// it, which still counts as alive.
pub fn is_pid_alive(pid: u32) -> bool {
    let ret = unsafe { libc::kill(pid as libc::pid_t, 0) };
    if ret == 0 {
        return true;
    }
    let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
    errno == libc::EPERM
}
