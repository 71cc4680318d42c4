//! Single-instance advisory lock on a state directory.
//!
//! Only one process may operate on a given store at a time: the core relies
//! on optimistic claiming rather than distributed coordination, so a second
//! process racing the first would corrupt the stale-row recovery invariant.
//! The lock is a plain advisory file lock (`fs2`), released automatically
//! by the kernel when the holding process exits, gracefully or not.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use fs2::FileExt;
use tracing::{debug, info, warn};

use crate::error::LockError;

/// A held lock on a state directory. Dropping it releases the lock and
/// removes the lock file on a best-effort basis.
pub struct Lock {
    _file: File,
    path: PathBuf,
    released: bool,
}

impl std::fmt::Debug for Lock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lock").field("path", &self.path).finish()
    }
}

impl Lock {
    /// Create `state_dir` if missing and acquire an exclusive, non-blocking
    /// lock on `<state_dir>/.lock`, writing our pid into it.
    ///
    /// Never truncates-then-fails: the file is only truncated and rewritten
    /// after the advisory lock is actually held, so a losing contender never
    /// clobbers the winner's pid.
    pub fn acquire(state_dir: &Path) -> Result<Lock, LockError> {
        fs::create_dir_all(state_dir).map_err(LockError::CreateFailed)?;
        let path = state_dir.join(".lock");

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(LockError::CreateFailed)?;

        match FileExt::try_lock_exclusive(&file) {
            Ok(()) => {
                use std::io::{Seek, SeekFrom, Write};
                let mut f = &file;
                f.set_len(0).map_err(LockError::AcquireFailed)?;
                f.seek(SeekFrom::Start(0)).map_err(LockError::AcquireFailed)?;
                write!(f, "{}", std::process::id()).map_err(LockError::AcquireFailed)?;
                f.sync_all().map_err(LockError::AcquireFailed)?;
                info!(path = %path.display(), "acquired store lock");
                Ok(Lock {
                    _file: file,
                    path,
                    released: false,
                })
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                let (pid, alive) = read_holder(&path);
                Err(LockError::Held { path, pid, alive })
            }
            Err(e) => Err(LockError::AcquireFailed(e)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Release early. Idempotent; `Drop` calls this too.
    pub fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        debug!(path = %self.path.display(), "releasing store lock");
        let _ = fs::remove_file(&self.path);
        // the advisory lock itself is released when `_file` closes on drop
    }
}

impl Drop for Lock {
    fn drop(&mut self) {
        self.release();
    }
}

fn read_holder(path: &Path) -> (u32, bool) {
    let pid = fs::read_to_string(path)
        .ok()
        .and_then(|s| s.trim().parse::<u32>().ok())
        .unwrap_or(0);
    if pid == 0 {
        return (0, false);
    }
    (pid, pid_is_alive(pid))
}

#[cfg(unix)]
fn pid_is_alive(pid: u32) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;
    kill(Pid::from_raw(pid as i32), None).is_ok()
}

#[cfg(not(unix))]
fn pid_is_alive(_pid: u32) -> bool {
    warn!("liveness probing is unix-only; reporting unknown");
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn acquire_then_release_then_reacquire() {
        let dir = TempDir::new().unwrap();
        let lock = Lock::acquire(dir.path()).unwrap();
        assert!(lock.path().exists());
        drop(lock);
        let _lock2 = Lock::acquire(dir.path()).unwrap();
    }

    #[test]
    fn contention_is_reported() {
        let dir = TempDir::new().unwrap();
        let _held = Lock::acquire(dir.path()).unwrap();
        let result = Lock::acquire(dir.path());
        assert!(matches!(result, Err(LockError::Held { .. })));
    }

    #[test]
    fn double_release_is_safe() {
        let dir = TempDir::new().unwrap();
        let mut lock = Lock::acquire(dir.path()).unwrap();
        lock.release();
        lock.release();
    }
}
