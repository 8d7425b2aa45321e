//! Run leases.
//!
//! A lease is held in an in-process set and, when the registry has a lock
//! directory, as an advisory lock on `<run_id>.lock` next to the checkpoint.
//! The in-process set answers quickly for runs owned by this process; the
//! file lock refuses controllers in other processes sharing the directory.
//! The OS drops the file lock when its holder dies, so a crashed controller
//! never leaves a run locked.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashSet;

use cf_core::{Error, Result, RunId};

use crate::checkpoint::CheckpointStore;

/// Registry of runs currently owned by a live controller.
#[derive(Clone, Default)]
pub struct RunLeases {
    held: Arc<DashSet<RunId>>,
    lock_dir: Option<PathBuf>,
}

impl RunLeases {
    /// Leases that only exclude other controllers in this process.
    pub fn new() -> Self {
        Self::default()
    }

    /// Leases that also lock `<run_id>.lock` files in `dir`.
    pub fn in_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            held: Arc::default(),
            lock_dir: Some(dir.into()),
        }
    }

    /// Leases locked next to the checkpoints of `checkpoints`.
    pub fn for_checkpoints(checkpoints: &CheckpointStore) -> Self {
        Self::in_dir(checkpoints.dir())
    }

    pub fn lock_dir(&self) -> Option<&Path> {
        self.lock_dir.as_deref()
    }

    /// Claim `run_id` for the lifetime of the returned guard.
    ///
    /// # Errors
    ///
    /// - [`Error::RunLocked`] if another lease for the run is alive, in this
    ///   process or in another one sharing the lock directory.
    /// - [`Error::Io`] if the lock file cannot be created.
    pub fn acquire(&self, run_id: RunId) -> Result<RunLease> {
        if !self.held.insert(run_id) {
            return Err(locked(run_id));
        }

        let file = match &self.lock_dir {
            Some(dir) => match LockFile::acquire(dir, run_id) {
                Ok(file) => Some(file),
                Err(e) => {
                    self.held.remove(&run_id);
                    return Err(e);
                }
            },
            None => None,
        };

        tracing::debug!(%run_id, cross_process = file.is_some(), "Run lease acquired");
        Ok(RunLease {
            run_id,
            held: self.held.clone(),
            file,
        })
    }

    /// Whether this process holds a lease on `run_id`.
    pub fn is_held(&self, run_id: RunId) -> bool {
        self.held.contains(&run_id)
    }
}

/// Exclusive claim on a run; released on drop.
pub struct RunLease {
    run_id: RunId,
    held: Arc<DashSet<RunId>>,
    file: Option<LockFile>,
}

impl RunLease {
    pub fn run_id(&self) -> RunId {
        self.run_id
    }
}

impl Drop for RunLease {
    fn drop(&mut self) {
        // File first, so an in-process waiter never trips over our own lock.
        self.file.take();
        self.held.remove(&self.run_id);
        tracing::debug!(run_id = %self.run_id, "Run lease released");
    }
}

impl std::fmt::Debug for RunLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunLease")
            .field("run_id", &self.run_id)
            .field("lock_file", &self.file.as_ref().map(|f| &f.path))
            .finish()
    }
}

fn locked(run_id: RunId) -> Error {
    Error::RunLocked {
        run_id: run_id.to_string(),
    }
}

/// Path of the lock file for `run_id` inside `dir`.
pub fn lock_path(dir: &Path, run_id: RunId) -> PathBuf {
    dir.join(format!("{run_id}.lock"))
}

/// Held lock on `<run_id>.lock`. The file is unlinked on drop while the lock
/// is still held, then the lock goes with the descriptor.
struct LockFile {
    path: PathBuf,
    #[cfg(unix)]
    _lock: nix::fcntl::Flock<File>,
    #[cfg(not(unix))]
    _file: File,
}

/// Attempts before giving up on a lock file that keeps being replaced.
#[cfg(unix)]
const LOCK_ATTEMPTS: usize = 3;

impl LockFile {
    #[cfg(unix)]
    fn acquire(dir: &Path, run_id: RunId) -> Result<Self> {
        use nix::errno::Errno;
        use nix::fcntl::{Flock, FlockArg};
        use std::os::unix::fs::MetadataExt;

        fs::create_dir_all(dir)?;
        let path = lock_path(dir, run_id);

        for _ in 0..LOCK_ATTEMPTS {
            let file = OpenOptions::new()
                .create(true)
                .truncate(false)
                .write(true)
                .open(&path)?;
            let mut lock = match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
                Ok(lock) => lock,
                Err((_, errno)) if errno == Errno::EWOULDBLOCK => return Err(locked(run_id)),
                Err((_, errno)) => return Err(io::Error::from(errno).into()),
            };

            // A releasing holder may have unlinked the file between our open
            // and our lock; only a lock on the file still at `path` counts.
            let ours = lock.metadata()?;
            match fs::metadata(&path) {
                Ok(current) if current.dev() == ours.dev() && current.ino() == ours.ino() => {
                    lock.set_len(0)?;
                    writeln!(lock, "{}", std::process::id())?;
                    return Ok(Self { path, _lock: lock });
                }
                Ok(_) => continue,
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Err(locked(run_id))
    }

    #[cfg(not(unix))]
    fn acquire(dir: &Path, run_id: RunId) -> Result<Self> {
        fs::create_dir_all(dir)?;
        let path = lock_path(dir, run_id);
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(mut file) => {
                writeln!(file, "{}", std::process::id())?;
                Ok(Self { path, _file: file })
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Err(locked(run_id)),
            Err(e) => Err(e.into()),
        }
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            if e.kind() != io::ErrorKind::NotFound {
                tracing::warn!(path = %self.path.display(), "Failed to remove lock file: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn lease_is_exclusive_until_dropped() {
        let leases = RunLeases::new();
        let run_id = RunId::new();
        let lease = leases.acquire(run_id).unwrap();
        assert!(leases.is_held(run_id));
        assert_matches!(leases.acquire(run_id), Err(Error::RunLocked { .. }));
        drop(lease);
        assert!(!leases.is_held(run_id));
        leases.acquire(run_id).unwrap();
    }

    #[test]
    fn lock_file_excludes_a_second_registry() {
        let dir = tempfile::tempdir().unwrap();
        let here = RunLeases::in_dir(dir.path());
        let elsewhere = RunLeases::in_dir(dir.path());
        let run_id = RunId::new();

        let lease = here.acquire(run_id).unwrap();
        let path = lock_path(dir.path(), run_id);
        let pid = fs::read_to_string(&path).unwrap();
        assert_eq!(pid.trim(), std::process::id().to_string());

        assert_matches!(elsewhere.acquire(run_id), Err(Error::RunLocked { .. }));
        // The refused claim leaves no in-process entry behind.
        assert!(!elsewhere.is_held(run_id));

        drop(lease);
        assert!(!path.exists());
        let lease = elsewhere.acquire(run_id).unwrap();
        assert_matches!(here.acquire(run_id), Err(Error::RunLocked { .. }));
        drop(lease);
    }

    #[cfg(unix)]
    #[test]
    fn leftover_lock_file_without_a_holder_is_reclaimed() {
        let dir = tempfile::tempdir().unwrap();
        let run_id = RunId::new();
        // A controller that crashed leaves its file but not its lock.
        fs::write(lock_path(dir.path(), run_id), "4194304\n").unwrap();

        let leases = RunLeases::in_dir(dir.path());
        let _lease = leases.acquire(run_id).unwrap();
    }

    #[test]
    fn lock_dir_is_created_on_demand() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("state/checkpoints");
        let leases = RunLeases::in_dir(&nested);
        assert_eq!(leases.lock_dir(), Some(nested.as_path()));
        let _lease = leases.acquire(RunId::new()).unwrap();
        assert!(nested.is_dir());
    }
}
