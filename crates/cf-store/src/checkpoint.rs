//! Durable checkpoints, one JSON file per run.
//!
//! Writes go to `<run_id>.json.tmp`, are flushed to disk, and then renamed
//! over `<run_id>.json`. A reader therefore sees either the previous complete
//! snapshot or the new one, never a torn file.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use cf_core::{BatchState, Error, Result, RunId};

/// Sink for batch snapshots.
///
/// The run loop only needs to write; loading and listing live on
/// [`CheckpointStore`].
pub trait Checkpointer: Send + Sync {
    /// Persist `state` durably. On error the previous checkpoint must still
    /// be intact.
    fn write(&self, state: &BatchState) -> Result<()>;
}

/// Filesystem-backed checkpoint directory.
pub struct CheckpointStore {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

impl CheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, run_id: RunId) -> PathBuf {
        self.dir.join(format!("{run_id}.json"))
    }

    pub fn exists(&self, run_id: RunId) -> bool {
        self.path_for(run_id).is_file()
    }

    /// Load the checkpoint for `run_id`.
    ///
    /// Returns `Ok(None)` if no checkpoint exists. A file that cannot be
    /// parsed or fails validation is [`Error::CorruptCheckpoint`].
    pub fn load(&self, run_id: RunId) -> Result<Option<BatchState>> {
        let path = self.path_for(run_id);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let state: BatchState = serde_json::from_slice(&bytes).map_err(|e| {
            Error::CorruptCheckpoint(format!("{}: {e}", path.display()))
        })?;
        if state.run_id != run_id {
            return Err(Error::CorruptCheckpoint(format!(
                "{} holds run {} instead of {run_id}",
                path.display(),
                state.run_id
            )));
        }
        state.validate()?;
        Ok(Some(state))
    }

    /// Remove the checkpoint for `run_id`. Returns whether a file existed.
    pub fn delete(&self, run_id: RunId) -> Result<bool> {
        match fs::remove_file(self.path_for(run_id)) {
            Ok(()) => {
                tracing::info!(%run_id, "Deleted checkpoint");
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Run ids of every checkpoint in the directory, sorted.
    ///
    /// Files whose stem is not a run id (including leftover `.tmp` files) are
    /// skipped.
    pub fn list(&self) -> Result<Vec<RunId>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut ids = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(id) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| s.parse::<RunId>().ok())
            {
                ids.push(id);
            }
        }
        ids.sort_by_key(|id| id.to_string());
        Ok(ids)
    }
}

impl Checkpointer for CheckpointStore {
    fn write(&self, state: &BatchState) -> Result<()> {
        let run_id = state.run_id;
        let json = serde_json::to_vec_pretty(state)
            .map_err(|e| Error::checkpoint(run_id, format!("serialize: {e}")))?;

        let _guard = self.write_lock.lock();
        fs::create_dir_all(&self.dir)
            .map_err(|e| Error::checkpoint(run_id, format!("create {}: {e}", self.dir.display())))?;

        let path = self.path_for(run_id);
        atomic_write(&path, &json)
            .map_err(|e| Error::checkpoint(run_id, format!("write {}: {e}", path.display())))?;

        tracing::trace!(%run_id, items = state.items.len(), "Checkpoint written");
        Ok(())
    }
}

/// Replace `path` with `contents` via a flushed temp file and a rename.
///
/// On unix the parent directory is synced after the rename so the new
/// directory entry survives a power loss as well as the file data.
pub fn atomic_write(path: &Path, contents: &[u8]) -> io::Result<()> {
    let mut tmp_name = path.file_name().unwrap_or_default().to_os_string();
    tmp_name.push(".tmp");
    let tmp = path.with_file_name(tmp_name);

    let result = (|| {
        let mut file = File::create(&tmp)?;
        file.write_all(contents)?;
        file.sync_all()?;
        fs::rename(&tmp, path)
    })();

    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    result?;
    sync_parent(path)
}

#[cfg(unix)]
fn sync_parent(path: &Path) -> io::Result<()> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    File::open(parent)?.sync_all()
}

#[cfg(not(unix))]
fn sync_parent(_path: &Path) -> io::Result<()> {
    Ok(())
}
