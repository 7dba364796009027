//! Durable storage of a run.
//!
//! Each run lives in its own directory under the runs root:
//!
//! ```text
//! runs/
//! ├── config.toml                # optional, see crate::config
//! └── <run-id>/
//!     ├── state.json             # RunState, replaced atomically on every save
//!     ├── progress.log           # append-only, human-readable audit trail
//!     └── run.lock               # lock marker, see crate::lock
//! ```
//!
//! # Atomic saves
//!
//! [`StateStore::save`] writes the whole document to a temporary sibling,
//! fsyncs it, then renames it over `state.json`. A crash at any point leaves
//! either the previous document or the new one, never a truncated mix; a
//! leftover temporary file is ignored by [`StateStore::load`] and overwritten
//! by the next save.

use crate::state::RunState;
use chrono::{SecondsFormat, Utc};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const STATE_FILENAME: &str = "state.json";
pub const LOG_FILENAME: &str = "progress.log";
pub const LOCK_FILENAME: &str = "run.lock";
const TEMP_STATE_FILENAME: &str = ".state.json.tmp";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("corrupt run state at {path}: {reason}")]
    Corrupt { path: PathBuf, reason: String },
    #[error("invalid run id '{0}'")]
    InvalidRunId(String),
}

/// File-backed store of run directories.
#[derive(Debug, Clone)]
pub struct StateStore {
    root: PathBuf,
}

impl StateStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory of a run. Run ids are single path components.
    pub fn run_dir(&self, run_id: &str) -> Result<PathBuf, StoreError> {
        let valid = !run_id.is_empty()
            && run_id != "."
            && run_id != ".."
            && !run_id.contains(['/', '\\'])
            && !run_id.starts_with('.');
        if !valid {
            return Err(StoreError::InvalidRunId(run_id.to_string()));
        }
        Ok(self.root.join(run_id))
    }

    pub fn state_path(&self, run_id: &str) -> Result<PathBuf, StoreError> {
        Ok(self.run_dir(run_id)?.join(STATE_FILENAME))
    }

    pub fn log_path(&self, run_id: &str) -> Result<PathBuf, StoreError> {
        Ok(self.run_dir(run_id)?.join(LOG_FILENAME))
    }

    pub fn lock_path(&self, run_id: &str) -> Result<PathBuf, StoreError> {
        Ok(self.run_dir(run_id)?.join(LOCK_FILENAME))
    }

    /// Load a run. `Ok(None)` when the run has never been saved.
    ///
    /// A document that does not parse or fails structural validation is
    /// reported as [`StoreError::Corrupt`] and nothing of it is returned.
    pub fn load(&self, run_id: &str) -> Result<Option<RunState>, StoreError> {
        let path = self.state_path(run_id)?;
        let content = match fs::read(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) if path.is_dir() => {
                return Err(StoreError::Corrupt {
                    path,
                    reason: format!("expected a file: {e}"),
                });
            }
            Err(e) => return Err(e.into()),
        };

        let corrupt = |reason: String| StoreError::Corrupt {
            path: path.clone(),
            reason,
        };
        let state: RunState =
            serde_json::from_slice(&content).map_err(|e| corrupt(e.to_string()))?;
        state.validate().map_err(corrupt)?;
        if state.run_id != run_id {
            return Err(corrupt(format!(
                "document belongs to run '{}'",
                state.run_id
            )));
        }
        Ok(Some(state))
    }

    /// Atomically replace the persisted document of a run.
    pub fn save(&self, run_id: &str, state: &RunState) -> Result<(), StoreError> {
        let dir = self.run_dir(run_id)?;
        fs::create_dir_all(&dir)?;
        let tmp = dir.join(TEMP_STATE_FILENAME);
        let json = serde_json::to_vec_pretty(state).map_err(io::Error::from)?;

        let written =
            write_synced(&tmp, &json).and_then(|()| fs::rename(&tmp, dir.join(STATE_FILENAME)));
        if let Err(e) = written {
            // Best effort: the previous state.json is untouched either way
            let _ = fs::remove_file(&tmp);
            return Err(e.into());
        }
        sync_dir(&dir);
        Ok(())
    }

    /// Append one line to the run's progress log.
    pub fn append_log(&self, run_id: &str, message: &str) -> Result<(), StoreError> {
        let dir = self.run_dir(run_id)?;
        fs::create_dir_all(&dir)?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join(LOG_FILENAME))?;
        let stamp = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
        writeln!(file, "{stamp} {message}")?;
        Ok(())
    }

    /// Last `n` lines of the progress log (empty if there is none).
    pub fn tail_log(&self, run_id: &str, n: usize) -> Result<Vec<String>, StoreError> {
        let file = match File::open(self.log_path(run_id)?) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let lines = BufReader::new(file).lines().collect::<Result<Vec<_>, _>>()?;
        let skip = lines.len().saturating_sub(n);
        Ok(lines.into_iter().skip(skip).collect())
    }
}

fn write_synced(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let mut file = File::create(path)?;
    file.write_all(bytes)?;
    file.sync_all()
}

/// Persist the rename itself. Directories cannot be opened for sync on Windows.
#[cfg(unix)]
fn sync_dir(dir: &Path) {
    if let Ok(d) = File::open(dir) {
        let _ = d.sync_all();
    }
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) {}
