//! Single-writer lock over a run directory.
//!
//! The lock is a small JSON file (`run.lock`) describing its owner. It is
//! created atomically with content: the record is written to a private
//! temporary file and hard-linked into place, so the link either fails
//! because a lock exists or publishes a complete record. No reader ever sees
//! an empty or half-written lock.
//!
//! ## Staleness
//!
//! A lock is reclaimed automatically, with a warning, when:
//!
//! - its owner has not refreshed `heartbeat_at` within `stale_after`;
//! - its owner runs on this host and the PID no longer exists;
//! - the artifact is the wrong kind, e.g. a directory left behind where the
//!   marker file should be, or a file that is not a lock record.
//!
//! A live, fresh lock makes [`LockManager::acquire`] wait up to the given
//! timeout and then fail with [`LockError::AlreadyLocked`].
//!
//! ## Release
//!
//! [`LockHandle`] releases on drop, so every exit path out of a run gives
//! the lock back. Release is idempotent and only ever removes the marker if
//! it still carries the handle's token.

use crate::config::LockConfig;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Error, Debug)]
pub enum LockError {
    #[error("IO error on lock {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error(
        "another run is active: locked by {} (pid {} on {}) since {}",
        .0.owner, .0.pid, .0.hostname, .0.acquired_at
    )]
    AlreadyLocked(Box<LockRecord>),
    #[error("lock {0} was taken over by another process")]
    Lost(PathBuf),
}

/// Contents of the lock marker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    pub owner: String,
    pub pid: u32,
    pub hostname: String,
    /// Unique per acquisition; release only removes a marker with this token.
    pub token: String,
    pub acquired_at: DateTime<Utc>,
    pub heartbeat_at: DateTime<Utc>,
}

impl LockRecord {
    fn current(owner: &str) -> Self {
        static SEQ: AtomicU64 = AtomicU64::new(0);
        let now = Utc::now();
        let pid = std::process::id();
        Self {
            owner: owner.to_string(),
            pid,
            hostname: hostname(),
            token: format!(
                "{pid}-{}-{}",
                now.timestamp_micros(),
                SEQ.fetch_add(1, Ordering::Relaxed)
            ),
            acquired_at: now,
            heartbeat_at: now,
        }
    }

    /// Time since the last heartbeat. Clock skew into the future counts as zero.
    pub fn age(&self) -> Duration {
        Utc::now()
            .signed_duration_since(self.heartbeat_at)
            .to_std()
            .unwrap_or_default()
    }

    /// Whether the owning process is still running. Only checkable on the
    /// same host; a foreign or unidentified host is assumed alive.
    pub fn is_holder_alive(&self) -> bool {
        let local = hostname();
        if self.hostname == UNKNOWN_HOST || local == UNKNOWN_HOST || self.hostname != local {
            return true;
        }
        process_alive(self.pid)
    }
}

/// Why an existing lock artifact may be reclaimed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StaleReason {
    /// No heartbeat for longer than the threshold.
    Expired { age: Duration },
    /// Owner process is gone.
    OwnerDead { pid: u32 },
    /// A directory where the marker file belongs.
    Directory,
    /// A file that does not hold a lock record.
    Malformed,
    /// Neither file nor directory (symlink, socket, ...).
    UnexpectedKind,
}

impl fmt::Display for StaleReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StaleReason::Expired { age } => write!(f, "no heartbeat for {}s", age.as_secs()),
            StaleReason::OwnerDead { pid } => write!(f, "owner pid {pid} is not running"),
            StaleReason::Directory => f.write_str("lock path is a directory"),
            StaleReason::Malformed => f.write_str("lock file is not a lock record"),
            StaleReason::UnexpectedKind => f.write_str("lock path is not a regular file"),
        }
    }
}

/// What currently sits at the lock path.
#[derive(Debug, Clone, PartialEq)]
pub enum Inspection {
    Absent,
    Held(LockRecord),
    Stale {
        reason: StaleReason,
        record: Option<LockRecord>,
    },
}

#[derive(Debug, Clone)]
pub struct LockManager {
    path: PathBuf,
    stale_after: Duration,
    poll_interval: Duration,
}

impl LockManager {
    pub fn new(path: impl Into<PathBuf>, config: &LockConfig) -> Self {
        Self {
            path: path.into(),
            stale_after: Duration::from_secs(config.stale_after_secs),
            poll_interval: Duration::from_millis(config.poll_interval_ms),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Classify a lock record. `None` means it is live.
    pub fn staleness(&self, record: &LockRecord) -> Option<StaleReason> {
        let age = record.age();
        if age > self.stale_after {
            Some(StaleReason::Expired { age })
        } else if !record.is_holder_alive() {
            Some(StaleReason::OwnerDead { pid: record.pid })
        } else {
            None
        }
    }

    pub fn is_stale(&self, record: &LockRecord) -> bool {
        self.staleness(record).is_some()
    }

    /// Look at the lock artifact without changing anything.
    pub fn inspect(&self) -> Result<Inspection, LockError> {
        let meta = match fs::symlink_metadata(&self.path) {
            Ok(m) => m,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Inspection::Absent),
            Err(e) => return Err(self.io(e)),
        };
        let stale = |reason| Inspection::Stale {
            reason,
            record: None,
        };
        if meta.is_dir() {
            return Ok(stale(StaleReason::Directory));
        }
        if !meta.is_file() {
            return Ok(stale(StaleReason::UnexpectedKind));
        }
        match read_record(&self.path) {
            Ok(record) => Ok(match self.staleness(&record) {
                Some(reason) => Inspection::Stale {
                    reason,
                    record: Some(record),
                },
                None => Inspection::Held(record),
            }),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Inspection::Absent),
            Err(e) if e.kind() == io::ErrorKind::InvalidData => Ok(stale(StaleReason::Malformed)),
            Err(e) => Err(self.io(e)),
        }
    }

    /// Take the lock for `owner`, waiting up to `timeout` for a live holder.
    ///
    /// Stale artifacts are removed and the acquisition retried; the returned
    /// handle reports what was reclaimed.
    pub fn acquire(&self, owner: &str, timeout: Duration) -> Result<LockHandle, LockError> {
        // A timeout too large for Instant means wait indefinitely
        let deadline = Instant::now().checked_add(timeout);
        let mut reclaimed = None;

        loop {
            let record = LockRecord::current(owner);
            match self.try_create(&record) {
                Ok(()) => {
                    debug!(path = %self.path.display(), owner, "run lock acquired");
                    return Ok(LockHandle {
                        path: self.path.clone(),
                        record,
                        reclaimed,
                        released: false,
                    });
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
                Err(e) => return Err(self.io(e)),
            }

            match self.inspect()? {
                Inspection::Absent => continue,
                Inspection::Stale { reason, record } => {
                    warn!(
                        path = %self.path.display(),
                        previous_owner = record.as_ref().map(|r| r.owner.as_str()),
                        "reclaiming stale run lock: {reason}"
                    );
                    self.remediate(&reason, record.as_ref())?;
                    reclaimed = Some(reason);
                }
                Inspection::Held(holder) => {
                    let mut wait = self.poll_interval;
                    if let Some(deadline) = deadline {
                        let now = Instant::now();
                        if now >= deadline {
                            return Err(LockError::AlreadyLocked(Box::new(holder)));
                        }
                        wait = wait.min(deadline - now);
                    }
                    std::thread::sleep(wait);
                }
            }
        }
    }

    /// Remove whatever sits at the lock path. Returns whether anything was there.
    pub fn force_remove(&self) -> Result<bool, LockError> {
        match fs::symlink_metadata(&self.path) {
            Ok(m) if m.is_dir() => fs::remove_dir_all(&self.path).map_err(|e| self.io(e))?,
            Ok(_) => fs::remove_file(&self.path).map_err(|e| self.io(e))?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(self.io(e)),
        }
        Ok(true)
    }

    fn remediate(&self, reason: &StaleReason, seen: Option<&LockRecord>) -> Result<(), LockError> {
        let result = match reason {
            StaleReason::Directory => fs::remove_dir_all(&self.path),
            _ => {
                // Only remove the record we judged stale, not a fresh one that
                // replaced it in the meantime
                if let Some(seen) = seen {
                    match read_record(&self.path) {
                        Ok(current) if current.token != seen.token => return Ok(()),
                        _ => {}
                    }
                }
                fs::remove_file(&self.path)
            }
        };
        match result {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(self.io(e)),
        }
    }

    fn try_create(&self, record: &LockRecord) -> io::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = temp_path(&self.path, &record.token);
        write_record(&tmp, record)?;
        let linked = fs::hard_link(&tmp, &self.path);
        let _ = fs::remove_file(&tmp);
        linked
    }

    fn io(&self, source: io::Error) -> LockError {
        LockError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

/// Proof of ownership. Dropping it releases the lock.
#[derive(Debug)]
pub struct LockHandle {
    path: PathBuf,
    record: LockRecord,
    reclaimed: Option<StaleReason>,
    released: bool,
}

impl LockHandle {
    pub fn record(&self) -> &LockRecord {
        &self.record
    }

    /// Stale artifact removed while acquiring, if any.
    pub fn reclaimed(&self) -> Option<&StaleReason> {
        self.reclaimed.as_ref()
    }

    pub fn is_released(&self) -> bool {
        self.released
    }

    /// Refresh the heartbeat so a long run is not mistaken for a dead one.
    pub fn refresh(&mut self) -> Result<(), LockError> {
        let io_err = |source| LockError::Io {
            path: self.path.clone(),
            source,
        };
        match read_record(&self.path) {
            Ok(current) if current.token == self.record.token => {}
            Ok(_) => return Err(LockError::Lost(self.path.clone())),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(LockError::Lost(self.path.clone()));
            }
            Err(e) => return Err(io_err(e)),
        }
        let mut next = self.record.clone();
        next.heartbeat_at = Utc::now();
        let tmp = temp_path(&self.path, &next.token);
        write_record(&tmp, &next)
            .and_then(|()| fs::rename(&tmp, &self.path))
            .map_err(io_err)?;
        self.record = next;
        Ok(())
    }

    /// Give the lock back. Calling it again is a no-op.
    pub fn release(&mut self) -> Result<(), LockError> {
        if self.released {
            return Ok(());
        }
        self.released = true;
        let removed = match read_record(&self.path) {
            Ok(current) if current.token == self.record.token => {
                fs::remove_file(&self.path).or_else(ignore_not_found)
            }
            Ok(current) => {
                warn!(
                    path = %self.path.display(),
                    holder = %current.owner,
                    "run lock was taken over before release; leaving it in place"
                );
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        };
        removed.map_err(|source| LockError::Io {
            path: self.path.clone(),
            source,
        })?;
        debug!(path = %self.path.display(), "run lock released");
        Ok(())
    }
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            warn!("failed to release run lock: {e}");
        }
    }
}

fn ignore_not_found(e: io::Error) -> io::Result<()> {
    if e.kind() == io::ErrorKind::NotFound {
        Ok(())
    } else {
        Err(e)
    }
}

fn temp_path(lock_path: &Path, token: &str) -> PathBuf {
    let name = lock_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "lock".to_string());
    lock_path.with_file_name(format!(".{name}.{token}.tmp"))
}

fn write_record(path: &Path, record: &LockRecord) -> io::Result<()> {
    let json = serde_json::to_vec_pretty(record).map_err(io::Error::from)?;
    let mut file = fs::File::create(path)?;
    file.write_all(&json)?;
    file.sync_all()
}

/// Read a lock record. Unparseable content is `InvalidData`.
fn read_record(path: &Path) -> io::Result<LockRecord> {
    let content = fs::read_to_string(path)?;
    serde_json::from_str(&content).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

const UNKNOWN_HOST: &str = "unknown";

/// Hostname for same-host liveness checks, or "unknown".
fn hostname() -> String {
    system_hostname()
        .or_else(|| std::env::var("HOSTNAME").ok())
        .or_else(|| std::env::var("HOST").ok())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| UNKNOWN_HOST.into())
}

#[cfg(unix)]
fn system_hostname() -> Option<String> {
    let mut buf = [0u8; 256];
    // SAFETY: the buffer is valid for its full length; one byte is kept back
    // so the result is always NUL-terminated
    let rc = unsafe { libc::gethostname(buf.as_mut_ptr().cast(), buf.len() - 1) };
    if rc != 0 {
        return None;
    }
    let len = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    std::str::from_utf8(&buf[..len]).ok().map(str::to_string)
}

#[cfg(not(unix))]
fn system_hostname() -> Option<String> {
    None
}

#[cfg(unix)]
fn process_alive(pid: u32) -> bool {
    // pid 0 and values that wrap negative address process groups, not a process
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    if pid <= 0 {
        return false;
    }
    // SAFETY: signal 0 performs the existence and permission check only
    if unsafe { libc::kill(pid, 0) } == 0 {
        return true;
    }
    io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
fn process_alive(_pid: u32) -> bool {
    // No cheap probe; rely on heartbeat expiry
    true
}
