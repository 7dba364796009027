//! Pipeline controller: one invocation of a run.
//!
//! ```text
//! acquire lock ─► load or synthesize RunState ─► reconcile with source
//!      ─► recover interrupted attempts ─► save ─► filter work
//!      ─► scheduler (each event: apply, save, heartbeat, log)
//!      ─► report ─► release lock
//! ```
//!
//! Resuming is not a separate code path. A run that crashed halfway is
//! loaded, its InProgress records are demoted to Pending, and the Completed
//! ones simply never make it into the work list.
//!
//! ## Single writer
//!
//! The in-memory [`RunState`] lives behind one mutex inside the controller's
//! event sink. Workers hand their events to the sink; each event is applied
//! and saved before the next one is taken, so the document on disk always
//! reflects a whole number of events. Across processes the run lock is the
//! only exclusion mechanism.
//!
//! ## Failure handling
//!
//! Chapter failures are data: they end up in the chapter's `last_error` and
//! the run carries on. Anything that threatens the durable state (a failed
//! save, a lost lock, a corrupt document, a source that no longer matches)
//! is a [`PipelineError`]: scheduling stops, in-flight attempts finish, and
//! the run stays at its last successful save. The lock is released on every
//! path, including errors.

use crate::config::{ConfigError, PipelineConfig};
use crate::invoke::Invoker;
use crate::lock::{Inspection, LockError, LockHandle, LockManager, LockRecord, StaleReason};
use crate::retry::{Classifier, RetryPolicy};
use crate::scheduler::{
    CancelToken, ChapterEvent, EventSink, Halt, Scheduler, SchedulerError, Strategy, WorkItem,
};
use crate::source::{Chapter, ChapterSource, SourceError};
use crate::state::{
    ChapterError, ChapterStatus, Phase, RunState, SourceMismatch, StateError, StatusCounts,
};
use crate::store::{StateStore, StoreError};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::mpsc::Sender;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info, warn};

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("corrupt run state at {path}: {reason}")]
    CorruptState { path: PathBuf, reason: String },
    #[error(
        "another run is active: locked by {} (pid {} on {}) since {}",
        .0.owner, .0.pid, .0.hostname, .0.acquired_at
    )]
    LockContention(Box<LockRecord>),
    #[error("lock error: {0}")]
    Lock(LockError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid run id '{0}'")]
    InvalidRunId(String),
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
    #[error("chapter source error: {0}")]
    Source(#[from] SourceError),
    #[error("chapter source does not match the run: {0}")]
    SourceMismatch(#[from] SourceMismatch),
    #[error("run state rejected an update: {0}")]
    State(#[from] StateError),
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
}

impl From<StoreError> for PipelineError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Io(e) => PipelineError::Io(e),
            StoreError::Corrupt { path, reason } => PipelineError::CorruptState { path, reason },
            StoreError::InvalidRunId(id) => PipelineError::InvalidRunId(id),
        }
    }
}

impl From<LockError> for PipelineError {
    fn from(e: LockError) -> Self {
        match e {
            LockError::AlreadyLocked(holder) => PipelineError::LockContention(holder),
            other => PipelineError::Lock(other),
        }
    }
}

/// What to run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunRequest {
    pub run_id: String,
    pub phase: Phase,
    /// Give Failed chapters of the phase a fresh retry budget.
    pub retry_failed: bool,
}

impl RunRequest {
    pub fn new(run_id: impl Into<String>, phase: Phase) -> Self {
        Self {
            run_id: run_id.into(),
            phase,
            retry_failed: false,
        }
    }
}

/// Live progress for display. Sent over the optional progress channel.
#[derive(Debug, Clone, PartialEq)]
pub enum ProgressEvent {
    Started {
        run_id: String,
        phase: Phase,
        strategy: Strategy,
        resumed: bool,
        to_do: usize,
        total: usize,
    },
    LockReclaimed {
        reason: String,
    },
    Recovered {
        phase: Phase,
        id: String,
    },
    AttemptStarted {
        id: String,
        title: Option<String>,
        attempt: u32,
        max_attempts: u32,
    },
    Retrying {
        id: String,
        attempt: u32,
        error: ChapterError,
        delay: Duration,
    },
    Completed {
        id: String,
        attempts: u32,
        units: u64,
    },
    Failed {
        id: String,
        attempts: u32,
        error: ChapterError,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// Every chapter of the phase is Completed.
    Complete,
    /// Some chapters ended Failed (or could not be attempted).
    Incomplete,
    /// Stopped on request before all work was done.
    Cancelled,
}

impl RunOutcome {
    /// Process exit status for this outcome. Fatal errors use 1.
    pub fn exit_code(self) -> u8 {
        match self {
            RunOutcome::Complete => 0,
            RunOutcome::Incomplete | RunOutcome::Cancelled => 2,
        }
    }
}

/// Terminal view of one chapter after a run.
#[derive(Debug, Clone, PartialEq)]
pub struct ChapterSummary {
    pub id: String,
    pub title: Option<String>,
    pub status: ChapterStatus,
    pub attempts: u32,
    pub last_error: Option<ChapterError>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunReport {
    pub run_id: String,
    pub phase: Phase,
    pub outcome: RunOutcome,
    pub counts: StatusCounts,
    /// Every chapter of the phase, in document order.
    pub chapters: Vec<ChapterSummary>,
    /// Chapters handed to the scheduler by this invocation.
    pub scheduled: usize,
    /// InProgress leftovers of a crashed run, demoted to Pending.
    pub recovered: Vec<(Phase, String)>,
    /// Chapters new in the source since the run started.
    pub added: Vec<String>,
    pub reclaimed_lock: Option<StaleReason>,
    pub phase_units: u64,
    pub total_units: u64,
}

impl RunReport {
    fn from_state(state: &RunState, phase: Phase, outcome: RunOutcome) -> Self {
        let progress = state.phase(phase);
        let chapters = state
            .chapters
            .iter()
            .filter_map(|entry| {
                let record = progress?.record(&entry.id)?;
                Some(ChapterSummary {
                    id: entry.id.clone(),
                    title: entry.title.clone(),
                    status: record.status,
                    attempts: record.attempts,
                    last_error: record.last_error.clone(),
                })
            })
            .collect();
        Self {
            run_id: state.run_id.clone(),
            phase,
            outcome,
            counts: progress.map(|p| p.counts()).unwrap_or_default(),
            chapters,
            scheduled: 0,
            recovered: Vec::new(),
            added: Vec::new(),
            reclaimed_lock: None,
            phase_units: progress.map_or(0, |p| p.units_consumed),
            total_units: state.units_consumed,
        }
    }

    pub fn failed(&self) -> impl Iterator<Item = &ChapterSummary> {
        self.chapters.iter().filter(|c| c.status == ChapterStatus::Failed)
    }
}

/// Composes store, lock, retry policy, and scheduler for one run at a time.
pub struct Pipeline<'a> {
    store: StateStore,
    config: PipelineConfig,
    invoker: &'a dyn Invoker,
    policy: RetryPolicy,
    cancel: CancelToken,
    progress: Option<Sender<ProgressEvent>>,
    owner: String,
}

impl<'a> Pipeline<'a> {
    pub fn new(store: StateStore, config: PipelineConfig, invoker: &'a dyn Invoker) -> Self {
        let policy = RetryPolicy::new(&config.retry);
        Self {
            store,
            config,
            invoker,
            policy,
            cancel: CancelToken::new(),
            progress: None,
            owner: format!("chapter-pipeline[{}]", std::process::id()),
        }
    }

    /// Replace the default Transient/Permanent table.
    pub fn with_classifier(mut self, classifier: impl Classifier + 'static) -> Self {
        self.policy = self.policy.with_classifier(classifier);
        self
    }

    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_progress(mut self, progress: Sender<ProgressEvent>) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = owner.into();
        self
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    /// Run (or resume) `request` against the chapters of `source`.
    ///
    /// Chapter failures are reported in the returned [`RunReport`]; only
    /// failures of the run itself are errors.
    pub fn run(
        &self,
        request: &RunRequest,
        source: &dyn ChapterSource,
    ) -> Result<RunReport, PipelineError> {
        let run_id = request.run_id.as_str();
        let phase = request.phase;
        let max_attempts = self.policy.max_attempts();

        let lock_manager = LockManager::new(self.store.lock_path(run_id)?, &self.config.lock);
        let timeout = Duration::from_secs(self.config.lock.acquire_timeout_secs);
        let mut lock = lock_manager.acquire(&self.owner, timeout)?;
        let reclaimed_lock = lock.reclaimed().cloned();
        if let Some(reason) = &reclaimed_lock {
            self.store
                .append_log(run_id, &format!("{phase} reclaimed stale lock: {reason}"))?;
            self.emit(ProgressEvent::LockReclaimed {
                reason: reason.to_string(),
            });
        }

        let chapters = source.list()?;
        let (mut state, resumed) = match self.store.load(run_id)? {
            Some(state) => (state, true),
            None => (RunState::fresh(run_id, &chapters), false),
        };
        let added = if resumed {
            state.reconcile(&chapters)?.added
        } else {
            Vec::new()
        };
        if !added.is_empty() {
            info!(run = run_id, count = added.len(), "new chapters joined the run");
        }

        let recovered = state.recover_interrupted();
        for (p, id) in &recovered {
            warn!(
                run = run_id, phase = %p, chapter = %id,
                "attempt interrupted by a previous crash; chapter is pending again"
            );
            self.emit(ProgressEvent::Recovered {
                phase: *p,
                id: id.clone(),
            });
        }
        if request.retry_failed {
            let reset = state.reset_failed(phase);
            if !reset.is_empty() {
                info!(
                    run = run_id, %phase, count = reset.len(),
                    "failed chapters get a fresh retry budget"
                );
            }
        }

        state.phase = Some(phase);
        state.phase_mut(phase);
        self.store.save(run_id, &state)?;
        lock.refresh()?;

        let by_id: HashMap<&str, &Chapter> = chapters.iter().map(|c| (c.id.as_str(), c)).collect();
        let work: Vec<WorkItem<'_>> = state
            .work_remaining(phase, max_attempts)
            .iter()
            .filter_map(|id| {
                let prior_attempts = state.phase(phase)?.record(id)?.attempts;
                Some(WorkItem {
                    chapter: by_id.get(id.as_str()).copied()?,
                    prior_attempts,
                })
            })
            .collect();

        let scheduler = Scheduler::new(
            &self.policy,
            self.invoker,
            self.cancel.clone(),
            &self.config.scheduler,
        );
        let total = state.chapters.len();
        info!(
            run = run_id, %phase, strategy = %scheduler.strategy(), resumed,
            "{} of {} chapters need work", work.len(), total
        );
        self.store.append_log(
            run_id,
            &format!(
                "{phase} run started ({}): {} of {} chapters need work",
                scheduler.strategy(),
                work.len(),
                total
            ),
        )?;
        self.emit(ProgressEvent::Started {
            run_id: run_id.to_string(),
            phase,
            strategy: scheduler.strategy(),
            resumed,
            to_do: work.len(),
            total,
        });

        let recorder = Recorder {
            store: &self.store,
            run_id,
            phase,
            max_attempts,
            progress: self.progress.clone(),
            inner: Mutex::new(RecorderState {
                state,
                lock,
                fatal: None,
            }),
        };
        let scheduled = scheduler.run(phase, &work, &recorder);
        let RecorderState {
            state,
            mut lock,
            fatal,
        } = recorder.inner.into_inner().unwrap_or_else(PoisonError::into_inner);
        if let Some(e) = fatal {
            return Err(e);
        }
        scheduled?;

        let counts = state.phase(phase).map(|p| p.counts()).unwrap_or_default();
        let outcome = if counts.completed == counts.total() {
            RunOutcome::Complete
        } else if self.cancel.is_cancelled() {
            RunOutcome::Cancelled
        } else {
            RunOutcome::Incomplete
        };
        let mut report = RunReport::from_state(&state, phase, outcome);
        report.scheduled = work.len();
        report.recovered = recovered;
        report.added = added;
        report.reclaimed_lock = reclaimed_lock;

        let verdict = match outcome {
            RunOutcome::Complete => "complete",
            RunOutcome::Incomplete => "incomplete",
            RunOutcome::Cancelled => "cancelled",
        };
        info!(run = run_id, %phase, %counts, units = report.phase_units, "run {verdict}");
        self.store
            .append_log(run_id, &format!("{phase} run {verdict}: {counts}"))?;
        lock.release()?;
        Ok(report)
    }

    fn emit(&self, event: ProgressEvent) {
        if let Some(tx) = &self.progress {
            tx.send(event).ok();
        }
    }
}

/// The controller's event sink: the single writer of the run state.
struct Recorder<'s> {
    store: &'s StateStore,
    run_id: &'s str,
    phase: Phase,
    max_attempts: u32,
    progress: Option<Sender<ProgressEvent>>,
    inner: Mutex<RecorderState>,
}

struct RecorderState {
    state: RunState,
    lock: LockHandle,
    /// First error that made an event impossible to persist.
    fatal: Option<PipelineError>,
}

impl EventSink for Recorder<'_> {
    fn apply(&self, chapter_id: &str, event: ChapterEvent) -> Result<(), Halt> {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if inner.fatal.is_some() {
            return Err(Halt);
        }
        match self.persist(&mut inner, chapter_id, event) {
            Ok(progress) => {
                if let Some(tx) = &self.progress {
                    tx.send(progress).ok();
                }
                Ok(())
            }
            Err(e) => {
                error!(
                    run = self.run_id, chapter = chapter_id,
                    "cannot record progress, stopping: {e}"
                );
                inner.fatal = Some(e);
                Err(Halt)
            }
        }
    }
}

impl Recorder<'_> {
    /// Apply one event, save, refresh the lock heartbeat, and log it.
    fn persist(
        &self,
        inner: &mut RecorderState,
        id: &str,
        event: ChapterEvent,
    ) -> Result<ProgressEvent, PipelineError> {
        let phase = self.phase;
        let state = &mut inner.state;
        let title = state
            .chapters
            .iter()
            .find(|e| e.id == id)
            .and_then(|e| e.title.clone());

        let (line, progress) = match event {
            ChapterEvent::AttemptStarted => {
                let attempt = state.phase_mut(phase).record_mut(id)?.begin_attempt()?;
                (
                    format!("{phase} {id} attempt {attempt} started"),
                    ProgressEvent::AttemptStarted {
                        id: id.to_string(),
                        title,
                        attempt,
                        max_attempts: self.max_attempts,
                    },
                )
            }
            ChapterEvent::Completed { payload, units } => {
                let record = state.phase_mut(phase).record_mut(id)?;
                record.complete(payload)?;
                let attempts = record.attempts;
                state.add_units(phase, units);
                (
                    format!("{phase} {id} completed after {attempts} attempt(s), {units} units"),
                    ProgressEvent::Completed {
                        id: id.to_string(),
                        attempts,
                        units,
                    },
                )
            }
            ChapterEvent::AttemptFailed {
                error,
                units,
                retry_in,
            } => {
                let record = state.phase_mut(phase).record_mut(id)?;
                record.fail(error.clone())?;
                let attempt = record.attempts;
                state.add_units(phase, units);
                match retry_in {
                    Some(delay) => (
                        format!(
                            "{phase} {id} attempt {attempt} failed ({error}); retrying in {}ms",
                            delay.as_millis()
                        ),
                        ProgressEvent::Retrying {
                            id: id.to_string(),
                            attempt,
                            error,
                            delay,
                        },
                    ),
                    None => (
                        format!("{phase} {id} failed after {attempt} attempt(s): {error}"),
                        ProgressEvent::Failed {
                            id: id.to_string(),
                            attempts: attempt,
                            error,
                        },
                    ),
                }
            }
        };

        self.store.save(self.run_id, state)?;
        inner.lock.refresh()?;
        self.store.append_log(self.run_id, &line)?;
        Ok(progress)
    }
}

// =============================================================================
// Read-only and maintenance operations
// =============================================================================

/// A run as seen from outside, without taking the lock.
#[derive(Debug, Clone)]
pub struct RunStatus {
    pub state: Option<RunState>,
    pub lock: Inspection,
    pub recent_log: Vec<String>,
}

/// Read a run's persisted state, lock, and the tail of its progress log.
pub fn status(
    store: &StateStore,
    config: &PipelineConfig,
    run_id: &str,
    log_lines: usize,
) -> Result<RunStatus, PipelineError> {
    let lock = LockManager::new(store.lock_path(run_id)?, &config.lock).inspect()?;
    Ok(RunStatus {
        state: store.load(run_id)?,
        lock,
        recent_log: store.tail_log(run_id, log_lines)?,
    })
}

#[derive(Debug, Clone, PartialEq)]
pub enum UnlockOutcome {
    NotLocked,
    Removed,
    /// The lock belongs to a live run; nothing was removed.
    Refused(Box<LockRecord>),
}

/// Remove a run's lock if it is stale, or unconditionally with `force`.
pub fn unlock(
    store: &StateStore,
    config: &PipelineConfig,
    run_id: &str,
    force: bool,
) -> Result<UnlockOutcome, PipelineError> {
    let manager = LockManager::new(store.lock_path(run_id)?, &config.lock);
    match manager.inspect()? {
        Inspection::Absent => return Ok(UnlockOutcome::NotLocked),
        Inspection::Held(record) if !force => return Ok(UnlockOutcome::Refused(Box::new(record))),
        Inspection::Held(record) => {
            warn!(run = run_id, owner = %record.owner, "forcibly removing a live run lock");
        }
        Inspection::Stale { reason, .. } => {
            info!(run = run_id, "removing stale run lock: {reason}");
        }
    }
    Ok(if manager.force_remove()? {
        store.append_log(run_id, "lock removed by unlock")?;
        UnlockOutcome::Removed
    } else {
        UnlockOutcome::NotLocked
    })
}
