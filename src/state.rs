//! Run State: the durable record of per-chapter progress.
//!
//! A [`RunState`] is the only thing consulted to decide what work remains.
//! It holds the chapter list of the run (ids, titles, content fingerprints,
//! in document order) and, per [`Phase`], one [`ChapterRecord`] per chapter.
//!
//! ## Chapter state machine
//!
//! ```text
//!            begin_attempt            complete
//! Pending ───────────────► InProgress ─────────► Completed (terminal)
//!                              │   ▲
//!                         fail │   │ begin_attempt (while attempts < max)
//!                              ▼   │
//!                             Failed
//! ```
//!
//! An `InProgress` record found on load is proof that an attempt started but
//! never finished durably; [`RunState::recover_interrupted`] turns it back
//! into `Pending` with a zeroed attempt count.

use crate::invoke::ErrorKind;
use crate::retry::ErrorClass;
use crate::source::Chapter;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Version of the persisted document. Bump when the layout changes.
pub const SCHEMA_VERSION: u32 = 1;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum StateError {
    #[error("chapter '{id}' cannot go from {from} to {to}")]
    InvalidTransition {
        id: String,
        from: ChapterStatus,
        to: ChapterStatus,
    },
    #[error("unknown chapter '{0}'")]
    UnknownChapter(String),
}

/// The chapter source no longer matches the persisted run.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SourceMismatch {
    #[error("chapter '{0}' is recorded in the run but missing from the source")]
    Missing(String),
    #[error("chapter '{0}' changed since the run started; use a new run id to redo it")]
    Changed(String),
}

/// A named kind of work applied to every chapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    /// Text extraction: scenes, characters, descriptions.
    Analyze,
    /// Image generation from the extracted descriptions.
    Illustrate,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Analyze => "analyze",
            Phase::Illustrate => "illustrate",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Phase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "analyze" | "extract" | "extraction" => Ok(Phase::Analyze),
            "illustrate" | "illustration" => Ok(Phase::Illustrate),
            other => Err(format!("unknown phase '{other}' (expected analyze or illustrate)")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChapterStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl fmt::Display for ChapterStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ChapterStatus::Pending => "pending",
            ChapterStatus::InProgress => "in progress",
            ChapterStatus::Completed => "completed",
            ChapterStatus::Failed => "failed",
        })
    }
}

/// A classified failure as recorded on a chapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChapterError {
    pub class: ErrorClass,
    pub kind: ErrorKind,
    pub message: String,
}

impl fmt::Display for ChapterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}: {}", self.class, self.kind, self.message)
    }
}

/// Per-phase progress of one chapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChapterRecord {
    pub id: String,
    pub status: ChapterStatus,
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<ChapterError>,
    pub updated_at: DateTime<Utc>,
}

impl ChapterRecord {
    pub fn pending(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            status: ChapterStatus::Pending,
            attempts: 0,
            result: None,
            last_error: None,
            updated_at: Utc::now(),
        }
    }

    /// Pending, or Failed transiently with attempts left in the budget.
    pub fn needs_work(&self, max_attempts: u32) -> bool {
        match self.status {
            ChapterStatus::Pending => true,
            ChapterStatus::Failed => {
                let permanent = self
                    .last_error
                    .as_ref()
                    .is_some_and(|e| e.class == ErrorClass::Permanent);
                !permanent && self.attempts < max_attempts
            }
            ChapterStatus::InProgress | ChapterStatus::Completed => false,
        }
    }

    /// Pending/Failed → InProgress, counting the attempt. Returns the new count.
    pub fn begin_attempt(&mut self) -> Result<u32, StateError> {
        match self.status {
            ChapterStatus::Pending | ChapterStatus::Failed => {
                self.status = ChapterStatus::InProgress;
                self.attempts += 1;
                self.updated_at = Utc::now();
                Ok(self.attempts)
            }
            from => Err(self.invalid(from, ChapterStatus::InProgress)),
        }
    }

    /// InProgress → Completed with its result.
    pub fn complete(&mut self, result: serde_json::Value) -> Result<(), StateError> {
        if self.status != ChapterStatus::InProgress {
            return Err(self.invalid(self.status, ChapterStatus::Completed));
        }
        self.status = ChapterStatus::Completed;
        self.result = Some(result);
        self.last_error = None;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// InProgress → Failed with the classified error.
    pub fn fail(&mut self, error: ChapterError) -> Result<(), StateError> {
        if self.status != ChapterStatus::InProgress {
            return Err(self.invalid(self.status, ChapterStatus::Failed));
        }
        self.status = ChapterStatus::Failed;
        self.last_error = Some(error);
        self.updated_at = Utc::now();
        Ok(())
    }

    fn invalid(&self, from: ChapterStatus, to: ChapterStatus) -> StateError {
        StateError::InvalidTransition {
            id: self.id.clone(),
            from,
            to,
        }
    }
}

/// Chapter identity as recorded when it first joined the run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChapterEntry {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub fingerprint: String,
}

/// Records of one phase, in document order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PhaseProgress {
    pub units_consumed: u64,
    pub records: Vec<ChapterRecord>,
}

impl PhaseProgress {
    pub fn record(&self, id: &str) -> Option<&ChapterRecord> {
        self.records.iter().find(|r| r.id == id)
    }

    pub fn record_mut(&mut self, id: &str) -> Result<&mut ChapterRecord, StateError> {
        self.records
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or_else(|| StateError::UnknownChapter(id.to_string()))
    }

    pub fn counts(&self) -> StatusCounts {
        let mut counts = StatusCounts::default();
        for record in &self.records {
            match record.status {
                ChapterStatus::Pending => counts.pending += 1,
                ChapterStatus::InProgress => counts.in_progress += 1,
                ChapterStatus::Completed => counts.completed += 1,
                ChapterStatus::Failed => counts.failed += 1,
            }
        }
        counts
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub pending: usize,
    pub in_progress: usize,
    pub completed: usize,
    pub failed: usize,
}

impl StatusCounts {
    pub fn total(&self) -> usize {
        self.pending + self.in_progress + self.completed + self.failed
    }
}

impl fmt::Display for StatusCounts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} completed, {} failed, {} pending ({} total)",
            self.completed,
            self.failed,
            self.pending + self.in_progress,
            self.total()
        )
    }
}

/// What [`RunState::reconcile`] changed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReconcileReport {
    pub added: Vec<String>,
}

/// The persisted document of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunState {
    pub schema_version: u32,
    pub run_id: String,
    pub created_at: DateTime<Utc>,
    /// Phase of the most recent invocation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<Phase>,
    /// Usage across all phases and attempts. Only ever grows.
    pub units_consumed: u64,
    pub chapters: Vec<ChapterEntry>,
    #[serde(default)]
    pub phases: BTreeMap<Phase, PhaseProgress>,
}

impl RunState {
    /// A run with every chapter Pending and no phase started.
    pub fn fresh(run_id: impl Into<String>, chapters: &[Chapter]) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            run_id: run_id.into(),
            created_at: Utc::now(),
            phase: None,
            units_consumed: 0,
            chapters: chapters.iter().map(entry_for).collect(),
            phases: BTreeMap::new(),
        }
    }

    /// Structural checks applied to a freshly deserialized document.
    ///
    /// Returns a description of the first problem found.
    pub fn validate(&self) -> Result<(), String> {
        if self.schema_version != SCHEMA_VERSION {
            return Err(format!(
                "unsupported schema version {} (expected {SCHEMA_VERSION})",
                self.schema_version
            ));
        }
        let mut seen = HashSet::new();
        for entry in &self.chapters {
            if !seen.insert(entry.id.as_str()) {
                return Err(format!("duplicate chapter id '{}'", entry.id));
            }
        }
        for (phase, progress) in &self.phases {
            let ids: Vec<&str> = progress.records.iter().map(|r| r.id.as_str()).collect();
            let expected: Vec<&str> = self.chapters.iter().map(|c| c.id.as_str()).collect();
            if ids != expected {
                return Err(format!("{phase} records do not match the chapter list"));
            }
            if let Some(r) = progress
                .records
                .iter()
                .find(|r| r.status == ChapterStatus::Completed && r.result.is_none())
            {
                return Err(format!("{phase} chapter '{}' is completed without a result", r.id));
            }
        }
        Ok(())
    }

    /// Line the run up with the current chapter source.
    ///
    /// New chapters join as Pending in every started phase; the chapter list
    /// takes the source's order. A recorded chapter that vanished or whose
    /// content changed is a mismatch: resuming would silently mix two books.
    pub fn reconcile(&mut self, chapters: &[Chapter]) -> Result<ReconcileReport, SourceMismatch> {
        let current: HashMap<&str, &Chapter> =
            chapters.iter().map(|c| (c.id.as_str(), c)).collect();

        for entry in &self.chapters {
            match current.get(entry.id.as_str()) {
                None => return Err(SourceMismatch::Missing(entry.id.clone())),
                Some(c) if c.fingerprint() != entry.fingerprint => {
                    return Err(SourceMismatch::Changed(entry.id.clone()));
                }
                Some(_) => {}
            }
        }

        let known: HashSet<String> = self.chapters.iter().map(|e| e.id.clone()).collect();
        let report = ReconcileReport {
            added: chapters
                .iter()
                .filter(|c| !known.contains(&c.id))
                .map(|c| c.id.clone())
                .collect(),
        };

        let mut entries: HashMap<String, ChapterEntry> =
            self.chapters.drain(..).map(|e| (e.id.clone(), e)).collect();
        self.chapters = chapters
            .iter()
            .map(|c| entries.remove(&c.id).unwrap_or_else(|| entry_for(c)))
            .collect();

        for progress in self.phases.values_mut() {
            let mut records: HashMap<String, ChapterRecord> =
                progress.records.drain(..).map(|r| (r.id.clone(), r)).collect();
            progress.records = self
                .chapters
                .iter()
                .map(|e| records.remove(&e.id).unwrap_or_else(|| ChapterRecord::pending(&e.id)))
                .collect();
        }

        Ok(report)
    }

    /// Turn every InProgress record, in any phase, back into a zero-attempt
    /// Pending record. Returns `(phase, id)` of each recovered chapter.
    pub fn recover_interrupted(&mut self) -> Vec<(Phase, String)> {
        let mut recovered = Vec::new();
        for (phase, progress) in self.phases.iter_mut() {
            for record in progress
                .records
                .iter_mut()
                .filter(|r| r.status == ChapterStatus::InProgress)
            {
                record.status = ChapterStatus::Pending;
                record.attempts = 0;
                record.updated_at = Utc::now();
                recovered.push((*phase, record.id.clone()));
            }
        }
        recovered
    }

    /// Put every Failed record of `phase` back to Pending with a fresh retry
    /// budget. The last error is kept until the next attempt replaces it.
    pub fn reset_failed(&mut self, phase: Phase) -> Vec<String> {
        let Some(progress) = self.phases.get_mut(&phase) else {
            return Vec::new();
        };
        progress
            .records
            .iter_mut()
            .filter(|r| r.status == ChapterStatus::Failed)
            .map(|r| {
                r.status = ChapterStatus::Pending;
                r.attempts = 0;
                r.updated_at = Utc::now();
                r.id.clone()
            })
            .collect()
    }

    /// Progress of `phase`, started with all chapters Pending if new.
    pub fn phase_mut(&mut self, phase: Phase) -> &mut PhaseProgress {
        let chapters = &self.chapters;
        self.phases.entry(phase).or_insert_with(|| PhaseProgress {
            units_consumed: 0,
            records: chapters.iter().map(|e| ChapterRecord::pending(&e.id)).collect(),
        })
    }

    pub fn phase(&self, phase: Phase) -> Option<&PhaseProgress> {
        self.phases.get(&phase)
    }

    /// Ids in `phase` that still need an attempt, in document order.
    pub fn work_remaining(&self, phase: Phase, max_attempts: u32) -> Vec<String> {
        match self.phases.get(&phase) {
            Some(progress) => progress
                .records
                .iter()
                .filter(|r| r.needs_work(max_attempts))
                .map(|r| r.id.clone())
                .collect(),
            None => self.chapters.iter().map(|e| e.id.clone()).collect(),
        }
    }

    /// Add usage to both the phase and the run totals.
    pub fn add_units(&mut self, phase: Phase, units: u64) {
        self.units_consumed = self.units_consumed.saturating_add(units);
        let progress = self.phase_mut(phase);
        progress.units_consumed = progress.units_consumed.saturating_add(units);
    }
}

fn entry_for(chapter: &Chapter) -> ChapterEntry {
    ChapterEntry {
        id: chapter.id.clone(),
        title: chapter.title.clone(),
        fingerprint: chapter.fingerprint(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn chapters(n: usize) -> Vec<Chapter> {
        (1..=n)
            .map(|i| Chapter::new(format!("{i:03}"), format!("chapter {i}")))
            .collect()
    }

    fn transient(message: &str) -> ChapterError {
        ChapterError {
            class: ErrorClass::Transient,
            kind: ErrorKind::RateLimited,
            message: message.into(),
        }
    }

    // =========================================================================
    // Record transitions
    // =========================================================================

    #[test]
    fn record_happy_path() {
        let mut r = ChapterRecord::pending("001");
        assert_eq!(r.begin_attempt().unwrap(), 1);
        assert_eq!(r.status, ChapterStatus::InProgress);
        r.complete(json!({"scenes": 3})).unwrap();
        assert_eq!(r.status, ChapterStatus::Completed);
        assert_eq!(r.result, Some(json!({"scenes": 3})));
    }

    #[test]
    fn failed_can_retry() {
        let mut r = ChapterRecord::pending("001");
        r.begin_attempt().unwrap();
        r.fail(transient("429")).unwrap();
        assert_eq!(r.begin_attempt().unwrap(), 2);
        r.complete(json!(null)).unwrap();
        assert_eq!(r.attempts, 2);
        assert_eq!(r.last_error, None);
    }

    #[test]
    fn completed_is_terminal() {
        let mut r = ChapterRecord::pending("001");
        r.begin_attempt().unwrap();
        r.complete(json!("done")).unwrap();

        assert!(matches!(
            r.begin_attempt(),
            Err(StateError::InvalidTransition {
                from: ChapterStatus::Completed,
                ..
            })
        ));
        assert!(r.fail(transient("late")).is_err());
        assert!(r.complete(json!("again")).is_err());
        assert_eq!(r.result, Some(json!("done")));
    }

    #[test]
    fn pending_cannot_complete_directly() {
        let mut r = ChapterRecord::pending("001");
        assert!(r.complete(json!(1)).is_err());
        assert!(r.fail(transient("x")).is_err());
    }

    #[test]
    fn needs_work_respects_budget() {
        let mut r = ChapterRecord::pending("001");
        assert!(r.needs_work(2));
        r.begin_attempt().unwrap();
        assert!(!r.needs_work(2));
        r.fail(transient("x")).unwrap();
        assert!(r.needs_work(2));
        r.begin_attempt().unwrap();
        r.fail(transient("x")).unwrap();
        assert!(!r.needs_work(2));
    }

    #[test]
    fn permanent_failure_is_not_retried_on_resume() {
        let mut r = ChapterRecord::pending("001");
        r.begin_attempt().unwrap();
        r.fail(ChapterError {
            class: ErrorClass::Permanent,
            kind: ErrorKind::InvalidInput,
            message: "empty".into(),
        })
        .unwrap();
        assert_eq!(r.attempts, 1);
        assert!(!r.needs_work(3));
    }

    // =========================================================================
    // Run state
    // =========================================================================

    #[test]
    fn fresh_state_has_no_phases_and_everything_remaining() {
        let state = RunState::fresh("book", &chapters(3));
        assert_eq!(state.schema_version, SCHEMA_VERSION);
        assert!(state.phases.is_empty());
        assert_eq!(state.work_remaining(Phase::Analyze, 3), vec!["001", "002", "003"]);
        assert!(state.validate().is_ok());
    }

    #[test]
    fn phases_are_independent() {
        let mut state = RunState::fresh("book", &chapters(2));
        let analyze = state.phase_mut(Phase::Analyze);
        let r = analyze.record_mut("001").unwrap();
        r.begin_attempt().unwrap();
        r.complete(json!(1)).unwrap();

        assert_eq!(state.work_remaining(Phase::Analyze, 3), vec!["002"]);
        assert_eq!(state.work_remaining(Phase::Illustrate, 3), vec!["001", "002"]);
    }

    #[test]
    fn recover_interrupted_resets_attempts() {
        let mut state = RunState::fresh("book", &chapters(2));
        let progress = state.phase_mut(Phase::Analyze);
        let r = progress.record_mut("002").unwrap();
        r.begin_attempt().unwrap();
        r.fail(transient("x")).unwrap();
        r.begin_attempt().unwrap();

        let recovered = state.recover_interrupted();
        assert_eq!(recovered, vec![(Phase::Analyze, "002".to_string())]);
        let r = state.phase(Phase::Analyze).unwrap().record("002").unwrap();
        assert_eq!(r.status, ChapterStatus::Pending);
        assert_eq!(r.attempts, 0);
    }

    #[test]
    fn reset_failed_restores_budget_only_for_failed() {
        let mut state = RunState::fresh("book", &chapters(2));
        let progress = state.phase_mut(Phase::Analyze);
        for id in ["001", "002"] {
            progress.record_mut(id).unwrap().begin_attempt().unwrap();
        }
        progress.record_mut("001").unwrap().fail(transient("x")).unwrap();
        progress.record_mut("002").unwrap().complete(json!(2)).unwrap();

        assert_eq!(state.reset_failed(Phase::Analyze), vec!["001"]);
        let progress = state.phase(Phase::Analyze).unwrap();
        assert_eq!(progress.record("001").unwrap().attempts, 0);
        assert_eq!(progress.record("001").unwrap().status, ChapterStatus::Pending);
        assert!(progress.record("001").unwrap().last_error.is_some());
        assert_eq!(progress.record("002").unwrap().attempts, 1);
    }

    #[test]
    fn reconcile_appends_new_chapters_as_pending() {
        let mut state = RunState::fresh("book", &chapters(2));
        state.phase_mut(Phase::Analyze);

        let report = state.reconcile(&chapters(3)).unwrap();
        assert_eq!(report.added, vec!["003"]);
        assert_eq!(state.chapters.len(), 3);
        let progress = state.phase(Phase::Analyze).unwrap();
        assert_eq!(progress.records.len(), 3);
        assert_eq!(progress.records[2].status, ChapterStatus::Pending);
        assert!(state.validate().is_ok());
    }

    #[test]
    fn reconcile_rejects_missing_chapter() {
        let mut state = RunState::fresh("book", &chapters(3));
        let err = state.reconcile(&chapters(2)).unwrap_err();
        assert_eq!(err, SourceMismatch::Missing("003".into()));
    }

    #[test]
    fn reconcile_rejects_changed_content() {
        let mut state = RunState::fresh("book", &chapters(2));
        let mut edited = chapters(2);
        edited[1].content.push_str(" revised");
        let err = state.reconcile(&edited).unwrap_err();
        assert_eq!(err, SourceMismatch::Changed("002".into()));
    }

    #[test]
    fn validate_rejects_completed_without_result() {
        let mut state = RunState::fresh("book", &chapters(1));
        let r = state.phase_mut(Phase::Analyze).record_mut("001").unwrap();
        r.status = ChapterStatus::Completed;
        assert!(state.validate().unwrap_err().contains("without a result"));
    }

    #[test]
    fn validate_rejects_misaligned_records() {
        let mut state = RunState::fresh("book", &chapters(2));
        state.phase_mut(Phase::Analyze).records.pop();
        assert!(state.validate().is_err());
    }

    #[test]
    fn validate_rejects_future_schema() {
        let mut state = RunState::fresh("book", &chapters(1));
        state.schema_version = SCHEMA_VERSION + 1;
        assert!(state.validate().unwrap_err().contains("schema version"));
    }

    #[test]
    fn units_accumulate_per_phase_and_run() {
        let mut state = RunState::fresh("book", &chapters(1));
        state.add_units(Phase::Analyze, 100);
        state.add_units(Phase::Illustrate, 5);
        state.add_units(Phase::Analyze, 20);
        assert_eq!(state.units_consumed, 125);
        assert_eq!(state.phase(Phase::Analyze).unwrap().units_consumed, 120);
    }

    #[test]
    fn phase_parses_aliases() {
        assert_eq!("extraction".parse::<Phase>(), Ok(Phase::Analyze));
        assert_eq!("Illustrate".parse::<Phase>(), Ok(Phase::Illustrate));
        assert!("render".parse::<Phase>().is_err());
    }

    #[test]
    fn status_counts_display() {
        let counts = StatusCounts {
            pending: 1,
            in_progress: 0,
            completed: 3,
            failed: 1,
        };
        assert_eq!(counts.to_string(), "3 completed, 1 failed, 1 pending (5 total)");
    }
}
