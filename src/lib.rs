//! # Chapter Pipeline
//!
//! A resumable, checkpointed pipeline that drives the chapters of a book
//! through slow, rate-limited, failure-prone external services (text
//! analysis, illustration) and keeps a durable record of every chapter's
//! progress.
//!
//! # Architecture: One Durable Document Per Run
//!
//! Each run lives in its own directory and is described by a single JSON
//! document that is rewritten atomically after every state change:
//!
//! ```text
//! chapters/  ─►  source  ─►  pipeline  ─►  scheduler  ─►  invoker (external)
//!                               │              │
//!                               ▼              ▼
//!                       runs/<id>/state.json  (saved after every event)
//!                       runs/<id>/progress.log
//!                       runs/<id>/run.lock
//! ```
//!
//! The run state is the only thing consulted to decide what work remains.
//! Resuming a crashed run is therefore the same code path as starting a new
//! one: Completed chapters are filtered out, interrupted ones start over.
//!
//! # Module Map
//!
//! | Module | Role |
//! |--------|------|
//! | [`pipeline`] | Controller: lock, load/reconcile, schedule, save per event, report |
//! | [`scheduler`] | Sequential and bounded-concurrency strategies, per-chapter attempt loop, cancellation |
//! | [`retry`] | Pluggable Transient/Permanent classification, exponential backoff, attempt budget |
//! | [`state`] | Run state document and the per-chapter state machine |
//! | [`store`] | Atomic save/load of the run state, append-only progress log |
//! | [`lock`] | Single-writer lock with heartbeat, staleness detection, and remediation |
//! | [`source`] | Chapter sources: `Vec<Chapter>` and a chapters directory |
//! | [`invoke`] | The external operation contract and a command-running implementation |
//! | [`config`] | Layered `config.toml` loading, validation, and merging |
//! | [`naming`] | `NNN-name` filename convention used to order chapter files |
//! | [`output`] | CLI output formatting for progress, reports, and status |
//!
//! # Design Decisions
//!
//! ## Save After Every Event
//!
//! Starting an attempt, finishing it, and failing it each trigger a full
//! atomic save, under both strategies. A crash loses at most the attempts
//! in flight, and a chapter is never recorded Completed without its result
//! in the same document.
//!
//! ## Bounded Retry Budget
//!
//! A chapter gets `max_attempts` invocations. Permanent failures stop at
//! once; Transient ones back off exponentially (or as long as the provider
//! asks) and become Failed when the budget runs out, so one difficult
//! chapter cannot stall the others. `--retry-failed` grants a new budget.
//!
//! ## The Lock Is A Side Artifact
//!
//! Ownership is a separate `run.lock` file, never a field of the state
//! document it protects. A lock left behind by a crash (expired heartbeat,
//! dead owner, or a directory where the file should be) is reclaimed
//! automatically and logged.

pub mod config;
pub mod invoke;
pub mod lock;
pub mod naming;
pub mod output;
pub mod pipeline;
pub mod retry;
pub mod scheduler;
pub mod source;
pub mod state;
pub mod store;

#[cfg(test)]
pub(crate) mod test_helpers;
