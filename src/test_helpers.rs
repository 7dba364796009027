//! Shared test utilities for the chapter-pipeline test suite.
//!
//! Provides a scripted [`Invoker`] and small constructors for chapters,
//! failures, and fast configs.
//!
//! # Usage
//!
//! ```rust
//! use crate::test_helpers::*;
//!
//! let invoker = ScriptedInvoker::new()
//!     .script("002", [Err(transient(ErrorKind::RateLimited)), Ok(outcome("done", 5))]);
//! // ... run the pipeline with &invoker ...
//! assert_eq!(invoker.calls_for("002"), 2);
//! ```

use crate::config::PipelineConfig;
use crate::invoke::{ErrorKind, InvokeError, Invoker, Outcome};
use crate::source::Chapter;
use crate::state::Phase;
use serde_json::json;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

// =========================================================================
// Scripted invoker
// =========================================================================

type Step = Result<Outcome, InvokeError>;

/// Mock invoker that replays a per-chapter script of results.
///
/// Chapters without a script, or whose script ran out, succeed with a
/// payload naming the chapter and phase and 10 units of usage.
#[derive(Default)]
pub struct ScriptedInvoker {
    scripts: Mutex<HashMap<String, VecDeque<Step>>>,
    calls: Mutex<Vec<(String, Phase)>>,
}

impl ScriptedInvoker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(self, id: &str, steps: impl IntoIterator<Item = Step>) -> Self {
        self.scripts
            .lock()
            .unwrap()
            .entry(id.to_string())
            .or_default()
            .extend(steps);
        self
    }

    pub fn calls(&self) -> Vec<(String, Phase)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_for(&self, id: &str) -> usize {
        self.calls.lock().unwrap().iter().filter(|(c, _)| c == id).count()
    }
}

impl Invoker for ScriptedInvoker {
    fn invoke(&self, chapter: &Chapter, phase: Phase) -> Result<Outcome, InvokeError> {
        self.calls.lock().unwrap().push((chapter.id.clone(), phase));
        let next = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(&chapter.id)
            .and_then(|steps| steps.pop_front());
        next.unwrap_or_else(|| Ok(outcome(json!({"chapter": chapter.id, "phase": phase}), 10)))
    }
}

// =========================================================================
// Constructors
// =========================================================================

pub fn outcome(payload: impl Into<serde_json::Value>, units: u64) -> Outcome {
    Outcome {
        payload: payload.into(),
        units,
    }
}

/// A failure the default classification table treats as Transient.
pub fn transient(kind: ErrorKind) -> InvokeError {
    debug_assert!(crate::config::RetryConfig::default().transient.contains(&kind));
    InvokeError::new(kind, format!("simulated {kind}"))
}

/// A failure the default classification table treats as Permanent.
pub fn permanent(kind: ErrorKind) -> InvokeError {
    debug_assert!(!crate::config::RetryConfig::default().transient.contains(&kind));
    InvokeError::new(kind, format!("simulated {kind}"))
}

/// `n` chapters with ids `001`..`n`, in document order.
pub fn chapters(n: usize) -> Vec<Chapter> {
    (1..=n)
        .map(|i| {
            let mut chapter = Chapter::new(format!("{i:03}"), format!("Text of chapter {i}."));
            chapter.title = Some(format!("Chapter {i}"));
            chapter
        })
        .collect()
}

/// Default config with millisecond backoff so retry tests run fast.
pub fn fast_config() -> PipelineConfig {
    let mut config = PipelineConfig::default();
    config.retry.base_delay_ms = 1;
    config.retry.max_delay_ms = 5;
    config.lock.poll_interval_ms = 10;
    config
}
