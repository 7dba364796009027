//! Drives chapters through the invoker.
//!
//! The scheduler owns the attempt/retry loop of each chapter and nothing
//! else: it never touches the run state directly. Every state-relevant step
//! is reported to an [`EventSink`] and the sink makes it durable before the
//! scheduler moves on, so an attempt is only invoked after its InProgress
//! marker has been saved.
//!
//! ## Strategies
//!
//! - [`Strategy::Sequential`]: one chapter at a time in document order, with
//!   an optional pause between chapters.
//! - [`Strategy::Concurrent`]: a dedicated [rayon](https://docs.rs/rayon)
//!   pool of `concurrency` workers, each running the full attempt loop for
//!   one chapter at a time. Chapters finish in any order.
//!
//! Both strategies share the per-chapter driver, so durability and retry
//! behaviour do not depend on the strategy.
//!
//! ## Cancellation
//!
//! A [`CancelToken`] stops new attempts and new chapters from starting. An
//! attempt already inside the invoker is allowed to finish and its outcome
//! is still recorded. Backoff and inter-chapter waits observe the token.

use crate::config::{SchedulerConfig, effective_concurrency};
use crate::invoke::{InvokeError, Invoker};
use crate::retry::{Classification, RetryPolicy};
use crate::source::Chapter;
use crate::state::{ChapterError, Phase};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};

/// Longest uninterrupted sleep while waiting on a cancellable delay.
const SLEEP_SLICE: Duration = Duration::from_millis(50);

#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("failed to start worker pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    #[default]
    Sequential,
    Concurrent,
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Strategy::Sequential => "sequential",
            Strategy::Concurrent => "concurrent",
        })
    }
}

impl FromStr for Strategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sequential" | "serial" => Ok(Strategy::Sequential),
            "concurrent" | "parallel" => Ok(Strategy::Concurrent),
            other => Err(format!(
                "unknown strategy '{other}' (expected sequential or concurrent)"
            )),
        }
    }
}

/// Cooperative cancellation flag shared between the controller, the
/// workers, and signal handlers.
///
/// A [child](CancelToken::child) observes its parent but cancelling it
/// leaves the parent untouched.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    parent: Option<Arc<AtomicBool>>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// A token that is cancelled when `self` is, or when cancelled itself.
    pub fn child(&self) -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            parent: Some(Arc::clone(&self.flag)),
        }
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
            || self.parent.as_ref().is_some_and(|p| p.load(Ordering::SeqCst))
    }

    /// The underlying flag, for `signal_hook::flag::register`.
    pub fn flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.flag)
    }

    /// Sleep for `duration` unless cancelled first.
    ///
    /// Returns `true` if the full duration elapsed.
    pub fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now().checked_add(duration);
        loop {
            if self.is_cancelled() {
                return false;
            }
            let now = Instant::now();
            let remaining = match deadline {
                Some(deadline) if now >= deadline => return true,
                Some(deadline) => deadline - now,
                None => SLEEP_SLICE,
            };
            std::thread::sleep(remaining.min(SLEEP_SLICE));
        }
    }
}

/// A state-relevant step in one chapter's attempt loop.
#[derive(Debug, Clone, PartialEq)]
pub enum ChapterEvent {
    /// About to invoke. Must be durable before the invocation happens.
    AttemptStarted,
    /// The attempt succeeded.
    Completed {
        payload: serde_json::Value,
        units: u64,
    },
    /// The attempt failed. `retry_in` is set when another attempt follows
    /// after that delay; `None` means the failure is final for this run.
    AttemptFailed {
        error: ChapterError,
        units: u64,
        retry_in: Option<Duration>,
    },
}

/// The sink could not make an event durable. It keeps the cause; the
/// scheduler only needs to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Halt;

/// Receives chapter events, one at a time per chapter, from any worker.
pub trait EventSink: Sync {
    fn apply(&self, chapter_id: &str, event: ChapterEvent) -> Result<(), Halt>;
}

/// A chapter due for work and the attempts it already used.
#[derive(Debug, Clone, Copy)]
pub struct WorkItem<'c> {
    pub chapter: &'c Chapter,
    pub prior_attempts: u32,
}

pub struct Scheduler<'a> {
    policy: &'a RetryPolicy,
    invoker: &'a dyn Invoker,
    cancel: CancelToken,
    strategy: Strategy,
    concurrency: usize,
    chapter_delay: Duration,
}

impl<'a> Scheduler<'a> {
    pub fn new(
        policy: &'a RetryPolicy,
        invoker: &'a dyn Invoker,
        cancel: CancelToken,
        config: &SchedulerConfig,
    ) -> Self {
        Self {
            policy,
            invoker,
            cancel,
            strategy: config.strategy,
            concurrency: effective_concurrency(config),
            chapter_delay: Duration::from_millis(config.chapter_delay_ms),
        }
    }

    pub fn strategy(&self) -> Strategy {
        self.strategy
    }

    /// Process `work` for `phase`. Returns once every chapter reached a final
    /// outcome for this run, or scheduling stopped on cancellation or `Halt`.
    ///
    /// A `Halt` from the sink stops this run's workers only; the token the
    /// scheduler was built with is never cancelled by it.
    pub fn run(
        &self,
        phase: Phase,
        work: &[WorkItem<'_>],
        sink: &dyn EventSink,
    ) -> Result<(), SchedulerError> {
        let stop = self.cancel.child();
        match self.strategy {
            Strategy::Sequential => {
                self.run_sequential(phase, work, sink, &stop);
                Ok(())
            }
            Strategy::Concurrent => self.run_concurrent(phase, work, sink, &stop),
        }
    }

    fn run_sequential(
        &self,
        phase: Phase,
        work: &[WorkItem<'_>],
        sink: &dyn EventSink,
        stop: &CancelToken,
    ) {
        for (i, item) in work.iter().enumerate() {
            if i > 0 && !self.chapter_delay.is_zero() && !stop.sleep(self.chapter_delay) {
                break;
            }
            if stop.is_cancelled() {
                break;
            }
            if self.drive(phase, item, sink, stop).is_err() {
                stop.cancel();
                break;
            }
        }
    }

    fn run_concurrent(
        &self,
        phase: Phase,
        work: &[WorkItem<'_>],
        sink: &dyn EventSink,
        stop: &CancelToken,
    ) -> Result<(), SchedulerError> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.concurrency)
            .thread_name(|i| format!("chapter-worker-{i}"))
            .build()?;
        debug!(workers = self.concurrency, chapters = work.len(), "starting worker pool");

        pool.install(|| {
            work.par_iter().with_max_len(1).for_each(|item| {
                if stop.is_cancelled() {
                    return;
                }
                if self.drive(phase, item, sink, stop).is_err() {
                    stop.cancel();
                }
            });
        });
        Ok(())
    }

    /// Attempt loop for one chapter.
    fn drive(
        &self,
        phase: Phase,
        item: &WorkItem<'_>,
        sink: &dyn EventSink,
        stop: &CancelToken,
    ) -> Result<(), Halt> {
        let chapter = item.chapter;
        let mut attempts = item.prior_attempts;

        while self.policy.has_budget(attempts) && !stop.is_cancelled() {
            sink.apply(&chapter.id, ChapterEvent::AttemptStarted)?;
            attempts += 1;

            let error = match self.invoker.invoke(chapter, phase) {
                Ok(outcome) => {
                    return sink.apply(
                        &chapter.id,
                        ChapterEvent::Completed {
                            payload: outcome.payload,
                            units: outcome.units,
                        },
                    );
                }
                Err(error) => error,
            };

            let classification = self.policy.classify(&error);
            let retry_in = match classification {
                Classification::Transient { retry_after } if self.policy.has_budget(attempts) => {
                    Some(self.policy.next_delay(attempts, retry_after))
                }
                _ => None,
            };
            log_failure(phase, &chapter.id, attempts, &error, classification, retry_in);

            let InvokeError { kind, message, units, .. } = error;
            sink.apply(
                &chapter.id,
                ChapterEvent::AttemptFailed {
                    error: ChapterError {
                        class: classification.class(),
                        kind,
                        message,
                    },
                    units,
                    retry_in,
                },
            )?;

            match retry_in {
                Some(delay) if stop.sleep(delay) => {}
                _ => break,
            }
        }
        Ok(())
    }
}

fn log_failure(
    phase: Phase,
    id: &str,
    attempt: u32,
    error: &InvokeError,
    classification: Classification,
    retry_in: Option<Duration>,
) {
    match retry_in {
        Some(delay) => debug!(
            %phase, chapter = id, attempt, kind = %error.kind,
            "attempt failed, retrying in {}ms: {}", delay.as_millis(), error.message
        ),
        None => warn!(
            %phase, chapter = id, attempt, kind = %error.kind, class = %classification.class(),
            "chapter failed: {}", error.message
        ),
    }
}
