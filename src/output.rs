//! CLI output formatting.
//!
//! # Chapter-First Display
//!
//! Every chapter is shown by its positional index and identity, with its
//! status and any error as indented context lines. The same helpers are
//! used for live progress, the end-of-run report, and `status`, so a
//! chapter looks the same everywhere.
//!
//! # Output Format
//!
//! ## Progress
//!
//! ```text
//! ==> analyze book: 3 of 5 chapters need work (concurrent, resumed)
//! 002 The Road: attempt 1/3
//! 002 retrying in 2000ms after transient rate_limited: slow down
//! 002 completed after 2 attempts (120 units)
//! 005 failed after 1 attempt: permanent invalid_input: empty chapter
//! ```
//!
//! ## Report
//!
//! ```text
//! Chapters
//! 001 Arrival: completed (1 attempt)
//! 005 Aftermath: failed (1 attempt)
//!     Error: permanent invalid_input: empty chapter
//!
//! Usage: 480 units in analyze, 480 total
//! Run book analyze: incomplete, 4 completed, 1 failed, 0 pending (5 total)
//! ```
//!
//! # Architecture
//!
//! Each view has a `format_*` function (returns `Vec<String>`) for
//! testability and a `print_*` wrapper that writes to stdout. Format
//! functions are pure: no I/O, no side effects.

use crate::lock::Inspection;
use crate::pipeline::{ChapterSummary, ProgressEvent, RunOutcome, RunReport, RunStatus};
use crate::state::{ChapterStatus, RunState};

// ============================================================================
// Shared display helpers
// ============================================================================

/// Format a 1-based positional index as 3-digit zero-padded.
fn format_index(pos: usize) -> String {
    format!("{:0>3}", pos)
}

/// Return indentation string: 4 spaces per depth level.
fn indent(depth: usize) -> String {
    "    ".repeat(depth)
}

/// Chapter identity: the title when there is one, else the id.
fn chapter_label(id: &str, title: Option<&str>) -> String {
    match title {
        Some(t) if !t.is_empty() => t.to_string(),
        _ => id.to_string(),
    }
}

fn plural(n: u32, word: &str) -> String {
    if n == 1 {
        format!("{n} {word}")
    } else {
        format!("{n} {word}s")
    }
}

fn outcome_word(outcome: RunOutcome) -> &'static str {
    match outcome {
        RunOutcome::Complete => "complete",
        RunOutcome::Incomplete => "incomplete",
        RunOutcome::Cancelled => "cancelled",
    }
}

fn chapter_lines(index: usize, chapter: &ChapterSummary) -> Vec<String> {
    let mut lines = vec![format!(
        "{} {}: {} ({})",
        format_index(index),
        chapter_label(&chapter.id, chapter.title.as_deref()),
        chapter.status,
        plural(chapter.attempts, "attempt")
    )];
    if chapter.status == ChapterStatus::Failed {
        if let Some(error) = &chapter.last_error {
            lines.push(format!("{}Error: {}", indent(1), error));
        }
    }
    lines
}

// ============================================================================
// Progress
// ============================================================================

/// Format one live progress event.
pub fn format_progress_event(event: &ProgressEvent) -> Vec<String> {
    match event {
        ProgressEvent::Started {
            run_id,
            phase,
            strategy,
            resumed,
            to_do,
            total,
        } => {
            let resumed = if *resumed { ", resumed" } else { "" };
            vec![format!(
                "==> {phase} {run_id}: {to_do} of {total} chapters need work ({strategy}{resumed})"
            )]
        }
        ProgressEvent::LockReclaimed { reason } => {
            vec![format!("Reclaimed stale lock: {reason}")]
        }
        ProgressEvent::Recovered { phase, id } => {
            vec![format!("{id} was interrupted during {phase}; starting it over")]
        }
        ProgressEvent::AttemptStarted {
            id,
            title,
            attempt,
            max_attempts,
        } => {
            let head = match title.as_deref() {
                Some(t) if !t.is_empty() => format!("{id} {t}"),
                _ => id.clone(),
            };
            vec![format!("{head}: attempt {attempt}/{max_attempts}")]
        }
        ProgressEvent::Retrying {
            id, error, delay, ..
        } => vec![format!(
            "{id} retrying in {}ms after {error}",
            delay.as_millis()
        )],
        ProgressEvent::Completed {
            id,
            attempts,
            units,
        } => vec![format!(
            "{id} completed after {} ({units} units)",
            plural(*attempts, "attempt")
        )],
        ProgressEvent::Failed {
            id,
            attempts,
            error,
        } => vec![format!(
            "{id} failed after {}: {error}",
            plural(*attempts, "attempt")
        )],
    }
}

// ============================================================================
// Run report
// ============================================================================

/// Format the end-of-run summary.
pub fn format_run_report(report: &RunReport) -> Vec<String> {
    let mut lines = vec!["Chapters".to_string()];
    for (i, chapter) in report.chapters.iter().enumerate() {
        lines.extend(chapter_lines(i + 1, chapter));
    }
    lines.push(String::new());

    if !report.recovered.is_empty() {
        let ids: Vec<String> = report
            .recovered
            .iter()
            .map(|(phase, id)| format!("{id} ({phase})"))
            .collect();
        lines.push(format!("Recovered: {}", ids.join(", ")));
    }
    if !report.added.is_empty() {
        lines.push(format!("New chapters: {}", report.added.join(", ")));
    }
    lines.push(format!(
        "Usage: {} units in {}, {} total",
        report.phase_units, report.phase, report.total_units
    ));
    lines.push(format!(
        "Run {} {}: {}, {}",
        report.run_id,
        report.phase,
        outcome_word(report.outcome),
        report.counts
    ));
    lines
}

pub fn print_run_report(report: &RunReport) {
    for line in format_run_report(report) {
        println!("{}", line);
    }
}

// ============================================================================
// Status
// ============================================================================

/// Format a persisted run for the `status` command.
pub fn format_status(run_id: &str, status: &RunStatus) -> Vec<String> {
    let mut lines = Vec::new();
    match &status.state {
        None => lines.push(format!("Run {run_id}: not started")),
        Some(state) => lines.extend(format_state(state)),
    }

    lines.push(match &status.lock {
        Inspection::Absent => "Lock: free".to_string(),
        Inspection::Held(r) => format!(
            "Lock: held by {} (pid {} on {}) since {}",
            r.owner, r.pid, r.hostname, r.acquired_at
        ),
        Inspection::Stale { reason, .. } => format!("Lock: stale ({reason})"),
    });

    if !status.recent_log.is_empty() {
        lines.push(String::new());
        lines.push("Recent log".to_string());
        for entry in &status.recent_log {
            lines.push(format!("{}{}", indent(1), entry));
        }
    }
    lines
}

fn format_state(state: &RunState) -> Vec<String> {
    let mut lines = vec![format!(
        "Run {} (created {}, {} chapters)",
        state.run_id,
        state.created_at,
        state.chapters.len()
    )];
    if let Some(phase) = state.phase {
        lines.push(format!("{}Last phase: {phase}", indent(1)));
    }
    for (phase, progress) in &state.phases {
        lines.push(format!(
            "{}{phase}: {} | {} units",
            indent(1),
            progress.counts(),
            progress.units_consumed
        ));
        for (i, record) in progress.records.iter().enumerate() {
            if record.status != ChapterStatus::Failed {
                continue;
            }
            lines.push(format!(
                "{}{} {}: failed ({})",
                indent(2),
                format_index(i + 1),
                record.id,
                plural(record.attempts, "attempt")
            ));
            if let Some(error) = &record.last_error {
                lines.push(format!("{}Error: {}", indent(3), error));
            }
        }
    }
    lines.push(format!("{}Usage: {} units", indent(1), state.units_consumed));
    lines
}

pub fn print_status(run_id: &str, status: &RunStatus) {
    for line in format_status(run_id, status) {
        println!("{}", line);
    }
}
