//! The operation invoker: performs one external call for one chapter.
//!
//! The pipeline never looks inside a provider's response. An [`Invoker`]
//! returns an opaque JSON [`Outcome`] on success, or an [`InvokeError`]
//! carrying a coarse [`ErrorKind`] and an optional retry-after hint that the
//! [retry policy](crate::retry) turns into a Transient/Permanent decision.
//!
//! The production implementation is [`CommandInvoker`], which delegates each
//! call to an external program so provider-specific request code stays out of
//! this crate.
//!
//! ## Command protocol
//!
//! ```text
//! stdin      chapter content
//! env        CHAPTER_ID, CHAPTER_TITLE, PIPELINE_PHASE
//! stdout     result payload (parsed as JSON when possible, else kept as a string)
//! stderr     optional directive lines, other lines are the error message:
//!              error=rate_limited
//!              retry-after=30
//!              units=1250
//! exit 0     success
//! exit 75    failure, kind defaults to `unavailable` (EX_TEMPFAIL)
//! other      failure, kind from `error=` or `other`
//! ```

use crate::config::InvokerConfig;
use crate::source::Chapter;
use crate::state::Phase;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::Write;
use std::process::{Command, Stdio};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Coarse failure category reported by an invoker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    RateLimited,
    Timeout,
    Network,
    Server,
    Unavailable,
    InvalidInput,
    Unauthorized,
    QuotaExhausted,
    Other,
}

impl ErrorKind {
    pub const ALL: [ErrorKind; 9] = [
        ErrorKind::RateLimited,
        ErrorKind::Timeout,
        ErrorKind::Network,
        ErrorKind::Server,
        ErrorKind::Unavailable,
        ErrorKind::InvalidInput,
        ErrorKind::Unauthorized,
        ErrorKind::QuotaExhausted,
        ErrorKind::Other,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Network => "network",
            ErrorKind::Server => "server",
            ErrorKind::Unavailable => "unavailable",
            ErrorKind::InvalidInput => "invalid_input",
            ErrorKind::Unauthorized => "unauthorized",
            ErrorKind::QuotaExhausted => "quota_exhausted",
            ErrorKind::Other => "other",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ErrorKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let needle = s.trim().to_ascii_lowercase().replace('-', "_");
        ErrorKind::ALL
            .into_iter()
            .find(|k| k.as_str() == needle)
            .ok_or_else(|| format!("unknown error kind '{s}'"))
    }
}

/// A failed invocation.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{kind}: {message}")]
pub struct InvokeError {
    pub kind: ErrorKind,
    pub message: String,
    /// Provider-supplied "retry after" signal, if any.
    pub retry_after: Option<Duration>,
    /// Usage the provider billed even though the call failed.
    pub units: u64,
}

impl InvokeError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            retry_after: None,
            units: 0,
        }
    }

    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after = Some(retry_after);
        self
    }
}

/// A successful invocation: the payload is stored verbatim.
#[derive(Debug, Clone, PartialEq)]
pub struct Outcome {
    pub payload: serde_json::Value,
    /// Usage units (tokens, images) consumed by this call.
    pub units: u64,
}

impl Outcome {
    pub fn new(payload: serde_json::Value) -> Self {
        Self { payload, units: 0 }
    }
}

/// Performs the external operation for a chapter.
///
/// `Sync` because the bounded-concurrency scheduler shares one invoker
/// across its worker threads.
pub trait Invoker: Sync {
    fn invoke(&self, chapter: &Chapter, phase: Phase) -> Result<Outcome, InvokeError>;
}

/// Exit status conventionally meaning "try again later".
const EX_TEMPFAIL: i32 = 75;

/// Runs a configured external command per phase.
#[derive(Debug, Clone)]
pub struct CommandInvoker {
    config: InvokerConfig,
}

impl CommandInvoker {
    pub fn new(config: InvokerConfig) -> Self {
        Self { config }
    }
}

impl Invoker for CommandInvoker {
    fn invoke(&self, chapter: &Chapter, phase: Phase) -> Result<Outcome, InvokeError> {
        let argv = self.config.command_for(phase);
        let Some((program, args)) = argv.split_first() else {
            return Err(InvokeError::new(
                ErrorKind::InvalidInput,
                format!("no command configured for phase '{phase}'"),
            ));
        };

        let mut child = Command::new(program)
            .args(args)
            .env("CHAPTER_ID", &chapter.id)
            .env("CHAPTER_TITLE", chapter.title.as_deref().unwrap_or_default())
            .env("PIPELINE_PHASE", phase.as_str())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                InvokeError::new(ErrorKind::Other, format!("failed to run {program}: {e}"))
            })?;

        // Feed stdin from a separate thread so a chatty child cannot fill its
        // stdout pipe while we are still blocked writing the chapter.
        let stdin = child.stdin.take();
        let output = std::thread::scope(|s| {
            s.spawn(|| {
                if let Some(mut stdin) = stdin {
                    // A child that exits without reading stdin yields EPIPE here
                    let _ = stdin.write_all(chapter.content.as_bytes());
                }
            });
            child.wait_with_output()
        })
        .map_err(|e| {
            InvokeError::new(ErrorKind::Other, format!("failed to wait for {program}: {e}"))
        })?;

        let stderr = String::from_utf8_lossy(&output.stderr);
        let directives = Directives::parse(&stderr);

        if output.status.success() {
            let stdout = String::from_utf8_lossy(&output.stdout);
            return Ok(Outcome {
                payload: parse_payload(stdout.trim()),
                units: directives.units,
            });
        }

        let kind = directives.kind.unwrap_or(match output.status.code() {
            Some(EX_TEMPFAIL) => ErrorKind::Unavailable,
            _ => ErrorKind::Other,
        });
        let message = directives
            .message
            .unwrap_or_else(|| format!("{program} exited with {}", output.status));
        Err(InvokeError {
            kind,
            message,
            retry_after: directives.retry_after,
            units: directives.units,
        })
    }
}

/// Directive lines recognized on a command's stderr.
#[derive(Debug, Default, PartialEq)]
struct Directives {
    kind: Option<ErrorKind>,
    retry_after: Option<Duration>,
    units: u64,
    /// Last non-directive, non-empty line.
    message: Option<String>,
}

impl Directives {
    fn parse(stderr: &str) -> Self {
        let mut d = Directives::default();
        for line in stderr.lines().map(str::trim).filter(|l| !l.is_empty()) {
            match line.split_once('=') {
                Some(("error", v)) => d.kind = v.parse().ok().or(Some(ErrorKind::Other)),
                Some(("retry-after", v)) => {
                    d.retry_after = v
                        .trim()
                        .parse::<f64>()
                        .ok()
                        .filter(|s| !s.is_nan() && *s >= 0.0)
                        // Hints past what Duration holds wait as long as allowed
                        .map(|s| Duration::try_from_secs_f64(s).unwrap_or(Duration::MAX))
                }
                Some(("units", v)) => d.units = v.trim().parse().unwrap_or(0),
                _ => d.message = Some(line.to_string()),
            }
        }
        d
    }
}

fn parse_payload(stdout: &str) -> serde_json::Value {
    serde_json::from_str(stdout).unwrap_or_else(|_| serde_json::Value::String(stdout.to_string()))
}
