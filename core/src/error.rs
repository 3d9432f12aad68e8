//! Migration error taxonomy with recovery classification.
//!
//! Every failure the orchestration core can observe is represented here.
//! Callers query `disposition()` instead of string-matching messages.
//!
//! ## Recovery dispositions
//!
//! | Disposition        | Meaning                                           |
//! |--------------------|---------------------------------------------------|
//! | RetryInStage       | retry once where the failure happened             |
//! | RetryWithBackoff   | bounded exponential backoff, then give up         |
//! | Fallback           | switch to the deterministic degraded path         |
//! | AnalyzerLoop       | consumed by the diagnose/patch/revalidate cycle   |
//! | Fatal              | terminal for the workflow                         |

use std::fmt;

use thiserror::Error;

/// How the workflow engine should react to an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// A single in-place retry is warranted (container daemon hiccup).
    RetryInStage,
    /// Retry with exponential back-off up to a configured budget.
    RetryWithBackoff,
    /// Continue on the deterministic fallback path with degraded quality.
    Fallback,
    /// Not terminal: the analyzer loop owns recovery until retries run out.
    AnalyzerLoop,
    /// Terminal for this workflow.
    Fatal,
}

impl Disposition {
    pub fn is_recoverable(self) -> bool {
        !matches!(self, Self::Fatal)
    }
}

impl fmt::Display for Disposition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RetryInStage => write!(f, "retry_in_stage"),
            Self::RetryWithBackoff => write!(f, "retry_with_backoff"),
            Self::Fallback => write!(f, "fallback"),
            Self::AnalyzerLoop => write!(f, "analyzer_loop"),
            Self::Fatal => write!(f, "fatal"),
        }
    }
}

/// Unified error type for the orchestration core.
#[derive(Debug, Error)]
pub enum MigrationError {
    // ── Recovered locally by the calling worker ───────────────────────────
    /// The reasoner replied but the reply did not fit the expected schema.
    #[error("Reasoner reply malformed: {0}")]
    ReasonerMalformed(String),

    /// The reasoner could not be reached within its retry budget.
    #[error("Reasoner unavailable: {0}")]
    ReasonerUnavailable(String),

    /// Container daemon hiccup (socket reset, races on create).
    #[error("Container transient failure: {0}")]
    ContainerTransient(String),

    /// Image pull failure, port bind conflict, daemon down.
    #[error("Container fatal failure: {0}")]
    ContainerFatal(String),

    /// Retryable repo gateway failure (rate limit, 5xx).
    #[error("Gateway transient failure: {0}")]
    GatewayTransient(String),

    /// Non-retryable repo gateway failure (auth, not found, conflict).
    #[error("Gateway permanent failure: {0}")]
    GatewayPermanent(String),

    /// A validation attempt produced `ok = false`; owned by the analyzer loop.
    #[error("Validation failed: {0}")]
    ValidationFailure(String),

    // ── Terminal ──────────────────────────────────────────────────────────
    /// The workflow was cancelled by the caller.
    #[error("Canceled: {0}")]
    Canceled(String),

    /// A worker exceeded its deadline.
    #[error("Deadline exceeded in {stage} after {seconds}s")]
    DeadlineExceeded { stage: String, seconds: u64 },

    /// Anything unexpected. Persisted, never swallowed.
    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl MigrationError {
    /// Classify this error for the engine's recovery logic.
    pub fn disposition(&self) -> Disposition {
        match self {
            Self::ReasonerMalformed(_) => Disposition::Fallback,
            Self::ReasonerUnavailable(_) => Disposition::Fallback,
            Self::ContainerTransient(_) => Disposition::RetryInStage,
            Self::ContainerFatal(_) => Disposition::AnalyzerLoop,
            Self::GatewayTransient(_) => Disposition::RetryWithBackoff,
            Self::GatewayPermanent(_) => Disposition::Fatal,
            Self::ValidationFailure(_) => Disposition::AnalyzerLoop,
            Self::Canceled(_) => Disposition::Fatal,
            Self::DeadlineExceeded { .. } => Disposition::Fatal,
            Self::Internal(_) => Disposition::Fatal,
        }
    }

    /// Short machine-readable kind, used in events and persisted error lists.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ReasonerMalformed(_) => "reasoner_malformed",
            Self::ReasonerUnavailable(_) => "reasoner_unavailable",
            Self::ContainerTransient(_) => "container_transient",
            Self::ContainerFatal(_) => "container_fatal",
            Self::GatewayTransient(_) => "gateway_transient",
            Self::GatewayPermanent(_) => "gateway_permanent",
            Self::ValidationFailure(_) => "validation_failure",
            Self::Canceled(_) => "canceled",
            Self::DeadlineExceeded { .. } => "deadline_exceeded",
            Self::Internal(_) => "internal",
        }
    }
}

/// Result alias used throughout the core.
pub type MigrationResult<T> = Result<T, MigrationError>;
