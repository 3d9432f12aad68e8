//! Typed wrapper over the opaque reasoning service.
//!
//! The core never talks to a provider directly: workers call
//! [`Reasoner::reason`] with a task kind and a structured input, and get
//! back raw JSON plus token usage. `normalize` turns provider-shaped JSON
//! into the canonical records; worker code never branches on provider key
//! variants. Every failure path maps to a deterministic fallback in the
//! calling worker, so the workflow stays operational with degraded
//! quality when the provider is down.

pub mod client;
pub mod normalize;
pub mod prompts;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use client::{HttpReasoner, OfflineReasoner, ReasonerConfig};
pub use normalize::{normalize_deploy_message, normalize_diagnosis, normalize_plan};

/// What the caller wants reasoned about. Selects the system prompt, the
/// expected output schema and the normalizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    /// Produce a `MigrationPlan` from a dependency manifest.
    Plan,
    /// Produce an `ErrorDiagnosis` from validation logs.
    Diagnose,
    /// Compose a pull-request body from plan and outcome.
    DeployMessage,
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Plan => write!(f, "plan"),
            Self::Diagnose => write!(f, "diagnose"),
            Self::DeployMessage => write!(f, "deploy_message"),
        }
    }
}

/// Token spend for one call, as reported by the provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// Raw reply: provider-shaped JSON plus accounting.
#[derive(Debug, Clone)]
pub struct ReasonerReply {
    pub json: serde_json::Value,
    pub usage: TokenUsage,
    /// Money cost of this call, computed from configured prices.
    pub cost_usd: f64,
}

/// Error type for reasoner calls.
#[derive(Debug, thiserror::Error)]
pub enum ReasonerError {
    /// Provider unreachable or persistently erroring; retries exhausted.
    #[error("Reasoner unavailable: {0}")]
    Unavailable(String),

    /// The provider answered, but not with the JSON object we asked for.
    /// Never retried: the same prompt would produce the same shape.
    #[error("Reasoner reply malformed: {0}")]
    Malformed(String),
}

pub type ReasonerResult<T> = Result<T, ReasonerError>;

/// The opaque reasoning collaborator.
#[async_trait]
pub trait Reasoner: Send + Sync {
    async fn reason(&self, task: TaskKind, input: serde_json::Value)
        -> ReasonerResult<ReasonerReply>;
}
