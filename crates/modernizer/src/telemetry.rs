//! Run telemetry.
//!
//! One JSON line per finished workflow, appended to `telemetry.jsonl`
//! under the persist root. Complements the per-migration event log with
//! a flat record that is cheap to aggregate across runs.

use std::path::Path;

use chrono::Utc;
use modernizer_core::{MigrationState, Phase};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::machine::TransitionRecord;

/// Flat per-run metrics record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunMetrics {
    pub migration_id: String,
    pub project_type: String,
    pub phase: Phase,
    pub success: bool,
    pub retries_used: u32,
    pub retries_max: u32,
    pub error_count: usize,
    pub transitions: Vec<String>,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_usd: f64,
    pub elapsed_ms: i64,
    pub timestamp: String,
}

impl RunMetrics {
    pub fn from_state(state: &MigrationState, transitions: &[TransitionRecord]) -> Self {
        let total = state.cost_accum.total();
        let elapsed_ms = state
            .finished_at
            .unwrap_or_else(Utc::now)
            .signed_duration_since(state.started_at)
            .num_milliseconds();
        Self {
            migration_id: state.id.clone(),
            project_type: state.project_type.to_string(),
            phase: state.phase,
            success: state.phase == Phase::Succeeded,
            retries_used: state.retries_used,
            retries_max: state.retries_max,
            error_count: state.errors.len(),
            transitions: transitions
                .iter()
                .map(|t| format!("{}->{}", t.from, t.to))
                .collect(),
            input_tokens: total.input_tokens,
            output_tokens: total.output_tokens,
            cost_usd: total.cost_usd,
            elapsed_ms,
            timestamp: Utc::now().to_rfc3339(),
        }
    }
}

/// Append the run record; telemetry failures never affect the workflow.
pub fn append_run(persist_root: &Path, state: &MigrationState, transitions: &[TransitionRecord]) {
    let metrics = RunMetrics::from_state(state, transitions);
    let path = persist_root.join("telemetry.jsonl");
    let line = match serde_json::to_string(&metrics) {
        Ok(line) => line,
        Err(e) => {
            warn!(error = %e, "failed to serialize run metrics");
            return;
        }
    };
    let result = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .and_then(|mut f| {
            use std::io::Write;
            writeln!(f, "{line}")
        });
    if let Err(e) = result {
        warn!(path = %path.display(), error = %e, "failed to append run metrics");
    }
}
