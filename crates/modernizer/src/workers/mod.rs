//! The four stateless workers.
//!
//! Each worker consumes a snapshot of `MigrationState`, writes only the
//! fields it owns (plan, outcome, diagnosis, deployment, plus errors and
//! cost), publishes events, and leaves `phase` strictly alone; routing
//! is the engine's job. Workers never call each other.

pub mod analyzer;
pub mod deployer;
pub mod planner;
pub mod validator;

use std::sync::Arc;

use modernizer_core::{
    CheckpointStore, Config, ContainerRuntime, EventDraft, EventKind, MigrationState, Reasoner,
    ReasonerError, ReasonerResult, RepoGateway, SharedEventBus, TaskKind, WorkerKind,
};
use tokio_util::sync::CancellationToken;

pub use analyzer::{Analyzer, AnalyzerVerdict};
pub use deployer::Deployer;
pub use planner::Planner;
pub use validator::Validator;

/// Collaborators handed to every worker invocation.
pub struct WorkerContext {
    pub bus: SharedEventBus,
    pub store: Arc<CheckpointStore>,
    pub reasoner: Arc<dyn Reasoner>,
    pub gateway: Arc<dyn RepoGateway>,
    pub runtime: Arc<dyn ContainerRuntime>,
    pub config: Config,
    pub cancel: CancellationToken,
}

impl WorkerContext {
    /// Publish a worker-attributed event.
    pub fn publish(&self, state: &MigrationState, worker: WorkerKind, kind: EventKind, payload: serde_json::Value) {
        self.bus.publish(
            &state.id,
            EventDraft::from_worker(kind, worker).with_payload(payload),
        );
    }

    /// Call the reasoner on behalf of a worker: emits the thinking event,
    /// folds token usage and cost into the ledger, and hands back the raw
    /// JSON for normalization.
    pub async fn reason(
        &self,
        state: &mut MigrationState,
        worker: WorkerKind,
        task: TaskKind,
        input: serde_json::Value,
    ) -> ReasonerResult<serde_json::Value> {
        self.publish(
            state,
            worker,
            EventKind::WorkerThinking,
            serde_json::json!({ "task": task.to_string() }),
        );
        if self.cancel.is_cancelled() {
            return Err(ReasonerError::Unavailable("canceled".into()));
        }
        let reply = self.reasoner.reason(task, input).await?;
        if self.cancel.is_cancelled() {
            // The workflow is being torn down; drop the reply.
            return Err(ReasonerError::Unavailable("canceled".into()));
        }
        state.cost_accum.record(
            worker,
            reply.usage.input_tokens,
            reply.usage.output_tokens,
            reply.cost_usd,
        );
        Ok(reply.json)
    }
}
