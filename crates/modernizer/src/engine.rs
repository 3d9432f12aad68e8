//! Workflow engine: the only writer of `MigrationState.phase`.
//!
//! Drives one migration from its current phase to a terminal one,
//! invoking workers in an order that depends on runtime outcomes:
//!
//! ```text
//! Planning → Validating → Deploying → Succeeded
//!               ↑  ↓ (not ok, budget left)
//!             Analyzing ──(no patch / budget spent)──→ Escalated
//! ```
//!
//! Every transition is committed to the checkpoint store before the next
//! worker runs, so a crash resumes from the last committed phase. Workers
//! are idempotent with respect to their own outputs, which makes the
//! resume re-entry safe.

use modernizer_core::{
    EventDraft, EventKind, MigrationError, MigrationState, Phase,
};
use tracing::{error, info, warn};

use crate::machine::PhaseMachine;
use crate::telemetry;
use crate::workers::{Analyzer, AnalyzerVerdict, Deployer, Planner, Validator, WorkerContext};

/// Per-worker deadline multipliers are derived from the configured call
/// timeouts; these are the slack seconds added on top.
const WORKER_DEADLINE_SLACK_SECS: u64 = 60;

pub struct WorkflowEngine {
    ctx: WorkerContext,
}

impl WorkflowEngine {
    pub fn new(ctx: WorkerContext) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &WorkerContext {
        &self.ctx
    }

    /// Run the workflow to a terminal phase and return the final state.
    /// Never panics out: every failure mode folds into `Failed`.
    pub async fn run(&self, mut state: MigrationState) -> MigrationState {
        let mut machine = PhaseMachine::starting_at(state.phase);
        let resumed = state.phase != Phase::Planning
            || state.plan.is_some()
            || !state.errors.is_empty();

        self.ctx.bus.publish(
            &state.id,
            EventDraft::new(EventKind::WorkflowStart).with_payload(serde_json::json!({
                "project_type": state.project_type,
                "retries_max": state.retries_max,
                "resumed": resumed,
            })),
        );

        loop {
            if self.ctx.cancel.is_cancelled() {
                self.fail(&mut state, &mut machine, MigrationError::Canceled("shutdown".into()));
                break;
            }

            let phase = machine.current();
            if phase.is_terminal() {
                break;
            }
            self.ctx.bus.publish(
                &state.id,
                EventDraft::new(EventKind::PhaseEnter)
                    .with_payload(serde_json::json!({ "phase": phase })),
            );

            match phase {
                Phase::Planning => self.step_planning(&mut state, &mut machine).await,
                Phase::Validating => self.step_validating(&mut state, &mut machine).await,
                Phase::Analyzing => self.step_analyzing(&mut state, &mut machine).await,
                Phase::Deploying => self.step_deploying(&mut state, &mut machine).await,
                _ => unreachable!("terminal phases exit the loop above"),
            }
        }

        telemetry::append_run(&self.ctx.config.persist_root, &state, machine.transitions());
        state
    }

    async fn step_planning(&self, state: &mut MigrationState, machine: &mut PhaseMachine) {
        let deadline = self.reasoner_budget() + std::time::Duration::from_secs(WORKER_DEADLINE_SLACK_SECS);
        let result = tokio::select! {
            _ = self.ctx.cancel.cancelled() => Err(MigrationError::Canceled("cancel requested".into())),
            r = tokio::time::timeout(deadline, Planner::run(&self.ctx, state)) => match r {
                Ok(inner) => inner,
                Err(_) => Err(MigrationError::DeadlineExceeded {
                    stage: "planning".into(),
                    seconds: deadline.as_secs(),
                }),
            },
        };

        match result {
            Ok(()) => self.advance(state, machine, Phase::Validating, "plan produced"),
            Err(e) => self.fail(state, machine, e),
        }
    }

    async fn step_validating(&self, state: &mut MigrationState, machine: &mut PhaseMachine) {
        // No select-abort here: the validator owns a container and must
        // reach its teardown stage even when cancellation fires. It polls
        // the token between stages itself.
        if let Err(e) = Validator::run(&self.ctx, state).await {
            self.fail(state, machine, e);
            return;
        }

        if self.ctx.cancel.is_cancelled() {
            self.fail(state, machine, MigrationError::Canceled("cancel requested".into()));
            return;
        }

        let ok = state.outcome.as_ref().map(|o| o.ok()).unwrap_or(false);
        if ok {
            self.advance(state, machine, Phase::Deploying, "outcome ok");
        } else if state.retries_used < state.retries_max
            || (state.retries_max == 0 && state.retries_used == 0)
        {
            // A zero budget still earns one analyzing visit so the
            // escalation carries a diagnosis.
            self.advance(state, machine, Phase::Analyzing, "outcome not ok");
        } else {
            self.terminal(state, machine, Phase::Escalated, "retry budget exhausted");
        }
    }

    async fn step_analyzing(&self, state: &mut MigrationState, machine: &mut PhaseMachine) {
        let deadline = self.reasoner_budget() + std::time::Duration::from_secs(WORKER_DEADLINE_SLACK_SECS);
        let result = tokio::select! {
            _ = self.ctx.cancel.cancelled() => Err(MigrationError::Canceled("cancel requested".into())),
            r = tokio::time::timeout(deadline, Analyzer::run(&self.ctx, state)) => match r {
                Ok(inner) => inner,
                Err(_) => Err(MigrationError::DeadlineExceeded {
                    stage: "analyzing".into(),
                    seconds: deadline.as_secs(),
                }),
            },
        };

        match result {
            Ok(AnalyzerVerdict::PatchApplied) if state.retries_used < state.retries_max => {
                // The single place the retry counter moves.
                state.retries_used += 1;
                self.ctx.bus.publish(
                    &state.id,
                    EventDraft::new(EventKind::RetryScheduled).with_payload(serde_json::json!({
                        "retries_used": state.retries_used,
                        "retries_max": state.retries_max,
                    })),
                );
                self.advance(state, machine, Phase::Validating, "plan patch applied");
            }
            Ok(AnalyzerVerdict::PatchApplied) => {
                self.terminal(state, machine, Phase::Escalated, "patch found but budget spent");
            }
            Ok(AnalyzerVerdict::NoApplicablePatch) => {
                self.terminal(state, machine, Phase::Escalated, "no applicable patch");
            }
            Err(e) => self.fail(state, machine, e),
        }
    }

    async fn step_deploying(&self, state: &mut MigrationState, machine: &mut PhaseMachine) {
        let result = tokio::select! {
            _ = self.ctx.cancel.cancelled() => Err(MigrationError::Canceled("cancel requested".into())),
            r = Deployer::run(&self.ctx, state) => r,
        };

        match result {
            Ok(()) => self.terminal(state, machine, Phase::Succeeded, "pr opened"),
            Err(e) => self.fail(state, machine, e),
        }
    }

    /// Advance to a live phase and checkpoint before the next worker runs.
    fn advance(&self, state: &mut MigrationState, machine: &mut PhaseMachine, to: Phase, reason: &str) {
        if let Err(e) = machine.advance(to, state.retries_used, Some(reason)) {
            // A routing bug, not a workflow condition. Fail loudly.
            error!(migration_id = %state.id, error = %e, "illegal transition");
            self.fail(state, machine, MigrationError::Internal(anyhow::anyhow!(e.to_string())));
            return;
        }
        state.phase = to;
        self.checkpoint(state);
    }

    /// Enter a terminal phase exactly once, checkpoint, emit the terminal
    /// event.
    fn terminal(&self, state: &mut MigrationState, machine: &mut PhaseMachine, to: Phase, reason: &str) {
        debug_assert!(to.is_terminal());
        if machine.current().is_terminal() {
            warn!(migration_id = %state.id, "terminal phase already set; ignoring");
            return;
        }
        if let Err(e) = machine.advance(to, state.retries_used, Some(reason)) {
            error!(migration_id = %state.id, error = %e, "illegal terminal transition");
            return;
        }
        state.phase = to;
        state.finished_at = Some(chrono::Utc::now());
        self.checkpoint(state);

        let kind = match to {
            Phase::Succeeded => EventKind::Succeeded,
            Phase::Escalated => EventKind::Escalated,
            _ => EventKind::Failed,
        };
        self.ctx.bus.publish(
            &state.id,
            EventDraft::new(kind).with_payload(serde_json::json!({
                "reason": reason,
                "retries_used": state.retries_used,
                "errors": &state.errors,
                "pr_url": state.deployment.as_ref().map(|d| d.pr_url.clone()),
                "cost": state.cost_accum.total(),
            })),
        );
        info!(migration_id = %state.id, phase = %to, reason, "workflow terminal");
    }

    fn fail(&self, state: &mut MigrationState, machine: &mut PhaseMachine, error: MigrationError) {
        state.record_error(error.kind(), &error);
        self.terminal(state, machine, Phase::Failed, error.kind());
    }

    fn checkpoint(&self, state: &MigrationState) {
        if let Err(e) = self.ctx.store.save_state(state) {
            // Losing a checkpoint degrades resumability, not correctness
            // of the in-flight run.
            error!(migration_id = %state.id, error = %e, "checkpoint failed");
        }
    }

    fn reasoner_budget(&self) -> std::time::Duration {
        let per_call = std::time::Duration::from_secs(self.ctx.config.reasoner_timeout_secs);
        // Retries with backoff: 2s, 4s, 8s between calls.
        per_call * (self.ctx.config.reasoner_max_retries + 1) + std::time::Duration::from_secs(14)
    }
}
