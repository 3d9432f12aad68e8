//! Validator worker: drives one container validation attempt.
//!
//! A thin bridge between the engine loop and the validation engine: it
//! forwards stage completions onto the event bus, persists stage logs,
//! and records the outcome. It never retries; retry is a workflow-level
//! decision owned by the analyzer loop.

use modernizer_core::validation::{StageObserver, ValidationEngine, ValidationRequest};
use modernizer_core::{
    EventDraft, EventKind, MigrationResult, MigrationState, SharedEventBus, WorkerKind,
};
use tracing::warn;

use super::WorkerContext;

/// Forwards validation stage completions to the event bus.
struct BusStageObserver {
    bus: SharedEventBus,
    migration_id: String,
}

impl StageObserver for BusStageObserver {
    fn stage_done(&self, stage: &str, ok: bool, detail: &str) {
        self.bus.publish(
            &self.migration_id,
            EventDraft::from_worker(EventKind::StageResult, WorkerKind::Validator).with_payload(
                serde_json::json!({ "stage": stage, "ok": ok, "detail": detail }),
            ),
        );
    }
}

pub struct Validator;

impl Validator {
    pub async fn run(ctx: &WorkerContext, state: &mut MigrationState) -> MigrationResult<()> {
        let engine = ValidationEngine::new(ctx.runtime.clone(), ctx.config.validation());
        let observer = BusStageObserver {
            bus: ctx.bus.clone(),
            migration_id: state.id.clone(),
        };

        let outcome = engine
            .validate(
                ValidationRequest {
                    migration_id: &state.id,
                    project_root: &state.project_root,
                    project_type: state.project_type,
                    plan: state.plan.as_ref(),
                },
                &observer,
                &ctx.cancel,
            )
            .await;

        for (stage, log) in &outcome.logs {
            if let Err(e) = ctx.store.write_stage_log(&state.id, stage, log) {
                warn!(migration_id = %state.id, stage, error = %e, "failed to persist stage log");
            }
        }

        let ok = outcome.ok();
        if !ok {
            for error in &outcome.errors {
                state.errors.push(format!("validation: {error}"));
            }
        }

        ctx.publish(
            state,
            WorkerKind::Validator,
            EventKind::WorkerDone,
            serde_json::json!({
                "ok": ok,
                "container": &outcome.container_name,
                "install_ok": outcome.install_ok,
                "start_ok": outcome.start_ok,
                "health_ok": outcome.health_ok,
                "tests_found": outcome.tests_found,
                "tests_ok": outcome.tests_ok,
                "versions_match": outcome.versions_match,
                "test_summary": &outcome.test_summary,
            }),
        );

        state.outcome = Some(outcome);
        Ok(())
    }
}
