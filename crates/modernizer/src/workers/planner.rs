//! Planner worker: manifest in, migration plan out.
//!
//! Reads the dependency manifest (gateway for git sources, local FS
//! otherwise), asks the reasoner for a phased plan, and falls back to a
//! deterministic no-op plan when the reply is missing or malformed, so
//! the workflow always reaches validation. Idempotent: a re-run
//! overwrites any partial plan from a previous attempt.

use anyhow::anyhow;
use modernizer_core::reasoner::normalize_plan;
use modernizer_core::validation::manifest;
use modernizer_core::{
    EventKind, MigrationError, MigrationPlan, MigrationResult, MigrationSource, MigrationState,
    ReasonerError, TaskKind, WorkerKind,
};
use tracing::{info, warn};

use super::WorkerContext;

pub struct Planner;

impl Planner {
    pub async fn run(ctx: &WorkerContext, state: &mut MigrationState) -> MigrationResult<()> {
        let manifest_bytes = read_manifest(ctx, state).await?;

        let current = manifest::parse_dependencies(state.project_type, &manifest_bytes)
            .map_err(|e| MigrationError::Internal(anyhow!("unreadable manifest: {e}")))?;

        let input = serde_json::json!({
            "project_type": state.project_type,
            "manifest": String::from_utf8_lossy(&manifest_bytes),
            "current_versions": &current,
        });

        let plan = match ctx
            .reason(state, WorkerKind::Planner, TaskKind::Plan, input)
            .await
            .and_then(|json| normalize_plan(&json))
        {
            Ok(plan) => {
                info!(
                    migration_id = %state.id,
                    dependencies = plan.dependencies.len(),
                    phases = plan.phases.len(),
                    risk = %plan.overall_risk,
                    "reasoner produced a plan"
                );
                plan
            }
            Err(e) => {
                let kind = match &e {
                    ReasonerError::Malformed(_) => "reasoner_malformed",
                    ReasonerError::Unavailable(_) => "reasoner_unavailable",
                };
                warn!(migration_id = %state.id, error = %e, "falling back to no-op plan");
                state.record_error(kind, &e);
                MigrationPlan::noop(&current)
            }
        };

        // Overwrite wholesale; resume must not merge with a stale plan.
        state.plan = Some(plan);
        ctx.publish(
            state,
            WorkerKind::Planner,
            EventKind::WorkerDone,
            serde_json::json!({
                "dependencies": state.plan.as_ref().map(|p| p.dependencies.len()),
                "overall_risk": state.plan.as_ref().map(|p| p.overall_risk),
            }),
        );
        Ok(())
    }
}

/// Manifest bytes from wherever the source lives. A missing manifest is
/// fatal for the workflow: there is nothing to plan against.
async fn read_manifest(ctx: &WorkerContext, state: &mut MigrationState) -> MigrationResult<Vec<u8>> {
    let rel = state.project_type.manifest_path();
    match &state.source {
        MigrationSource::Git { .. } => {
            ctx.publish(
                state,
                WorkerKind::Planner,
                EventKind::ToolUse,
                serde_json::json!({ "tool": "repo_read", "path": rel }),
            );
            ctx.gateway.read_file(rel).await.map_err(|e| {
                MigrationError::GatewayPermanent(format!("manifest {rel} unreadable: {e}"))
            })
        }
        MigrationSource::Local { .. } => {
            let path = state.project_root.join(rel);
            tokio::fs::read(&path).await.map_err(|e| {
                MigrationError::Internal(anyhow!("manifest {} unreadable: {e}", path.display()))
            })
        }
    }
}
