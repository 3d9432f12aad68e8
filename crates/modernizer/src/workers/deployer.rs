//! Deployer worker: branch, commit, pull request.
//!
//! Runs only after a validation came back clean. Pushes the mutated
//! manifest to a timestamped branch and opens a PR whose body the
//! reasoner composes; a dead reasoner degrades to a deterministic
//! template. Gateway failures are retried with backoff when transient
//! and abort the deployment otherwise.

use std::time::Duration;

use chrono::Utc;
use modernizer_core::reasoner::normalize_deploy_message;
use modernizer_core::retry::gateway_with_backoff;
use modernizer_core::validation::manifest;
use modernizer_core::{
    DeploymentRecord, EventKind, FileSet, GatewayError, MigrationError, MigrationPlan,
    MigrationResult, MigrationSource, MigrationState, PlanAction, TaskKind, ValidationOutcome,
    WorkerKind,
};
use tracing::{info, warn};

use super::WorkerContext;

const GATEWAY_RETRIES: u32 = 3;
const GATEWAY_BACKOFF: Duration = Duration::from_secs(2);

pub struct Deployer;

impl Deployer {
    pub async fn run(ctx: &WorkerContext, state: &mut MigrationState) -> MigrationResult<()> {
        let plan = state
            .plan
            .clone()
            .ok_or_else(|| MigrationError::Internal(anyhow::anyhow!("deployer needs a plan")))?;
        let outcome = state.outcome.clone().ok_or_else(|| {
            MigrationError::Internal(anyhow::anyhow!("deployer needs a validation outcome"))
        })?;

        let base_branch = match &state.source {
            MigrationSource::Git { branch, .. } => branch.clone(),
            MigrationSource::Local { .. } => "main".to_string(),
        };

        // Branch name: upgrade/dependencies-YYYYMMDD, suffixed -001.. on
        // collision with an earlier run the same day.
        let branch = create_branch_with_suffix(ctx, &base_branch).await?;

        let manifest_rel = state.project_type.manifest_path();
        let manifest_bytes = tokio::fs::read(state.project_root.join(manifest_rel))
            .await
            .map_err(|e| MigrationError::Internal(anyhow::anyhow!("manifest unreadable: {e}")))?;
        let mutated = manifest::apply_plan(state.project_type, &manifest_bytes, &plan)
            .map_err(|e| MigrationError::Internal(anyhow::anyhow!("manifest mutation failed: {e}")))?;

        let mut files = FileSet::new();
        files.insert(manifest_rel.to_string(), mutated);

        let commit_message = commit_message(&plan);
        ctx.publish(
            state,
            WorkerKind::Deployer,
            EventKind::ToolUse,
            serde_json::json!({ "tool": "repo_push", "branch": &branch, "files": files.len() }),
        );
        gateway_with_backoff("push_files", GATEWAY_RETRIES, GATEWAY_BACKOFF, || {
            ctx.gateway.push_files(&branch, files.clone(), &commit_message)
        })
        .await
        .map_err(map_gateway)?;

        // PR body: reasoner first, deterministic template on any failure.
        let (title, body) = match ctx
            .reason(
                state,
                WorkerKind::Deployer,
                TaskKind::DeployMessage,
                serde_json::json!({ "plan": &plan, "outcome": &outcome }),
            )
            .await
            .and_then(|json| normalize_deploy_message(&json))
        {
            Ok(message) => message,
            Err(e) => {
                warn!(migration_id = %state.id, error = %e, "using templated PR body");
                state.record_error("reasoner_unavailable", &e);
                templated_message(&plan, &outcome)
            }
        };

        let pr_url = gateway_with_backoff("open_pr", GATEWAY_RETRIES, GATEWAY_BACKOFF, || {
            ctx.gateway
                .open_pull_request(&title, &body, &branch, &base_branch)
        })
        .await
        .map_err(map_gateway)?;

        info!(migration_id = %state.id, branch = %branch, pr_url = %pr_url, "pull request opened");
        state.deployment = Some(DeploymentRecord {
            branch_name: branch,
            commit_message,
            pr_url: pr_url.clone(),
        });
        ctx.publish(
            state,
            WorkerKind::Deployer,
            EventKind::WorkerDone,
            serde_json::json!({ "pr_url": pr_url }),
        );
        Ok(())
    }
}

async fn create_branch_with_suffix(
    ctx: &WorkerContext,
    base_branch: &str,
) -> MigrationResult<String> {
    let stem = format!("upgrade/dependencies-{}", Utc::now().format("%Y%m%d"));
    let mut candidates = vec![stem.clone()];
    for n in 1..=3 {
        candidates.push(format!("{stem}-{n:03}"));
    }

    for candidate in &candidates {
        let result = gateway_with_backoff("create_branch", GATEWAY_RETRIES, GATEWAY_BACKOFF, || {
            ctx.gateway.create_branch(candidate, base_branch)
        })
        .await;
        match result {
            Ok(()) => return Ok(candidate.clone()),
            Err(GatewayError::Conflict(_)) => continue,
            Err(e) => return Err(map_gateway(e)),
        }
    }
    Err(MigrationError::GatewayPermanent(format!(
        "no free branch name under {stem}"
    )))
}

fn map_gateway(error: GatewayError) -> MigrationError {
    match error {
        GatewayError::Transient(detail) => MigrationError::GatewayTransient(detail),
        other => MigrationError::GatewayPermanent(other.to_string()),
    }
}

fn commit_message(plan: &MigrationPlan) -> String {
    let upgraded: Vec<String> = plan
        .dependencies
        .iter()
        .filter(|(_, c)| c.action == PlanAction::Upgrade && c.target_version != c.current_version)
        .map(|(name, c)| format!("{name} {} -> {}", c.current_version, c.target_version))
        .collect();
    if upgraded.is_empty() {
        "chore(deps): automated dependency maintenance".to_string()
    } else {
        format!("chore(deps): upgrade {}", upgraded.join(", "))
    }
}

/// Deterministic PR message used when the reasoner is unavailable.
fn templated_message(plan: &MigrationPlan, outcome: &ValidationOutcome) -> (String, String) {
    let mut body = String::from("## Automated dependency upgrade\n\n");

    body.push_str("| Package | From | To | Risk |\n|---|---|---|---|\n");
    for (name, change) in &plan.dependencies {
        if change.action == PlanAction::Keep {
            continue;
        }
        body.push_str(&format!(
            "| {name} | {} | {} | {} |\n",
            if change.current_version.is_empty() {
                "—"
            } else {
                &change.current_version
            },
            if change.action == PlanAction::Remove {
                "removed"
            } else {
                &change.target_version
            },
            change.risk
        ));
    }

    body.push_str("\n## Validation\n\n");
    body.push_str(&format!(
        "- install: {}\n- start: {}\n- health: {}\n- versions verified: {}\n",
        check(outcome.install_ok),
        check(outcome.start_ok),
        check(outcome.health_ok),
        check(outcome.versions_match),
    ));
    if outcome.tests_found {
        body.push_str(&format!(
            "- tests: {} ({})\n",
            check(outcome.tests_ok),
            outcome.test_summary
        ));
    } else {
        body.push_str("- tests: none found\n");
    }

    for (_, change) in plan.dependencies.iter() {
        for breaking in &change.breaking_changes {
            body.push_str(&format!(
                "\n> Breaking in {}: {}\n",
                breaking.version, breaking.note
            ));
        }
    }

    ("Automated dependency upgrade".to_string(), body)
}

fn check(flag: bool) -> &'static str {
    if flag {
        "pass"
    } else {
        "fail"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use modernizer_core::{DependencyChange, Risk};
    use std::collections::BTreeMap;

    fn sample_plan() -> MigrationPlan {
        let mut plan = MigrationPlan::noop(&BTreeMap::new());
        plan.dependencies.insert(
            "express".into(),
            DependencyChange {
                current_version: "4.16.0".into(),
                target_version: "4.19.2".into(),
                action: PlanAction::Upgrade,
                risk: Risk::Medium,
                breaking_changes: Vec::new(),
            },
        );
        plan
    }

    #[test]
    fn commit_message_lists_upgrades() {
        let message = commit_message(&sample_plan());
        assert!(message.contains("express 4.16.0 -> 4.19.2"));
    }

    #[test]
    fn commit_message_for_noop_plan() {
        let plan = MigrationPlan::noop(&BTreeMap::new());
        assert_eq!(
            commit_message(&plan),
            "chore(deps): automated dependency maintenance"
        );
    }

    #[test]
    fn templated_body_covers_plan_and_outcome() {
        let outcome = ValidationOutcome {
            install_ok: true,
            start_ok: true,
            health_ok: true,
            tests_found: true,
            tests_ok: true,
            versions_match: true,
            test_summary: "32 passed, 32 total".into(),
            ..Default::default()
        };
        let (title, body) = templated_message(&sample_plan(), &outcome);
        assert_eq!(title, "Automated dependency upgrade");
        assert!(body.contains("| express | 4.16.0 | 4.19.2 | medium |"));
        assert!(body.contains("32 passed, 32 total"));
    }
}
