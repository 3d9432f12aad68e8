//! Analyzer worker: categorize a failed validation and patch the plan.
//!
//! A deterministic pattern table runs first, ordered most-specific to
//! least-specific over the lowercased logs. The reasoner's fixes, when it
//! answers, are appended and re-ranked by confidence, but the pattern
//! result always survives as the baseline: a dead reasoner degrades
//! quality, never capability. The single highest-confidence applicable
//! fix is applied to the plan in place; the engine then re-validates.

use modernizer_core::reasoner::normalize_diagnosis;
use modernizer_core::{
    ErrorDiagnosis, EventKind, FailureCategory, MigrationResult, MigrationState, PlanAction,
    PlanPatch, ReasonerError, SuggestedFix, TaskKind, ValidationOutcome, WorkerKind,
};
use regex::Regex;
use std::sync::OnceLock;
use tracing::{info, warn};

use super::WorkerContext;

/// What the analyzer concluded; routes the next transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnalyzerVerdict {
    /// A patch was applied; the plan is worth another validation.
    PatchApplied,
    /// Nothing applicable; the workflow escalates to a human.
    NoApplicablePatch,
}

fn node_module_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"cannot find module '([^']+)'").unwrap())
}

fn python_module_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"no module named '?([a-zA-Z0-9_.\-]+)'?").unwrap())
}

pub struct Analyzer;

impl Analyzer {
    pub async fn run(
        ctx: &WorkerContext,
        state: &mut MigrationState,
    ) -> MigrationResult<AnalyzerVerdict> {
        let Some(outcome) = state.outcome.clone() else {
            // Nothing to analyze; treat as undiagnosable.
            state.record_error("internal", "analyzer invoked without an outcome");
            return Ok(AnalyzerVerdict::NoApplicablePatch);
        };

        let mut diagnosis = pattern_diagnosis(&outcome);
        resolve_pin_target(state, &mut diagnosis);

        // The reasoner sees the same evidence; its fixes join the pool.
        let input = serde_json::json!({
            "errors": &outcome.errors,
            "logs": &outcome.logs,
            "plan": &state.plan,
            "project_type": state.project_type,
        });
        match ctx
            .reason(state, WorkerKind::Analyzer, TaskKind::Diagnose, input)
            .await
            .and_then(|json| normalize_diagnosis(&json))
        {
            Ok(reasoned) => {
                diagnosis.fixes.extend(reasoned.fixes);
                diagnosis.rank_fixes();
            }
            Err(e) => {
                let kind = match &e {
                    ReasonerError::Malformed(_) => "reasoner_malformed",
                    ReasonerError::Unavailable(_) => "reasoner_unavailable",
                };
                warn!(migration_id = %state.id, error = %e, "diagnosing with pattern table only");
                state.record_error(kind, &e);
            }
        }

        let verdict = match diagnosis.best_applicable_fix().cloned() {
            Some(fix) => {
                let applied = state
                    .plan
                    .as_mut()
                    .map(|plan| fix.patch.apply(plan))
                    .unwrap_or(false);
                if applied {
                    info!(
                        migration_id = %state.id,
                        category = %diagnosis.category,
                        fix = %fix.description,
                        confidence = fix.confidence,
                        "applied plan patch"
                    );
                    AnalyzerVerdict::PatchApplied
                } else {
                    AnalyzerVerdict::NoApplicablePatch
                }
            }
            None => AnalyzerVerdict::NoApplicablePatch,
        };

        ctx.publish(
            state,
            WorkerKind::Analyzer,
            EventKind::WorkerDone,
            serde_json::json!({
                "category": diagnosis.category,
                "root_cause": &diagnosis.root_cause,
                "fixes": diagnosis.fixes.len(),
                "patch_applied": verdict == AnalyzerVerdict::PatchApplied,
            }),
        );

        state.diagnosis = Some(diagnosis);
        Ok(verdict)
    }
}

/// Deterministic categorization over lowercased log text. Order matters:
/// most-specific substrings first. `peer dep` is matched as a phrase so
/// the `per`/`peer` fragment inside unrelated words (or `TypeError`)
/// never misfires, and `missing:` ranks below `cannot find module`.
fn pattern_diagnosis(outcome: &ValidationOutcome) -> ErrorDiagnosis {
    let mut haystack = String::new();
    for error in &outcome.errors {
        haystack.push_str(&error.to_lowercase());
        haystack.push('\n');
    }
    for log in outcome.logs.values() {
        haystack.push_str(&log.to_lowercase());
        haystack.push('\n');
    }

    let (category, root_cause) = categorize(&haystack);
    let fixes = heuristic_fixes(category, &haystack);

    let mut diagnosis = ErrorDiagnosis {
        root_cause,
        category,
        fixes,
    };
    diagnosis.rank_fixes();
    diagnosis
}

fn categorize(haystack: &str) -> (FailureCategory, String) {
    if haystack.contains("cannot find module") {
        let module = node_module_re()
            .captures(haystack)
            .map(|c| c[1].to_string())
            .unwrap_or_else(|| "unknown module".into());
        return (
            FailureCategory::MissingDep,
            format!("module '{module}' is not installed"),
        );
    }
    if haystack.contains("modulenotfounderror") || haystack.contains("no module named") {
        let module = python_module_re()
            .captures(haystack)
            .map(|c| c[1].to_string())
            .unwrap_or_else(|| "unknown module".into());
        return (
            FailureCategory::MissingDep,
            format!("module '{module}' is not installed"),
        );
    }
    if haystack.contains("typeerror") && haystack.contains("is not a function") {
        return (
            FailureCategory::ApiBreaking,
            "a call site relies on an API removed or renamed by the upgrade".into(),
        );
    }
    if haystack.contains("peer dep") {
        return (
            FailureCategory::PeerConflict,
            "peer dependency requirements conflict with the planned versions".into(),
        );
    }
    if haystack.contains("incompatible with") {
        return (
            FailureCategory::VersionConflict,
            "two planned versions are mutually incompatible".into(),
        );
    }
    if haystack.contains("missing:") {
        return (
            FailureCategory::MissingDep,
            "the resolver reports a missing package".into(),
        );
    }
    (
        FailureCategory::Unknown,
        "no known failure pattern matched".into(),
    )
}

fn heuristic_fixes(category: FailureCategory, haystack: &str) -> Vec<SuggestedFix> {
    match category {
        FailureCategory::MissingDep => {
            let module = node_module_re()
                .captures(haystack)
                .or_else(|| python_module_re().captures(haystack))
                .map(|c| c[1].to_string());
            match module {
                Some(module) => {
                    // `dotenv/config` style specifiers name package `dotenv`.
                    let package = module.split('/').next().unwrap_or(&module).to_string();
                    vec![SuggestedFix {
                        description: format!("add '{package}' as an explicit dependency"),
                        confidence: 0.6,
                        patch: PlanPatch::AddDependency {
                            name: package,
                            version: "latest".into(),
                        },
                    }]
                }
                None => Vec::new(),
            }
        }
        FailureCategory::ApiBreaking
        | FailureCategory::PeerConflict
        | FailureCategory::VersionConflict => vec![SuggestedFix {
            description: "pin the riskiest upgraded dependency back to its current version".into(),
            confidence: 0.4,
            patch: PlanPatch::Noop, // replaced with a concrete target below
        }],
        FailureCategory::Config | FailureCategory::Unknown => Vec::new(),
    }
}

/// Resolve the placeholder pin fix against the actual plan: pick the
/// highest-risk dependency that was really being upgraded.
pub(crate) fn resolve_pin_target(
    state: &MigrationState,
    diagnosis: &mut ErrorDiagnosis,
) {
    let Some(plan) = &state.plan else {
        return;
    };
    let candidate = plan
        .dependencies
        .iter()
        .filter(|(_, c)| c.action == PlanAction::Upgrade && c.target_version != c.current_version)
        .max_by_key(|(_, c)| c.risk)
        .map(|(name, _)| name.clone());

    let Some(name) = candidate else {
        return;
    };
    for fix in &mut diagnosis.fixes {
        if fix.patch == PlanPatch::Noop && fix.description.contains("pin the riskiest") {
            fix.patch = PlanPatch::PinCurrent { name: name.clone() };
        }
    }
}
