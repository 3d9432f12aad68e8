//! Provider reply normalization.
//!
//! Different providers shape the "same" JSON differently: camelCase keys,
//! abbreviated names, `phase1..phaseN` keys instead of an array. All of
//! that is absorbed here, once, into the canonical records. Worker code
//! never sees a provider-specific key.

use std::collections::BTreeMap;

use regex::Regex;
use serde_json::Value;
use std::sync::OnceLock;

use super::{ReasonerError, ReasonerResult};
use crate::state::types::{
    BreakingChange, DependencyChange, ErrorDiagnosis, FailureCategory, MigrationPlan, PlanAction,
    PlanPatch, PlanPhase, Risk, SuggestedFix,
};

fn phase_key_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^phase[_\s]?(\d+)$").unwrap())
}

/// First present key among the accepted variants.
fn pick<'a>(value: &'a Value, keys: &[&str]) -> Option<&'a Value> {
    keys.iter().find_map(|k| value.get(*k))
}

fn pick_str(value: &Value, keys: &[&str]) -> Option<String> {
    pick(value, keys).and_then(Value::as_str).map(str::to_string)
}

fn pick_f64(value: &Value, keys: &[&str]) -> Option<f64> {
    let found = pick(value, keys)?;
    found
        .as_f64()
        .or_else(|| found.as_str().and_then(|s| s.parse().ok()))
}

fn parse_action(raw: Option<&str>, current: &str, target: &str) -> PlanAction {
    match raw.map(str::to_lowercase).as_deref() {
        Some("upgrade") | Some("update") => PlanAction::Upgrade,
        Some("remove") | Some("delete") | Some("drop") => PlanAction::Remove,
        Some("add") | Some("install") => PlanAction::Add,
        Some("keep") | Some("hold") | Some("none") => PlanAction::Keep,
        // Absent or unrecognized: infer from the version delta.
        _ if current.is_empty() => PlanAction::Add,
        _ if current != target => PlanAction::Upgrade,
        _ => PlanAction::Keep,
    }
}

fn parse_risk(raw: Option<&str>) -> Risk {
    match raw.map(str::to_lowercase).as_deref() {
        Some("high") | Some("critical") => Risk::High,
        Some("medium") | Some("moderate") => Risk::Medium,
        _ => Risk::Low,
    }
}

fn parse_category(raw: Option<&str>) -> FailureCategory {
    match raw.map(|s| s.to_lowercase().replace(['-', ' '], "_")).as_deref() {
        Some("missing_dep") | Some("missing_dependency") | Some("missing_module") => {
            FailureCategory::MissingDep
        }
        Some("api_breaking") | Some("breaking_change") | Some("api_change") => {
            FailureCategory::ApiBreaking
        }
        Some("peer_conflict") | Some("peer_dependency") => FailureCategory::PeerConflict,
        Some("config") | Some("configuration") => FailureCategory::Config,
        Some("version_conflict") | Some("incompatible_versions") => {
            FailureCategory::VersionConflict
        }
        _ => FailureCategory::Unknown,
    }
}

fn parse_breaking_changes(value: Option<&Value>) -> Vec<BreakingChange> {
    let Some(items) = value.and_then(Value::as_array) else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(|item| {
            Some(BreakingChange {
                version: pick_str(item, &["version", "in_version", "since"])?,
                severity: parse_risk(
                    pick_str(item, &["severity", "risk", "level"]).as_deref(),
                ),
                note: pick_str(item, &["note", "description", "detail", "summary"])
                    .unwrap_or_default(),
            })
        })
        .collect()
}

/// Collapse `phases: [...]` or sibling `phase1..phaseN` keys into an
/// ordered list.
fn collect_phases(root: &Value) -> Vec<Value> {
    if let Some(array) = pick(root, &["phases", "rollout", "steps"]).and_then(Value::as_array) {
        return array.clone();
    }

    // phase1..phaseN either at the top level or under a "phases" object.
    let candidates = pick(root, &["phases"])
        .and_then(Value::as_object)
        .or_else(|| root.as_object());
    let Some(object) = candidates else {
        return Vec::new();
    };

    let mut numbered: Vec<(u64, Value)> = object
        .iter()
        .filter_map(|(key, value)| {
            let lowered = key.to_lowercase();
            let caps = phase_key_re().captures(&lowered)?;
            let index: u64 = caps[1].parse().ok()?;
            Some((index, value.clone()))
        })
        .collect();
    numbered.sort_by_key(|(index, _)| *index);
    numbered.into_iter().map(|(_, value)| value).collect()
}

fn normalize_phase(value: &Value) -> PlanPhase {
    // Some providers emit a phase as a bare string name.
    if let Some(name) = value.as_str() {
        return PlanPhase {
            name: name.to_string(),
            dependency_names: Vec::new(),
            estimated_time: String::new(),
            rollback_note: String::new(),
        };
    }
    PlanPhase {
        name: pick_str(value, &["name", "title", "phase"]).unwrap_or_else(|| "phase".into()),
        dependency_names: pick(value, &["dependency_names", "dependencies", "deps", "packages"])
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default(),
        estimated_time: pick_str(value, &["estimated_time", "estimatedTime", "time", "duration"])
            .unwrap_or_default(),
        rollback_note: pick_str(value, &["rollback_note", "rollbackNote", "rollback"])
            .unwrap_or_default(),
    }
}

/// Normalize a planning reply into a `MigrationPlan`.
pub fn normalize_plan(reply: &Value) -> ReasonerResult<MigrationPlan> {
    let deps_value = pick(reply, &["dependencies", "deps", "packages"])
        .and_then(Value::as_object)
        .ok_or_else(|| ReasonerError::Malformed("plan reply has no dependencies object".into()))?;

    let mut dependencies = BTreeMap::new();
    for (name, entry) in deps_value {
        let current = pick_str(entry, &["current_version", "currentVersion", "current", "from"])
            .unwrap_or_default();
        let target = pick_str(entry, &["target_version", "targetVersion", "target", "to"])
            .unwrap_or_else(|| current.clone());
        let action = parse_action(
            pick_str(entry, &["action", "operation", "op"]).as_deref(),
            &current,
            &target,
        );
        let risk = parse_risk(pick_str(entry, &["risk", "risk_level", "riskLevel"]).as_deref());
        dependencies.insert(
            name.clone(),
            DependencyChange {
                current_version: current,
                target_version: target,
                action,
                risk,
                breaking_changes: parse_breaking_changes(pick(
                    entry,
                    &["breaking_changes", "breakingChanges", "breaking"],
                )),
            },
        );
    }

    let mut phases: Vec<PlanPhase> = collect_phases(reply).iter().map(normalize_phase).collect();
    if phases.is_empty() {
        phases.push(PlanPhase {
            name: "all upgrades".into(),
            dependency_names: dependencies.keys().cloned().collect(),
            estimated_time: String::new(),
            rollback_note: String::new(),
        });
    }

    let mut plan = MigrationPlan {
        dependencies,
        phases,
        overall_risk: Risk::Low,
    };
    plan.recompute_overall_risk();
    Ok(plan)
}

fn normalize_patch(value: Option<&Value>) -> PlanPatch {
    let Some(patch) = value else {
        return PlanPatch::Noop;
    };
    let op = pick_str(patch, &["op", "action", "type", "operation"])
        .map(|s| s.to_lowercase().replace(['-', ' '], "_"))
        .unwrap_or_default();
    let name = pick_str(patch, &["name", "package", "dependency"]).unwrap_or_default();
    let version =
        pick_str(patch, &["version", "target_version", "targetVersion", "target"]).unwrap_or_default();

    match op.as_str() {
        "set_target" | "set_version" | "change_version" | "retarget" if !name.is_empty() => {
            PlanPatch::SetTarget { name, version }
        }
        "add_dependency" | "add" | "insert" if !name.is_empty() => {
            PlanPatch::AddDependency { name, version }
        }
        "remove_dependency" | "remove" | "delete" if !name.is_empty() => {
            PlanPatch::RemoveDependency { name }
        }
        "pin_current" | "pin" | "downgrade" if !name.is_empty() => PlanPatch::PinCurrent { name },
        _ => PlanPatch::Noop,
    }
}

/// Normalize a diagnosis reply into an `ErrorDiagnosis`.
pub fn normalize_diagnosis(reply: &Value) -> ReasonerResult<ErrorDiagnosis> {
    let root_cause = pick_str(reply, &["root_cause", "rootCause", "cause", "summary"])
        .ok_or_else(|| ReasonerError::Malformed("diagnosis reply has no root_cause".into()))?;

    let fixes = pick(reply, &["fixes", "suggestions", "remedies"])
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .map(|item| SuggestedFix {
                    description: pick_str(item, &["description", "desc", "fix", "summary"])
                        .unwrap_or_default(),
                    confidence: pick_f64(item, &["confidence", "score", "probability"])
                        .unwrap_or(0.0),
                    patch: normalize_patch(pick(item, &["patch", "plan_patch", "planPatch"])),
                })
                .collect()
        })
        .unwrap_or_default();

    let mut diagnosis = ErrorDiagnosis {
        root_cause,
        category: parse_category(
            pick_str(reply, &["category", "kind", "error_category"]).as_deref(),
        ),
        fixes,
    };
    diagnosis.rank_fixes();
    Ok(diagnosis)
}

/// Normalize a deploy-message reply into `(title, body)`.
pub fn normalize_deploy_message(reply: &Value) -> ReasonerResult<(String, String)> {
    let body = pick_str(reply, &["body", "message", "pr_body", "description"])
        .ok_or_else(|| ReasonerError::Malformed("deploy reply has no body".into()))?;
    let title = pick_str(reply, &["title", "name", "subject"])
        .unwrap_or_else(|| "Automated dependency upgrade".into());
    Ok((title, body))
}
