//! Dependency manifest handling for both project flavors.
//!
//! `package.json` is edited through a serde_json round-trip so unrelated
//! fields (scripts, engines, metadata) survive untouched.
//! `requirements.txt` is rewritten line by line, preserving comments and
//! blank lines. Both writers produce the exact bytes the container must
//! see; the runtime transports them without shell quoting.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::state::types::{MigrationPlan, PlanAction, ProjectType};

#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    #[error("Manifest parse error: {0}")]
    Parse(String),

    #[error("Manifest is not valid UTF-8")]
    Encoding,
}

pub type ManifestResult<T> = Result<T, ManifestError>;

/// Current dependency versions declared by the manifest.
pub fn parse_dependencies(
    project_type: ProjectType,
    bytes: &[u8],
) -> ManifestResult<BTreeMap<String, String>> {
    match project_type {
        ProjectType::Node => parse_node(bytes),
        ProjectType::Python => parse_requirements(bytes),
    }
}

fn parse_node(bytes: &[u8]) -> ManifestResult<BTreeMap<String, String>> {
    let root: Value =
        serde_json::from_slice(bytes).map_err(|e| ManifestError::Parse(e.to_string()))?;
    let mut deps = BTreeMap::new();
    for section in ["dependencies", "devDependencies"] {
        if let Some(map) = root.get(section).and_then(Value::as_object) {
            for (name, version) in map {
                if let Some(v) = version.as_str() {
                    deps.insert(name.clone(), v.to_string());
                }
            }
        }
    }
    Ok(deps)
}

fn parse_requirements(bytes: &[u8]) -> ManifestResult<BTreeMap<String, String>> {
    let text = std::str::from_utf8(bytes).map_err(|_| ManifestError::Encoding)?;
    let mut deps = BTreeMap::new();
    for line in text.lines() {
        if let Some((name, version)) = split_requirement(line) {
            deps.insert(name, version);
        }
    }
    Ok(deps)
}

/// `express==4.19.2` → ("express", "4.19.2"); comments and bare names are
/// skipped (a bare name pins nothing we can verify).
fn split_requirement(line: &str) -> Option<(String, String)> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') || line.starts_with('-') {
        return None;
    }
    for op in ["==", ">=", "<=", "~=", ">", "<"] {
        if let Some((name, version)) = line.split_once(op) {
            return Some((name.trim().to_string(), version.trim().to_string()));
        }
    }
    None
}

/// Apply the plan's mutations and return the manifest bytes the container
/// must end up with.
pub fn apply_plan(
    project_type: ProjectType,
    bytes: &[u8],
    plan: &MigrationPlan,
) -> ManifestResult<Vec<u8>> {
    match project_type {
        ProjectType::Node => apply_node(bytes, plan),
        ProjectType::Python => apply_requirements(bytes, plan),
    }
}

fn apply_node(bytes: &[u8], plan: &MigrationPlan) -> ManifestResult<Vec<u8>> {
    let mut root: Value =
        serde_json::from_slice(bytes).map_err(|e| ManifestError::Parse(e.to_string()))?;

    for (name, change) in &plan.dependencies {
        match change.action {
            PlanAction::Keep => {}
            PlanAction::Remove => {
                for section in ["dependencies", "devDependencies"] {
                    if let Some(map) = root.get_mut(section).and_then(Value::as_object_mut) {
                        map.remove(name);
                    }
                }
            }
            PlanAction::Upgrade | PlanAction::Add => {
                let version = if change.target_version.is_empty() {
                    "latest"
                } else {
                    change.target_version.as_str()
                };
                let target = Value::String(version.to_string());
                let mut placed = false;
                for section in ["dependencies", "devDependencies"] {
                    if let Some(map) = root.get_mut(section).and_then(Value::as_object_mut) {
                        if map.contains_key(name) {
                            map.insert(name.clone(), target.clone());
                            placed = true;
                            break;
                        }
                    }
                }
                if !placed {
                    let deps = root
                        .as_object_mut()
                        .ok_or_else(|| ManifestError::Parse("package.json is not an object".into()))?
                        .entry("dependencies")
                        .or_insert_with(|| Value::Object(Default::default()));
                    deps.as_object_mut()
                        .ok_or_else(|| ManifestError::Parse("dependencies is not an object".into()))?
                        .insert(name.clone(), target);
                }
            }
        }
    }

    let mut out = serde_json::to_vec_pretty(&root).map_err(|e| ManifestError::Parse(e.to_string()))?;
    out.push(b'\n');
    Ok(out)
}

fn apply_requirements(bytes: &[u8], plan: &MigrationPlan) -> ManifestResult<Vec<u8>> {
    let text = std::str::from_utf8(bytes).map_err(|_| ManifestError::Encoding)?;
    let mut seen: std::collections::BTreeSet<String> = std::collections::BTreeSet::new();
    let mut lines: Vec<String> = Vec::new();

    for line in text.lines() {
        match split_requirement(line) {
            Some((name, _)) => {
                let Some(change) = plan.dependencies.get(&name) else {
                    lines.push(line.to_string());
                    continue;
                };
                seen.insert(name.clone());
                match change.action {
                    PlanAction::Remove => {}
                    PlanAction::Keep => lines.push(line.to_string()),
                    PlanAction::Upgrade | PlanAction::Add => {
                        lines.push(requirement_line(&name, &change.target_version));
                    }
                }
            }
            None => lines.push(line.to_string()),
        }
    }

    // Additions that were not already present.
    for (name, change) in &plan.dependencies {
        if change.action == PlanAction::Add && !seen.contains(name) {
            lines.push(requirement_line(name, &change.target_version));
        }
    }

    let mut out = lines.join("\n");
    out.push('\n');
    Ok(out.into_bytes())
}

/// An unpinned addition becomes a bare requirement line; pip resolves it
/// to the newest release.
fn requirement_line(name: &str, version: &str) -> String {
    if version.is_empty() || version == "latest" || version == "*" {
        name.to_string()
    } else {
        format!("{name}=={version}")
    }
}

/// Compare the manifest read back from the container against the plan's
/// version assertions. Returns the list of mismatch descriptions; empty
/// means every asserted version is in place.
pub fn verify_versions(
    project_type: ProjectType,
    manifest_bytes: &[u8],
    assertions: &[(&str, &str)],
) -> ManifestResult<Vec<String>> {
    let declared = parse_dependencies(project_type, manifest_bytes)?;
    let mut mismatches = Vec::new();
    for (name, expected) in assertions {
        match declared.get(*name) {
            Some(actual) if normalize_version(actual) == normalize_version(expected) => {}
            Some(actual) => mismatches.push(format!(
                "{name}: manifest reports {actual}, plan requires {expected}"
            )),
            None => mismatches.push(format!("{name}: absent from manifest, plan requires {expected}")),
        }
    }
    Ok(mismatches)
}

/// Strip range operators so `^4.19.2` and `4.19.2` compare equal.
fn normalize_version(version: &str) -> &str {
    version.trim_start_matches(['^', '~', '=', '>', '<', 'v', ' '])
}

/// The literal `scripts.test` value, if the manifest declares one.
pub fn node_test_script(bytes: &[u8]) -> ManifestResult<Option<String>> {
    let root: Value =
        serde_json::from_slice(bytes).map_err(|e| ManifestError::Parse(e.to_string()))?;
    Ok(root
        .get("scripts")
        .and_then(|s| s.get("test"))
        .and_then(Value::as_str)
        .map(str::to_string))
}

/// Whether a `scripts.test` value is a placeholder rather than a real
/// suite. Matches the npm-init default, anything admitting there is no
/// test, and commands that only exit cleanly.
pub fn is_noop_test_script(script: &str) -> bool {
    let trimmed = script.trim();
    if trimmed.is_empty() {
        return true;
    }
    let lower = trimmed.to_lowercase();
    if lower.contains("no test") {
        return true;
    }
    // "exit 0", "true", "echo ok && exit 0" style placeholders.
    let without_echo = lower
        .split("&&")
        .map(str::trim)
        .filter(|part| !part.starts_with("echo") && !part.is_empty())
        .collect::<Vec<_>>();
    if without_echo.is_empty() {
        return true;
    }
    without_echo
        .iter()
        .all(|part| *part == "exit 0" || *part == "true")
}
