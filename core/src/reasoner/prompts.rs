//! System prompts, one per task kind.
//!
//! Each prompt pins the reply to a single JSON object so the normalizer
//! has a fighting chance regardless of provider. Keep these terse: the
//! structured input carries the actual material.

use super::TaskKind;

const PLAN_PROMPT: &str = "\
You are a dependency upgrade planner. Given a project's dependency manifest \
and its type, propose a phased upgrade plan. Reply with a single JSON object: \
{\"dependencies\": {\"<name>\": {\"current_version\": str, \"target_version\": str, \
\"action\": \"upgrade\"|\"remove\"|\"add\"|\"keep\", \"risk\": \"low\"|\"medium\"|\"high\", \
\"breaking_changes\": [{\"version\": str, \"severity\": \"low\"|\"medium\"|\"high\", \"note\": str}]}}, \
\"phases\": [{\"name\": str, \"dependency_names\": [str], \"estimated_time\": str, \
\"rollback_note\": str}]}. \
Prefer conservative, widely-adopted target versions. No prose outside the JSON.";

const DIAGNOSE_PROMPT: &str = "\
You are a build-failure analyst. Given validation errors and stage logs from a \
failed dependency upgrade, identify the root cause and propose fixes. Reply \
with a single JSON object: {\"root_cause\": str, \"category\": \"missing_dep\"|\
\"api_breaking\"|\"peer_conflict\"|\"config\"|\"version_conflict\"|\"unknown\", \
\"fixes\": [{\"description\": str, \"confidence\": number 0..1, \"patch\": \
{\"op\": \"set_target\"|\"add_dependency\"|\"remove_dependency\"|\"pin_current\"|\"noop\", \
\"name\": str, \"version\": str}}]}. Order fixes by confidence. No prose outside the JSON.";

const DEPLOY_PROMPT: &str = "\
You are writing a pull-request description for an automated dependency \
upgrade. Given the executed plan and the validation outcome, reply with a \
single JSON object: {\"title\": str, \"body\": str}. The body is Markdown: \
summarize the upgrades, call out breaking changes, and include the test \
summary. No prose outside the JSON.";

/// The system prompt for a task kind.
pub fn system_prompt(task: TaskKind) -> &'static str {
    match task {
        TaskKind::Plan => PLAN_PROMPT,
        TaskKind::Diagnose => DIAGNOSE_PROMPT,
        TaskKind::DeployMessage => DEPLOY_PROMPT,
    }
}

/// Serialize the structured input into a bounded user prompt.
pub fn render_input(input: &serde_json::Value, max_bytes: usize) -> String {
    let rendered = serde_json::to_string_pretty(input).unwrap_or_else(|_| input.to_string());
    crate::runtime::truncate_head(&rendered, max_bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_task_has_a_prompt() {
        for task in [TaskKind::Plan, TaskKind::Diagnose, TaskKind::DeployMessage] {
            assert!(system_prompt(task).contains("JSON"));
        }
    }

    #[test]
    fn render_input_bounds_size() {
        let input = serde_json::json!({ "logs": "x".repeat(10_000) });
        let rendered = render_input(&input, 1024);
        assert!(rendered.len() <= 1024 + "[truncated]…".len());
    }
}
