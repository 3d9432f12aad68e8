//! The migration data model.
//!
//! `MigrationState` is the sole piece of mutable workflow memory. Every
//! engine transition produces a new logical revision which is checkpointed
//! before the next worker runs. All records are closed serde structs;
//! the finite classifications (phase, action, risk, failure category) are
//! explicit enums so no string-keyed bags cross component boundaries.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Opaque correlation handle, unique per started migration.
pub type MigrationId = String;

/// Project flavor. Determines manifest path, base image and the
/// install/run/test command set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ProjectType {
    Node,
    Python,
}

impl ProjectType {
    /// Path of the dependency manifest relative to the project root.
    pub fn manifest_path(self) -> &'static str {
        match self {
            Self::Node => "package.json",
            Self::Python => "requirements.txt",
        }
    }

    /// Container base image used for validation.
    pub fn base_image(self) -> &'static str {
        match self {
            Self::Node => "node:20-slim",
            Self::Python => "python:3.12-slim",
        }
    }

    /// Default application port inside the container.
    pub fn default_port(self) -> u16 {
        match self {
            Self::Node => 3000,
            Self::Python => 5000,
        }
    }
}

impl fmt::Display for ProjectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Node => write!(f, "node"),
            Self::Python => write!(f, "python"),
        }
    }
}

/// Where the project comes from. Immutable once set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MigrationSource {
    /// A project tree already on local disk.
    Local { path: PathBuf },
    /// A remote repository cloned into the workspace by the service.
    Git {
        url: String,
        branch: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        token: Option<String>,
    },
}

/// Workflow phase. Only the engine writes this; workers never touch it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Planning,
    Validating,
    Analyzing,
    Deploying,
    /// Terminal: validated and a pull request was opened.
    Succeeded,
    /// Terminal: unrecoverable error or cancellation.
    Failed,
    /// Terminal: retry budget exhausted, a human has to look.
    Escalated,
}

impl Phase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Escalated)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Planning => write!(f, "planning"),
            Self::Validating => write!(f, "validating"),
            Self::Analyzing => write!(f, "analyzing"),
            Self::Deploying => write!(f, "deploying"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
            Self::Escalated => write!(f, "escalated"),
        }
    }
}

/// What the plan wants done to one dependency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum PlanAction {
    Upgrade,
    Remove,
    Add,
    Keep,
}

impl fmt::Display for PlanAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Upgrade => write!(f, "upgrade"),
            Self::Remove => write!(f, "remove"),
            Self::Add => write!(f, "add"),
            Self::Keep => write!(f, "keep"),
        }
    }
}

/// Risk classification for a single dependency change.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum Risk {
    Low,
    Medium,
    High,
}

impl fmt::Display for Risk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Medium => write!(f, "medium"),
            Self::High => write!(f, "high"),
        }
    }
}

/// A known breaking change between the current and target version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct BreakingChange {
    pub version: String,
    pub severity: Risk,
    pub note: String,
}

/// Proposed mutation for one dependency.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct DependencyChange {
    pub current_version: String,
    pub target_version: String,
    pub action: PlanAction,
    pub risk: Risk,
    #[serde(default)]
    pub breaking_changes: Vec<BreakingChange>,
}

/// One ordered step of the rollout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct PlanPhase {
    pub name: String,
    pub dependency_names: Vec<String>,
    #[serde(default)]
    pub estimated_time: String,
    #[serde(default)]
    pub rollback_note: String,
}

/// Structured description of the proposed dependency mutations, phased by
/// risk. Produced by the planner, patched by the analyzer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct MigrationPlan {
    /// Keyed by package name; insertion order is irrelevant.
    pub dependencies: BTreeMap<String, DependencyChange>,
    pub phases: Vec<PlanPhase>,
    pub overall_risk: Risk,
}

impl MigrationPlan {
    /// A plan that changes nothing: every dependency kept at its current
    /// version in a single phase. This is the degraded-reasoner fallback.
    pub fn noop(current: &BTreeMap<String, String>) -> Self {
        let dependencies: BTreeMap<String, DependencyChange> = current
            .iter()
            .map(|(name, version)| {
                (
                    name.clone(),
                    DependencyChange {
                        current_version: version.clone(),
                        target_version: version.clone(),
                        action: PlanAction::Upgrade,
                        risk: Risk::Low,
                        breaking_changes: Vec::new(),
                    },
                )
            })
            .collect();
        let names: Vec<String> = dependencies.keys().cloned().collect();
        Self {
            dependencies,
            phases: vec![PlanPhase {
                name: "hold current versions".into(),
                dependency_names: names,
                estimated_time: String::new(),
                rollback_note: "no changes applied".into(),
            }],
            overall_risk: Risk::Low,
        }
    }

    /// Recompute `overall_risk` as the maximum risk among dependencies.
    pub fn recompute_overall_risk(&mut self) {
        self.overall_risk = self
            .dependencies
            .values()
            .map(|d| d.risk)
            .max()
            .unwrap_or(Risk::Low);
    }

    /// Dependencies whose installed version must match the target after a
    /// validation run: anything upgraded, added, or retargeted. Unpinned
    /// targets ("latest", "*", empty) assert nothing concrete.
    pub fn version_assertions(&self) -> Vec<(&str, &str)> {
        self.dependencies
            .iter()
            .filter(|(_, c)| {
                matches!(c.action, PlanAction::Upgrade | PlanAction::Add)
                    || (c.action == PlanAction::Keep && c.target_version != c.current_version)
            })
            .filter(|(_, c)| {
                !c.target_version.is_empty()
                    && c.target_version != "latest"
                    && c.target_version != "*"
            })
            .map(|(name, c)| (name.as_str(), c.target_version.as_str()))
            .collect()
    }
}

/// A structured mutation the analyzer applies to the current plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum PlanPatch {
    /// Change the target version of an existing dependency.
    SetTarget { name: String, version: String },
    /// Insert a new dependency (compatibility shim, missing module).
    AddDependency { name: String, version: String },
    /// Drop a dependency from the plan and the manifest.
    RemoveDependency { name: String },
    /// Pin a dependency back to its current version.
    PinCurrent { name: String },
    /// No applicable mutation; keeping this fix is advisory only.
    Noop,
}

impl PlanPatch {
    /// Apply this patch to a plan in place. Returns false when the patch
    /// had nothing to do (unknown dependency, `Noop`).
    pub fn apply(&self, plan: &mut MigrationPlan) -> bool {
        let applied = match self {
            Self::SetTarget { name, version } => match plan.dependencies.get_mut(name) {
                Some(change) => {
                    change.target_version = version.clone();
                    if change.action == PlanAction::Keep {
                        change.action = PlanAction::Upgrade;
                    }
                    true
                }
                None => false,
            },
            Self::AddDependency { name, version } => {
                plan.dependencies.insert(
                    name.clone(),
                    DependencyChange {
                        current_version: String::new(),
                        target_version: version.clone(),
                        action: PlanAction::Add,
                        risk: Risk::Medium,
                        breaking_changes: Vec::new(),
                    },
                );
                if let Some(phase) = plan.phases.first_mut() {
                    if !phase.dependency_names.iter().any(|n| n == name) {
                        phase.dependency_names.push(name.clone());
                    }
                }
                true
            }
            Self::RemoveDependency { name } => match plan.dependencies.get_mut(name) {
                Some(change) => {
                    change.action = PlanAction::Remove;
                    true
                }
                None => false,
            },
            Self::PinCurrent { name } => match plan.dependencies.get_mut(name) {
                Some(change) => {
                    change.target_version = change.current_version.clone();
                    change.action = PlanAction::Keep;
                    true
                }
                None => false,
            },
            Self::Noop => false,
        };
        if applied {
            plan.recompute_overall_risk();
        }
        applied
    }
}

/// Categorized explanation of a validation failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum FailureCategory {
    MissingDep,
    ApiBreaking,
    PeerConflict,
    Config,
    VersionConflict,
    Unknown,
}

impl fmt::Display for FailureCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingDep => write!(f, "missing_dep"),
            Self::ApiBreaking => write!(f, "api_breaking"),
            Self::PeerConflict => write!(f, "peer_conflict"),
            Self::Config => write!(f, "config"),
            Self::VersionConflict => write!(f, "version_conflict"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// One candidate fix, ranked by confidence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct SuggestedFix {
    pub description: String,
    /// Confidence in [0, 1].
    pub confidence: f64,
    pub patch: PlanPatch,
}

/// Diagnosis produced by the analyzer after a failed validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ErrorDiagnosis {
    pub root_cause: String,
    pub category: FailureCategory,
    /// Ordered by descending confidence.
    pub fixes: Vec<SuggestedFix>,
}

impl ErrorDiagnosis {
    /// Sort fixes by descending confidence, clamping into [0, 1].
    pub fn rank_fixes(&mut self) {
        for fix in &mut self.fixes {
            fix.confidence = fix.confidence.clamp(0.0, 1.0);
        }
        self.fixes
            .sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
    }

    /// The best fix that actually mutates the plan, if any.
    pub fn best_applicable_fix(&self) -> Option<&SuggestedFix> {
        self.fixes.iter().find(|f| f.patch != PlanPatch::Noop)
    }
}

/// The record produced by one container validation attempt.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationOutcome {
    pub container_name: String,
    pub host_port: u16,
    pub install_ok: bool,
    pub start_ok: bool,
    pub health_ok: bool,
    pub tests_found: bool,
    pub tests_ok: bool,
    pub versions_match: bool,
    /// Captured output per stage, bounded and truncated from the head.
    pub logs: BTreeMap<String, String>,
    /// Parsed test summary, e.g. "32 passed, 32 total"; empty when no tests.
    pub test_summary: String,
    /// Stage-prefixed error strings, in occurrence order.
    pub errors: Vec<String>,
}

impl ValidationOutcome {
    /// Overall verdict. Tests only count when they were found; a version
    /// mismatch always fails the run regardless of the other flags.
    pub fn ok(&self) -> bool {
        self.install_ok
            && self.start_ok
            && self.health_ok
            && self.versions_match
            && (!self.tests_found || self.tests_ok)
    }
}

/// The remote-side artifact of a successful run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentRecord {
    pub branch_name: String,
    pub commit_message: String,
    pub pr_url: String,
}

/// Which worker an event or cost entry is attributed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerKind {
    Planner,
    Validator,
    Analyzer,
    Deployer,
}

impl fmt::Display for WorkerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Planner => write!(f, "planner"),
            Self::Validator => write!(f, "validator"),
            Self::Analyzer => write!(f, "analyzer"),
            Self::Deployer => write!(f, "deployer"),
        }
    }
}

/// Token and money spend for one worker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CostEntry {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_usd: f64,
}

/// Running total of reasoner spend, itemized per worker.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CostLedger {
    pub per_worker: BTreeMap<WorkerKind, CostEntry>,
}

impl CostLedger {
    pub fn record(&mut self, worker: WorkerKind, input_tokens: u64, output_tokens: u64, cost_usd: f64) {
        let entry = self.per_worker.entry(worker).or_default();
        entry.input_tokens += input_tokens;
        entry.output_tokens += output_tokens;
        entry.cost_usd += cost_usd;
    }

    pub fn total(&self) -> CostEntry {
        let mut total = CostEntry::default();
        for entry in self.per_worker.values() {
            total.input_tokens += entry.input_tokens;
            total.output_tokens += entry.output_tokens;
            total.cost_usd += entry.cost_usd;
        }
        total
    }
}

/// The sole piece of mutable workflow memory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationState {
    pub id: MigrationId,
    /// Absolute path to the writable working copy.
    pub project_root: PathBuf,
    pub project_type: ProjectType,
    pub source: MigrationSource,
    pub plan: Option<MigrationPlan>,
    pub outcome: Option<ValidationOutcome>,
    pub diagnosis: Option<ErrorDiagnosis>,
    pub deployment: Option<DeploymentRecord>,
    /// Accumulated error descriptions, in occurrence order.
    pub errors: Vec<String>,
    pub retries_used: u32,
    pub retries_max: u32,
    pub phase: Phase,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub cost_accum: CostLedger,
}

impl MigrationState {
    pub fn new(
        id: MigrationId,
        project_root: PathBuf,
        project_type: ProjectType,
        source: MigrationSource,
        retries_max: u32,
    ) -> Self {
        Self {
            id,
            project_root,
            project_type,
            source,
            plan: None,
            outcome: None,
            diagnosis: None,
            deployment: None,
            errors: Vec::new(),
            retries_used: 0,
            retries_max,
            phase: Phase::Planning,
            started_at: Utc::now(),
            finished_at: None,
            cost_accum: CostLedger::default(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.phase.is_terminal()
    }

    pub fn record_error(&mut self, kind: &str, detail: impl fmt::Display) {
        self.errors.push(format!("{kind}: {detail}"));
    }
}
