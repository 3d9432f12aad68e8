//! Migration state model and its file-backed checkpoint store.

pub mod store;
pub mod types;

pub use store::{CheckpointStore, StoreError, StoreResult};
pub use types::{
    BreakingChange, CostEntry, CostLedger, DependencyChange, DeploymentRecord, ErrorDiagnosis,
    FailureCategory, MigrationId, MigrationPlan, MigrationSource, MigrationState, Phase,
    PlanAction, PlanPatch, PlanPhase, ProjectType, Risk, SuggestedFix, ValidationOutcome,
    WorkerKind,
};
