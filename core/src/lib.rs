//! Migration orchestration core.
//!
//! The reusable pieces of the dependency-upgrade orchestrator:
//! - typed migration state with a file-backed, atomically-committed
//!   checkpoint store (`state`)
//! - per-migration progress events with durable logging and fan-out to
//!   subscribers (`events`)
//! - a single-container sandbox adapter over the Docker CLI (`runtime`)
//! - the validation engine that installs, starts, probes and tests a
//!   mutated project inside that sandbox (`validation`)
//! - a typed client for the opaque reasoning service, with provider
//!   reply normalization and cost accounting (`reasoner`)
//! - the repository gateway contract (`repo`)
//! - the error taxonomy and backoff helpers shared by all of the above
//!   (`error`, `retry`)
//!
//! The workflow engine, the four workers and the service façade live in
//! the `modernizer` binary crate; everything here is driven by them.

pub mod config;
pub mod error;
pub mod events;
pub mod reasoner;
pub mod repo;
pub mod retry;
pub mod runtime;
pub mod state;
pub mod validation;

pub use config::{Config, ConfigError};
pub use error::{Disposition, MigrationError, MigrationResult};
pub use events::{BusError, Event, EventBus, EventDraft, EventKind, EventStream, SharedEventBus};
pub use reasoner::{
    HttpReasoner, OfflineReasoner, Reasoner, ReasonerConfig, ReasonerError, ReasonerReply,
    ReasonerResult, TaskKind, TokenUsage,
};
pub use repo::{FileSet, GatewayError, GatewayResult, LocalRepo, RepoGateway};
pub use runtime::{
    container_name, ContainerHandle, ContainerRuntime, ContainerSpec, DockerCli, ExecResult,
    RuntimeError, RuntimeResult, TeardownPolicy,
};
pub use state::{
    CheckpointStore, CostEntry, CostLedger, DeploymentRecord, DependencyChange, ErrorDiagnosis,
    FailureCategory, MigrationId, MigrationPlan, MigrationSource, MigrationState, Phase,
    PlanAction, PlanPatch, PlanPhase, ProjectType, Risk, StoreError, SuggestedFix,
    ValidationOutcome, WorkerKind,
};
pub use validation::{
    NoopObserver, StageObserver, ValidationConfig, ValidationEngine, ValidationRequest,
};
