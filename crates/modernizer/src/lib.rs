//! Orchestrator for automated dependency upgrades.
//!
//! Ties the core library together into a running service: the workflow
//! engine and its phase machine, the four workers (planner, validator,
//! analyzer, deployer), the migration service façade, and run telemetry.

pub mod engine;
pub mod machine;
pub mod service;
pub mod telemetry;
pub mod workers;

pub use engine::WorkflowEngine;
pub use machine::{IllegalTransition, PhaseMachine, TransitionRecord};
pub use service::{
    Collaborators, GatewayFactory, LocalGatewayFactory, MigrationService, ServiceError,
    ServiceResult, StartRequest,
};
pub use workers::{Analyzer, AnalyzerVerdict, Deployer, Planner, Validator, WorkerContext};
