//! Migration service façade.
//!
//! One public entry point to start a migration, one to subscribe to its
//! events, one to look state up. Owns the registry of live workflows
//! (the only global mutable state, mutex-guarded, inserted on start and
//! cleared on terminal) and the concurrency bound: workflows beyond the
//! configured limit queue on a semaphore.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use modernizer_core::{
    CheckpointStore, Config, ContainerRuntime, EventBus, EventStream, MigrationId, MigrationSource,
    MigrationState, ProjectType, Reasoner, RepoGateway, LocalRepo, SharedEventBus, StoreError,
};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::engine::WorkflowEngine;
use crate::workers::WorkerContext;

/// Bounds on the caller-supplied retry budget.
const MAX_RETRIES_CEILING: u32 = 10;
const DEFAULT_MAX_RETRIES: u32 = 3;

/// Error type for service operations.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("Migration not found: {0}")]
    NotFound(MigrationId),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Workspace preparation failed: {0}")]
    Workspace(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub type ServiceResult<T> = Result<T, ServiceError>;

/// Everything a caller may pass to `start`.
#[derive(Debug, Clone, Default)]
pub struct StartRequest {
    /// Local project tree; mutually exclusive with `git_repo_url`.
    pub project_path: Option<PathBuf>,
    pub git_repo_url: Option<String>,
    pub git_branch: Option<String>,
    pub git_token: Option<String>,
    pub project_type: Option<ProjectType>,
    /// Clamped into [0, 10]; default 3.
    pub max_retries: Option<u32>,
}

/// Produces the repo gateway for a given source. Remote forges plug in
/// here; the default wires read-only local gateways.
pub trait GatewayFactory: Send + Sync {
    fn for_source(&self, source: &MigrationSource, project_root: &std::path::Path)
        -> Arc<dyn RepoGateway>;
}

/// Default factory: a read-only gateway over the working copy. Write
/// operations fail permanently, which surfaces as a deployment failure
/// rather than a pretend success when no forge is configured.
pub struct LocalGatewayFactory;

impl GatewayFactory for LocalGatewayFactory {
    fn for_source(
        &self,
        _source: &MigrationSource,
        project_root: &std::path::Path,
    ) -> Arc<dyn RepoGateway> {
        Arc::new(LocalRepo::new(project_root))
    }
}

/// External collaborators handed to the service at construction.
pub struct Collaborators {
    pub reasoner: Arc<dyn Reasoner>,
    pub runtime: Arc<dyn ContainerRuntime>,
    pub gateways: Arc<dyn GatewayFactory>,
}

struct LiveWorkflow {
    cancel: CancellationToken,
}

struct Inner {
    registry: Mutex<HashMap<MigrationId, LiveWorkflow>>,
    bus: SharedEventBus,
    store: Arc<CheckpointStore>,
    collaborators: Collaborators,
    config: Config,
    permits: Arc<Semaphore>,
}

/// The migration service.
#[derive(Clone)]
pub struct MigrationService {
    inner: Arc<Inner>,
}

impl MigrationService {
    pub fn new(config: Config, collaborators: Collaborators) -> ServiceResult<Self> {
        let store = Arc::new(CheckpointStore::open(&config.persist_root)?);
        let bus = EventBus::with_store(store.clone()).shared();
        let permits = Arc::new(Semaphore::new(config.concurrency.max(1)));
        Ok(Self {
            inner: Arc::new(Inner {
                registry: Mutex::new(HashMap::new()),
                bus,
                store,
                collaborators,
                config,
                permits,
            }),
        })
    }

    pub fn bus(&self) -> SharedEventBus {
        self.inner.bus.clone()
    }

    /// Start a migration; returns its id immediately. The workflow runs
    /// on its own task, queued behind the concurrency bound.
    pub async fn start(&self, request: StartRequest) -> ServiceResult<MigrationId> {
        let project_type = request
            .project_type
            .ok_or_else(|| ServiceError::InvalidRequest("project_type is required".into()))?;
        let retries_max = request
            .max_retries
            .unwrap_or(DEFAULT_MAX_RETRIES)
            .min(MAX_RETRIES_CEILING);

        let id = Uuid::new_v4().to_string();
        let (source, project_root) = self.prepare_workspace(&id, &request).await?;

        let state = MigrationState::new(id.clone(), project_root, project_type, source, retries_max);
        self.inner.store.save_state(&state)?;

        self.spawn_workflow(state);
        Ok(id)
    }

    /// Latest committed snapshot for a migration.
    pub fn get(&self, id: &str) -> ServiceResult<MigrationState> {
        self.inner.store.load_state(id).map_err(|e| match e {
            StoreError::NotFound(id) => ServiceError::NotFound(id),
            other => ServiceError::Store(other),
        })
    }

    /// Committed snapshots, newest first.
    pub fn list(&self, limit: usize, offset: usize) -> ServiceResult<Vec<MigrationState>> {
        let states = self.inner.store.list_states()?;
        Ok(states.into_iter().skip(offset).take(limit).collect())
    }

    /// Subscribe to a migration's events. Terminated migrations replay
    /// their terminal event.
    pub fn subscribe(&self, id: &str) -> ServiceResult<EventStream> {
        self.inner
            .bus
            .subscribe(id)
            .map_err(|_| ServiceError::NotFound(id.to_string()))
    }

    /// Request cancellation of a live workflow.
    pub fn cancel(&self, id: &str) -> ServiceResult<()> {
        let registry = self.inner.registry.lock().expect("registry lock poisoned");
        match registry.get(id) {
            Some(live) => {
                live.cancel.cancel();
                Ok(())
            }
            None => Err(ServiceError::NotFound(id.to_string())),
        }
    }

    /// Count of currently registered (live) workflows.
    pub fn live_count(&self) -> usize {
        self.inner.registry.lock().expect("registry lock poisoned").len()
    }

    /// Re-queue every persisted workflow that never reached a terminal
    /// phase. Called once at startup; returns the resumed ids.
    pub fn resume_all(&self) -> ServiceResult<Vec<MigrationId>> {
        let mut resumed = Vec::new();
        for state in self.inner.store.list_states()? {
            if state.is_terminal() {
                continue;
            }
            let already_live = {
                let registry = self.inner.registry.lock().expect("registry lock poisoned");
                registry.contains_key(&state.id)
            };
            if already_live {
                continue;
            }
            info!(migration_id = %state.id, phase = %state.phase, "resuming workflow");
            resumed.push(state.id.clone());
            self.spawn_workflow(state);
        }
        Ok(resumed)
    }

    fn spawn_workflow(&self, state: MigrationState) {
        let cancel = CancellationToken::new();
        {
            let mut registry = self.inner.registry.lock().expect("registry lock poisoned");
            registry.insert(state.id.clone(), LiveWorkflow { cancel: cancel.clone() });
        }

        let inner = self.inner.clone();
        let id = state.id.clone();
        tokio::spawn(async move {
            // Queue behind the concurrency bound.
            let _permit = match inner.permits.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    error!(migration_id = %id, "semaphore closed; dropping workflow");
                    return;
                }
            };

            let gateway = inner
                .collaborators
                .gateways
                .for_source(&state.source, &state.project_root);
            let ctx = WorkerContext {
                bus: inner.bus.clone(),
                store: inner.store.clone(),
                reasoner: inner.collaborators.reasoner.clone(),
                gateway,
                runtime: inner.collaborators.runtime.clone(),
                config: inner.config.clone(),
                cancel,
            };
            let engine = WorkflowEngine::new(ctx);
            let final_state = engine.run(state).await;

            info!(
                migration_id = %final_state.id,
                phase = %final_state.phase,
                retries = final_state.retries_used,
                "workflow finished"
            );

            let mut registry = inner.registry.lock().expect("registry lock poisoned");
            registry.remove(&final_state.id);
            // Late subscribers replay the terminal event from disk.
            inner.bus.forget(&final_state.id);
        });
    }

    /// Resolve the request into (source, writable project root). Git
    /// sources are cloned into a per-migration workspace.
    async fn prepare_workspace(
        &self,
        id: &str,
        request: &StartRequest,
    ) -> ServiceResult<(MigrationSource, PathBuf)> {
        match (&request.project_path, &request.git_repo_url) {
            (Some(path), None) => {
                let root = tokio::fs::canonicalize(path).await.map_err(|e| {
                    ServiceError::InvalidRequest(format!("{} is not usable: {e}", path.display()))
                })?;
                Ok((MigrationSource::Local { path: root.clone() }, root))
            }
            (None, Some(url)) => {
                let branch = request.git_branch.clone().unwrap_or_else(|| "main".into());
                let root = self
                    .clone_repository(id, url, &branch, request.git_token.as_deref())
                    .await?;
                Ok((
                    MigrationSource::Git {
                        url: url.clone(),
                        branch,
                        token: request.git_token.clone(),
                    },
                    root,
                ))
            }
            (Some(_), Some(_)) => Err(ServiceError::InvalidRequest(
                "provide either project_path or git_repo_url, not both".into(),
            )),
            (None, None) => Err(ServiceError::InvalidRequest(
                "one of project_path or git_repo_url is required".into(),
            )),
        }
    }

    async fn clone_repository(
        &self,
        id: &str,
        url: &str,
        branch: &str,
        token: Option<&str>,
    ) -> ServiceResult<PathBuf> {
        let workspace = self.inner.config.persist_root.join("workspaces").join(id);
        tokio::fs::create_dir_all(&workspace)
            .await
            .map_err(|e| ServiceError::Workspace(e.to_string()))?;

        let fetch_url = match token {
            Some(token) if url.starts_with("https://") => {
                url.replacen("https://", &format!("https://x-access-token:{token}@"), 1)
            }
            _ => url.to_string(),
        };

        let workspace_str = workspace.to_string_lossy().to_string();
        let output = tokio::process::Command::new("git")
            .args([
                "clone",
                "--depth",
                "1",
                "--branch",
                branch,
                fetch_url.as_str(),
                workspace_str.as_str(),
            ])
            .output()
            .await
            .map_err(|e| ServiceError::Workspace(format!("git unavailable: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            // The token must not leak into errors or logs.
            let sanitized = stderr.replace(&fetch_url, url);
            warn!(migration_id = %id, "git clone failed");
            return Err(ServiceError::Workspace(format!("git clone failed: {sanitized}")));
        }
        Ok(workspace)
    }
}
