#![allow(dead_code)]

//! Shared fixtures for the workflow integration suites: a scripted
//! container runtime, a scripted reasoner and a recording repo gateway.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use modernizer::service::GatewayFactory;
use modernizer::workers::WorkerContext;
use modernizer_core::{
    CheckpointStore, Config, ContainerHandle, ContainerRuntime, ContainerSpec, EventBus,
    ExecResult, FileSet, GatewayError, GatewayResult, MigrationSource, MigrationState,
    ProjectType, Reasoner, ReasonerError, ReasonerReply, ReasonerResult, RepoGateway,
    RuntimeError, RuntimeResult, SharedEventBus, TaskKind, TeardownPolicy, TokenUsage,
};
use tokio_util::sync::CancellationToken;

pub fn ok_exec(stdout: &str) -> ExecResult {
    ExecResult {
        exit_code: 0,
        stdout: stdout.to_string(),
        stderr: String::new(),
        duration: Duration::from_millis(2),
    }
}

pub fn failed_exec(code: i32, stderr: &str) -> ExecResult {
    ExecResult {
        exit_code: code,
        stdout: String::new(),
        stderr: stderr.to_string(),
        duration: Duration::from_millis(2),
    }
}

// ── container runtime ─────────────────────────────────────────────────────

#[derive(Default)]
pub struct FakeRuntime {
    pub files: Mutex<HashMap<String, Vec<u8>>>,
    pub readback_overrides: Mutex<HashMap<String, Vec<u8>>>,
    scripts: Mutex<HashMap<&'static str, VecDeque<ExecResult>>>,
    live: Mutex<HashSet<String>>,
}

impl FakeRuntime {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Script results for a logical command; the last entry repeats.
    pub fn script(&self, key: &'static str, results: Vec<ExecResult>) {
        self.scripts
            .lock()
            .unwrap()
            .insert(key, results.into_iter().collect());
    }

    pub fn live_count(&self) -> usize {
        self.live.lock().unwrap().len()
    }

    fn classify(argv: &[&str]) -> &'static str {
        let joined = argv.join(" ");
        if joined.starts_with("npm install") || joined.starts_with("pip install") {
            "install"
        } else if joined.contains("nohup") {
            "launch"
        } else if joined.contains("kill -0") {
            "alive"
        } else if joined.ends_with("/tmp/app.log") {
            "applog"
        } else if joined.starts_with("npm test")
            || joined.starts_with("pytest")
            || joined.starts_with("python -m unittest")
        {
            "test"
        } else {
            "other"
        }
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn create(&self, spec: &ContainerSpec) -> RuntimeResult<ContainerHandle> {
        self.live.lock().unwrap().insert(spec.name.clone());
        Ok(ContainerHandle {
            name: spec.name.clone(),
        })
    }

    async fn copy_in(
        &self,
        _handle: &ContainerHandle,
        host_path: &Path,
        container_path: &str,
        _excludes: &[&str],
    ) -> RuntimeResult<()> {
        for name in ["package.json", "requirements.txt"] {
            if let Ok(bytes) = std::fs::read(host_path.join(name)) {
                self.files
                    .lock()
                    .unwrap()
                    .insert(format!("{container_path}/{name}"), bytes);
            }
        }
        Ok(())
    }

    async fn write_file(
        &self,
        _handle: &ContainerHandle,
        container_path: &str,
        bytes: &[u8],
    ) -> RuntimeResult<()> {
        self.files
            .lock()
            .unwrap()
            .insert(container_path.to_string(), bytes.to_vec());
        Ok(())
    }

    async fn read_file(
        &self,
        _handle: &ContainerHandle,
        container_path: &str,
    ) -> RuntimeResult<Vec<u8>> {
        if let Some(bytes) = self.readback_overrides.lock().unwrap().get(container_path) {
            return Ok(bytes.clone());
        }
        self.files
            .lock()
            .unwrap()
            .get(container_path)
            .cloned()
            .ok_or_else(|| RuntimeError::Transient(format!("no such file {container_path}")))
    }

    async fn exec(
        &self,
        _handle: &ContainerHandle,
        argv: &[&str],
        _env: &[(String, String)],
        _timeout: Duration,
    ) -> RuntimeResult<ExecResult> {
        let key = Self::classify(argv);
        let mut scripts = self.scripts.lock().unwrap();
        match scripts.get_mut(key) {
            Some(queue) => Ok(if queue.len() > 1 {
                queue.pop_front().unwrap()
            } else {
                queue.front().cloned().unwrap_or_else(|| ok_exec(""))
            }),
            None => Ok(ok_exec("")),
        }
    }

    async fn teardown(
        &self,
        handle: &ContainerHandle,
        policy: TeardownPolicy,
    ) -> RuntimeResult<()> {
        if policy == TeardownPolicy::Remove {
            self.live.lock().unwrap().remove(&handle.name);
        }
        Ok(())
    }

    async fn live_containers(&self) -> RuntimeResult<Vec<String>> {
        Ok(self.live.lock().unwrap().iter().cloned().collect())
    }
}

// ── reasoner ──────────────────────────────────────────────────────────────

pub enum Reply {
    Json(serde_json::Value),
    Unavailable,
    Malformed,
}

/// Scripted reasoner: a queue of replies per task kind. An unscripted
/// task is unavailable, which drives the deterministic fallbacks.
#[derive(Default)]
pub struct FakeReasoner {
    replies: Mutex<HashMap<TaskKind, VecDeque<Reply>>>,
    pub calls: Mutex<Vec<TaskKind>>,
}

impl FakeReasoner {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn on(&self, task: TaskKind, reply: Reply) {
        self.replies
            .lock()
            .unwrap()
            .entry(task)
            .or_default()
            .push_back(reply);
    }
}

#[async_trait]
impl Reasoner for FakeReasoner {
    async fn reason(
        &self,
        task: TaskKind,
        _input: serde_json::Value,
    ) -> ReasonerResult<ReasonerReply> {
        self.calls.lock().unwrap().push(task);
        let mut replies = self.replies.lock().unwrap();
        let queue = replies.entry(task).or_default();
        let reply = if queue.len() > 1 {
            queue.pop_front()
        } else {
            queue.front().map(|r| match r {
                Reply::Json(v) => Reply::Json(v.clone()),
                Reply::Unavailable => Reply::Unavailable,
                Reply::Malformed => Reply::Malformed,
            })
        };
        match reply {
            Some(Reply::Json(json)) => Ok(ReasonerReply {
                json,
                usage: TokenUsage {
                    input_tokens: 100,
                    output_tokens: 50,
                },
                cost_usd: 0.001,
            }),
            Some(Reply::Malformed) => Err(ReasonerError::Malformed("scripted".into())),
            Some(Reply::Unavailable) | None => {
                Err(ReasonerError::Unavailable("scripted".into()))
            }
        }
    }
}

// ── repo gateway ──────────────────────────────────────────────────────────

#[derive(Default)]
pub struct RecordingGateway {
    pub files: Mutex<HashMap<String, Vec<u8>>>,
    pub branches: Mutex<Vec<String>>,
    pub pushes: Mutex<Vec<(String, FileSet, String)>>,
    pub prs: Mutex<Vec<(String, String, String, String)>>,
    /// First N create_branch calls answer Conflict.
    pub branch_conflicts: Mutex<u32>,
    /// When set, open_pull_request fails with this message permanently.
    pub fail_pr: Mutex<Option<String>>,
}

impl RecordingGateway {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn pr_count(&self) -> usize {
        self.prs.lock().unwrap().len()
    }
}

#[async_trait]
impl RepoGateway for RecordingGateway {
    async fn read_file(&self, path: &str) -> GatewayResult<Vec<u8>> {
        self.files
            .lock()
            .unwrap()
            .get(path)
            .cloned()
            .ok_or_else(|| GatewayError::NotFound(path.to_string()))
    }

    async fn create_branch(&self, branch_name: &str, _from_branch: &str) -> GatewayResult<()> {
        {
            let mut conflicts = self.branch_conflicts.lock().unwrap();
            if *conflicts > 0 {
                *conflicts -= 1;
                return Err(GatewayError::Conflict(branch_name.to_string()));
            }
        }
        self.branches.lock().unwrap().push(branch_name.to_string());
        Ok(())
    }

    async fn push_files(
        &self,
        branch_name: &str,
        files: FileSet,
        commit_message: &str,
    ) -> GatewayResult<()> {
        self.pushes.lock().unwrap().push((
            branch_name.to_string(),
            files,
            commit_message.to_string(),
        ));
        Ok(())
    }

    async fn open_pull_request(
        &self,
        title: &str,
        body: &str,
        head: &str,
        base: &str,
    ) -> GatewayResult<String> {
        if let Some(message) = self.fail_pr.lock().unwrap().clone() {
            return Err(GatewayError::Permanent(message));
        }
        self.prs.lock().unwrap().push((
            title.to_string(),
            body.to_string(),
            head.to_string(),
            base.to_string(),
        ));
        Ok(format!("https://example.com/pr/{}", self.pr_count()))
    }
}

pub struct FixedGatewayFactory(pub Arc<RecordingGateway>);

impl GatewayFactory for FixedGatewayFactory {
    fn for_source(&self, _source: &MigrationSource, _root: &Path) -> Arc<dyn RepoGateway> {
        self.0.clone()
    }
}

// ── fixtures ──────────────────────────────────────────────────────────────

/// A Node project on disk; `test_script` is the literal `scripts.test`.
pub fn node_project(test_script: &str) -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("package.json"),
        format!(
            r#"{{
  "name": "demo-app",
  "version": "1.0.0",
  "main": "index.js",
  "scripts": {{ "test": {test_script:?}, "start": "node index.js" }},
  "dependencies": {{ "express": "4.16.0", "dotenv": "16.0.0" }}
}}"#
        ),
    )
    .unwrap();
    std::fs::write(dir.path().join("index.js"), "console.log('up');\n").unwrap();
    dir
}

/// Config pointed at a temp persist root, with test-friendly timings.
pub fn test_config(persist_root: &Path) -> Config {
    Config {
        persist_root: persist_root.to_path_buf(),
        concurrency: 2,
        start_settle_ms: 1,
        reasoner_timeout_secs: 2,
        install_timeout_secs: 5,
        test_timeout_secs: 5,
        ..Default::default()
    }
}

/// A plan reply upgrading express to 4.19.2 and keeping dotenv.
pub fn upgrade_plan_reply() -> serde_json::Value {
    serde_json::json!({
        "dependencies": {
            "express": {
                "current_version": "4.16.0",
                "target_version": "4.19.2",
                "action": "upgrade",
                "risk": "medium",
                "breaking_changes": []
            },
            "dotenv": {
                "current_version": "16.0.0",
                "target_version": "16.0.0",
                "action": "keep",
                "risk": "low"
            }
        },
        "phases": [
            { "name": "web stack", "dependency_names": ["express"], "estimated_time": "15m" }
        ]
    })
}

pub struct Harness {
    pub persist: tempfile::TempDir,
    pub store: Arc<CheckpointStore>,
    pub bus: SharedEventBus,
    pub runtime: Arc<FakeRuntime>,
    pub reasoner: Arc<FakeReasoner>,
    pub gateway: Arc<RecordingGateway>,
    pub cancel: CancellationToken,
}

impl Harness {
    pub fn new() -> Self {
        let persist = tempfile::tempdir().unwrap();
        let store = Arc::new(CheckpointStore::open(persist.path()).unwrap());
        let bus = EventBus::with_store(store.clone()).shared();
        Self {
            persist,
            store,
            bus,
            runtime: FakeRuntime::new(),
            reasoner: FakeReasoner::new(),
            gateway: RecordingGateway::new(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn context(&self) -> WorkerContext {
        WorkerContext {
            bus: self.bus.clone(),
            store: self.store.clone(),
            reasoner: self.reasoner.clone(),
            gateway: self.gateway.clone(),
            runtime: self.runtime.clone(),
            config: test_config(self.persist.path()),
            cancel: self.cancel.clone(),
        }
    }

    pub fn state(&self, project_root: &Path, retries_max: u32) -> MigrationState {
        MigrationState::new(
            uuid::Uuid::new_v4().to_string(),
            project_root.to_path_buf(),
            ProjectType::Node,
            MigrationSource::Local {
                path: project_root.to_path_buf(),
            },
            retries_max,
        )
    }
}
