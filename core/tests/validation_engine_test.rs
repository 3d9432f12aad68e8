//! Validation engine integration tests against a scripted fake runtime.
//!
//! The fake models just enough of a container: an in-memory file map fed
//! by `copy_in`/`write_file`, per-command scripted exec results, and a
//! live-container set for cleanup assertions.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use modernizer_core::validation::{
    NoopObserver, ValidationConfig, ValidationEngine, ValidationRequest,
};
use modernizer_core::{
    ContainerHandle, ContainerRuntime, ContainerSpec, DependencyChange, ExecResult, MigrationPlan,
    PlanAction, ProjectType, Risk, RuntimeError, RuntimeResult, TeardownPolicy,
};
use tokio_util::sync::CancellationToken;

fn ok_exec(stdout: &str) -> ExecResult {
    ExecResult {
        exit_code: 0,
        stdout: stdout.to_string(),
        stderr: String::new(),
        duration: Duration::from_millis(5),
    }
}

fn failed_exec(code: i32, stderr: &str) -> ExecResult {
    ExecResult {
        exit_code: code,
        stdout: String::new(),
        stderr: stderr.to_string(),
        duration: Duration::from_millis(5),
    }
}

#[derive(Default)]
struct FakeRuntime {
    files: Mutex<HashMap<String, Vec<u8>>>,
    /// Overrides what `read_file` returns for a path, regardless of what
    /// was written — simulates a corrupted injection path.
    readback_overrides: Mutex<HashMap<String, Vec<u8>>>,
    /// Scripted exec results per logical command; the last entry repeats.
    scripts: Mutex<HashMap<&'static str, VecDeque<ExecResult>>>,
    live: Mutex<HashSet<String>>,
    create_error: Mutex<Option<String>>,
    teardowns: AtomicUsize,
}

impl FakeRuntime {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn script(&self, key: &'static str, results: Vec<ExecResult>) {
        self.scripts
            .lock()
            .unwrap()
            .insert(key, results.into_iter().collect());
    }

    fn fail_create(&self, message: &str) {
        *self.create_error.lock().unwrap() = Some(message.to_string());
    }

    fn live_count(&self) -> usize {
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
        if let Some(message) = self.create_error.lock().unwrap().clone() {
            return Err(RuntimeError::Fatal(message));
        }
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
        // Injecting the tree makes the manifest visible inside.
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
            Some(queue) => {
                let result = if queue.len() > 1 {
                    queue.pop_front().unwrap()
                } else {
                    queue.front().cloned().unwrap_or_else(|| ok_exec(""))
                };
                Ok(result)
            }
            None => Ok(ok_exec("")),
        }
    }

    async fn teardown(
        &self,
        handle: &ContainerHandle,
        policy: TeardownPolicy,
    ) -> RuntimeResult<()> {
        self.teardowns.fetch_add(1, Ordering::SeqCst);
        if policy == TeardownPolicy::Remove {
            self.live.lock().unwrap().remove(&handle.name);
        }
        Ok(())
    }

    async fn live_containers(&self) -> RuntimeResult<Vec<String>> {
        Ok(self.live.lock().unwrap().iter().cloned().collect())
    }
}

fn node_project(test_script: &str) -> tempfile::TempDir {
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

fn upgrade_plan() -> MigrationPlan {
    let mut plan = MigrationPlan::noop(&Default::default());
    plan.dependencies.insert(
        "express".into(),
        DependencyChange {
            current_version: "4.16.0".into(),
            target_version: "4.19.2".into(),
            action: PlanAction::Upgrade,
            risk: Risk::Medium,
            breaking_changes: Vec::new(),
        },
    );
    plan
}

fn engine_with(runtime: Arc<FakeRuntime>) -> ValidationEngine {
    let config = ValidationConfig {
        start_settle: Duration::from_millis(1),
        ..Default::default()
    };
    ValidationEngine::new(runtime, config)
}

#[tokio::test]
async fn happy_path_with_passing_tests() {
    let runtime = FakeRuntime::new();
    runtime.script(
        "test",
        vec![ok_exec(
            "Test Suites: 4 passed, 4 total\nTests:       32 passed, 32 total\n",
        )],
    );
    let project = node_project("jest");
    let plan = upgrade_plan();

    let outcome = engine_with(runtime.clone())
        .validate(
            ValidationRequest {
                migration_id: "mig-happy",
                project_root: project.path(),
                project_type: ProjectType::Node,
                plan: Some(&plan),
            },
            &NoopObserver,
            &CancellationToken::new(),
        )
        .await;

    assert!(outcome.install_ok);
    assert!(outcome.start_ok);
    assert!(outcome.health_ok);
    assert!(outcome.tests_found);
    assert!(outcome.tests_ok);
    assert!(outcome.versions_match, "errors: {:?}", outcome.errors);
    assert!(outcome.ok());
    assert_eq!(outcome.test_summary, "32 passed, 32 total");
    // Name is derived from the project basename plus the migration id.
    assert!(outcome.container_name.starts_with("ai-modernizer-"));
    assert!(outcome.container_name.ends_with("-mig-happ"));
    // Invariant: the container is gone after the run.
    assert_eq!(runtime.live_count(), 0);
}

#[tokio::test]
async fn noop_test_script_counts_as_no_tests() {
    let runtime = FakeRuntime::new();
    let project = node_project("echo \"no test\" && exit 0");
    let plan = upgrade_plan();

    let outcome = engine_with(runtime)
        .validate(
            ValidationRequest {
                migration_id: "mig-notest",
                project_root: project.path(),
                project_type: ProjectType::Node,
                plan: Some(&plan),
            },
            &NoopObserver,
            &CancellationToken::new(),
        )
        .await;

    assert!(!outcome.tests_found);
    assert!(!outcome.tests_ok);
    assert!(outcome.ok(), "ok must not require tests_ok when none found");
    assert_eq!(outcome.test_summary, "");
}

#[tokio::test]
async fn install_failure_short_circuits_but_still_verifies() {
    let runtime = FakeRuntime::new();
    runtime.script(
        "install",
        vec![failed_exec(1, "npm ERR! peer dep missing: react@>=17")],
    );
    let project = node_project("jest");
    let plan = upgrade_plan();

    let outcome = engine_with(runtime)
        .validate(
            ValidationRequest {
                migration_id: "mig-install-fail",
                project_root: project.path(),
                project_type: ProjectType::Node,
                plan: Some(&plan),
            },
            &NoopObserver,
            &CancellationToken::new(),
        )
        .await;

    assert!(!outcome.install_ok);
    assert!(!outcome.start_ok, "start must be skipped");
    assert!(!outcome.tests_found, "tests must be skipped");
    // The manifest was still written and read back correctly.
    assert!(outcome.versions_match);
    assert!(!outcome.ok());
    assert!(outcome.errors.iter().any(|e| e.starts_with("install:")));
    assert!(outcome.logs.contains_key("install"));
}

#[tokio::test]
async fn silent_version_drift_fails_the_run() {
    let runtime = FakeRuntime::new();
    // Whatever is written, the container reports the old version.
    runtime.readback_overrides.lock().unwrap().insert(
        "/app/package.json".to_string(),
        br#"{ "dependencies": { "express": "4.16.0", "dotenv": "16.0.0" } }"#.to_vec(),
    );
    let project = node_project("echo \"no test\" && exit 0");
    let plan = upgrade_plan();

    let outcome = engine_with(runtime)
        .validate(
            ValidationRequest {
                migration_id: "mig-drift",
                project_root: project.path(),
                project_type: ProjectType::Node,
                plan: Some(&plan),
            },
            &NoopObserver,
            &CancellationToken::new(),
        )
        .await;

    // Everything else is green, yet the run must fail loudly.
    assert!(outcome.install_ok);
    assert!(outcome.start_ok);
    assert!(outcome.health_ok);
    assert!(!outcome.versions_match);
    assert!(!outcome.ok());
    assert!(outcome
        .errors
        .iter()
        .any(|e| e.starts_with("verify_versions:") && e.contains("express")));
}

#[tokio::test]
async fn start_crash_captures_app_log() {
    let runtime = FakeRuntime::new();
    runtime.script("alive", vec![failed_exec(1, "")]);
    runtime.script(
        "applog",
        vec![ok_exec("Error: Cannot find module 'dotenv/config'\n")],
    );
    let project = node_project("jest");

    let outcome = engine_with(runtime)
        .validate(
            ValidationRequest {
                migration_id: "mig-crash",
                project_root: project.path(),
                project_type: ProjectType::Node,
                plan: None,
            },
            &NoopObserver,
            &CancellationToken::new(),
        )
        .await;

    assert!(outcome.install_ok);
    assert!(!outcome.start_ok);
    assert!(!outcome.health_ok);
    // Without a plan there is nothing to version-assert.
    assert!(outcome.versions_match);
    assert!(!outcome.ok());
    assert!(outcome
        .logs
        .get("start")
        .is_some_and(|log| log.contains("Cannot find module")));
}

#[tokio::test]
async fn port_conflict_runs_no_other_stage() {
    let runtime = FakeRuntime::new();
    runtime.fail_create("Bind for 0.0.0.0:3000 failed: port is already allocated");
    let project = node_project("jest");

    let outcome = engine_with(runtime.clone())
        .validate(
            ValidationRequest {
                migration_id: "mig-port",
                project_root: project.path(),
                project_type: ProjectType::Node,
                plan: None,
            },
            &NoopObserver,
            &CancellationToken::new(),
        )
        .await;

    assert!(!outcome.install_ok);
    assert!(!outcome.start_ok);
    assert!(!outcome.versions_match);
    assert!(!outcome.ok());
    assert_eq!(outcome.errors.len(), 1);
    assert!(outcome.errors[0].starts_with("create:"));
    // Nothing was created, nothing to tear down.
    assert_eq!(runtime.teardowns.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn keep_policy_leaves_container_running() {
    let runtime = FakeRuntime::new();
    let project = node_project("echo \"no test\" && exit 0");
    let config = ValidationConfig {
        cleanup: false,
        start_settle: Duration::from_millis(1),
        ..Default::default()
    };

    let outcome = ValidationEngine::new(runtime.clone(), config)
        .validate(
            ValidationRequest {
                migration_id: "mig-keep",
                project_root: project.path(),
                project_type: ProjectType::Node,
                plan: None,
            },
            &NoopObserver,
            &CancellationToken::new(),
        )
        .await;

    assert!(outcome.ok());
    assert_eq!(runtime.live_count(), 1, "keep-for-debug must not remove");
}

#[tokio::test]
async fn canceled_validation_still_tears_down() {
    let runtime = FakeRuntime::new();
    let project = node_project("jest");
    let cancel = CancellationToken::new();
    cancel.cancel();

    let outcome = engine_with(runtime.clone())
        .validate(
            ValidationRequest {
                migration_id: "mig-cancel",
                project_root: project.path(),
                project_type: ProjectType::Node,
                plan: None,
            },
            &NoopObserver,
            &cancel,
        )
        .await;

    assert!(!outcome.ok());
    assert!(outcome.errors.iter().any(|e| e.starts_with("canceled")));
    assert_eq!(runtime.live_count(), 0, "cancellation must release the container");
}
