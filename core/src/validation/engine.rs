//! Container validation engine.
//!
//! Given a project, its type and an optional plan, drive one sandbox
//! through create → inject → apply plan → install → start → health →
//! test → verify versions → teardown, and report every flag there is
//! evidence for. Short-circuit rules:
//!
//! - create failure: nothing else runs.
//! - install or start failure: skip straight to version verification.
//! - health failure: tests still run, so the analyzer sees both signals.
//! - verification always runs when a container exists; a version mismatch
//!   fails the outcome regardless of every other flag.
//! - teardown always runs, and its errors never displace a stage error.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::runtime::{
    container_name, ContainerHandle, ContainerRuntime, ContainerSpec, ExecResult, RuntimeError,
    TeardownPolicy,
};
use crate::state::types::{MigrationPlan, ProjectType, ValidationOutcome};
use crate::validation::manifest;
use crate::validation::summary::parse_test_summary;

/// Paths never injected into the sandbox.
const INJECT_EXCLUDES: &[&str] = &["node_modules", "venv", ".git", "__pycache__"];

/// Stage names as they appear in events, logs and error prefixes.
pub mod stage {
    pub const CREATE: &str = "create";
    pub const INJECT: &str = "inject";
    pub const APPLY_PLAN: &str = "apply_plan";
    pub const INSTALL: &str = "install";
    pub const START: &str = "start";
    pub const HEALTH: &str = "health";
    pub const TEST: &str = "test";
    pub const VERIFY_VERSIONS: &str = "verify_versions";
    pub const TEARDOWN: &str = "teardown";
}

/// Tunables for one validation run.
#[derive(Debug, Clone)]
pub struct ValidationConfig {
    pub node_port: u16,
    pub python_port: u16,
    /// `false` keeps the container around after the run for debugging.
    pub cleanup: bool,
    pub install_timeout: Duration,
    pub test_timeout: Duration,
    pub exec_timeout: Duration,
    /// Fixed settle delay between starting the app and probing it.
    pub start_settle: Duration,
    pub memory_limit: String,
    pub cpu_limit: String,
    /// Optional HTTP path probed during the health stage.
    pub health_path: Option<String>,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            node_port: 3000,
            python_port: 5000,
            cleanup: true,
            install_timeout: Duration::from_secs(300),
            test_timeout: Duration::from_secs(120),
            exec_timeout: Duration::from_secs(60),
            start_settle: Duration::from_secs(3),
            memory_limit: "512m".to_string(),
            cpu_limit: String::new(),
            health_path: None,
        }
    }
}

impl ValidationConfig {
    pub fn host_port(&self, project_type: ProjectType) -> u16 {
        match project_type {
            ProjectType::Node => self.node_port,
            ProjectType::Python => self.python_port,
        }
    }

    pub fn teardown_policy(&self) -> TeardownPolicy {
        if self.cleanup {
            TeardownPolicy::Remove
        } else {
            TeardownPolicy::Keep
        }
    }
}

/// One validation request.
pub struct ValidationRequest<'a> {
    pub migration_id: &'a str,
    pub project_root: &'a Path,
    pub project_type: ProjectType,
    pub plan: Option<&'a MigrationPlan>,
}

/// Receives a callback as each stage completes. The validator worker
/// bridges this onto the event bus.
pub trait StageObserver: Send + Sync {
    fn stage_done(&self, stage: &str, ok: bool, detail: &str);
}

/// Observer that ignores everything (unit tests, offline runs).
pub struct NoopObserver;

impl StageObserver for NoopObserver {
    fn stage_done(&self, _stage: &str, _ok: bool, _detail: &str) {}
}

const WORKING_DIR: &str = "/app";
const PID_FILE: &str = "/tmp/app.pid";
const APP_LOG: &str = "/tmp/app.log";

/// Drives one container per validation attempt.
pub struct ValidationEngine {
    runtime: Arc<dyn ContainerRuntime>,
    config: ValidationConfig,
}

impl ValidationEngine {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, config: ValidationConfig) -> Self {
        Self { runtime, config }
    }

    pub fn config(&self) -> &ValidationConfig {
        &self.config
    }

    /// Run the full stage sequence. Never returns an error: every failure
    /// is folded into the outcome so the analyzer has one uniform record
    /// to work from.
    pub async fn validate(
        &self,
        request: ValidationRequest<'_>,
        observer: &dyn StageObserver,
        cancel: &CancellationToken,
    ) -> ValidationOutcome {
        let basename = request
            .project_root
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "project".to_string());

        let mut outcome = ValidationOutcome {
            container_name: container_name(&basename, request.migration_id),
            host_port: self.config.host_port(request.project_type),
            ..Default::default()
        };

        // Stage 1: create. Failure here means there is nothing to tear down.
        let spec = ContainerSpec {
            name: outcome.container_name.clone(),
            image: request.project_type.base_image().to_string(),
            working_dir: WORKING_DIR.to_string(),
            port_map: Some((outcome.host_port, request.project_type.default_port())),
            memory_limit: self.config.memory_limit.clone(),
            cpu_limit: self.config.cpu_limit.clone(),
        };
        let handle = match self.create_with_retry(&spec).await {
            Ok(handle) => {
                observer.stage_done(stage::CREATE, true, &outcome.container_name);
                handle
            }
            Err(e) => {
                outcome.errors.push(format!("{}: {e}", stage::CREATE));
                observer.stage_done(stage::CREATE, false, &e.to_string());
                return outcome;
            }
        };

        self.run_stages(&request, &mut outcome, &handle, observer, cancel)
            .await;

        // Stage 9: teardown. Always, even after cancellation; errors are
        // logged but never recorded over a stage failure.
        let policy = self.config.teardown_policy();
        if let Err(e) = self.runtime.teardown(&handle, policy).await {
            warn!(container = %handle.name, error = %e, "teardown failed");
            observer.stage_done(stage::TEARDOWN, false, &e.to_string());
        } else {
            observer.stage_done(stage::TEARDOWN, true, "");
        }

        info!(
            container = %outcome.container_name,
            ok = outcome.ok(),
            install = outcome.install_ok,
            start = outcome.start_ok,
            health = outcome.health_ok,
            tests_found = outcome.tests_found,
            tests_ok = outcome.tests_ok,
            versions = outcome.versions_match,
            "validation finished"
        );
        outcome
    }

    /// Stages 2–8, with the container guaranteed to exist.
    async fn run_stages(
        &self,
        request: &ValidationRequest<'_>,
        outcome: &mut ValidationOutcome,
        handle: &ContainerHandle,
        observer: &dyn StageObserver,
        cancel: &CancellationToken,
    ) {
        let mut short_circuit = false;

        // Stage 2: inject the project tree.
        if self.check_canceled(outcome, cancel) {
            return;
        }
        match self
            .retry_transient(|| {
                self.runtime
                    .copy_in(handle, request.project_root, WORKING_DIR, INJECT_EXCLUDES)
            })
            .await
        {
            Ok(()) => observer.stage_done(stage::INJECT, true, ""),
            Err(e) => {
                outcome.errors.push(format!("{}: {e}", stage::INJECT));
                observer.stage_done(stage::INJECT, false, &e.to_string());
                short_circuit = true;
            }
        }

        // Stage 3: apply the plan to the manifest inside the container.
        if !short_circuit {
            if let Some(plan) = request.plan {
                if self.check_canceled(outcome, cancel) {
                    return;
                }
                match self.apply_plan(request, plan, handle).await {
                    Ok(()) => observer.stage_done(stage::APPLY_PLAN, true, ""),
                    Err(detail) => {
                        // Install proceeds against the unmutated manifest;
                        // version verification will flag the drift.
                        outcome.errors.push(format!("{}: {detail}", stage::APPLY_PLAN));
                        observer.stage_done(stage::APPLY_PLAN, false, &detail);
                    }
                }
            }
        }

        // Stage 4: install dependencies.
        if !short_circuit {
            if self.check_canceled(outcome, cancel) {
                return;
            }
            let argv: Vec<&str> = match request.project_type {
                // Dev dependencies are required so the test framework exists.
                ProjectType::Node => vec!["npm", "install"],
                ProjectType::Python => vec!["pip", "install", "-r", "requirements.txt"],
            };
            let result = self
                .exec_logged(handle, &argv, self.config.install_timeout, outcome, stage::INSTALL)
                .await;
            outcome.install_ok = result.as_ref().map(ExecResult::success).unwrap_or(false);
            observer.stage_done(
                stage::INSTALL,
                outcome.install_ok,
                &exit_detail(&result),
            );
            if !outcome.install_ok {
                record_exec_failure(outcome, stage::INSTALL, &result);
                short_circuit = true;
            }
        }

        // Stage 5: start the application in the background.
        if !short_circuit {
            if self.check_canceled(outcome, cancel) {
                return;
            }
            outcome.start_ok = self.start_app(request, handle, outcome).await;
            observer.stage_done(stage::START, outcome.start_ok, "");
            if !outcome.start_ok {
                short_circuit = true;
            }
        }

        // Stage 6: health check. A failure here does not skip the tests.
        if !short_circuit {
            if self.check_canceled(outcome, cancel) {
                return;
            }
            outcome.health_ok = self.health_check(request, handle, outcome).await;
            observer.stage_done(stage::HEALTH, outcome.health_ok, "");
        }

        // Stage 7: discover and run tests.
        if !short_circuit {
            if self.check_canceled(outcome, cancel) {
                return;
            }
            self.run_tests(request, handle, outcome, observer).await;
        }

        // Stage 8: verify versions. Runs even after a short-circuit so a
        // broken injection path is caught here rather than silently.
        if self.check_canceled(outcome, cancel) {
            return;
        }
        self.verify_versions(request, handle, outcome).await;
        let detail = if outcome.versions_match {
            ""
        } else {
            "installed versions drifted from the plan"
        };
        observer.stage_done(stage::VERIFY_VERSIONS, outcome.versions_match, detail);
    }

    fn check_canceled(&self, outcome: &mut ValidationOutcome, cancel: &CancellationToken) -> bool {
        if cancel.is_cancelled() {
            if !outcome.errors.iter().any(|e| e.starts_with("canceled")) {
                outcome.errors.push("canceled: validation aborted".to_string());
            }
            true
        } else {
            false
        }
    }

    async fn create_with_retry(
        &self,
        spec: &ContainerSpec,
    ) -> Result<ContainerHandle, RuntimeError> {
        self.retry_transient(|| self.runtime.create(spec)).await
    }

    /// One in-stage retry on transient daemon failures; everything else
    /// propagates immediately.
    async fn retry_transient<T, F, Fut>(&self, mut op: F) -> Result<T, RuntimeError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, RuntimeError>>,
    {
        match op().await {
            Err(RuntimeError::Transient(first)) => {
                warn!(error = %first, "transient runtime failure, retrying once");
                op().await
            }
            other => other,
        }
    }

    async fn apply_plan(
        &self,
        request: &ValidationRequest<'_>,
        plan: &MigrationPlan,
        handle: &ContainerHandle,
    ) -> Result<(), String> {
        let manifest_rel = request.project_type.manifest_path();
        let host_manifest = request.project_root.join(manifest_rel);
        let bytes = tokio::fs::read(&host_manifest)
            .await
            .map_err(|e| format!("read {}: {e}", host_manifest.display()))?;

        let mutated = manifest::apply_plan(request.project_type, &bytes, plan)
            .map_err(|e| e.to_string())?;

        let container_path = format!("{WORKING_DIR}/{manifest_rel}");
        self.retry_transient(|| self.runtime.write_file(handle, &container_path, &mutated))
            .await
            .map_err(|e| e.to_string())?;

        // Read-after-write: the manifest the installer sees must be the
        // bytes we produced.
        let echoed = self
            .runtime
            .read_file(handle, &container_path)
            .await
            .map_err(|e| e.to_string())?;
        if echoed != mutated {
            return Err("manifest read-back does not match written bytes".to_string());
        }
        Ok(())
    }

    async fn exec_logged(
        &self,
        handle: &ContainerHandle,
        argv: &[&str],
        timeout: Duration,
        outcome: &mut ValidationOutcome,
        stage: &str,
    ) -> Result<ExecResult, RuntimeError> {
        let result = self
            .retry_transient(|| self.runtime.exec(handle, argv, &[], timeout))
            .await;
        match &result {
            Ok(exec) => {
                outcome.logs.insert(stage.to_string(), exec.combined());
            }
            Err(e) => {
                outcome.logs.insert(stage.to_string(), e.to_string());
            }
        }
        result
    }

    /// Launch the app detached, wait the settle delay, then confirm the
    /// recorded pid is still alive.
    async fn start_app(
        &self,
        request: &ValidationRequest<'_>,
        handle: &ContainerHandle,
        outcome: &mut ValidationOutcome,
    ) -> bool {
        let entry = match self.entry_command(request, handle).await {
            Ok(entry) => entry,
            Err(detail) => {
                outcome.errors.push(format!("{}: {detail}", stage::START));
                return false;
            }
        };

        let launch = format!("nohup {entry} > {APP_LOG} 2>&1 & echo $! > {PID_FILE}");
        let argv = ["sh", "-c", launch.as_str()];
        if let Err(e) = self
            .retry_transient(|| self.runtime.exec(handle, &argv, &[], self.config.exec_timeout))
            .await
        {
            outcome.errors.push(format!("{}: {e}", stage::START));
            return false;
        }

        tokio::time::sleep(self.config.start_settle).await;

        let alive = self.process_alive(handle).await;
        if !alive {
            // Pull the app log so the analyzer sees the crash output.
            if let Ok(result) = self
                .runtime
                .exec(handle, &["cat", APP_LOG], &[], self.config.exec_timeout)
                .await
            {
                outcome.logs.insert(stage::START.to_string(), result.combined());
            }
            outcome
                .errors
                .push(format!("{}: process exited during settle delay", stage::START));
        }
        alive
    }

    async fn process_alive(&self, handle: &ContainerHandle) -> bool {
        let probe = format!("kill -0 $(cat {PID_FILE}) 2>/dev/null");
        let argv = ["sh", "-c", probe.as_str()];
        matches!(
            self.runtime
                .exec(handle, &argv, &[], self.config.exec_timeout)
                .await,
            Ok(result) if result.success()
        )
    }

    /// The command line that starts this project.
    async fn entry_command(
        &self,
        request: &ValidationRequest<'_>,
        handle: &ContainerHandle,
    ) -> Result<String, String> {
        match request.project_type {
            ProjectType::Node => {
                let manifest_path = format!("{WORKING_DIR}/package.json");
                let entry = match self.runtime.read_file(handle, &manifest_path).await {
                    Ok(bytes) => serde_json::from_slice::<serde_json::Value>(&bytes)
                        .ok()
                        .and_then(|v| v.get("main").and_then(|m| m.as_str()).map(str::to_string))
                        .unwrap_or_else(|| "index.js".to_string()),
                    Err(_) => "index.js".to_string(),
                };
                Ok(format!("node {entry}"))
            }
            ProjectType::Python => {
                for candidate in ["app.py", "main.py"] {
                    if request.project_root.join(candidate).exists() {
                        return Ok(format!("python {candidate}"));
                    }
                }
                // Package layout: a directory with __main__.py is runnable
                // as a module.
                let basename = request
                    .project_root
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_default();
                if request
                    .project_root
                    .join(&basename)
                    .join("__main__.py")
                    .exists()
                {
                    return Ok(format!("python -m {basename}"));
                }
                Ok("python app.py".to_string())
            }
        }
    }

    async fn health_check(
        &self,
        request: &ValidationRequest<'_>,
        handle: &ContainerHandle,
        outcome: &mut ValidationOutcome,
    ) -> bool {
        if !self.process_alive(handle).await {
            outcome
                .errors
                .push(format!("{}: process not running", stage::HEALTH));
            return false;
        }

        let Some(path) = &self.config.health_path else {
            return true;
        };

        let port = request.project_type.default_port();
        let url = format!("http://localhost:{port}{path}");
        let argv: Vec<String> = match request.project_type {
            ProjectType::Node => vec![
                "node".into(),
                "-e".into(),
                format!("fetch('{url}').then(r=>process.exit(r.ok?0:1)).catch(()=>process.exit(1))"),
            ],
            ProjectType::Python => vec![
                "python".into(),
                "-c".into(),
                format!(
                    "import urllib.request,sys\nsys.exit(0 if urllib.request.urlopen('{url}').status < 500 else 1)"
                ),
            ],
        };
        let argv_refs: Vec<&str> = argv.iter().map(String::as_str).collect();
        match self
            .runtime
            .exec(handle, &argv_refs, &[], self.config.exec_timeout)
            .await
        {
            Ok(result) if result.success() => true,
            Ok(result) => {
                outcome
                    .errors
                    .push(format!("{}: probe of {url} failed: {}", stage::HEALTH, result.combined()));
                false
            }
            Err(e) => {
                outcome.errors.push(format!("{}: {e}", stage::HEALTH));
                false
            }
        }
    }

    async fn run_tests(
        &self,
        request: &ValidationRequest<'_>,
        handle: &ContainerHandle,
        outcome: &mut ValidationOutcome,
        observer: &dyn StageObserver,
    ) {
        outcome.tests_found = match request.project_type {
            ProjectType::Node => {
                // Discovery reads the manifest as the container sees it, so
                // a plan that rewired scripts is honored.
                let manifest_path = format!("{WORKING_DIR}/package.json");
                let bytes = match self.runtime.read_file(handle, &manifest_path).await {
                    Ok(bytes) => bytes,
                    Err(_) => tokio::fs::read(request.project_root.join("package.json"))
                        .await
                        .unwrap_or_default(),
                };
                matches!(
                    manifest::node_test_script(&bytes),
                    Ok(Some(script)) if !manifest::is_noop_test_script(&script)
                )
            }
            ProjectType::Python => python_tests_present(request.project_root),
        };

        if !outcome.tests_found {
            outcome.test_summary = String::new();
            observer.stage_done(stage::TEST, true, "no tests found");
            return;
        }

        let result = match request.project_type {
            ProjectType::Node => {
                self.exec_logged(
                    handle,
                    &["npm", "test"],
                    self.config.test_timeout,
                    outcome,
                    stage::TEST,
                )
                .await
            }
            ProjectType::Python => {
                let pytest = self
                    .exec_logged(
                        handle,
                        &["pytest", "-v"],
                        self.config.test_timeout,
                        outcome,
                        stage::TEST,
                    )
                    .await;
                match &pytest {
                    // 127: pytest is not installed; fall back to unittest.
                    Ok(result) if result.exit_code == 127 => {
                        self.exec_logged(
                            handle,
                            &["python", "-m", "unittest", "discover"],
                            self.config.test_timeout,
                            outcome,
                            stage::TEST,
                        )
                        .await
                    }
                    _ => pytest,
                }
            }
        };

        match result {
            Ok(exec) => {
                outcome.tests_ok = exec.success();
                outcome.test_summary = parse_test_summary(&exec.combined());
                if !outcome.tests_ok {
                    outcome
                        .errors
                        .push(format!("{}: suite failed ({})", stage::TEST, outcome.test_summary));
                }
            }
            Err(e) => {
                outcome.tests_ok = false;
                outcome.test_summary = "unparsed".to_string();
                outcome.errors.push(format!("{}: {e}", stage::TEST));
            }
        }
        observer.stage_done(stage::TEST, outcome.tests_ok, &outcome.test_summary);
    }

    async fn verify_versions(
        &self,
        request: &ValidationRequest<'_>,
        handle: &ContainerHandle,
        outcome: &mut ValidationOutcome,
    ) {
        let assertions: Vec<(&str, &str)> = request
            .plan
            .map(|plan| plan.version_assertions())
            .unwrap_or_default();

        if assertions.is_empty() {
            // Nothing was supposed to change; trivially in sync.
            outcome.versions_match = true;
            return;
        }

        let manifest_path = format!("{WORKING_DIR}/{}", request.project_type.manifest_path());
        let bytes = match self.runtime.read_file(handle, &manifest_path).await {
            Ok(bytes) => bytes,
            Err(e) => {
                outcome.versions_match = false;
                outcome
                    .errors
                    .push(format!("{}: {e}", stage::VERIFY_VERSIONS));
                return;
            }
        };

        match manifest::verify_versions(request.project_type, &bytes, &assertions) {
            Ok(mismatches) if mismatches.is_empty() => {
                outcome.versions_match = true;
            }
            Ok(mismatches) => {
                outcome.versions_match = false;
                for mismatch in mismatches {
                    outcome
                        .errors
                        .push(format!("{}: {mismatch}", stage::VERIFY_VERSIONS));
                }
            }
            Err(e) => {
                outcome.versions_match = false;
                outcome
                    .errors
                    .push(format!("{}: {e}", stage::VERIFY_VERSIONS));
            }
        }
    }
}

fn exit_detail(result: &Result<ExecResult, RuntimeError>) -> String {
    match result {
        Ok(exec) => format!("exit {}", exec.exit_code),
        Err(e) => e.to_string(),
    }
}

fn record_exec_failure(
    outcome: &mut ValidationOutcome,
    stage: &str,
    result: &Result<ExecResult, RuntimeError>,
) {
    match result {
        Ok(exec) => outcome.errors.push(format!(
            "{stage}: exit {}: {}",
            exec.exit_code,
            crate::runtime::truncate_head(&exec.combined(), 2048)
        )),
        Err(e) => outcome.errors.push(format!("{stage}: {e}")),
    }
}

/// Python test discovery: `test_*.py`, `*_test.py`, or a `tests/` dir.
fn python_tests_present(project_root: &Path) -> bool {
    if project_root.join("tests").is_dir() {
        return true;
    }
    let Ok(entries) = std::fs::read_dir(project_root) else {
        return false;
    };
    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().to_string();
        if name.ends_with(".py") && (name.starts_with("test_") || name.ends_with("_test.py")) {
            return true;
        }
    }
    false
}
