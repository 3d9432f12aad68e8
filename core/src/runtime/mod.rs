//! Container runtime adapter.
//!
//! One sandbox per validation attempt. The trait is the seam the
//! validation engine drives; `DockerCli` is the production adapter and
//! tests substitute scripted fakes. All operations on a single container
//! are sequential; the core never drives one container from two tasks.

pub mod docker;

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use docker::DockerCli;

/// Cap on captured output per exec. Overflow truncates from the head so
/// the failing tail is preserved.
pub const EXEC_OUTPUT_MAX_BYTES: usize = 32 * 1024;

/// Error type for container operations, split by recoverability.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    /// Daemon hiccup worth a single in-stage retry.
    #[error("Transient runtime failure: {0}")]
    Transient(String),

    /// Image pull failure, port bind conflict, daemon down.
    #[error("Fatal runtime failure: {0}")]
    Fatal(String),

    /// The command exceeded its deadline.
    #[error("Exec timed out after {0:?}")]
    Timeout(Duration),

    #[error("Runtime I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type RuntimeResult<T> = Result<T, RuntimeError>;

/// What to do with the container when validation finishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TeardownPolicy {
    /// Remove the container and release its port binding.
    Remove,
    /// Keep it around for debugging (`CONTAINER_CLEANUP=false`).
    Keep,
}

/// Everything needed to create one sandbox.
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    /// Deterministic name; an existing container with it is removed first.
    pub name: String,
    pub image: String,
    pub working_dir: String,
    /// host port → container port.
    pub port_map: Option<(u16, u16)>,
    /// Memory limit, e.g. "512m". Empty means unlimited.
    pub memory_limit: String,
    /// CPU quota, e.g. "1.0". Empty means unlimited.
    pub cpu_limit: String,
}

/// Opaque reference to a created container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerHandle {
    pub name: String,
}

/// Result of one command inside the container.
#[derive(Debug, Clone, Default)]
pub struct ExecResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
}

impl ExecResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Both streams concatenated, stdout first.
    pub fn combined(&self) -> String {
        format!("{}{}", self.stdout, self.stderr)
    }
}

/// Single-container lifecycle contract.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Create and start a named sandbox. A leftover container with the
    /// same name is removed first.
    async fn create(&self, spec: &ContainerSpec) -> RuntimeResult<ContainerHandle>;

    /// Inject a host directory tree into the container.
    async fn copy_in(
        &self,
        handle: &ContainerHandle,
        host_path: &Path,
        container_path: &str,
        excludes: &[&str],
    ) -> RuntimeResult<()>;

    /// Write bytes to a file inside the container. Content is transported
    /// without passing through shell quoting, so arbitrary bytes survive.
    async fn write_file(
        &self,
        handle: &ContainerHandle,
        container_path: &str,
        bytes: &[u8],
    ) -> RuntimeResult<()>;

    /// Read a file back out of the container.
    async fn read_file(
        &self,
        handle: &ContainerHandle,
        container_path: &str,
    ) -> RuntimeResult<Vec<u8>>;

    /// Run argv inside the container with a deadline. Output is captured
    /// up to [`EXEC_OUTPUT_MAX_BYTES`] per stream.
    async fn exec(
        &self,
        handle: &ContainerHandle,
        argv: &[&str],
        env: &[(String, String)],
        timeout: Duration,
    ) -> RuntimeResult<ExecResult>;

    /// Remove or keep the container. Idempotent and best-effort.
    async fn teardown(&self, handle: &ContainerHandle, policy: TeardownPolicy)
        -> RuntimeResult<()>;

    /// Names of currently live containers (used by cleanup assertions).
    async fn live_containers(&self) -> RuntimeResult<Vec<String>>;
}

/// Truncate from the head, keeping the tail where failures surface.
pub fn truncate_head(text: &str, max_bytes: usize) -> String {
    if text.len() <= max_bytes {
        return text.to_string();
    }
    let start = text.len() - max_bytes;
    let start = (start..text.len())
        .find(|i| text.is_char_boundary(*i))
        .unwrap_or(text.len());
    format!("[truncated]…{}", &text[start..])
}

/// Deterministic container name: `ai-modernizer-` plus the lowercased
/// project basename with underscores flattened to hyphens, suffixed with
/// a short workflow id so concurrent runs on one project never collide.
pub fn container_name(project_basename: &str, migration_id: &str) -> String {
    let base: String = project_basename
        .to_lowercase()
        .chars()
        .map(|c| match c {
            '_' | ' ' => '-',
            c if c.is_ascii_alphanumeric() || c == '-' => c,
            _ => '-',
        })
        .collect();
    let suffix: String = migration_id.chars().take(8).collect();
    format!("ai-modernizer-{base}-{suffix}")
}
