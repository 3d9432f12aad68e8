//! Docker CLI adapter.
//!
//! Drives the local Docker daemon by spawning `docker` with argv vectors
//! (never a joined shell string). File content travels over stdin pipes
//! (`tee` inside the container), so JSON manifests full of quotes and
//! backticks arrive byte-exact. Shell-quoted injection corrupted
//! manifests silently in an earlier rendition of this pipeline; the pipe
//! transport is a hard requirement, not a style choice.

use std::path::Path;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

use super::{
    truncate_head, ContainerHandle, ContainerRuntime, ContainerSpec, ExecResult, RuntimeError,
    RuntimeResult, TeardownPolicy, EXEC_OUTPUT_MAX_BYTES,
};

/// Adapter over the `docker` binary.
pub struct DockerCli {
    /// Binary to invoke; overridable for podman-compatible setups.
    binary: String,
}

impl DockerCli {
    pub fn new() -> Self {
        Self {
            binary: "docker".to_string(),
        }
    }

    pub fn with_binary(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    /// Spawn `docker <args>`, optionally feeding bytes to stdin, with a
    /// deadline. The child is killed if the deadline passes.
    async fn run(
        &self,
        args: &[&str],
        stdin_bytes: Option<&[u8]>,
        timeout: Duration,
    ) -> RuntimeResult<(ExecResult, Vec<u8>)> {
        let started = Instant::now();
        let mut cmd = Command::new(&self.binary);
        cmd.args(args)
            .stdin(if stdin_bytes.is_some() {
                std::process::Stdio::piped()
            } else {
                std::process::Stdio::null()
            })
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|e| RuntimeError::Fatal(format!("failed to spawn {}: {e}", self.binary)))?;

        if let Some(bytes) = stdin_bytes {
            let mut stdin = child
                .stdin
                .take()
                .ok_or_else(|| RuntimeError::Transient("child stdin unavailable".into()))?;
            stdin.write_all(bytes).await?;
            stdin.shutdown().await?;
            drop(stdin);
        }

        let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(result) => result?,
            Err(_) => return Err(RuntimeError::Timeout(timeout)),
        };

        let raw_stdout = output.stdout;
        let stdout = truncate_head(&String::from_utf8_lossy(&raw_stdout), EXEC_OUTPUT_MAX_BYTES);
        let stderr = truncate_head(
            &String::from_utf8_lossy(&output.stderr),
            EXEC_OUTPUT_MAX_BYTES,
        );
        let exec = ExecResult {
            exit_code: output.status.code().unwrap_or(-1),
            stdout,
            stderr,
            duration: started.elapsed(),
        };
        Ok((exec, raw_stdout))
    }

    /// Map a failed `docker run` onto the transient/fatal split.
    fn classify_create_failure(stderr: &str) -> RuntimeError {
        let lower = stderr.to_lowercase();
        if lower.contains("port is already allocated") || lower.contains("address already in use") {
            RuntimeError::Fatal(format!("host port already bound: {stderr}"))
        } else if lower.contains("no such image")
            || lower.contains("pull access denied")
            || lower.contains("manifest unknown")
        {
            RuntimeError::Fatal(format!("image unavailable: {stderr}"))
        } else if lower.contains("cannot connect to the docker daemon") {
            RuntimeError::Fatal(format!("daemon unreachable: {stderr}"))
        } else {
            RuntimeError::Transient(stderr.to_string())
        }
    }
}

impl Default for DockerCli {
    fn default() -> Self {
        Self::new()
    }
}

const SHORT_TIMEOUT: Duration = Duration::from_secs(30);
const COPY_TIMEOUT: Duration = Duration::from_secs(120);

#[async_trait]
impl ContainerRuntime for DockerCli {
    async fn create(&self, spec: &ContainerSpec) -> RuntimeResult<ContainerHandle> {
        // A leftover container with this name belongs to a previous
        // attempt; replace it.
        let (removed, _) = self
            .run(&["rm", "-f", &spec.name], None, SHORT_TIMEOUT)
            .await?;
        if removed.success() {
            debug!(container = %spec.name, "removed leftover container");
        }

        let port_arg = spec
            .port_map
            .map(|(host, container)| format!("{host}:{container}"));
        let mut args: Vec<&str> = vec!["run", "-d", "--name", &spec.name, "-w", &spec.working_dir];
        if let Some(mapping) = &port_arg {
            args.push("-p");
            args.push(mapping);
        }
        if !spec.memory_limit.is_empty() {
            args.push("--memory");
            args.push(&spec.memory_limit);
        }
        if !spec.cpu_limit.is_empty() {
            args.push("--cpus");
            args.push(&spec.cpu_limit);
        }
        args.push(&spec.image);
        // Keep the container alive; stages exec into it.
        args.extend_from_slice(&["tail", "-f", "/dev/null"]);

        let (result, _) = self.run(&args, None, COPY_TIMEOUT).await?;
        if !result.success() {
            return Err(Self::classify_create_failure(&result.stderr));
        }

        // The working dir may not exist in the base image.
        let handle = ContainerHandle {
            name: spec.name.clone(),
        };
        let (mkdir, _) = self
            .run(
                &["exec", &spec.name, "mkdir", "-p", &spec.working_dir],
                None,
                SHORT_TIMEOUT,
            )
            .await?;
        if !mkdir.success() {
            return Err(RuntimeError::Transient(format!(
                "mkdir {} failed: {}",
                spec.working_dir, mkdir.stderr
            )));
        }
        Ok(handle)
    }

    async fn copy_in(
        &self,
        handle: &ContainerHandle,
        host_path: &Path,
        container_path: &str,
        excludes: &[&str],
    ) -> RuntimeResult<()> {
        // Tar on the host side honors excludes; docker cp does not.
        let tar_path = std::env::temp_dir().join(format!("modernizer-{}.tar", uuid::Uuid::new_v4()));
        let tar_path_str = tar_path.to_string_lossy().to_string();
        let host = host_path.to_string_lossy().to_string();

        let mut tar_args: Vec<String> = vec!["-C".into(), host, "-cf".into(), tar_path_str.clone()];
        for exclude in excludes {
            tar_args.push(format!("--exclude={exclude}"));
        }
        tar_args.push(".".into());

        let status = Command::new("tar")
            .args(&tar_args)
            .kill_on_drop(true)
            .status()
            .await?;
        if !status.success() {
            let _ = tokio::fs::remove_file(&tar_path).await;
            return Err(RuntimeError::Transient(format!(
                "tar of {} failed with status {status}",
                host_path.display()
            )));
        }

        let bytes = tokio::fs::read(&tar_path).await?;
        let _ = tokio::fs::remove_file(&tar_path).await;

        let (result, _) = self
            .run(
                &[
                    "exec",
                    "-i",
                    &handle.name,
                    "tar",
                    "-xf",
                    "-",
                    "-C",
                    container_path,
                ],
                Some(&bytes),
                COPY_TIMEOUT,
            )
            .await?;
        if !result.success() {
            return Err(RuntimeError::Transient(format!(
                "tar extract in {} failed: {}",
                handle.name, result.stderr
            )));
        }
        Ok(())
    }

    async fn write_file(
        &self,
        handle: &ContainerHandle,
        container_path: &str,
        bytes: &[u8],
    ) -> RuntimeResult<()> {
        // `tee` reads stdin and writes the file; no shell is involved, so
        // the content needs no quoting at all.
        let (result, _) = self
            .run(
                &["exec", "-i", &handle.name, "tee", container_path],
                Some(bytes),
                SHORT_TIMEOUT,
            )
            .await?;
        if !result.success() {
            return Err(RuntimeError::Transient(format!(
                "write to {container_path} failed: {}",
                result.stderr
            )));
        }
        Ok(())
    }

    async fn read_file(
        &self,
        handle: &ContainerHandle,
        container_path: &str,
    ) -> RuntimeResult<Vec<u8>> {
        let (result, raw) = self
            .run(
                &["exec", &handle.name, "cat", container_path],
                None,
                SHORT_TIMEOUT,
            )
            .await?;
        if !result.success() {
            return Err(RuntimeError::Transient(format!(
                "read of {container_path} failed: {}",
                result.stderr
            )));
        }
        Ok(raw)
    }

    async fn exec(
        &self,
        handle: &ContainerHandle,
        argv: &[&str],
        env: &[(String, String)],
        timeout: Duration,
    ) -> RuntimeResult<ExecResult> {
        let env_args: Vec<String> = env.iter().map(|(k, v)| format!("{k}={v}")).collect();
        let mut args: Vec<&str> = vec!["exec"];
        for pair in &env_args {
            args.push("-e");
            args.push(pair);
        }
        args.push(&handle.name);
        args.extend_from_slice(argv);

        let (result, _) = self.run(&args, None, timeout).await?;
        Ok(result)
    }

    async fn teardown(
        &self,
        handle: &ContainerHandle,
        policy: TeardownPolicy,
    ) -> RuntimeResult<()> {
        match policy {
            TeardownPolicy::Keep => {
                debug!(container = %handle.name, "keeping container for debugging");
                Ok(())
            }
            TeardownPolicy::Remove => {
                let (result, _) = self
                    .run(&["rm", "-f", &handle.name], None, SHORT_TIMEOUT)
                    .await?;
                if !result.success()
                    && !result.stderr.to_lowercase().contains("no such container")
                {
                    warn!(container = %handle.name, stderr = %result.stderr, "teardown failed");
                    return Err(RuntimeError::Transient(result.stderr));
                }
                Ok(())
            }
        }
    }

    async fn live_containers(&self) -> RuntimeResult<Vec<String>> {
        let (result, _) = self
            .run(&["ps", "--format", "{{.Names}}"], None, SHORT_TIMEOUT)
            .await?;
        if !result.success() {
            return Err(RuntimeError::Transient(result.stderr));
        }
        Ok(result
            .stdout
            .lines()
            .map(|l| l.trim().to_string())
            .filter(|l| !l.is_empty())
            .collect())
    }
}
