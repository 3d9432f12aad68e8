//! Repository gateway contract.
//!
//! Reading manifests, creating branches and opening pull requests are
//! delegated to an external service. The core only defines the seam and
//! the error split (transient failures are retried with backoff by the
//! caller; permanent ones abort deployment). `LocalRepo` serves reads for
//! projects already on disk; remote implementations live outside the
//! core and tests substitute doubles.

use std::collections::BTreeMap;
use std::path::PathBuf;

use async_trait::async_trait;

/// Error type for gateway operations.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    /// Worth a bounded backoff retry.
    #[error("Transient gateway failure: {0}")]
    Transient(String),

    #[error("Permanent gateway failure: {0}")]
    Permanent(String),
}

impl GatewayError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

pub type GatewayResult<T> = Result<T, GatewayError>;

/// Files to commit: repo-relative path → content bytes.
pub type FileSet = BTreeMap<String, Vec<u8>>;

/// The opaque repository collaborator.
#[async_trait]
pub trait RepoGateway: Send + Sync {
    async fn read_file(&self, path: &str) -> GatewayResult<Vec<u8>>;

    async fn create_branch(&self, branch_name: &str, from_branch: &str) -> GatewayResult<()>;

    async fn push_files(
        &self,
        branch_name: &str,
        files: FileSet,
        commit_message: &str,
    ) -> GatewayResult<()>;

    /// Returns the URL of the opened pull request.
    async fn open_pull_request(
        &self,
        title: &str,
        body: &str,
        head: &str,
        base: &str,
    ) -> GatewayResult<String>;
}

/// Read-only gateway over a local working copy. Write operations fail
/// permanently: a local tree has no remote to push to, and the workflow
/// surfaces that as a deployment failure rather than pretending.
pub struct LocalRepo {
    root: PathBuf,
}

impl LocalRepo {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl RepoGateway for LocalRepo {
    async fn read_file(&self, path: &str) -> GatewayResult<Vec<u8>> {
        let full = self.root.join(path);
        tokio::fs::read(&full)
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => GatewayError::NotFound(full.display().to_string()),
                _ => GatewayError::Transient(e.to_string()),
            })
    }

    async fn create_branch(&self, _branch_name: &str, _from_branch: &str) -> GatewayResult<()> {
        Err(GatewayError::Permanent(
            "local source has no remote repository".into(),
        ))
    }

    async fn push_files(
        &self,
        _branch_name: &str,
        _files: FileSet,
        _commit_message: &str,
    ) -> GatewayResult<()> {
        Err(GatewayError::Permanent(
            "local source has no remote repository".into(),
        ))
    }

    async fn open_pull_request(
        &self,
        _title: &str,
        _body: &str,
        _head: &str,
        _base: &str,
    ) -> GatewayResult<String> {
        Err(GatewayError::Permanent(
            "local source has no remote repository".into(),
        ))
    }
}
