//! File-backed checkpoint store.
//!
//! Layout per migration under the persist root:
//!
//! ```text
//! <root>/<migration_id>/state.json     latest committed MigrationState
//! <root>/<migration_id>/events.log     append-only event log (JSONL)
//! <root>/<migration_id>/logs/<stage>.txt  captured stage output
//! <root>/<migration_id>/reports/       written by downstream formatters
//! ```
//!
//! `state.json` is committed with write-then-rename so a crash mid-write
//! never leaves a half-checkpoint behind; resume always sees the last
//! fully committed revision.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::events::Event;
use crate::state::types::{MigrationId, MigrationState};

/// Error type for checkpoint store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Corrupt record at {path}: {detail}")]
    Corrupt { path: PathBuf, detail: String },

    #[error("No persisted record for migration {0}")]
    NotFound(MigrationId),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Cap on a single persisted stage log. Output beyond this is truncated
/// from the head so the tail (where failures surface) survives.
const STAGE_LOG_MAX_BYTES: usize = 64 * 1024;

fn io_err(path: &Path, source: std::io::Error) -> StoreError {
    StoreError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// File-backed store for migration state, event logs and stage output.
pub struct CheckpointStore {
    root: PathBuf,
}

impl CheckpointStore {
    /// Open (and create) a store rooted at the given directory.
    pub fn open(root: impl Into<PathBuf>) -> StoreResult<Self> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|e| io_err(&root, e))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn migration_dir(&self, id: &str) -> PathBuf {
        self.root.join(id)
    }

    /// Directory downstream report formatters write into. The core only
    /// points at it.
    pub fn reports_dir(&self, id: &str) -> PathBuf {
        self.migration_dir(id).join("reports")
    }

    /// Commit a state revision atomically (write to a temp file in the
    /// same directory, then rename over `state.json`).
    pub fn save_state(&self, state: &MigrationState) -> StoreResult<()> {
        let dir = self.migration_dir(&state.id);
        fs::create_dir_all(&dir).map_err(|e| io_err(&dir, e))?;

        let target = dir.join("state.json");
        let tmp = dir.join("state.json.tmp");

        let json = serde_json::to_string_pretty(state).map_err(|e| StoreError::Corrupt {
            path: target.clone(),
            detail: e.to_string(),
        })?;

        let mut file = fs::File::create(&tmp).map_err(|e| io_err(&tmp, e))?;
        file.write_all(json.as_bytes()).map_err(|e| io_err(&tmp, e))?;
        file.sync_all().map_err(|e| io_err(&tmp, e))?;
        fs::rename(&tmp, &target).map_err(|e| io_err(&target, e))?;

        debug!(migration_id = %state.id, phase = %state.phase, "checkpoint committed");
        Ok(())
    }

    /// Load the latest committed state for a migration.
    pub fn load_state(&self, id: &str) -> StoreResult<MigrationState> {
        let path = self.migration_dir(id).join("state.json");
        if !path.exists() {
            return Err(StoreError::NotFound(id.to_string()));
        }
        let json = fs::read_to_string(&path).map_err(|e| io_err(&path, e))?;
        serde_json::from_str(&json).map_err(|e| StoreError::Corrupt {
            path,
            detail: e.to_string(),
        })
    }

    /// Whether any committed record exists for this migration.
    pub fn exists(&self, id: &str) -> bool {
        self.migration_dir(id).join("state.json").exists()
    }

    /// All persisted migrations, newest first by `started_at`.
    pub fn list_states(&self) -> StoreResult<Vec<MigrationState>> {
        let mut states = Vec::new();
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) => return Err(io_err(&self.root, e)),
        };
        for entry in entries.flatten() {
            let id = entry.file_name().to_string_lossy().to_string();
            match self.load_state(&id) {
                Ok(state) => states.push(state),
                Err(StoreError::NotFound(_)) => {}
                Err(e) => warn!(migration_id = %id, error = %e, "skipping unreadable state"),
            }
        }
        states.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        Ok(states)
    }

    /// Append one event to the migration's durable log.
    pub fn append_event(&self, event: &Event) -> StoreResult<()> {
        let dir = self.migration_dir(&event.migration_id);
        fs::create_dir_all(&dir).map_err(|e| io_err(&dir, e))?;
        let path = dir.join("events.log");

        let line = serde_json::to_string(event).map_err(|e| StoreError::Corrupt {
            path: path.clone(),
            detail: e.to_string(),
        })?;

        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| io_err(&path, e))?;
        writeln!(file, "{line}").map_err(|e| io_err(&path, e))?;
        Ok(())
    }

    /// Read the full event log for a migration. Unparseable lines are
    /// skipped with a warning rather than failing the whole read.
    pub fn read_events(&self, id: &str) -> StoreResult<Vec<Event>> {
        let path = self.migration_dir(id).join("events.log");
        if !path.exists() {
            return Ok(Vec::new());
        }
        let content = fs::read_to_string(&path).map_err(|e| io_err(&path, e))?;
        let mut events = Vec::new();
        for (lineno, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<Event>(line) {
                Ok(event) => events.push(event),
                Err(e) => {
                    warn!(migration_id = %id, line = lineno + 1, error = %e, "skipping corrupt event line");
                }
            }
        }
        Ok(events)
    }

    /// Persist one stage's captured output, truncated from the head when
    /// over quota.
    pub fn write_stage_log(&self, id: &str, stage: &str, content: &str) -> StoreResult<()> {
        let dir = self.migration_dir(id).join("logs");
        fs::create_dir_all(&dir).map_err(|e| io_err(&dir, e))?;
        let path = dir.join(format!("{stage}.txt"));

        let bounded = if content.len() > STAGE_LOG_MAX_BYTES {
            let start = content.len() - STAGE_LOG_MAX_BYTES;
            // Respect char boundaries when slicing.
            let start = (start..content.len())
                .find(|i| content.is_char_boundary(*i))
                .unwrap_or(content.len());
            &content[start..]
        } else {
            content
        };

        fs::write(&path, bounded).map_err(|e| io_err(&path, e))?;
        Ok(())
    }
}
