//! Durable local cache.
//!
//! Each component keeps one JSON document in the state directory. Writes go
//! to a sibling temp file which is then renamed over the target, so a crash
//! mid-write leaves either the old or the new snapshot, never a torn one.

use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use serde::{Serialize, de::DeserializeOwned};
use tracing::{debug, warn};

use crate::error::{Result, SyncError};

/// File names used inside the state directory.
pub const AI_CACHE_FILE: &str = "ai-sync.json";
pub const DASHBOARD_CACHE_FILE: &str = "dashboard-sync.json";
pub const ORCHESTRATOR_CACHE_FILE: &str = "orchestrator.json";

/// A single JSON snapshot on disk.
#[derive(Debug, Clone)]
pub struct StateCache<T> {
    path: PathBuf,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Serialize + DeserializeOwned> StateCache<T> {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            _marker: PhantomData,
        }
    }

    /// Cache file `name` inside `dir`.
    pub fn in_dir(dir: &Path, name: &str) -> Self {
        Self::new(dir.join(name))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write the snapshot atomically (write tmp, then rename).
    pub fn save(&self, state: &T) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                SyncError::Persistence(format!("failed to create {}: {e}", parent.display()))
            })?;
        }

        let json = serde_json::to_string_pretty(state)?;
        let tmp_path = self.path.with_extension("json.tmp");
        std::fs::write(&tmp_path, json.as_bytes()).map_err(|e| {
            SyncError::Persistence(format!("failed to write {}: {e}", tmp_path.display()))
        })?;
        std::fs::rename(&tmp_path, &self.path).map_err(|e| {
            SyncError::Persistence(format!("failed to rename {}: {e}", self.path.display()))
        })?;

        debug!(path = %self.path.display(), bytes = json.len(), "State cache written");
        Ok(())
    }

    /// Read the snapshot back.
    ///
    /// A missing file is `Ok(None)`. A file that fails to parse is logged and
    /// also treated as absent so the process can start fresh.
    pub fn load(&self) -> Result<Option<T>> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        match serde_json::from_str(&content) {
            Ok(state) => Ok(Some(state)),
            Err(e) => {
                warn!(
                    path = %self.path.display(),
                    error = %e,
                    "Failed to parse state cache, starting fresh"
                );
                Ok(None)
            }
        }
    }
}
