//! Position snapshot on disk.
//!
//! The engine writes the Open set and every flagged position after each
//! state change so a restart can reconcile them against the exchange.
//! Writes go to a temp file first and are renamed into place.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::domain::Position;
use crate::error::{CondorError, Result};

const STATE_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedState {
    pub version: u32,
    pub saved_at: DateTime<Utc>,
    #[serde(default)]
    pub open: Vec<Position>,
    /// Positions awaiting manual intervention
    #[serde(default)]
    pub flagged: Vec<Position>,
}

impl Default for PersistedState {
    fn default() -> Self {
        Self {
            version: STATE_VERSION,
            saved_at: Utc::now(),
            open: Vec::new(),
            flagged: Vec::new(),
        }
    }
}

impl PersistedState {
    pub fn is_empty(&self) -> bool {
        self.open.is_empty() && self.flagged.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Missing file means a fresh start
    pub async fn load(&self) -> Result<PersistedState> {
        let body = match tokio::fs::read_to_string(&self.path).await {
            Ok(v) => v,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(PersistedState::default())
            }
            Err(e) => return Err(CondorError::Io(e)),
        };
        let state: PersistedState = serde_json::from_str(&body)?;
        if state.version != STATE_VERSION {
            return Err(CondorError::Validation(format!(
                "state file {} has version {}, expected {}",
                self.path.display(),
                state.version,
                STATE_VERSION
            )));
        }
        Ok(state)
    }

    pub async fn save<'a>(
        &self,
        open: impl IntoIterator<Item = &'a Position>,
        flagged: impl IntoIterator<Item = &'a Position>,
    ) -> Result<()> {
        let state = PersistedState {
            version: STATE_VERSION,
            saved_at: Utc::now(),
            open: open.into_iter().cloned().collect(),
            flagged: flagged.into_iter().cloned().collect(),
        };

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = self.path.with_extension("json.tmp");
        let body = serde_json::to_string_pretty(&state)?;
        tokio::fs::write(&tmp, body).await?;
        tokio::fs::rename(&tmp, &self.path).await?;

        debug!(
            path = %self.path.display(),
            open = state.open.len(),
            flagged = state.flagged.len(),
            "state saved"
        );
        Ok(())
    }
}
