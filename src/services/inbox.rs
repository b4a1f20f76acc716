//! Candidate structures handed over by the external strategy builder.

use async_trait::async_trait;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::domain::CondorStructure;
use crate::error::Result;

/// Supplies candidate condors to the open trigger
#[async_trait]
pub trait StructureSource: Send + Sync {
    fn name(&self) -> &str;

    /// Candidates ready now. Each is returned once.
    async fn next_batch(&self) -> Result<Vec<CondorStructure>>;
}

#[derive(Deserialize)]
#[serde(untagged)]
enum InboxFile {
    One(CondorStructure),
    Many(Vec<CondorStructure>),
}

/// Reads `*.json` files from a directory. Each file holds one structure or
/// an array of them. Consumed files move to `processed/`, unparseable ones
/// to `rejected/`.
#[derive(Debug, Clone)]
pub struct JsonInboxSource {
    dir: PathBuf,
}

impl JsonInboxSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    async fn move_into(path: &Path, target_dir: &Path) -> Result<()> {
        tokio::fs::create_dir_all(target_dir).await?;
        if let Some(name) = path.file_name() {
            tokio::fs::rename(path, target_dir.join(name)).await?;
        }
        Ok(())
    }

    async fn pending_files(&self) -> Result<Vec<PathBuf>> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(dir = %self.dir.display(), "inbox does not exist yet");
                return Ok(Vec::new());
            }
            Err(e) => return Err(e.into()),
        };

        let mut files = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let is_json = path.extension().map(|ext| ext == "json").unwrap_or(false);
            if is_json && entry.file_type().await?.is_file() {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }
}

#[async_trait]
impl StructureSource for JsonInboxSource {
    fn name(&self) -> &str {
        "json-inbox"
    }

    async fn next_batch(&self) -> Result<Vec<CondorStructure>> {
        let mut batch = Vec::new();
        for path in self.pending_files().await? {
            let body = tokio::fs::read_to_string(&path).await?;
            match serde_json::from_str::<InboxFile>(&body) {
                Ok(InboxFile::One(structure)) => batch.push(structure),
                Ok(InboxFile::Many(structures)) => batch.extend(structures),
                Err(e) => {
                    warn!(file = %path.display(), error = %e, "unreadable candidate, moved to rejected/");
                    Self::move_into(&path, &self.dir.join("rejected")).await?;
                    continue;
                }
            }
            Self::move_into(&path, &self.dir.join("processed")).await?;
        }
        if !batch.is_empty() {
            info!(count = batch.len(), dir = %self.dir.display(), "candidates picked up");
        }
        Ok(batch)
    }
}
