use crate::edgar::FilingDocument;
use crate::pipeline::state::BatchProcessingState;
use crate::utils::error::ApiError;
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

/// Per-conversation staging area between pipeline stages:
///
/// ```text
/// {base}/{conversationId}/
///   raw/          downloaded documents as fetched
///   extracted/    extracted text, one .txt per raw file
///   chunks/       chunks.json
///   embeddings/   embeddings.json
///   status.json   durable pipeline record
/// ```
///
/// Every write lands in `{path}.tmp` first and is renamed into place, so a
/// reader never observes a partially written artifact.
pub struct BlobStore {
    base: PathBuf,
}

impl BlobStore {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    pub fn conversation_dir(&self, conversation_id: Uuid) -> PathBuf {
        self.base.join(conversation_id.to_string())
    }

    pub fn raw_dir(&self, conversation_id: Uuid) -> PathBuf {
        self.conversation_dir(conversation_id).join("raw")
    }

    pub fn extracted_dir(&self, conversation_id: Uuid) -> PathBuf {
        self.conversation_dir(conversation_id).join("extracted")
    }

    pub fn chunks_path(&self, conversation_id: Uuid) -> PathBuf {
        self.conversation_dir(conversation_id)
            .join("chunks")
            .join("chunks.json")
    }

    pub fn embeddings_path(&self, conversation_id: Uuid) -> PathBuf {
        self.conversation_dir(conversation_id)
            .join("embeddings")
            .join("embeddings.json")
    }

    pub fn state_path(&self, conversation_id: Uuid) -> PathBuf {
        self.conversation_dir(conversation_id).join("status.json")
    }

    /// Atomic write: parent dirs ensured, content to `{path}.tmp`, rename
    /// into place. The temp file is cleaned up on failure, best-effort.
    pub async fn write_atomic(&self, path: &Path, content: &[u8]) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create directory {}", parent.display()))?;
        }

        let tmp_path = path.with_extension(match path.extension().and_then(|e| e.to_str()) {
            Some(ext) => format!("{}.tmp", ext),
            None => "tmp".to_string(),
        });

        if let Err(e) = tokio::fs::write(&tmp_path, content).await {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(e).with_context(|| format!("Failed to write {}", tmp_path.display()));
        }

        if let Err(e) = tokio::fs::rename(&tmp_path, path).await {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(e).with_context(|| format!("Failed to rename into {}", path.display()));
        }

        Ok(())
    }

    /// Write each filing to `raw/{fileName}`. Idempotent: files that
    /// already exist are skipped, which is what makes download retries
    /// cheap. Returns the number of files actually written.
    pub async fn persist_raw(
        &self,
        documents: &[FilingDocument],
        conversation_id: Uuid,
        ct: &CancellationToken,
    ) -> Result<usize> {
        let raw_dir = self.raw_dir(conversation_id);
        tokio::fs::create_dir_all(&raw_dir).await?;

        let mut written = 0;
        for doc in documents {
            if ct.is_cancelled() {
                return Err(ApiError::Cancelled.into());
            }

            let target = raw_dir.join(&doc.file_name);
            if tokio::fs::try_exists(&target).await? {
                debug!("Skipping existing raw file {}", doc.file_name);
                continue;
            }

            self.write_atomic(&target, &doc.content).await?;
            written += 1;
        }

        debug!(
            "Persisted {}/{} raw documents for conversation {}",
            written,
            documents.len(),
            conversation_id
        );

        Ok(written)
    }

    /// Durable state, written atomically on every change.
    pub async fn write_state(&self, state: &BatchProcessingState) -> Result<()> {
        let path = self.state_path(state.conversation_id);
        let json = serde_json::to_vec_pretty(state)?;
        self.write_atomic(&path, &json).await
    }

    /// Load the durable state. A missing or unreadable file is
    /// `StateCorrupt`; only pipeline setup may start from nothing.
    pub async fn load_state(&self, conversation_id: Uuid) -> Result<BatchProcessingState> {
        let path = self.state_path(conversation_id);
        let bytes = tokio::fs::read(&path).await.map_err(|e| {
            warn!("status.json missing for conversation {}: {}", conversation_id, e);
            ApiError::StateCorrupt(format!("status.json unreadable: {}", e))
        })?;

        let state = serde_json::from_slice(&bytes)
            .map_err(|e| ApiError::StateCorrupt(format!("status.json unparseable: {}", e)))?;

        Ok(state)
    }

    pub async fn file_exists(&self, path: &Path) -> Result<bool> {
        Ok(tokio::fs::try_exists(path).await?)
    }

    /// File names (not paths) inside a staging subdirectory, sorted for
    /// deterministic stage iteration. An absent directory is empty.
    pub async fn list_files(&self, dir: &Path) -> Result<Vec<String>> {
        if !tokio::fs::try_exists(dir).await? {
            return Ok(Vec::new());
        }

        let mut names = Vec::new();
        let mut entries = tokio::fs::read_dir(dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_file() {
                let name = entry.file_name().to_string_lossy().to_string();
                // Leftover temp files from a crashed write are not artifacts.
                if !name.ends_with(".tmp") {
                    names.push(name);
                }
            }
        }

        names.sort();
        Ok(names)
    }
}
