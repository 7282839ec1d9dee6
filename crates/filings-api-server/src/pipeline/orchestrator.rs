use super::state::{
    BatchProcessingState, ChunkEmbeddingRecord, DocumentChunkRecord, ProcessedDocument,
    ProcessingStatus,
};
use super::{EmbeddingSink, PipelineJob};
use crate::config::PipelineConfig;
use crate::database::{DocumentRecord, EmbeddingUpsert, OwnerKind};
use crate::document::{TextChunker, TextExtractor};
use crate::edgar::FilingFetcher;
use crate::services::embedding_service::EmbeddingProvider;
use crate::services::progress_bus::{
    CompletionNotice, ErrorNotice, ProcessingEvent, ProgressBus, ProgressUpdate,
};
use crate::storage::BlobStore;
use crate::utils::error::ApiError;
use crate::utils::hash::chunk_hash;
use anyhow::{Context, Result};
use chrono::Utc;
use dashmap::DashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// The five ingestion stages, in their only legal order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Download,
    Extract,
    Chunk,
    Embed,
    Persist,
}

const STAGES: [Stage; 5] = [
    Stage::Download,
    Stage::Extract,
    Stage::Chunk,
    Stage::Embed,
    Stage::Persist,
];

impl Stage {
    fn status(self) -> ProcessingStatus {
        match self {
            Stage::Download => ProcessingStatus::Downloading,
            Stage::Extract => ProcessingStatus::Extracting,
            Stage::Chunk => ProcessingStatus::Chunking,
            Stage::Embed => ProcessingStatus::GeneratingEmbeddings,
            Stage::Persist => ProcessingStatus::PersistingEmbeddings,
        }
    }

    fn max_attempts(self) -> u32 {
        match self {
            Stage::Embed => 5,
            _ => 3,
        }
    }

    /// Backoff before retry `attempt + 1`, clamped to the schedule's tail.
    fn backoff(self, attempt: u32) -> Duration {
        let schedule: &[u64] = match self {
            Stage::Embed => &[10, 30, 60, 120],
            _ => &[30, 60, 120],
        };
        let index = (attempt.saturating_sub(1) as usize).min(schedule.len() - 1);
        Duration::from_secs(schedule[index])
    }

    fn progress_window(self) -> (u8, u8) {
        match self {
            Stage::Download => (10, 20),
            Stage::Extract => (30, 40),
            Stage::Chunk => (50, 60),
            Stage::Embed => (70, 80),
            Stage::Persist => (90, 100),
        }
    }

    fn label(self) -> &'static str {
        match self {
            Stage::Download => "Downloading filings",
            Stage::Extract => "Extracting text",
            Stage::Chunk => "Chunking documents",
            Stage::Embed => "Generating embeddings",
            Stage::Persist => "Persisting embeddings",
        }
    }
}

/// Drives one ingestion batch through the five stages. Every stage writes
/// its artifact to the blob store before returning, so a restart after a
/// crash anywhere resumes with zero loss of prior work.
pub struct PipelineOrchestrator {
    fetcher: Arc<dyn FilingFetcher>,
    embedder: Arc<dyn EmbeddingProvider>,
    sink: Arc<dyn EmbeddingSink>,
    blobs: Arc<BlobStore>,
    bus: Arc<ProgressBus>,
    config: PipelineConfig,
    persist_locks: DashMap<Uuid, Arc<Mutex<()>>>,
}

impl PipelineOrchestrator {
    pub fn new(
        fetcher: Arc<dyn FilingFetcher>,
        embedder: Arc<dyn EmbeddingProvider>,
        sink: Arc<dyn EmbeddingSink>,
        blobs: Arc<BlobStore>,
        bus: Arc<ProgressBus>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            fetcher,
            embedder,
            sink,
            blobs,
            bus,
            config,
            persist_locks: DashMap::new(),
        }
    }

    /// Run the full pipeline for a job. Stage artifacts make every stage
    /// restartable; re-running a completed batch ends in the same rows and
    /// zero vector-store writes.
    pub async fn run(&self, job: &PipelineJob, ct: CancellationToken) -> Result<()> {
        let started = Instant::now();

        let state = BatchProcessingState::new(
            job.conversation_id,
            job.user_id,
            job.company_identifier.clone(),
            job.filing_types.clone(),
            job.job_id,
        );
        self.blobs.write_state(&state).await?;
        info!(
            "Pipeline set up for conversation {} ({}, {:?})",
            job.conversation_id, job.company_identifier, job.filing_types
        );

        for stage in STAGES {
            self.run_stage_with_retry(job, stage, &ct).await?;
        }

        let mut state = self.blobs.load_state(job.conversation_id).await?;
        state.transition(ProcessingStatus::Completed)?;
        self.blobs.write_state(&state).await?;

        let total = state.documents.len();
        self.bus.publish(
            job.conversation_id,
            ProcessingEvent::ProcessingComplete(CompletionNotice {
                total_documents: total,
                successful_documents: total,
                failed_documents: 0,
                duration_ms: Some(started.elapsed().as_millis() as u64),
                completed_at: Utc::now(),
            }),
        );
        info!(
            "Pipeline completed for conversation {} in {:?} ({} documents)",
            job.conversation_id,
            started.elapsed(),
            total
        );

        Ok(())
    }

    async fn run_stage_with_retry(
        &self,
        job: &PipelineJob,
        stage: Stage,
        ct: &CancellationToken,
    ) -> Result<()> {
        let max_attempts = stage.max_attempts();
        let mut attempt = 0;

        loop {
            attempt += 1;
            match self.run_stage(job, stage, ct).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    if !is_retryable(&e) || attempt >= max_attempts {
                        return Err(e);
                    }
                    let backoff = stage.backoff(attempt);
                    warn!(
                        "{} failed for conversation {} (attempt {}/{}), retrying in {:?}: {}",
                        stage.label(),
                        job.conversation_id,
                        attempt,
                        max_attempts,
                        backoff,
                        e
                    );
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    }

    /// One stage attempt: load state, mark in progress, run the body,
    /// persist state. Any error marks the state `Failed` and emits an
    /// error event before propagating to the retry harness. Cancellation
    /// is not a failure and leaves the state untouched.
    async fn run_stage(
        &self,
        job: &PipelineJob,
        stage: Stage,
        ct: &CancellationToken,
    ) -> Result<()> {
        let mut state = self.blobs.load_state(job.conversation_id).await?;
        state.transition(stage.status())?;
        state.error_message = None;
        self.blobs.write_state(&state).await?;

        let (start_percent, end_percent) = stage.progress_window();
        self.publish_update(job.conversation_id, stage, start_percent, None, None);

        let result = match stage {
            Stage::Download => self.stage_download(&mut state, ct).await,
            Stage::Extract => self.stage_extract(&mut state, ct).await,
            Stage::Chunk => self.stage_chunk(&mut state, ct).await,
            Stage::Embed => self.stage_embed(&mut state, ct).await,
            Stage::Persist => self.stage_persist(&mut state, ct).await,
        };

        match result {
            Ok(()) => {
                self.blobs.write_state(&state).await?;
                self.publish_update(
                    job.conversation_id,
                    stage,
                    end_percent,
                    Some(state.documents.len()),
                    Some(state.documents.len()),
                );
                Ok(())
            }
            Err(e) if matches!(e.downcast_ref::<ApiError>(), Some(ApiError::Cancelled)) => {
                info!(
                    "{} cancelled for conversation {}; artifacts remain valid",
                    stage.label(),
                    job.conversation_id
                );
                Err(e)
            }
            Err(e) => {
                state.transition(ProcessingStatus::Failed).ok();
                state.error_message = Some(e.to_string());
                self.blobs.write_state(&state).await?;
                self.bus.publish(
                    job.conversation_id,
                    ProcessingEvent::ProcessingError(ErrorNotice {
                        error_message: e.to_string(),
                        stage: stage.status().as_str().to_string(),
                        documents_processed: None,
                        timestamp: Utc::now(),
                    }),
                );
                Err(e)
            }
        }
    }

    fn publish_update(
        &self,
        conversation_id: Uuid,
        stage: Stage,
        percent: u8,
        documents_processed: Option<usize>,
        total_documents: Option<usize>,
    ) {
        self.bus.publish(
            conversation_id,
            ProcessingEvent::ProcessingUpdate(ProgressUpdate {
                stage: stage.status().as_str().to_string(),
                message: stage.label().to_string(),
                progress_percent: percent,
                documents_processed,
                total_documents,
                timestamp: Utc::now(),
            }),
        );
    }

    /// Stage 0: fetch the filings and persist them under `raw/`. The blob
    /// store skips files that already exist, so a retry re-downloads but
    /// re-writes nothing.
    async fn stage_download(
        &self,
        state: &mut BatchProcessingState,
        ct: &CancellationToken,
    ) -> Result<()> {
        let documents = self
            .fetcher
            .download_filings(&state.company_identifier, &state.filing_types, ct.clone())
            .await?;

        if documents.is_empty() {
            return Err(ApiError::NoFilingsFound(state.company_identifier.clone()).into());
        }

        self.blobs
            .persist_raw(&documents, state.conversation_id, ct)
            .await?;

        state.documents = documents
            .iter()
            .map(|doc| ProcessedDocument {
                file_name: doc.file_name.clone(),
                filing_type: doc.filing_type.clone(),
                accession_number: doc.accession_number.clone(),
                filing_date: doc.filing_date,
            })
            .collect();

        Ok(())
    }

    /// Stage 1: one `.txt` per raw file, skipping targets that exist.
    async fn stage_extract(
        &self,
        state: &mut BatchProcessingState,
        ct: &CancellationToken,
    ) -> Result<()> {
        let raw_dir = self.blobs.raw_dir(state.conversation_id);
        let extracted_dir = self.blobs.extracted_dir(state.conversation_id);
        let raw_files = self.blobs.list_files(&raw_dir).await?;

        let (start_percent, end_percent) = Stage::Extract.progress_window();
        let total = raw_files.len();

        for (i, file_name) in raw_files.iter().enumerate() {
            if ct.is_cancelled() {
                return Err(ApiError::Cancelled.into());
            }

            let target = extracted_dir.join(format!("{}.txt", file_stem(file_name)));
            if self.blobs.file_exists(&target).await? {
                debug!("Skipping already-extracted {}", file_name);
                continue;
            }

            let source = raw_dir.join(file_name);
            let text = tokio::task::spawn_blocking(move || TextExtractor::extract(&source))
                .await
                .context("Extraction task panicked")??;

            self.blobs.write_atomic(&target, text.as_bytes()).await?;

            let percent = interpolate(start_percent, end_percent, i + 1, total);
            self.publish_update(
                state.conversation_id,
                Stage::Extract,
                percent,
                Some(i + 1),
                Some(total),
            );
        }

        Ok(())
    }

    /// Stage 2: chunk every extracted text into `chunks.json`. The whole
    /// artifact is skipped when present; chunking is a pure function of
    /// the extracted texts and the write is atomic, so partial output is
    /// impossible.
    async fn stage_chunk(
        &self,
        state: &mut BatchProcessingState,
        ct: &CancellationToken,
    ) -> Result<()> {
        let chunks_path = self.blobs.chunks_path(state.conversation_id);
        if self.blobs.file_exists(&chunks_path).await? {
            debug!("chunks.json already present, skipping chunk stage body");
            return Ok(());
        }

        let extracted_dir = self.blobs.extracted_dir(state.conversation_id);
        let chunker = TextChunker::new(self.config.chunk_size, self.config.chunk_overlap);

        let mut records: Vec<DocumentChunkRecord> = Vec::new();
        for file_name in self.blobs.list_files(&extracted_dir).await? {
            if ct.is_cancelled() {
                return Err(ApiError::Cancelled.into());
            }

            let text = tokio::fs::read_to_string(extracted_dir.join(&file_name)).await?;
            let chunks = chunker.chunk(&text)?;
            let offsets = assign_offsets(&text, &chunks);

            let source_document = state
                .documents
                .iter()
                .find(|doc| file_stem(&doc.file_name) == file_stem(&file_name))
                .map(|doc| doc.file_name.clone())
                .unwrap_or_else(|| file_name.clone());

            for (index, (chunk, (start_offset, end_offset))) in
                chunks.into_iter().zip(offsets).enumerate()
            {
                records.push(DocumentChunkRecord {
                    source_document: source_document.clone(),
                    chunk_index: index as i32,
                    text: chunk,
                    start_offset,
                    end_offset,
                });
            }
        }

        let json = serde_json::to_vec_pretty(&records)?;
        self.blobs.write_atomic(&chunks_path, &json).await?;
        info!(
            "Chunked conversation {} into {} chunks",
            state.conversation_id,
            records.len()
        );

        Ok(())
    }

    /// Stage 3: vectors for every chunk into `embeddings.json`. This is
    /// the stage where money is spent; the whole-artifact skip on retry is
    /// the central cost property. Only the final artifact is ever written.
    async fn stage_embed(
        &self,
        state: &mut BatchProcessingState,
        ct: &CancellationToken,
    ) -> Result<()> {
        let embeddings_path = self.blobs.embeddings_path(state.conversation_id);
        if self.blobs.file_exists(&embeddings_path).await? {
            debug!("embeddings.json already present, skipping embed stage body");
            return Ok(());
        }

        if ct.is_cancelled() {
            return Err(ApiError::Cancelled.into());
        }

        let chunks_json = tokio::fs::read(self.blobs.chunks_path(state.conversation_id)).await?;
        let chunks: Vec<DocumentChunkRecord> = serde_json::from_slice(&chunks_json)?;

        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        let vectors = self.embedder.embed_batch(&texts).await?;

        if vectors.len() != chunks.len() {
            anyhow::bail!(
                "Embedding count mismatch: {} chunks, {} vectors",
                chunks.len(),
                vectors.len()
            );
        }

        let records: Vec<ChunkEmbeddingRecord> = chunks
            .into_iter()
            .zip(vectors)
            .map(|(chunk, embedding)| ChunkEmbeddingRecord { chunk, embedding })
            .collect();

        let json = serde_json::to_vec_pretty(&records)?;
        self.blobs.write_atomic(&embeddings_path, &json).await?;
        info!(
            "Embedded {} chunks for conversation {}",
            records.len(),
            state.conversation_id
        );

        Ok(())
    }

    /// Stage 4: hash-gated upsert into the vector store, serialized per
    /// conversation by a single-instance lock. No skip here; idempotence
    /// comes from the uniqueness tuple plus the content hash.
    async fn stage_persist(
        &self,
        state: &mut BatchProcessingState,
        ct: &CancellationToken,
    ) -> Result<()> {
        let lock = self
            .persist_locks
            .entry(state.conversation_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = tokio::time::timeout(
            Duration::from_secs(self.config.persist_lock_timeout_seconds),
            lock.lock(),
        )
        .await
        .map_err(|_| {
            anyhow::anyhow!(
                "Persist lock timeout for conversation {}",
                state.conversation_id
            )
        })?;

        if ct.is_cancelled() {
            return Err(ApiError::Cancelled.into());
        }

        let embeddings_json =
            tokio::fs::read(self.blobs.embeddings_path(state.conversation_id)).await?;
        let records: Vec<ChunkEmbeddingRecord> = serde_json::from_slice(&embeddings_json)?;

        let raw_dir = self.blobs.raw_dir(state.conversation_id);
        let document_records: Vec<DocumentRecord> = state
            .documents
            .iter()
            .map(|doc| DocumentRecord {
                document_id: doc.document_id(),
                conversation_id: Some(state.conversation_id),
                user_id: Some(state.user_id),
                title: document_title(&state.company_identifier, doc),
                content_type: content_type_for(&doc.file_name),
                file_path: Some(raw_dir.join(&doc.file_name).to_string_lossy().to_string()),
                full_text: None,
            })
            .collect();
        self.sink.register_documents(&document_records).await?;

        let mut items = Vec::with_capacity(records.len());
        for record in records {
            let document = state
                .documents
                .iter()
                .find(|doc| doc.file_name == record.chunk.source_document)
                .with_context(|| {
                    format!(
                        "Chunk source {} has no matching downloaded document",
                        record.chunk.source_document
                    )
                })?;

            items.push(EmbeddingUpsert {
                owner: OwnerKind::UserDocument,
                user_id: Some(state.user_id),
                conversation_id: Some(state.conversation_id),
                document_id: document.document_id(),
                document_title: document_title(&state.company_identifier, document),
                chunk_index: record.chunk.chunk_index,
                content: record.chunk.text.clone(),
                chunk_hash: chunk_hash(&record.chunk.text),
                embedding: record.embedding,
            });
        }

        let stats = self.sink.upsert_embeddings(items).await?;
        info!(
            "Persisted embeddings for conversation {}: {} inserted, {} updated, {} unchanged",
            state.conversation_id, stats.inserted, stats.updated, stats.unchanged
        );

        Ok(())
    }
}

/// Retry only what a retry could fix. Cancellation propagates untouched
/// and an empty archive result is deterministic.
fn is_retryable(e: &anyhow::Error) -> bool {
    !matches!(
        e.downcast_ref::<ApiError>(),
        Some(ApiError::Cancelled)
            | Some(ApiError::NoFilingsFound(_))
            | Some(ApiError::StateCorrupt(_))
    )
}

fn file_stem(file_name: &str) -> String {
    Path::new(file_name)
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| file_name.to_string())
}

fn content_type_for(file_name: &str) -> String {
    match Path::new(file_name)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_lowercase())
        .as_deref()
    {
        Some("pdf") => "application/pdf",
        Some("htm") | Some("html") => "text/html",
        Some("txt") => "text/plain",
        _ => "application/octet-stream",
    }
    .to_string()
}

fn document_title(company_identifier: &str, doc: &ProcessedDocument) -> String {
    format!(
        "{} {} ({})",
        company_identifier, doc.filing_type, doc.filing_date
    )
}

fn interpolate(start: u8, end: u8, done: usize, total: usize) -> u8 {
    if total == 0 {
        return end;
    }
    let span = (end - start) as usize;
    start + ((span * done) / total) as u8
}

/// Anchor each chunk to a character range in its source: search forward
/// from the cursor, fall back to the cursor itself when the chunk is not a
/// strict substring (the chunker trims), then advance the cursor past the
/// chunk. Ranges of overlapping chunks may themselves overlap.
pub fn assign_offsets(source: &str, chunks: &[String]) -> Vec<(usize, usize)> {
    let source_chars: Vec<char> = source.chars().collect();
    let source_len = source_chars.len();

    let mut cursor = 0usize;
    let mut offsets = Vec::with_capacity(chunks.len());

    for chunk in chunks {
        let from = cursor.min(source_len);
        let start = find_chars(&source_chars, chunk, from).unwrap_or(from);
        let end = start + chunk.chars().count();
        cursor = end;
        offsets.push((start, end));
    }

    offsets
}

fn find_chars(haystack: &[char], needle: &str, from: usize) -> Option<usize> {
    let needle_chars: Vec<char> = needle.chars().collect();
    if needle_chars.is_empty() {
        return Some(from);
    }
    if haystack.len() < needle_chars.len() {
        return None;
    }

    (from..=haystack.len() - needle_chars.len())
        .find(|&i| haystack[i..i + needle_chars.len()] == needle_chars[..])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::edgar::FilingDocument;
    use chrono::NaiveDate;
    use std::sync::atomic::{AtomicUsize, Ordering};

    // Hand-rolled doubles: deterministic, countable, no wire involved.

    struct StaticFetcher {
        filings: Vec<FilingDocument>,
        calls: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl FilingFetcher for StaticFetcher {
        async fn download_filings(
            &self,
            _company_identifier: &str,
            _filing_types: &[String],
            _ct: CancellationToken,
        ) -> Result<Vec<FilingDocument>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.filings.clone())
        }
    }

    struct CountingEmbedder {
        batch_calls: AtomicUsize,
        fail_first: bool,
    }

    #[async_trait::async_trait]
    impl EmbeddingProvider for CountingEmbedder {
        async fn embed(&self, _text: &str) -> Result<Vec<f32>> {
            Ok(vec![0.5; 4])
        }

        async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            let call = self.batch_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_first && call == 0 {
                anyhow::bail!("embedding provider unavailable");
            }
            Ok(texts.iter().map(|t| vec![t.len() as f32; 4]).collect())
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        upsert_calls: AtomicUsize,
        upserted_items: std::sync::Mutex<Vec<EmbeddingUpsert>>,
        registered: std::sync::Mutex<Vec<DocumentRecord>>,
    }

    #[async_trait::async_trait]
    impl EmbeddingSink for RecordingSink {
        async fn upsert_embeddings(&self, items: Vec<EmbeddingUpsert>) -> Result<crate::database::UpsertStats> {
            self.upsert_calls.fetch_add(1, Ordering::SeqCst);
            let mut guard = self.upserted_items.lock().unwrap();
            let stats = crate::database::UpsertStats {
                inserted: items.len(),
                updated: 0,
                unchanged: 0,
            };
            *guard = items;
            Ok(stats)
        }

        async fn register_documents(&self, documents: &[DocumentRecord]) -> Result<()> {
            *self.registered.lock().unwrap() = documents.to_vec();
            Ok(())
        }
    }

    fn filing(name: &str, form: &str, accession: &str, content: &str) -> FilingDocument {
        FilingDocument {
            content: content.as_bytes().to_vec(),
            file_name: name.to_string(),
            filing_type: form.to_string(),
            accession_number: accession.to_string(),
            filing_date: NaiveDate::from_ymd_opt(2024, 11, 1).unwrap(),
            company_identifier: "AAPL".to_string(),
        }
    }

    fn pipeline_config() -> PipelineConfig {
        PipelineConfig {
            worker_count: 1,
            queue_capacity: 8,
            chunk_size: 40,
            chunk_overlap: 10,
            persist_lock_timeout_seconds: 5,
        }
    }

    struct Harness {
        orchestrator: PipelineOrchestrator,
        fetcher: Arc<StaticFetcher>,
        embedder: Arc<CountingEmbedder>,
        sink: Arc<RecordingSink>,
        blobs: Arc<BlobStore>,
        _dir: tempfile::TempDir,
    }

    fn harness(filings: Vec<FilingDocument>, fail_first_embed: bool) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let blobs = Arc::new(BlobStore::new(dir.path()));
        let fetcher = Arc::new(StaticFetcher {
            filings,
            calls: AtomicUsize::new(0),
        });
        let embedder = Arc::new(CountingEmbedder {
            batch_calls: AtomicUsize::new(0),
            fail_first: fail_first_embed,
        });
        let sink = Arc::new(RecordingSink::default());
        let bus = Arc::new(ProgressBus::new(64));

        let orchestrator = PipelineOrchestrator::new(
            fetcher.clone(),
            embedder.clone(),
            sink.clone(),
            blobs.clone(),
            bus,
            pipeline_config(),
        );

        Harness {
            orchestrator,
            fetcher,
            embedder,
            sink,
            blobs,
            _dir: dir,
        }
    }

    fn job() -> PipelineJob {
        PipelineJob {
            job_id: Uuid::new_v4(),
            conversation_id: Uuid::new_v4(),
            user_id: 7,
            company_identifier: "AAPL".to_string(),
            filing_types: vec!["10-K".to_string()],
        }
    }

    #[tokio::test]
    async fn test_fresh_ingestion_produces_all_artifacts() {
        let h = harness(
            vec![filing(
                "000032019324000001_aapl.txt",
                "10-K",
                "0000320193-24-000001",
                "Apple discussed supply chain risk across multiple regions this year.",
            )],
            false,
        );
        let job = job();

        h.orchestrator
            .run(&job, CancellationToken::new())
            .await
            .unwrap();

        let state = h.blobs.load_state(job.conversation_id).await.unwrap();
        assert_eq!(state.status, ProcessingStatus::Completed);
        assert!(state.completed_at.is_some());
        assert_eq!(state.documents.len(), 1);

        // raw/, extracted/, chunks.json, embeddings.json all present.
        let raw = h.blobs.list_files(&h.blobs.raw_dir(job.conversation_id)).await.unwrap();
        assert_eq!(raw.len(), 1);
        let extracted = h
            .blobs
            .list_files(&h.blobs.extracted_dir(job.conversation_id))
            .await
            .unwrap();
        assert_eq!(extracted, vec!["000032019324000001_aapl.txt".to_string()]);

        let chunks: Vec<DocumentChunkRecord> = serde_json::from_slice(
            &tokio::fs::read(h.blobs.chunks_path(job.conversation_id)).await.unwrap(),
        )
        .unwrap();
        assert!(!chunks.is_empty());

        let embeddings: Vec<ChunkEmbeddingRecord> = serde_json::from_slice(
            &tokio::fs::read(h.blobs.embeddings_path(job.conversation_id))
                .await
                .unwrap(),
        )
        .unwrap();
        assert_eq!(embeddings.len(), chunks.len());

        // Vector store saw one row per chunk, owned as a user document.
        let items = h.sink.upserted_items.lock().unwrap();
        assert_eq!(items.len(), chunks.len());
        assert!(items.iter().all(|i| i.owner == OwnerKind::UserDocument));
        assert!(items
            .iter()
            .all(|i| i.document_id == "10-K_0000320193-24-000001"));

        let registered = h.sink.registered.lock().unwrap();
        assert_eq!(registered.len(), 1);
        assert_eq!(registered[0].content_type, "text/plain");
    }

    #[tokio::test]
    async fn test_second_run_skips_embedding_spend() {
        let h = harness(
            vec![filing(
                "000032019324000001_aapl.txt",
                "10-K",
                "0000320193-24-000001",
                "Identical content both runs.",
            )],
            false,
        );
        let job = job();

        h.orchestrator.run(&job, CancellationToken::new()).await.unwrap();
        h.orchestrator.run(&job, CancellationToken::new()).await.unwrap();

        // embeddings.json existed on the second run, so the provider was
        // only ever paid once; the store still saw both upserts (the hash
        // gate is its concern).
        assert_eq!(h.embedder.batch_calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.sink.upsert_calls.load(Ordering::SeqCst), 2);
        assert_eq!(h.fetcher.calls.load(Ordering::SeqCst), 2);

        let state = h.blobs.load_state(job.conversation_id).await.unwrap();
        assert_eq!(state.status, ProcessingStatus::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_embed_stage_retries_after_provider_failure() {
        let h = harness(
            vec![filing(
                "000032019324000001_aapl.txt",
                "10-K",
                "0000320193-24-000001",
                "Content that fails to embed on the first try.",
            )],
            true,
        );
        let job = job();

        h.orchestrator.run(&job, CancellationToken::new()).await.unwrap();

        assert_eq!(h.embedder.batch_calls.load(Ordering::SeqCst), 2);
        let state = h.blobs.load_state(job.conversation_id).await.unwrap();
        assert_eq!(state.status, ProcessingStatus::Completed);

        let embeddings: Vec<ChunkEmbeddingRecord> = serde_json::from_slice(
            &tokio::fs::read(h.blobs.embeddings_path(job.conversation_id))
                .await
                .unwrap(),
        )
        .unwrap();
        assert!(!embeddings.is_empty());
    }

    #[tokio::test]
    async fn test_empty_archive_fails_without_retry() {
        let h = harness(Vec::new(), false);
        let job = job();

        let err = h
            .orchestrator
            .run(&job, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ApiError>(),
            Some(ApiError::NoFilingsFound(_))
        ));
        // Deterministic outcome: one fetch, no retries.
        assert_eq!(h.fetcher.calls.load(Ordering::SeqCst), 1);

        let state = h.blobs.load_state(job.conversation_id).await.unwrap();
        assert_eq!(state.status, ProcessingStatus::Failed);
        assert!(state.error_message.is_some());
    }

    #[tokio::test]
    async fn test_cancellation_is_not_a_failure() {
        let h = harness(
            vec![filing(
                "000032019324000001_aapl.txt",
                "10-K",
                "0000320193-24-000001",
                "Never gets processed.",
            )],
            false,
        );
        let job = job();
        let ct = CancellationToken::new();
        ct.cancel();

        let err = h.orchestrator.run(&job, ct).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ApiError>(),
            Some(ApiError::Cancelled)
        ));

        // Cancellation leaves the in-progress status, not Failed.
        let state = h.blobs.load_state(job.conversation_id).await.unwrap();
        assert_eq!(state.status, ProcessingStatus::Downloading);
        assert!(state.error_message.is_none());
    }

    #[test]
    fn test_offsets_track_overlapping_chunks() {
        let source = "abcdefghijklmnopqrstuvwxyz";
        let chunks = vec!["abcdefghij".to_string(), "ghijklmnop".to_string()];

        let offsets = assign_offsets(source, &chunks);
        assert_eq!(offsets, vec![(0, 10), (6, 16)]);
    }

    #[test]
    fn test_offsets_fall_back_to_cursor_for_trimmed_chunks() {
        // The chunker trims, so the second chunk is not a substring.
        let source = "first part   \n   second part";
        let chunks = vec!["first part".to_string(), "not in source".to_string()];

        let offsets = assign_offsets(source, &chunks);
        assert_eq!(offsets[0], (0, 10));
        // Fallback anchors at the cursor left by the previous chunk.
        assert_eq!(offsets[1], (10, 10 + "not in source".chars().count()));
    }

    #[test]
    fn test_offsets_cursor_clamped_to_source_length() {
        let source = "tiny";
        let chunks = vec!["tiny".to_string(), "overflow".to_string()];

        let offsets = assign_offsets(source, &chunks);
        assert_eq!(offsets[0], (0, 4));
        assert_eq!(offsets[1].0, 4);
    }

    #[test]
    fn test_backoff_schedules() {
        assert_eq!(Stage::Download.backoff(1), Duration::from_secs(30));
        assert_eq!(Stage::Download.backoff(2), Duration::from_secs(60));
        assert_eq!(Stage::Download.backoff(3), Duration::from_secs(120));
        assert_eq!(Stage::Embed.backoff(1), Duration::from_secs(10));
        assert_eq!(Stage::Embed.backoff(4), Duration::from_secs(120));
        // Clamped to the tail beyond the schedule.
        assert_eq!(Stage::Embed.backoff(9), Duration::from_secs(120));
    }
}
