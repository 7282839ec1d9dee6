use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Pipeline status, advanced monotonically through the stage order.
/// `Failed` is terminal once the retry harness gives up; a retrying stage
/// re-enters its own in-progress value from `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProcessingStatus {
    Pending,
    Downloading,
    Extracting,
    Chunking,
    GeneratingEmbeddings,
    PersistingEmbeddings,
    Completed,
    Failed,
}

impl ProcessingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessingStatus::Pending => "Pending",
            ProcessingStatus::Downloading => "Downloading",
            ProcessingStatus::Extracting => "Extracting",
            ProcessingStatus::Chunking => "Chunking",
            ProcessingStatus::GeneratingEmbeddings => "GeneratingEmbeddings",
            ProcessingStatus::PersistingEmbeddings => "PersistingEmbeddings",
            ProcessingStatus::Completed => "Completed",
            ProcessingStatus::Failed => "Failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ProcessingStatus::Completed | ProcessingStatus::Failed)
    }

    fn rank(&self) -> u8 {
        match self {
            ProcessingStatus::Pending => 0,
            ProcessingStatus::Downloading => 1,
            ProcessingStatus::Extracting => 2,
            ProcessingStatus::Chunking => 3,
            ProcessingStatus::GeneratingEmbeddings => 4,
            ProcessingStatus::PersistingEmbeddings => 5,
            ProcessingStatus::Completed => 6,
            ProcessingStatus::Failed => 7,
        }
    }
}

impl std::fmt::Display for ProcessingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One filing recorded in the durable state after the download stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessedDocument {
    pub file_name: String,
    pub filing_type: String,
    pub accession_number: String,
    pub filing_date: NaiveDate,
}

impl ProcessedDocument {
    /// Opaque identifier matching `FilingDocument::document_id`.
    pub fn document_id(&self) -> String {
        format!("{}_{}", self.filing_type, self.accession_number)
    }
}

/// The per-conversation durable pipeline record, persisted as
/// `status.json` in the staging area. Everything else on disk is
/// reconstructible; this file is canonical.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchProcessingState {
    pub conversation_id: Uuid,
    pub user_id: i64,
    pub company_identifier: String,
    pub filing_types: Vec<String>,
    pub status: ProcessingStatus,
    pub job_id: Option<Uuid>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub documents: Vec<ProcessedDocument>,
}

impl BatchProcessingState {
    pub fn new(
        conversation_id: Uuid,
        user_id: i64,
        company_identifier: String,
        filing_types: Vec<String>,
        job_id: Uuid,
    ) -> Self {
        Self {
            conversation_id,
            user_id,
            company_identifier,
            filing_types,
            status: ProcessingStatus::Pending,
            job_id: Some(job_id),
            error_message: None,
            created_at: Utc::now(),
            completed_at: None,
            documents: Vec::new(),
        }
    }

    /// Advance the status. Forward moves only, except that any state may
    /// fail and a failed stage may be re-entered by the retry harness.
    /// `Completed` accepts no further transitions.
    pub fn transition(&mut self, next: ProcessingStatus) -> anyhow::Result<()> {
        if self.status == ProcessingStatus::Completed {
            anyhow::bail!(
                "Illegal transition {} -> {}: pipeline already completed",
                self.status,
                next
            );
        }

        let allowed = next == ProcessingStatus::Failed
            || self.status == ProcessingStatus::Failed
            || next.rank() >= self.status.rank();

        if !allowed {
            anyhow::bail!("Illegal transition {} -> {}", self.status, next);
        }

        self.status = next;
        if next == ProcessingStatus::Completed {
            self.completed_at = Some(Utc::now());
            self.error_message = None;
        }

        Ok(())
    }
}

/// A chunk artifact on disk, with character offsets back into the
/// extracted source text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentChunkRecord {
    pub source_document: String,
    pub chunk_index: i32,
    pub text: String,
    pub start_offset: usize,
    pub end_offset: usize,
}

/// A chunk plus its vector, the embed stage's artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkEmbeddingRecord {
    #[serde(flatten)]
    pub chunk: DocumentChunkRecord,
    pub embedding: Vec<f32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> BatchProcessingState {
        BatchProcessingState::new(
            Uuid::new_v4(),
            7,
            "AAPL".to_string(),
            vec!["10-K".to_string()],
            Uuid::new_v4(),
        )
    }

    #[test]
    fn test_forward_transitions_allowed() {
        let mut s = state();
        for next in [
            ProcessingStatus::Downloading,
            ProcessingStatus::Extracting,
            ProcessingStatus::Chunking,
            ProcessingStatus::GeneratingEmbeddings,
            ProcessingStatus::PersistingEmbeddings,
            ProcessingStatus::Completed,
        ] {
            s.transition(next).unwrap();
        }
        assert!(s.completed_at.is_some());
    }

    #[test]
    fn test_backward_transition_rejected() {
        let mut s = state();
        s.transition(ProcessingStatus::Chunking).unwrap();
        assert!(s.transition(ProcessingStatus::Downloading).is_err());
    }

    #[test]
    fn test_any_state_may_fail_and_retry_reenters() {
        let mut s = state();
        s.transition(ProcessingStatus::GeneratingEmbeddings).unwrap();
        s.transition(ProcessingStatus::Failed).unwrap();
        // Retry harness re-enters the failed stage.
        s.transition(ProcessingStatus::GeneratingEmbeddings).unwrap();
        assert_eq!(s.status, ProcessingStatus::GeneratingEmbeddings);
    }

    #[test]
    fn test_completed_is_terminal() {
        let mut s = state();
        s.transition(ProcessingStatus::Completed).unwrap();
        assert!(s.transition(ProcessingStatus::Failed).is_err());
        assert!(s.transition(ProcessingStatus::Downloading).is_err());
    }

    #[test]
    fn test_state_round_trips_through_json() {
        let mut s = state();
        s.documents.push(ProcessedDocument {
            file_name: "000032019324000001_aapl.htm".to_string(),
            filing_type: "10-K".to_string(),
            accession_number: "0000320193-24-000001".to_string(),
            filing_date: NaiveDate::from_ymd_opt(2024, 11, 1).unwrap(),
        });

        let json = serde_json::to_string(&s).unwrap();
        assert!(json.contains("\"companyIdentifier\""));
        assert!(json.contains("\"fileName\""));

        let back: BatchProcessingState = serde_json::from_str(&json).unwrap();
        assert_eq!(back.documents, s.documents);
        assert_eq!(back.status, s.status);
    }
}
