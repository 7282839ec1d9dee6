use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

/// Per-stage progress. `progress_percent` is within [0, 100].
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressUpdate {
    pub stage: String,
    pub message: String,
    pub progress_percent: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub documents_processed: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_documents: Option<usize>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionNotice {
    pub total_documents: usize,
    pub successful_documents: usize,
    pub failed_documents: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    pub completed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorNotice {
    pub error_message: String,
    pub stage: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub documents_processed: Option<usize>,
    pub timestamp: DateTime<Utc>,
}

/// The three event channels clients subscribe to.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "payload")]
pub enum ProcessingEvent {
    ProcessingUpdate(ProgressUpdate),
    ProcessingComplete(CompletionNotice),
    ProcessingError(ErrorNotice),
}

impl ProcessingEvent {
    /// Channel name, stable for wire consumers.
    pub fn channel(&self) -> &'static str {
        match self {
            ProcessingEvent::ProcessingUpdate(_) => "ProcessingUpdate",
            ProcessingEvent::ProcessingComplete(_) => "ProcessingComplete",
            ProcessingEvent::ProcessingError(_) => "ProcessingError",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ConversationEvent {
    pub conversation_id: Uuid,
    pub event: ProcessingEvent,
}

/// Pub/sub keyed by conversation id. Delivery is at-least-once to
/// subscribers currently joined; there is no durable replay, reconnecting
/// clients read the snapshot from the conversation's ingestion status.
pub struct ProgressBus {
    tx: broadcast::Sender<ConversationEvent>,
}

impl ProgressBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn publish(&self, conversation_id: Uuid, event: ProcessingEvent) {
        let conversation_event = ConversationEvent {
            conversation_id,
            event,
        };
        // A send error only means nobody is subscribed right now.
        if self.tx.send(conversation_event).is_err() {
            debug!("No subscribers for conversation {}", conversation_id);
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConversationEvent> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn update(percent: u8) -> ProcessingEvent {
        ProcessingEvent::ProcessingUpdate(ProgressUpdate {
            stage: "Downloading".to_string(),
            message: "Downloading filings".to_string(),
            progress_percent: percent,
            documents_processed: None,
            total_documents: Some(3),
            timestamp: Utc::now(),
        })
    }

    #[tokio::test]
    async fn test_subscriber_receives_in_publish_order() {
        let bus = ProgressBus::new(16);
        let mut rx = bus.subscribe();
        let conversation_id = Uuid::new_v4();

        bus.publish(conversation_id, update(10));
        bus.publish(conversation_id, update(20));

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        match (first.event, second.event) {
            (
                ProcessingEvent::ProcessingUpdate(a),
                ProcessingEvent::ProcessingUpdate(b),
            ) => {
                assert_eq!(a.progress_percent, 10);
                assert_eq!(b.progress_percent, 20);
            }
            _ => panic!("expected progress updates"),
        }
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_harmless() {
        let bus = ProgressBus::new(16);
        bus.publish(Uuid::new_v4(), update(50));
    }

    #[test]
    fn test_channel_names_are_stable() {
        assert_eq!(update(0).channel(), "ProcessingUpdate");
        let complete = ProcessingEvent::ProcessingComplete(CompletionNotice {
            total_documents: 1,
            successful_documents: 1,
            failed_documents: 0,
            duration_ms: Some(1200),
            completed_at: Utc::now(),
        });
        assert_eq!(complete.channel(), "ProcessingComplete");
    }
}
