use super::{PipelineJob, PipelineOrchestrator};
use crate::database::Repository;
use crate::pipeline::state::ProcessingStatus;
use crate::utils::error::ApiError;
use anyhow::Result;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Producer side of the background runtime: handlers enqueue, workers
/// drain. The channel is bounded so a flood of ingestion requests backs
/// up at the API instead of in memory.
#[derive(Clone)]
pub struct PipelineQueue {
    sender: flume::Sender<PipelineJob>,
}

impl PipelineQueue {
    pub fn new(capacity: usize) -> (Self, flume::Receiver<PipelineJob>) {
        let (sender, receiver) = flume::bounded(capacity);
        (Self { sender }, receiver)
    }

    pub fn enqueue(&self, job: PipelineJob) -> Result<(), ApiError> {
        self.sender
            .try_send(job)
            .map_err(|e| ApiError::InternalError(format!("Pipeline queue full: {}", e)))
    }
}

/// Background workers draining the pipeline queue. Jobs across
/// conversations run concurrently; within a conversation the stage chain
/// is serial by construction. Terminal outcomes are mirrored onto the
/// conversation row here, and only here.
pub struct PipelineWorkers;

impl PipelineWorkers {
    pub fn spawn(
        worker_count: usize,
        receiver: flume::Receiver<PipelineJob>,
        orchestrator: Arc<PipelineOrchestrator>,
        repository: Arc<Repository>,
        shutdown: CancellationToken,
    ) {
        info!("Starting {} pipeline workers", worker_count);

        for worker_id in 0..worker_count.max(1) {
            let receiver = receiver.clone();
            let orchestrator = orchestrator.clone();
            let repository = repository.clone();
            let shutdown = shutdown.clone();

            tokio::spawn(async move {
                loop {
                    let job = tokio::select! {
                        _ = shutdown.cancelled() => break,
                        job = receiver.recv_async() => match job {
                            Ok(job) => job,
                            Err(_) => break,
                        },
                    };

                    info!(
                        "Worker {} picked up job {} for conversation {}",
                        worker_id, job.job_id, job.conversation_id
                    );

                    let ct = shutdown.child_token();
                    match orchestrator.run(&job, ct).await {
                        Ok(()) => {
                            if let Err(e) = repository
                                .set_ingestion_status(
                                    job.conversation_id,
                                    ProcessingStatus::Completed.as_str(),
                                )
                                .await
                            {
                                error!(
                                    "Failed to mirror completion for conversation {}: {}",
                                    job.conversation_id, e
                                );
                            }
                        }
                        Err(e)
                            if matches!(
                                e.downcast_ref::<ApiError>(),
                                Some(ApiError::Cancelled)
                            ) =>
                        {
                            // Not a failure; artifacts stay valid and a
                            // re-enqueue resumes where it stopped.
                            info!(
                                "Job {} cancelled for conversation {}",
                                job.job_id, job.conversation_id
                            );
                        }
                        Err(e) => {
                            warn!(
                                "Job {} failed for conversation {}: {}",
                                job.job_id, job.conversation_id, e
                            );
                            if let Err(mirror_err) = repository
                                .set_ingestion_status(
                                    job.conversation_id,
                                    ProcessingStatus::Failed.as_str(),
                                )
                                .await
                            {
                                error!(
                                    "Failed to mirror failure for conversation {}: {}",
                                    job.conversation_id, mirror_err
                                );
                            }
                        }
                    }
                }

                info!("Pipeline worker {} shutting down", worker_id);
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_enqueue_fails_when_full() {
        let (queue, _receiver) = PipelineQueue::new(1);
        let job = PipelineJob {
            job_id: Uuid::new_v4(),
            conversation_id: Uuid::new_v4(),
            user_id: 1,
            company_identifier: "AAPL".to_string(),
            filing_types: vec!["10-K".to_string()],
        };

        assert!(queue.enqueue(job.clone()).is_ok());
        assert!(matches!(
            queue.enqueue(job),
            Err(ApiError::InternalError(_))
        ));
    }
}
