use anyhow::Result;
use std::{
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Concurrency caps for the expensive downstream calls. Each cap is a
/// semaphore; acquisition is bounded by `acquire_timeout` so a saturated
/// queue fails fast instead of piling up.
#[derive(Clone)]
pub struct Limiters {
    pub embedding: Arc<Semaphore>,
    pub vector_search: Arc<Semaphore>,
    pub chat: Arc<Semaphore>,
    pub acquire_timeout: Duration,
}

impl Limiters {
    pub fn new(cfg: &crate::config::settings::LimitsConfig) -> Self {
        Self {
            embedding: Arc::new(Semaphore::new(cfg.embedding_concurrency.max(1))),
            vector_search: Arc::new(Semaphore::new(cfg.vector_search_concurrency.max(1))),
            chat: Arc::new(Semaphore::new(cfg.chat_concurrency.max(1))),
            acquire_timeout: Duration::from_millis(cfg.acquire_timeout_ms.max(1)),
        }
    }

    pub async fn acquire_timed(
        sem: Arc<Semaphore>,
        acquire_timeout: Duration,
        op: &'static str,
    ) -> Result<(OwnedSemaphorePermit, Duration)> {
        let start = Instant::now();

        let permit = tokio::time::timeout(acquire_timeout, sem.acquire_owned())
            .await
            .map_err(|_| anyhow::anyhow!("Limiter acquire timeout for op={}", op))??;

        Ok((permit, start.elapsed()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::settings::LimitsConfig;

    fn test_config() -> LimitsConfig {
        LimitsConfig {
            embedding_concurrency: 2,
            vector_search_concurrency: 2,
            chat_concurrency: 1,
            acquire_timeout_ms: 50,
        }
    }

    #[tokio::test]
    async fn test_acquire_within_capacity() {
        let limiters = Limiters::new(&test_config());
        let (permit, wait) =
            Limiters::acquire_timed(limiters.chat.clone(), limiters.acquire_timeout, "chat")
                .await
                .unwrap();
        assert!(wait < Duration::from_millis(50));
        drop(permit);
    }

    #[tokio::test]
    async fn test_acquire_times_out_when_saturated() {
        let limiters = Limiters::new(&test_config());
        let (_held, _) =
            Limiters::acquire_timed(limiters.chat.clone(), limiters.acquire_timeout, "chat")
                .await
                .unwrap();

        let result =
            Limiters::acquire_timed(limiters.chat.clone(), limiters.acquire_timeout, "chat").await;
        assert!(result.is_err());
    }
}
