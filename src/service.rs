//! Async dispatch
//!
//! The pipeline itself is synchronous and CPU bound. This service runs it on
//! tokio's blocking pool so async callers never stall their executor, with an
//! optional deadline per run. Results that arrive after the deadline are
//! dropped.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::error::ServiceError;
use crate::pipeline::{PlateRecognizer, RecognitionResult};

/// Shared handle for running recognitions from async code
#[derive(Clone)]
pub struct RecognitionService {
    recognizer: Arc<PlateRecognizer>,
    timeout: Option<Duration>,
}

impl RecognitionService {
    pub fn new(recognizer: Arc<PlateRecognizer>) -> Self {
        Self {
            recognizer,
            timeout: None,
        }
    }

    /// Give up on runs that take longer than `limit`
    pub fn with_timeout(mut self, limit: Duration) -> Self {
        self.timeout = Some(limit);
        self
    }

    pub fn recognizer(&self) -> &Arc<PlateRecognizer> {
        &self.recognizer
    }

    /// Recognize one encoded image
    pub async fn recognize(&self, bytes: Vec<u8>) -> Result<RecognitionResult, ServiceError> {
        self.run(bytes, None).await
    }

    /// `permit` is held by the blocking task until the pipeline returns, even
    /// when the caller has already given up on it.
    async fn run(
        &self,
        bytes: Vec<u8>,
        permit: Option<OwnedSemaphorePermit>,
    ) -> Result<RecognitionResult, ServiceError> {
        let recognizer = Arc::clone(&self.recognizer);
        let task = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            recognizer.recognize_bytes(&bytes)
        });

        let joined = match self.timeout {
            Some(limit) => match timeout(limit, task).await {
                Ok(joined) => joined,
                Err(_) => {
                    warn!("Recognition exceeded {:?}, discarding result", limit);
                    return Err(ServiceError::Timeout(limit));
                }
            },
            None => task.await,
        };

        Ok(joined??)
    }

    /// Recognize many images with at most `jobs` running at once
    ///
    /// Results are returned in input order.
    pub async fn recognize_many(
        &self,
        inputs: Vec<Vec<u8>>,
        jobs: usize,
    ) -> Vec<Result<RecognitionResult, ServiceError>> {
        let permits = Arc::new(Semaphore::new(jobs.max(1)));
        debug!("Dispatching {} images, {} at a time", inputs.len(), jobs.max(1));

        let handles: Vec<_> = inputs
            .into_iter()
            .map(|bytes| {
                let service = self.clone();
                let permits = Arc::clone(&permits);
                tokio::spawn(async move {
                    let Ok(permit) = permits.acquire_owned().await else {
                        return Err(ServiceError::Closed);
                    };
                    service.run(bytes, Some(permit)).await
                })
            })
            .collect();

        let mut results = Vec::with_capacity(handles.len());
        for handle in handles {
            results.push(handle.await.unwrap_or_else(|e| Err(ServiceError::Task(e))));
        }
        results
    }
}
