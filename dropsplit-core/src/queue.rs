use async_trait::async_trait;
use dropsplit_shared::models::Job;

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Job queue is closed")]
    Closed,

    #[error("Failed to serialize job: {0}")]
    Serialization(String),

    #[error("Failed to publish job: {0}")]
    Publish(String),
}

/// Hand-off point between ingress and the worker pool.
#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn enqueue(&self, job: &Job) -> Result<(), QueueError>;
}
