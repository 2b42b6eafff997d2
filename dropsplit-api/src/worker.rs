use std::sync::Arc;
use async_trait::async_trait;
use dropsplit_core::queue::{JobQueue, QueueError};
use dropsplit_order::JobRunner;
use dropsplit_shared::models::Job;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::error::KafkaError;
use rdkafka::message::Message;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};
use tracing::{error, info, warn};

use crate::metrics::Metrics;

/// In-process bounded queue. `enqueue` waits when the workers fall behind.
#[derive(Clone)]
pub struct LocalQueue {
    sender: mpsc::Sender<Job>,
}

impl LocalQueue {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Job>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (Self { sender }, receiver)
    }
}

#[async_trait]
impl JobQueue for LocalQueue {
    async fn enqueue(&self, job: &Job) -> Result<(), QueueError> {
        self.sender.send(job.clone()).await.map_err(|_| QueueError::Closed)
    }
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    /// Delay before attempt `attempt + 1`, doubling from the base.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_backoff
            .checked_mul(factor)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobDisposition {
    Completed,
    /// Permanent failure; retrying cannot help.
    Failed,
    /// Still failing transiently after the last allowed attempt.
    Exhausted,
}

pub async fn execute_with_retry(
    runner: &JobRunner,
    job: &Job,
    policy: &RetryPolicy,
    metrics: &Metrics,
) -> JobDisposition {
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        match runner.run(job).await {
            Ok(()) => {
                metrics.job(job.kind(), "ok");
                return JobDisposition::Completed;
            }
            Err(e) if e.is_transient() && attempt < max_attempts => {
                let delay = policy.backoff(attempt);
                warn!(
                    job = job.kind(),
                    key = %job.key(),
                    attempt,
                    retry_in_ms = delay.as_millis() as u64,
                    error = %e,
                    "Job failed, retrying"
                );
                metrics.job(job.kind(), "retried");
                sleep(delay).await;
                attempt += 1;
            }
            Err(e) if e.is_transient() => {
                let payload = serde_json::to_string(job).unwrap_or_default();
                error!(job = job.kind(), attempts = attempt, error = %e, payload = %payload, "Job exhausted retries");
                metrics.job(job.kind(), "exhausted");
                return JobDisposition::Exhausted;
            }
            Err(e) => {
                let payload = serde_json::to_string(job).unwrap_or_default();
                error!(job = job.kind(), error = %e, payload = %payload, "Job failed permanently");
                metrics.job(job.kind(), "failed");
                return JobDisposition::Failed;
            }
        }
    }
}

/// Spawn `workers` tasks draining the local queue. They stop once every
/// sender is dropped and the queue is empty.
pub fn spawn_local_workers(
    receiver: mpsc::Receiver<Job>,
    workers: usize,
    runner: Arc<JobRunner>,
    policy: RetryPolicy,
    metrics: Arc<Metrics>,
) -> Vec<JoinHandle<()>> {
    let receiver = Arc::new(Mutex::new(receiver));

    (0..workers.max(1))
        .map(|worker_id| {
            let receiver = receiver.clone();
            let runner = runner.clone();
            let policy = policy.clone();
            let metrics = metrics.clone();

            tokio::spawn(async move {
                info!(worker_id, "Job worker started");
                loop {
                    // Lock only while waiting for the next job.
                    let next = receiver.lock().await.recv().await;
                    let Some(job) = next else { break };
                    execute_with_retry(&runner, &job, &policy, &metrics).await;
                }
                info!(worker_id, "Job worker stopped");
            })
        })
        .collect()
}

/// Consume jobs from Kafka. Jobs sharing a key arrive in order on one
/// partition and are run one at a time here.
pub async fn start_kafka_worker(
    brokers: String,
    group_id: String,
    topic: String,
    runner: Arc<JobRunner>,
    policy: RetryPolicy,
    metrics: Arc<Metrics>,
) -> Result<(), KafkaError> {
    let consumer: StreamConsumer = ClientConfig::new()
        .set("bootstrap.servers", &brokers)
        .set("group.id", &group_id)
        .set("enable.auto.commit", "true")
        .set("auto.offset.reset", "earliest")
        .create()?;

    consumer.subscribe(&[topic.as_str()])?;

    info!("Job worker listening on {}", topic);

    loop {
        match consumer.recv().await {
            Err(e) => error!("Kafka error: {}", e),
            Ok(m) => {
                let Some(payload) = m.payload_view::<str>() else {
                    warn!("Skipping job message without payload");
                    continue;
                };
                match payload {
                    Ok(raw) => match serde_json::from_str::<Job>(raw) {
                        Ok(job) => {
                            execute_with_retry(&runner, &job, &policy, &metrics).await;
                        }
                        Err(e) => {
                            error!(error = %e, payload = raw, "Discarding undecodable job");
                            metrics.job("unknown", "failed");
                        }
                    },
                    Err(e) => error!("Error reading payload: {}", e),
                }
            }
        }
    }
}
