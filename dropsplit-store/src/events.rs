use async_trait::async_trait;
use dropsplit_core::queue::{JobQueue, QueueError};
use dropsplit_shared::models::Job;
use rdkafka::config::ClientConfig;
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use std::time::Duration;
use tracing::{error, info};

/// Publishes jobs to Kafka. The job key becomes the message key so that jobs
/// for one fulfillment order or supplier order land on one partition.
#[derive(Clone)]
pub struct EventProducer {
    producer: FutureProducer,
    jobs_topic: String,
}

impl EventProducer {
    pub fn new(brokers: &str, jobs_topic: &str) -> Result<Self, rdkafka::error::KafkaError> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", brokers)
            .set("message.timeout.ms", "5000")
            .set("enable.idempotence", "true")
            .create()?;

        Ok(Self {
            producer,
            jobs_topic: jobs_topic.to_string(),
        })
    }

    pub async fn publish(&self, topic: &str, key: &str, payload: &str) -> Result<(), rdkafka::error::KafkaError> {
        let record = FutureRecord::to(topic)
            .key(key)
            .payload(payload);

        match self.producer.send(record, Timeout::After(Duration::from_secs(0))).await {
            Ok(delivery) => {
                info!(
                    "Sent message to {}/{}: partition {} offset {}",
                    topic, key, delivery.partition, delivery.offset
                );
                Ok(())
            }
            Err((e, _msg)) => {
                error!("Failed to send message to {}: {}", topic, e);
                Err(e)
            }
        }
    }
}

#[async_trait]
impl JobQueue for EventProducer {
    async fn enqueue(&self, job: &Job) -> Result<(), QueueError> {
        let payload = serde_json::to_string(job).map_err(|e| QueueError::Serialization(e.to_string()))?;
        self.publish(&self.jobs_topic, &job.key(), &payload)
            .await
            .map_err(|e| QueueError::Publish(e.to_string()))
    }
}
