//! Real-time Event Processor
//!
//! Consumes domain events from Kafka and turns each one into a
//! recommendation job. Submission is fire-and-forget: the consumer never
//! waits for a recomputation to finish, and a bad message never stops it.

use crate::config::KafkaConfig;
use crate::error::{Error, Result};
use crate::events::{parse_event, EventEnvelope};
use crate::recommendation::updater::JobQueue;
use chrono::Utc;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::message::Message;
use tokio::sync::broadcast;
use tracing::{debug, error, info, instrument, warn};

/// Event processor that consumes Kafka events and schedules recomputations
pub struct EventProcessor {
    consumer: StreamConsumer,
    dispatcher: EventDispatcher,
    shutdown: broadcast::Receiver<()>,
}

impl EventProcessor {
    /// Create a new event processor
    pub fn new(config: &KafkaConfig, queue: JobQueue, shutdown: broadcast::Receiver<()>) -> Result<Self> {
        let consumer: StreamConsumer = ClientConfig::new()
            .set("group.id", &config.group_id)
            .set("bootstrap.servers", &config.brokers)
            .set("enable.partition.eof", "false")
            .set("session.timeout.ms", "6000")
            .set("enable.auto.commit", "true")
            .set("auto.offset.reset", "latest")
            .create()
            .map_err(|e| Error::kafka(format!("Failed to create consumer: {}", e)))?;

        consumer
            .subscribe(&[config.user_actions_topic.as_str()])
            .map_err(|e| Error::kafka(format!("Failed to subscribe: {}", e)))?;

        Ok(Self {
            consumer,
            dispatcher: EventDispatcher::new(queue),
            shutdown,
        })
    }

    /// Run the event processor
    #[instrument(skip(self))]
    pub async fn run(mut self) -> Result<()> {
        info!("🎯 Starting real-time event processor");

        loop {
            tokio::select! {
                message = self.consumer.recv() => {
                    match message {
                        Ok(msg) => {
                            let Some(payload) = msg.payload() else {
                                warn!("Skipping message with empty payload");
                                continue;
                            };
                            if let Err(e) = self.dispatcher.handle_payload(payload).await {
                                error!(
                                    topic = msg.topic(),
                                    offset = msg.offset(),
                                    error_code = e.error_code(),
                                    "Failed to process message: {}",
                                    e
                                );
                            }
                        }
                        Err(e) => {
                            error!("Kafka consumer error: {:?}", e);
                        }
                    }
                }
                _ = self.shutdown.recv() => {
                    info!("Event processor shutting down");
                    break;
                }
            }
        }

        Ok(())
    }
}

/// Maps decoded events onto the job queue; independent of Kafka.
#[derive(Clone)]
pub struct EventDispatcher {
    queue: JobQueue,
}

impl EventDispatcher {
    pub fn new(queue: JobQueue) -> Self {
        Self { queue }
    }

    /// Decode and dispatch one payload. Unknown event types are ignored.
    pub async fn handle_payload(&self, payload: &[u8]) -> Result<()> {
        match parse_event(payload)? {
            Some(envelope) => self.dispatch(envelope).await,
            None => {
                debug!("Ignoring unknown event type");
                Ok(())
            }
        }
    }

    pub async fn dispatch(&self, envelope: EventEnvelope) -> Result<()> {
        let job = envelope.event.to_job();

        if let Some(sent_at) = envelope.timestamp {
            let lag_ms = (Utc::now() - sent_at).num_milliseconds();
            debug!(event = %envelope.event, lag_ms, "Dispatching event");
        }

        let job_id = self.queue.submit(job).await?;
        debug!(event = %envelope.event, %job_id, "Job queued");
        Ok(())
    }
}

/// Spawn the event processor
pub fn spawn_event_processor(
    config: KafkaConfig,
    queue: JobQueue,
    shutdown: broadcast::Receiver<()>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let processor = match EventProcessor::new(&config, queue, shutdown) {
            Ok(p) => p,
            Err(e) => {
                error!("Failed to create event processor: {:?}", e);
                return;
            }
        };

        if let Err(e) = processor.run().await {
            error!("Event processor failed: {:?}", e);
        }
    })
}
