use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::QueueError;

/// Published motion score.
///
/// The trigger is boolean, so events carry a fixed maximum score rather than
/// a continuous magnitude.
pub const MOTION_SCORE_SENTINEL: f64 = 1.0;

/// How long a blocking pop waits before the consumer loop re-checks for
/// shutdown
const CONSUMER_POLL_TIMEOUT_SECS: f64 = 5.0;

/// Delay before retrying a lost broker connection
const BROKER_RETRY_DELAY: Duration = Duration::from_secs(5);

/// The work-queue envelope describing one capture.
///
/// Delivery is at-least-once: a publish that lands on the broker but whose
/// acknowledgment is lost may be retried, so consumers must treat a repeated
/// `image_path` as an idempotent no-op.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptureEvent {
    /// Image path relative to the shared image root
    pub image_path: String,
    /// Capture time, UTC
    pub timestamp: DateTime<Utc>,
    /// Fixed sentinel, see [`MOTION_SCORE_SENTINEL`]
    pub motion_score: f64,
    /// Identifier of the producing camera source
    pub source: String,
    /// Optional clip path relative to the shared image root
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video_path: Option<String>,
}

/// Destination for capture events.
///
/// The capture loop treats publishing as fire-and-forget: a failed publish is
/// logged and the loop proceeds.
#[async_trait]
pub trait EventSink: Send {
    async fn publish(&mut self, event: &CaptureEvent) -> Result<(), QueueError>;
}

/// Publishes capture events onto a named Redis list (LPUSH; consumers BRPOP
/// the other end).
///
/// The connection is established lazily and dropped on error so the next
/// publish attempt reconnects.
pub struct RedisEventPublisher {
    client: redis::Client,
    queue: String,
    connection: Option<redis::aio::MultiplexedConnection>,
}

impl RedisEventPublisher {
    pub fn new(url: &str, queue: &str) -> Result<Self, QueueError> {
        let client = redis::Client::open(url)?;
        Ok(Self {
            client,
            queue: queue.to_string(),
            connection: None,
        })
    }

    async fn connection(
        &mut self,
    ) -> Result<&mut redis::aio::MultiplexedConnection, QueueError> {
        if self.connection.is_none() {
            debug!("Connecting to broker for queue '{}'", self.queue);
            let connection = self.client.get_multiplexed_async_connection().await?;
            self.connection = Some(connection);
        }
        Ok(self.connection.as_mut().expect("connection just set"))
    }
}

#[async_trait]
impl EventSink for RedisEventPublisher {
    async fn publish(&mut self, event: &CaptureEvent) -> Result<(), QueueError> {
        let payload = serde_json::to_string(event).map_err(|e| QueueError::Decode {
            details: e.to_string(),
        })?;

        let queue = self.queue.clone();
        let result: Result<(), redis::RedisError> = match self.connection().await {
            Ok(connection) => connection.lpush(&queue, &payload).await,
            Err(e) => return Err(e),
        };

        match result {
            Ok(()) => {
                info!("Published to queue '{}': {}", queue, event.image_path);
                Ok(())
            }
            Err(e) => {
                // Drop the connection so the next publish reconnects
                self.connection = None;
                Err(e.into())
            }
        }
    }
}

/// The contract a downstream stage implements to drain the queue.
///
/// `handle` is invoked once per delivered message. Handler errors are logged
/// and the message is not redelivered by this loop; duplicates can still
/// arrive from the broker under at-least-once semantics, and handlers must
/// tolerate them.
#[async_trait]
pub trait QueueConsumer: Send {
    async fn handle(&mut self, event: CaptureEvent) -> Result<(), QueueError>;
}

/// Blocking-pop loop a detection stage runs against the queue.
pub struct ConsumerLoop {
    client: redis::Client,
    queue: String,
}

impl ConsumerLoop {
    pub fn new(url: &str, queue: &str) -> Result<Self, QueueError> {
        let client = redis::Client::open(url)?;
        Ok(Self {
            client,
            queue: queue.to_string(),
        })
    }

    /// Drain the queue until cancelled.
    ///
    /// Broker outages are retried with a fixed delay; malformed payloads are
    /// logged and discarded.
    pub async fn run(
        &self,
        consumer: &mut dyn QueueConsumer,
        cancel: CancellationToken,
    ) -> Result<(), QueueError> {
        info!("Consumer draining queue '{}'", self.queue);

        let mut connection: Option<redis::aio::MultiplexedConnection> = None;

        while !cancel.is_cancelled() {
            if connection.is_none() {
                match self.client.get_multiplexed_async_connection().await {
                    Ok(conn) => {
                        info!("Consumer connected to broker");
                        connection = Some(conn);
                    }
                    Err(e) => {
                        warn!("Broker connection failed: {}, retrying", e);
                        sleep(BROKER_RETRY_DELAY).await;
                        continue;
                    }
                }
            }
            let conn = connection.as_mut().expect("connection just established");

            let reply: Result<Option<(String, String)>, redis::RedisError> =
                conn.brpop(&self.queue, CONSUMER_POLL_TIMEOUT_SECS).await;

            match reply {
                Ok(Some((_, payload))) => {
                    let event: CaptureEvent = match serde_json::from_str(&payload) {
                        Ok(event) => event,
                        Err(e) => {
                            warn!("Discarding undecodable message: {}", e);
                            continue;
                        }
                    };

                    if let Err(e) = consumer.handle(event).await {
                        warn!("Consumer handler failed: {}", e);
                    }
                }
                // Timeout with an empty queue; loop to re-check shutdown
                Ok(None) => continue,
                Err(e) => {
                    warn!("Broker error: {}, reconnecting", e);
                    connection = None;
                    sleep(BROKER_RETRY_DELAY).await;
                }
            }
        }

        info!("Consumer stopped");
        Ok(())
    }
}
