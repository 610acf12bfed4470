use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;
use thiserror::Error;

pub mod memory;
pub mod postgres;

pub use memory::InMemoryQueue;
pub use postgres::PgEventQueue;

/// Enumeration of errors for operations against the durable queue.
#[derive(Error, Debug)]
pub enum QueueError {
    #[error("connection failed with: {error}")]
    ConnectionError { error: sqlx::Error },
    #[error("{command} query failed with: {error}")]
    QueryError {
        command: String,
        error: sqlx::Error,
    },
}

/// A message pulled from the queue. The receipt token identifies this
/// delivery, not the message: it rotates on every redelivery, so a delete
/// with a stale token is a no-op and the message stays owned by whoever
/// received it last.
#[derive(Debug, Clone)]
pub struct QueuedMessage {
    pub id: String,
    pub receipt_token: String,
    pub payload: String,
    pub enqueued_at: DateTime<Utc>,
}

/// The durable queue the pipeline consumes from. Horizontal scale-out runs
/// many competing consumers against one queue; coordination is implicit via
/// message visibility, never via shared state between processes.
#[async_trait]
pub trait EventQueue: Send + Sync {
    /// Long-poll for up to `max_messages`, waiting at most `max_wait` for the
    /// first one. Received messages become invisible to other consumers until
    /// the visibility timeout elapses.
    async fn receive(
        &self,
        max_messages: u32,
        max_wait: Duration,
    ) -> Result<Vec<QueuedMessage>, QueueError>;

    /// Acknowledge deliveries by receipt token. Implementations chunk to the
    /// provider's delete batch size transparently. Tokens that no longer
    /// match (the message was already redelivered) are skipped silently.
    async fn delete(&self, receipt_tokens: &[String]) -> Result<(), QueueError>;
}
