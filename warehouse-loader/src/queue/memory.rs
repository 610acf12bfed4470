use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::{EventQueue, QueueError, QueuedMessage};

const RECEIVE_POLL_INTERVAL: Duration = Duration::from_millis(10);

struct StoredMessage {
    id: u64,
    payload: String,
    enqueued_at: DateTime<Utc>,
    visible_at: Instant,
    receipt_token: Option<String>,
    delivery_count: u32,
}

#[derive(Default)]
struct QueueState {
    next_id: u64,
    messages: Vec<StoredMessage>,
    total_deliveries: u64,
}

/// In-memory queue with real visibility-timeout semantics, always available
/// for tests. Commit-is-conditional-delete behaves exactly like the postgres
/// adapter: receiving rotates the receipt token, deleting with a stale token
/// is a silent no-op, and un-acked messages reappear once their visibility
/// timeout elapses.
pub struct InMemoryQueue {
    visibility_timeout: Duration,
    state: Mutex<QueueState>,
}

impl InMemoryQueue {
    pub fn new(visibility_timeout: Duration) -> Self {
        Self {
            visibility_timeout,
            state: Mutex::new(QueueState::default()),
        }
    }

    pub fn push(&self, payload: &str) {
        let mut state = self.lock();
        let id = state.next_id;
        state.next_id += 1;
        state.messages.push(StoredMessage {
            id,
            payload: payload.to_owned(),
            enqueued_at: Utc::now(),
            visible_at: Instant::now(),
            receipt_token: None,
            delivery_count: 0,
        });
    }

    /// Messages not yet deleted, visible or not.
    pub fn remaining(&self) -> usize {
        self.lock().messages.len()
    }

    /// Messages currently leased to a consumer.
    pub fn in_flight(&self) -> usize {
        let now = Instant::now();
        self.lock()
            .messages
            .iter()
            .filter(|m| m.visible_at > now)
            .count()
    }

    /// Sum of deliveries across all messages, including deleted ones.
    pub fn total_deliveries(&self) -> u64 {
        self.lock().total_deliveries
    }

    /// Force every in-flight message visible again, simulating an elapsed
    /// visibility timeout without waiting for it.
    pub fn expire_in_flight(&self) {
        let now = Instant::now();
        for message in self.lock().messages.iter_mut() {
            message.visible_at = now;
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueState> {
        self.state.lock().expect("InMemoryQueue lock poisoned")
    }

    fn receive_once(&self, max_messages: u32) -> Vec<QueuedMessage> {
        let mut state = self.lock();
        let now = Instant::now();
        let visible_until = now + self.visibility_timeout;
        let mut received = Vec::new();

        for message in state.messages.iter_mut() {
            if received.len() >= max_messages as usize {
                break;
            }
            if message.visible_at > now {
                continue;
            }
            let token = Uuid::new_v4().to_string();
            message.visible_at = visible_until;
            message.receipt_token = Some(token.clone());
            message.delivery_count += 1;
            received.push(QueuedMessage {
                id: message.id.to_string(),
                receipt_token: token,
                payload: message.payload.clone(),
                enqueued_at: message.enqueued_at,
            });
        }

        state.total_deliveries += received.len() as u64;
        received
    }
}

#[async_trait]
impl EventQueue for InMemoryQueue {
    async fn receive(
        &self,
        max_messages: u32,
        max_wait: Duration,
    ) -> Result<Vec<QueuedMessage>, QueueError> {
        let deadline = Instant::now() + max_wait;
        loop {
            let messages = self.receive_once(max_messages);
            if !messages.is_empty() || Instant::now() >= deadline {
                return Ok(messages);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            tokio::time::sleep(RECEIVE_POLL_INTERVAL.min(remaining)).await;
        }
    }

    async fn delete(&self, receipt_tokens: &[String]) -> Result<(), QueueError> {
        let mut state = self.lock();
        // Same conditional delete as the postgres adapter: only the current
        // token matches, stale tokens from redelivered messages are skipped
        state.messages.retain(|message| {
            !message
                .receipt_token
                .as_ref()
                .is_some_and(|token| receipt_tokens.contains(token))
        });
        Ok(())
    }
}
