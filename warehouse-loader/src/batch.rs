use std::collections::BTreeSet;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::parse::ParsedMessage;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushTrigger {
    /// The buffer reached the target batch size.
    Size,
    /// The buffer sat non-empty past the maximum batch wait.
    Timeout,
}

/// A bounded, ordered group of messages flushed together for one load
/// attempt. Immutable after creation; the accumulator's buffer is cleared in
/// the same call that produces it.
#[derive(Debug, Clone)]
pub struct Batch {
    pub id: Uuid,
    pub items: Vec<ParsedMessage>,
    pub created_at: DateTime<Utc>,
    pub trigger: FlushTrigger,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn receipt_tokens(&self) -> Vec<String> {
        self.items
            .iter()
            .map(|item| item.receipt_token.clone())
            .collect()
    }

    /// Union of row keys across the batch, for the pre-load schema check.
    pub fn observed_fields(&self) -> BTreeSet<String> {
        self.items
            .iter()
            .flat_map(|item| item.row.keys().cloned())
            .collect()
    }
}

/// Buffers parsed messages in arrival order until a size or time trigger
/// fires. Only the driver loop touches the buffer, so there is no interior
/// locking.
pub struct BatchAccumulator {
    buffer: Vec<ParsedMessage>,
    target_size: usize,
    max_wait: Duration,
    last_flush: Instant,
}

impl BatchAccumulator {
    pub fn new(target_size: usize, max_wait: Duration) -> Self {
        Self {
            buffer: Vec::with_capacity(target_size),
            target_size: target_size.max(1),
            max_wait,
            last_flush: Instant::now(),
        }
    }

    pub fn offer(&mut self, message: ParsedMessage) {
        self.buffer.push(message);
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Size wins when both triggers are due, to keep jobs at their maximum
    /// economical size.
    pub fn should_flush(&self) -> Option<FlushTrigger> {
        if self.buffer.len() >= self.target_size {
            return Some(FlushTrigger::Size);
        }
        if !self.buffer.is_empty() && self.last_flush.elapsed() >= self.max_wait {
            return Some(FlushTrigger::Timeout);
        }
        None
    }

    /// Produce a batch and clear what it took from the buffer. A size flush
    /// takes exactly the target size, so a burst larger than one batch
    /// becomes several full batches plus a remainder; a time flush drains
    /// everything. An empty buffer produces nothing; an empty batch must
    /// never reach the loader.
    pub fn flush(&mut self, trigger: FlushTrigger) -> Option<Batch> {
        self.last_flush = Instant::now();
        if self.buffer.is_empty() {
            return None;
        }
        let take = match trigger {
            FlushTrigger::Size => self.target_size.min(self.buffer.len()),
            FlushTrigger::Timeout => self.buffer.len(),
        };
        let items: Vec<ParsedMessage> = self.buffer.drain(..take).collect();
        Some(Batch {
            id: Uuid::now_v7(),
            items,
            created_at: Utc::now(),
            trigger,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(i: usize) -> ParsedMessage {
        let mut row = serde_json::Map::new();
        row.insert("seq".to_string(), serde_json::json!(i));
        row.insert(format!("field_{}", i % 3), serde_json::json!("x"));
        ParsedMessage {
            id: i.to_string(),
            receipt_token: format!("token-{i}"),
            row,
            enqueued_at: Utc::now(),
        }
    }

    #[test]
    fn test_size_trigger_at_exactly_target() {
        let mut accumulator = BatchAccumulator::new(10, Duration::from_secs(3600));
        for i in 0..9 {
            accumulator.offer(message(i));
            assert_eq!(accumulator.should_flush(), None);
        }
        accumulator.offer(message(9));
        assert_eq!(accumulator.should_flush(), Some(FlushTrigger::Size));

        let batch = accumulator.flush(FlushTrigger::Size).unwrap();
        assert_eq!(batch.len(), 10);
        assert_eq!(batch.trigger, FlushTrigger::Size);
        assert!(accumulator.is_empty());
    }

    #[test]
    fn test_timeout_trigger_needs_nonempty_buffer() {
        let mut accumulator = BatchAccumulator::new(10, Duration::from_millis(20));

        // Empty buffer never time-triggers
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(accumulator.should_flush(), None);

        accumulator.offer(message(0));
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(accumulator.should_flush(), Some(FlushTrigger::Timeout));

        let batch = accumulator.flush(FlushTrigger::Timeout).unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch.trigger, FlushTrigger::Timeout);
    }

    #[test]
    fn test_size_wins_when_both_triggers_due() {
        let mut accumulator = BatchAccumulator::new(3, Duration::from_millis(10));
        for i in 0..3 {
            accumulator.offer(message(i));
        }
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(accumulator.should_flush(), Some(FlushTrigger::Size));
    }

    #[test]
    fn test_burst_splits_into_full_batches_plus_remainder() {
        let mut accumulator = BatchAccumulator::new(10, Duration::from_secs(3600));
        for i in 0..25 {
            accumulator.offer(message(i));
        }

        let first = accumulator.flush(FlushTrigger::Size).unwrap();
        assert_eq!(first.len(), 10);
        assert_eq!(accumulator.should_flush(), Some(FlushTrigger::Size));

        let second = accumulator.flush(FlushTrigger::Size).unwrap();
        assert_eq!(second.len(), 10);
        assert_eq!(accumulator.should_flush(), None);
        assert_eq!(accumulator.len(), 5);

        // Order preserved across the split
        assert_eq!(first.items[0].id, "0");
        assert_eq!(second.items[0].id, "10");

        let rest = accumulator.flush(FlushTrigger::Timeout).unwrap();
        assert_eq!(rest.len(), 5);
        assert!(accumulator.is_empty());
    }

    #[test]
    fn test_empty_flush_is_noop() {
        let mut accumulator = BatchAccumulator::new(10, Duration::from_millis(1));
        assert!(accumulator.flush(FlushTrigger::Timeout).is_none());
    }

    #[test]
    fn test_flush_resets_time_trigger() {
        let mut accumulator = BatchAccumulator::new(10, Duration::from_millis(40));
        accumulator.offer(message(0));
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(accumulator.should_flush(), Some(FlushTrigger::Timeout));
        accumulator.flush(FlushTrigger::Timeout).unwrap();

        accumulator.offer(message(1));
        assert_eq!(accumulator.should_flush(), None);
    }

    #[test]
    fn test_observed_fields_is_union_of_keys() {
        let mut accumulator = BatchAccumulator::new(10, Duration::from_secs(3600));
        for i in 0..6 {
            accumulator.offer(message(i));
        }
        let batch = accumulator.flush(FlushTrigger::Timeout).unwrap();
        let fields = batch.observed_fields();
        assert!(fields.contains("seq"));
        assert!(fields.contains("field_0"));
        assert!(fields.contains("field_1"));
        assert!(fields.contains("field_2"));
        assert_eq!(fields.len(), 4);
    }
}
