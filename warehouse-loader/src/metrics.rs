use std::sync::atomic::{AtomicU64, Ordering};

/// A counter that accumulates locally and emits deltas on flush.
#[derive(Default)]
struct Counter {
    total: AtomicU64,
    flushed: AtomicU64,
}

impl Counter {
    fn add(&self, n: u64) {
        self.total.fetch_add(n, Ordering::Relaxed);
    }

    fn get(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    fn drain(&self) -> u64 {
        let total = self.total.load(Ordering::Relaxed);
        let flushed = self.flushed.swap(total, Ordering::Relaxed);
        total.saturating_sub(flushed)
    }
}

/// Per-driver metrics sink. Counts accumulate on the driver instance and are
/// flushed to the process exporter once per loop iteration, so components
/// stay observable without any process-wide mutable counters, and tests can
/// read the totals directly.
#[derive(Default)]
pub struct PipelineMetrics {
    messages_received: Counter,
    messages_dropped: Counter,
    batches_flushed: Counter,
    batches_committed: Counter,
    batches_retained: Counter,
    rows_loaded: Counter,
    secondary_failures: Counter,
    cleanup_failures: Counter,
    backpressure_delay_secs: AtomicU64,
}

impl PipelineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_received(&self, n: u64) {
        self.messages_received.add(n);
    }

    pub fn record_dropped(&self) {
        self.messages_dropped.add(1);
    }

    pub fn record_flushed(&self) {
        self.batches_flushed.add(1);
    }

    pub fn record_committed(&self, rows: u64) {
        self.batches_committed.add(1);
        self.rows_loaded.add(rows);
    }

    pub fn record_retained(&self) {
        self.batches_retained.add(1);
    }

    pub fn record_secondary_failure(&self) {
        self.secondary_failures.add(1);
    }

    pub fn record_cleanup_failures(&self, n: u64) {
        self.cleanup_failures.add(n);
    }

    pub fn record_backpressure_delay(&self, delay: std::time::Duration) {
        self.backpressure_delay_secs
            .store(delay.as_secs(), Ordering::Relaxed);
    }

    pub fn received(&self) -> u64 {
        self.messages_received.get()
    }

    pub fn dropped(&self) -> u64 {
        self.messages_dropped.get()
    }

    pub fn flushed(&self) -> u64 {
        self.batches_flushed.get()
    }

    pub fn committed(&self) -> u64 {
        self.batches_committed.get()
    }

    pub fn retained(&self) -> u64 {
        self.batches_retained.get()
    }

    pub fn rows_loaded(&self) -> u64 {
        self.rows_loaded.get()
    }

    pub fn secondary_failures(&self) -> u64 {
        self.secondary_failures.get()
    }

    pub fn cleanup_failures(&self) -> u64 {
        self.cleanup_failures.get()
    }

    /// Emit accumulated deltas to the process-wide exporter.
    pub fn flush(&self) {
        for (name, counter) in [
            ("loader_messages_received_total", &self.messages_received),
            ("loader_messages_dropped_total", &self.messages_dropped),
            ("loader_batches_flushed_total", &self.batches_flushed),
            ("loader_batches_committed_total", &self.batches_committed),
            ("loader_batches_retained_total", &self.batches_retained),
            ("loader_rows_loaded_total", &self.rows_loaded),
            ("loader_secondary_failures_total", &self.secondary_failures),
            ("loader_cleanup_failures_total", &self.cleanup_failures),
        ] {
            let delta = counter.drain();
            if delta > 0 {
                metrics::counter!(name).increment(delta);
            }
        }
        metrics::gauge!("loader_backpressure_delay_seconds")
            .set(self.backpressure_delay_secs.load(Ordering::Relaxed) as f64);
    }
}
