use std::sync::atomic::{AtomicU64, Ordering};

/// Ingestion counters shared between the listener, parser workers, flusher
/// and the self-state watchdog. The external metrics reporter reads the same
/// snapshot.
#[derive(Debug, Default)]
pub struct FilterMetrics {
    received: AtomicU64,
    valid: AtomicU64,
    matched: AtomicU64,
    dropped: AtomicU64,
}

impl FilterMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn mark_valid(&self) {
        self.valid.fetch_add(1, Ordering::Relaxed);
    }

    pub fn mark_matched(&self) {
        self.matched.fetch_add(1, Ordering::Relaxed);
    }

    pub fn mark_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }

    pub fn valid(&self) -> u64 {
        self.valid.load(Ordering::Relaxed)
    }

    pub fn matched(&self) -> u64 {
        self.matched.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
