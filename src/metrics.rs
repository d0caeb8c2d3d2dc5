// src/metrics.rs
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Process-wide counters shared by the accept path and the workers.
#[derive(Debug, Default)]
pub struct Metrics {
    pub active_conns: AtomicUsize,
    pub req_count: AtomicU64,
    pub bytes_sent: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn inc_conn(&self) {
        self.active_conns.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn dec_conn(&self) {
        self.active_conns.fetch_sub(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_req(&self) {
        self.req_count.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn add_bytes(&self, n: u64) {
        self.bytes_sent.fetch_add(n, Ordering::Relaxed);
    }
}
