use std::sync::atomic::{AtomicU64, Ordering};

/// Process-level connection counters. Shared by all connections of a transport client and read
///  by the system usage monitor.
#[derive(Debug, Default)]
pub struct ConnectionStats {
    open: AtomicU64,
    opened_total: AtomicU64,
    failed_total: AtomicU64,
}

impl ConnectionStats {
    pub fn new() -> ConnectionStats {
        ConnectionStats::default()
    }

    pub fn on_opened(&self) {
        self.open.fetch_add(1, Ordering::Relaxed);
        self.opened_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn on_closed(&self) {
        // saturating: a close must never wrap the counter even if it is reported twice
        let _ = self.open.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| Some(n.saturating_sub(1)));
    }

    pub fn on_open_failed(&self) {
        self.failed_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn open_connections(&self) -> u64 {
        self.open.load(Ordering::Relaxed)
    }

    pub fn opened_total(&self) -> u64 {
        self.opened_total.load(Ordering::Relaxed)
    }

    pub fn failed_total(&self) -> u64 {
        self.failed_total.load(Ordering::Relaxed)
    }
}
