#![forbid(unsafe_code)]

use gondolin_stack::StackStats;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Cheap shared counters for the network plane, rendered in Prometheus
/// text format by the embedding's own endpoint.
#[derive(Debug, Clone, Default)]
pub struct Metrics {
    inner: Arc<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    frames_rx: AtomicU64,
    frames_tx: AtomicU64,
    bytes_rx: AtomicU64,
    bytes_tx: AtomicU64,
    frames_dropped: AtomicU64,
    dns_queries: AtomicU64,
    dns_denied: AtomicU64,
    tcp_opened: AtomicU64,
    tcp_closed: AtomicU64,
    syns_denied: AtomicU64,
    flows_spawned: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn frame_rx(&self, bytes: usize) {
        self.inner.frames_rx.fetch_add(1, Ordering::Relaxed);
        self.inner.bytes_rx.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn frame_tx(&self, bytes: usize) {
        self.inner.frames_tx.fetch_add(1, Ordering::Relaxed);
        self.inner.bytes_tx.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn flow_spawned(&self) {
        self.inner.flows_spawned.fetch_add(1, Ordering::Relaxed);
    }

    /// Fold the stack's own drop/deny counters in; called per poll so the
    /// rendered values track the sans-IO side too.
    pub fn absorb_stack_stats(&self, stats: &StackStats) {
        self.inner
            .frames_dropped
            .store(stats.frames_dropped, Ordering::Relaxed);
        self.inner
            .dns_queries
            .store(stats.dns_queries, Ordering::Relaxed);
        self.inner.dns_denied.store(stats.dns_denied, Ordering::Relaxed);
        self.inner.tcp_opened.store(stats.tcp_opened, Ordering::Relaxed);
        self.inner.tcp_closed.store(stats.tcp_closed, Ordering::Relaxed);
        self.inner
            .syns_denied
            .store(stats.syns_denied, Ordering::Relaxed);
    }

    pub fn render_prometheus(&self) -> String {
        let i = &self.inner;
        let mut out = String::new();
        for (name, value) in [
            ("gondolin_frames_rx_total", i.frames_rx.load(Ordering::Relaxed)),
            ("gondolin_frames_tx_total", i.frames_tx.load(Ordering::Relaxed)),
            ("gondolin_bytes_rx_total", i.bytes_rx.load(Ordering::Relaxed)),
            ("gondolin_bytes_tx_total", i.bytes_tx.load(Ordering::Relaxed)),
            (
                "gondolin_frames_dropped_total",
                i.frames_dropped.load(Ordering::Relaxed),
            ),
            ("gondolin_dns_queries_total", i.dns_queries.load(Ordering::Relaxed)),
            ("gondolin_dns_denied_total", i.dns_denied.load(Ordering::Relaxed)),
            ("gondolin_tcp_opened_total", i.tcp_opened.load(Ordering::Relaxed)),
            ("gondolin_tcp_closed_total", i.tcp_closed.load(Ordering::Relaxed)),
            ("gondolin_syns_denied_total", i.syns_denied.load(Ordering::Relaxed)),
            (
                "gondolin_flows_spawned_total",
                i.flows_spawned.load(Ordering::Relaxed),
            ),
        ] {
            out.push_str("# TYPE ");
            out.push_str(name);
            out.push_str(" counter\n");
            out.push_str(name);
            out.push(' ');
            out.push_str(&value.to_string());
            out.push('\n');
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_counters() {
        let metrics = Metrics::new();
        metrics.frame_rx(100);
        metrics.frame_tx(60);
        let text = metrics.render_prometheus();
        assert!(text.contains("gondolin_frames_rx_total 1"));
        assert!(text.contains("gondolin_bytes_tx_total 60"));
    }
}
