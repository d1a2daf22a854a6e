#![forbid(unsafe_code)]

// Server metrics - lock-free counters rendered in Prometheus text format.

use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering::Relaxed};
use std::sync::Arc;

#[derive(Clone, Default)]
pub struct ServerMetrics {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    connections_total: AtomicU64,
    connections_active: AtomicU64,
    frames_received_total: AtomicU64,
    frames_sent_total: AtomicU64,
    errors_total: AtomicU64,
    rooms_created_total: AtomicU64,
    joins_total: AtomicU64,
    leaves_total: AtomicU64,
    producers_created_total: AtomicU64,
    consumers_created_total: AtomicU64,
    broadcasts_dropped_total: AtomicU64,
}

/// Decrements the active-connection gauge when dropped, so every exit path
/// of a connection handler balances the increment.
pub struct ConnectionGuard {
    inner: Arc<Inner>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.inner.connections_active.fetch_sub(1, Relaxed);
    }
}

impl ServerMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc_connections(&self) {
        self.inner.connections_total.fetch_add(1, Relaxed);
    }

    pub fn connection_active_guard(&self) -> ConnectionGuard {
        self.inner.connections_active.fetch_add(1, Relaxed);
        ConnectionGuard { inner: self.inner.clone() }
    }

    pub fn inc_frames_received(&self) {
        self.inner.frames_received_total.fetch_add(1, Relaxed);
    }

    pub fn inc_frames_sent(&self) {
        self.inner.frames_sent_total.fetch_add(1, Relaxed);
    }

    pub fn inc_errors(&self) {
        self.inner.errors_total.fetch_add(1, Relaxed);
    }

    pub fn inc_rooms_created(&self) {
        self.inner.rooms_created_total.fetch_add(1, Relaxed);
    }

    pub fn inc_joins(&self) {
        self.inner.joins_total.fetch_add(1, Relaxed);
    }

    pub fn inc_leaves(&self) {
        self.inner.leaves_total.fetch_add(1, Relaxed);
    }

    pub fn inc_producers_created(&self) {
        self.inner.producers_created_total.fetch_add(1, Relaxed);
    }

    pub fn inc_consumers_created(&self) {
        self.inner.consumers_created_total.fetch_add(1, Relaxed);
    }

    pub fn inc_broadcasts_dropped(&self) {
        self.inner.broadcasts_dropped_total.fetch_add(1, Relaxed);
    }

    /// Renders all metrics plus the caller-supplied gauges in Prometheus
    /// text exposition format.
    pub fn render_prometheus(&self, rooms: usize, peers: usize) -> String {
        let mut out = String::with_capacity(1024);

        let counters: [(&str, &str, u64); 9] = [
            ("signaling_connections_total", "WebSocket connections accepted", self.inner.connections_total.load(Relaxed)),
            ("signaling_frames_received_total", "Request frames received", self.inner.frames_received_total.load(Relaxed)),
            ("signaling_frames_sent_total", "Frames sent to clients", self.inner.frames_sent_total.load(Relaxed)),
            ("signaling_errors_total", "Requests answered with an error frame", self.inner.errors_total.load(Relaxed)),
            ("rooms_created_total", "Rooms materialized", self.inner.rooms_created_total.load(Relaxed)),
            ("peer_joins_total", "Successful joinRoom requests", self.inner.joins_total.load(Relaxed)),
            ("peer_leaves_total", "Peer teardowns", self.inner.leaves_total.load(Relaxed)),
            ("producers_created_total", "Producers created", self.inner.producers_created_total.load(Relaxed)),
            ("broadcasts_dropped_total", "Notifications dropped on full peer channels", self.inner.broadcasts_dropped_total.load(Relaxed)),
        ];
        for (name, help, value) in counters {
            let _ = writeln!(out, "# HELP {name} {help}");
            let _ = writeln!(out, "# TYPE {name} counter");
            let _ = writeln!(out, "{name} {value}");
        }

        let _ = writeln!(out, "# HELP consumers_created_total Consumers created");
        let _ = writeln!(out, "# TYPE consumers_created_total counter");
        let _ = writeln!(
            out,
            "consumers_created_total {}",
            self.inner.consumers_created_total.load(Relaxed)
        );

        let gauges: [(&str, &str, u64); 3] = [
            ("signaling_connections_active", "Currently open WebSocket connections", self.inner.connections_active.load(Relaxed)),
            ("rooms_active", "Rooms currently alive", rooms as u64),
            ("peers_active", "Peers currently joined", peers as u64),
        ];
        for (name, help, value) in gauges {
            let _ = writeln!(out, "# HELP {name} {help}");
            let _ = writeln!(out, "# TYPE {name} gauge");
            let _ = writeln!(out, "{name} {value}");
        }

        out
    }
}
