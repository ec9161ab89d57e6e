#![forbid(unsafe_code)]

// Server metrics: lock-free AtomicU64 counters and a Prometheus-compatible histogram.

use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering::Relaxed};
use std::sync::Arc;
use std::time::Duration;

/// Histogram buckets as (upper bound in microseconds, Prometheus `le` label).
/// Tilted toward sub-millisecond handling times.
const LATENCY_BUCKETS: [(u64, &str); 10] = [
    (100, "0.0001"),
    (250, "0.00025"),
    (500, "0.0005"),
    (1_000, "0.001"),
    (2_500, "0.0025"),
    (5_000, "0.005"),
    (10_000, "0.01"),
    (50_000, "0.05"),
    (250_000, "0.25"),
    (1_000_000, "1"),
];

/// Cumulative latency histogram over [`LATENCY_BUCKETS`]
#[derive(Default)]
struct LatencyHistogram {
    /// `le[i]` counts observations at or under `LATENCY_BUCKETS[i].0`
    le: [AtomicU64; LATENCY_BUCKETS.len()],
    count: AtomicU64,
    sum_us: AtomicU64,
}

impl LatencyHistogram {
    fn observe(&self, elapsed: Duration) {
        let us = u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX);
        self.count.fetch_add(1, Relaxed);
        self.sum_us.fetch_add(us, Relaxed);
        LATENCY_BUCKETS
            .iter()
            .zip(&self.le)
            .filter(|((bound, _), _)| us <= *bound)
            .for_each(|(_, slot)| {
                slot.fetch_add(1, Relaxed);
            });
    }
}

/// Server-wide metrics using lock-free atomics.
#[derive(Clone)]
pub struct ServerMetrics {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    // Monotonic counters
    connections_total: AtomicU64,
    messages_received_total: AtomicU64,
    messages_sent_total: AtomicU64,
    messages_dropped_total: AtomicU64,
    errors_total: AtomicU64,
    rooms_created_total: AtomicU64,
    rooms_closed_total: AtomicU64,
    rooms_evicted_total: AtomicU64,
    joins_total: AtomicU64,
    leaves_total: AtomicU64,
    members_evicted_total: AtomicU64,
    signals_relayed_total: AtomicU64,
    signals_dropped_total: AtomicU64,
    chat_messages_total: AtomicU64,
    recordings_started_total: AtomicU64,

    // Gauge
    connections_active: AtomicU64,

    // Histogram
    message_handling: LatencyHistogram,
}

impl Default for ServerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerMetrics {
    pub fn new() -> Self {
        Self { inner: Arc::new(Inner::default()) }
    }

    // --- Counter increments ---

    pub fn inc_connections_total(&self) {
        self.inner.connections_total.fetch_add(1, Relaxed);
    }

    pub fn inc_messages_received(&self) {
        self.inner.messages_received_total.fetch_add(1, Relaxed);
    }

    pub fn inc_messages_sent(&self) {
        self.inner.messages_sent_total.fetch_add(1, Relaxed);
    }

    /// Outbound frame dropped because a recipient's channel was full
    pub fn inc_messages_dropped(&self) {
        self.inner.messages_dropped_total.fetch_add(1, Relaxed);
    }

    pub fn inc_errors(&self) {
        self.inner.errors_total.fetch_add(1, Relaxed);
    }

    pub fn inc_rooms_created(&self) {
        self.inner.rooms_created_total.fetch_add(1, Relaxed);
    }

    pub fn inc_rooms_closed(&self) {
        self.inner.rooms_closed_total.fetch_add(1, Relaxed);
    }

    pub fn inc_rooms_evicted(&self) {
        self.inner.rooms_evicted_total.fetch_add(1, Relaxed);
    }

    pub fn inc_joins(&self) {
        self.inner.joins_total.fetch_add(1, Relaxed);
    }

    pub fn inc_leaves(&self) {
        self.inner.leaves_total.fetch_add(1, Relaxed);
    }

    /// A member whose queue overflowed on a room event was dropped from its room
    pub fn inc_members_evicted(&self) {
        self.inner.members_evicted_total.fetch_add(1, Relaxed);
    }

    pub fn inc_signals_relayed(&self) {
        self.inner.signals_relayed_total.fetch_add(1, Relaxed);
    }

    pub fn inc_signals_dropped(&self) {
        self.inner.signals_dropped_total.fetch_add(1, Relaxed);
    }

    pub fn inc_chat_messages(&self) {
        self.inner.chat_messages_total.fetch_add(1, Relaxed);
    }

    pub fn inc_recordings_started(&self) {
        self.inner.recordings_started_total.fetch_add(1, Relaxed);
    }

    // --- Gauge ---

    /// Counts one live connection until the guard is dropped
    pub fn connection_active_guard(&self) -> ConnectionGuard {
        self.inner.connections_active.fetch_add(1, Relaxed);
        ConnectionGuard { inner: self.inner.clone() }
    }

    // --- Histogram ---

    pub fn observe_message_handling(&self, duration: Duration) {
        self.inner.message_handling.observe(duration);
    }

    // --- Prometheus rendering ---

    /// Render all metrics in Prometheus text exposition format.
    /// `rooms_active` and `participants_active` are read from RoomManager on demand.
    pub fn render_prometheus(&self, rooms_active: usize, participants_active: usize) -> String {
        let mut out = String::with_capacity(4096);

        let i = &self.inner;

        let counters = [
            ("connections_total", "Total WebSocket connections", &i.connections_total),
            ("messages_received_total", "Total frames received from clients", &i.messages_received_total),
            ("messages_sent_total", "Total frames sent to clients", &i.messages_sent_total),
            ("messages_dropped_total", "Outbound frames dropped on full channels", &i.messages_dropped_total),
            ("errors_total", "Total rejected client frames", &i.errors_total),
            ("rooms_created_total", "Total rooms created", &i.rooms_created_total),
            ("rooms_closed_total", "Total rooms closed after the last participant left", &i.rooms_closed_total),
            ("rooms_evicted_total", "Total empty persisted rooms evicted at the room cap", &i.rooms_evicted_total),
            ("joins_total", "Total room joins", &i.joins_total),
            ("leaves_total", "Total room leaves", &i.leaves_total),
            ("members_evicted_total", "Members dropped after missing room events on a full queue", &i.members_evicted_total),
            ("signals_relayed_total", "Offers, answers and candidates delivered", &i.signals_relayed_total),
            ("signals_dropped_total", "Signals addressed to unknown connections", &i.signals_dropped_total),
            ("chat_messages_total", "Total chat messages posted", &i.chat_messages_total),
            ("recordings_started_total", "Total recording sessions started", &i.recordings_started_total),
        ];
        for (name, help, value) in counters {
            render_metric(&mut out, "counter", name, help, value.load(Relaxed));
        }

        let gauges = [
            ("connections_active", "Currently active WebSocket connections", i.connections_active.load(Relaxed)),
            ("rooms_active", "Currently active rooms", rooms_active as u64),
            ("participants_active", "Currently active participants", participants_active as u64),
        ];
        for (name, help, value) in gauges {
            render_metric(&mut out, "gauge", name, help, value);
        }

        render_histogram(
            &mut out,
            "message_handling_seconds",
            "Time spent handling one client frame",
            &i.message_handling,
        );

        out
    }
}

/// RAII guard that decrements `connections_active` on drop.
/// Prevents gauge underflow/drift if the connection handler panics.
pub struct ConnectionGuard {
    inner: Arc<Inner>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.inner.connections_active.fetch_sub(1, Relaxed);
    }
}

/// Every exported name carries this prefix
const PREFIX: &str = "huddle_";

fn render_metric(out: &mut String, kind: &str, name: &str, help: &str, value: u64) {
    let _ = writeln!(out, "# HELP {PREFIX}{name} {help}");
    let _ = writeln!(out, "# TYPE {PREFIX}{name} {kind}");
    let _ = writeln!(out, "{PREFIX}{name} {value}");
}

fn render_histogram(out: &mut String, name: &str, help: &str, histogram: &LatencyHistogram) {
    let _ = writeln!(out, "# HELP {PREFIX}{name} {help}");
    let _ = writeln!(out, "# TYPE {PREFIX}{name} histogram");
    for ((_, label), slot) in LATENCY_BUCKETS.iter().zip(&histogram.le) {
        let _ = writeln!(out, "{PREFIX}{name}_bucket{{le=\"{label}\"}} {}", slot.load(Relaxed));
    }
    let count = histogram.count.load(Relaxed);
    let sum_us = histogram.sum_us.load(Relaxed);
    let _ = writeln!(out, "{PREFIX}{name}_bucket{{le=\"+Inf\"}} {count}");
    let _ = writeln!(out, "{PREFIX}{name}_sum {}.{:06}", sum_us / 1_000_000, sum_us % 1_000_000);
    let _ = writeln!(out, "{PREFIX}{name}_count {count}");
}
