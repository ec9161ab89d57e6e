use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;
use std::collections::HashMap;
use serde::{Deserialize, Serialize};

/// Metrics collected during a test client session
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientMetrics {
    pub client_id: String,
    pub room_id: String,
    pub connection_successful: bool,
    pub connection_time_ms: u64,
    pub frames_sent: u64,
    pub frames_received: u64,
    pub chat_messages_received: u64,
    pub signals_received: u64,
    pub server_errors: u64,
    pub errors: Vec<String>,
    pub session_duration_ms: u64,
    pub signaling_latencies: SignalingLatencyReport,
    pub reconnections: u32,
    pub reconnection_failures: u32,
}

/// Signaling latency report per operation
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalingLatencyReport {
    pub operations: HashMap<String, LatencyStats>,
}

/// Latency statistics for a single operation type
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LatencyStats {
    pub count: usize,
    pub min_ms: u64,
    pub max_ms: u64,
    pub avg_ms: u64,
    pub p50_ms: u64,
    pub p95_ms: u64,
    pub p99_ms: u64,
}

impl LatencyStats {
    /// Summarize raw samples; None when there are none
    fn from_samples(mut samples: Vec<u64>) -> Option<Self> {
        samples.sort_unstable();
        let count = samples.len();
        let min_ms = *samples.first()?;
        let max_ms = *samples.last()?;
        let avg_ms = samples.iter().sum::<u64>() / count as u64;
        Some(Self {
            count,
            min_ms,
            max_ms,
            avg_ms,
            p50_ms: percentile(&samples, 0.50),
            p95_ms: percentile(&samples, 0.95),
            p99_ms: percentile(&samples, 0.99),
        })
    }
}

/// Real-time metrics collector (thread-safe)
pub struct MetricsCollector {
    client_id: String,
    room_id: std::sync::Mutex<String>,
    start_time: Instant,
    connection_successful: AtomicBool,
    connection_time_ms: AtomicU64,
    frames_sent: AtomicU64,
    frames_received: AtomicU64,
    chat_messages_received: AtomicU64,
    signals_received: AtomicU64,
    server_errors: AtomicU64,
    errors: std::sync::Mutex<Vec<String>>,
    signaling_latencies: std::sync::Mutex<HashMap<String, Vec<u64>>>,
    reconnections: AtomicU64,
    reconnection_failures: AtomicU64,
}

impl MetricsCollector {
    pub fn new(client_id: String) -> Self {
        Self {
            client_id,
            room_id: std::sync::Mutex::new(String::new()),
            start_time: Instant::now(),
            connection_successful: AtomicBool::new(false),
            connection_time_ms: AtomicU64::new(0),
            frames_sent: AtomicU64::new(0),
            frames_received: AtomicU64::new(0),
            chat_messages_received: AtomicU64::new(0),
            signals_received: AtomicU64::new(0),
            server_errors: AtomicU64::new(0),
            errors: std::sync::Mutex::new(Vec::new()),
            signaling_latencies: std::sync::Mutex::new(HashMap::new()),
            reconnections: AtomicU64::new(0),
            reconnection_failures: AtomicU64::new(0),
        }
    }

    pub fn set_room_id(&self, room_id: &str) {
        if let Ok(mut r) = self.room_id.lock() {
            *r = room_id.to_string();
        }
    }

    /// Time from connect to the server's `connected` greeting
    pub fn mark_connection_successful(&self, ms: u64) {
        self.connection_successful.store(true, Ordering::SeqCst);
        self.connection_time_ms.store(ms, Ordering::SeqCst);
    }

    pub fn record_frame_sent(&self) {
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_frame_received(&self) {
        self.frames_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_chat_received(&self) {
        self.chat_messages_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_signal_received(&self) {
        self.signals_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_server_error(&self, message: &str) {
        self.server_errors.fetch_add(1, Ordering::Relaxed);
        self.record_error(format!("server: {message}"));
    }

    pub fn record_error(&self, error: String) {
        if let Ok(mut errors) = self.errors.lock() {
            errors.push(error);
        }
    }

    /// Record a signaling round-trip latency for a named operation
    pub fn record_signaling_latency(&self, operation: &str, ms: u64) {
        if let Ok(mut latencies) = self.signaling_latencies.lock() {
            latencies.entry(operation.to_string()).or_default().push(ms);
        }
    }

    pub fn record_reconnection(&self) {
        self.reconnections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reconnection_failure(&self) {
        self.reconnection_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Generate final metrics report (sync, safe to call from an OS thread)
    pub fn generate_report(&self) -> ClientMetrics {
        let errors = self.errors.lock().map(|e| e.clone()).unwrap_or_default();
        let room_id = self.room_id.lock().map(|r| r.clone()).unwrap_or_default();
        let latencies = self.signaling_latencies.lock().map(|l| l.clone()).unwrap_or_default();

        let operations = latencies
            .into_iter()
            .filter_map(|(op, samples)| LatencyStats::from_samples(samples).map(|s| (op, s)))
            .collect();

        ClientMetrics {
            client_id: self.client_id.clone(),
            room_id,
            connection_successful: self.connection_successful.load(Ordering::SeqCst),
            connection_time_ms: self.connection_time_ms.load(Ordering::SeqCst),
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            frames_received: self.frames_received.load(Ordering::Relaxed),
            chat_messages_received: self.chat_messages_received.load(Ordering::Relaxed),
            signals_received: self.signals_received.load(Ordering::Relaxed),
            server_errors: self.server_errors.load(Ordering::Relaxed),
            errors,
            session_duration_ms: self.start_time.elapsed().as_millis() as u64,
            signaling_latencies: SignalingLatencyReport { operations },
            reconnections: self.reconnections.load(Ordering::Relaxed) as u32,
            reconnection_failures: self.reconnection_failures.load(Ordering::Relaxed) as u32,
        }
    }
}

/// Per-room summary statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomSummary {
    pub room_id: String,
    pub total_clients: usize,
    pub successful_connections: usize,
    pub chat_messages_received: u64,
    pub signals_received: u64,
    pub total_errors: usize,
}

/// Aggregated signaling latency across all clients
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregatedLatencies {
    pub operations: HashMap<String, LatencyStats>,
}

/// Aggregates metrics from multiple clients
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestSummary {
    pub total_clients: usize,
    pub successful_connections: usize,
    pub failed_connections: usize,
    pub average_connection_time_ms: u64,
    pub p50_connection_time_ms: u64,
    pub p95_connection_time_ms: u64,
    pub p99_connection_time_ms: u64,
    pub total_frames_sent: u64,
    pub total_frames_received: u64,
    pub total_chat_messages_received: u64,
    pub total_signals_received: u64,
    pub total_server_errors: u64,
    pub average_session_duration_ms: u64,
    pub total_errors: usize,
    pub signaling_latencies: AggregatedLatencies,
    pub rooms: Vec<RoomSummary>,
    pub total_reconnections: u32,
    pub total_reconnection_failures: u32,
}

impl TestSummary {
    pub fn from_metrics(metrics: &[ClientMetrics]) -> Self {
        if metrics.is_empty() {
            return Self::default();
        }

        let total_clients = metrics.len();
        let successful_connections = metrics.iter().filter(|m| m.connection_successful).count();

        let mut connection_times: Vec<u64> = metrics
            .iter()
            .filter(|m| m.connection_successful)
            .map(|m| m.connection_time_ms)
            .collect();
        connection_times.sort_unstable();

        let average_connection_time_ms = if connection_times.is_empty() {
            0
        } else {
            connection_times.iter().sum::<u64>() / connection_times.len() as u64
        };

        Self {
            total_clients,
            successful_connections,
            failed_connections: total_clients - successful_connections,
            average_connection_time_ms,
            p50_connection_time_ms: percentile(&connection_times, 0.50),
            p95_connection_time_ms: percentile(&connection_times, 0.95),
            p99_connection_time_ms: percentile(&connection_times, 0.99),
            total_frames_sent: metrics.iter().map(|m| m.frames_sent).sum(),
            total_frames_received: metrics.iter().map(|m| m.frames_received).sum(),
            total_chat_messages_received: metrics.iter().map(|m| m.chat_messages_received).sum(),
            total_signals_received: metrics.iter().map(|m| m.signals_received).sum(),
            total_server_errors: metrics.iter().map(|m| m.server_errors).sum(),
            average_session_duration_ms: metrics.iter().map(|m| m.session_duration_ms).sum::<u64>()
                / total_clients as u64,
            total_errors: metrics.iter().map(|m| m.errors.len()).sum(),
            signaling_latencies: Self::aggregate_latencies(metrics),
            rooms: Self::compute_room_summaries(metrics),
            total_reconnections: metrics.iter().map(|m| m.reconnections).sum(),
            total_reconnection_failures: metrics.iter().map(|m| m.reconnection_failures).sum(),
        }
    }

    fn compute_room_summaries(metrics: &[ClientMetrics]) -> Vec<RoomSummary> {
        let mut room_map: HashMap<String, Vec<&ClientMetrics>> = HashMap::new();
        for m in metrics {
            room_map.entry(m.room_id.clone()).or_default().push(m);
        }

        let mut rooms: Vec<RoomSummary> = room_map.into_iter().map(|(room_id, clients)| {
            RoomSummary {
                room_id,
                total_clients: clients.len(),
                successful_connections: clients.iter().filter(|c| c.connection_successful).count(),
                chat_messages_received: clients.iter().map(|c| c.chat_messages_received).sum(),
                signals_received: clients.iter().map(|c| c.signals_received).sum(),
                total_errors: clients.iter().map(|c| c.errors.len()).sum(),
            }
        }).collect();

        rooms.sort_by(|a, b| a.room_id.cmp(&b.room_id));
        rooms
    }

    fn aggregate_latencies(metrics: &[ClientMetrics]) -> AggregatedLatencies {
        let mut all_samples: HashMap<String, Vec<u64>> = HashMap::new();
        for m in metrics {
            for (op, stats) in &m.signaling_latencies.operations {
                // Only per-client stats survive; each client's p50 stands in as one sample
                all_samples.entry(op.clone()).or_default().push(stats.p50_ms);
            }
        }

        let operations = all_samples
            .into_iter()
            .filter_map(|(op, samples)| LatencyStats::from_samples(samples).map(|s| (op, s)))
            .collect();

        AggregatedLatencies { operations }
    }

    pub fn print_summary(&self) {
        println!("\n=== Load Test Summary ===");
        println!("Total Clients: {}", self.total_clients);
        println!("Successful Connections: {}", self.successful_connections);
        println!("Failed Connections: {}", self.failed_connections);
        println!("\nConnection Time:");
        println!("  Average: {} ms", self.average_connection_time_ms);
        println!("  P50: {} ms", self.p50_connection_time_ms);
        println!("  P95: {} ms", self.p95_connection_time_ms);
        println!("  P99: {} ms", self.p99_connection_time_ms);
        println!("\nTraffic:");
        println!("  Frames Sent: {}", self.total_frames_sent);
        println!("  Frames Received: {}", self.total_frames_received);
        println!("  Chat Messages Received: {}", self.total_chat_messages_received);
        println!("  Signals Received: {}", self.total_signals_received);
        println!("  Server Error Frames: {}", self.total_server_errors);

        if !self.signaling_latencies.operations.is_empty() {
            println!("\nSignaling Latencies (aggregated across clients):");
            let mut ops: Vec<_> = self.signaling_latencies.operations.iter().collect();
            ops.sort_by_key(|(k, _)| (*k).clone());
            for (op, stats) in &ops {
                println!("  {}: avg={}ms p50={}ms p95={}ms p99={}ms (n={})",
                    op, stats.avg_ms, stats.p50_ms, stats.p95_ms, stats.p99_ms, stats.count);
            }
        }

        // Room breakdown (only if more than 1 room)
        if self.rooms.len() > 1 {
            println!("\nPer-Room Breakdown ({} rooms):", self.rooms.len());
            for room in &self.rooms {
                println!("  {}: {} clients, {} chat received, {} signals received, {} errors",
                    room.room_id, room.total_clients, room.chat_messages_received,
                    room.signals_received, room.total_errors);
            }
        }

        // Churn stats (only if churn occurred)
        if self.total_reconnections > 0 || self.total_reconnection_failures > 0 {
            println!("\nChurn Statistics:");
            println!("  Total Reconnections: {}", self.total_reconnections);
            println!("  Reconnection Failures: {}", self.total_reconnection_failures);
        }

        println!("\nSession:");
        println!("  Average Duration: {} ms ({:.2} s)", self.average_session_duration_ms, self.average_session_duration_ms as f64 / 1000.0);
        println!("  Total Errors: {}", self.total_errors);
        println!("========================\n");
    }
}

fn percentile(sorted_data: &[u64], p: f64) -> u64 {
    if sorted_data.is_empty() {
        return 0;
    }
    let idx = (p * (sorted_data.len() - 1) as f64).round() as usize;
    sorted_data[idx.min(sorted_data.len() - 1)]
}
