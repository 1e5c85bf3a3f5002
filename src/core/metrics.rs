use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Snapshot of one server's counters at a point in time
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub server: String,
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub timeouts: u64,
    pub retries: u64,
    pub connection_failures: u64,
    pub average_latency_ms: f64,
    pub p95_latency_ms: f64,
    pub p99_latency_ms: f64,
    pub success_rate: f64,
    pub last_request_time: Option<Instant>,
}

/// Request counters and latency samples for a single server
#[derive(Debug)]
pub struct ServerMetrics {
    server: String,

    total_requests: AtomicU64,
    successful_requests: AtomicU64,
    failed_requests: AtomicU64,
    timeouts: AtomicU64,
    retries: AtomicU64,
    connection_failures: AtomicU64,

    latency_tracker: Mutex<LatencyTracker>,
    last_request_time: Mutex<Option<Instant>>,
}

impl ServerMetrics {
    pub fn new(server: impl Into<String>) -> Self {
        Self {
            server: server.into(),
            total_requests: AtomicU64::new(0),
            successful_requests: AtomicU64::new(0),
            failed_requests: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
            retries: AtomicU64::new(0),
            connection_failures: AtomicU64::new(0),
            latency_tracker: Mutex::new(LatencyTracker::new()),
            last_request_time: Mutex::new(None),
        }
    }

    pub fn server(&self) -> &str {
        &self.server
    }

    pub fn record_success(&self, latency: Duration) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        self.successful_requests.fetch_add(1, Ordering::Relaxed);
        *self.last_request_time.lock() = Some(Instant::now());
        self.latency_tracker.lock().record_latency(latency);
    }

    pub fn record_failure(&self, latency: Option<Duration>) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        self.failed_requests.fetch_add(1, Ordering::Relaxed);
        *self.last_request_time.lock() = Some(Instant::now());
        if let Some(latency) = latency {
            self.latency_tracker.lock().record_latency(latency);
        }
    }

    pub fn record_timeout(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
        self.record_failure(None); // Timeout is also a failure
    }

    pub fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_connection_failure(&self) {
        self.connection_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let total = self.total_requests.load(Ordering::Relaxed);
        let successes = self.successful_requests.load(Ordering::Relaxed);

        let success_rate = if total > 0 {
            (successes as f64) / (total as f64) * 100.0
        } else {
            0.0
        };

        let (avg_latency, p95_latency, p99_latency) = {
            let tracker = self.latency_tracker.lock();
            (
                tracker.average_latency_ms(),
                tracker.percentile_latency_ms(95.0),
                tracker.percentile_latency_ms(99.0),
            )
        };

        MetricsSnapshot {
            server: self.server.clone(),
            total_requests: total,
            successful_requests: successes,
            failed_requests: self.failed_requests.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            connection_failures: self.connection_failures.load(Ordering::Relaxed),
            average_latency_ms: avg_latency,
            p95_latency_ms: p95_latency,
            p99_latency_ms: p99_latency,
            success_rate,
            last_request_time: *self.last_request_time.lock(),
        }
    }
}

/// Metrics for every server the client has talked to
#[derive(Debug, Default)]
pub struct MetricsRegistry {
    servers: RwLock<HashMap<String, Arc<ServerMetrics>>>,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn for_server(&self, address: &str) -> Arc<ServerMetrics> {
        if let Some(metrics) = self.servers.read().get(address) {
            return metrics.clone();
        }
        self.servers
            .write()
            .entry(address.to_string())
            .or_insert_with(|| Arc::new(ServerMetrics::new(address)))
            .clone()
    }

    pub fn remove(&self, address: &str) {
        self.servers.write().remove(address);
    }

    pub fn snapshot(&self) -> Vec<MetricsSnapshot> {
        let mut snapshots: Vec<MetricsSnapshot> =
            self.servers.read().values().map(|m| m.snapshot()).collect();
        snapshots.sort_by(|a, b| a.server.cmp(&b.server));
        snapshots
    }
}

/// Latency tracking with sliding window for percentiles
#[derive(Debug)]
struct LatencyTracker {
    latencies: Vec<Duration>,
    max_samples: usize,
    next_index: usize,
}

impl LatencyTracker {
    fn new() -> Self {
        Self {
            latencies: Vec::with_capacity(1000),
            max_samples: 1000, // Keep last 1000 samples for percentile calculation
            next_index: 0,
        }
    }

    fn record_latency(&mut self, latency: Duration) {
        if self.latencies.len() < self.max_samples {
            self.latencies.push(latency);
        } else {
            self.latencies[self.next_index] = latency;
            self.next_index = (self.next_index + 1) % self.max_samples;
        }
    }

    fn average_latency_ms(&self) -> f64 {
        if self.latencies.is_empty() {
            return 0.0;
        }

        let total_ms: f64 = self
            .latencies
            .iter()
            .map(|d| d.as_secs_f64() * 1000.0)
            .sum();

        total_ms / self.latencies.len() as f64
    }

    fn percentile_latency_ms(&self, percentile: f64) -> f64 {
        if self.latencies.is_empty() {
            return 0.0;
        }

        let mut sorted_latencies = self.latencies.clone();
        sorted_latencies.sort();

        let index = ((percentile / 100.0) * sorted_latencies.len() as f64) as usize;
        let index = index.min(sorted_latencies.len() - 1);

        sorted_latencies[index].as_secs_f64() * 1000.0
    }
}
