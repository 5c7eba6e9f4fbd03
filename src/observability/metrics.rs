// Discovery metrics
//
// Counters, gauges and histograms owned by one DiscoveryService:
// - call outcomes by error kind
// - grants and fault iterations
// - teardown outcomes
// - in-flight calls and call latency
//
// Everything is atomic so concurrent calls share a registry without locks.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;

use crate::config::types::{AccessedAddrs, DiscoveryError};
use crate::safety::cleanup::TeardownReport;

/// Counter metric (monotonically increasing)
#[derive(Debug)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub fn new() -> Self {
        Self {
            value: AtomicU64::new(0),
        }
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, delta: u64) {
        self.value.fetch_add(delta, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

impl Default for Counter {
    fn default() -> Self {
        Self::new()
    }
}

/// Gauge metric (can go up or down)
#[derive(Debug)]
pub struct Gauge {
    value: AtomicU64,
}

impl Gauge {
    pub fn new() -> Self {
        Self {
            value: AtomicU64::new(0),
        }
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec(&self) {
        let _ = self
            .value
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| v.checked_sub(1));
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

impl Default for Gauge {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug)]
pub struct HistogramBucket {
    pub le: f64, // upper bound in seconds
    pub count: AtomicU64,
}

/// Latency histogram with cumulative buckets
#[derive(Debug)]
pub struct Histogram {
    buckets: Vec<HistogramBucket>,
    sum: AtomicU64, // microseconds
    count: AtomicU64,
}

impl Histogram {
    /// Buckets sized for fork-and-trace calls (sub-millisecond to seconds)
    pub fn new_latency() -> Self {
        let bucket_bounds = vec![
            0.0001, 0.00025, 0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.1, 0.5, 2.0,
        ];

        let buckets = bucket_bounds
            .into_iter()
            .map(|le| HistogramBucket {
                le,
                count: AtomicU64::new(0),
            })
            .collect();

        Self {
            buckets,
            sum: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    pub fn observe(&self, value: Duration) {
        let seconds = value.as_secs_f64();
        self.sum
            .fetch_add(value.as_micros() as u64, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);

        for bucket in &self.buckets {
            if seconds <= bucket.le {
                bucket.count.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn get_count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn get_sum_micros(&self) -> u64 {
        self.sum.load(Ordering::Relaxed)
    }

    pub fn get_bucket_count(&self, le: f64) -> u64 {
        self.buckets
            .iter()
            .find(|b| (b.le - le).abs() < 1e-9)
            .map(|b| b.count.load(Ordering::Relaxed))
            .unwrap_or(0)
    }
}

/// Per-service metrics registry
#[derive(Debug)]
pub struct DiscoveryMetrics {
    // Call outcomes
    pub calls_total: Counter,
    pub calls_succeeded: Counter,
    pub errors_sandbox_setup: Counter,
    pub errors_config: Counter,
    pub errors_unresolvable_access: Counter,
    pub errors_execution_fault: Counter,
    pub errors_timeout: Counter,
    pub errors_cancelled: Counter,
    pub errors_invalid_code: Counter,

    // Work done inside the isolated context
    pub blocks_granted: Counter,
    pub fault_iterations: Counter,

    // Teardown outcomes
    pub teardowns_completed: Counter,
    pub teardowns_failed: Counter,

    pub active_calls: Gauge,
    pub call_duration: Histogram,
}

impl DiscoveryMetrics {
    pub fn new() -> Self {
        Self {
            calls_total: Counter::new(),
            calls_succeeded: Counter::new(),
            errors_sandbox_setup: Counter::new(),
            errors_config: Counter::new(),
            errors_unresolvable_access: Counter::new(),
            errors_execution_fault: Counter::new(),
            errors_timeout: Counter::new(),
            errors_cancelled: Counter::new(),
            errors_invalid_code: Counter::new(),

            blocks_granted: Counter::new(),
            fault_iterations: Counter::new(),

            teardowns_completed: Counter::new(),
            teardowns_failed: Counter::new(),

            active_calls: Gauge::new(),
            call_duration: Histogram::new_latency(),
        }
    }

    /// Record the outcome of one call
    pub fn record_outcome(
        &self,
        result: &std::result::Result<AccessedAddrs, DiscoveryError>,
        duration: Duration,
    ) {
        self.calls_total.inc();
        self.call_duration.observe(duration);

        match result {
            Ok(_) => self.calls_succeeded.inc(),
            Err(err) => match err {
                DiscoveryError::SandboxSetup(_) => self.errors_sandbox_setup.inc(),
                DiscoveryError::Config(_) => self.errors_config.inc(),
                DiscoveryError::UnresolvableAccess { .. } => self.errors_unresolvable_access.inc(),
                DiscoveryError::ExecutionFault { .. } => self.errors_execution_fault.inc(),
                DiscoveryError::Timeout { .. } => self.errors_timeout.inc(),
                DiscoveryError::Cancelled => self.errors_cancelled.inc(),
                DiscoveryError::InvalidCode(_) => self.errors_invalid_code.inc(),
            },
        }
    }

    /// Record the grants and fault iterations of a finished call,
    /// successful or not
    pub fn record_work(&self, iterations: u32, blocks_granted: usize) {
        self.fault_iterations.add(iterations as u64);
        self.blocks_granted.add(blocks_granted as u64);
    }

    pub fn record_teardown(&self, report: Option<&TeardownReport>) {
        match report {
            Some(report) if report.reaped || report.pid.is_none() => {
                self.teardowns_completed.inc()
            }
            _ => self.teardowns_failed.inc(),
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            calls_total: self.calls_total.get(),
            calls_succeeded: self.calls_succeeded.get(),
            errors_sandbox_setup: self.errors_sandbox_setup.get(),
            errors_config: self.errors_config.get(),
            errors_unresolvable_access: self.errors_unresolvable_access.get(),
            errors_execution_fault: self.errors_execution_fault.get(),
            errors_timeout: self.errors_timeout.get(),
            errors_cancelled: self.errors_cancelled.get(),
            errors_invalid_code: self.errors_invalid_code.get(),
            blocks_granted: self.blocks_granted.get(),
            fault_iterations: self.fault_iterations.get(),
            teardowns_completed: self.teardowns_completed.get(),
            teardowns_failed: self.teardowns_failed.get(),
            active_calls: self.active_calls.get(),
            call_duration_count: self.call_duration.get_count(),
            call_duration_sum_micros: self.call_duration.get_sum_micros(),
        }
    }

    /// Export metrics in Prometheus text format
    pub fn export_prometheus(&self) -> String {
        let mut output = String::new();

        output.push_str("# HELP addrprobe_calls_total Total number of discovery calls\n");
        output.push_str("# TYPE addrprobe_calls_total counter\n");
        output.push_str(&format!("addrprobe_calls_total {}\n", self.calls_total.get()));

        output.push_str("# HELP addrprobe_calls_by_outcome Discovery calls by outcome\n");
        output.push_str("# TYPE addrprobe_calls_by_outcome counter\n");
        for (outcome, counter) in [
            ("ok", &self.calls_succeeded),
            ("sandbox_setup", &self.errors_sandbox_setup),
            ("config", &self.errors_config),
            ("unresolvable_access", &self.errors_unresolvable_access),
            ("execution_fault", &self.errors_execution_fault),
            ("timeout", &self.errors_timeout),
            ("cancelled", &self.errors_cancelled),
            ("invalid_code", &self.errors_invalid_code),
        ] {
            output.push_str(&format!(
                "addrprobe_calls_by_outcome{{outcome=\"{}\"}} {}\n",
                outcome,
                counter.get()
            ));
        }

        output.push_str("# HELP addrprobe_blocks_granted_total Blocks granted to sandboxed code\n");
        output.push_str("# TYPE addrprobe_blocks_granted_total counter\n");
        output.push_str(&format!(
            "addrprobe_blocks_granted_total {}\n",
            self.blocks_granted.get()
        ));

        output.push_str("# HELP addrprobe_teardowns Isolated context teardowns by result\n");
        output.push_str("# TYPE addrprobe_teardowns counter\n");
        output.push_str(&format!(
            "addrprobe_teardowns{{result=\"completed\"}} {}\n",
            self.teardowns_completed.get()
        ));
        output.push_str(&format!(
            "addrprobe_teardowns{{result=\"failed\"}} {}\n",
            self.teardowns_failed.get()
        ));

        output.push_str("# HELP addrprobe_active_calls Discovery calls in flight\n");
        output.push_str("# TYPE addrprobe_active_calls gauge\n");
        output.push_str(&format!("addrprobe_active_calls {}\n", self.active_calls.get()));

        output.push_str("# HELP addrprobe_call_duration_seconds Discovery call latency\n");
        output.push_str("# TYPE addrprobe_call_duration_seconds histogram\n");
        for bucket in &self.call_duration.buckets {
            output.push_str(&format!(
                "addrprobe_call_duration_seconds_bucket{{le=\"{}\"}} {}\n",
                bucket.le,
                bucket.count.load(Ordering::Relaxed)
            ));
        }
        output.push_str(&format!(
            "addrprobe_call_duration_seconds_bucket{{le=\"+Inf\"}} {}\n",
            self.call_duration.get_count()
        ));
        output.push_str(&format!(
            "addrprobe_call_duration_seconds_sum {}\n",
            self.call_duration.get_sum_micros() as f64 / 1_000_000.0
        ));
        output.push_str(&format!(
            "addrprobe_call_duration_seconds_count {}\n",
            self.call_duration.get_count()
        ));

        output
    }
}

impl Default for DiscoveryMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time copy of a registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub calls_total: u64,
    pub calls_succeeded: u64,
    pub errors_sandbox_setup: u64,
    pub errors_config: u64,
    pub errors_unresolvable_access: u64,
    pub errors_execution_fault: u64,
    pub errors_timeout: u64,
    pub errors_cancelled: u64,
    pub errors_invalid_code: u64,
    pub blocks_granted: u64,
    pub fault_iterations: u64,
    pub teardowns_completed: u64,
    pub teardowns_failed: u64,
    pub active_calls: u64,
    pub call_duration_count: u64,
    pub call_duration_sum_micros: u64,
}
