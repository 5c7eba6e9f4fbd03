/// Structured audit events for discovery calls
///
/// Every call gets a run id. Events carry it so the log lines of one call
/// (and of the calls of one batch) can be correlated:
/// - call start and end
/// - timeouts and cancellations
/// - teardown outcome
///
/// Events always go to the `log` facade under the `addrprobe::audit` target.
/// A service configured with an audit file also appends them there as JSON
/// lines.
use crate::config::types::{AccessedAddrs, DiscoveryError, Result};
use crate::safety::cleanup::TeardownReport;
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::SystemTime;
use uuid::Uuid;

pub const AUDIT_TARGET: &str = "addrprobe::audit";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuditSeverity {
    High,
    Medium,
    Low,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuditEventType {
    DiscoveryStart,
    DiscoveryEnd,
    TimeoutExceeded,
    DiscoveryCancelled,
    TeardownSuccess,
    TeardownFailure,
}

impl AuditEventType {
    pub fn default_severity(&self) -> AuditSeverity {
        match self {
            AuditEventType::DiscoveryStart => AuditSeverity::Low,
            AuditEventType::DiscoveryEnd => AuditSeverity::Low,
            AuditEventType::TimeoutExceeded => AuditSeverity::Medium,
            AuditEventType::DiscoveryCancelled => AuditSeverity::Low,
            AuditEventType::TeardownSuccess => AuditSeverity::Low,
            AuditEventType::TeardownFailure => AuditSeverity::High,
        }
    }
}

/// Correlation identifiers for one call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CorrelationIds {
    /// Shared by every call of one batch; equals `run_id` for single calls
    pub request_id: String,
    /// Unique to this call
    pub run_id: String,
    /// Pid of the isolated context, once forked
    pub tracee_pid: Option<i32>,
}

impl CorrelationIds {
    pub fn new() -> Self {
        let run_id = Uuid::new_v4().to_string();
        Self {
            request_id: run_id.clone(),
            run_id,
            tracee_pid: None,
        }
    }

    /// A call belonging to the batch `request_id`.
    pub fn for_request(request_id: &str) -> Self {
        Self {
            request_id: request_id.to_string(),
            ..Self::new()
        }
    }

    pub fn with_tracee_pid(mut self, pid: i32) -> Self {
        self.tracee_pid = Some(pid);
        self
    }
}

impl Default for CorrelationIds {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub event_type: AuditEventType,
    pub severity: AuditSeverity,
    pub timestamp: SystemTime,
    pub details: String,
    pub correlation: CorrelationIds,
    pub error_kind: Option<String>,
    pub accessed_blocks: Option<Vec<u64>>,
}

impl AuditEvent {
    pub fn new(event_type: AuditEventType, correlation: &CorrelationIds, details: String) -> Self {
        Self {
            event_type,
            severity: event_type.default_severity(),
            timestamp: SystemTime::now(),
            details,
            correlation: correlation.clone(),
            error_kind: None,
            accessed_blocks: None,
        }
    }

    pub fn with_error(mut self, err: &DiscoveryError) -> Self {
        self.error_kind = Some(err.kind().to_string());
        self
    }

    pub fn with_blocks(mut self, blocks: &[u64]) -> Self {
        self.accessed_blocks = Some(blocks.to_vec());
        self
    }

    pub fn to_json(&self) -> serde_json::Value {
        let mut entry = serde_json::json!({
            "timestamp": self.timestamp
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis() as u64,
            "event_type": self.event_type,
            "severity": self.severity,
            "details": self.details,
            "correlation": self.correlation,
            "process_id": std::process::id(),
        });
        if let Some(kind) = &self.error_kind {
            entry["error_kind"] = serde_json::json!(kind);
        }
        if let Some(blocks) = &self.accessed_blocks {
            entry["accessed_blocks"] = serde_json::json!(blocks);
        }
        entry
    }
}

/// Sink for audit events; owned by a service, never global.
#[derive(Debug, Default)]
pub struct AuditLogger {
    audit_file: Option<Mutex<File>>,
    audit_path: Option<PathBuf>,
}

impl AuditLogger {
    /// Logger that only writes to the `log` facade.
    pub fn log_only() -> Self {
        Self::default()
    }

    /// Logger that also appends JSON lines to `path`.
    pub fn with_file(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    DiscoveryError::Config(format!("Failed to create audit log directory: {}", e))
                })?;
            }
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| DiscoveryError::Config(format!("Failed to open audit log: {}", e)))?;

        Ok(Self {
            audit_file: Some(Mutex::new(file)),
            audit_path: Some(path.to_path_buf()),
        })
    }

    pub fn audit_path(&self) -> Option<&Path> {
        self.audit_path.as_deref()
    }

    pub fn record(&self, event: AuditEvent) {
        let entry = event.to_json();

        match event.severity {
            AuditSeverity::High => error!(target: AUDIT_TARGET, "{}", entry),
            AuditSeverity::Medium => warn!(target: AUDIT_TARGET, "{}", entry),
            AuditSeverity::Low => info!(target: AUDIT_TARGET, "{}", entry),
        }

        if let Some(file) = &self.audit_file {
            match file.lock() {
                Ok(mut file) => {
                    if let Err(e) = writeln!(file, "{}", entry).and_then(|_| file.flush()) {
                        error!("Failed to write audit log: {}", e);
                    }
                }
                Err(_) => error!("Failed to acquire lock on audit file"),
            }
        }
    }

    pub fn discovery_start(&self, correlation: &CorrelationIds, code_len: usize) {
        self.record(AuditEvent::new(
            AuditEventType::DiscoveryStart,
            correlation,
            format!("discovering accesses of {} byte block", code_len),
        ));
    }

    pub fn discovery_end(
        &self,
        correlation: &CorrelationIds,
        result: &std::result::Result<AccessedAddrs, DiscoveryError>,
    ) {
        let event = match result {
            Ok(addrs) => AuditEvent::new(
                AuditEventType::DiscoveryEnd,
                correlation,
                format!("block at {:#x} completed", addrs.code_location),
            )
            .with_blocks(&addrs.accessed_blocks),
            Err(err) => {
                let (event_type, details) = match err {
                    DiscoveryError::Timeout { .. } => {
                        (AuditEventType::TimeoutExceeded, err.to_string())
                    }
                    DiscoveryError::Cancelled => {
                        (AuditEventType::DiscoveryCancelled, "cancelled by caller".to_string())
                    }
                    _ => (AuditEventType::DiscoveryEnd, err.to_string()),
                };
                AuditEvent::new(event_type, correlation, details).with_error(err)
            }
        };
        self.record(event);
    }

    pub fn teardown(&self, correlation: &CorrelationIds, report: Option<&TeardownReport>) {
        let event = match report {
            Some(report) => AuditEvent::new(
                AuditEventType::TeardownSuccess,
                correlation,
                format!(
                    "kill_sent={} reaped={} term_signal={:?}",
                    report.kill_sent, report.reaped, report.term_signal
                ),
            ),
            None => AuditEvent::new(
                AuditEventType::TeardownFailure,
                correlation,
                "isolated context could not be reaped".to_string(),
            ),
        };
        self.record(event);
    }
}
