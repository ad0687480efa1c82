use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

pub const DEFAULT_ACCESS_CAP: usize = 500;
pub const DEFAULT_OPERATION_CAP: usize = 500;
pub const DEFAULT_API_CAP: usize = 1000;

/// Which of the three audit rings an entry belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogType {
    /// One entry per inbound request, whatever its outcome.
    Access,
    /// Domain-level actions: auth outcomes, key checks, mutations.
    Operation,
    /// One entry per dispatched request with status and latency.
    Api,
}

impl LogType {
    pub fn as_str(self) -> &'static str {
        match self {
            LogType::Access => "access",
            LogType::Operation => "operation",
            LogType::Api => "api",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuditLogEntry {
    pub timestamp: i64,
    pub client_ip: String,
    pub category: String,
    pub message: String,
    pub details: Value,
}

impl AuditLogEntry {
    pub fn new(
        client_ip: impl Into<String>,
        category: impl Into<String>,
        message: impl Into<String>,
        details: Value,
    ) -> Self {
        Self {
            timestamp: now(),
            client_ip: client_ip.into(),
            category: category.into(),
            message: message.into(),
            details,
        }
    }
}

// ── Ring ──────────────────────────────────────────────────────────────────────

/// Fixed-capacity FIFO log. Entries are never modified once appended.
pub struct AuditRing {
    cap: usize,
    entries: Mutex<VecDeque<AuditLogEntry>>,
}

impl AuditRing {
    pub fn new(cap: usize) -> Self {
        let cap = cap.max(1);
        Self {
            cap,
            entries: Mutex::new(VecDeque::with_capacity(cap)),
        }
    }

    pub fn append(&self, entry: AuditLogEntry) {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.push_back(entry);
        while entries.len() > self.cap {
            entries.pop_front();
        }
    }

    /// Newest first, at most `limit` entries.
    pub fn query(&self, limit: usize) -> Vec<AuditLogEntry> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.iter().rev().take(limit).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn cap(&self) -> usize {
        self.cap
    }
}

// ── Aggregator ────────────────────────────────────────────────────────────────

pub struct AuditLogs {
    access: AuditRing,
    operation: AuditRing,
    api: AuditRing,
}

impl Default for AuditLogs {
    fn default() -> Self {
        Self::with_caps(DEFAULT_ACCESS_CAP, DEFAULT_OPERATION_CAP, DEFAULT_API_CAP)
    }
}

impl AuditLogs {
    pub fn with_caps(access: usize, operation: usize, api: usize) -> Self {
        Self {
            access: AuditRing::new(access),
            operation: AuditRing::new(operation),
            api: AuditRing::new(api),
        }
    }

    pub fn ring(&self, log_type: LogType) -> &AuditRing {
        match log_type {
            LogType::Access => &self.access,
            LogType::Operation => &self.operation,
            LogType::Api => &self.api,
        }
    }

    pub fn append(&self, log_type: LogType, entry: AuditLogEntry) {
        match log_type {
            LogType::Operation => info!(
                ip = %entry.client_ip,
                category = %entry.category,
                details = %entry.details,
                "audit: {}",
                entry.message
            ),
            _ => debug!(
                log = log_type.as_str(),
                ip = %entry.client_ip,
                category = %entry.category,
                "audit: {}",
                entry.message
            ),
        }
        self.ring(log_type).append(entry);
    }

    /// Builds and appends an entry stamped with the current time.
    pub fn record(
        &self,
        log_type: LogType,
        client_ip: impl Into<String>,
        category: &str,
        message: impl Into<String>,
        details: Value,
    ) {
        self.append(
            log_type,
            AuditLogEntry::new(client_ip, category, message, details),
        );
    }

    pub fn query(&self, log_type: LogType, limit: usize) -> Vec<AuditLogEntry> {
        self.ring(log_type).query(limit)
    }
}

fn now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entry(n: usize) -> AuditLogEntry {
        AuditLogEntry::new("127.0.0.1", "test", format!("event {n}"), json!({ "n": n }))
    }

    #[test]
    fn cap_plus_one_evicts_only_the_oldest() {
        let ring = AuditRing::new(3);
        for n in 0..4 {
            ring.append(entry(n));
        }
        assert_eq!(ring.len(), 3);
        let messages: Vec<_> = ring.query(10).into_iter().map(|e| e.message).collect();
        assert_eq!(messages, vec!["event 3", "event 2", "event 1"]);
    }

    #[test]
    fn query_is_newest_first_and_limited() {
        let ring = AuditRing::new(10);
        for n in 0..5 {
            ring.append(entry(n));
        }
        let got = ring.query(2);
        assert_eq!(got.len(), 2);
        assert_eq!(got[0].details["n"], 4);
        assert_eq!(got[1].details["n"], 3);
    }

    #[test]
    fn rings_are_independent() {
        let logs = AuditLogs::with_caps(2, 2, 2);
        logs.record(LogType::Access, "1.2.3.4", "request", "GET /", json!({}));
        logs.record(LogType::Api, "1.2.3.4", "api_call", "GET / 200", json!({}));
        logs.record(LogType::Api, "1.2.3.4", "api_call", "GET /x 404", json!({}));
        assert_eq!(logs.ring(LogType::Access).len(), 1);
        assert!(logs.ring(LogType::Operation).is_empty());
        assert_eq!(logs.ring(LogType::Api).len(), 2);
    }

    #[test]
    fn default_caps() {
        let logs = AuditLogs::default();
        assert_eq!(logs.ring(LogType::Access).cap(), 500);
        assert_eq!(logs.ring(LogType::Operation).cap(), 500);
        assert_eq!(logs.ring(LogType::Api).cap(), 1000);
    }

    #[test]
    fn zero_cap_is_clamped() {
        let ring = AuditRing::new(0);
        ring.append(entry(0));
        ring.append(entry(1));
        assert_eq!(ring.len(), 1);
        assert_eq!(ring.query(5)[0].message, "event 1");
    }
}
