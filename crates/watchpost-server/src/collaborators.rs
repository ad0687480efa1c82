//! Interfaces to the parts of the application the control plane reads from
//! or drives, plus in-process implementations used by the daemon and tests.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Result;
use serde::Serialize;

use crate::metrics::{MetricsCollector, SampledMetrics};

/// Keyword list the monitor watches for.
pub trait KeywordStore: Send + Sync {
    fn list(&self) -> Result<Vec<String>>;
    /// Returns `false` if the keyword was already present.
    fn add(&self, keyword: &str) -> Result<bool>;
    /// Returns `false` if the keyword was not present.
    fn delete(&self, keyword: &str) -> Result<bool>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MonitorStatus {
    pub active: bool,
    /// Unix seconds of the last start or stop, if any.
    pub changed_at: Option<i64>,
}

/// Start/stop switch for the monitoring loop.
pub trait MonitorControl: Send + Sync {
    fn start(&self) -> Result<()>;
    fn stop(&self) -> Result<()>;
    fn status(&self) -> MonitorStatus;
}

/// The collaborators a server instance talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub metrics: Arc<dyn MetricsCollector>,
    pub keywords: Arc<dyn KeywordStore>,
    pub monitor: Arc<dyn MonitorControl>,
}

impl Default for Collaborators {
    fn default() -> Self {
        Self {
            metrics: Arc::new(SampledMetrics::default()),
            keywords: Arc::new(InMemoryKeywords::default()),
            monitor: Arc::new(MonitorSwitch::default()),
        }
    }
}

// ── Keywords ──────────────────────────────────────────────────────────────────

/// Insertion-ordered, case-sensitive keyword list.
#[derive(Default)]
pub struct InMemoryKeywords {
    keywords: Mutex<Vec<String>>,
}

impl InMemoryKeywords {
    pub fn with_keywords<I, S>(keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut list: Vec<String> = Vec::new();
        for k in keywords {
            let k = k.into();
            let k = k.trim();
            if !k.is_empty() && !list.iter().any(|existing| existing == k) {
                list.push(k.to_owned());
            }
        }
        Self {
            keywords: Mutex::new(list),
        }
    }
}

impl KeywordStore for InMemoryKeywords {
    fn list(&self) -> Result<Vec<String>> {
        Ok(self
            .keywords
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone())
    }

    fn add(&self, keyword: &str) -> Result<bool> {
        let mut keywords = self.keywords.lock().unwrap_or_else(PoisonError::into_inner);
        if keywords.iter().any(|k| k == keyword) {
            return Ok(false);
        }
        keywords.push(keyword.to_owned());
        Ok(true)
    }

    fn delete(&self, keyword: &str) -> Result<bool> {
        let mut keywords = self.keywords.lock().unwrap_or_else(PoisonError::into_inner);
        let before = keywords.len();
        keywords.retain(|k| k != keyword);
        Ok(keywords.len() != before)
    }
}

// ── Monitor ───────────────────────────────────────────────────────────────────

pub struct MonitorSwitch {
    active: AtomicBool,
    changed_at: AtomicI64,
}

impl Default for MonitorSwitch {
    fn default() -> Self {
        Self {
            active: AtomicBool::new(false),
            changed_at: AtomicI64::new(0),
        }
    }
}

impl MonitorSwitch {
    fn set(&self, active: bool) {
        self.active.store(active, Ordering::SeqCst);
        self.changed_at.store(now(), Ordering::SeqCst);
    }
}

impl MonitorControl for MonitorSwitch {
    fn start(&self) -> Result<()> {
        self.set(true);
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        self.set(false);
        Ok(())
    }

    fn status(&self) -> MonitorStatus {
        let changed = self.changed_at.load(Ordering::SeqCst);
        MonitorStatus {
            active: self.active.load(Ordering::SeqCst),
            changed_at: (changed > 0).then_some(changed),
        }
    }
}

fn now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}
