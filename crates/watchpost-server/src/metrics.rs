use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::Result;
use serde::Serialize;
use tracing::debug;

pub const DEFAULT_HISTORY_CAP: usize = 360;

/// One reading of host and process figures. Fields the platform cannot
/// provide are `None`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub timestamp: i64,
    pub cpu_percent: Option<f64>,
    pub load_average: Option<f64>,
    pub memory_percent: Option<f64>,
    pub memory_total_mb: Option<f64>,
    pub process_memory_mb: Option<f64>,
    pub network_rx_bytes: Option<u64>,
    pub network_tx_bytes: Option<u64>,
    pub process_count: Option<usize>,
}

/// Source of current and recent system metrics.
pub trait MetricsCollector: Send + Sync {
    fn current(&self) -> Result<MetricsSnapshot>;
    /// Most recent samples, newest first.
    fn history(&self, limit: usize) -> Result<Vec<MetricsSnapshot>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct CpuTimes {
    total: u64,
    idle: u64,
}

/// Reads `/proc` on demand and keeps a bounded ring of periodic samples.
/// On platforms without `/proc` every figure is `None`.
pub struct SampledMetrics {
    cap: usize,
    history: Mutex<VecDeque<MetricsSnapshot>>,
    last_cpu: Mutex<Option<CpuTimes>>,
}

impl Default for SampledMetrics {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_CAP)
    }
}

impl SampledMetrics {
    pub fn new(cap: usize) -> Self {
        Self {
            cap: cap.max(1),
            history: Mutex::new(VecDeque::new()),
            last_cpu: Mutex::new(None),
        }
    }

    /// Takes a fresh reading without recording it.
    pub fn read(&self) -> MetricsSnapshot {
        let cpu_percent = read("/proc/stat")
            .and_then(|s| parse_cpu_times(&s))
            .and_then(|now| {
                let mut last = self.last_cpu.lock().unwrap_or_else(PoisonError::into_inner);
                let base = last.replace(now).unwrap_or(CpuTimes { total: 0, idle: 0 });
                cpu_percent_between(base, now)
            });
        let memory = read("/proc/meminfo").and_then(|s| parse_meminfo(&s));
        let (rx, tx) = read("/proc/net/dev")
            .and_then(|s| parse_net_dev(&s))
            .map_or((None, None), |(rx, tx)| (Some(rx), Some(tx)));

        MetricsSnapshot {
            timestamp: now(),
            cpu_percent,
            load_average: read("/proc/loadavg").and_then(|s| parse_loadavg(&s)),
            memory_percent: memory.map(|(total, avail)| {
                round1(100.0 * (total.saturating_sub(avail)) as f64 / total as f64)
            }),
            memory_total_mb: memory.map(|(total, _)| round1(total as f64 / 1024.0)),
            process_memory_mb: read("/proc/self/status")
                .and_then(|s| parse_vm_rss_kb(&s))
                .map(|kb| round1(kb as f64 / 1024.0)),
            network_rx_bytes: rx,
            network_tx_bytes: tx,
            process_count: count_processes(),
        }
    }

    /// Takes a reading and appends it to the history ring.
    pub fn record(&self) -> MetricsSnapshot {
        let snapshot = self.read();
        self.push(snapshot.clone());
        snapshot
    }

    pub fn push(&self, snapshot: MetricsSnapshot) {
        let mut history = self.history.lock().unwrap_or_else(PoisonError::into_inner);
        history.push_back(snapshot);
        while history.len() > self.cap {
            history.pop_front();
        }
    }

    /// Records a sample every `interval` until the runtime shuts down.
    pub fn spawn_sampler(self: Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let sampler = self.clone();
                match tokio::task::spawn_blocking(move || sampler.record()).await {
                    Ok(s) => debug!(cpu = ?s.cpu_percent, mem = ?s.memory_percent, "metrics sample"),
                    Err(e) => debug!(error = %e, "metrics sample task failed"),
                }
            }
        })
    }
}

impl MetricsCollector for SampledMetrics {
    fn current(&self) -> Result<MetricsSnapshot> {
        Ok(self.read())
    }

    fn history(&self, limit: usize) -> Result<Vec<MetricsSnapshot>> {
        let history = self.history.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(history.iter().rev().take(limit).cloned().collect())
    }
}

// ── /proc parsing ─────────────────────────────────────────────────────────────

fn read(path: &str) -> Option<String> {
    std::fs::read_to_string(path).ok()
}

fn parse_cpu_times(stat: &str) -> Option<CpuTimes> {
    let line = stat.lines().find(|l| l.starts_with("cpu "))?;
    let fields: Vec<u64> = line
        .split_whitespace()
        .skip(1)
        .filter_map(|f| f.parse().ok())
        .collect();
    if fields.len() < 4 {
        return None;
    }
    // idle + iowait
    let idle = fields[3] + fields.get(4).copied().unwrap_or(0);
    Some(CpuTimes {
        total: fields.iter().sum(),
        idle,
    })
}

fn cpu_percent_between(before: CpuTimes, after: CpuTimes) -> Option<f64> {
    let total = after.total.checked_sub(before.total)?;
    let idle = after.idle.checked_sub(before.idle)?;
    if total == 0 {
        return None;
    }
    Some(round1(100.0 * (total - idle.min(total)) as f64 / total as f64))
}

/// `(MemTotal, MemAvailable)` in kB.
fn parse_meminfo(meminfo: &str) -> Option<(u64, u64)> {
    let field = |name: &str| {
        meminfo
            .lines()
            .find(|l| l.starts_with(name))
            .and_then(|l| l.split_whitespace().nth(1))
            .and_then(|v| v.parse::<u64>().ok())
    };
    let total = field("MemTotal:")?;
    let avail = field("MemAvailable:")?;
    (total > 0).then_some((total, avail))
}

fn parse_vm_rss_kb(status: &str) -> Option<u64> {
    status
        .lines()
        .find(|l| l.starts_with("VmRSS:"))
        .and_then(|l| l.split_whitespace().nth(1))
        .and_then(|v| v.parse().ok())
}

/// Sums receive/transmit bytes over every interface except loopback.
fn parse_net_dev(dev: &str) -> Option<(u64, u64)> {
    let mut seen = false;
    let (mut rx, mut tx) = (0u64, 0u64);
    for line in dev.lines().skip(2) {
        let Some((iface, rest)) = line.split_once(':') else {
            continue;
        };
        if iface.trim() == "lo" {
            continue;
        }
        let cols: Vec<u64> = rest
            .split_whitespace()
            .filter_map(|c| c.parse().ok())
            .collect();
        if cols.len() >= 9 {
            rx += cols[0];
            tx += cols[8];
            seen = true;
        }
    }
    seen.then_some((rx, tx))
}

fn parse_loadavg(loadavg: &str) -> Option<f64> {
    loadavg.split_whitespace().next()?.parse().ok()
}

fn count_processes() -> Option<usize> {
    let dir = std::fs::read_dir("/proc").ok()?;
    Some(
        dir.filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().bytes().all(|b| b.is_ascii_digit()))
            .count(),
    )
}

fn round1(v: f64) -> f64 {
    (v * 10.0).round() / 10.0
}

fn now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}
