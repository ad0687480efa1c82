use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::warn;

use crate::config::SecurityConfig;
use crate::error::ApiError;

/// Rolling window for per-client request counting.
pub const RATE_WINDOW: Duration = Duration::from_secs(3600);

/// An IP whose recent failures meet the ban threshold.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BannedIp {
    pub ip: IpAddr,
    pub failed_attempts: usize,
    pub remaining_seconds: u64,
}

/// Per-client counters exposed through `/api/auth/info`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClientStats {
    pub failed_attempts: usize,
    pub banned: bool,
    pub requests_in_window: usize,
    pub rate_limit_remaining: Option<u32>,
}

type Windows = HashMap<IpAddr, VecDeque<Instant>>;

/// Failed-attempt tracking and request throttling. Both maps hold only
/// append-ordered instants, so pruning pops from the front.
///
/// The banned set is never stored: it is recomputed from the failure
/// windows each time, at O(recorded failures) per `list_banned`.
#[derive(Default)]
pub struct Limiter {
    failures: Mutex<Windows>,
    requests: Mutex<Windows>,
}

fn prune(window: &mut VecDeque<Instant>, span: Duration, now: Instant) {
    while let Some(front) = window.front() {
        if now.saturating_duration_since(*front) >= span {
            window.pop_front();
        } else {
            break;
        }
    }
}

impl Limiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs the network gates in order: localhost restriction, whitelist,
    /// ban, rate. A ban denial does not consume a rate slot.
    pub fn admit(&self, cfg: &SecurityConfig, ip: IpAddr) -> Result<(), ApiError> {
        self.admit_at(cfg, ip, Instant::now())
    }

    pub fn admit_at(&self, cfg: &SecurityConfig, ip: IpAddr, now: Instant) -> Result<(), ApiError> {
        if !cfg.allows_remote(ip) {
            return Err(ApiError::PolicyDenied(
                "Access restricted to localhost".into(),
            ));
        }
        if !cfg.allows_ip(ip) {
            return Err(ApiError::PolicyDenied("IP address not in whitelist".into()));
        }
        if self.is_banned_at(cfg, ip, now) {
            return Err(ApiError::Banned);
        }
        if let Some(limit) = cfg.rate_limit() {
            let mut requests = self.requests.lock().unwrap_or_else(PoisonError::into_inner);
            if !requests.contains_key(&ip) {
                // A new client: drop windows of clients that went quiet.
                requests.retain(|_, window| {
                    prune(window, RATE_WINDOW, now);
                    !window.is_empty()
                });
            }
            let window = requests.entry(ip).or_default();
            prune(window, RATE_WINDOW, now);
            if window.len() >= limit as usize {
                warn!(%ip, limit, "rate limit exceeded");
                return Err(ApiError::RateExceeded);
            }
            window.push_back(now);
        }
        Ok(())
    }

    pub fn is_banned_at(&self, cfg: &SecurityConfig, ip: IpAddr, now: Instant) -> bool {
        if !cfg.login_limit_enabled {
            return false;
        }
        let mut failures = self.failures.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(window) = failures.get_mut(&ip) else {
            return false;
        };
        prune(window, cfg.ban_window(), now);
        if window.is_empty() {
            failures.remove(&ip);
            return false;
        }
        window.len() >= cfg.max_login_attempts as usize
    }

    /// Records one authentication failure. No-op with login limiting off.
    pub fn record_failure(&self, cfg: &SecurityConfig, ip: IpAddr) {
        self.record_failure_at(cfg, ip, Instant::now());
    }

    pub fn record_failure_at(&self, cfg: &SecurityConfig, ip: IpAddr, now: Instant) {
        if !cfg.login_limit_enabled {
            return;
        }
        let mut failures = self.failures.lock().unwrap_or_else(PoisonError::into_inner);
        let window = failures.entry(ip).or_default();
        prune(window, cfg.ban_window(), now);
        window.push_back(now);
        if window.len() == cfg.max_login_attempts as usize {
            warn!(%ip, attempts = window.len(), "ip temporarily banned");
        }
    }

    /// Clears failure history for one IP, or for all of them. Returns the
    /// number of IPs whose history was dropped.
    pub fn clear_failures(&self, ip: Option<IpAddr>) -> usize {
        let mut failures = self.failures.lock().unwrap_or_else(PoisonError::into_inner);
        match ip {
            Some(ip) => usize::from(failures.remove(&ip).is_some()),
            None => {
                let n = failures.len();
                failures.clear();
                n
            }
        }
    }

    pub fn list_banned(&self, cfg: &SecurityConfig) -> Vec<BannedIp> {
        self.list_banned_at(cfg, Instant::now())
    }

    pub fn list_banned_at(&self, cfg: &SecurityConfig, now: Instant) -> Vec<BannedIp> {
        if !cfg.login_limit_enabled {
            return Vec::new();
        }
        let span = cfg.ban_window();
        let threshold = cfg.max_login_attempts as usize;
        let mut failures = self.failures.lock().unwrap_or_else(PoisonError::into_inner);
        failures.retain(|_, window| {
            prune(window, span, now);
            !window.is_empty()
        });

        let mut banned: Vec<BannedIp> = failures
            .iter()
            .filter(|(_, window)| window.len() >= threshold)
            .map(|(ip, window)| {
                // The ban lifts once the count drops below the threshold,
                // i.e. when this failure leaves the window.
                let pivot = window[window.len() - threshold];
                let remaining = match pivot.checked_add(span) {
                    Some(lifts_at) => lifts_at.saturating_duration_since(now),
                    None => span,
                };
                BannedIp {
                    ip: *ip,
                    failed_attempts: window.len(),
                    remaining_seconds: remaining.as_secs() + u64::from(remaining.subsec_nanos() > 0),
                }
            })
            .collect();
        banned.sort_by(|a, b| a.ip.cmp(&b.ip));
        banned
    }

    /// Recent failures per IP inside the ban window, highest first.
    pub fn failure_counts(&self, cfg: &SecurityConfig) -> Vec<(IpAddr, usize)> {
        self.failure_counts_at(cfg, Instant::now())
    }

    pub fn failure_counts_at(&self, cfg: &SecurityConfig, now: Instant) -> Vec<(IpAddr, usize)> {
        let span = cfg.ban_window();
        let mut failures = self.failures.lock().unwrap_or_else(PoisonError::into_inner);
        failures.retain(|_, window| {
            prune(window, span, now);
            !window.is_empty()
        });
        let mut counts: Vec<(IpAddr, usize)> =
            failures.iter().map(|(ip, w)| (*ip, w.len())).collect();
        counts.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        counts
    }

    /// Clients with requests inside the current rate window.
    pub fn tracked_clients(&self) -> usize {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn client_stats(&self, cfg: &SecurityConfig, ip: IpAddr) -> ClientStats {
        self.client_stats_at(cfg, ip, Instant::now())
    }

    pub fn client_stats_at(&self, cfg: &SecurityConfig, ip: IpAddr, now: Instant) -> ClientStats {
        let banned = self.is_banned_at(cfg, ip, now);
        let failed_attempts = self
            .failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&ip)
            .map_or(0, VecDeque::len);

        let mut requests = self.requests.lock().unwrap_or_else(PoisonError::into_inner);
        let requests_in_window = requests.get_mut(&ip).map_or(0, |window| {
            prune(window, RATE_WINDOW, now);
            window.len()
        });
        if requests_in_window == 0 {
            requests.remove(&ip);
        }
        let rate_limit_remaining = cfg
            .rate_limit()
            .map(|limit| (limit as usize).saturating_sub(requests_in_window) as u32);

        ClientStats {
            failed_attempts,
            banned,
            requests_in_window,
            rate_limit_remaining,
        }
    }
}
