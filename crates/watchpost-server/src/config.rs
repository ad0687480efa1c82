use std::net::IpAddr;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use anyhow::{Context, Result};
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::settings::SettingsStore;

/// Name of the settings section holding the security policy.
pub const SECURITY_SECTION: &str = "web_api_security";

pub const DEFAULT_RATE_LIMIT_PER_HOUR: u32 = 100;
pub const DEFAULT_SESSION_TIMEOUT_MINUTES: u64 = 30;
pub const DEFAULT_MAX_LOGIN_ATTEMPTS: u32 = 5;
pub const DEFAULT_BAN_DURATION_MINUTES: u64 = 15;
pub const DEFAULT_MAX_CONCURRENT_SESSIONS: usize = 100;
/// Upper bound for `session_timeout` and `ban_duration`: one year.
pub const MAX_DURATION_MINUTES: u64 = 365 * 24 * 60;

// ── Persisted shape ───────────────────────────────────────────────────────────

/// `rate_limit` is either an on/off switch or a per-hour request budget.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(untagged)]
enum RateLimitSetting {
    Enabled(bool),
    PerHour(u32),
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct WebApiSecurity {
    enable_api_key: Option<bool>,
    api_key: Option<String>,
    localhost_only: Option<bool>,
    enable_ip_whitelist: Option<bool>,
    ip_whitelist: Vec<String>,
    rate_limit: Option<RateLimitSetting>,
    session_timeout: Option<u64>,
    max_concurrent_sessions: Option<usize>,
    enable_login_limit: Option<bool>,
    max_login_attempts: Option<u32>,
    ban_duration: Option<u64>,
    api_key_expiry_days: Option<u32>,
    force_https: Option<bool>,
    enable_cors: Option<bool>,
    cors_origins: Vec<String>,
    enable_api_audit: Option<bool>,
}

// ── Active policy ─────────────────────────────────────────────────────────────

/// Immutable snapshot of the security policy. Replaced wholesale on reload.
#[derive(Debug, Clone, Serialize)]
pub struct SecurityConfig {
    pub api_key_enabled: bool,
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    pub localhost_only: bool,
    pub ip_whitelist_enabled: bool,
    pub ip_whitelist: Vec<String>,
    pub rate_limit_enabled: bool,
    pub rate_limit_per_hour: u32,
    pub session_timeout_minutes: u64,
    pub max_concurrent_sessions: usize,
    pub login_limit_enabled: bool,
    pub max_login_attempts: u32,
    pub ban_duration_minutes: u64,
    pub api_key_expiry_days: Option<u32>,
    pub force_https: bool,
    pub cors_enabled: bool,
    pub cors_origins: Vec<String>,
    pub audit_enabled: bool,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            api_key_enabled: false,
            api_key: None,
            localhost_only: false,
            ip_whitelist_enabled: false,
            ip_whitelist: Vec::new(),
            rate_limit_enabled: true,
            rate_limit_per_hour: DEFAULT_RATE_LIMIT_PER_HOUR,
            session_timeout_minutes: DEFAULT_SESSION_TIMEOUT_MINUTES,
            max_concurrent_sessions: DEFAULT_MAX_CONCURRENT_SESSIONS,
            login_limit_enabled: true,
            max_login_attempts: DEFAULT_MAX_LOGIN_ATTEMPTS,
            ban_duration_minutes: DEFAULT_BAN_DURATION_MINUTES,
            api_key_expiry_days: None,
            force_https: false,
            cors_enabled: false,
            cors_origins: Vec::new(),
            audit_enabled: true,
        }
    }
}

impl SecurityConfig {
    fn from_section(raw: WebApiSecurity) -> Self {
        let d = Self::default();
        let (rate_limit_enabled, rate_limit_per_hour) = match raw.rate_limit {
            None => (d.rate_limit_enabled, d.rate_limit_per_hour),
            Some(RateLimitSetting::Enabled(on)) => (on, DEFAULT_RATE_LIMIT_PER_HOUR),
            Some(RateLimitSetting::PerHour(0)) => (false, DEFAULT_RATE_LIMIT_PER_HOUR),
            Some(RateLimitSetting::PerHour(n)) => (true, n),
        };
        let api_key = raw.api_key.filter(|k| !k.trim().is_empty());

        Self {
            api_key_enabled: raw.enable_api_key.unwrap_or(d.api_key_enabled),
            api_key,
            localhost_only: raw.localhost_only.unwrap_or(d.localhost_only),
            ip_whitelist_enabled: raw.enable_ip_whitelist.unwrap_or(d.ip_whitelist_enabled),
            ip_whitelist: raw.ip_whitelist,
            rate_limit_enabled,
            rate_limit_per_hour,
            session_timeout_minutes: raw
                .session_timeout
                .filter(|m| *m > 0)
                .map_or(d.session_timeout_minutes, |m| m.min(MAX_DURATION_MINUTES)),
            max_concurrent_sessions: raw
                .max_concurrent_sessions
                .filter(|n| *n > 0)
                .unwrap_or(d.max_concurrent_sessions),
            login_limit_enabled: raw.enable_login_limit.unwrap_or(d.login_limit_enabled),
            max_login_attempts: raw
                .max_login_attempts
                .filter(|n| *n > 0)
                .unwrap_or(d.max_login_attempts),
            ban_duration_minutes: raw
                .ban_duration
                .filter(|m| *m > 0)
                .map_or(d.ban_duration_minutes, |m| m.min(MAX_DURATION_MINUTES)),
            api_key_expiry_days: raw.api_key_expiry_days,
            force_https: raw.force_https.unwrap_or(d.force_https),
            cors_enabled: raw.enable_cors.unwrap_or(d.cors_enabled),
            cors_origins: raw.cors_origins,
            audit_enabled: raw.enable_api_audit.unwrap_or(d.audit_enabled),
        }
    }

    /// The key callers must present, if key authentication is in force.
    /// An enabled-but-empty key counts as disabled.
    pub fn required_key(&self) -> Option<&str> {
        if self.api_key_enabled {
            self.api_key.as_deref()
        } else {
            None
        }
    }

    pub fn session_timeout(&self) -> Duration {
        Duration::from_secs(self.session_timeout_minutes.saturating_mul(60))
    }

    /// Rolling window for failed attempts. Also the effective ban length.
    pub fn ban_window(&self) -> Duration {
        Duration::from_secs(self.ban_duration_minutes.saturating_mul(60))
    }

    /// Per-hour request budget, or `None` when rate limiting is off.
    pub fn rate_limit(&self) -> Option<u32> {
        self.rate_limit_enabled.then_some(self.rate_limit_per_hour)
    }

    /// Whitelist check. Entries are literal addresses or CIDR blocks; entries
    /// that parse as neither are ignored. An empty list admits everyone.
    pub fn allows_ip(&self, ip: IpAddr) -> bool {
        if !self.ip_whitelist_enabled || self.ip_whitelist.is_empty() {
            return true;
        }
        let ip = ip.to_canonical();
        self.ip_whitelist.iter().any(|entry| {
            let entry = entry.trim();
            if entry.contains('/') {
                entry
                    .parse::<IpNet>()
                    .map(|net| net.contains(&ip))
                    .unwrap_or(false)
            } else {
                entry
                    .parse::<IpAddr>()
                    .map(|allowed| allowed.to_canonical() == ip)
                    .unwrap_or(false)
            }
        })
    }

    /// Loopback restriction from `localhost_only`.
    pub fn allows_remote(&self, ip: IpAddr) -> bool {
        !self.localhost_only || ip.to_canonical().is_loopback()
    }

    /// CORS origin check. Disabled CORS honours no origin; enabled CORS with
    /// an empty list honours every origin.
    pub fn allows_origin(&self, origin: &str) -> bool {
        self.cors_enabled
            && (self.cors_origins.is_empty() || self.cors_origins.iter().any(|o| o == origin))
    }
}

/// Reads the security section from the settings store.
pub fn load(settings: &dyn SettingsStore) -> Result<SecurityConfig> {
    match settings.section(SECURITY_SECTION)? {
        Some(value) => decode_section(value),
        None => Ok(SecurityConfig::from_section(WebApiSecurity::default())),
    }
}

/// Decodes a `web_api_security` value. Used to vet a section before it is
/// written to the settings store.
pub fn decode_section(value: serde_json::Value) -> Result<SecurityConfig> {
    let raw =
        serde_json::from_value::<WebApiSecurity>(value).context("decode web_api_security")?;
    let cfg = SecurityConfig::from_section(raw);
    if cfg.api_key_enabled && cfg.api_key.is_none() {
        warn!("api key authentication enabled but no key configured; treating as disabled");
    }
    Ok(cfg)
}

// ── Store ─────────────────────────────────────────────────────────────────────

/// Holds the active policy and swaps it atomically on reload. Readers take an
/// `Arc` snapshot and keep it for the rest of their request.
pub struct ConfigStore {
    settings: Arc<dyn SettingsStore>,
    current: RwLock<Arc<SecurityConfig>>,
}

impl ConfigStore {
    /// Loads the initial policy, falling back to defaults if the read fails.
    pub fn new(settings: Arc<dyn SettingsStore>) -> Self {
        let cfg = load_or_default(settings.as_ref());
        Self {
            settings,
            current: RwLock::new(Arc::new(cfg)),
        }
    }

    pub fn current(&self) -> Arc<SecurityConfig> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Re-reads the settings store and swaps in the new snapshot. A section
    /// that no longer decodes leaves the active snapshot in place.
    pub fn reload(&self) -> Result<Arc<SecurityConfig>> {
        let next = match load(self.settings.as_ref()) {
            Ok(cfg) => Arc::new(cfg),
            Err(e) => {
                warn!(error = %format!("{e:#}"), "security policy reload failed, keeping current policy");
                return Err(e);
            }
        };
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = next.clone();
        info!(
            api_key = next.required_key().is_some(),
            whitelist = next.ip_whitelist_enabled,
            rate_limit = ?next.rate_limit(),
            cors = next.cors_enabled,
            "security policy reloaded"
        );
        Ok(next)
    }

    pub fn settings(&self) -> &Arc<dyn SettingsStore> {
        &self.settings
    }
}

fn load_or_default(settings: &dyn SettingsStore) -> SecurityConfig {
    match load(settings) {
        Ok(cfg) => cfg,
        Err(e) => {
            warn!(error = %format!("{e:#}"), "failed to load security policy, using defaults");
            SecurityConfig::default()
        }
    }
}
