use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use axum::http::{header::AUTHORIZATION, HeaderMap, Method};
use constant_time_eq::constant_time_eq;
use serde_json::json;

use crate::audit::{AuditLogs, LogType};
use crate::config::{SecurityConfig, MAX_DURATION_MINUTES};
use crate::error::ApiError;
use crate::routes::{self, Access};

pub const SESSION_HEADER: &str = "X-Session-Token";

// ── Sessions ──────────────────────────────────────────────────────────────────

/// Short-lived credential bound to the IP that requested it.
#[derive(Debug, Clone)]
pub struct SessionToken {
    pub token: String,
    pub owning_ip: IpAddr,
    pub created_at: Instant,
    pub expires_at: Instant,
    pub request_count: u64,
}

impl SessionToken {
    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionCheck {
    Valid,
    Expired,
    WrongIp,
    Unknown,
}

#[derive(Default)]
pub struct SessionStore {
    sessions: Mutex<HashMap<String, SessionToken>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Issues a token for `ip`. When `max_sessions` live tokens already
    /// exist, expired ones are dropped and then the oldest is evicted,
    /// preferring a token owned by `ip` itself. The issuing route is public,
    /// so this keeps one caller from cycling out everyone else's sessions;
    /// a caller spread across many addresses can still do it.
    pub fn issue_at(
        &self,
        ip: IpAddr,
        timeout: Duration,
        max_sessions: usize,
        now: Instant,
    ) -> SessionToken {
        let session = SessionToken {
            token: generate_token(),
            owning_ip: ip,
            created_at: now,
            expires_at: expiry(now, timeout),
            request_count: 0,
        };

        let mut sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
        if sessions.len() >= max_sessions {
            sessions.retain(|_, s| !s.is_expired(now));
        }
        while sessions.len() >= max_sessions.max(1) {
            let own_oldest = sessions
                .iter()
                .filter(|(_, s)| s.owning_ip == ip)
                .min_by_key(|(_, s)| s.created_at)
                .map(|(k, _)| k.clone());
            let oldest = own_oldest.or_else(|| {
                sessions
                    .iter()
                    .min_by_key(|(_, s)| s.created_at)
                    .map(|(k, _)| k.clone())
            });
            match oldest {
                Some(k) => {
                    sessions.remove(&k);
                }
                None => break,
            }
        }
        sessions.insert(session.token.clone(), session.clone());
        session
    }

    /// Checks a presented token. Expired tokens are evicted here; a token
    /// presented from another IP is refused but left in place.
    pub fn validate_at(&self, token: &str, ip: IpAddr, now: Instant) -> SessionCheck {
        let mut sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(session) = sessions.get_mut(token) else {
            return SessionCheck::Unknown;
        };
        if session.is_expired(now) {
            sessions.remove(token);
            return SessionCheck::Expired;
        }
        if session.owning_ip != ip {
            return SessionCheck::WrongIp;
        }
        session.request_count += 1;
        SessionCheck::Valid
    }

    pub fn revoke(&self, token: &str) -> bool {
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(token)
            .is_some()
    }

    pub fn active_count_at(&self, now: Instant) -> usize {
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|s| !s.is_expired(now))
            .count()
    }
}

/// `now + timeout`, capped at the longest configurable timeout.
fn expiry(now: Instant, timeout: Duration) -> Instant {
    let cap = Duration::from_secs(MAX_DURATION_MINUTES * 60);
    now.checked_add(timeout.min(cap))
        .or_else(|| now.checked_add(cap))
        .unwrap_or(now)
}

/// 32 random bytes, hex-encoded (URL-safe, 64 chars).
pub fn generate_token() -> String {
    use rand::RngCore;
    let mut bytes = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Masks a credential for logging: `abcd****wxyz`, or `****` when short.
pub fn mask(credential: &str) -> String {
    let chars: Vec<char> = credential.chars().collect();
    if chars.len() > 8 {
        let head: String = chars[..4].iter().collect();
        let tail: String = chars[chars.len() - 4..].iter().collect();
        format!("{head}****{tail}")
    } else {
        "****".to_owned()
    }
}

// ── Authentication ────────────────────────────────────────────────────────────

#[derive(Debug)]
pub enum AuthOutcome {
    Public,
    Disabled,
    ApiKey,
    Session,
    Denied(ApiError),
}

impl AuthOutcome {
    pub fn is_allowed(&self) -> bool {
        !matches!(self, AuthOutcome::Denied(_))
    }

    fn label(&self) -> &'static str {
        match self {
            AuthOutcome::Public => "public access",
            AuthOutcome::Disabled => "auth disabled",
            AuthOutcome::ApiKey => "api key valid",
            AuthOutcome::Session => "session token valid",
            AuthOutcome::Denied(_) => "authentication failed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyCheck {
    Valid,
    Invalid,
    NotConfigured,
}

/// Paths that never need credentials: anything outside `/api/`, static
/// assets, and routes the table marks public.
pub fn is_public(method: &Method, path: &str) -> bool {
    if !path.starts_with("/api/") {
        return true;
    }
    matches!(routes::lookup(method, path), Some(r) if r.access == Access::Public)
}

pub struct Authenticator {
    sessions: SessionStore,
}

impl Default for Authenticator {
    fn default() -> Self {
        Self::new()
    }
}

impl Authenticator {
    pub fn new() -> Self {
        Self {
            sessions: SessionStore::new(),
        }
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    pub fn issue_session(&self, cfg: &SecurityConfig, ip: IpAddr) -> SessionToken {
        self.sessions.issue_at(
            ip,
            cfg.session_timeout(),
            cfg.max_concurrent_sessions,
            Instant::now(),
        )
    }

    /// Decides whether a request may proceed. The outcome is appended to the
    /// operation log before returning.
    pub fn authenticate(
        &self,
        cfg: &SecurityConfig,
        audit: &AuditLogs,
        method: &Method,
        path: &str,
        headers: &HeaderMap,
        ip: IpAddr,
    ) -> AuthOutcome {
        self.authenticate_at(cfg, audit, method, path, headers, ip, Instant::now())
    }

    #[allow(clippy::too_many_arguments)]
    pub fn authenticate_at(
        &self,
        cfg: &SecurityConfig,
        audit: &AuditLogs,
        method: &Method,
        path: &str,
        headers: &HeaderMap,
        ip: IpAddr,
        now: Instant,
    ) -> AuthOutcome {
        let bearer = headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .map(str::trim)
            .filter(|v| !v.is_empty());
        let session = headers
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty());

        let mut credential = None;
        let outcome = if is_public(method, path) {
            AuthOutcome::Public
        } else if let Some(expected) = cfg.required_key() {
            let mut outcome = None;
            if let Some(key) = bearer {
                credential = Some(("api_key", mask(key)));
                if constant_time_eq(key.as_bytes(), expected.as_bytes()) {
                    outcome = Some(AuthOutcome::ApiKey);
                }
            }
            if outcome.is_none() {
                if let Some(token) = session {
                    credential = Some(("session", mask(token)));
                    if self.sessions.validate_at(token, ip, now) == SessionCheck::Valid {
                        outcome = Some(AuthOutcome::Session);
                    }
                }
            }
            outcome.unwrap_or_else(|| {
                if credential.is_some() {
                    AuthOutcome::Denied(ApiError::AuthInvalid)
                } else {
                    AuthOutcome::Denied(ApiError::AuthRequired)
                }
            })
        } else {
            AuthOutcome::Disabled
        };

        let (kind, masked) = credential.unwrap_or(("none", "****".to_owned()));
        audit.record(
            LogType::Operation,
            ip.to_string(),
            "auth",
            outcome.label(),
            json!({
                "method": method.as_str(),
                "path": path,
                "credential_type": kind,
                "credential": masked,
                "success": outcome.is_allowed(),
            }),
        );
        outcome
    }

    /// Compares a candidate key with the configured one without issuing a
    /// session. The result is audited as a key validation.
    pub fn verify_key(
        &self,
        cfg: &SecurityConfig,
        audit: &AuditLogs,
        candidate: &str,
        ip: IpAddr,
    ) -> KeyCheck {
        let check = match cfg.required_key() {
            None => KeyCheck::NotConfigured,
            Some(expected) if constant_time_eq(candidate.as_bytes(), expected.as_bytes()) => {
                KeyCheck::Valid
            }
            Some(_) => KeyCheck::Invalid,
        };
        audit.record(
            LogType::Operation,
            ip.to_string(),
            "key_validation",
            match check {
                KeyCheck::Valid => "api key verified",
                KeyCheck::Invalid => "api key rejected",
                KeyCheck::NotConfigured => "api key verification without configured key",
            },
            json!({
                "credential": mask(candidate),
                "success": check == KeyCheck::Valid,
            }),
        );
        check
    }
}
