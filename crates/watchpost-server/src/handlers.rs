use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::Ordering;
use std::time::Instant;

use anyhow::anyhow;
use axum::{
    body::Bytes,
    http::{Method, Uri},
    response::{Html, IntoResponse, Response},
};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::{info, warn};

use crate::{
    audit::LogType,
    auth::{mask, KeyCheck},
    cache::CacheKey,
    config::{self, SECURITY_SECTION},
    dispatch::ClientContext,
    error::{ApiError, Envelope},
    routes::Endpoint,
    AppState,
};

const INDEX_HTML: &str = include_str!("../assets/index.html");

pub const DEFAULT_LOG_LIMIT: usize = 100;

type HandlerResult = Result<Response, ApiError>;

/// Runs the handler for an endpoint that already passed the gates. Handler
/// failures are audited before being turned into a 500.
pub async fn dispatch(
    endpoint: Endpoint,
    state: AppState,
    ctx: ClientContext,
    query: HashMap<String, String>,
    body: Bytes,
) -> Response {
    let result = match endpoint {
        Endpoint::Index => Ok(Html(INDEX_HTML).into_response()),
        Endpoint::AuthToken => auth_token(&state, &ctx),
        Endpoint::AuthInfo => auth_info(&state, &ctx),
        Endpoint::AuthRevoke => auth_revoke(&state, &ctx),
        Endpoint::Status => status(&state).await,
        Endpoint::Keywords => keywords(&state).await,
        Endpoint::Logs => access_logs(&state, &query),
        Endpoint::LogsDetailed => operation_logs(&state, &query),
        Endpoint::SecurityLogs => security_logs(&state, &query),
        Endpoint::Settings => settings(&state).await,
        Endpoint::Performance => performance(&state).await,
        Endpoint::History => history(&state, &query).await,
        Endpoint::VerifyKey => verify_key(&state, &ctx, &body),
        Endpoint::KeywordAdd => keyword_add(&state, &ctx, &body).await,
        Endpoint::KeywordDelete => keyword_delete(&state, &ctx, &body).await,
        Endpoint::MonitoringStart => monitoring(&state, &ctx, true).await,
        Endpoint::MonitoringStop => monitoring(&state, &ctx, false).await,
        Endpoint::SettingsUpdate => settings_update(&state, &ctx, &body).await,
        Endpoint::ConfigReload => config_reload(&state, &ctx),
        Endpoint::ClearFailedAttempts => clear_failed_attempts(&state, &ctx, &body),
        Endpoint::BannedIps => banned_ips(&state),
        Endpoint::SystemStatus => system_status(&state).await,
        Endpoint::SystemDiagnostics => system_diagnostics(&state),
    };

    result.unwrap_or_else(|e| {
        if let ApiError::HandlerFailure(ref inner) = e {
            state.audit.record(
                LogType::Operation,
                ctx.ip.to_string(),
                "handler_failure",
                format!("{endpoint:?} failed"),
                json!({ "error": format!("{inner:#}") }),
            );
        }
        e.into_response()
    })
}

/// Fallback for any method/path pair missing from the route table.
pub async fn not_found(method: Method, uri: Uri) -> ApiError {
    ApiError::RouteNotFound {
        method: method.to_string(),
        path: uri.path().to_owned(),
    }
}

// ── Helpers ───────────────────────────────────────────────────────────────────

/// Runs a collaborator call on the blocking pool, bounded by the configured
/// timeout.
async fn blocking<T, F>(state: &AppState, f: F) -> Result<T, ApiError>
where
    F: FnOnce() -> anyhow::Result<T> + Send + 'static,
    T: Send + 'static,
{
    let timeout = state.collaborator_timeout;
    match tokio::time::timeout(timeout, tokio::task::spawn_blocking(f)).await {
        Err(_) => Err(anyhow!("collaborator did not answer within {timeout:?}").into()),
        Ok(Err(e)) => Err(anyhow!("collaborator task failed: {e}").into()),
        Ok(Ok(result)) => result.map_err(ApiError::from),
    }
}

/// Serves `key` from the cache, computing and storing it on a miss.
async fn cached<F>(state: &AppState, key: CacheKey, compute: F) -> HandlerResult
where
    F: FnOnce() -> anyhow::Result<Value> + Send + 'static,
{
    if let Some(hit) = state.cache.get(key) {
        return Ok(Envelope::cached(hit, true).into_response());
    }
    let value = blocking(state, compute).await?;
    state.cache.set(key, value.clone(), key.default_ttl());
    Ok(Envelope::cached(value, false).into_response())
}

fn ok(data: Value) -> HandlerResult {
    Ok(Envelope::ok(data).into_response())
}

fn rejected(message: &str) -> HandlerResult {
    Ok(Envelope::rejected(message).into_response())
}

/// `?limit=N`, clamped to at least one. Missing or unparsable means `default`.
fn limit_param(query: &HashMap<String, String>, default: usize) -> usize {
    query
        .get("limit")
        .and_then(|v| v.trim().parse::<usize>().ok())
        .unwrap_or(default)
        .max(1)
}

/// Bodies are parsed leniently: empty or malformed JSON reads as defaults.
fn parse_body<T: for<'de> Deserialize<'de> + Default>(body: &Bytes) -> T {
    if body.is_empty() {
        return T::default();
    }
    serde_json::from_slice(body).unwrap_or_default()
}

fn format_uptime(secs: u64) -> String {
    format!("{:02}:{:02}:{:02}", secs / 3600, (secs % 3600) / 60, secs % 60)
}

// ── Auth ──────────────────────────────────────────────────────────────────────

fn auth_token(state: &AppState, ctx: &ClientContext) -> HandlerResult {
    let cfg = state.config.current();
    let session = state.auth.issue_session(&cfg, ctx.ip);
    let expires_in = cfg.session_timeout().as_secs();
    state.audit.record(
        LogType::Operation,
        ctx.ip.to_string(),
        "session",
        "session issued",
        json!({ "token": mask(&session.token), "expires_in": expires_in }),
    );
    ok(json!({
        "token": session.token,
        "expires_in": expires_in,
        "type": "session",
    }))
}

fn auth_info(state: &AppState, ctx: &ClientContext) -> HandlerResult {
    let cfg = state.config.current();
    let stats = state.limiter.client_stats(&cfg, ctx.ip);
    ok(json!({
        "client_ip": ctx.ip,
        "api_key_required": cfg.required_key().is_some(),
        "active_sessions": state.auth.sessions().active_count_at(Instant::now()),
        "failed_attempts": stats.failed_attempts,
        "banned": stats.banned,
        "requests_in_window": stats.requests_in_window,
        "rate_limit_remaining": stats.rate_limit_remaining,
        "session_timeout_minutes": cfg.session_timeout_minutes,
        "localhost_only": cfg.localhost_only,
    }))
}

fn auth_revoke(state: &AppState, ctx: &ClientContext) -> HandlerResult {
    let Some(token) = ctx.session_token.as_deref() else {
        return rejected("No session token presented");
    };
    let revoked = state.auth.sessions().revoke(token);
    state.audit.record(
        LogType::Operation,
        ctx.ip.to_string(),
        "session",
        if revoked { "session revoked" } else { "revoke of unknown session" },
        json!({ "token": mask(token) }),
    );
    ok(json!({ "revoked": revoked }))
}

fn verify_key(state: &AppState, ctx: &ClientContext, body: &Bytes) -> HandlerResult {
    #[derive(Default, Deserialize)]
    struct VerifyRequest {
        #[serde(default)]
        api_key: String,
    }

    let req: VerifyRequest = parse_body(body);
    let candidate = req.api_key.trim();
    if candidate.is_empty() {
        return rejected("api_key is required");
    }
    let cfg = state.config.current();
    match state.auth.verify_key(&cfg, &state.audit, candidate, ctx.ip) {
        KeyCheck::Valid => ok(json!({ "valid": true })),
        KeyCheck::NotConfigured => rejected("No API key is configured"),
        KeyCheck::Invalid => {
            state.limiter.record_failure(&cfg, ctx.ip);
            rejected("Invalid API key")
        }
    }
}

// ── Cached reads ──────────────────────────────────────────────────────────────

async fn status(state: &AppState) -> HandlerResult {
    let collab = state.collaborators.clone();
    let uptime = state.started_at.elapsed().as_secs();
    let requests = state.request_count.load(Ordering::Relaxed);
    cached(state, CacheKey::Status, move || {
        let keywords = collab.keywords.list()?;
        let metrics = collab.metrics.current()?;
        Ok(json!({
            "monitoring": collab.monitor.status(),
            "keywords_count": keywords.len(),
            "api": {
                "status": "running",
                "uptime": format_uptime(uptime),
                "uptime_seconds": uptime,
                "requests_count": requests,
            },
            "performance": {
                "cpu_percent": metrics.cpu_percent,
                "memory_percent": metrics.memory_percent,
            },
        }))
    })
    .await
}

async fn keywords(state: &AppState) -> HandlerResult {
    let store = state.collaborators.keywords.clone();
    cached(state, CacheKey::Keywords, move || {
        let keywords = store.list()?;
        Ok(json!({ "keywords": keywords, "count": keywords.len() }))
    })
    .await
}

async fn settings(state: &AppState) -> HandlerResult {
    let store = state.config.settings().clone();
    cached(state, CacheKey::Settings, move || {
        let mut snapshot = store.snapshot()?;
        if let Some(key) = snapshot
            .get_mut(SECURITY_SECTION)
            .and_then(|s| s.get_mut("api_key"))
        {
            if let Some(masked) = key.as_str().filter(|k| !k.is_empty()).map(mask) {
                *key = Value::String(masked);
            }
        }
        Ok(snapshot)
    })
    .await
}

async fn performance(state: &AppState) -> HandlerResult {
    let metrics = state.collaborators.metrics.clone();
    cached(state, CacheKey::Performance, move || {
        Ok(serde_json::to_value(metrics.current()?)?)
    })
    .await
}

/// The access log is cached whole; `limit` is applied to the cached copy.
fn access_logs(state: &AppState, query: &HashMap<String, String>) -> HandlerResult {
    let limit = limit_param(query, DEFAULT_LOG_LIMIT);
    let (entries, hit) = match state.cache.get(CacheKey::Logs) {
        Some(v) => (v, true),
        None => {
            let ring = state.audit.ring(LogType::Access);
            let v = serde_json::to_value(ring.query(ring.cap())).map_err(anyhow::Error::from)?;
            state
                .cache
                .set(CacheKey::Logs, v.clone(), CacheKey::Logs.default_ttl());
            (v, false)
        }
    };
    let logs: Vec<Value> = entries
        .as_array()
        .map(|a| a.iter().take(limit).cloned().collect())
        .unwrap_or_default();
    Ok(Envelope::cached(json!({ "total": logs.len(), "logs": logs }), hit).into_response())
}

// ── Uncached reads ────────────────────────────────────────────────────────────

fn operation_logs(state: &AppState, query: &HashMap<String, String>) -> HandlerResult {
    let logs = state
        .audit
        .query(LogType::Operation, limit_param(query, DEFAULT_LOG_LIMIT));
    ok(json!({ "total": logs.len(), "logs": logs }))
}

fn security_logs(state: &AppState, query: &HashMap<String, String>) -> HandlerResult {
    let cfg = state.config.current();
    let logs = state
        .audit
        .query(LogType::Api, limit_param(query, DEFAULT_LOG_LIMIT));
    ok(json!({
        "total": logs.len(),
        "logs": logs,
        "security_config": cfg.as_ref(),
    }))
}

async fn history(state: &AppState, query: &HashMap<String, String>) -> HandlerResult {
    let limit = limit_param(query, DEFAULT_LOG_LIMIT);
    let metrics = state.collaborators.metrics.clone();
    let samples = blocking(state, move || metrics.history(limit)).await?;
    ok(json!({ "total": samples.len(), "history": samples }))
}

// ── Mutations ─────────────────────────────────────────────────────────────────

#[derive(Default, Deserialize)]
struct KeywordRequest {
    #[serde(default)]
    keyword: String,
}

async fn keyword_add(state: &AppState, ctx: &ClientContext, body: &Bytes) -> HandlerResult {
    let req: KeywordRequest = parse_body(body);
    let keyword = req.keyword.trim().to_owned();
    if keyword.is_empty() {
        return rejected("Keyword must not be empty");
    }
    let store = state.collaborators.keywords.clone();
    let kw = keyword.clone();
    if !blocking(state, move || store.add(&kw)).await? {
        return rejected("Keyword already exists");
    }
    state
        .cache
        .invalidate_many(&[CacheKey::Keywords, CacheKey::Status]);
    info!(keyword = %keyword, "audit: keyword.add");
    state.audit.record(
        LogType::Operation,
        ctx.ip.to_string(),
        "keyword",
        format!("added keyword {keyword}"),
        json!({ "action": "add", "keyword": keyword }),
    );
    ok(json!({ "keyword": keyword }))
}

async fn keyword_delete(state: &AppState, ctx: &ClientContext, body: &Bytes) -> HandlerResult {
    let req: KeywordRequest = parse_body(body);
    let keyword = req.keyword.trim().to_owned();
    if keyword.is_empty() {
        return rejected("Keyword must not be empty");
    }
    let store = state.collaborators.keywords.clone();
    let kw = keyword.clone();
    if !blocking(state, move || store.delete(&kw)).await? {
        return rejected("Keyword not found");
    }
    state
        .cache
        .invalidate_many(&[CacheKey::Keywords, CacheKey::Status]);
    info!(keyword = %keyword, "audit: keyword.delete");
    state.audit.record(
        LogType::Operation,
        ctx.ip.to_string(),
        "keyword",
        format!("deleted keyword {keyword}"),
        json!({ "action": "delete", "keyword": keyword }),
    );
    ok(json!({ "keyword": keyword }))
}

async fn monitoring(state: &AppState, ctx: &ClientContext, start: bool) -> HandlerResult {
    let monitor = state.collaborators.monitor.clone();
    let status = blocking(state, move || {
        if start {
            monitor.start()?;
        } else {
            monitor.stop()?;
        }
        Ok(monitor.status())
    })
    .await?;
    state
        .cache
        .invalidate_many(&[CacheKey::Status, CacheKey::Performance]);
    let action = if start { "start" } else { "stop" };
    info!(action, "audit: monitoring");
    state.audit.record(
        LogType::Operation,
        ctx.ip.to_string(),
        "monitoring",
        format!("monitoring {action}"),
        json!({ "action": action }),
    );
    ok(json!({ "monitoring": status }))
}

async fn settings_update(state: &AppState, ctx: &ClientContext, body: &Bytes) -> HandlerResult {
    let patch: Map<String, Value> = match serde_json::from_slice::<Value>(body) {
        Ok(Value::Object(map)) if !map.is_empty() => map,
        _ => return rejected("Settings payload must be a non-empty JSON object"),
    };
    let keys: Vec<String> = patch.keys().cloned().collect();
    let touches_security = patch.contains_key(SECURITY_SECTION);

    // Updates replace whole sections, so the incoming section is what reload will read.
    if let Some(section) = patch.get(SECURITY_SECTION) {
        if let Err(e) = config::decode_section(section.clone()) {
            let reason = format!("{e:#}");
            warn!(error = %reason, "audit: settings.update refused");
            state.audit.record(
                LogType::Operation,
                ctx.ip.to_string(),
                "settings",
                "settings update refused",
                json!({ "keys": keys, "error": reason }),
            );
            return rejected(&format!("Invalid {SECURITY_SECTION} section: {reason}"));
        }
    }

    let store = state.config.settings().clone();
    blocking(state, move || store.update(patch)).await?;

    if touches_security {
        state.config.reload()?;
        state.cache.invalidate_all();
    } else {
        state
            .cache
            .invalidate_many(&[CacheKey::Settings, CacheKey::Status]);
    }
    info!(keys = ?keys, "audit: settings.update");
    state.audit.record(
        LogType::Operation,
        ctx.ip.to_string(),
        "settings",
        "settings updated",
        json!({ "keys": keys, "security_reloaded": touches_security }),
    );
    ok(json!({ "updated": keys }))
}

fn config_reload(state: &AppState, ctx: &ClientContext) -> HandlerResult {
    let cfg = match state.config.reload() {
        Ok(cfg) => cfg,
        Err(e) => return rejected(&format!("Security policy not reloaded: {e:#}")),
    };
    state.cache.invalidate_all();
    state.audit.record(
        LogType::Operation,
        ctx.ip.to_string(),
        "settings",
        "security policy reloaded",
        json!({}),
    );
    ok(json!({ "security_config": cfg.as_ref() }))
}

fn clear_failed_attempts(state: &AppState, ctx: &ClientContext, body: &Bytes) -> HandlerResult {
    #[derive(Default, Deserialize)]
    struct ClearRequest {
        #[serde(default)]
        ip: Option<String>,
    }

    let req: ClearRequest = parse_body(body);
    let target = match req.ip.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
        None => None,
        Some(raw) => match raw.parse::<IpAddr>() {
            Ok(ip) => Some(ip.to_canonical()),
            Err(_) => return rejected("Invalid IP address"),
        },
    };
    let cleared = state.limiter.clear_failures(target);
    let scope = target.map_or_else(|| "all".to_owned(), |ip| ip.to_string());
    warn!(scope = %scope, cleared, "audit: failed_attempts.clear");
    state.audit.record(
        LogType::Operation,
        ctx.ip.to_string(),
        "unban",
        format!("cleared failed attempts for {scope}"),
        json!({ "target": scope, "cleared": cleared }),
    );
    ok(json!({ "cleared": cleared, "target": scope }))
}

fn banned_ips(state: &AppState) -> HandlerResult {
    let cfg = state.config.current();
    let banned = state.limiter.list_banned(&cfg);
    ok(json!({
        "total_banned": banned.len(),
        "banned_ips": banned,
        "ban_duration_minutes": cfg.ban_duration_minutes,
        "max_attempts": cfg.max_login_attempts,
    }))
}

// ── System ────────────────────────────────────────────────────────────────────

async fn system_status(state: &AppState) -> HandlerResult {
    let metrics = state.collaborators.metrics.clone();
    let (snapshot, host) = blocking(state, move || Ok((metrics.current()?, hostname()))).await?;
    let uptime = state.started_at.elapsed().as_secs();
    ok(json!({
        "system": {
            "platform": std::env::consts::OS,
            "arch": std::env::consts::ARCH,
            "hostname": host,
            "uptime": format_uptime(uptime),
            "uptime_seconds": uptime,
        },
        "resources": {
            "cpu_percent": snapshot.cpu_percent,
            "load_average": snapshot.load_average,
            "memory_percent": snapshot.memory_percent,
            "memory_total_mb": snapshot.memory_total_mb,
            "process_memory_mb": snapshot.process_memory_mb,
        },
        "server": {
            "status": "running",
            "version": env!("CARGO_PKG_VERSION"),
            "total_requests": state.request_count.load(Ordering::Relaxed),
            "tracked_clients": state.limiter.tracked_clients(),
        },
    }))
}

fn system_diagnostics(state: &AppState) -> HandlerResult {
    let cfg = state.config.current();
    let failures = state.limiter.failure_counts(&cfg);
    let total_failures: usize = failures.iter().map(|(_, n)| n).sum();
    let by_ip: Map<String, Value> = failures
        .iter()
        .map(|(ip, n)| (ip.to_string(), json!(n)))
        .collect();
    let banned = state.limiter.list_banned(&cfg).len();
    let ring_len = |t: LogType| state.audit.ring(t).len();
    ok(json!({
        "security": {
            "failed_auth_attempts": total_failures,
            "failed_by_ip": by_ip,
            "banned_ips": banned,
            "active_sessions": state.auth.sessions().active_count_at(Instant::now()),
        },
        "audit": {
            "enabled": cfg.audit_enabled,
            "access_entries": ring_len(LogType::Access),
            "operation_entries": ring_len(LogType::Operation),
            "api_entries": ring_len(LogType::Api),
        },
        "policy": {
            "api_key": cfg.required_key().is_some(),
            "localhost_only": cfg.localhost_only,
            "ip_whitelist": cfg.ip_whitelist_enabled,
            "rate_limit": cfg.rate_limit(),
            "login_limit": cfg.login_limit_enabled,
            "cors": cfg.cors_enabled,
        },
    }))
}

/// Kernel hostname, then `$HOSTNAME`, then `"unknown"`.
fn hostname() -> String {
    std::fs::read_to_string("/proc/sys/kernel/hostname")
        .ok()
        .map(|h| h.trim().to_owned())
        .filter(|h| !h.is_empty())
        .or_else(|| std::env::var("HOSTNAME").ok())
        .unwrap_or_else(|| "unknown".to_owned())
}
