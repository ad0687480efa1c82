use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::Ordering;
use std::time::Instant;

use axum::{
    extract::{ConnectInfo, Request, State},
    http::{
        header::{HOST, ORIGIN, REFERER, USER_AGENT},
        HeaderMap, Method,
    },
    middleware::Next,
    response::{IntoResponse, Response},
};
use serde_json::json;

use crate::{
    audit::LogType,
    auth::{AuthOutcome, SESSION_HEADER},
    config::SecurityConfig,
    error::{ApiError, Envelope},
    AppState,
};

/// Per-request facts established by the gates and handed to handlers.
#[derive(Debug, Clone)]
pub struct ClientContext {
    pub ip: IpAddr,
    pub user_agent: String,
    pub session_token: Option<String>,
}

/// Axum middleware wrapping every route and the fallback. Runs the gates in
/// order (network policy, ban, rate, origin, authentication), hands admitted
/// requests on, and records access and API audit entries either way.
/// `OPTIONS` is answered before any gate.
pub async fn gate(State(state): State<AppState>, mut request: Request, next: Next) -> Response {
    let started = Instant::now();
    let ip = client_ip(&request);
    let method = request.method().clone();
    let path = request.uri().path().to_owned();
    let user_agent = header_str(request.headers(), USER_AGENT.as_str())
        .unwrap_or_default()
        .to_owned();
    let cfg = state.config.current();
    state.request_count.fetch_add(1, Ordering::Relaxed);

    state.audit.record(
        LogType::Access,
        ip.to_string(),
        "request",
        format!("{method} {path}"),
        json!({
            "method": method.as_str(),
            "path": path,
            "user_agent": user_agent,
            "referer": header_str(request.headers(), REFERER.as_str()),
        }),
    );

    let response = if method == Method::OPTIONS {
        Envelope::empty().into_response()
    } else {
        match check_gates(&state, &cfg, &method, &path, request.headers(), ip) {
            Ok(()) => {
                let session_token =
                    header_str(request.headers(), SESSION_HEADER).map(str::to_owned);
                request.extensions_mut().insert(ClientContext {
                    ip,
                    user_agent: user_agent.clone(),
                    session_token,
                });
                next.run(request).await
            }
            Err(e) => e.into_response(),
        }
    };

    let status = response.status().as_u16();
    if cfg.audit_enabled {
        state.audit.record(
            LogType::Api,
            ip.to_string(),
            "api_call",
            format!("{method} {path} {status}"),
            json!({
                "method": method.as_str(),
                "path": path,
                "status": status,
                "latency_ms": started.elapsed().as_millis() as u64,
                "user_agent": user_agent,
            }),
        );
    }
    response
}

fn check_gates(
    state: &AppState,
    cfg: &SecurityConfig,
    method: &Method,
    path: &str,
    headers: &HeaderMap,
    ip: IpAddr,
) -> Result<(), ApiError> {
    if let Err(e) = state.limiter.admit(cfg, ip) {
        state.audit.record(
            LogType::Operation,
            ip.to_string(),
            "access_denied",
            e.to_string(),
            json!({ "method": method.as_str(), "path": path, "gate": e.kind() }),
        );
        return Err(e);
    }

    if cfg.cors_enabled {
        if let Some(origin) = header_str(headers, ORIGIN.as_str()) {
            let same_origin = header_str(headers, HOST.as_str())
                .is_some_and(|host| origin_host(origin) == Some(host));
            if !same_origin && !cfg.allows_origin(origin) {
                let e = ApiError::PolicyDenied("Origin not allowed".into());
                state.audit.record(
                    LogType::Operation,
                    ip.to_string(),
                    "access_denied",
                    e.to_string(),
                    json!({ "method": method.as_str(), "path": path, "origin": origin }),
                );
                return Err(e);
            }
        }
    }

    match state
        .auth
        .authenticate(cfg, &state.audit, method, path, headers, ip)
    {
        AuthOutcome::Denied(e) => {
            state.limiter.record_failure(cfg, ip);
            Err(e)
        }
        _ => Ok(()),
    }
}

/// Peer address from the connection, or loopback for in-process callers.
pub fn client_ip(request: &Request) -> IpAddr {
    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_canonical())
        .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST))
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// `https://host:port` → `host:port`.
fn origin_host(origin: &str) -> Option<&str> {
    origin.split_once("://").map(|(_, rest)| rest.trim_end_matches('/'))
}
