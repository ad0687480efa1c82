use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    extract::ConnectInfo,
    http::{HeaderName, HeaderValue, Method, Request, StatusCode},
};
use axum_test::TestServer;
use serde_json::{json, Value};
use tempfile::TempDir;
use tower::ServiceExt;

use watchpost_server::{
    audit::LogType,
    build_app,
    collaborators::{Collaborators, KeywordStore},
    AppState, JsonSettingsStore,
};

const KEY: &str = "correct-horse-battery";

// ── Helpers ───────────────────────────────────────────────────────────────────

/// State backed by a temporary settings file holding `security` as the
/// `web_api_security` section.
fn state_with(security: Value) -> (AppState, TempDir) {
    state_with_collaborators(security, Collaborators::default())
}

fn state_with_collaborators(security: Value, collaborators: Collaborators) -> (AppState, TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("settings.json");
    std::fs::write(
        &path,
        json!({ "web_api_security": security, "theme": "dark" }).to_string(),
    )
    .unwrap();
    let state = AppState::new(Arc::new(JsonSettingsStore::new(&path)), collaborators);
    (state, dir)
}

fn open_policy() -> Value {
    json!({ "enable_api_key": false, "rate_limit": false })
}

fn keyed_policy() -> Value {
    json!({ "enable_api_key": true, "api_key": KEY, "rate_limit": false })
}

fn server(state: AppState) -> TestServer {
    TestServer::new(build_app(state)).unwrap()
}

fn session_header() -> HeaderName {
    HeaderName::from_static("x-session-token")
}

fn bearer(key: &str) -> HeaderValue {
    HeaderValue::from_str(&format!("Bearer {key}")).unwrap()
}

/// Sends `request` as if it arrived from `peer`.
async fn from_peer(state: AppState, peer: &str, request: Request<Body>) -> (StatusCode, Value) {
    let mut request = request;
    let addr: SocketAddr = peer.parse().unwrap();
    request.extensions_mut().insert(ConnectInfo(addr));
    let response = build_app(state).oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
}

// ── Cache ─────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn status_second_read_is_cached() {
    let (state, _dir) = state_with(open_policy());
    let server = server(state);

    let first: Value = server.get("/api/status").await.json();
    assert_eq!(first["success"], true);
    assert_eq!(first["cached"], false);
    assert_eq!(first["data"]["api"]["status"], "running");

    let second: Value = server.get("/api/status").await.json();
    assert_eq!(second["cached"], true);
    assert_eq!(second["data"], first["data"]);
}

#[tokio::test]
async fn keyword_add_invalidates_cached_list() {
    let (state, _dir) = state_with(open_policy());
    let server = server(state);

    let before: Value = server.get("/api/keywords").await.json();
    assert_eq!(before["cached"], false);
    assert_eq!(before["data"]["count"], 0);
    let again: Value = server.get("/api/keywords").await.json();
    assert_eq!(again["cached"], true);

    let added: Value = server
        .post("/api/keywords/add")
        .json(&json!({ "keyword": "  disk  " }))
        .await
        .json();
    assert_eq!(added["success"], true);
    assert_eq!(added["data"]["keyword"], "disk");

    let after: Value = server.get("/api/keywords").await.json();
    assert_eq!(after["cached"], false);
    assert_eq!(after["data"]["keywords"], json!(["disk"]));
}

#[tokio::test]
async fn keyword_domain_rejections_are_200() {
    let (state, _dir) = state_with(open_policy());
    let server = server(state);

    let response = server
        .post("/api/keywords/add")
        .json(&json!({ "keyword": "   " }))
        .await;
    assert_eq!(response.status_code(), StatusCode::OK);
    let body: Value = response.json();
    assert_eq!(body["success"], false);

    server
        .post("/api/keywords/add")
        .json(&json!({ "keyword": "cpu" }))
        .await;
    let dup: Value = server
        .post("/api/keywords/add")
        .json(&json!({ "keyword": "cpu" }))
        .await
        .json();
    assert_eq!(dup["success"], false);
    assert_eq!(dup["error"], "Keyword already exists");

    let missing: Value = server
        .post("/api/keywords/delete")
        .json(&json!({ "keyword": "nope" }))
        .await
        .json();
    assert_eq!(missing["success"], false);
}

#[tokio::test]
async fn monitoring_start_shows_in_fresh_status() {
    let (state, _dir) = state_with(open_policy());
    let server = server(state);

    let status: Value = server.get("/api/status").await.json();
    assert_eq!(status["data"]["monitoring"]["active"], false);

    let started: Value = server.post("/api/monitoring/start").await.json();
    assert_eq!(started["data"]["monitoring"]["active"], true);

    let status: Value = server.get("/api/status").await.json();
    assert_eq!(status["cached"], false);
    assert_eq!(status["data"]["monitoring"]["active"], true);
}

// ── Authentication ────────────────────────────────────────────────────────────

#[tokio::test]
async fn protected_route_requires_credentials() {
    let (state, _dir) = state_with(keyed_policy());
    let server = server(state);

    let response = server.get("/api/status").await;
    assert_eq!(response.status_code(), StatusCode::UNAUTHORIZED);
    let body: Value = response.json();
    assert_eq!(body["success"], false);
    assert_eq!(body["error"], "Authentication required");

    let response = server
        .get("/api/status")
        .add_header(axum::http::header::AUTHORIZATION, bearer(KEY))
        .await;
    assert_eq!(response.status_code(), StatusCode::OK);

    let response = server
        .get("/api/status")
        .add_header(axum::http::header::AUTHORIZATION, bearer("wrong"))
        .await;
    assert_eq!(response.status_code(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn public_routes_skip_authentication() {
    let (state, _dir) = state_with(keyed_policy());
    let server = server(state);

    assert_eq!(server.get("/").await.status_code(), StatusCode::OK);
    assert!(server.get("/index.html").await.text().contains("<html"));
    assert_eq!(server.get("/api/auth/info").await.status_code(), StatusCode::OK);
    assert_eq!(
        server.get("/api/get_banned_ips").await.status_code(),
        StatusCode::OK
    );
}

#[tokio::test]
async fn session_token_grants_access_until_revoked() {
    let (state, _dir) = state_with(keyed_policy());
    let server = server(state);

    let issued: Value = server.get("/api/auth/token").await.json();
    assert_eq!(issued["data"]["type"], "session");
    assert_eq!(issued["data"]["expires_in"], 30 * 60);
    let token = issued["data"]["token"].as_str().unwrap().to_owned();
    assert_eq!(token.len(), 64);
    let token_value = HeaderValue::from_str(&token).unwrap();

    let response = server
        .get("/api/keywords")
        .add_header(session_header(), token_value.clone())
        .await;
    assert_eq!(response.status_code(), StatusCode::OK);

    let revoked: Value = server
        .post("/api/auth/revoke")
        .add_header(session_header(), token_value.clone())
        .await
        .json();
    assert_eq!(revoked["data"]["revoked"], true);

    let response = server
        .get("/api/keywords")
        .add_header(session_header(), token_value)
        .await;
    assert_eq!(response.status_code(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn session_is_bound_to_issuing_ip() {
    let (state, _dir) = state_with(keyed_policy());
    let token = state
        .auth
        .issue_session(&state.config.current(), "10.0.0.1".parse().unwrap())
        .token;

    let request = || {
        Request::builder()
            .uri("/api/status")
            .header("x-session-token", token.as_str())
            .body(Body::empty())
            .unwrap()
    };
    let (status, _) = from_peer(state.clone(), "10.0.0.2:5000", request()).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, body) = from_peer(state, "10.0.0.1:5000", request()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
}

// ── Bans and rate limiting ────────────────────────────────────────────────────

#[tokio::test]
async fn five_wrong_keys_ban_the_caller() {
    let (state, _dir) = state_with(keyed_policy());
    let server = server(state.clone());

    for _ in 0..5 {
        let response = server
            .post("/api/verify_key")
            .json(&json!({ "api_key": "guess" }))
            .await;
        assert_eq!(response.status_code(), StatusCode::OK);
        let body: Value = response.json();
        assert_eq!(body["success"], false);
    }

    let response = server
        .post("/api/verify_key")
        .json(&json!({ "api_key": KEY }))
        .await;
    assert_eq!(response.status_code(), StatusCode::TOO_MANY_REQUESTS);
    let body: Value = response.json();
    assert!(body["error"].as_str().unwrap().contains("banned"));

    let banned = state.limiter.list_banned(&state.config.current());
    assert_eq!(banned.len(), 1);
    assert_eq!(banned[0].failed_attempts, 5);
    assert!(banned[0].remaining_seconds > 14 * 60);

    state.limiter.clear_failures(None);
    let ok: Value = server
        .post("/api/verify_key")
        .json(&json!({ "api_key": KEY }))
        .await
        .json();
    assert_eq!(ok["success"], true);
}

#[tokio::test]
async fn correct_key_verifies_without_failure() {
    let (state, _dir) = state_with(keyed_policy());
    let server = server(state);

    let body: Value = server
        .post("/api/verify_key")
        .json(&json!({ "api_key": KEY }))
        .await
        .json();
    assert_eq!(body["data"]["valid"], true);

    let info: Value = server.get("/api/auth/info").await.json();
    assert_eq!(info["data"]["failed_attempts"], 0);
    assert_eq!(info["data"]["api_key_required"], true);
}

#[tokio::test]
async fn banned_ip_listing_and_clearing() {
    let (state, _dir) = state_with(keyed_policy());
    let cfg = state.config.current();
    let offender = "203.0.113.9".parse().unwrap();
    for _ in 0..5 {
        state.limiter.record_failure(&cfg, offender);
    }
    let server = server(state);

    let listed: Value = server.post("/api/get_banned_ips").await.json();
    assert_eq!(listed["data"]["total_banned"], 1);
    assert_eq!(listed["data"]["banned_ips"][0]["ip"], "203.0.113.9");
    assert_eq!(listed["data"]["ban_duration_minutes"], 15);
    assert_eq!(listed["data"]["max_attempts"], 5);

    let bad: Value = server
        .post("/api/clear_failed_attempts")
        .json(&json!({ "ip": "not-an-ip" }))
        .await
        .json();
    assert_eq!(bad["success"], false);

    let cleared: Value = server
        .post("/api/clear_failed_attempts")
        .json(&json!({ "ip": "203.0.113.9" }))
        .await
        .json();
    assert_eq!(cleared["data"]["cleared"], 1);

    let listed: Value = server.get("/api/get_banned_ips").await.json();
    assert_eq!(listed["data"]["total_banned"], 0);
}

#[tokio::test]
async fn rate_limit_rejects_past_budget() {
    let (state, _dir) = state_with(json!({ "rate_limit": 3 }));
    let server = server(state);

    for _ in 0..3 {
        assert_eq!(server.get("/api/auth/info").await.status_code(), StatusCode::OK);
    }
    let response = server.get("/api/auth/info").await;
    assert_eq!(response.status_code(), StatusCode::TOO_MANY_REQUESTS);
    let body: Value = response.json();
    assert_eq!(body["error"], "Rate limit exceeded");
}

// ── Network policy ────────────────────────────────────────────────────────────

#[tokio::test]
async fn whitelist_rejects_addresses_outside_cidr() {
    let (state, _dir) = state_with(json!({
        "enable_ip_whitelist": true,
        "ip_whitelist": ["10.0.0.0/8"],
        "rate_limit": false,
    }));
    let request = || {
        Request::builder()
            .uri("/api/auth/info")
            .body(Body::empty())
            .unwrap()
    };

    let (status, body) = from_peer(state.clone(), "192.168.1.5:40000", request()).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"], "IP address not in whitelist");

    let (status, body) = from_peer(state, "10.20.30.40:40000", request()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["client_ip"], "10.20.30.40");
}

#[tokio::test]
async fn localhost_only_rejects_remote_peers() {
    let (state, _dir) = state_with(json!({ "localhost_only": true, "rate_limit": false }));
    let request = || {
        Request::builder()
            .uri("/api/auth/info")
            .body(Body::empty())
            .unwrap()
    };

    let (status, _) = from_peer(state.clone(), "192.0.2.1:1234", request()).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    let (status, _) = from_peer(state, "127.0.0.1:1234", request()).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn cors_origin_outside_allow_list_is_forbidden() {
    let (state, _dir) = state_with(json!({
        "enable_cors": true,
        "cors_origins": ["http://panel.example"],
        "rate_limit": false,
    }));
    let server = server(state);

    let response = server
        .get("/api/auth/info")
        .add_header(
            axum::http::header::ORIGIN,
            HeaderValue::from_static("http://evil.example"),
        )
        .await;
    assert_eq!(response.status_code(), StatusCode::FORBIDDEN);

    let response = server
        .get("/api/auth/info")
        .add_header(
            axum::http::header::ORIGIN,
            HeaderValue::from_static("http://panel.example"),
        )
        .await;
    assert_eq!(response.status_code(), StatusCode::OK);
    assert_eq!(
        response.header("access-control-allow-origin"),
        "http://panel.example"
    );
}

// ── Routing ───────────────────────────────────────────────────────────────────

#[tokio::test]
async fn unknown_routes_are_json_404() {
    let (state, _dir) = state_with(open_policy());
    let server = server(state);

    let response = server.get("/api/nothing-here").await;
    assert_eq!(response.status_code(), StatusCode::NOT_FOUND);
    let body: Value = response.json();
    assert_eq!(body["success"], false);
    assert_eq!(body["error"], "No route for GET /api/nothing-here");

    let response = server.post("/api/status").await;
    assert_eq!(response.status_code(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn options_is_answered_before_gates() {
    let (state, _dir) = state_with(keyed_policy());
    let server = server(state);

    let response = server.method(Method::OPTIONS, "/api/status").await;
    assert_eq!(response.status_code(), StatusCode::OK);
    let body: Value = response.json();
    assert_eq!(body["success"], true);
}

// ── Settings ──────────────────────────────────────────────────────────────────

#[tokio::test]
async fn settings_read_masks_api_key() {
    let (state, _dir) = state_with(keyed_policy());
    let server = server(state);

    let body: Value = server
        .get("/api/settings")
        .add_header(axum::http::header::AUTHORIZATION, bearer(KEY))
        .await
        .json();
    assert_eq!(body["data"]["theme"], "dark");
    let shown = body["data"]["web_api_security"]["api_key"].as_str().unwrap();
    assert_ne!(shown, KEY);
    assert!(shown.contains("****"));
}

#[tokio::test]
async fn security_update_reloads_policy() {
    let (state, _dir) = state_with(keyed_policy());
    let server = server(state.clone());
    let auth = bearer(KEY);

    let body: Value = server
        .post("/api/settings/update")
        .add_header(axum::http::header::AUTHORIZATION, auth.clone())
        .json(&json!({ "web_api_security": { "enable_api_key": false, "rate_limit": false } }))
        .await
        .json();
    assert_eq!(body["success"], true);
    assert!(state.config.current().required_key().is_none());

    assert_eq!(server.get("/api/keywords").await.status_code(), StatusCode::OK);
}

#[tokio::test]
async fn settings_update_rejects_non_object() {
    let (state, _dir) = state_with(open_policy());
    let server = server(state);

    let body: Value = server
        .post("/api/settings/update")
        .json(&json!([1, 2, 3]))
        .await
        .json();
    assert_eq!(body["success"], false);
}

#[tokio::test]
async fn malformed_security_patch_is_refused_and_not_persisted() {
    let (state, dir) = state_with(keyed_policy());
    let server = server(state.clone());

    let body: Value = server
        .post("/api/settings/update")
        .add_header(axum::http::header::AUTHORIZATION, bearer(KEY))
        .json(&json!({
            "web_api_security": { "enable_api_key": true, "api_key": KEY, "max_login_attempts": "5" },
            "theme": "light",
        }))
        .await
        .json();
    assert_eq!(body["success"], false);
    assert!(body["error"].as_str().unwrap().contains("web_api_security"));

    // Policy and file are untouched; the key is still required.
    assert_eq!(state.config.current().required_key(), Some(KEY));
    let on_disk: Value =
        serde_json::from_str(&std::fs::read_to_string(dir.path().join("settings.json")).unwrap())
            .unwrap();
    assert_eq!(on_disk["theme"], "dark");
    assert!(on_disk["web_api_security"].get("max_login_attempts").is_none());
    assert_eq!(
        server.get("/api/keywords").await.status_code(),
        StatusCode::UNAUTHORIZED
    );

    let refused = state.audit.query(LogType::Operation, 10);
    assert!(refused.iter().any(|e| e.message == "settings update refused"));
}

#[tokio::test]
async fn reload_of_broken_settings_file_keeps_policy() {
    let (state, dir) = state_with(keyed_policy());
    let server = server(state.clone());
    std::fs::write(
        dir.path().join("settings.json"),
        json!({ "web_api_security": { "rate_limit": "lots" } }).to_string(),
    )
    .unwrap();

    let body: Value = server
        .post("/api/config/reload")
        .add_header(axum::http::header::AUTHORIZATION, bearer(KEY))
        .await
        .json();
    assert_eq!(body["success"], false);
    assert_eq!(state.config.current().required_key(), Some(KEY));
}

#[tokio::test]
async fn oversized_durations_are_clamped() {
    let (state, _dir) = state_with(json!({
        "rate_limit": false,
        "session_timeout": 400_000_000_000_000_000u64,
        "ban_duration": 400_000_000_000_000_000u64,
    }));
    let server = server(state);

    let issued: Value = server.get("/api/auth/token").await.json();
    assert_eq!(issued["success"], true);
    assert_eq!(issued["data"]["expires_in"], 365 * 24 * 60 * 60);

    let banned: Value = server.get("/api/get_banned_ips").await.json();
    assert_eq!(banned["data"]["ban_duration_minutes"], 365 * 24 * 60);
}

// ── System ────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn system_status_reports_host_and_request_count() {
    let (state, _dir) = state_with(keyed_policy());
    let server = server(state);

    assert_eq!(
        server.get("/api/system/status").await.status_code(),
        StatusCode::UNAUTHORIZED
    );

    let body: Value = server
        .get("/api/system/status")
        .add_header(axum::http::header::AUTHORIZATION, bearer(KEY))
        .await
        .json();
    assert_eq!(body["success"], true);
    assert!(body.get("cached").is_none());
    assert_eq!(body["data"]["system"]["platform"], std::env::consts::OS);
    assert!(!body["data"]["system"]["hostname"].as_str().unwrap().is_empty());
    assert_eq!(body["data"]["server"]["status"], "running");
    assert_eq!(body["data"]["server"]["total_requests"], 2);
}

#[tokio::test]
async fn system_diagnostics_counts_failures_and_sessions() {
    let (state, _dir) = state_with(keyed_policy());
    let server = server(state);

    server.get("/api/auth/token").await;
    for _ in 0..2 {
        server
            .get("/api/keywords")
            .add_header(axum::http::header::AUTHORIZATION, bearer("wrong"))
            .await;
    }

    let body: Value = server
        .get("/api/system/diagnostics")
        .add_header(axum::http::header::AUTHORIZATION, bearer(KEY))
        .await
        .json();
    assert_eq!(body["success"], true);
    let security = &body["data"]["security"];
    assert_eq!(security["failed_auth_attempts"], 2);
    assert_eq!(security["banned_ips"], 0);
    assert_eq!(security["active_sessions"], 1);
    assert_eq!(security["failed_by_ip"].as_object().unwrap().len(), 1);
    assert_eq!(body["data"]["policy"]["api_key"], true);
}

// ── Audit ─────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn requests_land_in_access_and_api_logs() {
    let (state, _dir) = state_with(open_policy());
    let server = server(state.clone());

    server.get("/api/status").await;
    server.get("/api/unknown").await;

    assert_eq!(state.audit.ring(LogType::Access).len(), 2);
    let api = state.audit.query(LogType::Api, 10);
    assert_eq!(api.len(), 2);
    assert_eq!(api[0].details["status"], 404);
    assert_eq!(api[1].details["path"], "/api/status");

    let logs: Value = server.get("/api/security/logs?limit=1").await.json();
    assert_eq!(logs["data"]["total"], 1);
    assert!(logs["data"]["security_config"].get("api_key").is_none());
}

#[tokio::test]
async fn disabled_audit_skips_api_log_only() {
    let (state, _dir) = state_with(json!({ "enable_api_audit": false, "rate_limit": false }));
    let server = server(state.clone());

    server.get("/api/auth/info").await;
    assert_eq!(state.audit.ring(LogType::Access).len(), 1);
    assert!(state.audit.ring(LogType::Api).is_empty());
}

// ── Collaborator failures ─────────────────────────────────────────────────────

struct BrokenKeywords;

impl KeywordStore for BrokenKeywords {
    fn list(&self) -> anyhow::Result<Vec<String>> {
        anyhow::bail!("keyword database unavailable")
    }
    fn add(&self, _: &str) -> anyhow::Result<bool> {
        anyhow::bail!("keyword database unavailable")
    }
    fn delete(&self, _: &str) -> anyhow::Result<bool> {
        anyhow::bail!("keyword database unavailable")
    }
}

struct SlowKeywords;

impl KeywordStore for SlowKeywords {
    fn list(&self) -> anyhow::Result<Vec<String>> {
        std::thread::sleep(Duration::from_millis(500));
        Ok(Vec::new())
    }
    fn add(&self, _: &str) -> anyhow::Result<bool> {
        Ok(true)
    }
    fn delete(&self, _: &str) -> anyhow::Result<bool> {
        Ok(true)
    }
}

#[tokio::test]
async fn collaborator_error_is_500_and_audited() {
    let collaborators = Collaborators {
        keywords: Arc::new(BrokenKeywords),
        ..Collaborators::default()
    };
    let (state, _dir) = state_with_collaborators(open_policy(), collaborators);
    let server = server(state.clone());

    let response = server.get("/api/keywords").await;
    assert_eq!(response.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
    let body: Value = response.json();
    assert_eq!(body["error"], "keyword database unavailable");

    let failures: Vec<_> = state
        .audit
        .query(LogType::Operation, 50)
        .into_iter()
        .filter(|e| e.category == "handler_failure")
        .collect();
    assert_eq!(failures.len(), 1);
}

#[tokio::test]
async fn slow_collaborator_times_out() {
    let collaborators = Collaborators {
        keywords: Arc::new(SlowKeywords),
        ..Collaborators::default()
    };
    let (mut state, _dir) = state_with_collaborators(open_policy(), collaborators);
    state.collaborator_timeout = Duration::from_millis(50);
    let server = server(state);

    let response = server.get("/api/keywords").await;
    assert_eq!(response.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
}
