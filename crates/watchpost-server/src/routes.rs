use std::collections::{BTreeMap, HashMap};

use axum::{
    body::Bytes,
    extract::{Query, State},
    http::Method,
    routing::{MethodFilter, MethodRouter},
    Extension, Router,
};

use crate::{dispatch::ClientContext, handlers, AppState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verb {
    Get,
    Post,
}

impl Verb {
    fn filter(self) -> MethodFilter {
        match self {
            Verb::Get => MethodFilter::GET,
            Verb::Post => MethodFilter::POST,
        }
    }

    fn matches(self, method: &Method) -> bool {
        match self {
            Verb::Get => method == Method::GET || method == Method::HEAD,
            Verb::Post => method == Method::POST,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Public,
    Protected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    Index,
    AuthToken,
    AuthInfo,
    AuthRevoke,
    Status,
    Keywords,
    Logs,
    LogsDetailed,
    SecurityLogs,
    Settings,
    Performance,
    History,
    VerifyKey,
    KeywordAdd,
    KeywordDelete,
    MonitoringStart,
    MonitoringStop,
    SettingsUpdate,
    ConfigReload,
    ClearFailedAttempts,
    BannedIps,
    SystemStatus,
    SystemDiagnostics,
}

#[derive(Debug, Clone, Copy)]
pub struct Route {
    pub verb: Verb,
    pub path: &'static str,
    pub access: Access,
    pub endpoint: Endpoint,
}

const fn route(verb: Verb, path: &'static str, access: Access, endpoint: Endpoint) -> Route {
    Route {
        verb,
        path,
        access,
        endpoint,
    }
}

use Access::{Protected, Public};
use Verb::{Get, Post};

/// Every (method, path) the server answers. Anything else is a 404.
pub static ROUTES: &[Route] = &[
    route(Get, "/", Public, Endpoint::Index),
    route(Get, "/index.html", Public, Endpoint::Index),
    route(Get, "/api/auth/token", Public, Endpoint::AuthToken),
    route(Get, "/api/auth/info", Public, Endpoint::AuthInfo),
    route(Post, "/api/auth/revoke", Protected, Endpoint::AuthRevoke),
    route(Get, "/api/status", Protected, Endpoint::Status),
    route(Get, "/api/keywords", Protected, Endpoint::Keywords),
    route(Get, "/api/logs", Protected, Endpoint::Logs),
    route(Get, "/api/logs/detailed", Protected, Endpoint::LogsDetailed),
    route(Get, "/api/security/logs", Protected, Endpoint::SecurityLogs),
    route(Get, "/api/settings", Protected, Endpoint::Settings),
    route(Get, "/api/performance", Protected, Endpoint::Performance),
    route(Get, "/api/history", Protected, Endpoint::History),
    route(Get, "/api/system/status", Protected, Endpoint::SystemStatus),
    route(Get, "/api/system/diagnostics", Protected, Endpoint::SystemDiagnostics),
    route(Post, "/api/verify_key", Public, Endpoint::VerifyKey),
    route(Post, "/api/keywords/add", Protected, Endpoint::KeywordAdd),
    route(Post, "/api/keywords/delete", Protected, Endpoint::KeywordDelete),
    route(Post, "/api/monitoring/start", Protected, Endpoint::MonitoringStart),
    route(Post, "/api/monitoring/stop", Protected, Endpoint::MonitoringStop),
    route(Post, "/api/settings/update", Protected, Endpoint::SettingsUpdate),
    route(Post, "/api/config/reload", Protected, Endpoint::ConfigReload),
    route(Post, "/api/clear_failed_attempts", Public, Endpoint::ClearFailedAttempts),
    route(Post, "/api/get_banned_ips", Public, Endpoint::BannedIps),
    route(Get, "/api/get_banned_ips", Public, Endpoint::BannedIps),
];

pub fn lookup(method: &Method, path: &str) -> Option<&'static Route> {
    ROUTES
        .iter()
        .find(|r| r.path == path && r.verb.matches(method))
}

/// Builds the axum router from the table. Paths are grouped so each gets a
/// single method router whose fallback answers unmatched verbs with 404.
pub fn router() -> Router<AppState> {
    let mut by_path: BTreeMap<&'static str, MethodRouter<AppState>> = BTreeMap::new();
    for r in ROUTES {
        let endpoint = r.endpoint;
        let handler = move |State(state): State<AppState>,
                            Extension(ctx): Extension<ClientContext>,
                            Query(query): Query<HashMap<String, String>>,
                            body: Bytes| async move {
            handlers::dispatch(endpoint, state, ctx, query, body).await
        };
        let methods = by_path.remove(r.path).unwrap_or_default();
        by_path.insert(r.path, methods.on(r.verb.filter(), handler));
    }

    by_path
        .into_iter()
        .fold(Router::new(), |router, (path, methods)| {
            router.route(path, methods.fallback(handlers::not_found))
        })
        .fallback(handlers::not_found)
}
