use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{middleware, Router};
use directories::ProjectDirs;
use http::{
    header::{AUTHORIZATION, CONTENT_TYPE},
    request, HeaderName, HeaderValue, Method,
};
use tokio::{sync::oneshot, task::JoinHandle};
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::{
    collaborators::{Collaborators, InMemoryKeywords, MonitorSwitch},
    config::ConfigStore,
    dispatch,
    metrics::SampledMetrics,
    routes,
    settings::{JsonSettingsStore, SettingsStore},
    AppState,
};

pub const SETTINGS_FILE: &str = "settings.json";

pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Settings file; defaults to `settings.json` in the data directory.
    pub settings_path: Option<PathBuf>,
    pub data_dir: Option<PathBuf>,
    /// How long in-flight requests may run after shutdown is requested.
    pub shutdown_grace: Duration,
    pub sample_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: std::env::var("WATCHPOST_HOST").unwrap_or_else(|_| "127.0.0.1".into()),
            port: std::env::var("WATCHPOST_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(8888),
            settings_path: std::env::var("WATCHPOST_SETTINGS").ok().map(PathBuf::from),
            data_dir: std::env::var("WATCHPOST_DATA_DIR").ok().map(PathBuf::from),
            shutdown_grace: Duration::from_secs(5),
            sample_interval: Duration::from_secs(10),
        }
    }
}

/// Returns the data directory, creating it if needed. Without an override
/// this is the platform data dir (e.g. `~/.local/share/watchpost`).
pub fn resolve_data_dir(override_dir: Option<&PathBuf>) -> Result<PathBuf> {
    let dir = match override_dir {
        Some(d) => d.clone(),
        None => ProjectDirs::from("", "", "watchpost")
            .context("could not determine a home directory for the data dir")?
            .data_dir()
            .to_path_buf(),
    };
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("create data dir {}", dir.display()))?;
    Ok(dir)
}

/// Settings file location for `cfg`.
pub fn settings_path(cfg: &ServerConfig) -> Result<PathBuf> {
    match &cfg.settings_path {
        Some(p) => Ok(p.clone()),
        None => Ok(resolve_data_dir(cfg.data_dir.as_ref())?.join(SETTINGS_FILE)),
    }
}

/// The full application: route table behind the gate, CORS and tracing.
pub fn build_app(state: AppState) -> Router {
    let cors = build_cors(state.config.clone());
    routes::router()
        .layer(middleware::from_fn_with_state(state.clone(), dispatch::gate))
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

fn build_cors(config: Arc<ConfigStore>) -> CorsLayer {
    CorsLayer::new()
        .allow_origin(AllowOrigin::predicate(
            move |origin: &HeaderValue, _: &request::Parts| {
                origin
                    .to_str()
                    .is_ok_and(|o| config.current().allows_origin(o))
            },
        ))
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([
            CONTENT_TYPE,
            AUTHORIZATION,
            HeaderName::from_static("x-session-token"),
        ])
        .allow_credentials(true)
}

// ── Lifecycle ─────────────────────────────────────────────────────────────────

/// A running server. Dropping the handle leaves the server running until the
/// runtime stops; call [`ServerHandle::shutdown`] to stop it.
pub struct ServerHandle {
    addr: SocketAddr,
    grace: Duration,
    stop: Option<oneshot::Sender<()>>,
    server: Option<JoinHandle<Result<()>>>,
    sampler: Option<JoinHandle<()>>,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Stops accepting connections and waits up to the grace period for
    /// in-flight requests. Later calls are no-ops.
    pub async fn shutdown(&mut self) -> Result<()> {
        if let Some(sampler) = self.sampler.take() {
            sampler.abort();
        }
        if let Some(stop) = self.stop.take() {
            // The server may already have exited on its own.
            let _ = stop.send(());
        }
        let Some(mut server) = self.server.take() else {
            return Ok(());
        };
        match tokio::time::timeout(self.grace, &mut server).await {
            Ok(Ok(result)) => {
                info!(addr = %self.addr, "server stopped");
                result
            }
            Ok(Err(e)) => Err(anyhow::anyhow!("server task failed: {e}")),
            Err(_) => {
                warn!(grace = ?self.grace, "grace period elapsed, abandoning in-flight requests");
                server.abort();
                Ok(())
            }
        }
    }
}

/// Builds the default collaborators and state for `cfg`, then starts serving.
pub async fn spawn(cfg: ServerConfig) -> Result<ServerHandle> {
    let store = JsonSettingsStore::new(settings_path(&cfg)?);
    info!(settings = %store.path().display(), "using settings file");
    let settings: Arc<dyn SettingsStore> = Arc::new(store);

    let metrics = Arc::new(SampledMetrics::default());
    let collaborators = Collaborators {
        metrics: metrics.clone(),
        keywords: Arc::new(InMemoryKeywords::with_keywords(seed_keywords(
            settings.as_ref(),
        ))),
        monitor: Arc::new(MonitorSwitch::default()),
    };
    let state = AppState::new(settings, collaborators);

    let mut handle = spawn_with_state(&cfg, state).await?;
    handle.sampler = Some(metrics.spawn_sampler(cfg.sample_interval));
    Ok(handle)
}

/// Starts serving `state` on `cfg.host:cfg.port`.
pub async fn spawn_with_state(cfg: &ServerConfig, state: AppState) -> Result<ServerHandle> {
    let policy = state.config.current();
    if policy.required_key().is_none() {
        warn!("no API key configured, protected routes are open");
    }

    let addr: SocketAddr = format!("{}:{}", cfg.host, cfg.port)
        .parse()
        .context("invalid host/port")?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("bind listener")?;
    let addr = listener.local_addr().context("listener address")?;
    info!(%addr, "watchpost server listening");

    let app = build_app(state);
    let (stop, stopped) = oneshot::channel::<()>();
    let server = tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            let _ = stopped.await;
        })
        .await
        .context("server error")
    });

    Ok(ServerHandle {
        addr,
        grace: cfg.shutdown_grace,
        stop: Some(stop),
        server: Some(server),
        sampler: None,
    })
}

/// Serves until ctrl-c, then shuts down gracefully.
pub async fn run(cfg: ServerConfig) -> Result<()> {
    let mut handle = spawn(cfg).await?;
    tokio::signal::ctrl_c()
        .await
        .context("listen for shutdown signal")?;
    info!("shutdown requested");
    handle.shutdown().await
}

/// Keywords listed under `keywords` in the settings document.
fn seed_keywords(settings: &dyn SettingsStore) -> Vec<String> {
    match settings.section("keywords") {
        Ok(Some(serde_json::Value::Array(items))) => items
            .into_iter()
            .filter_map(|v| v.as_str().map(str::to_owned))
            .collect(),
        Ok(_) => Vec::new(),
        Err(e) => {
            warn!(error = %e, "could not read keywords from settings");
            Vec::new()
        }
    }
}
