pub mod audit;
pub mod auth;
pub mod cache;
pub mod collaborators;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod handlers;
pub mod limiter;
pub mod metrics;
pub mod routes;
pub mod server;
pub mod settings;

use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Default bound on a single collaborator call.
pub const DEFAULT_COLLABORATOR_TIMEOUT: Duration = Duration::from_secs(2);

/// Shared application state threaded through axum handlers.
#[derive(Clone)]
pub struct AppState {
    /// Live security policy, swapped on reload.
    pub config: Arc<config::ConfigStore>,
    pub auth: Arc<auth::Authenticator>,
    pub limiter: Arc<limiter::Limiter>,
    pub cache: Arc<cache::ResponseCache>,
    pub audit: Arc<audit::AuditLogs>,
    pub collaborators: collaborators::Collaborators,
    pub started_at: Instant,
    /// Every request seen by the gate, admitted or not.
    pub request_count: Arc<AtomicU64>,
    pub collaborator_timeout: Duration,
}

impl AppState {
    pub fn new(
        settings: Arc<dyn settings::SettingsStore>,
        collaborators: collaborators::Collaborators,
    ) -> Self {
        Self {
            config: Arc::new(config::ConfigStore::new(settings)),
            auth: Arc::new(auth::Authenticator::new()),
            limiter: Arc::new(limiter::Limiter::new()),
            cache: Arc::new(cache::ResponseCache::new()),
            audit: Arc::new(audit::AuditLogs::default()),
            collaborators,
            started_at: Instant::now(),
            request_count: Arc::new(AtomicU64::new(0)),
            collaborator_timeout: DEFAULT_COLLABORATOR_TIMEOUT,
        }
    }
}

pub use config::SecurityConfig;
pub use server::{
    build_app, resolve_data_dir, run, spawn, spawn_with_state, ServerConfig, ServerHandle,
};
pub use settings::{JsonSettingsStore, SettingsStore};
