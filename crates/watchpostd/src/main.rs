use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rand::{rngs::OsRng, RngCore};
use tracing_subscriber::EnvFilter;
use watchpost_server::{server::settings_path, JsonSettingsStore, ServerConfig};

// ── CLI definition ─────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(
    name = "watchpostd",
    about = "Watchpostd — local control-plane server for the monitoring app",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP control plane
    Serve {
        /// Port to listen on (default: $WATCHPOST_PORT or 8888)
        #[arg(long, env = "WATCHPOST_PORT", default_value = "8888")]
        port: u16,
        /// Host to bind (default: $WATCHPOST_HOST or 127.0.0.1)
        #[arg(long, env = "WATCHPOST_HOST", default_value = "127.0.0.1")]
        host: String,
        /// Log level: error, warn, info, debug, verbose (default: $WATCHPOST_LOG_LEVEL or warn)
        #[arg(long, env = "WATCHPOST_LOG_LEVEL")]
        log_level: Option<String>,
        #[command(flatten)]
        paths: PathArgs,
        /// How long in-flight requests may finish after ctrl-c, e.g. "5s"
        #[arg(long, env = "WATCHPOST_SHUTDOWN_GRACE", default_value = "5s")]
        grace: humantime::Duration,
        /// Interval between metrics samples, e.g. "10s"
        #[arg(long, default_value = "10s")]
        sample_every: humantime::Duration,
    },
    /// Print the effective security policy read from the settings file
    Config {
        #[command(flatten)]
        paths: PathArgs,
    },
    /// Generate a random API key for `web_api_security.api_key`
    Keygen {
        /// Key length in bytes before hex encoding
        #[arg(long, default_value_t = 32)]
        bytes: usize,
    },
}

#[derive(clap::Args)]
struct PathArgs {
    /// Settings file (default: $WATCHPOST_SETTINGS or <data dir>/settings.json)
    #[arg(long, env = "WATCHPOST_SETTINGS")]
    settings: Option<PathBuf>,
    /// Data directory (default: $WATCHPOST_DATA_DIR or the platform data dir)
    #[arg(long, env = "WATCHPOST_DATA_DIR")]
    data_dir: Option<PathBuf>,
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env is fine.
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    let effective_log_level = if let Commands::Serve { ref log_level, .. } = cli.command {
        let raw = log_level
            .clone()
            .or_else(|| std::env::var("WATCHPOST_LOG_LEVEL").ok())
            .unwrap_or_else(|| "warn".into());
        if raw.eq_ignore_ascii_case("verbose") {
            "debug".to_owned()
        } else {
            raw
        }
    } else {
        std::env::var("WATCHPOST_LOG_LEVEL").unwrap_or_else(|_| "warn".into())
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(&effective_log_level))
        .init();

    match cli.command {
        Commands::Serve {
            port,
            host,
            log_level: _,
            paths,
            grace,
            sample_every,
        } => {
            let cfg = ServerConfig {
                host,
                port,
                settings_path: paths.settings,
                data_dir: paths.data_dir,
                shutdown_grace: grace.into(),
                sample_interval: sample_every.into(),
            };
            cmd_serve(cfg).await
        }
        Commands::Config { paths } => cmd_config(paths),
        Commands::Keygen { bytes } => cmd_keygen(bytes),
    }
}

// ── Command implementations ───────────────────────────────────────────────────

async fn cmd_serve(cfg: ServerConfig) -> Result<()> {
    let no_banner = std::env::var("NO_BANNER")
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false);
    if !no_banner {
        eprintln!(
            "watchpostd {} on http://{}:{}",
            env!("CARGO_PKG_VERSION"),
            cfg.host,
            cfg.port
        );
    }
    tracing::info!(
        grace = ?cfg.shutdown_grace,
        sample_interval = ?cfg.sample_interval,
        "starting control plane"
    );
    watchpost_server::run(cfg).await
}

fn cmd_config(paths: PathArgs) -> Result<()> {
    let cfg = ServerConfig {
        settings_path: paths.settings,
        data_dir: paths.data_dir,
        ..Default::default()
    };
    let path = settings_path(&cfg)?;
    let store = JsonSettingsStore::new(&path);
    let policy = watchpost_server::config::load(&store)
        .with_context(|| format!("load security policy from {}", path.display()))?;

    let mut report = serde_json::to_value(&policy).context("serialize policy")?;
    report["api_key_set"] = serde_json::Value::Bool(policy.required_key().is_some());
    println!("# {}", path.display());
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn cmd_keygen(bytes: usize) -> Result<()> {
    anyhow::ensure!((16..=128).contains(&bytes), "key length must be 16–128 bytes");
    let mut key = vec![0u8; bytes];
    OsRng.fill_bytes(&mut key);
    println!("{}", hex::encode(key));
    eprintln!("set this as web_api_security.api_key and enable_api_key = true");
    Ok(())
}
