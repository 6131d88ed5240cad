use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{
    extract::{MatchedPath, Request},
    middleware,
    routing::{delete, get, post},
    Router,
};
use directories::ProjectDirs;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{info, info_span, warn};

use crate::{
    auth::require_token,
    broker::Broker,
    handlers::{
        audit_events, create_secret, health, index, prune_secrets, revoke_secret, view_secret,
    },
    store::{FileStore, MemoryStore, RecordStore, RedbAuditLog},
    AppState, CreatePolicy,
};

const AUDIT_DB: &str = "audit.redb";
const RECORDS_DIR: &str = "records";

/// Where secret records live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    /// Sealed JSON files under `<data_dir>/records`. Survives restarts.
    File,
    /// Process memory. Everything is lost on restart.
    Memory,
}

impl FromStr for StoreBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "file" => Ok(Self::File),
            "memory" => Ok(Self::Memory),
            other => Err(format!("unknown store backend: {other} (expected file or memory)")),
        }
    }
}

pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Bearer token for the management API ($VANISH_API_TOKEN).
    pub api_token: Option<String>,
    pub data_dir: Option<PathBuf>,
    /// Base URL for one-time links. Defaults to `http://{host}:{port}`.
    pub public_url: Option<String>,
    pub store: StoreBackend,
    pub default_ttl: Duration,
    pub max_ttl: Duration,
    pub sweep_interval: Duration,
    pub burn_after_reading: bool,
    pub audit_retention_days: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: std::env::var("VANISH_HOST").unwrap_or_else(|_| "0.0.0.0".into()),
            port: std::env::var("VANISH_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(8080),
            api_token: std::env::var("VANISH_API_TOKEN").ok(),
            data_dir: std::env::var("VANISH_DATA_DIR").ok().map(PathBuf::from),
            public_url: std::env::var("VANISH_PUBLIC_URL").ok(),
            store: std::env::var("VANISH_STORE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(StoreBackend::File),
            default_ttl: env_duration("VANISH_DEFAULT_TTL", Duration::from_secs(3600)),
            max_ttl: env_duration("VANISH_MAX_TTL", Duration::from_secs(86_400)),
            sweep_interval: env_duration("VANISH_SWEEP_INTERVAL", Duration::from_secs(300)),
            burn_after_reading: std::env::var("VANISH_BURN_AFTER_READING")
                .map(|v| v != "false" && v != "0")
                .unwrap_or(true),
            audit_retention_days: std::env::var("VANISH_AUDIT_RETENTION_DAYS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(30),
        }
    }
}

impl ServerConfig {
    fn policy(&self) -> CreatePolicy {
        CreatePolicy {
            default_ttl: self.default_ttl,
            max_ttl: self.max_ttl,
            burn_after_reading: self.burn_after_reading,
        }
    }

    fn link_base(&self) -> String {
        match &self.public_url {
            Some(url) => url.trim_end_matches('/').to_owned(),
            None => format!("http://{}:{}", self.host, self.port),
        }
    }
}

fn env_duration(name: &str, default: Duration) -> Duration {
    std::env::var(name)
        .ok()
        .and_then(|v| humantime::parse_duration(&v).ok())
        .unwrap_or(default)
}

fn retention_seconds(days: u64) -> i64 {
    i64::try_from(days.saturating_mul(86_400)).unwrap_or(i64::MAX)
}

/// Resolve the data directory, creating it if needed. Without an explicit
/// directory (`--data-dir` or `VANISH_DATA_DIR`) the platform data dir is used,
/// e.g. `~/.local/share/vanish/`.
pub fn resolve_data_dir(data_dir: Option<&PathBuf>) -> Result<PathBuf> {
    let path = match data_dir {
        Some(d) => d.clone(),
        None => ProjectDirs::from("", "", "vanish")
            .context("could not determine platform data directory")?
            .data_dir()
            .to_owned(),
    };
    std::fs::create_dir_all(&path)
        .with_context(|| format!("create data dir {}", path.display()))?;
    Ok(path)
}

/// Public front door plus the token-protected management API.
pub fn router(state: AppState) -> Router {
    let public = Router::new()
        .route("/", get(index))
        .route("/health", get(health))
        .route("/view/{handle}", get(view_secret));

    let protected = Router::new()
        .route("/secrets", post(create_secret))
        .route("/secrets/{handle}", delete(revoke_secret))
        .route("/prune", post(prune_secrets))
        .route("/audit", get(audit_events))
        .layer(middleware::from_fn_with_state(state.clone(), require_token));

    // Spans carry the route template so handles never reach the logs.
    let trace = TraceLayer::new_for_http().make_span_with(|req: &Request| {
        let path = req
            .extensions()
            .get::<MatchedPath>()
            .map(MatchedPath::as_str);
        info_span!("http_request", method = %req.method(), path)
    });

    Router::new()
        .merge(public)
        .merge(protected)
        .with_state(state)
        .layer(trace)
}

pub async fn run(cfg: ServerConfig) -> Result<()> {
    if cfg.max_ttl.is_zero() || cfg.default_ttl.is_zero() || cfg.default_ttl > cfg.max_ttl {
        anyhow::bail!("default TTL must be non-zero and no greater than max TTL");
    }

    let data_dir = resolve_data_dir(cfg.data_dir.as_ref())?;
    info!(data_dir = %data_dir.display(), "using data directory");

    let audit_db = RedbAuditLog::open(&data_dir.join(AUDIT_DB)).context("open audit log")?;

    let store: Arc<dyn RecordStore> = match cfg.store {
        StoreBackend::File => {
            Arc::new(FileStore::open(&data_dir.join(RECORDS_DIR)).context("open record store")?)
        }
        StoreBackend::Memory => {
            warn!("using in-memory record store; secrets will not survive a restart");
            Arc::new(MemoryStore::new())
        }
    };
    // The writer outlives the sweeps so their last events are committed.
    let writer_cancel = CancellationToken::new();
    let (audit, audit_writer) = audit_db.clone().spawn_writer(writer_cancel.clone());
    let broker = Broker::new(store, Arc::new(audit));

    // Background sweeps only reclaim space; reads check deadlines themselves.
    let cancel = CancellationToken::new();
    let sweep = broker.spawn_sweep(cfg.sweep_interval, cancel.clone());
    let retention_secs = retention_seconds(cfg.audit_retention_days);
    let retention =
        audit_db.spawn_retention_sweep(cfg.sweep_interval, retention_secs, cancel.clone());

    if cfg.api_token.is_none() {
        warn!("VANISH_API_TOKEN is not set; the management API is unauthenticated");
    }

    let state = AppState {
        broker,
        api_token: cfg.api_token.clone(),
        public_url: cfg.link_base(),
        policy: cfg.policy(),
    };
    let app = router(state);

    let addr: SocketAddr = format!("{}:{}", cfg.host, cfg.port)
        .parse()
        .context("invalid host/port")?;

    info!(
        %addr,
        store = ?cfg.store,
        default_ttl = %humantime::format_duration(cfg.default_ttl),
        burn_after_reading = cfg.burn_after_reading,
        "vanish server listening"
    );
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("bind listener")?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(cancel.clone()))
        .await
        .context("server error")?;

    cancel.cancel();
    let _ = tokio::join!(sweep, retention);
    writer_cancel.cancel();
    if let Err(e) = audit_writer.await {
        warn!(error = %e, "audit writer did not shut down cleanly");
    }
    info!("server stopped");
    Ok(())
}

/// Resolves on Ctrl-C or SIGTERM and cancels `cancel`.
async fn shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown signal received");
    cancel.cancel();
}
