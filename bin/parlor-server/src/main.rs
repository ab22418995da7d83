//! parlor-server – entry point.
//!
//! Startup order:
//! 1. Parse configuration from environment variables.
//! 2. Initialise structured tracing (JSON or pretty, stdout or rolling file).
//! 3. Open the SQLite database and run pending migrations.
//! 4. Build the upstream provider, push hub and orchestrator.
//! 5. Serve HTTP until SIGINT/SIGTERM, then drain live operations before
//!    closing event streams.

mod config;
mod error;
mod middleware;
mod routes;
mod schemas;
mod state;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parlor_core::gate::OpenGate;
use parlor_core::upstream::openai::OpenAiProvider;
use parlor_core::{Orchestrator, PushHub, SqliteStore};
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::fmt::writer::BoxMakeWriter;

use crate::config::Config;
use crate::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Configuration ───────────────────────────────────────────────────────
    let cfg = Config::from_env();

    // ── 2. Tracing ─────────────────────────────────────────────────────────────
    // The guard flushes the file writer on drop; keep it for the whole run.
    let _log_guard = init_tracing(&cfg);
    info!(version = env!("CARGO_PKG_VERSION"), "parlor-server starting");

    // ── 3. Database ────────────────────────────────────────────────────────────
    let store = Arc::new(SqliteStore::connect(&cfg.database_url, cfg.db_max_connections).await?);
    info!(database_url = %cfg.database_url, "database ready");

    // ── 4. Orchestrator ────────────────────────────────────────────────────────
    if cfg.provider_api_key.is_none() {
        warn!("PARLOR_PROVIDER_API_KEY is not set; upstream calls will be unauthenticated");
    }
    let provider = OpenAiProvider::new(cfg.provider_config())?;
    let hub = Arc::new(PushHub::new());
    let orchestrator = Orchestrator::new(
        Arc::clone(&store),
        hub.clone(),
        Arc::new(provider),
        Arc::new(OpenGate),
        cfg.orchestrator_settings(),
    );
    info!(model = %cfg.model, provider_url = %cfg.provider_url, "orchestrator ready");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let state = Arc::new(AppState {
        config: Arc::new(cfg.clone()),
        store,
        hub,
        orchestrator: orchestrator.clone(),
        shutdown: shutdown_rx,
    });

    // ── 5. HTTP server with graceful shutdown ──────────────────────────────────
    let app = routes::build(Arc::clone(&state));
    let addr: SocketAddr = cfg.bind_address.parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "HTTP server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            drain(&orchestrator, cfg.shutdown_grace).await;
            // Event streams end here, after the final done/error events.
            let _ = shutdown_tx.send(true);
        })
        .await?;

    info!("parlor-server stopped");
    Ok(())
}

fn init_tracing(cfg: &Config) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    // RUST_LOG wins; then PARLOR_LOG, warning loudly if it does not parse.
    let env_filter = match tracing_subscriber::EnvFilter::try_from_default_env() {
        Ok(f) => f,
        Err(_) => match cfg.log_level.parse::<tracing_subscriber::EnvFilter>() {
            Ok(f) => f,
            Err(e) => {
                eprintln!(
                    "WARN: PARLOR_LOG='{}' is not a valid tracing filter ({}); \
                     falling back to 'info'",
                    cfg.log_level, e
                );
                tracing_subscriber::EnvFilter::new("info")
            }
        },
    };

    let (writer, guard) = match &cfg.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "parlor-server.log");
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            (BoxMakeWriter::new(non_blocking), Some(guard))
        }
        None => (BoxMakeWriter::new(std::io::stdout), None),
    };

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .with_thread_ids(true)
        .with_writer(writer);

    if cfg.log_json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
    guard
}

async fn drain<S: parlor_core::store::ChatStore>(orchestrator: &Orchestrator<S>, grace: Duration) {
    let live = orchestrator.registry().len();
    if orchestrator.drain(grace).await {
        info!(live, "all operations finalized");
    } else {
        warn!(
            live,
            grace_secs = grace.as_secs(),
            "shutdown grace elapsed with operations still finalizing"
        );
    }
}

/// Returns a future that resolves when SIGINT (Ctrl-C) or SIGTERM is received.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to install CTRL+C signal handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut s) => {
                s.recv().await;
            }
            Err(e) => warn!(error = %e, "failed to install SIGTERM handler"),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("shutdown signal received; draining operations");
}
