use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use sca_store::SqliteStore;

use crate::config::Config;
use crate::jobs::{JobCoordinator, JobDispatcher};
use crate::notify::EventBus;
use crate::solver::{DirectoryResolver, SyntheticSolver};

mod api;
mod config;
mod jobs;
mod notify;
mod solver;
#[cfg(test)]
mod testing;

// =============================================================================
// CLI
// =============================================================================

#[derive(Parser)]
#[command(
    name = "sca-hub",
    version,
    about = "Short-circuit analysis job service"
)]
struct Args {
    /// Server bind address
    #[arg(long, default_value = "127.0.0.1:3000")]
    bind: String,

    /// Path to config file
    #[arg(long, default_value = "sca-hub.toml")]
    config: PathBuf,

    /// SQLite database file, overrides `[storage] path`
    #[arg(long)]
    database: Option<PathBuf>,

    /// Dataset directory, overrides `[datasets] dir`
    #[arg(long)]
    datasets: Option<PathBuf>,
}

// =============================================================================
// Application State
// =============================================================================

pub struct AppState {
    pub coordinator: Arc<JobCoordinator>,
    pub events: EventBus,
    pub start_time: Instant,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "sca_hub=info,sca_store=info,tower_http=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    let mut config = Config::load(&args.config);
    if let Some(path) = args.database {
        config.storage.path = path;
    }
    if let Some(dir) = args.datasets {
        config.datasets.dir = dir;
    }

    let store = match SqliteStore::open(&config.storage.path) {
        Ok(store) => store,
        Err(e) => {
            tracing::error!(path = %config.storage.path.display(), error = %e, "failed to open result store");
            std::process::exit(1);
        }
    };

    let events = EventBus::new(config.server.event_buffer);
    let resolver = DirectoryResolver::new(config.datasets.dir.clone());
    tracing::info!(root = %resolver.root().display(), "dataset directory");

    let (queue, signals) = mpsc::channel(config.jobs.queue_capacity.max(1));
    let coordinator = Arc::new(JobCoordinator::new(
        store,
        Arc::new(resolver),
        Arc::new(SyntheticSolver),
        Arc::new(events.clone()),
        queue,
        config.policy(),
    ));

    let shutdown = CancellationToken::new();
    let dispatcher = JobDispatcher::new(
        coordinator.clone(),
        signals,
        config.jobs.workers,
        shutdown.clone(),
    )
    .spawn();

    let state = Arc::new(AppState {
        coordinator,
        events,
        start_time: Instant::now(),
    });

    let app = router(state);

    let addr: SocketAddr = args.bind.parse().expect("Invalid bind address");
    tracing::info!("sca-hub listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("Failed to bind");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await
        .expect("Server error");

    shutdown.cancel();
    if let Err(e) = dispatcher.await {
        tracing::warn!(error = %e, "dispatcher task ended abnormally");
    }
    tracing::info!("sca-hub stopped");
}

fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/health", get(api::health))
        .route("/api/jobs", post(api::submit_job).delete(api::delete_all_jobs))
        .route("/api/jobs/invalidate", post(api::invalidate_jobs))
        .route("/api/jobs/:id", get(api::get_job).delete(api::delete_job))
        .route("/api/jobs/:id/status", get(api::job_status))
        .route("/api/jobs/:id/cancel", post(api::cancel_job))
        .route("/api/jobs/:id/results/query", post(api::query_results))
        .route("/ws", get(ws_handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn shutdown_signal(shutdown: CancellationToken) {
    tokio::select! {
        _ = shutdown.cancelled() => {}
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                tracing::error!(error = %e, "failed to listen for ctrl-c");
            }
            tracing::info!("shutdown requested");
            shutdown.cancel();
        }
    }
}

// =============================================================================
// WebSocket
// =============================================================================

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Forwards lifecycle events as JSON text frames until the client goes away.
async fn handle_socket(mut socket: WebSocket, state: Arc<AppState>) {
    let mut events = state.events.subscribe();

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => {
                    let json = match serde_json::to_string(&event) {
                        Ok(json) => json,
                        Err(e) => {
                            tracing::warn!(job_id = %event.job_id(), error = %e, "event not serializable");
                            continue;
                        }
                    };
                    if socket.send(Message::Text(json)).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "ws client lagging, events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }
}
