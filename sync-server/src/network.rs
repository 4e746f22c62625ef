//! HTTP/WebSocket server and heartbeat wiring

use std::error::Error;
use std::future::Future;
use std::sync::Arc;

use axum::extract::State;
use axum::http::{HeaderValue, Method};
use axum::routing::get;
use axum::{Json, Router};
use loopsync_core::{spawn_heartbeat, StatusReport, SyncEngine};
use parking_lot::RwLock;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tracing::{info, warn};

use crate::config::{AllowedOrigins, ServerConfig};
use crate::metrics::{LogLevel, Metrics, ServerStatus};
use crate::ws::{self, AppState};

pub type BoxError = Box<dyn Error + Send + Sync>;

/// Build the router: `/ws`, `/status` and `/health`
pub fn router(state: AppState) -> Router {
    let cors = cors_layer(&state.origins);
    Router::new()
        .route("/ws", get(ws::ws_handler))
        .route("/status", get(status))
        .route("/health", get(health))
        .layer(cors)
        .with_state(state)
}

fn cors_layer(origins: &AllowedOrigins) -> CorsLayer {
    let layer = CorsLayer::new().allow_methods([Method::GET]);
    match origins {
        AllowedOrigins::Any => layer.allow_origin(Any),
        AllowedOrigins::List(list) => {
            let values: Vec<HeaderValue> = list
                .iter()
                .filter_map(|origin| match HeaderValue::from_str(origin) {
                    Ok(value) => Some(value),
                    Err(_) => {
                        warn!("Skipping unusable origin {:?} for CORS", origin);
                        None
                    }
                })
                .collect();
            layer.allow_origin(AllowOrigin::list(values))
        }
    }
}

async fn status(State(state): State<AppState>) -> Json<StatusReport> {
    Json(state.engine.status())
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

/// Serve on an already bound listener until `shutdown` resolves
pub async fn serve(
    listener: TcpListener,
    engine: Arc<SyncEngine>,
    config: &ServerConfig,
    metrics: Arc<RwLock<Metrics>>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<(), BoxError> {
    let state = AppState::new(Arc::clone(&engine), Arc::clone(&metrics), config.allowed_origins.clone());
    let heartbeat = spawn_heartbeat(Arc::clone(&engine));

    let result = axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await;

    heartbeat.stop().await;
    {
        let mut m = metrics.write();
        match &result {
            Ok(()) => m.log(LogLevel::Info, "Server stopped"),
            Err(err) => {
                m.status = ServerStatus::Error;
                m.log(LogLevel::Error, format!("Server error: {}", err));
            }
        }
    }
    info!("Server stopped");
    result.map_err(Into::into)
}

/// Bind and run the server
pub async fn run(
    config: ServerConfig,
    engine: Arc<SyncEngine>,
    metrics: Arc<RwLock<Metrics>>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<(), BoxError> {
    info!("LoopSync server starting...");

    {
        let mut m = metrics.write();
        m.loop_duration_secs = config.loop_duration.as_secs();
        m.allowed_origins = config.allowed_origins.describe();
    }

    let addr = config.socket_addr();
    let listener = match TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(err) => {
            let mut m = metrics.write();
            m.status = ServerStatus::Error;
            m.log(LogLevel::Error, format!("Failed to bind {}: {}", addr, err));
            return Err(err.into());
        }
    };

    info!(
        "Listening on {} (loop {:.2}s, origins: {})",
        addr,
        config.loop_duration.as_secs(),
        config.allowed_origins.describe()
    );
    {
        let mut m = metrics.write();
        m.listen_addr = Some(addr.to_string());
        m.status = ServerStatus::Running;
        m.log(LogLevel::Info, format!("Listening on {}", addr));
    }

    serve(listener, engine, &config, metrics, shutdown).await
}

/// Run with plain logging (no dashboard)
pub async fn run_with_logging(
    config: ServerConfig,
    engine: Arc<SyncEngine>,
    metrics: Arc<RwLock<Metrics>>,
) -> Result<(), BoxError> {
    // Initialize tracing for logging mode
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("loopsync_server=info".parse()?)
                .add_directive("loopsync_core=info".parse()?),
        )
        .init();

    let shutdown = async {
        if tokio::signal::ctrl_c().await.is_err() {
            warn!("Could not listen for ctrl-c");
            std::future::pending::<()>().await;
        }
        info!("Shutting down");
    };

    run(config, engine, metrics, shutdown).await
}
