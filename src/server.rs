//! WebSocket task stream server + health endpoint.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
    routing::get,
};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::builtin;
use crate::config::WorkerConfig;
use crate::error::{Result, SessionError};
use crate::executor::Executor;
use crate::protocol::{self, Envelope, Inbound};
use crate::session::{Session, SessionConfig};

/// Outbound envelopes buffered per connection before handlers back off.
const OUTBOUND_BUFFER: usize = 64;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub executor: Arc<Executor>,
    pub session_config: SessionConfig,
    /// Cancelled on process shutdown; drains every session.
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(executor: Arc<Executor>, config: &WorkerConfig, shutdown: CancellationToken) -> Self {
        Self {
            executor,
            session_config: SessionConfig::from(config),
            shutdown,
        }
    }
}

/// Build the Axum router with the task stream and health routes.
pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health))
        .with_state(state)
}

/// Build the worker from `config`, bind its address and serve until shutdown.
pub async fn run(config: &WorkerConfig, shutdown: CancellationToken) -> Result<()> {
    let registry = builtin::worker_registry(config)?;
    let executor = Arc::new(Executor::new(Arc::new(registry), config.max_concurrency));

    let listener = TcpListener::bind(config.listen_addr()).await?;
    info!(
        addr = %listener.local_addr()?,
        handlers = executor.registry().len(),
        max_concurrency = executor.max_concurrency(),
        "Task stream server started"
    );

    serve(listener, AppState::new(executor, config, shutdown)).await?;
    info!("Server stopped");
    Ok(())
}

/// Serve until the shutdown token is cancelled.
pub async fn serve(listener: TcpListener, state: AppState) -> std::io::Result<()> {
    let shutdown = state.shutdown.clone();
    let app = routes(state);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}

// ── Health ──────────────────────────────────────────────────────────────

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let handlers: Vec<String> = state
        .executor
        .registry()
        .keys()
        .iter()
        .map(ToString::to_string)
        .collect();
    Json(serde_json::json!({
        "status": if state.shutdown.is_cancelled() { "draining" } else { "ok" },
        "service": "wep",
        "max_concurrency": state.executor.max_concurrency(),
        "in_flight": state.executor.in_flight(),
        "available_slots": state.executor.available_slots(),
        "handlers": handlers,
    }))
}

// ── WebSocket ───────────────────────────────────────────────────────────

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    info!("Task stream connecting");
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut sink, stream) = socket.split();
    let (tx, mut rx) = mpsc::channel::<Envelope>(OUTBOUND_BUFFER);

    // Writer: forward session output to the socket until every sender is gone.
    let writer = tokio::spawn(async move {
        while let Some(envelope) = rx.recv().await {
            let text = match protocol::encode(&envelope) {
                Ok(text) => text,
                Err(e) => {
                    error!(error = %e, kind = envelope.kind(), "Failed to encode envelope");
                    continue;
                }
            };
            if sink.send(Message::Text(text.into())).await.is_err() {
                debug!("Client disconnected during send");
                break;
            }
        }
        let _ = sink.close().await;
    });

    let inbound = stream.filter_map(|frame| futures::future::ready(read_frame(frame)));

    let session = Session::new(
        Arc::clone(&state.executor),
        state.session_config.clone(),
        state.shutdown.clone(),
    );
    let session_id = session.id();

    match session.run(inbound, tx).await {
        Ok(summary) => info!(
            session_id = %session_id,
            completed = summary.completed,
            abandoned = summary.abandoned.len(),
            "Task stream closed"
        ),
        Err(e) => warn!(session_id = %session_id, error = %e, "Task stream terminated"),
    }

    if let Err(e) = writer.await {
        warn!(session_id = %session_id, error = %e, "Writer task failed");
    }
}

/// Map one socket frame to an inbound item. A frame that cannot be read as a
/// typed message becomes a protocol error, which ends the session.
fn read_frame(
    frame: std::result::Result<Message, axum::Error>,
) -> Option<std::result::Result<Inbound, SessionError>> {
    let decoded = match frame {
        Ok(Message::Text(text)) => protocol::decode_frame(text.as_str()),
        Ok(Message::Binary(bytes)) => protocol::decode_frame_bytes(&bytes),
        // Pings are answered by the socket itself; Close ends the stream.
        Ok(Message::Ping(_) | Message::Pong(_) | Message::Close(_)) => return None,
        Err(e) => return Some(Err(SessionError::Read(e.to_string()))),
    };
    Some(decoded.map_err(SessionError::from))
}
