//! HTTP/WebSocket server wiring the registry, dispatcher, executor and
//! gateway together. One WebSocket connection is one session; closing the
//! socket tears the session down and cancels its jobs best-effort.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use axum::{
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    extract::State,
    response::{IntoResponse, Json},
    routing::get,
    Router,
};
use serde::Serialize;
use serde_json::json;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::{
    dispatcher::{DispatchResult, Dispatcher, FunctionCall},
    executor::{ExecutorConfig, JobExecutor},
    gateway::{ClientRequest, EventGateway, Routed},
    plugins,
    registry::Registry,
    session::SessionManager,
    settings::Settings,
};

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<Registry>,
    pub dispatcher: Arc<Dispatcher>,
    pub sessions: Arc<SessionManager>,
    pub executor: Arc<JobExecutor>,
    pub gateway: Arc<EventGateway>,
    pub settings: Settings,
}

impl AppState {
    /// Wire up the full platform: register the standard plugins, start the
    /// executor and its expiry sweep.
    pub fn build(settings: Settings) -> Self {
        let mut registry = Registry::new();
        registry.register_all(plugins::default_plugins());
        let registry = Arc::new(registry);
        info!(
            plugins = registry.plugin_count(),
            functions = registry.function_count(),
            "plugins registered"
        );

        let gateway = Arc::new(EventGateway::new());
        let sessions = Arc::new(SessionManager::new());
        let executor = Arc::new(JobExecutor::new(
            gateway.clone(),
            sessions.clone(),
            ExecutorConfig {
                workers: settings.executor.workers,
                retention: std::time::Duration::from_secs(settings.executor.retention_seconds),
            },
        ));
        executor.spawn_expiry(std::time::Duration::from_secs(
            settings.executor.sweep_interval_seconds,
        ));

        let dispatcher = Arc::new(Dispatcher::new(
            registry.clone(),
            executor.clone(),
            sessions.clone(),
        ));

        Self {
            registry,
            dispatcher,
            sessions,
            executor,
            gateway,
            settings,
        }
    }
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    plugins: usize,
    functions: usize,
    active_sessions: usize,
    jobs: usize,
}

pub fn create_router(state: AppState) -> Router {
    let mut app = Router::new()
        .route("/health", get(health_check))
        .route("/schema", get(schema))
        .route("/ws", get(ws_handler))
        .with_state(state.clone())
        .layer(TraceLayer::new_for_http());

    if state.settings.server.enable_cors {
        app = app.layer(CorsLayer::permissive());
    }
    app
}

#[instrument(skip(state))]
async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
        plugins: state.registry.plugin_count(),
        functions: state.registry.function_count(),
        active_sessions: state.sessions.count(),
        jobs: state.executor.job_count(),
    })
}

async fn schema(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(state.registry.build_schema())
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let session = state.sessions.open();
    let session_id = session.id;
    let mut events = state.gateway.register(session_id);

    let (mut ws_tx, mut ws_rx) = {
        use futures::StreamExt;
        socket.split()
    };

    let writer = tokio::spawn(async move {
        use futures::SinkExt;
        while let Some(event) = events.recv().await {
            let frame = match serde_json::to_string(&event) {
                Ok(f) => f,
                Err(e) => {
                    warn!(error = %e, "unserializable event dropped");
                    continue;
                }
            };
            if ws_tx.send(Message::Text(frame)).await.is_err() {
                break;
            }
        }
    });

    state
        .gateway
        .send(session_id, "session_started", json!({ "session_id": session_id }))
        .await;

    {
        use futures::StreamExt;
        while let Some(message) = ws_rx.next().await {
            match message {
                Ok(Message::Text(text)) => handle_frame(&state, session_id, &text).await,
                Ok(Message::Close(_)) | Err(_) => break,
                Ok(_) => {} // ping/pong handled by axum, binary ignored
            }
        }
    }

    state.gateway.unregister(session_id);
    let owned = state.sessions.close(session_id).await;
    state.executor.cancel_all(&owned);
    writer.abort();
    debug!(session_id = %session_id, "connection closed");
}

/// Error event name for the flow a function belongs to.
fn error_event_for(function_name: &str) -> &'static str {
    match function_name {
        "generate_image" => "image_generation_error",
        "analyze_document" => "document_analysis_error",
        _ => "function_error",
    }
}

async fn handle_frame(state: &AppState, session_id: Uuid, text: &str) {
    let request: ClientRequest = match serde_json::from_str(text) {
        Ok(r) => r,
        Err(e) => {
            state
                .gateway
                .send(
                    session_id,
                    "error",
                    json!({ "error": { "code": "invalid_request", "message": e.to_string() } }),
                )
                .await;
            return;
        }
    };

    match request.route() {
        Routed::Call {
            function_name,
            arguments,
        } => {
            let error_event = error_event_for(&function_name);
            let call = FunctionCall::new(session_id, function_name.clone(), arguments);
            let call_id = call.call_id;
            match state.dispatcher.dispatch(call).await {
                Ok(DispatchResult::Immediate(result)) => {
                    state
                        .gateway
                        .send(
                            session_id,
                            "function_result",
                            json!({
                                "call_id": call_id,
                                "function_name": function_name,
                                "result": result,
                            }),
                        )
                        .await;
                }
                Ok(DispatchResult::Deferred { job_id }) => {
                    state
                        .gateway
                        .send(
                            session_id,
                            "function_accepted",
                            json!({
                                "call_id": call_id,
                                "function_name": function_name,
                                "job_id": job_id,
                            }),
                        )
                        .await;
                }
                Err(error) => {
                    state
                        .gateway
                        .send(
                            session_id,
                            error_event,
                            json!({ "call_id": call_id, "error": error.to_payload() }),
                        )
                        .await;
                }
            }
        }
        Routed::DeleteDocument { document_id } => {
            let outcome = match state.sessions.get(session_id) {
                Ok(session) => session.delete_document(&document_id).await,
                Err(e) => Err(e),
            };
            match outcome {
                Ok(active_job) => {
                    if let Some(job_id) = active_job {
                        state.executor.cancel(job_id);
                    }
                    state
                        .gateway
                        .send(
                            session_id,
                            "document_deleted",
                            json!({ "document_id": document_id }),
                        )
                        .await;
                }
                Err(error) => {
                    state
                        .gateway
                        .send(
                            session_id,
                            "error",
                            json!({
                                "request": "delete_document_request",
                                "error": error.to_payload(),
                            }),
                        )
                        .await;
                }
            }
        }
        Routed::ClearImageData => {
            let cleared = match state.sessions.get(session_id) {
                Ok(session) => session.clear_last_artifact().await,
                Err(_) => false,
            };
            state
                .gateway
                .send(session_id, "image_data_cleared", json!({ "cleared": cleared }))
                .await;
        }
    }
}

/// Start the server and wait for shutdown signal.
pub async fn serve(settings: Settings, addr_override: Option<SocketAddr>) -> Result<()> {
    let addr: SocketAddr = match addr_override {
        Some(addr) => addr,
        None => format!("{}:{}", settings.server.host, settings.server.port).parse()?,
    };

    let state = AppState::build(settings);
    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(wait_for_shutdown())
        .await?;

    info!("server shutdown complete");
    Ok(())
}

/// Wait for SIGTERM or SIGINT.
async fn wait_for_shutdown() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "cannot install SIGTERM handler");
                return std::future::pending::<()>().await;
            }
        };
        let mut sigint = match signal(SignalKind::interrupt()) {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "cannot install SIGINT handler");
                return std::future::pending::<()>().await;
            }
        };

        tokio::select! {
            _ = sigterm.recv() => info!("received SIGTERM, shutting down"),
            _ = sigint.recv() => info!("received SIGINT, shutting down"),
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "cannot listen for ctrl-c");
            std::future::pending::<()>().await;
        }
        info!("received ctrl-c, shutting down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_events_match_their_flow() {
        assert_eq!(error_event_for("generate_image"), "image_generation_error");
        assert_eq!(error_event_for("analyze_document"), "document_analysis_error");
        assert_eq!(error_event_for("translate_text"), "function_error");
    }

    #[tokio::test]
    async fn state_builds_with_all_standard_plugins() {
        let state = AppState::build(Settings::default());
        assert_eq!(state.registry.plugin_count(), 5);
        assert!(state.registry.resolve("generate_image").is_some());
        assert!(state.registry.resolve("analyze_document").is_some());
        assert!(state.registry.resolve("list_documents").is_some());
        assert!(state.registry.resolve("list_generated_images").is_some());
        assert!(state.registry.resolve("translate_text").is_some());
        assert!(state.registry.resolve("detect_language").is_some());
        assert!(state.registry.resolve("generate_qr_code").is_some());
        assert!(state.registry.resolve("electrical_calculator").is_some());
    }
}
