use chatrelay_browser::{ChatRelay, DeltaStream, StreamEvent};
use chatrelay_core::{ApiError, Config, ErrorCode};
use futures::Stream;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::time::Instant;
use tracing::{error, info, warn};
use uuid::Uuid;

use axum::{
    extract::{rejection::JsonRejection, DefaultBodyLimit, State},
    http::{HeaderValue, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use serde_json::Value;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use super::openai::{
    malformed_body, model_list, parse_request, ChatCompletion, ChatCompletionChunk, CompletionMeta,
    CompletionRequest, ErrorEnvelope,
};

const MAX_BODY_BYTES: usize = 5 * 1024 * 1024;

// ---------------------------------------------------------------------------
// Shared state passed to HTTP handlers
// ---------------------------------------------------------------------------

#[derive(Clone)]
struct GatewayState {
    relay: Arc<ChatRelay>,
    /// Serializes requests at the boundary; the relay itself rejects overlap.
    queue: Arc<Mutex<()>>,
    model: String,
    upstream_timeout: Duration,
}

impl GatewayState {
    fn new(relay: Arc<ChatRelay>, config: &Config) -> Self {
        Self {
            relay,
            queue: Arc::new(Mutex::new(())),
            model: config.gateway.model.clone(),
            upstream_timeout: Duration::from_millis(config.gateway.upstream_timeout_ms),
        }
    }

    /// Wait for our turn: earlier requests first, then any submission that
    /// outlived its request (a timed-out one still cleaning up).
    async fn enqueue(&self) -> OwnedMutexGuard<()> {
        let turn = self.queue.clone().lock_owned().await;
        self.relay.wait_idle().await;
        turn
    }
}

fn upstream_timeout(limit: Duration) -> ApiError {
    ApiError::new(ErrorCode::UpstreamTimeout, "Chat web response timed out")
        .with_details(format!("no result within {}ms", limit.as_millis()))
}

fn error_response(e: &ApiError) -> Response {
    let status = StatusCode::from_u16(e.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(ErrorEnvelope::from(e))).into_response()
}

fn with_request_headers(mut response: Response, request_id: &str, started: Instant) -> Response {
    let headers = response.headers_mut();
    if let Ok(v) = HeaderValue::from_str(request_id) {
        headers.insert("x-request-id", v);
    }
    headers.insert(
        "openai-processing-ms",
        HeaderValue::from(started.elapsed().as_millis() as u64),
    );
    response
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn handle_chat_completions(
    State(state): State<GatewayState>,
    body: Result<Json<Value>, JsonRejection>,
) -> Response {
    let started = Instant::now();
    let request_id = Uuid::new_v4().to_string();

    let request = match body {
        Ok(Json(body)) => parse_request(&body),
        Err(rejection) => Err(malformed_body(rejection.body_text())),
    };
    let request = match request {
        Ok(request) => request,
        Err(e) => {
            warn!(%request_id, code = ?e.code, "Rejected request: {}", e.message);
            return with_request_headers(error_response(&e), &request_id, started);
        }
    };

    let model = request.model.clone().unwrap_or_else(|| state.model.clone());
    let meta = CompletionMeta::new(&request_id, &model);
    info!(
        %request_id,
        messages = request.messages.len(),
        stream = request.stream,
        mode = ?request.mode,
        "Chat completion request"
    );

    let response = if request.stream {
        stream_completion(&state, request, meta).await
    } else {
        complete(&state, request, meta).await
    };
    with_request_headers(response, &request_id, started)
}

async fn complete(state: &GatewayState, request: CompletionRequest, meta: CompletionMeta) -> Response {
    let _turn = state.enqueue().await;

    let relay = Arc::clone(&state.relay);
    let CompletionRequest { messages, mode, .. } = request;
    // the submission runs to the end, cleanup included, even if we stop waiting
    let task = tokio::spawn(async move { relay.send_synchronous(&messages, mode).await });
    let result = match tokio::time::timeout(state.upstream_timeout, task).await {
        Ok(Ok(result)) => result,
        Ok(Err(e)) => Err(ApiError::internal(format!("Submission task failed: {}", e))),
        Err(_) => Err(upstream_timeout(state.upstream_timeout)),
    };

    match result {
        Ok(reply) => {
            info!(
                id = %meta.id,
                chars = reply.reply_text.chars().count(),
                signal = ?reply.signal,
                cleanup = ?reply.cleanup,
                "Reply relayed"
            );
            Json(ChatCompletion::new(&meta, reply.reply_text)).into_response()
        }
        Err(e) => {
            error!(id = %meta.id, code = ?e.code, details = ?e.details, "Chat completion failed: {}", e.message);
            error_response(&e)
        }
    }
}

async fn stream_completion(state: &GatewayState, request: CompletionRequest, meta: CompletionMeta) -> Response {
    let turn = state.enqueue().await;
    let deadline = Instant::now() + state.upstream_timeout;

    let relay = Arc::clone(&state.relay);
    let CompletionRequest { messages, mode, .. } = request;
    let task = tokio::spawn(async move { relay.open_stream(&messages, mode).await });
    let opened = match tokio::time::timeout_at(deadline, task).await {
        Ok(Ok(result)) => result,
        Ok(Err(e)) => Err(ApiError::internal(format!("Submission task failed: {}", e))),
        Err(_) => Err(upstream_timeout(state.upstream_timeout)),
    };
    let events = match opened {
        Ok(events) => events,
        Err(e) => {
            error!(id = %meta.id, code = ?e.code, details = ?e.details, "Stream could not be opened: {}", e.message);
            return error_response(&e);
        }
    };

    let frames = sse_frames(FrameState {
        events,
        meta,
        deadline,
        limit: state.upstream_timeout,
        phase: Phase::Open,
        _turn: turn,
    });
    Sse::new(frames).keep_alive(KeepAlive::default()).into_response()
}

async fn handle_status(State(state): State<GatewayState>) -> Response {
    if state.relay.status().await.ready {
        Json(serde_json::json!({ "status": "ready" })).into_response()
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({ "status": "not ready" })),
        )
            .into_response()
    }
}

async fn handle_models(State(state): State<GatewayState>) -> impl IntoResponse {
    Json(model_list(&state.model))
}

// ---------------------------------------------------------------------------
// Server-Sent Events framing
// ---------------------------------------------------------------------------

enum Phase {
    Open,
    Streaming,
    Closing,
    Finished,
}

struct FrameState {
    events: DeltaStream,
    meta: CompletionMeta,
    deadline: Instant,
    limit: Duration,
    phase: Phase,
    /// Held until the client has the last frame or goes away.
    _turn: OwnedMutexGuard<()>,
}

/// Role frame, one content frame per delta, a stop frame (or an error
/// envelope) and finally `[DONE]`.
fn sse_frames(state: FrameState) -> impl Stream<Item = Result<Event, axum::Error>> {
    futures::stream::unfold(state, |mut s| async move {
        let frame = match s.phase {
            Phase::Open => {
                s.phase = Phase::Streaming;
                Event::default().json_data(ChatCompletionChunk::role(&s.meta))
            }
            Phase::Streaming => match tokio::time::timeout_at(s.deadline, s.events.next_event()).await {
                Ok(Some(StreamEvent::Delta(text))) => {
                    Event::default().json_data(ChatCompletionChunk::content(&s.meta, text))
                }
                Ok(Some(StreamEvent::Done)) => {
                    info!(id = %s.meta.id, "Stream finished");
                    s.phase = Phase::Closing;
                    Event::default().json_data(ChatCompletionChunk::stop(&s.meta))
                }
                Ok(Some(StreamEvent::Error(e))) => {
                    error!(id = %s.meta.id, code = ?e.code, details = ?e.details, "Stream failed: {}", e.message);
                    s.phase = Phase::Closing;
                    Event::default().json_data(ErrorEnvelope::from(&e))
                }
                Ok(None) => {
                    s.phase = Phase::Closing;
                    let e = ApiError::internal("Stream ended without a terminal event");
                    Event::default().json_data(ErrorEnvelope::from(&e))
                }
                Err(_) => {
                    warn!(id = %s.meta.id, "Stream exceeded the upstream timeout");
                    s.phase = Phase::Closing;
                    Event::default().json_data(ErrorEnvelope::from(&upstream_timeout(s.limit)))
                }
            },
            Phase::Closing => {
                s.phase = Phase::Finished;
                Ok(Event::default().data("[DONE]"))
            }
            Phase::Finished => return None,
        };
        Some((frame, s))
    })
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

fn router(state: GatewayState) -> Router {
    Router::new()
        .route("/v1/chat/completions", post(handle_chat_completions))
        .route("/v1/models", get(handle_models))
        .route("/status", get(handle_status))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive().allow_credentials(false))
        .with_state(state)
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for Ctrl-C");
        return;
    }
    info!("Shutdown signal received, draining requests...");
}

pub async fn run(cli_host: Option<String>, cli_port: Option<u16>) -> anyhow::Result<()> {
    let (config, relay) = super::load_relay()?;
    let host = cli_host.unwrap_or_else(|| config.gateway.host.clone());
    let port = cli_port.unwrap_or(config.gateway.port);

    // bring the browser up before the first request arrives
    let warm = Arc::clone(&relay);
    tokio::spawn(async move {
        match warm.ensure_ready().await {
            Ok(()) => info!("Browser session ready"),
            Err(e) => warn!(error = %e, details = ?e.details, "Browser session not ready yet, will retry on first request"),
        }
    });

    let app = router(GatewayState::new(Arc::clone(&relay), &config));
    let bind_addr = format!("{}:{}", host, port);
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!(
        model = %config.gateway.model,
        upstream_timeout_ms = config.gateway.upstream_timeout_ms,
        "Gateway listening on http://{}",
        bind_addr
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Closing browser session");
    relay.close().await;
    Ok(())
}
