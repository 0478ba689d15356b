//! HTTP and WebSocket surface for the control plane.
//!
//! `/ws` speaks the stream protocol: JSON request frames in, `stream.response`
//! and `stream.event` frames out. The REST routes cover session management,
//! workspace snapshots and mutation batches, and observed-log replay.

use std::{sync::Arc, time::Duration};

use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use base64::Engine as _;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::{
    control_plane::ControlPlane,
    error::StreamError,
    protocol::{decode_request, ProtocolError, ServerFrame, PROTOCOL_VERSION},
    session_pool::SpawnRequest,
    subscriptions::DeliveryQueue,
    types::Cursor,
    workspace::WorkspaceMutation,
};

pub const API_KEY_ENV: &str = "AGENT_MUX_API_KEY";
const WS_PING_INTERVAL: Duration = Duration::from_secs(30);
const DEFAULT_TAIL_LINES: usize = 200;

#[derive(Clone)]
struct ApiState {
    plane: Arc<ControlPlane>,
    api_key: Option<String>,
}

type ApiError = (StatusCode, Json<Value>);

fn error_envelope(status: StatusCode, code: &str, message: impl Into<String>) -> ApiError {
    (
        status,
        Json(json!({
            "error": {
                "code": code,
                "message": message.into(),
                "statusCode": status.as_u16(),
            }
        })),
    )
}

fn unknown_session(session_id: &str) -> ApiError {
    error_envelope(
        StatusCode::NOT_FOUND,
        "unknown_session",
        format!("no session named {session_id}"),
    )
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

pub fn api_router(plane: Arc<ControlPlane>) -> axum::Router {
    api_router_with_auth(plane, configured_api_key())
}

fn configured_api_key() -> Option<String> {
    std::env::var(API_KEY_ENV)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

pub fn api_router_with_auth(plane: Arc<ControlPlane>, api_key: Option<String>) -> axum::Router {
    use axum::{middleware, routing, Router};

    let state = ApiState {
        plane,
        api_key: api_key
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty()),
    };

    let protected = Router::new()
        .route("/ws", routing::get(stream_ws))
        .route("/api/sessions", routing::get(list_sessions).post(spawn_session))
        .route("/api/sessions/{id}", routing::delete(close_session))
        .route("/api/sessions/{id}/input", routing::post(session_input))
        .route("/api/sessions/{id}/resize", routing::post(session_resize))
        .route("/api/sessions/{id}/snapshot", routing::get(session_snapshot))
        .route("/api/workspace/snapshot", routing::get(workspace_snapshot))
        .route("/api/workspace/mutations", routing::post(workspace_mutations))
        .route("/api/events/replay", routing::get(replay_events))
        .with_state(state.clone())
        .layer(middleware::from_fn_with_state(state.clone(), auth_middleware));

    Router::new()
        .route("/health", routing::get(health))
        .merge(protected)
        .with_state(state)
}

async fn auth_middleware(
    State(state): State<ApiState>,
    request: axum::http::Request<axum::body::Body>,
    next: axum::middleware::Next,
) -> Result<axum::response::Response, ApiError> {
    let Some(expected) = state.api_key.as_deref() else {
        return Ok(next.run(request).await);
    };

    // X-API-Key or Authorization: Bearer <key>
    let provided = request
        .headers()
        .get("x-api-key")
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .or_else(|| {
            request
                .headers()
                .get("authorization")
                .and_then(|value| value.to_str().ok())
                .and_then(|value| value.strip_prefix("Bearer "))
                .map(str::trim)
                .filter(|value| !value.is_empty())
        });

    if provided != Some(expected) {
        return Err(error_envelope(
            StatusCode::UNAUTHORIZED,
            "unauthorized",
            "Missing or invalid API key",
        ));
    }

    Ok(next.run(request).await)
}

// ---------------------------------------------------------------------------
// Endpoints
// ---------------------------------------------------------------------------

async fn health(State(state): State<ApiState>) -> Json<Value> {
    let plane = &state.plane;
    Json(json!({
        "status": "ok",
        "service": "agent-mux",
        "version": env!("CARGO_PKG_VERSION"),
        "protocolVersion": PROTOCOL_VERSION,
        "workspaceId": plane.scope().workspace_id,
        "sessionCount": plane.sessions().len(),
        "subscriptionCount": plane.subscriptions().subscription_count(),
        "cursor": plane.subscriptions().current_cursor(plane.workspace().key()),
    }))
}

async fn list_sessions(State(state): State<ApiState>) -> Json<Value> {
    Json(json!({ "sessions": state.plane.sessions().list() }))
}

async fn spawn_session(
    State(state): State<ApiState>,
    Json(request): Json<SpawnRequest>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    if request.command.trim().is_empty() {
        return Err(error_envelope(
            StatusCode::BAD_REQUEST,
            "bad_request",
            "command is required",
        ));
    }
    let request = request.normalized().ok_or_else(|| {
        error_envelope(
            StatusCode::BAD_REQUEST,
            "bad_request",
            "command line has unbalanced quotes",
        )
    })?;
    let mux = state.plane.spawn_session(request).map_err(|error| {
        tracing::warn!(target = "agent_mux::api", error = %error, "spawn failed");
        error_envelope(
            StatusCode::INTERNAL_SERVER_ERROR,
            "spawn_failed",
            format!("{error:#}"),
        )
    })?;
    Ok((
        StatusCode::CREATED,
        Json(json!({
            "sessionId": mux.session_id(),
            "pid": mux.process_id(),
            "cursor": mux.latest_cursor(),
        })),
    ))
}

async fn close_session(
    State(state): State<ApiState>,
    Path(session_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    if !state.plane.sessions().close(&session_id) {
        return Err(unknown_session(&session_id));
    }
    Ok(Json(json!({ "sessionId": session_id, "closed": true })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InputBody {
    #[serde(default)]
    data: Option<String>,
    #[serde(default)]
    data_base64: Option<String>,
}

async fn session_input(
    State(state): State<ApiState>,
    Path(session_id): Path<String>,
    Json(body): Json<InputBody>,
) -> Result<Json<Value>, ApiError> {
    let bytes = match (body.data, body.data_base64) {
        (_, Some(encoded)) => base64::engine::general_purpose::STANDARD
            .decode(encoded.as_bytes())
            .map_err(|error| {
                error_envelope(StatusCode::BAD_REQUEST, "bad_request", error.to_string())
            })?,
        (Some(text), None) => text.into_bytes(),
        (None, None) => {
            return Err(error_envelope(
                StatusCode::BAD_REQUEST,
                "bad_request",
                "data or dataBase64 is required",
            ))
        }
    };
    let mux = state
        .plane
        .sessions()
        .get(&session_id)
        .ok_or_else(|| unknown_session(&session_id))?;
    if !mux.send_input(&bytes) {
        return Err(error_envelope(
            StatusCode::CONFLICT,
            "session_not_writable",
            format!("session {session_id} is not accepting input"),
        ));
    }
    Ok(Json(json!({ "sessionId": session_id, "bytes": bytes.len() })))
}

#[derive(Debug, Deserialize)]
struct ResizeBody {
    cols: u16,
    rows: u16,
}

async fn session_resize(
    State(state): State<ApiState>,
    Path(session_id): Path<String>,
    Json(body): Json<ResizeBody>,
) -> Result<Json<Value>, ApiError> {
    if body.cols == 0 || body.rows == 0 {
        return Err(error_envelope(
            StatusCode::BAD_REQUEST,
            "bad_request",
            "cols and rows must be positive",
        ));
    }
    let mux = state
        .plane
        .sessions()
        .get(&session_id)
        .ok_or_else(|| unknown_session(&session_id))?;
    mux.resize(body.cols, body.rows);
    Ok(Json(json!({ "sessionId": session_id, "cols": body.cols, "rows": body.rows })))
}

#[derive(Debug, Deserialize, Default)]
struct TailQuery {
    tail: Option<usize>,
}

async fn session_snapshot(
    State(state): State<ApiState>,
    Path(session_id): Path<String>,
    Query(query): Query<TailQuery>,
) -> Result<Json<Value>, ApiError> {
    let mux = state
        .plane
        .sessions()
        .get(&session_id)
        .ok_or_else(|| unknown_session(&session_id))?;
    Ok(Json(json!({
        "sessionId": session_id,
        "cursor": mux.latest_cursor(),
        "exit": mux.exit_status(),
        "screen": mux.snapshot(),
        "tail": mux.buffer_tail(query.tail.unwrap_or(DEFAULT_TAIL_LINES)),
    })))
}

async fn workspace_snapshot(State(state): State<ApiState>) -> Json<Value> {
    Json(json!(state.plane.workspace().snapshot()))
}

#[derive(Debug, Deserialize)]
struct MutationsBody {
    /// `null` entries are counted as skipped.
    mutations: Vec<Option<WorkspaceMutation>>,
}

async fn workspace_mutations(
    State(state): State<ApiState>,
    Json(body): Json<MutationsBody>,
) -> Json<Value> {
    let plane = &state.plane;
    let report = plane
        .workspace()
        .apply_mutations(body.mutations, plane.batch_concurrency())
        .await;
    Json(json!({
        "completed": report.completed,
        "failed": report.failed,
        "skipped": report.skipped,
        "cursor": plane.subscriptions().current_cursor(plane.workspace().key()),
    }))
}

#[derive(Debug, Deserialize, Default)]
struct ReplayQuery {
    #[serde(rename = "afterCursor")]
    after_cursor_camel: Option<Cursor>,
    #[serde(rename = "after_cursor")]
    after_cursor_snake: Option<Cursor>,
}

impl ReplayQuery {
    fn after_cursor(&self) -> Cursor {
        self.after_cursor_camel
            .or(self.after_cursor_snake)
            .unwrap_or(0)
    }
}

async fn replay_events(
    State(state): State<ApiState>,
    Query(query): Query<ReplayQuery>,
) -> Json<Value> {
    let after = query.after_cursor();
    let key = state.plane.workspace().key();
    let (entries, gap_oldest) = state.plane.subscriptions().replay(key, after);
    let events: Vec<Value> = entries
        .into_iter()
        .map(|entry| json!({ "cursor": entry.cursor, "event": entry.event }))
        .collect();
    Json(json!({
        "events": events,
        "gap": gap_oldest.is_some(),
        "oldestAvailable": gap_oldest.unwrap_or(after),
        "cursor": state.plane.subscriptions().current_cursor(key),
    }))
}

// ---------------------------------------------------------------------------
// Stream socket
// ---------------------------------------------------------------------------

async fn stream_ws(ws: WebSocketUpgrade, State(state): State<ApiState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_stream_socket(socket, state.plane))
}

async fn handle_stream_socket(socket: WebSocket, plane: Arc<ControlPlane>) {
    let owner = format!("ws_{}", Uuid::new_v4().simple());
    tracing::info!(target = "agent_mux::api", connection = %owner, "stream client connected");

    let (deliveries_tx, mut deliveries) = plane.delivery_channel();
    let (mut sender, mut receiver) = socket.split();
    let mut ping_interval = tokio::time::interval(WS_PING_INTERVAL);

    loop {
        tokio::select! {
            frame = receiver.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        let reply = handle_stream_text(&plane, text.as_str(), &deliveries_tx, &owner).await;
                        if !send_frame(&mut sender, &reply).await {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(error)) => {
                        tracing::warn!(target = "agent_mux::api", connection = %owner, error = %error, "stream socket read error");
                        break;
                    }
                    _ => {}
                }
            }
            delivery = deliveries.recv() => {
                let Some(delivery) = delivery else {
                    // The queue overflowed and was closed; the client resumes
                    // from its last cursor on a new connection.
                    tracing::warn!(target = "agent_mux::api", connection = %owner, "stream client fell behind; closing");
                    let _ = sender
                        .send(Message::Close(Some(CloseFrame {
                            code: close_code::AGAIN,
                            reason: "subscriber queue overflowed".into(),
                        })))
                        .await;
                    break;
                };
                if !send_frame(&mut sender, &ServerFrame::Event(delivery)).await {
                    break;
                }
            }
            _ = ping_interval.tick() => {
                if sender.send(Message::Ping(vec![].into())).await.is_err() {
                    break;
                }
            }
        }
    }

    let released = plane.subscriptions().unsubscribe_owner(&owner);
    tracing::info!(
        target = "agent_mux::api",
        connection = %owner,
        released,
        "stream client disconnected"
    );
}

/// Returns `false` once the socket can no longer be written.
async fn send_frame<S>(sender: &mut S, frame: &ServerFrame) -> bool
where
    S: futures::Sink<Message> + Unpin,
{
    let Ok(text) = serde_json::to_string(frame) else {
        return true;
    };
    sender.send(Message::Text(text.into())).await.is_ok()
}

/// Decode and execute one request frame, producing its response frame.
pub(crate) async fn handle_stream_text(
    plane: &ControlPlane,
    text: &str,
    deliveries: &DeliveryQueue,
    owner: &str,
) -> ServerFrame {
    let value: Value = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(error) => {
            return ServerFrame::error(None, (&StreamError::BadRequest(error.to_string())).into())
        }
    };
    let (request_id, command) = decode_request(&value);
    let command = match command {
        Ok(command) => command,
        Err(error) => {
            return ServerFrame::error(
                request_id,
                (&StreamError::BadRequest(error.to_string())).into(),
            )
        }
    };

    let kind = command.kind();
    match plane.handle_command(command, deliveries, Some(owner)).await {
        Ok(result) => ServerFrame::ok(request_id, result),
        Err(error) => {
            tracing::debug!(
                target = "agent_mux::api",
                connection = %owner,
                kind,
                error = %error,
                "stream request rejected"
            );
            ServerFrame::error(request_id, ProtocolError::from(&error))
        }
    }
}
