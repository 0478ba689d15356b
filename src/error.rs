//! Error types shared across the control plane.

use thiserror::Error;

/// Errors surfaced by the subscription protocol.
#[derive(Error, Debug)]
pub enum StreamError {
    /// The subscribe response did not carry a usable subscription handle.
    #[error("malformed subscription id")]
    MalformedSubscriptionId,

    /// A conversation-scoped subscribe named a session this server does not own.
    #[error("unknown conversation: {0}")]
    UnknownConversation(String),

    /// The scope names a workspace this server does not host.
    #[error("unknown workspace: {0}")]
    UnknownWorkspace(String),

    /// A replay would not fit in the subscriber's delivery queue.
    #[error("replay of {requested} events exceeds subscriber queue capacity {capacity}")]
    ReplayOverflow { requested: usize, capacity: usize },

    /// The requested cursor is past the end of the server's log, e.g. after
    /// a server restart reset its cursors.
    #[error("cursor {requested} is ahead of the server's current cursor {current}")]
    CursorAhead { requested: u64, current: u64 },

    /// The connection's delivery queue was closed after it fell behind.
    #[error("delivery queue closed; reconnect")]
    QueueClosed,

    /// The response was well-formed JSON but not the expected shape.
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// The request could not be decoded.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// The server rejected the request.
    #[error("server error ({code}): {message}")]
    Server { code: String, message: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The transport failed before a response arrived.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl StreamError {
    /// Stable machine-readable code used in protocol error frames.
    pub fn code(&self) -> &'static str {
        match self {
            Self::MalformedSubscriptionId => "malformed_subscription_id",
            Self::UnknownConversation(_) => "unknown_conversation",
            Self::UnknownWorkspace(_) => "unknown_workspace",
            Self::ReplayOverflow { .. } => "replay_overflow",
            Self::CursorAhead { .. } => "cursor_ahead",
            Self::QueueClosed => "queue_closed",
            Self::InvalidResponse(_) => "invalid_response",
            Self::BadRequest(_) => "bad_request",
            Self::Server { .. } => "server_error",
            Self::Json(_) => "json_error",
            Self::Transport(_) => "transport_error",
        }
    }
}

/// Errors from moving a request to the server and back.
#[derive(Error, Debug)]
pub enum TransportError {
    /// The connection is gone.
    #[error("stream transport closed")]
    Closed,

    /// No response arrived in time.
    #[error("request timed out")]
    Timeout,

    /// A WebSocket error.
    #[error("WebSocket error: {0}")]
    WebSocket(Box<tokio_tungstenite::tungstenite::Error>),

    /// A JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<tokio_tungstenite::tungstenite::Error> for TransportError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::WebSocket(Box::new(err))
    }
}

/// Errors from a process backing a session.
#[derive(Error, Debug)]
pub enum BackendError {
    #[error("session backend is closed")]
    Closed,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("pty error: {0}")]
    Pty(String),
}

/// Errors from mutating the workspace source of truth.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum WorkspaceError {
    #[error("unknown repository: {0}")]
    UnknownRepository(String),

    #[error("unknown task: {0}")]
    UnknownTask(String),

    #[error("invalid record: {0}")]
    InvalidRecord(String),
}
