//! NDJSON render-trace recorder driven by an externally authored state file.
//!
//! The state file (`{"outputPath": "...", "conversationId": "..."}`) is polled
//! rather than watched. While it is missing or unparseable the recorder is
//! inactive and every record call is a no-op. Recording never fails the
//! caller: a write error deactivates the recorder until the state file
//! changes.
//!
//! Session sinks only enqueue. Each sink owns a writer thread that does the
//! file I/O, so a slow disk never stalls a session's `write`.

use std::{
    collections::HashMap,
    fs::{File, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
    sync::Arc,
    thread,
    time::Duration,
};

use base64::Engine as _;
use chrono::Utc;
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::{sync::mpsc, task::JoinHandle};

use crate::{
    multiplexer::{AttachmentSink, SinkClosed},
    types::{Cursor, SessionExit},
};

pub const DEFAULT_TRACE_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Records a sink may have in flight before new output is dropped.
const SINK_QUEUE: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderTraceState {
    pub output_path: String,
    #[serde(default)]
    pub conversation_id: Option<String>,
}

struct ActiveTrace {
    path: PathBuf,
    conversation_id: Option<String>,
    file: File,
}

#[derive(Default)]
struct TraceInner {
    active: Option<ActiveTrace>,
    /// Raw state file contents of the last refresh, so an unchanged file is
    /// not re-parsed and a failed path is not reopened.
    last_state: Option<String>,
    last_values: HashMap<String, String>,
}

pub struct RenderTraceRecorder {
    state_path: PathBuf,
    inner: Mutex<TraceInner>,
}

impl RenderTraceRecorder {
    pub fn new(state_path: impl Into<PathBuf>) -> Self {
        Self {
            state_path: state_path.into(),
            inner: Mutex::new(TraceInner::default()),
        }
    }

    pub fn is_active(&self) -> bool {
        self.inner.lock().active.is_some()
    }

    pub fn output_path(&self) -> Option<PathBuf> {
        self.inner.lock().active.as_ref().map(|a| a.path.clone())
    }

    /// Whether records for `conversation_id` should be written right now.
    pub fn accepts(&self, conversation_id: &str) -> bool {
        match &self.inner.lock().active {
            Some(active) => active
                .conversation_id
                .as_deref()
                .map_or(true, |wanted| wanted == conversation_id),
            None => false,
        }
    }

    /// Re-read the state file and open, reopen or drop the output handle.
    pub fn refresh(&self) {
        let raw = std::fs::read_to_string(&self.state_path).ok();
        let mut inner = self.inner.lock();
        if raw == inner.last_state {
            return;
        }
        inner.last_state = raw.clone();

        let Some(state) = raw.and_then(|raw| serde_json::from_str::<RenderTraceState>(&raw).ok())
        else {
            if inner.active.take().is_some() {
                tracing::info!(
                    target = "agent_mux::render_trace",
                    state = %self.state_path.display(),
                    "render trace disabled"
                );
            }
            return;
        };

        let path = self.resolve(&state.output_path);
        if let Some(active) = inner.active.as_mut() {
            if active.path == path {
                active.conversation_id = state.conversation_id;
                return;
            }
        }

        match OpenOptions::new().create(true).append(true).open(&path) {
            Ok(file) => {
                tracing::info!(
                    target = "agent_mux::render_trace",
                    output = %path.display(),
                    conversation = ?state.conversation_id,
                    "render trace enabled"
                );
                inner.active = Some(ActiveTrace {
                    path,
                    conversation_id: state.conversation_id,
                    file,
                });
                inner.last_values.clear();
            }
            Err(error) => {
                tracing::warn!(
                    target = "agent_mux::render_trace",
                    output = %path.display(),
                    error = %error,
                    "failed to open render trace output"
                );
                inner.active = None;
            }
        }
    }

    fn resolve(&self, output_path: &str) -> PathBuf {
        let path = Path::new(output_path);
        if path.is_absolute() {
            return path.to_path_buf();
        }
        self.state_path
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join(path)
    }

    /// Append one record. Returns whether it was written.
    pub fn record(&self, kind: &str, payload: Value) -> bool {
        let mut inner = self.inner.lock();
        write_record(&mut inner, kind, payload)
    }

    /// Append a record unless the last value recorded under `key` equals
    /// `value`.
    pub fn record_deduped(&self, key: &str, value: &str, kind: &str, payload: Value) -> bool {
        let mut inner = self.inner.lock();
        if inner.active.is_none() || inner.last_values.get(key).is_some_and(|last| last == value) {
            return false;
        }
        if !write_record(&mut inner, kind, payload) {
            return false;
        }
        inner.last_values.insert(key.to_string(), value.to_string());
        true
    }

    /// Poll the state file every `interval` until the handle is aborted.
    pub fn spawn_poller(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let recorder = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                recorder.refresh();
            }
        })
    }

    /// Attachment sink that mirrors one session's output into the trace. The
    /// writer thread exits when the sink is dropped.
    pub fn sink(self: &Arc<Self>, session_id: impl Into<String>) -> RenderTraceSink {
        let session_id = session_id.into();
        let (tx, mut rx) = mpsc::channel(SINK_QUEUE);
        let recorder = self.clone();
        let writer_session = session_id.clone();
        let spawned = thread::Builder::new()
            .name(format!("trace-{session_id}"))
            .spawn(move || {
                while let Some(record) = rx.blocking_recv() {
                    recorder.write_session_record(&writer_session, record);
                }
            });
        if let Err(error) = spawned {
            tracing::warn!(
                target = "agent_mux::render_trace",
                session = %session_id,
                error = %error,
                "failed to start render trace writer"
            );
        }
        RenderTraceSink { session_id, tx }
    }

    fn write_session_record(&self, session_id: &str, record: SessionRecord) {
        if !self.accepts(session_id) {
            return;
        }
        match record {
            SessionRecord::Output { cursor, chunk } => {
                self.record(
                    "output",
                    json!({
                        "sessionId": session_id,
                        "cursor": cursor,
                        "chunk": base64::engine::general_purpose::STANDARD.encode(chunk),
                    }),
                );
            }
            SessionRecord::Exit(exit) => {
                let key = format!("exit:{session_id}");
                let value = format!("{:?}/{:?}", exit.code, exit.signal);
                self.record_deduped(
                    &key,
                    &value,
                    "exit",
                    json!({
                        "sessionId": session_id,
                        "code": exit.code,
                        "signal": exit.signal,
                    }),
                );
            }
        }
    }
}

fn write_record(inner: &mut TraceInner, kind: &str, payload: Value) -> bool {
    let Some(active) = inner.active.as_mut() else {
        return false;
    };
    let line = json!({
        "ts": Utc::now().to_rfc3339(),
        "kind": kind,
        "payload": payload,
    });
    let mut text = line.to_string();
    text.push('\n');
    let result = active
        .file
        .write_all(text.as_bytes())
        .and_then(|_| active.file.flush());
    if let Err(error) = result {
        tracing::warn!(
            target = "agent_mux::render_trace",
            output = %active.path.display(),
            error = %error,
            "render trace write failed; recorder deactivated"
        );
        inner.active = None;
        return false;
    }
    true
}

enum SessionRecord {
    Output { cursor: Cursor, chunk: Vec<u8> },
    Exit(SessionExit),
}

pub struct RenderTraceSink {
    session_id: String,
    tx: mpsc::Sender<SessionRecord>,
}

impl AttachmentSink for RenderTraceSink {
    fn on_data(&self, cursor: Cursor, chunk: &[u8]) -> Result<(), SinkClosed> {
        let record = SessionRecord::Output {
            cursor,
            chunk: chunk.to_vec(),
        };
        if let Err(mpsc::error::TrySendError::Full(_)) = self.tx.try_send(record) {
            tracing::debug!(
                target = "agent_mux::render_trace",
                session = %self.session_id,
                cursor,
                "render trace queue full; output record dropped"
            );
        }
        Ok(())
    }

    fn on_exit(&self, exit: &SessionExit) {
        let _ = self.tx.try_send(SessionRecord::Exit(exit.clone()));
    }
}
