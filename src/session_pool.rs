//! Owns every live session and the reader loop that feeds each multiplexer.

use std::{collections::HashMap, path::PathBuf, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use uuid::Uuid;

use crate::{
    backend::{FramedHelperBackend, SessionBackend},
    multiplexer::{BacklogPolicy, SessionEvent, SessionMultiplexer},
    pty::PtySession,
    terminal_buffer::PlainTextBuffer,
    types::{Cursor, SessionExit},
};

const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(50);
const EXIT_POLL_ATTEMPTS: u32 = 100;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpawnRequest {
    #[serde(default)]
    pub session_id: Option<String>,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub cwd: Option<PathBuf>,
    #[serde(default = "default_cols")]
    pub cols: u16,
    #[serde(default = "default_rows")]
    pub rows: u16,
    /// Run the command behind a PTY host helper instead of an in-process PTY.
    #[serde(default)]
    pub helper: Option<PathBuf>,
}

fn default_cols() -> u16 {
    120
}

fn default_rows() -> u16 {
    40
}

impl SpawnRequest {
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            session_id: None,
            command: command.into(),
            args,
            cwd: None,
            cols: default_cols(),
            rows: default_rows(),
            helper: None,
        }
    }

    /// Split a shell-style command line such as `claude --resume "fix tests"`.
    /// Returns `None` for an empty line or unbalanced quotes.
    pub fn from_command_line(line: &str) -> Option<Self> {
        let mut words = shlex::split(line)?.into_iter();
        let command = words.next()?;
        Some(Self::new(command, words.collect()))
    }

    /// A bare `command` holding a whole command line is split into command
    /// and args; explicit args are left alone.
    pub fn normalized(self) -> Option<Self> {
        if !self.args.is_empty() || !self.command.trim().contains(char::is_whitespace) {
            return Some(self);
        }
        let parsed = Self::from_command_line(&self.command)?;
        Some(Self {
            command: parsed.command,
            args: parsed.args,
            ..self
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub session_id: String,
    pub command: String,
    pub pid: Option<u32>,
    pub latest_cursor: Cursor,
    pub attachments: usize,
    pub closed: bool,
    pub exit: Option<SessionExit>,
    pub started_at: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolEvent {
    Started {
        session_id: String,
        command: String,
        pid: Option<u32>,
    },
    Exited {
        session_id: String,
        exit: SessionExit,
    },
    Removed {
        session_id: String,
    },
}

struct PoolEntry {
    mux: Arc<SessionMultiplexer>,
    command: String,
    started_at: String,
}

struct PoolInner {
    sessions: Mutex<HashMap<String, PoolEntry>>,
    policy: BacklogPolicy,
    events: broadcast::Sender<PoolEvent>,
}

#[derive(Clone)]
pub struct SessionPool {
    inner: Arc<PoolInner>,
}

impl SessionPool {
    pub fn new(policy: BacklogPolicy) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            inner: Arc::new(PoolInner {
                sessions: Mutex::new(HashMap::new()),
                policy,
                events,
            }),
        }
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<PoolEvent> {
        self.inner.events.subscribe()
    }

    /// Spawn a backing process and start pumping its output into a new
    /// multiplexer. Must be called from within a tokio runtime.
    pub fn spawn(&self, request: SpawnRequest) -> Result<Arc<SessionMultiplexer>> {
        let session_id = request
            .session_id
            .clone()
            .unwrap_or_else(|| format!("sess_{}", Uuid::new_v4().simple()));
        if self.inner.sessions.lock().contains_key(&session_id) {
            anyhow::bail!("session '{session_id}' already exists");
        }

        let (backend, output): (Arc<dyn SessionBackend>, mpsc::Receiver<Vec<u8>>) =
            match &request.helper {
                Some(helper) => {
                    let (backend, rx) = FramedHelperBackend::spawn(
                        helper,
                        &request.command,
                        &request.args,
                        request.cwd.as_deref(),
                        request.cols,
                        request.rows,
                    )?;
                    (Arc::new(backend), rx)
                }
                None => {
                    let (backend, rx) = PtySession::spawn(
                        &request.command,
                        &request.args,
                        request.cwd.as_deref(),
                        request.cols,
                        request.rows,
                    )
                    .with_context(|| format!("failed to start session '{session_id}'"))?;
                    (Arc::new(backend), rx)
                }
            };

        let mux = Arc::new(SessionMultiplexer::new(
            session_id.clone(),
            Some(backend.clone()),
            self.inner.policy,
            Box::new(PlainTextBuffer::new(request.cols, request.rows)),
        ));
        self.register(mux.clone(), request.command.clone());

        tokio::spawn(pump_output(mux.clone(), backend, output));
        tracing::info!(
            target = "agent_mux::sessions",
            session = %session_id,
            command = %request.command,
            pid = ?mux.process_id(),
            "session spawned"
        );
        Ok(mux)
    }

    /// Register a multiplexer whose output is driven by the caller.
    pub fn adopt(&self, mux: Arc<SessionMultiplexer>, command: impl Into<String>) -> Result<()> {
        if self.inner.sessions.lock().contains_key(mux.session_id()) {
            anyhow::bail!("session '{}' already exists", mux.session_id());
        }
        self.register(mux, command.into());
        Ok(())
    }

    fn register(&self, mux: Arc<SessionMultiplexer>, command: String) {
        let session_id = mux.session_id().to_string();
        let pid = mux.process_id();

        let mut lifecycle = mux.subscribe_events();
        let events = self.inner.events.clone();
        tokio::spawn(async move {
            loop {
                match lifecycle.recv().await {
                    Ok(SessionEvent::Exited { session_id, exit }) => {
                        let _ = events.send(PoolEvent::Exited { session_id, exit });
                    }
                    Ok(SessionEvent::Closed { .. }) => break,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        self.inner.sessions.lock().insert(
            session_id.clone(),
            PoolEntry {
                mux,
                command: command.clone(),
                started_at: Utc::now().to_rfc3339(),
            },
        );
        let _ = self.inner.events.send(PoolEvent::Started {
            session_id,
            command,
            pid,
        });
    }

    pub fn get(&self, session_id: &str) -> Option<Arc<SessionMultiplexer>> {
        self.inner
            .sessions
            .lock()
            .get(session_id)
            .map(|entry| entry.mux.clone())
    }

    pub fn list(&self) -> Vec<SessionInfo> {
        let sessions = self.inner.sessions.lock();
        let mut infos: Vec<SessionInfo> = sessions
            .iter()
            .map(|(session_id, entry)| SessionInfo {
                session_id: session_id.clone(),
                command: entry.command.clone(),
                pid: entry.mux.process_id(),
                latest_cursor: entry.mux.latest_cursor(),
                attachments: entry.mux.attachment_count(),
                closed: entry.mux.is_closed(),
                exit: entry.mux.exit_status(),
                started_at: entry.started_at.clone(),
            })
            .collect();
        infos.sort_by(|a, b| a.started_at.cmp(&b.started_at).then_with(|| a.session_id.cmp(&b.session_id)));
        infos
    }

    pub fn len(&self) -> usize {
        self.inner.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Close and forget a session. Returns `false` for unknown ids.
    pub fn close(&self, session_id: &str) -> bool {
        let Some(entry) = self.inner.sessions.lock().remove(session_id) else {
            return false;
        };
        entry.mux.close();
        tracing::info!(target = "agent_mux::sessions", session = %session_id, "session closed");
        let _ = self.inner.events.send(PoolEvent::Removed {
            session_id: session_id.to_string(),
        });
        true
    }

    pub fn shutdown_all(&self) {
        let ids: Vec<String> = self.inner.sessions.lock().keys().cloned().collect();
        for session_id in ids {
            self.close(&session_id);
        }
    }
}

/// Copy backend output into the multiplexer until EOF, then report how the
/// process ended.
async fn pump_output(
    mux: Arc<SessionMultiplexer>,
    backend: Arc<dyn SessionBackend>,
    mut output: mpsc::Receiver<Vec<u8>>,
) {
    while let Some(chunk) = output.recv().await {
        if mux.write(&chunk).is_none() {
            return;
        }
    }

    let mut exit = None;
    for _ in 0..EXIT_POLL_ATTEMPTS {
        match backend.try_wait() {
            Ok(Some(status)) => {
                exit = Some(status);
                break;
            }
            Ok(None) => tokio::time::sleep(EXIT_POLL_INTERVAL).await,
            Err(error) => {
                tracing::warn!(
                    target = "agent_mux::sessions",
                    session = %mux.session_id(),
                    error = %error,
                    "failed to collect exit status"
                );
                break;
            }
        }
    }

    if exit.is_none() {
        tracing::debug!(
            target = "agent_mux::sessions",
            session = %mux.session_id(),
            "output closed but exit status unavailable"
        );
    }
    mux.emit_exit(exit.unwrap_or_default());
}
