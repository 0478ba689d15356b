//! Per-session output multiplexer.
//!
//! One multiplexer owns one backing process's output. Every chunk written gets
//! the next cursor and lands in a backlog, so readers can attach at any point
//! in history: [`SessionMultiplexer::attach`] replays every retained entry
//! after the requested cursor and registers the sink under the same lock that
//! [`SessionMultiplexer::write`] takes. A reader therefore sees each cursor
//! exactly once, in order, with no gap between replay and live delivery.
//!
//! Sinks run synchronously on the writer's task while the session lock is
//! held. They must not call back into the same multiplexer; use
//! [`ChannelSink`] to hand chunks off to a per-attachment queue.

use std::{
    collections::{BTreeMap, VecDeque},
    sync::Arc,
};

use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};

use crate::{
    backend::SessionBackend,
    terminal_buffer::{TerminalBuffer, TerminalSnapshot},
    types::{AttachmentId, Cursor, SessionExit},
};

pub const DEFAULT_BACKLOG_MAX_BYTES: usize = 8 * 1024 * 1024;

/// Returned by a sink that can no longer accept output. The multiplexer drops
/// the attachment; other attachments are unaffected.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("attachment sink closed")]
pub struct SinkClosed;

pub trait AttachmentSink: Send + Sync {
    fn on_data(&self, cursor: Cursor, chunk: &[u8]) -> Result<(), SinkClosed>;

    fn on_exit(&self, _exit: &SessionExit) {}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttachmentEvent {
    Data { cursor: Cursor, chunk: Vec<u8> },
    Exit(SessionExit),
}

/// Queues everything for one attachment on an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<AttachmentEvent>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<AttachmentEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl AttachmentSink for ChannelSink {
    fn on_data(&self, cursor: Cursor, chunk: &[u8]) -> Result<(), SinkClosed> {
        self.tx
            .send(AttachmentEvent::Data {
                cursor,
                chunk: chunk.to_vec(),
            })
            .map_err(|_| SinkClosed)
    }

    fn on_exit(&self, exit: &SessionExit) {
        let _ = self.tx.send(AttachmentEvent::Exit(exit.clone()));
    }
}

/// How much history a session keeps for late attachers. The newest entry is
/// always retained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BacklogPolicy {
    pub max_entries: Option<usize>,
    pub max_bytes: Option<usize>,
}

impl BacklogPolicy {
    pub const UNBOUNDED: Self = Self {
        max_entries: None,
        max_bytes: None,
    };

    pub fn bounded_bytes(max_bytes: usize) -> Self {
        Self {
            max_entries: None,
            max_bytes: Some(max_bytes),
        }
    }

    fn exceeded(&self, entries: usize, bytes: usize) -> bool {
        self.max_entries.is_some_and(|max| entries > max)
            || self.max_bytes.is_some_and(|max| bytes > max)
    }
}

impl Default for BacklogPolicy {
    fn default() -> Self {
        Self::bounded_bytes(DEFAULT_BACKLOG_MAX_BYTES)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BacklogEntry {
    pub cursor: Cursor,
    pub chunk: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Attached {
    pub attachment_id: AttachmentId,
    /// Entries replayed before live delivery began.
    pub replayed: usize,
    /// Set when the requested cursor is older than the retained backlog; holds
    /// the oldest cursor that was still available.
    pub gap: Option<Cursor>,
}

/// Lifecycle notifications for the multiplexer's own listeners, independent of
/// attachments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SessionEvent {
    Exited {
        session_id: String,
        exit: SessionExit,
    },
    Closed {
        session_id: String,
    },
}

struct MuxState {
    latest: Cursor,
    backlog: VecDeque<BacklogEntry>,
    backlog_bytes: usize,
    attachments: BTreeMap<AttachmentId, Box<dyn AttachmentSink>>,
    next_attachment_id: AttachmentId,
    terminal: Box<dyn TerminalBuffer>,
    exit: Option<SessionExit>,
    closed: bool,
}

pub struct SessionMultiplexer {
    session_id: String,
    backend: Option<Arc<dyn SessionBackend>>,
    policy: BacklogPolicy,
    events_tx: broadcast::Sender<SessionEvent>,
    state: Mutex<MuxState>,
}

impl SessionMultiplexer {
    pub fn new(
        session_id: impl Into<String>,
        backend: Option<Arc<dyn SessionBackend>>,
        policy: BacklogPolicy,
        terminal: Box<dyn TerminalBuffer>,
    ) -> Self {
        let (events_tx, _) = broadcast::channel(16);
        Self {
            session_id: session_id.into(),
            backend,
            policy,
            events_tx,
            state: Mutex::new(MuxState {
                latest: 0,
                backlog: VecDeque::new(),
                backlog_bytes: 0,
                attachments: BTreeMap::new(),
                next_attachment_id: 1,
                terminal,
                exit: None,
                closed: false,
            }),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn process_id(&self) -> Option<u32> {
        self.backend.as_ref().and_then(|backend| backend.process_id())
    }

    pub fn latest_cursor(&self) -> Cursor {
        self.state.lock().latest
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn exit_status(&self) -> Option<SessionExit> {
        self.state.lock().exit.clone()
    }

    pub fn attachment_count(&self) -> usize {
        self.state.lock().attachments.len()
    }

    /// Number of retained entries an attach at `since_cursor` would replay.
    pub fn retained_since(&self, since_cursor: Cursor) -> usize {
        self.state
            .lock()
            .backlog
            .iter()
            .filter(|entry| entry.cursor > since_cursor)
            .count()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events_tx.subscribe()
    }

    /// Replay every retained entry with `cursor > since_cursor`, then register
    /// `sink` for live output. Returns `None` once the session is closed.
    ///
    /// Attaching to a session whose process already exited replays the
    /// backlog and then reports the exit to the new sink.
    pub fn attach(&self, sink: Box<dyn AttachmentSink>, since_cursor: Cursor) -> Option<Attached> {
        let mut state = self.state.lock();
        if state.closed {
            return None;
        }

        let oldest = state.backlog.front().map(|entry| entry.cursor);
        let gap = oldest.filter(|oldest| since_cursor.saturating_add(1) < *oldest);
        if let Some(oldest) = gap {
            tracing::warn!(
                target = "agent_mux::multiplexer",
                session = %self.session_id,
                since_cursor,
                oldest_available = oldest,
                "attach requested history older than the retained backlog"
            );
        }

        let mut replayed = 0;
        for entry in state.backlog.iter().filter(|entry| entry.cursor > since_cursor) {
            if sink.on_data(entry.cursor, &entry.chunk).is_err() {
                tracing::debug!(
                    target = "agent_mux::multiplexer",
                    session = %self.session_id,
                    cursor = entry.cursor,
                    "sink closed during replay; not registering"
                );
                return None;
            }
            replayed += 1;
        }

        if let Some(exit) = &state.exit {
            sink.on_exit(exit);
        }

        let attachment_id = state.next_attachment_id;
        state.next_attachment_id += 1;
        state.attachments.insert(attachment_id, sink);

        tracing::debug!(
            target = "agent_mux::multiplexer",
            session = %self.session_id,
            attachment_id,
            since_cursor,
            replayed,
            "attached"
        );
        Some(Attached {
            attachment_id,
            replayed,
            gap,
        })
    }

    pub fn detach(&self, attachment_id: AttachmentId) -> bool {
        self.state.lock().attachments.remove(&attachment_id).is_some()
    }

    /// Record one chunk of process output. Returns the cursor assigned to it,
    /// or `None` when the session is closed.
    pub fn write(&self, data: &[u8]) -> Option<Cursor> {
        let mut state = self.state.lock();
        if state.closed {
            return None;
        }

        state.latest += 1;
        let cursor = state.latest;
        state.backlog_bytes += data.len();
        state.backlog.push_back(BacklogEntry {
            cursor,
            chunk: data.to_vec(),
        });
        while state.backlog.len() > 1
            && self.policy.exceeded(state.backlog.len(), state.backlog_bytes)
        {
            if let Some(evicted) = state.backlog.pop_front() {
                state.backlog_bytes -= evicted.chunk.len();
            }
        }

        state.terminal.ingest(data);

        let failed: Vec<AttachmentId> = state
            .attachments
            .iter()
            .filter(|(_, sink)| sink.on_data(cursor, data).is_err())
            .map(|(id, _)| *id)
            .collect();
        for attachment_id in failed {
            state.attachments.remove(&attachment_id);
            tracing::debug!(
                target = "agent_mux::multiplexer",
                session = %self.session_id,
                attachment_id,
                "sink closed; attachment deactivated"
            );
        }

        Some(cursor)
    }

    /// Forward keystrokes to the backing process.
    pub fn send_input(&self, data: &[u8]) -> bool {
        if self.is_closed() {
            return false;
        }
        let Some(backend) = &self.backend else {
            return false;
        };
        match backend.write_input(data) {
            Ok(()) => true,
            Err(error) => {
                tracing::warn!(
                    target = "agent_mux::multiplexer",
                    session = %self.session_id,
                    error = %error,
                    "failed to forward input"
                );
                false
            }
        }
    }

    pub fn resize(&self, cols: u16, rows: u16) {
        let mut state = self.state.lock();
        if state.closed {
            return;
        }
        if let Some(backend) = &self.backend {
            if let Err(error) = backend.resize(cols, rows) {
                tracing::warn!(
                    target = "agent_mux::multiplexer",
                    session = %self.session_id,
                    error = %error,
                    "backend resize failed"
                );
            }
        }
        state.terminal.resize(cols, rows);
    }

    pub fn snapshot(&self) -> TerminalSnapshot {
        self.state.lock().terminal.snapshot()
    }

    pub fn buffer_tail(&self, lines: usize) -> Vec<String> {
        self.state.lock().terminal.buffer_tail(lines)
    }

    /// Release the backing process. Every later operation is a no-op and all
    /// attachments are dropped.
    pub fn close(&self) {
        {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            state.attachments.clear();
        }
        if let Some(backend) = &self.backend {
            if let Err(error) = backend.close() {
                tracing::debug!(
                    target = "agent_mux::multiplexer",
                    session = %self.session_id,
                    error = %error,
                    "backend close failed"
                );
            }
        }
        let _ = self.events_tx.send(SessionEvent::Closed {
            session_id: self.session_id.clone(),
        });
    }

    /// Tell every attachment the process exited, then notify lifecycle
    /// listeners. Only the first call has any effect.
    pub fn emit_exit(&self, exit: SessionExit) -> bool {
        {
            let mut state = self.state.lock();
            if state.closed || state.exit.is_some() {
                return false;
            }
            for sink in state.attachments.values() {
                sink.on_exit(&exit);
            }
            state.exit = Some(exit.clone());
        }
        tracing::info!(
            target = "agent_mux::multiplexer",
            session = %self.session_id,
            code = ?exit.code,
            signal = ?exit.signal,
            "session exited"
        );
        let _ = self.events_tx.send(SessionEvent::Exited {
            session_id: self.session_id.clone(),
            exit,
        });
        true
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use parking_lot::Mutex;

    use super::*;
    use crate::terminal_buffer::PlainTextBuffer;

    fn mux(policy: BacklogPolicy) -> SessionMultiplexer {
        SessionMultiplexer::new("s1", None, policy, Box::new(PlainTextBuffer::new(80, 24)))
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<AttachmentEvent>) -> Vec<AttachmentEvent> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            out.push(event);
        }
        out
    }

    fn cursors(events: &[AttachmentEvent]) -> Vec<Cursor> {
        events
            .iter()
            .filter_map(|event| match event {
                AttachmentEvent::Data { cursor, .. } => Some(*cursor),
                AttachmentEvent::Exit(_) => None,
            })
            .collect()
    }

    #[test]
    fn late_attachers_replay_then_receive_live() {
        let mux = mux(BacklogPolicy::UNBOUNDED);
        assert_eq!(mux.write(b"one"), Some(1));
        assert_eq!(mux.write(b"two"), Some(2));

        let (sink_a, mut rx_a) = ChannelSink::new();
        let a = mux.attach(Box::new(sink_a), 0).unwrap();
        assert_eq!(a.replayed, 2);
        assert_eq!(
            drain(&mut rx_a),
            vec![
                AttachmentEvent::Data { cursor: 1, chunk: b"one".to_vec() },
                AttachmentEvent::Data { cursor: 2, chunk: b"two".to_vec() },
            ]
        );

        let (sink_b, mut rx_b) = ChannelSink::new();
        let b = mux.attach(Box::new(sink_b), 2).unwrap();
        assert_eq!(b.replayed, 0);
        assert!(drain(&mut rx_b).is_empty());

        assert_eq!(mux.write(b"three"), Some(3));
        assert_eq!(cursors(&drain(&mut rx_a)), vec![3]);
        assert_eq!(cursors(&drain(&mut rx_b)), vec![3]);
    }

    #[test]
    fn every_since_cursor_sees_exactly_the_suffix() {
        let mux = mux(BacklogPolicy::UNBOUNDED);
        for i in 0..6u8 {
            mux.write(&[i]);
        }
        for since in 0..=7 {
            let (sink, mut rx) = ChannelSink::new();
            mux.attach(Box::new(sink), since).unwrap();
            let expected: Vec<Cursor> = ((since + 1)..=6).collect();
            assert_eq!(cursors(&drain(&mut rx)), expected, "since={since}");
        }
    }

    #[test]
    fn detached_sinks_receive_nothing() {
        let mux = mux(BacklogPolicy::UNBOUNDED);
        let (sink, mut rx) = ChannelSink::new();
        let attached = mux.attach(Box::new(sink), 0).unwrap();
        assert!(mux.detach(attached.attachment_id));
        assert!(!mux.detach(attached.attachment_id));
        mux.write(b"after");
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn failed_sink_is_dropped_without_affecting_siblings() {
        let mux = mux(BacklogPolicy::UNBOUNDED);
        let (broken, broken_rx) = ChannelSink::new();
        let (healthy, mut healthy_rx) = ChannelSink::new();
        mux.attach(Box::new(broken), 0).unwrap();
        mux.attach(Box::new(healthy), 0).unwrap();
        drop(broken_rx);

        assert_eq!(mux.write(b"x"), Some(1));
        assert_eq!(mux.attachment_count(), 1);
        assert_eq!(cursors(&drain(&mut healthy_rx)), vec![1]);
    }

    #[test]
    fn bounded_backlog_reports_gap() {
        let policy = BacklogPolicy {
            max_entries: Some(2),
            max_bytes: None,
        };
        let mux = mux(policy);
        for chunk in [b"a", b"b", b"c", b"d"] {
            mux.write(chunk);
        }
        let (sink, mut rx) = ChannelSink::new();
        let attached = mux.attach(Box::new(sink), 0).unwrap();
        assert_eq!(attached.gap, Some(3));
        assert_eq!(cursors(&drain(&mut rx)), vec![3, 4]);

        let (sink, _rx) = ChannelSink::new();
        assert_eq!(mux.attach(Box::new(sink), 2).unwrap().gap, None);
    }

    #[test]
    fn byte_budget_keeps_newest_entry() {
        let mux = mux(BacklogPolicy::bounded_bytes(4));
        mux.write(b"aaa");
        mux.write(b"bbbbbbbb");
        let (sink, mut rx) = ChannelSink::new();
        mux.attach(Box::new(sink), 0).unwrap();
        assert_eq!(cursors(&drain(&mut rx)), vec![2]);
    }

    #[test]
    fn closed_session_ignores_everything() {
        let mux = mux(BacklogPolicy::UNBOUNDED);
        mux.write(b"x");
        mux.close();
        assert!(mux.is_closed());
        assert_eq!(mux.write(b"y"), None);
        assert_eq!(mux.latest_cursor(), 1);
        let (sink, _rx) = ChannelSink::new();
        assert!(mux.attach(Box::new(sink), 0).is_none());
        assert!(!mux.emit_exit(SessionExit::default()));
        assert!(!mux.send_input(b"z"));
    }

    struct Recording {
        log: Arc<Mutex<Vec<String>>>,
        name: &'static str,
    }

    impl AttachmentSink for Recording {
        fn on_data(&self, cursor: Cursor, _chunk: &[u8]) -> Result<(), SinkClosed> {
            self.log.lock().push(format!("{}:data:{cursor}", self.name));
            Ok(())
        }

        fn on_exit(&self, exit: &SessionExit) {
            self.log
                .lock()
                .push(format!("{}:exit:{:?}", self.name, exit.code));
        }
    }

    #[tokio::test]
    async fn emit_exit_notifies_attachments_then_listeners_once() {
        let mux = mux(BacklogPolicy::UNBOUNDED);
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut events = mux.subscribe_events();
        mux.attach(Box::new(Recording { log: log.clone(), name: "a" }), 0)
            .unwrap();

        let exit = SessionExit {
            code: Some(0),
            signal: None,
        };
        assert!(mux.emit_exit(exit.clone()));
        assert!(!mux.emit_exit(exit.clone()));

        assert_eq!(*log.lock(), vec!["a:exit:Some(0)".to_string()]);
        assert_eq!(
            events.recv().await.unwrap(),
            SessionEvent::Exited {
                session_id: "s1".into(),
                exit: exit.clone(),
            }
        );
        assert!(events.try_recv().is_err());

        let late = Arc::new(Mutex::new(Vec::new()));
        mux.attach(Box::new(Recording { log: late.clone(), name: "b" }), 0)
            .unwrap();
        assert_eq!(*late.lock(), vec!["b:exit:Some(0)".to_string()]);
    }

    #[test]
    fn write_feeds_terminal_buffer() {
        let mux = mux(BacklogPolicy::UNBOUNDED);
        mux.write(b"\x1b[32mready\x1b[0m\r\n$ ");
        assert_eq!(mux.buffer_tail(2), vec!["ready", "$ "]);
        mux.resize(100, 30);
        assert_eq!(mux.snapshot().cols, 100);
    }

    #[test]
    fn attach_racing_writes_sees_every_cursor_once() {
        const CHUNKS: u64 = 2_000;
        let mux = Arc::new(mux(BacklogPolicy::UNBOUNDED));

        let writer = {
            let mux = mux.clone();
            std::thread::spawn(move || {
                for n in 0..CHUNKS {
                    mux.write(format!("{n} ").as_bytes());
                }
            })
        };

        let mut attached = Vec::new();
        while attached.len() < 16 {
            let since = mux.latest_cursor().saturating_sub(3);
            let (sink, rx) = ChannelSink::new();
            mux.attach(Box::new(sink), since).unwrap();
            attached.push((since, rx));
            std::thread::yield_now();
        }
        writer.join().unwrap();

        for (since, mut rx) in attached {
            let seen = cursors(&drain(&mut rx));
            let expected: Vec<Cursor> = (since + 1..=CHUNKS).collect();
            assert_eq!(seen, expected, "attachment since {since}");
        }
    }
}
