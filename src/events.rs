//! Process-level logging and the `--json-output` lifecycle feed.
//!
//! Diagnostics go through `tracing` to stderr. Supervisors that want
//! machine-readable state instead get one JSON object per line for each
//! [`LifecycleEvent`], stamped with an RFC 3339 `ts`.

use std::{
    io::{self, Write},
    sync::Arc,
};

use anyhow::Result;
use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tracing_subscriber::{fmt, EnvFilter};

use crate::session_pool::PoolEvent;

pub fn init_logging(log_level: &str) -> Result<()> {
    let filter = EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(filter)
        .with_target(true)
        .with_ansi(true)
        .with_writer(io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum LifecycleEvent<'a> {
    Listening {
        addr: &'a str,
    },
    SessionStarted {
        session_id: &'a str,
        command: &'a str,
        pid: Option<u32>,
    },
    SessionExited {
        session_id: &'a str,
        code: Option<i32>,
        signal: Option<&'a str>,
    },
    SessionRemoved {
        session_id: &'a str,
    },
    ShuttingDown,
}

impl<'a> From<&'a PoolEvent> for LifecycleEvent<'a> {
    fn from(event: &'a PoolEvent) -> Self {
        match event {
            PoolEvent::Started {
                session_id,
                command,
                pid,
            } => Self::SessionStarted {
                session_id,
                command,
                pid: *pid,
            },
            PoolEvent::Exited { session_id, exit } => Self::SessionExited {
                session_id,
                code: exit.code,
                signal: exit.signal.as_deref(),
            },
            PoolEvent::Removed { session_id } => Self::SessionRemoved { session_id },
        }
    }
}

type LineWriter = Arc<Mutex<Box<dyn Write + Send>>>;

/// Writes [`LifecycleEvent`] lines when `--json-output` is set; otherwise a
/// no-op.
#[derive(Clone)]
pub struct EventEmitter {
    out: Option<LineWriter>,
}

impl EventEmitter {
    pub fn new(json_output: bool) -> Self {
        if json_output {
            Self::to_writer(io::stderr())
        } else {
            Self { out: None }
        }
    }

    pub fn to_writer(writer: impl Write + Send + 'static) -> Self {
        Self {
            out: Some(Arc::new(Mutex::new(Box::new(writer)))),
        }
    }

    pub fn enabled(&self) -> bool {
        self.out.is_some()
    }

    pub fn emit(&self, event: &LifecycleEvent<'_>) {
        let Some(out) = &self.out else {
            return;
        };
        let Ok(Value::Object(fields)) = serde_json::to_value(event) else {
            return;
        };
        let mut line = serde_json::Map::with_capacity(fields.len() + 1);
        line.insert("ts".into(), Value::String(Utc::now().to_rfc3339()));
        line.extend(fields);

        let mut out = out.lock();
        let _ = writeln!(out, "{}", Value::Object(line));
        let _ = out.flush();
    }
}

impl std::fmt::Debug for EventEmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventEmitter")
            .field("enabled", &self.enabled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::{io::Write, sync::Arc};

    use parking_lot::Mutex;
    use serde_json::Value;

    use super::{EventEmitter, LifecycleEvent};
    use crate::{session_pool::PoolEvent, types::SessionExit};

    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl Write for Captured {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl Captured {
        fn lines(&self) -> Vec<Value> {
            String::from_utf8_lossy(&self.0.lock())
                .lines()
                .map(|line| serde_json::from_str(line).unwrap())
                .collect()
        }
    }

    #[test]
    fn disabled_emitter_writes_nothing() {
        let emitter = EventEmitter::new(false);
        assert!(!emitter.enabled());
        emitter.emit(&LifecycleEvent::ShuttingDown);
    }

    #[test]
    fn pool_events_become_timestamped_lines() {
        let captured = Captured::default();
        let emitter = EventEmitter::to_writer(captured.clone());

        emitter.emit(&LifecycleEvent::Listening { addr: "127.0.0.1:3890" });
        let exited = PoolEvent::Exited {
            session_id: "s1".into(),
            exit: SessionExit {
                code: Some(137),
                signal: Some("SIGKILL".into()),
            },
        };
        emitter.emit(&LifecycleEvent::from(&exited));

        let lines = captured.lines();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["type"], "listening");
        assert_eq!(lines[0]["addr"], "127.0.0.1:3890");
        assert!(lines[0]["ts"].is_string());
        assert_eq!(lines[1]["type"], "session_exited");
        assert_eq!(lines[1]["sessionId"], "s1");
        assert_eq!(lines[1]["code"], 137);
        assert_eq!(lines[1]["signal"], "SIGKILL");
    }
}
