//! Backing processes for sessions.
//!
//! A [`SessionBackend`] is the write side of a session: keystrokes in, resize,
//! close. Output flows the other way through the `mpsc::Receiver<Vec<u8>>`
//! returned by each backend's `spawn`.
//!
//! Besides the in-process PTY ([`crate::pty::PtySession`]) a session can run
//! behind a PTY host helper process that speaks a small binary frame protocol
//! on its stdin:
//!
//! | opcode | layout                         | effect                     |
//! |--------|--------------------------------|----------------------------|
//! | `0x01` | `len: u32 BE` then `len` bytes | write bytes to the PTY     |
//! | `0x02` | `cols: u16 BE`, `rows: u16 BE` | set window size + SIGWINCH |
//! | `0x03` | none                           | SIGHUP the child           |
//!
//! Unknown opcodes skip a single byte. The helper copies PTY output verbatim to
//! its stdout and exits with the child's status.

use std::{
    io::{Read, Write},
    path::Path,
    process::{Child, ChildStdin, Command, Stdio},
    sync::Arc,
    thread,
};

use anyhow::{Context, Result};
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::{error::BackendError, types::SessionExit};

pub const OPCODE_DATA: u8 = 0x01;
pub const OPCODE_RESIZE: u8 = 0x02;
pub const OPCODE_CLOSE: u8 = 0x03;

pub trait SessionBackend: Send + Sync {
    fn write_input(&self, bytes: &[u8]) -> Result<(), BackendError>;
    fn resize(&self, cols: u16, rows: u16) -> Result<(), BackendError>;
    fn process_id(&self) -> Option<u32>;
    /// Non-blocking exit check. `Ok(None)` while the child is still running.
    fn try_wait(&self) -> Result<Option<SessionExit>, BackendError>;
    fn close(&self) -> Result<(), BackendError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HelperFrame {
    Data(Vec<u8>),
    Resize { cols: u16, rows: u16 },
    Close,
}

impl HelperFrame {
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Self::Data(payload) => {
                let mut out = Vec::with_capacity(5 + payload.len());
                out.push(OPCODE_DATA);
                out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
                out.extend_from_slice(payload);
                out
            }
            Self::Resize { cols, rows } => {
                let mut out = Vec::with_capacity(5);
                out.push(OPCODE_RESIZE);
                out.extend_from_slice(&cols.to_be_bytes());
                out.extend_from_slice(&rows.to_be_bytes());
                out
            }
            Self::Close => vec![OPCODE_CLOSE],
        }
    }
}

/// Incremental decoder for the helper's stdin. Incomplete frames stay buffered
/// until more bytes arrive.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    incoming: Vec<u8>,
}

impl FrameDecoder {
    pub fn push(&mut self, bytes: &[u8]) {
        self.incoming.extend_from_slice(bytes);
    }

    pub fn next_frame(&mut self) -> Option<HelperFrame> {
        loop {
            let opcode = *self.incoming.first()?;
            match opcode {
                OPCODE_DATA => {
                    if self.incoming.len() < 5 {
                        return None;
                    }
                    let len = u32::from_be_bytes([
                        self.incoming[1],
                        self.incoming[2],
                        self.incoming[3],
                        self.incoming[4],
                    ]) as usize;
                    if self.incoming.len() < 5 + len {
                        return None;
                    }
                    let payload = self.incoming[5..5 + len].to_vec();
                    self.incoming.drain(..5 + len);
                    return Some(HelperFrame::Data(payload));
                }
                OPCODE_RESIZE => {
                    if self.incoming.len() < 5 {
                        return None;
                    }
                    let cols = u16::from_be_bytes([self.incoming[1], self.incoming[2]]);
                    let rows = u16::from_be_bytes([self.incoming[3], self.incoming[4]]);
                    self.incoming.drain(..5);
                    return Some(HelperFrame::Resize { cols, rows });
                }
                OPCODE_CLOSE => {
                    self.incoming.drain(..1);
                    return Some(HelperFrame::Close);
                }
                _ => {
                    self.incoming.drain(..1);
                }
            }
        }
    }
}

/// Map a process status to the shell convention: exit code, or `128 + signo`.
pub fn exit_from_status(status: std::process::ExitStatus) -> SessionExit {
    if let Some(code) = status.code() {
        return SessionExit { code: Some(code), signal: None };
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signo) = status.signal() {
            return SessionExit {
                code: Some(128 + signo),
                signal: Some(signal_name(signo)),
            };
        }
    }
    SessionExit { code: Some(1), signal: None }
}

#[cfg(unix)]
fn signal_name(signo: i32) -> String {
    let name = match signo {
        libc::SIGHUP => "SIGHUP",
        libc::SIGINT => "SIGINT",
        libc::SIGQUIT => "SIGQUIT",
        libc::SIGILL => "SIGILL",
        libc::SIGABRT => "SIGABRT",
        libc::SIGBUS => "SIGBUS",
        libc::SIGFPE => "SIGFPE",
        libc::SIGKILL => "SIGKILL",
        libc::SIGSEGV => "SIGSEGV",
        libc::SIGPIPE => "SIGPIPE",
        libc::SIGALRM => "SIGALRM",
        libc::SIGTERM => "SIGTERM",
        libc::SIGUSR1 => "SIGUSR1",
        libc::SIGUSR2 => "SIGUSR2",
        _ => return format!("SIG{signo}"),
    };
    name.to_string()
}

/// Session backed by a PTY host helper (`agent-mux pty-host -- <cmd>`, or any
/// binary speaking the same frames).
pub struct FramedHelperBackend {
    stdin: Mutex<Option<ChildStdin>>,
    child: Arc<Mutex<Child>>,
    pid: u32,
}

impl FramedHelperBackend {
    pub fn spawn(
        helper: &Path,
        command: &str,
        args: &[String],
        cwd: Option<&Path>,
        cols: u16,
        rows: u16,
    ) -> Result<(Self, mpsc::Receiver<Vec<u8>>)> {
        let mut cmd = Command::new(helper);
        if helper_is_self(helper) {
            cmd.arg("pty-host").arg("--");
        }
        cmd.arg(command)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());
        if let Some(dir) = cwd {
            cmd.current_dir(dir);
        }

        let mut child = cmd
            .spawn()
            .with_context(|| format!("failed to spawn pty helper {}", helper.display()))?;
        let pid = child.id();
        let stdin = child.stdin.take().context("pty helper stdin was not piped")?;
        let mut stdout = child.stdout.take().context("pty helper stdout was not piped")?;

        let (tx, rx) = mpsc::channel(256);
        thread::spawn(move || {
            let mut buf = [0u8; 65_536];
            loop {
                match stdout.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        if tx.blocking_send(buf[..n].to_vec()).is_err() {
                            break;
                        }
                    }
                    Err(error) if error.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(_) => break,
                }
            }
        });

        let backend = Self {
            stdin: Mutex::new(Some(stdin)),
            child: Arc::new(Mutex::new(child)),
            pid,
        };
        backend.send_frame(&HelperFrame::Resize { cols, rows })?;
        Ok((backend, rx))
    }

    fn send_frame(&self, frame: &HelperFrame) -> Result<(), BackendError> {
        let mut guard = self.stdin.lock();
        let stdin = guard.as_mut().ok_or(BackendError::Closed)?;
        stdin.write_all(&frame.encode())?;
        stdin.flush()?;
        Ok(())
    }
}

fn helper_is_self(helper: &Path) -> bool {
    std::env::current_exe()
        .ok()
        .zip(std::fs::canonicalize(helper).ok())
        .is_some_and(|(exe, resolved)| exe == resolved)
}

impl SessionBackend for FramedHelperBackend {
    fn write_input(&self, bytes: &[u8]) -> Result<(), BackendError> {
        if bytes.is_empty() {
            return Ok(());
        }
        self.send_frame(&HelperFrame::Data(bytes.to_vec()))
    }

    fn resize(&self, cols: u16, rows: u16) -> Result<(), BackendError> {
        self.send_frame(&HelperFrame::Resize { cols, rows })
    }

    fn process_id(&self) -> Option<u32> {
        Some(self.pid)
    }

    fn try_wait(&self) -> Result<Option<SessionExit>, BackendError> {
        Ok(self.child.lock().try_wait()?.map(exit_from_status))
    }

    fn close(&self) -> Result<(), BackendError> {
        // The helper hangs up the child on CLOSE; dropping stdin makes it see EOF.
        let _ = self.send_frame(&HelperFrame::Close);
        self.stdin.lock().take();
        Ok(())
    }
}
