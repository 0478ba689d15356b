use std::{
    env,
    ffi::OsString,
    io::{Read, Write},
    path::Path,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};

use anyhow::{Context, Result};
use parking_lot::Mutex;
use portable_pty::{native_pty_system, CommandBuilder, PtySize};
use tokio::{io::AsyncWriteExt, sync::mpsc};

use crate::{
    backend::{FrameDecoder, HelperFrame, SessionBackend},
    error::BackendError,
    types::SessionExit,
};

pub struct PtySession {
    master: Mutex<Box<dyn portable_pty::MasterPty + Send>>,
    writer: Arc<Mutex<Box<dyn Write + Send>>>,
    child: Arc<Mutex<Box<dyn portable_pty::Child + Send>>>,
    child_pid: Option<u32>,
    /// First observed exit; later polls return it unchanged.
    exit: Mutex<Option<SessionExit>>,
    closed: AtomicBool,
}

fn canonicalize_display(path: &Path) -> String {
    std::fs::canonicalize(path)
        .ok()
        .and_then(|resolved| resolved.to_str().map(|s| s.to_string()))
        .unwrap_or_else(|| path.to_string_lossy().to_string())
}

fn resolve_command_path(command: &str) -> String {
    if command.contains('/') || command.contains('\\') || command.starts_with('.') {
        return canonicalize_display(Path::new(command));
    }

    let path_env = env::var_os("PATH")
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| {
            #[cfg(unix)]
            {
                OsString::from("/usr/local/bin:/usr/bin:/bin:/opt/homebrew/bin")
            }
            #[cfg(windows)]
            {
                OsString::from(r"C:\Windows\System32;C:\Windows")
            }
        });

    for dir in env::split_paths(&path_env) {
        let candidate = dir.join(command);
        if candidate.is_file() {
            return canonicalize_display(&candidate);
        }
    }

    command.to_string()
}

fn pty_size(cols: u16, rows: u16) -> PtySize {
    PtySize {
        rows,
        cols,
        pixel_width: 0,
        pixel_height: 0,
    }
}

impl PtySession {
    pub fn spawn(
        command: &str,
        args: &[String],
        cwd: Option<&Path>,
        cols: u16,
        rows: u16,
    ) -> Result<(Self, mpsc::Receiver<Vec<u8>>)> {
        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(pty_size(cols, rows))
            .context("failed to open pty")?;

        let resolved_command = resolve_command_path(command);
        let mut cmd = CommandBuilder::new(&resolved_command);
        match cwd {
            Some(dir) => cmd.cwd(dir),
            None => cmd.cwd(env::current_dir().context("failed to get current directory")?),
        }
        for arg in args {
            cmd.arg(arg);
        }

        let child = pair
            .slave
            .spawn_command(cmd)
            .with_context(|| format!("failed to spawn session command '{resolved_command}'"))?;
        let child_pid = child.process_id();

        let mut reader = pair
            .master
            .try_clone_reader()
            .context("failed to clone pty reader")?;
        let writer = pair
            .master
            .take_writer()
            .context("failed to take pty writer")?;

        let (tx, rx) = mpsc::channel(256);
        thread::spawn(move || {
            let mut buf = [0u8; 4096];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        if tx.blocking_send(buf[..n].to_vec()).is_err() {
                            break;
                        }
                    }
                    Err(_) => break,
                }
            }
        });

        Ok((
            Self {
                master: Mutex::new(pair.master),
                writer: Arc::new(Mutex::new(writer)),
                child: Arc::new(Mutex::new(child)),
                child_pid,
                exit: Mutex::new(None),
                closed: AtomicBool::new(false),
            },
            rx,
        ))
    }

    pub fn write_all(&self, bytes: &[u8]) -> Result<(), BackendError> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(BackendError::Closed);
        }
        let mut guard = self.writer.lock();
        guard.write_all(bytes)?;
        guard.flush()?;
        Ok(())
    }

    /// Send SIGHUP to the child, the same thing a closing terminal does.
    pub fn hangup(&self) {
        if self.exit.lock().is_some() {
            return;
        }
        #[cfg(unix)]
        if let Some(pid) = self.child_pid {
            // SAFETY: plain kill(2) on a pid we spawned.
            let _ = unsafe { libc::kill(pid as libc::pid_t, libc::SIGHUP) };
            return;
        }
        let _ = self.child.lock().kill();
    }

    pub fn shutdown(&self) -> Result<()> {
        self.closed.store(true, Ordering::Relaxed);
        let mut exit = self.exit.lock();
        if exit.is_some() {
            return Ok(());
        }
        #[cfg(unix)]
        if let Some(pid) = self.child_pid {
            // SAFETY: kill(2) on a child that has not been reaped yet.
            let _ = unsafe { libc::kill(pid as libc::pid_t, libc::SIGKILL) };
            *exit = Some(reap(pid, 0)?.unwrap_or_default());
            return Ok(());
        }
        let mut child = self.child.lock();
        let _ = child.kill();
        let status = child.wait().context("failed to wait for session child")?;
        *exit = Some(SessionExit {
            code: Some(status.exit_code() as i32),
            signal: None,
        });
        Ok(())
    }

    fn poll_exit(&self) -> Result<Option<SessionExit>, BackendError> {
        #[cfg(unix)]
        if let Some(pid) = self.child_pid {
            return reap(pid, libc::WNOHANG).map_err(BackendError::from);
        }
        Ok(self.child.lock().try_wait()?.map(|status| SessionExit {
            code: Some(status.exit_code() as i32),
            signal: None,
        }))
    }
}

/// waitpid(2) on our own child. portable-pty only keeps a signal's
/// description, so reaping here is what preserves `128 + signo`.
#[cfg(unix)]
fn reap(pid: u32, flags: libc::c_int) -> std::io::Result<Option<SessionExit>> {
    use std::os::unix::process::ExitStatusExt;

    use crate::backend::exit_from_status;

    let mut status: libc::c_int = 0;
    loop {
        // SAFETY: `status` is a valid out pointer for the duration of the call.
        let rc = unsafe { libc::waitpid(pid as libc::pid_t, &mut status, flags) };
        if rc == 0 {
            return Ok(None);
        }
        if rc > 0 {
            return Ok(Some(exit_from_status(std::process::ExitStatus::from_raw(
                status,
            ))));
        }
        let error = std::io::Error::last_os_error();
        match error.raw_os_error() {
            Some(libc::EINTR) => continue,
            Some(libc::ECHILD) => return Ok(Some(SessionExit::default())),
            _ => return Err(error),
        }
    }
}

impl SessionBackend for PtySession {
    fn write_input(&self, bytes: &[u8]) -> Result<(), BackendError> {
        self.write_all(bytes)
    }

    fn resize(&self, cols: u16, rows: u16) -> Result<(), BackendError> {
        self.master
            .lock()
            .resize(pty_size(cols, rows))
            .map_err(|error| BackendError::Pty(error.to_string()))
    }

    fn process_id(&self) -> Option<u32> {
        self.child_pid
    }

    fn try_wait(&self) -> Result<Option<SessionExit>, BackendError> {
        let mut cached = self.exit.lock();
        if let Some(exit) = cached.as_ref() {
            return Ok(Some(exit.clone()));
        }

        match self.poll_exit() {
            Ok(Some(exit)) => {
                tracing::debug!(
                    target = "agent_mux::pty",
                    pid = ?self.child_pid,
                    code = ?exit.code,
                    signal = ?exit.signal,
                    "child reaped"
                );
                *cached = Some(exit.clone());
                Ok(Some(exit))
            }
            Ok(None) => Ok(None),
            Err(error) => {
                tracing::debug!(
                    target = "agent_mux::pty",
                    pid = ?self.child_pid,
                    error = %error,
                    "wait failed; treating child as exited"
                );
                let exit = SessionExit::default();
                *cached = Some(exit.clone());
                Ok(Some(exit))
            }
        }
    }

    fn close(&self) -> Result<(), BackendError> {
        self.shutdown()
            .map_err(|error| BackendError::Pty(error.to_string()))
    }
}

/// Run `command` in a PTY, reading control frames from stdin and copying PTY
/// output to stdout. Returns the child's exit code.
pub async fn run_pty_host(command: &str, args: &[String]) -> Result<i32> {
    let (pty, mut rx) = PtySession::spawn(command, args, None, 80, 24)?;
    let pty = Arc::new(pty);

    let input = pty.clone();
    thread::spawn(move || {
        let mut decoder = FrameDecoder::default();
        let mut stdin = std::io::stdin().lock();
        let mut buf = [0u8; 65_536];
        loop {
            let n = match stdin.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(error) if error.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(_) => break,
            };
            decoder.push(&buf[..n]);
            while let Some(frame) = decoder.next_frame() {
                match frame {
                    HelperFrame::Data(bytes) => {
                        if input.write_all(&bytes).is_err() {
                            return;
                        }
                    }
                    HelperFrame::Resize { cols, rows } => {
                        if let Err(error) = SessionBackend::resize(input.as_ref(), cols, rows) {
                            tracing::warn!(target = "agent_mux::pty", error = %error, "resize failed");
                        }
                    }
                    HelperFrame::Close => input.hangup(),
                }
            }
        }
    });

    let mut stdout = tokio::io::stdout();
    while let Some(chunk) = rx.recv().await {
        stdout.write_all(&chunk).await?;
        stdout.flush().await?;
    }

    loop {
        if let Some(exit) = pty.try_wait()? {
            return Ok(exit.code.unwrap_or(1));
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}
