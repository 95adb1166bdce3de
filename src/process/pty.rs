//! PTY-backed children for visible agents
//!
//! A visible agent runs in a pseudo-terminal so it behaves as if a user were
//! watching it. Its output is mirrored to our own terminal as it arrives and
//! also captured, with escape sequences stripped, for the result record.

use super::launcher::{ChildProcess, LaunchSpec};
use super::{CapturedOutput, signal};
use async_trait::async_trait;
use parking_lot::Mutex;
use portable_pty::{Child, ChildKiller, CommandBuilder, MasterPty, PtySize, native_pty_system};
use std::io::{self, Read, Write};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// How often `wait` re-checks a PTY child; portable-pty only offers a
/// blocking wait.
const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

fn pty_err(e: impl std::fmt::Display) -> io::Error {
    io::Error::other(format!("PTY error: {}", e))
}

/// A child process running inside a pseudo-terminal
pub struct PtyChild {
    child: Box<dyn Child + Send + Sync>,
    /// Kept alive so the terminal stays open for the child
    _master: Box<dyn MasterPty + Send>,
    pid: u32,
    exit_code: Option<i32>,
    output: Arc<Mutex<Vec<u8>>>,
    reader: Option<JoinHandle<()>>,
    output_drain: Duration,
}

impl PtyChild {
    /// Spawn `spec` in a fresh PTY.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(spec: &LaunchSpec, output_drain: Duration) -> io::Result<Self> {
        let pty_system = native_pty_system();

        let size = PtySize {
            rows: 24,
            cols: 80,
            pixel_width: 0,
            pixel_height: 0,
        };

        let pair = pty_system.openpty(size).map_err(pty_err)?;

        let mut cmd = CommandBuilder::new(&spec.program);
        cmd.args(&spec.args);
        if let Ok(cwd) = std::env::current_dir() {
            cmd.cwd(cwd);
        }

        let child = pair.slave.spawn_command(cmd).map_err(pty_err)?;
        // Only the child should hold the slave side, or the reader never sees EOF.
        drop(pair.slave);

        let pid = child
            .process_id()
            .ok_or_else(|| io::Error::other("PTY child has no pid"))?;

        let mut reader = pair.master.try_clone_reader().map_err(pty_err)?;
        let output = Arc::new(Mutex::new(Vec::new()));
        let sink = output.clone();
        let reader = tokio::task::spawn_blocking(move || {
            let mut chunk = [0u8; 4096];
            let mut terminal = io::stdout();
            loop {
                match reader.read(&mut chunk) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        let _ = terminal.write_all(&chunk[..n]);
                        let _ = terminal.flush();
                        sink.lock().extend_from_slice(&chunk[..n]);
                    }
                }
            }
        });

        Ok(Self {
            child,
            _master: pair.master,
            pid,
            exit_code: None,
            output,
            reader: Some(reader),
            output_drain,
        })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }
}

#[async_trait]
impl ChildProcess for PtyChild {
    fn try_exit_code(&mut self) -> io::Result<Option<i32>> {
        if self.exit_code.is_some() {
            return Ok(self.exit_code);
        }
        if let Some(status) = self.child.try_wait()? {
            self.exit_code = Some(status.exit_code() as i32);
        }
        Ok(self.exit_code)
    }

    fn terminate(&mut self) -> io::Result<()> {
        if self.exit_code.is_some() {
            return Ok(());
        }
        // The PTY child leads its own session, so its pgid is its pid.
        signal::terminate_group(self.pid)
    }

    async fn kill(&mut self) -> io::Result<()> {
        if self.exit_code.is_some() {
            return Ok(());
        }
        if let Err(e) = self.child.kill() {
            tracing::debug!(pid = self.pid, "PTY kill failed: {}", e);
        }
        self.wait().await.map(|_| ())
    }

    async fn wait(&mut self) -> io::Result<i32> {
        loop {
            if let Some(code) = self.try_exit_code()? {
                return Ok(code);
            }
            tokio::time::sleep(WAIT_POLL_INTERVAL).await;
        }
    }

    async fn take_output(&mut self) -> CapturedOutput {
        if let Some(mut reader) = self.reader.take() {
            if tokio::time::timeout(self.output_drain, &mut reader).await.is_err() {
                tracing::debug!(pid = self.pid, "PTY output still open after drain window");
            }
        }
        let raw = std::mem::take(&mut *self.output.lock());
        let clean = strip_ansi_escapes::strip(&raw);
        CapturedOutput {
            stdout: String::from_utf8_lossy(&clean).into_owned(),
            // A PTY merges both streams.
            stderr: String::new(),
        }
    }
}

impl std::fmt::Debug for PtyChild {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PtyChild")
            .field("pid", &self.pid)
            .field("exit_code", &self.exit_code)
            .finish()
    }
}
