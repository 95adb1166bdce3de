//! Launching child processes
//!
//! Hidden agents run with piped stdout/stderr; visible agents run in a PTY
//! (see `pty.rs`). Either way the dispatcher gets a `ChildProcess`.

use super::pty::PtyChild;
use super::{CapturedOutput, exit_code_of, signal};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;

/// Fully resolved process invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    /// Attach to a visible terminal instead of capturing silently
    pub visible: bool,
}

/// A running child the dispatcher can inspect, signal and reap
#[async_trait]
pub trait ChildProcess: Send {
    /// Exit code if the child has exited, `None` while it is still running.
    fn try_exit_code(&mut self) -> io::Result<Option<i32>>;

    /// Ask the child to shut down (SIGTERM).
    fn terminate(&mut self) -> io::Result<()>;

    /// Force the child down and reap it.
    async fn kill(&mut self) -> io::Result<()>;

    /// Block until the child exits.
    async fn wait(&mut self) -> io::Result<i32>;

    /// Collect whatever the child wrote. Call after the child has exited.
    async fn take_output(&mut self) -> CapturedOutput;
}

/// Starts child processes
pub trait ProcessLauncher: Send + Sync {
    /// Launch `spec`, returning the child and its OS pid.
    fn launch(&self, spec: &LaunchSpec) -> io::Result<(u32, Box<dyn ChildProcess>)>;
}

/// Launcher backed by real OS processes
pub struct SystemLauncher {
    output_drain: Duration,
}

impl SystemLauncher {
    pub fn new(output_drain: Duration) -> Self {
        Self { output_drain }
    }
}

impl ProcessLauncher for SystemLauncher {
    fn launch(&self, spec: &LaunchSpec) -> io::Result<(u32, Box<dyn ChildProcess>)> {
        if spec.visible {
            let child = PtyChild::spawn(spec, self.output_drain)?;
            Ok((child.pid(), Box::new(child)))
        } else {
            let child = PipedChild::spawn(spec, self.output_drain)?;
            Ok((child.pid(), Box::new(child)))
        }
    }
}

/// Byte sink filled by a background reader task
struct OutputCapture {
    buffer: Arc<Mutex<Vec<u8>>>,
    reader: Option<JoinHandle<()>>,
}

impl OutputCapture {
    fn start<R>(mut stream: R) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let buffer = Arc::new(Mutex::new(Vec::new()));
        let sink = buffer.clone();
        let reader = tokio::spawn(async move {
            let mut chunk = [0u8; 4096];
            loop {
                match stream.read(&mut chunk).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => sink.lock().extend_from_slice(&chunk[..n]),
                }
            }
        });
        Self {
            buffer,
            reader: Some(reader),
        }
    }

    fn empty() -> Self {
        Self {
            buffer: Arc::new(Mutex::new(Vec::new())),
            reader: None,
        }
    }

    /// Wait up to `drain` for EOF, then take what was read so far.
    async fn finish(&mut self, drain: Duration) -> String {
        if let Some(mut reader) = self.reader.take() {
            if tokio::time::timeout(drain, &mut reader).await.is_err() {
                // A grandchild still holds the pipe open.
                reader.abort();
            }
        }
        let bytes = std::mem::take(&mut *self.buffer.lock());
        String::from_utf8_lossy(&bytes).into_owned()
    }
}

/// Hidden child with piped standard streams
pub struct PipedChild {
    child: Child,
    pid: u32,
    exit_code: Option<i32>,
    stdout: OutputCapture,
    stderr: OutputCapture,
    output_drain: Duration,
}

impl PipedChild {
    /// Spawn `spec` as its own process-group leader.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(spec: &LaunchSpec, output_drain: Duration) -> io::Result<Self> {
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn()?;
        let pid = pid_or_kill(&mut child)?;

        let stdout = child
            .stdout
            .take()
            .map(OutputCapture::start)
            .unwrap_or_else(OutputCapture::empty);
        let stderr = child
            .stderr
            .take()
            .map(OutputCapture::start)
            .unwrap_or_else(OutputCapture::empty);

        Ok(Self {
            child,
            pid,
            exit_code: None,
            stdout,
            stderr,
            output_drain,
        })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }
}

/// Pid of a freshly spawned child. Without one the child cannot be tracked,
/// so it is killed rather than left running unsupervised.
fn pid_or_kill(child: &mut Child) -> io::Result<u32> {
    if let Some(pid) = child.id() {
        return Ok(pid);
    }
    if let Err(e) = child.start_kill() {
        tracing::debug!("kill of untracked child failed: {}", e);
    }
    Err(io::Error::other("child exited before its pid was read"))
}

#[async_trait]
impl ChildProcess for PipedChild {
    fn try_exit_code(&mut self) -> io::Result<Option<i32>> {
        if self.exit_code.is_some() {
            return Ok(self.exit_code);
        }
        if let Some(status) = self.child.try_wait()? {
            self.exit_code = Some(exit_code_of(status));
        }
        Ok(self.exit_code)
    }

    fn terminate(&mut self) -> io::Result<()> {
        if self.exit_code.is_some() {
            return Ok(());
        }
        signal::terminate_group(self.pid)
    }

    async fn kill(&mut self) -> io::Result<()> {
        if self.exit_code.is_some() {
            return Ok(());
        }
        if let Err(e) = signal::kill_group(self.pid) {
            tracing::debug!(pid = self.pid, "group kill failed: {}", e);
        }
        // Covers platforms without process groups.
        let _ = self.child.start_kill();
        self.wait().await.map(|_| ())
    }

    async fn wait(&mut self) -> io::Result<i32> {
        if let Some(code) = self.exit_code {
            return Ok(code);
        }
        let status = self.child.wait().await?;
        let code = exit_code_of(status);
        self.exit_code = Some(code);
        Ok(code)
    }

    async fn take_output(&mut self) -> CapturedOutput {
        let drain = self.output_drain;
        let (stdout, stderr) = tokio::join!(self.stdout.finish(drain), self.stderr.finish(drain));
        CapturedOutput { stdout, stderr }
    }
}
