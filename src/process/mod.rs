//! OS process boundary
//!
//! Everything that touches real processes lives here: launching children,
//! signalling them, and asking the OS whether a pid is still alive. The
//! dispatcher and registry only see the traits, so tests can script process
//! behaviour without spawning anything.

mod launcher;
mod probe;
mod pty;
pub mod signal;

#[cfg(test)]
pub mod testing;

pub use launcher::{ChildProcess, LaunchSpec, PipedChild, ProcessLauncher, SystemLauncher};
pub use probe::{Liveness, ProcessProbe, SystemProbe};
pub use pty::PtyChild;

/// Captured standard streams of a finished child
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapturedOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Map an exit status to a single integer code.
///
/// Signal deaths become `128 + signal`, matching shell convention; anything
/// unknowable is -1.
pub fn exit_code_of(status: std::process::ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    -1
}
