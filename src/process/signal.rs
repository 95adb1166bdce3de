//! Termination signals
//!
//! Children are started as process-group leaders, so signalling the group
//! also reaches anything they spawned (shell wrappers, agent subprocesses).

use std::io;

/// Send SIGTERM to a process group. A group that is already gone is not an error.
#[cfg(unix)]
pub fn terminate_group(pgid: u32) -> io::Result<()> {
    send(-(pgid as i32), libc::SIGTERM)
}

/// Send SIGKILL to a process group. A group that is already gone is not an error.
#[cfg(unix)]
pub fn kill_group(pgid: u32) -> io::Result<()> {
    send(-(pgid as i32), libc::SIGKILL)
}

#[cfg(unix)]
fn send(target: i32, signal: libc::c_int) -> io::Result<()> {
    if unsafe { libc::kill(target, signal) } != 0 {
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ESRCH) {
            return Ok(());
        }
        return Err(err);
    }
    Ok(())
}

#[cfg(not(unix))]
pub fn terminate_group(_pgid: u32) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "graceful termination is only supported on Unix systems",
    ))
}

#[cfg(not(unix))]
pub fn kill_group(_pgid: u32) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "group kill is only supported on Unix systems",
    ))
}
