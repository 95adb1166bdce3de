//! Sync-over-async bridge
//!
//! The one place synchronous callers enter the async world.

use std::future::Future;
use std::io;
use tokio::runtime::{Builder, Handle, RuntimeFlavor};

/// Run `future` to completion from synchronous code.
///
/// Inside a multi-threaded runtime the current worker is handed off with
/// `block_in_place`; outside any runtime a throwaway current-thread runtime
/// is built. A current-thread runtime cannot be blocked on from within, so
/// that case gets a dedicated thread.
pub fn block_on<F>(future: F) -> io::Result<F::Output>
where
    F: Future + Send,
    F::Output: Send,
{
    match Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
            Ok(tokio::task::block_in_place(|| handle.block_on(future)))
        }
        Ok(_) => std::thread::scope(|scope| {
            scope
                .spawn(move || run_fresh(future))
                .join()
                .map_err(|_| io::Error::other("blocking task panicked"))?
        }),
        Err(_) => run_fresh(future),
    }
}

fn run_fresh<F: Future>(future: F) -> io::Result<F::Output> {
    let runtime = Builder::new_current_thread().enable_all().build()?;
    Ok(runtime.block_on(future))
}
