//! Asynchronous utilities for use with Tokio.
//!
//! Page images are big, and most of what we do to them is CPU-bound. This
//! module holds the glue for moving that work off the async runtime, and for
//! running the external tools we depend on.

use std::{pin::Pin, process::Output};

use futures::Stream;
use regex::Regex;

use crate::prelude::*;

pub mod io;

/// A type alias for a boxed stream. This makes it easier to pass around
/// streams that return complex types.
pub type BoxedStream<Item> = Pin<Box<dyn Stream<Item = Item> + Send>>;

/// Run a CPU-bound closure on Tokio's blocking pool.
///
/// A panic inside `f` becomes an error, so that one bad page image can't take
/// down a whole batch.
pub async fn run_blocking<F, T>(what: &str, f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(result) => result,
        Err(err) if err.is_panic() => {
            let payload = err.into_panic();
            let msg = panic_message(payload.as_ref());
            Err(anyhow!("{what} panicked: {msg}"))
        }
        Err(err) => Err(anyhow!("{what} was cancelled: {err}")),
    }
}

/// Extract a readable message from a panic payload.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_owned()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_owned()
    }
}

/// Report any command failures, and include any error output.
///
/// Standard output and standard error are logged. Standard error may
/// optionally be checked against a regex, for tools which print errors but
/// still exit with status 0.
pub fn check_for_command_failure(
    command_name: &str,
    output: &Output,
    error_regex: Option<&Regex>,
) -> Result<()> {
    let stderr = String::from_utf8_lossy(&output.stderr);
    trace!(
        command_name,
        bytes = output.stdout.len(),
        "standard output from command"
    );
    if !stderr.trim().is_empty() {
        debug!(command_name, output = %stderr, "standard error from command");
    }

    if output.status.success() {
        if let Some(regex) = error_regex
            && regex.is_match(&stderr)
        {
            return Err(anyhow!("{command_name} printed error output:\n{stderr}"));
        }
        Ok(())
    } else if let Some(exit_code) = output.status.code() {
        Err(anyhow!(
            "{command_name} failed with exit code {exit_code} and error output:\n{stderr}"
        ))
    } else {
        Err(anyhow!("{command_name} was killed with error output:\n{stderr}"))
    }
}

/// Is this error a "command not found" from spawning a process?
pub fn is_command_not_found(err: &std::io::Error) -> bool {
    err.kind() == std::io::ErrorKind::NotFound
}
