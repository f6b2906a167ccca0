//! Running runtime/registry CLIs with cancellation.

use std::process::{Output, Stdio};

use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::ExecError;

/// Run `program args...`, killing the child if `cancel` fires first.
/// `what` is logged instead of the arguments, which may carry credentials.
pub(crate) async fn run(program: &str, args: &[String], what: &str, cancel: &CancellationToken) -> Result<Output, ExecError> {
    debug!(program, what, "exec");
    let child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| ExecError::Spawn { program: program.to_string(), message: e.to_string() })?;

    tokio::select! {
        out = child.wait_with_output() => out.map_err(|e| ExecError::Spawn { program: program.to_string(), message: e.to_string() }),
        _ = cancel.cancelled() => Err(ExecError::Cancelled),
    }
}

pub(crate) fn stderr_of(out: &Output) -> String { String::from_utf8_lossy(&out.stderr).to_string() }
