use std::ffi::OsStr;

use tokio::process::Command;
use tracing::trace;

/// Error from a failed command.
#[derive(Debug, thiserror::Error)]
#[error("command failed: {command}\n{detail}")]
pub struct CommandError {
    pub command: String,
    pub detail: String,
}

fn format_command_display<S: AsRef<OsStr>>(program: &str, args: &[S]) -> String {
    let mut parts = Vec::with_capacity(args.len() + 1);
    parts.push(program.to_string());
    parts.extend(args.iter().map(|a| a.as_ref().to_string_lossy().into_owned()));
    parts.join(" ")
}

/// Execute an external tool as the invoking user.
///
/// Invokes the program binary directly with the given arguments (no shell).
/// Returns trimmed stdout on success; stderr is captured into the error.
pub async fn exec<S: AsRef<OsStr>>(program: &str, args: &[S]) -> Result<String, CommandError> {
    let cmd_display = format_command_display(program, args);
    trace!(command = %cmd_display, "exec");

    let output = Command::new(program)
        .args(args)
        .output()
        .await
        .map_err(|e| CommandError {
            command: cmd_display.clone(),
            detail: e.to_string(),
        })?;

    if output.status.success() {
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    } else {
        Err(CommandError {
            command: cmd_display,
            detail: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }
}
