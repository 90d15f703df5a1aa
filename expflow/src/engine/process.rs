//! Launching external processes with captured output.

use crate::errors::{ExpflowResult, ExternalProcessError};
use crate::observability::StepTimer;
use std::path::Path;
use std::process::{Command, Stdio};

/// Captured output of a successful process.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProcessOutput {
    /// Standard output.
    pub stdout: String,
    /// Standard error.
    pub stderr: String,
    /// Wall-clock duration in milliseconds.
    pub duration_ms: f64,
}

/// Runs `program` with `args` to completion.
///
/// A non-zero exit becomes an [`ExternalProcessError`] carrying both streams.
pub fn run_command(program: &str, args: &[String], cwd: Option<&Path>) -> ExpflowResult<ProcessOutput> {
    let rendered = render_command_line(program, args);
    tracing::debug!(command = %rendered, "Launching process");

    let timer = StepTimer::start(program);
    let mut command = Command::new(program);
    command
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    if let Some(dir) = cwd {
        command.current_dir(dir);
    }

    let output = command.output().map_err(|e| {
        ExternalProcessError::new(rendered.clone(), None).with_output("", format!("failed to spawn: {e}"))
    })?;
    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
    let duration_ms = timer.finish();

    for line in stderr.lines() {
        tracing::debug!(target: "expflow::engine::stderr", "{line}");
    }

    if output.status.success() {
        Ok(ProcessOutput {
            stdout,
            stderr,
            duration_ms,
        })
    } else {
        tracing::error!(command = %rendered, exit_code = ?output.status.code(), duration_ms, "Process failed");
        Err(ExternalProcessError::new(rendered, output.status.code())
            .with_output(stdout, stderr)
            .into())
    }
}

/// Runs a free-form command line through the platform shell.
pub fn run_shell(command_line: &str, cwd: Option<&Path>) -> ExpflowResult<ProcessOutput> {
    let (shell, flag) = if cfg!(target_os = "windows") {
        ("cmd", "/C")
    } else {
        ("sh", "-c")
    };
    run_command(shell, &[flag.to_string(), command_line.to_string()], cwd)
}

/// Quotes `value` as one word for the shell [`run_shell`] uses.
///
/// Values made only of characters the shell never interprets stay bare.
#[must_use]
pub fn shell_quote(value: &str) -> String {
    let plain = |c: char| c.is_ascii_alphanumeric() || "/._-+=:@,%".contains(c);
    if !value.is_empty() && value.chars().all(plain) {
        return value.to_string();
    }
    if cfg!(target_os = "windows") {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        format!("'{}'", value.replace('\'', r"'\''"))
    }
}

fn render_command_line(program: &str, args: &[String]) -> String {
    std::iter::once(program)
        .chain(args.iter().map(String::as_str))
        .map(|part| {
            if part.is_empty() || part.contains(char::is_whitespace) {
                format!("'{part}'")
            } else {
                part.to_string()
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}
