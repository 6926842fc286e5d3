//! External command execution

use crate::{Result, ShaperError};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// Captured output of a finished command
#[derive(Debug, Clone)]
pub struct CommandOutput {
    /// Exit status was zero
    pub success: bool,
    /// Standard output (lossy UTF-8)
    pub stdout: String,
    /// Standard error (lossy UTF-8)
    pub stderr: String,
}

impl CommandOutput {
    /// Convert a non-zero exit into an error
    pub fn check(self, program: &str) -> Result<Self> {
        if self.success {
            Ok(self)
        } else {
            Err(ShaperError::Command {
                program: program.to_string(),
                detail: self.stderr.trim().to_string(),
            })
        }
    }
}

/// Run a command to completion, optionally feeding `stdin`.
///
/// The child is killed if the returned future is dropped or the timeout fires.
pub async fn run(
    program: &str,
    args: &[&str],
    stdin: Option<&str>,
    timeout: Duration,
) -> Result<CommandOutput> {
    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd.spawn().map_err(|e| ShaperError::Command {
        program: program.to_string(),
        detail: e.to_string(),
    })?;

    if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
        pipe.write_all(input.as_bytes()).await?;
        // Close stdin so the child sees EOF
        drop(pipe);
    }

    let output = tokio::time::timeout(timeout, child.wait_with_output())
        .await
        .map_err(|_| ShaperError::Timeout {
            program: program.to_string(),
            secs: timeout.as_secs(),
        })??;

    Ok(CommandOutput {
        success: output.status.success(),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

/// Check whether `program` can be executed at all
pub async fn probe(program: &str, version_arg: &str) -> bool {
    run(program, &[version_arg], None, Duration::from_secs(5))
        .await
        .is_ok()
}
