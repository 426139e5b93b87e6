//! Subprocess execution for the CLI-backed collaborators

use crate::error::{KeelError, KeelResult};
use std::io::ErrorKind;
use std::process::{Output, Stdio};
use tokio::process::Command;
use tracing::debug;

/// Runs one external CLI (skopeo, podman, kubectl)
#[derive(Debug, Clone)]
pub(crate) struct CommandRunner {
    program: String,
}

impl CommandRunner {
    pub(crate) fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// Execute and return raw output, whatever the exit status
    pub(crate) async fn output(&self, args: &[String]) -> KeelResult<Output> {
        debug!("Executing: {} {:?}", self.program, args);

        Command::new(&self.program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| {
                if e.kind() == ErrorKind::NotFound {
                    KeelError::CliNotFound {
                        name: self.program.clone(),
                        hint: format!("Install {} and make sure it is on PATH", self.program),
                    }
                } else {
                    KeelError::command_failed(self.command_line(args), e)
                }
            })
    }

    /// Execute and return stdout; non-zero exit becomes an error carrying stderr
    pub(crate) async fn run(&self, args: &[String]) -> KeelResult<String> {
        let output = self.output(args).await?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(KeelError::command_exec(
                self.command_line(args),
                stderr.trim(),
            ))
        }
    }

    fn command_line(&self, args: &[String]) -> String {
        format!("{} {}", self.program, args.join(" "))
    }
}
