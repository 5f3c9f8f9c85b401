//! System Command Runner
//!
//! Implements the `CommandRunner` port with `tokio::process`.

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, instrument};

use crate::domain::ports::{CommandOutput, CommandRunner};
use crate::error::{Error, Result};

/// Runs programs on the host and captures their combined output.
///
/// Children are not killed when the caller stops waiting: a mount or mkfs
/// interrupted half-way is worse than one that finishes unobserved.
#[derive(Debug, Clone, Default)]
pub struct SystemCommandRunner;

impl SystemCommandRunner {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl CommandRunner for SystemCommandRunner {
    #[instrument(skip(self), level = "debug")]
    async fn run(&self, program: &str, args: &[&str]) -> Result<CommandOutput> {
        let output = Command::new(program)
            .args(args)
            .kill_on_drop(false)
            .output()
            .await
            .map_err(|e| Error::CommandFailed {
                command: format_command(program, args),
                output: e.to_string(),
            })?;

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));

        debug!(
            program,
            code = ?output.status.code(),
            output = %combined.trim_end(),
            "Command finished"
        );

        Ok(CommandOutput {
            code: output.status.code(),
            output: combined,
        })
    }
}

/// Render a command line for error messages.
pub fn format_command(program: &str, args: &[&str]) -> String {
    std::iter::once(program)
        .chain(args.iter().copied())
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_command() {
        assert_eq!(
            format_command("mount", &["-t", "ext4", "/dev/sdb", "/mnt/v1"]),
            "mount -t ext4 /dev/sdb /mnt/v1"
        );
        assert_eq!(format_command("true", &[]), "true");
    }

    #[tokio::test]
    async fn test_run_captures_exit_code_and_output() {
        let runner = SystemCommandRunner::new();

        let ok = runner.run("sh", &["-c", "echo out; echo err >&2"]).await.unwrap();
        assert!(ok.is_success());
        assert!(ok.output.contains("out"));
        assert!(ok.output.contains("err"));

        let failed = runner.run("sh", &["-c", "exit 2"]).await.unwrap();
        assert_eq!(failed.code, Some(2));
    }

    #[tokio::test]
    async fn test_missing_program_is_an_error() {
        let runner = SystemCommandRunner::new();
        let result = runner.run("definitely-not-a-real-program-xyz", &[]).await;
        assert!(matches!(result, Err(Error::CommandFailed { .. })));
    }
}
