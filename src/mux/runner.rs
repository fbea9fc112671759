use async_trait::async_trait;

use super::MuxError;

/// Executes one multiplexer command and returns its stdout.
///
/// A non-zero exit must come back as an error; the controller never inspects
/// exit codes itself.
#[async_trait]
pub trait MuxRunner: Send + Sync {
    async fn run(&self, args: &[&str]) -> Result<String, MuxError>;
}

/// Runs the real multiplexer binary as a subprocess.
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    binary: String,
}

impl ProcessRunner {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }
}

#[async_trait]
impl MuxRunner for ProcessRunner {
    async fn run(&self, args: &[&str]) -> Result<String, MuxError> {
        let command = format!("{} {}", self.binary, args.join(" "));
        tracing::trace!(%command, "running multiplexer command");

        let output = tokio::process::Command::new(&self.binary)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| MuxError::Spawn {
                command: command.clone(),
                source,
            })?;

        if !output.status.success() {
            return Err(MuxError::CommandFailed {
                command,
                status: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}
