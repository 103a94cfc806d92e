//! Agent collaborators
//!
//! The run controller only knows agents through the [`Agent`] trait. What an
//! agent does (prompting a model, publishing an article) is outside this
//! crate; [`CommandAgent`] adapts any shell command to the trait.

use ags_core::{AgentError, ErrorKind, SourceSpec, StageSpec};
use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

/// Exit status with which a command rejects its input
pub const VETO_EXIT_CODE: i32 = 3;

/// Maximum length of captured output quoted in error messages
const MAX_ERROR_LEN: usize = 2000;

/// What a successful agent call produced
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentReply {
    /// Output handed to the next stage
    Output(String),
    /// The agent rejected its input, with a reason
    Veto(String),
}

/// A pipeline participant tracked by name in the ledger
#[async_trait]
pub trait Agent: Send + Sync {
    /// Name used for gating and health records
    fn name(&self) -> &str;

    /// Process `input` once
    async fn invoke(&self, input: &str) -> Result<AgentReply, AgentError>;
}

/// Agent backed by a `sh -c` command
///
/// The input is written to stdin and stdout is the output. A non-zero exit
/// fails the call with stderr as the error text, except [`VETO_EXIT_CODE`]
/// which vetoes the input.
#[derive(Debug, Clone)]
pub struct CommandAgent {
    name: String,
    command: String,
    timeout: Duration,
}

impl CommandAgent {
    pub fn new(name: impl Into<String>, command: impl Into<String>, timeout: Duration) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            timeout,
        }
    }

    pub fn from_stage(spec: &StageSpec) -> Self {
        Self::new(&spec.name, &spec.command, spec.timeout())
    }

    pub fn from_source(spec: &SourceSpec) -> Self {
        Self::new(&spec.name, &spec.command, spec.timeout())
    }
}

#[async_trait]
impl Agent for CommandAgent {
    fn name(&self) -> &str {
        &self.name
    }

    async fn invoke(&self, input: &str) -> Result<AgentReply, AgentError> {
        debug!(agent = %self.name, "Running: {}", self.command);

        let mut child = Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                AgentError::new(
                    ErrorKind::Unknown,
                    format!("Failed to spawn {}: {}", self.name, e),
                )
            })?;

        // Feed stdin concurrently so a chatty child cannot deadlock on a full pipe
        if let Some(mut stdin) = child.stdin.take() {
            let bytes = input.as_bytes().to_vec();
            tokio::spawn(async move {
                // The child may exit without reading; a broken pipe is fine
                let _ = stdin.write_all(&bytes).await;
            });
        }

        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(result) => result.map_err(|e| {
                AgentError::new(
                    ErrorKind::Unknown,
                    format!("Failed to wait for {}: {}", self.name, e),
                )
            })?,
            Err(_) => {
                return Err(AgentError::new(
                    ErrorKind::Timeout,
                    format!("{} timed out after {}s", self.name, self.timeout.as_secs()),
                ))
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();

        match output.status.code() {
            Some(0) if stdout.is_empty() => Err(AgentError::new(
                ErrorKind::EmptyResponse,
                format!("{} returned empty output", self.name),
            )),
            Some(0) => Ok(AgentReply::Output(stdout)),
            Some(VETO_EXIT_CODE) => {
                let reason = if stderr.is_empty() { stdout } else { stderr };
                Ok(AgentReply::Veto(truncate(&reason, MAX_ERROR_LEN)))
            }
            status => {
                let message = if stderr.is_empty() {
                    match status {
                        Some(code) => format!("{} exited with status {}", self.name, code),
                        None => format!("{} was terminated by a signal", self.name),
                    }
                } else {
                    truncate(&stderr, MAX_ERROR_LEN)
                };
                Err(AgentError::untagged(message))
            }
        }
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &s[..end])
}
