//! Wake sink: tells an external process that something needs attention.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;

use crate::constants::{ELLIPSIS, WAKE_MESSAGE_MAX_CHARS};
use crate::models::{EventType, NormalizedEvent};
use crate::normalizer::truncate_chars;

#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("invalid wake command: {0}")]
    InvalidCommand(String),

    #[error("failed to spawn wake command '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("wake command timed out after {0:?}")]
    Timeout(Duration),

    #[error("wake command exited with status {}", describe_exit(.code))]
    Exit { code: Option<i32> },
}

fn describe_exit(code: &Option<i32>) -> String {
    code.map(|c| c.to_string())
        .unwrap_or_else(|| "signal".to_string())
}

#[async_trait]
pub trait WakeSink: Send + Sync {
    async fn notify(&self, message: &str) -> Result<(), NotifyError>;
}

/// Runs a configured command with the message appended as its last argument
#[derive(Debug, Clone)]
pub struct CommandWakeSink {
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl CommandWakeSink {
    /// Parse a shell-style command line such as `notify-agent --urgent`
    pub fn from_command_line(command_line: &str, timeout: Duration) -> Result<Self, NotifyError> {
        let mut tokens = shell_words::split(command_line.trim())
            .map_err(|e| NotifyError::InvalidCommand(e.to_string()))?;
        if tokens.is_empty() {
            return Err(NotifyError::InvalidCommand("command is empty".to_string()));
        }
        let program = tokens.remove(0);
        Ok(Self {
            program,
            args: tokens,
            timeout,
        })
    }

    pub fn program(&self) -> &str {
        &self.program
    }
}

#[async_trait]
impl WakeSink for CommandWakeSink {
    async fn notify(&self, message: &str) -> Result<(), NotifyError> {
        let mut command = Command::new(&self.program);
        command.kill_on_drop(true);
        command.args(&self.args);
        command.arg(message);
        command.stdin(Stdio::null());
        command.stdout(Stdio::null());
        command.stderr(Stdio::piped());

        let child = command.spawn().map_err(|source| NotifyError::Spawn {
            program: self.program.clone(),
            source,
        })?;
        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| NotifyError::Timeout(self.timeout))?
            .map_err(|source| NotifyError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if !stderr.trim().is_empty() {
                tracing::debug!("Wake command stderr: {}", stderr.trim());
            }
            return Err(NotifyError::Exit {
                code: output.status.code(),
            });
        }
        Ok(())
    }
}

/// Single-line description of an event for the wake sink
pub fn format_wake_message(event: &NormalizedEvent) -> String {
    let NormalizedEvent {
        channel,
        author,
        preview,
        ..
    } = event;
    let text = match &event.event {
        EventType::MentionReceived => format!("[{}] {} mentioned you: {}", channel, author, preview),
        EventType::DmMessageReceived => format!("[DM] {}: {}", author, preview),
        EventType::DmCreated => format!("[DM] {} started a conversation with you", author),
        EventType::ThreadCreated => format!("[{}] {} started a thread: {}", channel, author, preview),
        EventType::ReactionAdded => format!("[{}] {} reacted {}", channel, author, preview),
        EventType::MessageSent => format!("[{}] {}: {}", channel, author, preview),
        other => format!("[{}] {} from {}: {}", channel, other, author, preview),
    };
    let single_line = text.replace(['\r', '\n'], " ");
    if single_line.chars().count() <= WAKE_MESSAGE_MAX_CHARS {
        return single_line;
    }
    truncate_chars(&single_line, WAKE_MESSAGE_MAX_CHARS - ELLIPSIS.len())
}
