//! Container engine capability consumed by the sandbox controller.
//!
//! The controller never talks to a concrete runtime directly. Everything it needs from the engine
//! (image lookup, create/start, log following, wait, kill, forced removal) goes through
//! [`ContainerEngine`], so the docker CLI backend and the scripted test engine are interchangeable.

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use thiserror::Error;

/// Label attached to every container created for a run; used to list live sandboxes.
pub const SANDBOX_LABEL: &str = "coderoom.sandbox";

/// Engine-assigned container handle.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContainerId(pub String);

impl ContainerId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One of the two output channels of a running container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LogChannel {
    /// stdout
    Primary,
    /// stderr
    Secondary,
}

impl LogChannel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogChannel::Primary => "stdout",
            LogChannel::Secondary => "stderr",
        }
    }
}

impl fmt::Display for LogChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A raw chunk as produced by an engine's log follower.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogChunk {
    Bytes(Vec<u8>),
    Text(String),
}

impl LogChunk {
    /// Normalise to text, replacing invalid UTF-8 sequences instead of failing.
    pub fn into_text(self) -> String {
        match self {
            LogChunk::Bytes(bytes) => match String::from_utf8(bytes) {
                Ok(text) => text,
                Err(err) => String::from_utf8_lossy(err.as_bytes()).into_owned(),
            },
            LogChunk::Text(text) => text,
        }
    }
}

impl From<Vec<u8>> for LogChunk {
    fn from(bytes: Vec<u8>) -> Self {
        LogChunk::Bytes(bytes)
    }
}

impl From<&str> for LogChunk {
    fn from(text: &str) -> Self {
        LogChunk::Text(text.to_string())
    }
}

/// Follow subscription for one channel. Ends when the engine closes it.
pub type LogStream = BoxStream<'static, Result<LogChunk, EngineError>>;

/// Everything the engine needs to create one isolated environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSpec {
    pub image: String,
    pub command: Vec<String>,
    pub network_disabled: bool,
    pub memory_bytes: u64,
    pub pids_limit: u32,
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("{what} not found")]
    NotFound { what: String },
    #[error("failed to spawn container runtime {runtime}: {source}")]
    Spawn {
        runtime: String,
        source: std::io::Error,
    },
    #[error("`{command}` exited with {status}: {stderr}")]
    Command {
        command: String,
        status: String,
        stderr: String,
    },
    #[error("unexpected output from container runtime: {message}")]
    Protocol { message: String },
    #[error("log stream failed: {message}")]
    Stream { message: String },
}

impl EngineError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, EngineError::NotFound { .. })
    }
}

#[async_trait]
pub trait ContainerEngine: Send + Sync {
    /// Resolve an image locally. Returns [`EngineError::NotFound`] when it is absent.
    async fn inspect_image(&self, image: &str) -> Result<(), EngineError>;

    async fn pull_image(&self, image: &str) -> Result<(), EngineError>;

    async fn create_container(&self, spec: &ContainerSpec) -> Result<ContainerId, EngineError>;

    async fn start_container(&self, id: &ContainerId) -> Result<(), EngineError>;

    async fn follow_logs(
        &self,
        id: &ContainerId,
        channel: LogChannel,
    ) -> Result<LogStream, EngineError>;

    /// Block until the container exits and return its native exit code.
    async fn wait_container(&self, id: &ContainerId) -> Result<i64, EngineError>;

    async fn kill_container(&self, id: &ContainerId) -> Result<(), EngineError>;

    /// Forced removal; must succeed for running containers too.
    async fn remove_container(&self, id: &ContainerId) -> Result<(), EngineError>;

    /// Containers created by this system that still exist.
    async fn list_containers(&self) -> Result<Vec<ContainerId>, EngineError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_utf8_is_replaced() {
        let chunk = LogChunk::Bytes(vec![b'o', b'k', 0xff, b'\n']);
        assert_eq!(chunk.into_text(), "ok\u{fffd}\n");
    }

    #[test]
    fn text_chunks_pass_through() {
        assert_eq!(LogChunk::from("hi\n").into_text(), "hi\n");
    }

    #[test]
    fn channel_names_match_stream_names() {
        assert_eq!(LogChannel::Primary.to_string(), "stdout");
        assert_eq!(LogChannel::Secondary.to_string(), "stderr");
    }
}
