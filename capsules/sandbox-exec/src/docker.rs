//! [`ContainerEngine`] backed by a docker-compatible command line runtime.

use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, ChildStderr, Command};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::engine::{
    ContainerEngine, ContainerId, ContainerSpec, EngineError, LogChannel, LogChunk, LogStream,
    SANDBOX_LABEL,
};

const READ_CHUNK: usize = 4096;
const STDERR_LIMIT: usize = 512;
/// How long a secondary chunk is held to see whether the follower is exiting with an error.
const DIAGNOSTIC_WINDOW: Duration = Duration::from_millis(50);

/// Engine that shells out to `docker` (or any CLI-compatible runtime such as `podman`).
#[derive(Debug, Clone)]
pub struct DockerCli {
    runtime: String,
}

impl Default for DockerCli {
    fn default() -> Self {
        Self::new("docker")
    }
}

impl DockerCli {
    pub fn new(runtime: impl Into<String>) -> Self {
        Self {
            runtime: runtime.into(),
        }
    }

    pub fn runtime(&self) -> &str {
        &self.runtime
    }

    fn command(&self, args: &[String]) -> Command {
        let mut command = Command::new(&self.runtime);
        command.args(args);
        command.stdin(Stdio::null());
        command.kill_on_drop(true);
        command
    }

    async fn run(&self, args: Vec<String>) -> Result<String, EngineError> {
        let output = self
            .command(&args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|source| EngineError::Spawn {
                runtime: self.runtime.clone(),
                source,
            })?;

        if output.status.success() {
            return Ok(String::from_utf8_lossy(&output.stdout).trim().to_string());
        }

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if is_missing_object(&stderr) {
            return Err(EngineError::NotFound {
                what: args.last().cloned().unwrap_or_default(),
            });
        }

        Err(EngineError::Command {
            command: self.describe(&args),
            status: output.status.to_string(),
            stderr: truncate(&stderr, STDERR_LIMIT),
        })
    }

    // Only the subcommand is rendered; the argv tail can carry user code.
    fn describe(&self, args: &[String]) -> String {
        match args.first() {
            Some(sub) => format!("{} {}", self.runtime, sub),
            None => self.runtime.clone(),
        }
    }
}

#[async_trait]
impl ContainerEngine for DockerCli {
    async fn inspect_image(&self, image: &str) -> Result<(), EngineError> {
        self.run(vec!["image".into(), "inspect".into(), image.into()])
            .await
            .map(|_| ())
    }

    async fn pull_image(&self, image: &str) -> Result<(), EngineError> {
        debug!(%image, runtime = %self.runtime, "pulling image");
        self.run(vec!["pull".into(), image.into()]).await.map(|_| ())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<ContainerId, EngineError> {
        let stdout = self.run(create_args(spec)).await?;
        let id = stdout.lines().last().unwrap_or_default().trim().to_string();
        if id.is_empty() {
            return Err(EngineError::Protocol {
                message: "create did not print a container id".to_string(),
            });
        }
        Ok(ContainerId(id))
    }

    async fn start_container(&self, id: &ContainerId) -> Result<(), EngineError> {
        self.run(vec!["start".into(), id.0.clone()])
            .await
            .map(|_| ())
    }

    async fn follow_logs(
        &self,
        id: &ContainerId,
        channel: LogChannel,
    ) -> Result<LogStream, EngineError> {
        let args = vec!["logs".to_string(), "--follow".to_string(), id.0.clone()];
        let mut command = self.command(&args);
        // The follower's own diagnostics always arrive on its stderr.
        match channel {
            LogChannel::Primary => command.stdout(Stdio::piped()).stderr(Stdio::piped()),
            LogChannel::Secondary => command.stdout(Stdio::null()).stderr(Stdio::piped()),
        };

        let mut child = command.spawn().map_err(|source| EngineError::Spawn {
            runtime: self.runtime.clone(),
            source,
        })?;

        let (reader, diagnostics) = match channel {
            LogChannel::Primary => {
                let out = child.stdout.take().ok_or_else(|| missing_pipe(channel))?;
                let reader: Box<dyn AsyncRead + Send + Unpin> = Box::new(out);
                let diagnostics = child.stderr.take().map(|err| tokio::spawn(stderr_tail(err)));
                (reader, diagnostics)
            }
            LogChannel::Secondary => {
                let err = child.stderr.take().ok_or_else(|| missing_pipe(channel))?;
                let reader: Box<dyn AsyncRead + Send + Unpin> = Box::new(err);
                (reader, None)
            }
        };

        Ok(follow(LogFollower {
            child,
            reader,
            channel,
            diagnostics,
            command: self.describe(&args),
        }))
    }

    async fn wait_container(&self, id: &ContainerId) -> Result<i64, EngineError> {
        let stdout = self.run(vec!["wait".into(), id.0.clone()]).await?;
        parse_exit_code(&stdout)
    }

    async fn kill_container(&self, id: &ContainerId) -> Result<(), EngineError> {
        self.run(vec!["kill".into(), id.0.clone()])
            .await
            .map(|_| ())
    }

    async fn remove_container(&self, id: &ContainerId) -> Result<(), EngineError> {
        self.run(vec!["rm".into(), "-f".into(), id.0.clone()])
            .await
            .map(|_| ())
    }

    async fn list_containers(&self) -> Result<Vec<ContainerId>, EngineError> {
        let stdout = self
            .run(vec![
                "ps".into(),
                "-a".into(),
                "-q".into(),
                "--no-trunc".into(),
                "--filter".into(),
                format!("label={}=true", SANDBOX_LABEL),
            ])
            .await?;
        Ok(stdout
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(|line| ContainerId(line.to_string()))
            .collect())
    }
}

struct LogFollower {
    // Held so `kill_on_drop` stops the follower when the stream is abandoned.
    child: Child,
    reader: Box<dyn AsyncRead + Send + Unpin>,
    channel: LogChannel,
    diagnostics: Option<JoinHandle<String>>,
    command: String,
}

impl LogFollower {
    async fn next_chunk(&mut self) -> Option<Result<LogChunk, EngineError>> {
        let mut buf = vec![0u8; READ_CHUNK];
        let n = match self.reader.read(&mut buf).await {
            Ok(n) => n,
            Err(err) => {
                return Some(Err(EngineError::Stream {
                    message: err.to_string(),
                }))
            }
        };
        if n == 0 {
            return self.finish().await;
        }
        buf.truncate(n);

        if matches!(self.channel, LogChannel::Secondary) {
            let exited = tokio::select! {
                status = self.child.wait() => status.ok(),
                _ = tokio::time::sleep(DIAGNOSTIC_WINDOW) => None,
            };
            if let Some(status) = exited.filter(|status| !status.success()) {
                let mut rest = Vec::new();
                let _ = self.reader.read_to_end(&mut rest).await;
                buf.extend_from_slice(&rest);
                return Some(Err(self.failure(status, &String::from_utf8_lossy(&buf))));
            }
        }
        Some(Ok(LogChunk::Bytes(buf)))
    }

    /// End of output: clean if the follower exited successfully.
    async fn finish(&mut self) -> Option<Result<LogChunk, EngineError>> {
        let status = match self.child.wait().await {
            Ok(status) => status,
            Err(err) => {
                return Some(Err(EngineError::Stream {
                    message: err.to_string(),
                }))
            }
        };
        if status.success() {
            return None;
        }
        let stderr = match self.diagnostics.take() {
            Some(task) => task.await.unwrap_or_default(),
            None => String::new(),
        };
        Some(Err(self.failure(status, &stderr)))
    }

    fn failure(&self, status: ExitStatus, stderr: &str) -> EngineError {
        EngineError::Command {
            command: self.command.clone(),
            status: status.to_string(),
            stderr: truncate(stderr.trim(), STDERR_LIMIT),
        }
    }
}

fn follow(follower: LogFollower) -> LogStream {
    stream::unfold(Some(follower), |state| async move {
        let mut follower = state?;
        let item = follower.next_chunk().await?;
        let next = if item.is_ok() { Some(follower) } else { None };
        Some((item, next))
    })
    .boxed()
}

/// Drains the follower's stderr, keeping only the last [`STDERR_LIMIT`] bytes.
async fn stderr_tail(mut stderr: ChildStderr) -> String {
    let mut tail = Vec::new();
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        match stderr.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                tail.extend_from_slice(&buf[..n]);
                if tail.len() > STDERR_LIMIT {
                    let excess = tail.len() - STDERR_LIMIT;
                    tail.drain(..excess);
                }
            }
        }
    }
    String::from_utf8_lossy(&tail).into_owned()
}

fn missing_pipe(channel: LogChannel) -> EngineError {
    EngineError::Stream {
        message: format!("log follower has no {} pipe", channel),
    }
}

/// Arguments for `create`. Resource flags come before the image; the command follows it.
pub fn create_args(spec: &ContainerSpec) -> Vec<String> {
    let mut args = vec!["create".to_string()];
    if spec.network_disabled {
        args.push("--network".into());
        args.push("none".into());
    }
    args.push("--memory".into());
    args.push(spec.memory_bytes.to_string());
    args.push("--pids-limit".into());
    args.push(spec.pids_limit.to_string());
    for (key, value) in &spec.labels {
        args.push("--label".into());
        args.push(format!("{}={}", key, value));
    }
    args.push(spec.image.clone());
    args.extend(spec.command.iter().cloned());
    args
}

fn parse_exit_code(stdout: &str) -> Result<i64, EngineError> {
    let line = stdout.lines().last().unwrap_or_default().trim();
    line.parse::<i64>().map_err(|_| EngineError::Protocol {
        message: format!("wait printed '{}' instead of an exit code", line),
    })
}

fn is_missing_object(stderr: &str) -> bool {
    let lowered = stderr.to_ascii_lowercase();
    lowered.contains("no such image")
        || lowered.contains("no such object")
        || lowered.contains("no such container")
}

fn truncate(text: &str, limit: usize) -> String {
    if text.len() <= limit {
        return text.to_string();
    }
    let mut end = limit;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}… (truncated)", &text[..end])
}
