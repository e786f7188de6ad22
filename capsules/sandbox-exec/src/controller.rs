//! Sandbox lifecycle: image check, create, start, bounded wait, forced kill, guaranteed teardown.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::engine::{
    ContainerEngine, ContainerId, ContainerSpec, EngineError, LogChannel, SANDBOX_LABEL,
};
use crate::multiplex::{multiplex, DrainSignal, OutputStream};

/// Exit code reported when a run outlives its timeout.
pub const TIMEOUT_EXIT_CODE: i64 = 124;
pub const DEFAULT_IMAGE: &str = "python:3.11-slim";
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_MEMORY_BYTES: u64 = 256 * 1024 * 1024;
pub const DEFAULT_PIDS_LIMIT: u32 = 64;

/// How long teardown waits for the log followers to flush after the container exits.
const DRAIN_GRACE: Duration = Duration::from_secs(2);

/// Resource ceilings applied to every sandbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxLimits {
    pub network_disabled: bool,
    pub memory_bytes: u64,
    pub pids_limit: u32,
}

impl Default for SandboxLimits {
    fn default() -> Self {
        Self {
            network_disabled: true,
            memory_bytes: DEFAULT_MEMORY_BYTES,
            pids_limit: DEFAULT_PIDS_LIMIT,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxSettings {
    pub image: String,
    pub timeout: Duration,
    pub limits: SandboxLimits,
}

impl Default for SandboxSettings {
    fn default() -> Self {
        Self {
            image: DEFAULT_IMAGE.to_string(),
            timeout: DEFAULT_TIMEOUT,
            limits: SandboxLimits::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("looking up image {image}: {source}")]
    ImageLookup {
        image: String,
        #[source]
        source: EngineError,
    },
    #[error("pulling image {image}: {source}")]
    ImagePull {
        image: String,
        #[source]
        source: EngineError,
    },
    #[error("creating sandbox container: {source}")]
    Create {
        #[source]
        source: EngineError,
    },
    #[error("starting sandbox container {container}: {source}")]
    Start {
        container: ContainerId,
        #[source]
        source: EngineError,
    },
    #[error("following {channel} of container {container}: {source}")]
    Logs {
        container: ContainerId,
        channel: LogChannel,
        #[source]
        source: EngineError,
    },
    #[error("waiting for sandbox: {message}")]
    Wait { message: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Completion {
    Exited(i64),
    Failed(String),
}

/// Resolves once the sandbox has exited (or been killed) and been torn down.
#[derive(Debug, Clone)]
pub struct CompletionHandle {
    rx: watch::Receiver<Option<Completion>>,
}

/// Producer half of a [`CompletionHandle`].
#[derive(Debug)]
pub struct CompletionSender {
    tx: watch::Sender<Option<Completion>>,
}

pub fn completion_channel() -> (CompletionSender, CompletionHandle) {
    let (tx, rx) = watch::channel(None);
    (CompletionSender { tx }, CompletionHandle { rx })
}

impl CompletionSender {
    pub fn complete(self, exit_code: i64) {
        let _ = self.tx.send(Some(Completion::Exited(exit_code)));
    }

    pub fn fail(self, message: impl Into<String>) {
        let _ = self.tx.send(Some(Completion::Failed(message.into())));
    }
}

impl CompletionHandle {
    /// Non-consuming check. A sender dropped without a result also counts as finished.
    pub fn is_finished(&self) -> bool {
        self.rx.borrow().is_some() || self.rx.has_changed().is_err()
    }

    pub async fn wait(&self) -> Result<i64, SandboxError> {
        let mut rx = self.rx.clone();
        let completion = match rx.wait_for(Option::is_some).await {
            Ok(value) => (*value).clone(),
            Err(_) => None,
        };
        match completion {
            Some(Completion::Exited(code)) => Ok(code),
            Some(Completion::Failed(message)) => Err(SandboxError::Wait { message }),
            None => Err(SandboxError::Wait {
                message: "sandbox supervisor ended without a result".to_string(),
            }),
        }
    }
}

pub struct SandboxController {
    engine: Arc<dyn ContainerEngine>,
    settings: SandboxSettings,
}

impl SandboxController {
    pub fn new(engine: Arc<dyn ContainerEngine>, settings: SandboxSettings) -> Self {
        Self { engine, settings }
    }

    pub fn settings(&self) -> &SandboxSettings {
        &self.settings
    }

    pub fn engine(&self) -> &Arc<dyn ContainerEngine> {
        &self.engine
    }

    /// Run `code` with the configured timeout.
    pub async fn run(&self, code: &str) -> Result<(OutputStream, CompletionHandle), SandboxError> {
        self.execute(code, self.settings.timeout).await
    }

    /// Start one sandboxed execution.
    ///
    /// Returns the merged output of the sandbox and a handle yielding its exit code: the native
    /// code on normal exit, [`TIMEOUT_EXIT_CODE`] when `timeout` elapses first. Once the container
    /// has been started, it is removed on every path, whether or not the caller keeps the handle.
    pub async fn execute(
        &self,
        code: &str,
        timeout: Duration,
    ) -> Result<(OutputStream, CompletionHandle), SandboxError> {
        self.ensure_image().await?;

        let spec = self.container_spec(code);
        let id = self
            .engine
            .create_container(&spec)
            .await
            .map_err(|source| SandboxError::Create { source })?;
        info!(container = %id, image = %spec.image, "sandbox container created");

        if let Err(source) = self.engine.start_container(&id).await {
            teardown(self.engine.as_ref(), &id).await;
            return Err(SandboxError::Start {
                container: id,
                source,
            });
        }

        let (sender, completion) = completion_channel();
        let mut output = match multiplex(self.engine.as_ref(), &id, completion.clone()).await {
            Ok(output) => output,
            Err(err) => {
                if let Err(kill_err) = self.engine.kill_container(&id).await {
                    debug!(container = %id, error = %kill_err, "kill after log failure");
                }
                teardown(self.engine.as_ref(), &id).await;
                return Err(err);
            }
        };

        let drained = output.take_drain_signal();
        tokio::spawn(supervise(
            Arc::clone(&self.engine),
            id,
            timeout,
            drained,
            sender,
        ));

        Ok((output, completion))
    }

    pub fn container_spec(&self, code: &str) -> ContainerSpec {
        let mut labels = BTreeMap::new();
        labels.insert(SANDBOX_LABEL.to_string(), "true".to_string());
        ContainerSpec {
            image: self.settings.image.clone(),
            command: run_command(code),
            network_disabled: self.settings.limits.network_disabled,
            memory_bytes: self.settings.limits.memory_bytes,
            pids_limit: self.settings.limits.pids_limit,
            labels,
        }
    }

    async fn ensure_image(&self) -> Result<(), SandboxError> {
        let image = &self.settings.image;
        match self.engine.inspect_image(image).await {
            Ok(()) => Ok(()),
            Err(err) if err.is_not_found() => {
                info!(%image, "image not present locally, pulling");
                self.engine
                    .pull_image(image)
                    .await
                    .map_err(|source| SandboxError::ImagePull {
                        image: image.clone(),
                        source,
                    })
            }
            Err(source) => Err(SandboxError::ImageLookup {
                image: image.clone(),
                source,
            }),
        }
    }
}

/// Non-interactive, unbuffered interpreter invocation.
pub fn run_command(code: &str) -> Vec<String> {
    vec![
        "python".to_string(),
        "-u".to_string(),
        "-c".to_string(),
        code.to_string(),
    ]
}

async fn supervise(
    engine: Arc<dyn ContainerEngine>,
    id: ContainerId,
    timeout: Duration,
    drained: Option<DrainSignal>,
    sender: CompletionSender,
) {
    let result = match tokio::time::timeout(timeout, engine.wait_container(&id)).await {
        Ok(Ok(code)) => Ok(code),
        Ok(Err(err)) => Err(err.to_string()),
        Err(_) => {
            info!(container = %id, timeout_ms = timeout.as_millis() as u64, "sandbox timed out, killing");
            if let Err(err) = engine.kill_container(&id).await {
                warn!(container = %id, error = %err, "failed to kill timed out sandbox");
            }
            Ok(TIMEOUT_EXIT_CODE)
        }
    };

    if let Some(drained) = drained {
        if tokio::time::timeout(DRAIN_GRACE, drained.finished())
            .await
            .is_err()
        {
            debug!(container = %id, "log followers still open after grace period");
        }
    }

    teardown(engine.as_ref(), &id).await;

    match result {
        Ok(code) => {
            debug!(container = %id, exit_code = code, "sandbox finished");
            sender.complete(code);
        }
        Err(message) => {
            warn!(container = %id, error = %message, "waiting for sandbox failed");
            sender.fail(message);
        }
    }
}

/// Forced removal. Failures are logged and swallowed; the run result is already decided.
async fn teardown(engine: &dyn ContainerEngine, id: &ContainerId) {
    match engine.remove_container(id).await {
        Ok(()) => debug!(container = %id, "sandbox container removed"),
        Err(err) => warn!(container = %id, error = %err, "failed to remove sandbox container"),
    }
}
