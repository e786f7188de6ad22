//! Sandboxed code execution for coderoom.
//!
//! [`SandboxController::execute`] runs untrusted code inside a throwaway container with no
//! network, a memory ceiling and a process-count ceiling. It hands back an [`OutputStream`]
//! merging the container's stdout and stderr, and a [`CompletionHandle`] that resolves to the
//! exit code (or [`TIMEOUT_EXIT_CODE`]) once the container has been removed.

pub mod controller;
pub mod docker;
pub mod engine;
pub mod multiplex;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use controller::{
    completion_channel, run_command, CompletionHandle, CompletionSender, SandboxController,
    SandboxError, SandboxLimits, SandboxSettings, DEFAULT_IMAGE, DEFAULT_MEMORY_BYTES,
    DEFAULT_PIDS_LIMIT, DEFAULT_TIMEOUT, TIMEOUT_EXIT_CODE,
};
pub use docker::DockerCli;
pub use engine::{
    ContainerEngine, ContainerId, ContainerSpec, EngineError, LogChannel, LogChunk, LogStream,
    SANDBOX_LABEL,
};
pub use multiplex::{multiplex, OutputEvent, OutputStream, POLL_INTERVAL};
