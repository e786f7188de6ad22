use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use capsules_sandbox_exec::{LogChannel, SandboxController};
use futures_util::FutureExt;
use serde_json::Value as JsonValue;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::connection::{Connection, ConnectionId};
use super::models::{
    ClientMessage, Language, RunOutcome, RunRequest, RunSession, RunStatus, ServerMessage,
};
use super::registry::{RoomRegistry, RunGuard};

pub const BUSY_MESSAGE: &str = "A run is already in progress in this room. Wait for it to finish.";
pub const UNSUPPORTED_LANGUAGE_CHUNK: &str = "Only python is supported for now\n";
pub const EMPTY_CODE_CHUNK: &str = "Nothing to run: code is empty\n";
pub const SERVER_ERROR_CHUNK: &str = "Server error: code execution failed\n";
/// Exit code reported for rejected requests and server errors.
pub const FAILURE_EXIT_CODE: i64 = 1;

/// Drives the room protocol for every connection of the process.
#[derive(Clone)]
pub struct RoomService {
    registry: Arc<RoomRegistry>,
    sandbox: Arc<SandboxController>,
}

impl RoomService {
    pub fn new(registry: Arc<RoomRegistry>, sandbox: Arc<SandboxController>) -> Self {
        Self { registry, sandbox }
    }

    pub fn registry(&self) -> &Arc<RoomRegistry> {
        &self.registry
    }

    pub async fn connect(&self, room_id: &str, connection: &Arc<dyn Connection>) {
        self.registry.join(room_id, connection);
        self.registry
            .broadcast(
                room_id,
                &ServerMessage::RoomJoined {
                    room_id: room_id.to_string(),
                },
            )
            .await;
    }

    pub async fn disconnect(&self, room_id: &str, connection: &ConnectionId) {
        self.registry.leave(room_id, connection);
        self.registry
            .broadcast(
                room_id,
                &ServerMessage::RoomLeft {
                    room_id: room_id.to_string(),
                },
            )
            .await;
    }

    /// Handles one inbound text frame and waits for any run it started.
    pub async fn handle_text(&self, room_id: &str, connection: &Arc<dyn Connection>, text: &str) {
        let run = self.dispatch_text(room_id, connection, text).await;
        join_run(room_id, run).await;
    }

    pub async fn handle_message(
        &self,
        room_id: &str,
        connection: &Arc<dyn Connection>,
        value: JsonValue,
    ) {
        let run = self.dispatch_message(room_id, connection, value).await;
        join_run(room_id, run).await;
    }

    /// Runs `request` for the room and returns once the run has finished.
    pub async fn request_run(
        &self,
        room_id: &str,
        connection: &Arc<dyn Connection>,
        request: RunRequest,
    ) {
        let run = self.start_run(room_id, connection, request).await;
        join_run(room_id, run).await;
    }

    /// Handles one inbound text frame. Frames that are not JSON are ignored. A run the frame
    /// started keeps going on its own task; its handle is returned.
    pub async fn dispatch_text(
        &self,
        room_id: &str,
        connection: &Arc<dyn Connection>,
        text: &str,
    ) -> Option<JoinHandle<()>> {
        match serde_json::from_str::<JsonValue>(text) {
            Ok(value) => self.dispatch_message(room_id, connection, value).await,
            Err(err) => {
                warn!(room = %room_id, connection = %connection.id(), error = %err, "ignoring non-JSON frame");
                None
            }
        }
    }

    pub async fn dispatch_message(
        &self,
        room_id: &str,
        connection: &Arc<dyn Connection>,
        value: JsonValue,
    ) -> Option<JoinHandle<()>> {
        match ClientMessage::from_value(value) {
            Ok(ClientMessage::RunRequest(request)) => {
                self.start_run(room_id, connection, request).await
            }
            Ok(ClientMessage::Relay(data)) => {
                self.registry
                    .broadcast(
                        room_id,
                        &ServerMessage::RoomMessage {
                            room_id: room_id.to_string(),
                            data,
                        },
                    )
                    .await;
                None
            }
            Err(err) => {
                warn!(room = %room_id, connection = %connection.id(), error = %err, "ignoring malformed run request");
                None
            }
        }
    }

    /// Starts `request` unless another run holds the room's gate, in which case only the
    /// requester hears `run.busy` and `None` comes back.
    pub async fn start_run(
        &self,
        room_id: &str,
        connection: &Arc<dyn Connection>,
        request: RunRequest,
    ) -> Option<JoinHandle<()>> {
        let Some(guard) = self.registry.try_acquire_run(room_id) else {
            debug!(room = %room_id, connection = %connection.id(), "run rejected: room busy");
            let busy = ServerMessage::RunBusy {
                room_id: room_id.to_string(),
                message: BUSY_MESSAGE.to_string(),
            };
            if let Err(err) = self.registry.send_to(room_id, connection.id(), &busy).await {
                warn!(room = %room_id, connection = %connection.id(), error = %err, "failed to deliver run.busy");
            }
            return None;
        };

        let session = RunSession::new(room_id, request);
        // The run belongs to the room, not the requesting connection.
        Some(tokio::spawn(self.clone().execute(session, guard)))
    }

    async fn execute(self, mut session: RunSession, gate: RunGuard) {
        session.transition(RunStatus::Running);
        info!(room = %session.room_id, run = %session.run_id, lang = %session.lang, "run started");
        self.registry
            .broadcast(&session.room_id, &session.start_message())
            .await;

        let outcome = match AssertUnwindSafe(self.run_to_completion(&session))
            .catch_unwind()
            .await
        {
            Ok(outcome) => outcome,
            Err(panic) => RunOutcome::Failed(panic_message(panic)),
        };

        self.finish(&mut session, outcome).await;
        drop(gate);
        self.registry.prune_if_idle(&session.room_id);
    }

    async fn run_to_completion(&self, session: &RunSession) -> RunOutcome {
        if Language::parse(&session.lang).is_none() {
            return RunOutcome::Rejected(UNSUPPORTED_LANGUAGE_CHUNK.to_string());
        }
        if session.code.trim().is_empty() {
            return RunOutcome::Rejected(EMPTY_CODE_CHUNK.to_string());
        }

        let (mut output, completion) = match self.sandbox.run(&session.code).await {
            Ok(started) => started,
            Err(err) => return RunOutcome::Failed(err.to_string()),
        };

        while let Some(event) = output.next_event().await {
            debug!(
                room = %session.room_id,
                run = %session.run_id,
                channel = %event.channel,
                bytes = event.chunk.len(),
                "run output"
            );
            let message = match event.channel {
                LogChannel::Primary => session.stdout(event.chunk),
                LogChannel::Secondary => session.stderr(event.chunk),
            };
            self.registry.broadcast(&session.room_id, &message).await;
        }

        match completion.wait().await {
            Ok(exit_code) => RunOutcome::Completed(exit_code),
            Err(err) => RunOutcome::Failed(err.to_string()),
        }
    }

    async fn finish(&self, session: &mut RunSession, outcome: RunOutcome) {
        let exit_code = match outcome {
            RunOutcome::Completed(exit_code) => {
                session.transition(RunStatus::Completed { exit_code });
                exit_code
            }
            RunOutcome::Rejected(reason) => {
                session.transition(RunStatus::Completed {
                    exit_code: FAILURE_EXIT_CODE,
                });
                self.registry
                    .broadcast(&session.room_id, &session.stderr(reason))
                    .await;
                FAILURE_EXIT_CODE
            }
            RunOutcome::Failed(detail) => {
                error!(room = %session.room_id, run = %session.run_id, error = %detail, "run failed");
                session.transition(RunStatus::Failed);
                self.registry
                    .broadcast(
                        &session.room_id,
                        &session.stderr(SERVER_ERROR_CHUNK.to_string()),
                    )
                    .await;
                FAILURE_EXIT_CODE
            }
        };

        self.registry
            .broadcast(&session.room_id, &session.end(exit_code))
            .await;
        info!(room = %session.room_id, run = %session.run_id, exit_code, "run finished");
    }
}

async fn join_run(room_id: &str, run: Option<JoinHandle<()>>) {
    if let Some(run) = run {
        if let Err(err) = run.await {
            error!(room = %room_id, error = %err, "run task aborted");
        }
    }
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        format!("run panicked: {}", message)
    } else if let Some(message) = panic.downcast_ref::<String>() {
        format!("run panicked: {}", message)
    } else {
        "run panicked".to_string()
    }
}
