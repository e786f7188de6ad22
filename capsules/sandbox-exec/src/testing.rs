//! In-process [`ContainerEngine`] that replays scripted output.
//!
//! Used by the test suites of this crate and the runtime so the full run lifecycle can be
//! exercised without a container runtime. Every engine call is recorded for later assertions.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use tokio::sync::watch;

use crate::engine::{
    ContainerEngine, ContainerId, ContainerSpec, EngineError, LogChannel, LogChunk, LogStream,
};

/// Exit code a killed container reports (SIGKILL).
pub const KILLED_EXIT_CODE: i64 = 137;

#[derive(Debug, Clone)]
pub struct ScriptStep {
    pub delay: Duration,
    pub channel: LogChannel,
    pub chunk: LogChunk,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptedExit {
    Code(i64),
    /// Never exits on its own; only a kill or forced removal stops it.
    HangUntilKilled,
}

#[derive(Debug, Clone)]
pub struct Script {
    pub steps: Vec<ScriptStep>,
    pub exit: ScriptedExit,
}

impl Script {
    pub fn exit(code: i64) -> Self {
        Self {
            steps: Vec::new(),
            exit: ScriptedExit::Code(code),
        }
    }

    pub fn hang() -> Self {
        Self {
            steps: Vec::new(),
            exit: ScriptedExit::HangUntilKilled,
        }
    }

    pub fn stdout(self, chunk: impl Into<LogChunk>) -> Self {
        self.step(Duration::ZERO, LogChannel::Primary, chunk)
    }

    pub fn stderr(self, chunk: impl Into<LogChunk>) -> Self {
        self.step(Duration::ZERO, LogChannel::Secondary, chunk)
    }

    pub fn step(mut self, delay: Duration, channel: LogChannel, chunk: impl Into<LogChunk>) -> Self {
        self.steps.push(ScriptStep {
            delay,
            channel,
            chunk: chunk.into(),
        });
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Inspect,
    Pull,
    Create,
    Start,
    Logs,
    Wait,
    Kill,
    Remove,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineCall {
    InspectImage(String),
    PullImage(String),
    Create(ContainerSpec),
    Start(ContainerId),
    FollowLogs(ContainerId, LogChannel),
    Wait(ContainerId),
    Kill(ContainerId),
    Remove(ContainerId),
}

type Responder = dyn Fn(&ContainerSpec) -> Script + Send + Sync;

#[derive(Default)]
struct SimContainer {
    script: Option<Script>,
    logs: Vec<(LogChannel, LogChunk)>,
    exit_code: Option<i64>,
    removed: bool,
}

#[derive(Default)]
struct EngineState {
    next_id: u64,
    image_present: bool,
    failures: HashMap<Operation, String>,
    containers: BTreeMap<ContainerId, SimContainer>,
    calls: Vec<EngineCall>,
}

/// Scripted engine. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct ScriptedEngine {
    state: Arc<Mutex<EngineState>>,
    changed: Arc<watch::Sender<u64>>,
    responder: Arc<Responder>,
}

impl ScriptedEngine {
    /// Every container replays `script`.
    pub fn new(script: Script) -> Self {
        Self::with_responder(move |_| script.clone())
    }

    /// Pick a script per container from its spec (the submitted code is the last argv entry).
    pub fn with_responder<F>(responder: F) -> Self
    where
        F: Fn(&ContainerSpec) -> Script + Send + Sync + 'static,
    {
        let (changed, _) = watch::channel(0);
        Self {
            state: Arc::new(Mutex::new(EngineState {
                image_present: true,
                ..EngineState::default()
            })),
            changed: Arc::new(changed),
            responder: Arc::new(responder),
        }
    }

    /// Image lookups report "not found" until a pull succeeds.
    pub fn without_image(self) -> Self {
        self.lock().image_present = false;
        self
    }

    pub fn fail_on(self, operation: Operation, message: impl Into<String>) -> Self {
        self.lock().failures.insert(operation, message.into());
        self
    }

    pub fn calls(&self) -> Vec<EngineCall> {
        self.lock().calls.clone()
    }

    pub fn created(&self) -> Vec<ContainerSpec> {
        self.filter_calls(|call| match call {
            EngineCall::Create(spec) => Some(spec.clone()),
            _ => None,
        })
    }

    pub fn pulled(&self) -> Vec<String> {
        self.filter_calls(|call| match call {
            EngineCall::PullImage(image) => Some(image.clone()),
            _ => None,
        })
    }

    pub fn killed(&self) -> Vec<ContainerId> {
        self.filter_calls(|call| match call {
            EngineCall::Kill(id) => Some(id.clone()),
            _ => None,
        })
    }

    pub fn removed(&self) -> Vec<ContainerId> {
        self.filter_calls(|call| match call {
            EngineCall::Remove(id) => Some(id.clone()),
            _ => None,
        })
    }

    fn filter_calls<T>(&self, pick: impl Fn(&EngineCall) -> Option<T>) -> Vec<T> {
        self.lock().calls.iter().filter_map(pick).collect()
    }

    fn lock(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(|err| err.into_inner())
    }

    fn record(&self, call: EngineCall, operation: Operation) -> Result<(), EngineError> {
        let mut state = self.lock();
        state.calls.push(call);
        match state.failures.get(&operation) {
            Some(message) => Err(EngineError::Command {
                command: format!("scripted {:?}", operation),
                status: "exit status: 1".to_string(),
                stderr: message.clone(),
            }),
            None => Ok(()),
        }
    }

    fn bump(&self) {
        self.changed.send_modify(|generation| *generation += 1);
    }

    fn with_container<T>(
        &self,
        id: &ContainerId,
        update: impl FnOnce(&mut SimContainer) -> T,
    ) -> Result<T, EngineError> {
        let mut state = self.lock();
        match state.containers.get_mut(id) {
            Some(container) if !container.removed => Ok(update(container)),
            _ => Err(EngineError::NotFound {
                what: id.to_string(),
            }),
        }
    }

    async fn play(self, id: ContainerId, script: Script) {
        for step in script.steps {
            if !step.delay.is_zero() {
                tokio::time::sleep(step.delay).await;
            }
            let running = self
                .with_container(&id, |container| {
                    if container.exit_code.is_some() {
                        return false;
                    }
                    container.logs.push((step.channel, step.chunk.clone()));
                    true
                })
                .unwrap_or(false);
            self.bump();
            if !running {
                return;
            }
        }

        if let ScriptedExit::Code(code) = script.exit {
            let _ = self.with_container(&id, |container| {
                container.exit_code.get_or_insert(code);
            });
            self.bump();
        }
    }
}

#[async_trait]
impl ContainerEngine for ScriptedEngine {
    async fn inspect_image(&self, image: &str) -> Result<(), EngineError> {
        self.record(EngineCall::InspectImage(image.to_string()), Operation::Inspect)?;
        if self.lock().image_present {
            Ok(())
        } else {
            Err(EngineError::NotFound {
                what: image.to_string(),
            })
        }
    }

    async fn pull_image(&self, image: &str) -> Result<(), EngineError> {
        self.record(EngineCall::PullImage(image.to_string()), Operation::Pull)?;
        self.lock().image_present = true;
        Ok(())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<ContainerId, EngineError> {
        self.record(EngineCall::Create(spec.clone()), Operation::Create)?;
        let script = (self.responder)(spec);
        let mut state = self.lock();
        state.next_id += 1;
        let id = ContainerId(format!("scripted-{}", state.next_id));
        state.containers.insert(
            id.clone(),
            SimContainer {
                script: Some(script),
                ..SimContainer::default()
            },
        );
        Ok(id)
    }

    async fn start_container(&self, id: &ContainerId) -> Result<(), EngineError> {
        self.record(EngineCall::Start(id.clone()), Operation::Start)?;
        let script = self.with_container(id, |container| container.script.take())?;
        if let Some(script) = script {
            tokio::spawn(self.clone().play(id.clone(), script));
        }
        Ok(())
    }

    async fn follow_logs(
        &self,
        id: &ContainerId,
        channel: LogChannel,
    ) -> Result<LogStream, EngineError> {
        self.record(EngineCall::FollowLogs(id.clone(), channel), Operation::Logs)?;
        self.with_container(id, |_| ())?;

        let follower = Follower {
            engine: self.clone(),
            id: id.clone(),
            channel,
            cursor: 0,
            changes: self.changed.subscribe(),
        };
        Ok(stream::unfold(follower, |mut follower| async move {
            follower.next().await.map(|chunk| (Ok(chunk), follower))
        })
        .boxed())
    }

    async fn wait_container(&self, id: &ContainerId) -> Result<i64, EngineError> {
        self.record(EngineCall::Wait(id.clone()), Operation::Wait)?;
        let mut changes = self.changed.subscribe();
        loop {
            changes.borrow_and_update();
            let exit_code = {
                let state = self.lock();
                match state.containers.get(id) {
                    Some(container) => container.exit_code,
                    None => {
                        return Err(EngineError::NotFound {
                            what: id.to_string(),
                        })
                    }
                }
            };
            if let Some(code) = exit_code {
                return Ok(code);
            }
            if changes.changed().await.is_err() {
                return Err(EngineError::Stream {
                    message: "engine dropped".to_string(),
                });
            }
        }
    }

    async fn kill_container(&self, id: &ContainerId) -> Result<(), EngineError> {
        self.record(EngineCall::Kill(id.clone()), Operation::Kill)?;
        let was_running = self.with_container(id, |container| {
            if container.exit_code.is_some() {
                return false;
            }
            container.exit_code = Some(KILLED_EXIT_CODE);
            true
        })?;
        self.bump();
        if was_running {
            Ok(())
        } else {
            Err(EngineError::Command {
                command: "scripted kill".to_string(),
                status: "exit status: 1".to_string(),
                stderr: format!("container {} is not running", id),
            })
        }
    }

    async fn remove_container(&self, id: &ContainerId) -> Result<(), EngineError> {
        self.record(EngineCall::Remove(id.clone()), Operation::Remove)?;
        self.with_container(id, |container| {
            container.exit_code.get_or_insert(KILLED_EXIT_CODE);
            container.removed = true;
        })?;
        self.bump();
        Ok(())
    }

    async fn list_containers(&self) -> Result<Vec<ContainerId>, EngineError> {
        let state = self.lock();
        Ok(state
            .containers
            .iter()
            .filter(|(_, container)| !container.removed)
            .map(|(id, _)| id.clone())
            .collect())
    }
}

struct Follower {
    engine: ScriptedEngine,
    id: ContainerId,
    channel: LogChannel,
    cursor: usize,
    changes: watch::Receiver<u64>,
}

impl Follower {
    async fn next(&mut self) -> Option<LogChunk> {
        loop {
            self.changes.borrow_and_update();
            let (chunk, finished) = {
                let state = self.engine.lock();
                let container = state.containers.get(&self.id)?;
                let mut found = None;
                while self.cursor < container.logs.len() {
                    let (channel, chunk) = &container.logs[self.cursor];
                    self.cursor += 1;
                    if *channel == self.channel {
                        found = Some(chunk.clone());
                        break;
                    }
                }
                (found, container.exit_code.is_some() || container.removed)
            };
            if chunk.is_some() {
                return chunk;
            }
            if finished {
                return None;
            }
            if self.changes.changed().await.is_err() {
                return None;
            }
        }
    }
}
