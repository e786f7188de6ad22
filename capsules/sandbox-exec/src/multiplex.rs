//! Fan-in of a sandbox's stdout and stderr followers into one ordered event sequence.
//!
//! Each channel gets its own drain task pushing into a shared unbounded queue. The consumer
//! polls that queue in [`POLL_INTERVAL`] slices so it can notice when the sandbox has finished;
//! the sequence ends once the completion handle has resolved and the queue is empty.

use std::time::Duration;

use futures_util::stream::{self, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::controller::{CompletionHandle, SandboxError};
use crate::engine::{ContainerEngine, ContainerId, LogChannel, LogStream};

pub const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// One non-empty fragment of sandbox output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputEvent {
    pub channel: LogChannel,
    pub chunk: String,
}

/// Open both follow subscriptions on `id` and merge them.
pub async fn multiplex(
    engine: &dyn ContainerEngine,
    id: &ContainerId,
    completion: CompletionHandle,
) -> Result<OutputStream, SandboxError> {
    let primary = open(engine, id, LogChannel::Primary).await?;
    let secondary = open(engine, id, LogChannel::Secondary).await?;
    Ok(OutputStream::merge(primary, secondary, completion))
}

async fn open(
    engine: &dyn ContainerEngine,
    id: &ContainerId,
    channel: LogChannel,
) -> Result<LogStream, SandboxError> {
    engine
        .follow_logs(id, channel)
        .await
        .map_err(|source| SandboxError::Logs {
            container: id.clone(),
            channel,
            source,
        })
}

/// Finite, single-use merged output of one sandbox. Dropping it aborts both drain tasks.
pub struct OutputStream {
    rx: mpsc::UnboundedReceiver<OutputEvent>,
    drains: Vec<JoinHandle<()>>,
    completion: CompletionHandle,
    drained: Option<DrainSignal>,
    exhausted: bool,
}

impl OutputStream {
    pub fn merge(primary: LogStream, secondary: LogStream, completion: CompletionHandle) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (drained_tx, drained_rx) = mpsc::channel::<()>(1);
        let drains = vec![
            tokio::spawn(drain(
                primary,
                LogChannel::Primary,
                tx.clone(),
                drained_tx.clone(),
            )),
            tokio::spawn(drain(secondary, LogChannel::Secondary, tx, drained_tx)),
        ];
        Self {
            rx,
            drains,
            completion,
            drained: Some(DrainSignal(drained_rx)),
            exhausted: false,
        }
    }

    /// Next event in arrival order, or `None` once the sandbox is done and nothing is buffered.
    pub async fn next_event(&mut self) -> Option<OutputEvent> {
        if self.exhausted {
            return None;
        }
        loop {
            if self.completion.is_finished() {
                if let Ok(event) = self.rx.try_recv() {
                    return Some(event);
                }
                return self.finish();
            }

            match tokio::time::timeout(POLL_INTERVAL, self.rx.recv()).await {
                Ok(Some(event)) => return Some(event),
                Ok(None) => {
                    // Both followers closed; nothing else can arrive.
                    let _ = self.completion.wait().await;
                    return self.finish();
                }
                Err(_) => continue,
            }
        }
    }

    pub fn into_stream(self) -> impl Stream<Item = OutputEvent> + Send {
        stream::unfold(self, |mut output| async move {
            output.next_event().await.map(|event| (event, output))
        })
    }

    pub(crate) fn take_drain_signal(&mut self) -> Option<DrainSignal> {
        self.drained.take()
    }

    fn finish(&mut self) -> Option<OutputEvent> {
        self.exhausted = true;
        self.abort_drains();
        None
    }

    fn abort_drains(&mut self) {
        for handle in self.drains.drain(..) {
            handle.abort();
        }
    }
}

impl Drop for OutputStream {
    fn drop(&mut self) {
        self.abort_drains();
    }
}

/// Resolves once every drain task has ended or been aborted.
pub(crate) struct DrainSignal(mpsc::Receiver<()>);

impl DrainSignal {
    pub(crate) async fn finished(mut self) {
        while self.0.recv().await.is_some() {}
    }
}

async fn drain(
    mut logs: LogStream,
    channel: LogChannel,
    tx: mpsc::UnboundedSender<OutputEvent>,
    _alive: mpsc::Sender<()>,
) {
    while let Some(item) = logs.next().await {
        match item {
            Ok(chunk) => {
                let chunk = chunk.into_text();
                if chunk.is_empty() {
                    continue;
                }
                debug!(%channel, bytes = chunk.len(), "sandbox output");
                if tx.send(OutputEvent { channel, chunk }).is_err() {
                    break;
                }
            }
            Err(err) => {
                warn!(%channel, error = %err, "log follower failed");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::{completion_channel, CompletionSender};
    use crate::engine::{EngineError, LogChunk};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    fn chunks(items: Vec<LogChunk>) -> LogStream {
        stream::iter(items.into_iter().map(Ok)).boxed()
    }

    // Mirrors the supervisor: resolve completion only after both followers have flushed.
    async fn settle(output: &mut OutputStream, sender: CompletionSender, exit_code: i64) {
        if let Some(signal) = output.take_drain_signal() {
            signal.finished().await;
        }
        sender.complete(exit_code);
    }

    #[tokio::test]
    async fn merges_both_channels_and_ends_after_completion() {
        let (sender, completion) = completion_channel();
        let primary = chunks(vec!["1\n".into(), "2\n".into(), "3\n".into()]);
        let secondary = chunks(vec![LogChunk::Bytes(b"oops\n".to_vec())]);
        let mut output = OutputStream::merge(primary, secondary, completion);
        settle(&mut output, sender, 0).await;

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        while let Some(event) = output.next_event().await {
            match event.channel {
                LogChannel::Primary => stdout.push(event.chunk),
                LogChannel::Secondary => stderr.push(event.chunk),
            }
        }
        assert_eq!(stdout, vec!["1\n", "2\n", "3\n"]);
        assert_eq!(stderr, vec!["oops\n"]);
        assert!(output.next_event().await.is_none());
    }

    #[tokio::test]
    async fn empty_chunks_are_discarded() {
        let (sender, completion) = completion_channel();
        let primary = chunks(vec!["".into(), LogChunk::Bytes(Vec::new()), "x".into()]);
        let secondary = chunks(vec![]);
        let mut output = OutputStream::merge(primary, secondary, completion);
        settle(&mut output, sender, 0).await;

        let mut events = Vec::new();
        while let Some(event) = output.next_event().await {
            events.push(event);
        }
        assert_eq!(
            events,
            vec![OutputEvent {
                channel: LogChannel::Primary,
                chunk: "x".to_string()
            }]
        );
    }

    #[tokio::test]
    async fn stream_error_ends_only_that_channel() {
        let (sender, completion) = completion_channel();
        let primary = stream::iter(vec![
            Ok(LogChunk::from("before\n")),
            Err(EngineError::Stream {
                message: "broken pipe".to_string(),
            }),
            Ok(LogChunk::from("never\n")),
        ])
        .boxed();
        let secondary = chunks(vec!["err\n".into()]);
        let mut output = OutputStream::merge(primary, secondary, completion);
        settle(&mut output, sender, 1).await;

        let mut seen = Vec::new();
        while let Some(event) = output.next_event().await {
            seen.push(event.chunk);
        }
        seen.sort();
        assert_eq!(seen, vec!["before\n", "err\n"]);
    }

    #[tokio::test]
    async fn keeps_polling_until_completion_resolves() {
        let (sender, completion) = completion_channel();
        let primary = stream::pending().boxed();
        let secondary = chunks(vec![]);
        let mut output = OutputStream::merge(primary, secondary, completion);

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(250)).await;
            sender.complete(0);
        });

        let started = tokio::time::Instant::now();
        assert!(output.next_event().await.is_none());
        assert!(started.elapsed() >= Duration::from_millis(200));
    }

    struct DropFlag(Arc<AtomicBool>);

    impl Drop for DropFlag {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn dropping_the_stream_cancels_drains() {
        let (_sender, completion) = completion_channel();
        let dropped = Arc::new(AtomicBool::new(false));
        let flag = DropFlag(Arc::clone(&dropped));
        let primary = stream::pending::<Result<LogChunk, EngineError>>()
            .map(move |item| {
                let _keep = &flag;
                item
            })
            .boxed();
        let output = OutputStream::merge(primary, chunks(vec![]), completion);
        tokio::task::yield_now().await;
        assert!(!dropped.load(Ordering::SeqCst));

        drop(output);
        for _ in 0..10 {
            if dropped.load(Ordering::SeqCst) {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(dropped.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn drain_signal_fires_when_followers_end() {
        let (_sender, completion) = completion_channel();
        let mut output = OutputStream::merge(chunks(vec!["a".into()]), chunks(vec![]), completion);
        let signal = output.take_drain_signal().unwrap();
        tokio::time::timeout(Duration::from_secs(1), signal.finished())
            .await
            .expect("drains should finish once both streams end");
    }
}
