//! Token stream pump.
//!
//! Moves tokens from a [`GenerationTask`]'s channel to a client as SSE chunk
//! frames. Every iteration checks client liveness first, then waits for the
//! next token; each token is checked against the generation deadline before
//! it is emitted. Whatever terminal state is reached, the generation task is
//! cancelled on the way out and tokens still buffered are dropped.

use async_trait::async_trait;
use bytes::Bytes;
use std::convert::Infallible;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::config::GatewayConfig;
use crate::error::ClientDisconnected;
use crate::llm::{GenerationTask, InferenceClient, TokenChannel, TokenEvent};
use crate::openai;

/// Terminal state of a pumped stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PumpOutcome {
    /// All tokens and the terminal marker were sent.
    Completed,
    /// The process is shutting down; output stopped without a marker.
    Cancelled,
    /// The generation ran past its deadline; the marker was sent.
    TimedOut,
    /// The client went away; nothing more was sent.
    ClientGone,
    /// Generation or encoding failed; the marker was sent.
    Failed(String),
}

/// Destination for SSE frames, usually the body of an HTTP response.
#[async_trait]
pub trait FrameSink: Send {
    /// Whether the client can still receive frames.
    fn is_open(&self) -> bool;

    /// Resolves once the client has gone away.
    async fn closed(&self);

    /// Delivers one frame.
    async fn send(&mut self, frame: Bytes) -> Result<(), ClientDisconnected>;
}

/// [`FrameSink`] feeding an HTTP body through a bounded channel.
///
/// The receiving half is dropped when the client disconnects.
pub struct ChannelSink {
    tx: mpsc::Sender<Result<Bytes, Infallible>>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::Sender<Result<Bytes, Infallible>>) -> Self {
        Self { tx }
    }
}

#[async_trait]
impl FrameSink for ChannelSink {
    fn is_open(&self) -> bool {
        !self.tx.is_closed()
    }

    async fn closed(&self) {
        self.tx.closed().await
    }

    async fn send(&mut self, frame: Bytes) -> Result<(), ClientDisconnected> {
        self.tx.send(Ok(frame)).await.map_err(|_| ClientDisconnected)
    }
}

/// Drives one streaming request from generation start to terminal state.
pub struct TokenPump {
    client: InferenceClient,
    timeout: Duration,
    stall_watchdog: bool,
    shutdown: CancellationToken,
}

impl TokenPump {
    pub fn new(
        client: InferenceClient,
        config: &GatewayConfig,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            client,
            timeout: config.timeout,
            stall_watchdog: config.stall_watchdog,
            shutdown,
        }
    }

    /// Starts a generation for `prompt` and pumps it into `sink`.
    pub async fn stream<S: FrameSink>(&self, prompt: String, sink: &mut S) -> PumpOutcome {
        let (task, tokens) = self.client.generate(prompt);
        self.pump(task, tokens, sink).await
    }

    /// Pumps an already started generation into `sink`.
    pub async fn pump<S: FrameSink>(
        &self,
        mut task: GenerationTask,
        mut tokens: TokenChannel,
        sink: &mut S,
    ) -> PumpOutcome {
        let outcome = self.drive(&mut task, &mut tokens, sink).await;
        task.cancel();
        let dropped = tokens.discard();
        if dropped > 0 {
            debug!(dropped, "discarded tokens buffered after stream end");
        }
        match &outcome {
            PumpOutcome::Completed => debug!("stream completed"),
            PumpOutcome::Cancelled => info!("stream cancelled by shutdown"),
            PumpOutcome::TimedOut => warn!(timeout = ?self.timeout, "stream timed out"),
            PumpOutcome::ClientGone => info!("client disconnected, stream stopped"),
            PumpOutcome::Failed(reason) => error!(%reason, "stream failed"),
        }
        outcome
    }

    async fn drive<S: FrameSink>(
        &self,
        task: &mut GenerationTask,
        tokens: &mut TokenChannel,
        sink: &mut S,
    ) -> PumpOutcome {
        let deadline = task.started() + self.timeout;
        loop {
            if !sink.is_open() {
                return PumpOutcome::ClientGone;
            }
            let event = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => return PumpOutcome::Cancelled,
                _ = sink.closed() => return PumpOutcome::ClientGone,
                _ = tokio::time::sleep_until(deadline), if self.stall_watchdog => {
                    return self.time_out(task, sink).await;
                }
                event = tokens.recv() => event,
            };
            match event {
                Some(TokenEvent::Token(text)) => {
                    if text.is_empty() {
                        continue;
                    }
                    if task.elapsed() > self.timeout {
                        return self.time_out(task, sink).await;
                    }
                    let frame = match openai::chunk_frame(&text) {
                        Ok(frame) => frame,
                        Err(e) => {
                            let outcome = PumpOutcome::Failed(e.to_string());
                            return self.finish(sink, outcome).await;
                        }
                    };
                    trace!(token = %text, "chunk");
                    if sink.send(frame).await.is_err() {
                        return PumpOutcome::ClientGone;
                    }
                }
                Some(TokenEvent::Done) => {
                    if !task.is_finished() {
                        if let Err(e) = task.wait().await {
                            debug!(error = %e, "generation ended with error after done");
                        }
                    }
                    return self.finish(sink, PumpOutcome::Completed).await;
                }
                Some(TokenEvent::Failed(reason)) => {
                    return self.finish(sink, PumpOutcome::Failed(reason)).await;
                }
                None => {
                    let reason = "generation ended without a terminal event".to_string();
                    return self.finish(sink, PumpOutcome::Failed(reason)).await;
                }
            }
        }
    }

    async fn time_out<S: FrameSink>(
        &self,
        task: &mut GenerationTask,
        sink: &mut S,
    ) -> PumpOutcome {
        warn!(
            model = %task.model(),
            elapsed = ?task.elapsed(),
            "generation deadline passed, stopping"
        );
        task.cancel();
        self.client.stop(task.model()).await;
        self.finish(sink, PumpOutcome::TimedOut).await
    }

    /// Sends the terminal marker and reports `outcome`.
    async fn finish<S: FrameSink>(&self, sink: &mut S, outcome: PumpOutcome) -> PumpOutcome {
        if sink.send(Bytes::from_static(openai::DONE_FRAME)).await.is_err() {
            debug!("client gone before terminal marker");
            return PumpOutcome::ClientGone;
        }
        outcome
    }
}
