use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::{InferenceBackend, LocalModel};
use crate::config::GatewayConfig;
use crate::error::InferenceError;

/// Item carried by a [`TokenChannel`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenEvent {
    /// Next text fragment.
    Token(String),
    /// Generation finished normally.
    Done,
    /// Generation failed; no more tokens follow.
    Failed(String),
}

/// Receiving half of a generation's token queue.
///
/// Fragments arrive in the order the backend produced them, followed by
/// exactly one [`TokenEvent::Done`] or [`TokenEvent::Failed`].
pub struct TokenChannel {
    rx: mpsc::Receiver<TokenEvent>,
}

impl TokenChannel {
    /// Creates a bounded channel and its sending half.
    pub fn bounded(capacity: usize) -> (mpsc::Sender<TokenEvent>, Self) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (tx, Self { rx })
    }

    /// Waits for the next event. `None` means the producer vanished without
    /// a terminal event.
    pub async fn recv(&mut self) -> Option<TokenEvent> {
        self.rx.recv().await
    }

    /// Closes the channel and throws away anything still buffered.
    ///
    /// Returns the number of fragments dropped.
    pub fn discard(&mut self) -> usize {
        self.rx.close();
        let mut dropped = 0;
        while let Ok(event) = self.rx.try_recv() {
            if matches!(event, TokenEvent::Token(_)) {
                dropped += 1;
            }
        }
        dropped
    }
}

/// Handle to one in-flight generation.
///
/// Dropping the handle cancels the generation.
pub struct GenerationTask {
    handle: Option<JoinHandle<Result<String, InferenceError>>>,
    model: String,
    started: Instant,
    cancelled: bool,
}

impl GenerationTask {
    fn new(handle: JoinHandle<Result<String, InferenceError>>, model: String) -> Self {
        Self {
            handle: Some(handle),
            model,
            started: Instant::now(),
            cancelled: false,
        }
    }

    /// Model this generation runs against.
    pub fn model(&self) -> &str {
        &self.model
    }

    /// When the generation was started.
    pub fn started(&self) -> Instant {
        self.started
    }

    /// Wall-clock time since the generation was started.
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Whether the underlying task has resolved.
    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().is_none_or(|h| h.is_finished())
    }

    /// Whether [`cancel`](Self::cancel) has been called.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }

    /// Requests early termination. Safe to call repeatedly and after the
    /// task has completed.
    pub fn cancel(&mut self) {
        if self.cancelled {
            return;
        }
        self.cancelled = true;
        if let Some(handle) = &self.handle {
            if !handle.is_finished() {
                handle.abort();
                debug!(model = %self.model, "generation cancelled");
            }
        }
    }

    /// Waits for the generation to resolve without any time limit.
    pub async fn wait(&mut self) -> Result<String, InferenceError> {
        match self.handle.take() {
            Some(handle) => flatten(handle.await),
            None => Err(InferenceError::Aborted),
        }
    }

    /// Waits at most `limit` for the generation. On timeout the task is
    /// cancelled and [`InferenceError::Timeout`] is returned.
    pub async fn await_with_timeout(mut self, limit: Duration) -> Result<String, InferenceError> {
        let Some(handle) = self.handle.as_mut() else {
            return Err(InferenceError::Aborted);
        };
        match tokio::time::timeout(limit, handle).await {
            Ok(joined) => {
                self.handle = None;
                flatten(joined)
            }
            Err(_) => {
                warn!(model = %self.model, ?limit, "generation timed out");
                self.cancel();
                Err(InferenceError::Timeout(limit))
            }
        }
    }
}

impl Drop for GenerationTask {
    fn drop(&mut self) {
        self.cancel();
    }
}

fn flatten(
    joined: Result<Result<String, InferenceError>, JoinError>,
) -> Result<String, InferenceError> {
    match joined {
        Ok(res) => res,
        Err(e) if e.is_cancelled() => Err(InferenceError::Aborted),
        Err(_) => Err(InferenceError::Panicked),
    }
}

/// Starts generations against an [`InferenceBackend`].
#[derive(Clone)]
pub struct InferenceClient {
    backend: Arc<dyn InferenceBackend>,
    buffer: usize,
}

impl InferenceClient {
    /// Creates a client using the channel capacity from `config`.
    pub fn new(backend: Arc<dyn InferenceBackend>, config: &GatewayConfig) -> Self {
        Self {
            backend,
            buffer: config.token_buffer,
        }
    }

    /// Returns the backend this client drives.
    pub fn backend(&self) -> &Arc<dyn InferenceBackend> {
        &self.backend
    }

    /// Starts generating a reply to `prompt` in the background.
    ///
    /// Returns immediately. The channel receives every fragment and then one
    /// terminal event; the task resolves to the full text. Dropping the
    /// channel does not stop the generation.
    pub fn generate(&self, prompt: impl Into<String>) -> (GenerationTask, TokenChannel) {
        let prompt = prompt.into();
        let backend = Arc::clone(&self.backend);
        let model = backend.model().to_string();
        let (tx, channel) = TokenChannel::bounded(self.buffer);
        let handle = tokio::spawn(async move {
            info!(model = %backend.model(), "generation started");
            let mut stream = match backend.generate_stream(&prompt).await {
                Ok(stream) => stream,
                Err(e) => {
                    error!(error = %e, "generation failed to start");
                    let _ = tx.send(TokenEvent::Failed(e.to_string())).await;
                    return Err(e);
                }
            };
            let mut full = String::new();
            while let Some(item) = stream.next().await {
                match item {
                    Ok(tok) => {
                        full.push_str(&tok.text);
                        let _ = tx.send(TokenEvent::Token(tok.text)).await;
                    }
                    Err(e) => {
                        error!(error = %e, "generation failed");
                        let _ = tx.send(TokenEvent::Failed(e.to_string())).await;
                        return Err(e);
                    }
                }
            }
            let _ = tx.send(TokenEvent::Done).await;
            info!(chars = full.len(), "generation finished");
            Ok(full)
        });
        (GenerationTask::new(handle, model), channel)
    }

    /// Best-effort request for the backend to stop generating for `model`.
    pub async fn stop(&self, model: &str) {
        const STOP_LIMIT: Duration = Duration::from_secs(5);
        match tokio::time::timeout(STOP_LIMIT, self.backend.stop(model)).await {
            Ok(Ok(())) => debug!(%model, "stop signal delivered"),
            Ok(Err(e)) => warn!(%model, error = %e, "stop signal failed"),
            Err(_) => warn!(%model, "stop signal timed out"),
        }
    }

    /// Lists the models known to the backend.
    pub async fn list_models(&self) -> Result<Vec<LocalModel>, InferenceError> {
        self.backend.list_models().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OllamaConfig;
    use crate::test_helpers::{ScriptedBackend, Step};

    fn client(backend: ScriptedBackend) -> InferenceClient {
        let config = GatewayConfig::new(OllamaConfig::new("http://unused", "scripted"));
        InferenceClient::new(Arc::new(backend), &config)
    }

    #[tokio::test]
    async fn channel_delivers_tokens_then_done() {
        let client = client(ScriptedBackend::tokens(["a", "b", "c"]));
        let (mut task, mut tokens) = client.generate("hi");
        let mut events = Vec::new();
        while let Some(ev) = tokens.recv().await {
            let last = ev == TokenEvent::Done;
            events.push(ev);
            if last {
                break;
            }
        }
        assert_eq!(
            events,
            vec![
                TokenEvent::Token("a".into()),
                TokenEvent::Token("b".into()),
                TokenEvent::Token("c".into()),
                TokenEvent::Done,
            ]
        );
        assert_eq!(task.wait().await.unwrap(), "abc");
        assert_eq!(task.model(), "scripted");
    }

    #[tokio::test]
    async fn failure_is_a_terminal_event() {
        let client = client(ScriptedBackend::new(vec![
            Step::Token("x".into()),
            Step::Fail("boom".into()),
        ]));
        let (task, mut tokens) = client.generate("hi");
        assert_eq!(tokens.recv().await, Some(TokenEvent::Token("x".into())));
        match tokens.recv().await {
            Some(TokenEvent::Failed(reason)) => assert!(reason.contains("boom")),
            other => panic!("unexpected: {other:?}"),
        }
        drop(task);
    }

    #[tokio::test]
    async fn dropped_channel_does_not_stop_generation() {
        let words: Vec<String> = (0..200).map(|i| format!("{i} ")).collect();
        let client = client(ScriptedBackend::tokens(words.iter().map(String::as_str)));
        let (task, tokens) = client.generate("hi");
        drop(tokens);
        let text = task.await_with_timeout(Duration::from_secs(5)).await.unwrap();
        assert!(text.starts_with("0 1 2 "));
    }

    #[tokio::test(start_paused = true)]
    async fn bounded_wait_times_out_and_cancels() {
        let client = client(ScriptedBackend::new(vec![Step::Hang]));
        let (task, _tokens) = client.generate("hi");
        let err = task
            .await_with_timeout(Duration::from_secs(3))
            .await
            .unwrap_err();
        assert!(matches!(err, InferenceError::Timeout(_)));
    }

    #[tokio::test]
    async fn cancel_is_idempotent() {
        let client = client(ScriptedBackend::new(vec![Step::Hang]));
        let (mut task, _tokens) = client.generate("hi");
        task.cancel();
        task.cancel();
        assert!(task.is_cancelled());
        assert!(matches!(task.wait().await, Err(InferenceError::Aborted)));
        task.cancel();
    }

    #[tokio::test]
    async fn cancel_after_completion_is_a_no_op() {
        let client = client(ScriptedBackend::tokens(["done"]));
        let (mut task, mut tokens) = client.generate("hi");
        while let Some(ev) = tokens.recv().await {
            if ev == TokenEvent::Done {
                break;
            }
        }
        while !task.is_finished() {
            tokio::task::yield_now().await;
        }
        task.cancel();
        assert_eq!(task.wait().await.unwrap(), "done");
    }

    #[tokio::test]
    async fn discard_counts_buffered_tokens() {
        let (tx, mut channel) = TokenChannel::bounded(8);
        tx.send(TokenEvent::Token("a".into())).await.unwrap();
        tx.send(TokenEvent::Token("b".into())).await.unwrap();
        tx.send(TokenEvent::Done).await.unwrap();
        assert_eq!(channel.discard(), 2);
        assert!(tx.send(TokenEvent::Token("late".into())).await.is_err());
    }
}
