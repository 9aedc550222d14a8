#![cfg(test)]

use async_stream::stream;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::error::{ClientDisconnected, InferenceError};
use crate::llm::{InferenceBackend, LocalModel, Token, TokenStream};
use crate::pump::FrameSink;

/// One scripted action of a [`ScriptedBackend`] generation.
#[derive(Clone, Debug)]
pub enum Step {
    Token(String),
    Sleep(Duration),
    Fail(String),
    /// Never produce anything again.
    Hang,
}

/// [`InferenceBackend`] replaying a fixed script and recording stop calls.
#[derive(Clone, Default)]
pub struct ScriptedBackend {
    steps: Vec<Step>,
    models: Option<Vec<LocalModel>>,
    pub stops: Arc<Mutex<Vec<String>>>,
    active: Arc<AtomicUsize>,
}

/// Counts a generation stream as live until dropped.
struct ActiveGuard(Arc<AtomicUsize>);

impl ActiveGuard {
    fn new(counter: Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl ScriptedBackend {
    pub fn new(steps: Vec<Step>) -> Self {
        Self {
            steps,
            ..Default::default()
        }
    }

    /// Backend emitting `tokens` back to back.
    pub fn tokens<'a>(tokens: impl IntoIterator<Item = &'a str>) -> Self {
        Self::new(tokens.into_iter().map(|t| Step::Token(t.into())).collect())
    }

    /// Backend whose model listing succeeds with `models`.
    pub fn with_models(mut self, models: Vec<LocalModel>) -> Self {
        self.models = Some(models);
        self
    }

    pub fn stop_calls(&self) -> Vec<String> {
        self.stops.lock().unwrap().clone()
    }

    /// Number of generation streams not yet dropped.
    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Waits until every generation stream has been dropped.
    pub async fn wait_idle(&self) {
        while self.active() > 0 {
            tokio::task::yield_now().await;
        }
    }
}

#[async_trait]
impl InferenceBackend for ScriptedBackend {
    fn model(&self) -> &str {
        "scripted"
    }

    async fn generate_stream(&self, _prompt: &str) -> Result<TokenStream, InferenceError> {
        let steps = self.steps.clone();
        let guard = ActiveGuard::new(Arc::clone(&self.active));
        let out = stream! {
            let _guard = guard;
            for step in steps {
                match step {
                    Step::Token(text) => {
                        yield Ok(Token { text });
                    }
                    Step::Sleep(d) => tokio::time::sleep(d).await,
                    Step::Fail(msg) => {
                        yield Err(InferenceError::Backend(msg));
                        break;
                    }
                    Step::Hang => std::future::pending::<()>().await,
                }
            }
        };
        Ok(Box::pin(out))
    }

    async fn stop(&self, model: &str) -> Result<(), InferenceError> {
        self.stops.lock().unwrap().push(model.to_string());
        Ok(())
    }

    async fn list_models(&self) -> Result<Vec<LocalModel>, InferenceError> {
        self.models
            .clone()
            .ok_or_else(|| InferenceError::Backend("connection refused".into()))
    }
}

/// [`FrameSink`] collecting frames, optionally going away after `close_after`
/// frames.
#[derive(Default)]
pub struct RecordingSink {
    pub frames: Vec<Bytes>,
    close_after: Option<usize>,
}

impl RecordingSink {
    pub fn closing_after(frames: usize) -> Self {
        Self {
            frames: Vec::new(),
            close_after: Some(frames),
        }
    }

    /// Frames as UTF-8 strings.
    pub fn texts(&self) -> Vec<String> {
        self.frames
            .iter()
            .map(|f| String::from_utf8_lossy(f).into_owned())
            .collect()
    }

    /// Delta contents of the chunk frames, in order.
    pub fn deltas(&self) -> Vec<String> {
        self.texts()
            .iter()
            .filter_map(|t| t.strip_prefix("data: "))
            .filter(|t| !t.starts_with("[DONE]"))
            .map(|t| {
                let v: serde_json::Value = serde_json::from_str(t.trim()).unwrap();
                v["choices"][0]["delta"]["content"].as_str().unwrap().to_string()
            })
            .collect()
    }

    pub fn done_markers(&self) -> usize {
        self.texts().iter().filter(|t| *t == "data: [DONE]\n\n").count()
    }
}

#[async_trait]
impl FrameSink for RecordingSink {
    fn is_open(&self) -> bool {
        self.close_after.is_none_or(|n| self.frames.len() < n)
    }

    async fn closed(&self) {
        if self.is_open() {
            std::future::pending::<()>().await;
        }
    }

    async fn send(&mut self, frame: Bytes) -> Result<(), ClientDisconnected> {
        if !self.is_open() {
            return Err(ClientDisconnected);
        }
        self.frames.push(frame);
        Ok(())
    }
}
