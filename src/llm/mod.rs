//! Inference backend seam and the per-request generation plumbing.

mod generation;
mod ollama;

pub use generation::{GenerationTask, InferenceClient, TokenChannel, TokenEvent};
pub use ollama::OllamaBackend;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::Deserialize;

use crate::error::InferenceError;

/// Text token emitted by a language model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    /// Token text as produced by the model.
    pub text: String,
}

/// Stream of [`Token`]s, ending early with an error if the backend fails.
pub type TokenStream = BoxStream<'static, Result<Token, InferenceError>>;

/// Model entry reported by the backend's tag listing.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct LocalModel {
    pub name: String,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub modified_at: Option<String>,
}

/// Engine that turns prompts into tokens.
#[async_trait]
pub trait InferenceBackend: Send + Sync {
    /// Model every generation runs against.
    fn model(&self) -> &str;

    /// Starts a generation for `prompt` and streams its tokens.
    async fn generate_stream(&self, prompt: &str) -> Result<TokenStream, InferenceError>;

    /// Asks the backend to stop work for `model`.
    async fn stop(&self, model: &str) -> Result<(), InferenceError>;

    /// Lists the models the backend can serve.
    async fn list_models(&self) -> Result<Vec<LocalModel>, InferenceError>;
}
