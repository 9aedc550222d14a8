//! OpenAI-compatible chat gateway in front of an Ollama server.
//!
//! Requests arrive at [`server::router`], generations are started through
//! [`InferenceClient`], and streamed replies are pumped to the client as
//! server-sent events by [`TokenPump`].

pub mod args;
pub mod config;
pub mod error;
pub mod llm;
pub mod logger;
pub mod openai;
pub mod pump;
pub mod server;
pub mod shutdown;
#[cfg(test)]
mod test_helpers;

pub use config::{GatewayConfig, GenerationOptions, OllamaConfig};
pub use error::{ClientDisconnected, GatewayError, InferenceError};
pub use llm::{
    GenerationTask, InferenceBackend, InferenceClient, LocalModel, OllamaBackend, Token,
    TokenChannel, TokenEvent, TokenStream,
};
pub use pump::{ChannelSink, FrameSink, PumpOutcome, TokenPump};
pub use server::{AppState, router};
pub use shutdown::shutdown_signal;
