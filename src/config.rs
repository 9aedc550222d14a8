use serde::Serialize;
use std::time::Duration;

/// Sampling parameters forwarded to Ollama as `options`.
///
/// Unset values are left out of the request so the model's own defaults
/// apply.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct GenerationOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub num_ctx: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub num_gpu: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub num_thread: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repeat_penalty: Option<f32>,
}

/// Connection and prompt settings for the Ollama backend.
#[derive(Debug, Clone)]
pub struct OllamaConfig {
    /// Base URL such as `http://localhost:11434`.
    pub base_url: String,
    /// Model used for every generation.
    pub model: String,
    pub options: GenerationOptions,
    pub system: Option<String>,
    pub template: Option<String>,
    pub keep_alive: Option<String>,
}

impl OllamaConfig {
    /// Settings for `model` at `base_url` with no prompt overrides.
    pub fn new(base_url: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            model: model.into(),
            options: GenerationOptions::default(),
            system: None,
            template: None,
            keep_alive: None,
        }
    }
}

/// Process-wide settings, built once at startup and shared read-only.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
    pub ollama: OllamaConfig,
    /// Wall-clock limit for one generation, streaming or not.
    pub timeout: Duration,
    /// Capacity of the per-request token channel.
    pub token_buffer: usize,
    /// Time out streams that stall without producing tokens.
    pub stall_watchdog: bool,
}

impl GatewayConfig {
    /// Configuration for `ollama` with default server settings.
    pub fn new(ollama: OllamaConfig) -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 8000,
            ollama,
            timeout: Duration::from_secs(20 * 60),
            token_buffer: 64,
            stall_watchdog: false,
        }
    }

    /// Set the generation timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Enable or disable the stall watchdog.
    pub fn stall_watchdog(mut self, enabled: bool) -> Self {
        self.stall_watchdog = enabled;
        self
    }

    /// Socket address string the server binds to.
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
