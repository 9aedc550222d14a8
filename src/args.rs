use clap::Parser;
use std::time::Duration;

use crate::config::{GatewayConfig, GenerationOptions, OllamaConfig};

const DEFAULT_SYSTEM_PROMPT: &str = include_str!("prompts/system_prompt.txt");

/// Command line arguments for the gateway binary.
///
/// Every flag falls back to the environment variable the deployment already
/// exports, so the binary can run without any arguments.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "ollama-gateway",
    about = "OpenAI-compatible chat gateway in front of an Ollama server"
)]
pub struct Args {
    #[arg(long, env = "HOST", default_value = "0.0.0.0")]
    pub host: String,
    #[arg(long, env = "PORT", default_value_t = 8000)]
    pub port: u16,
    #[arg(
        long = "ollama-url",
        env = "OLLAMA_API_BASE",
        default_value = "http://localhost:11434"
    )]
    pub ollama_url: String,
    #[arg(long, env = "MODEL_NAME", default_value = "llama3")]
    pub model: String,
    #[arg(long, env = "TEMPERATURE", default_value_t = 0.7)]
    pub temperature: f32,
    #[arg(long = "top-p", env = "TOP_P")]
    pub top_p: Option<f32>,
    #[arg(long = "top-k", env = "TOP_K")]
    pub top_k: Option<u32>,
    #[arg(long = "num-ctx", env = "NUM_CTX")]
    pub num_ctx: Option<u32>,
    #[arg(long = "num-gpu", env = "NUM_GPU")]
    pub num_gpu: Option<u32>,
    #[arg(long = "num-thread", env = "NUM_THREAD")]
    pub num_thread: Option<u32>,
    #[arg(long = "repeat-penalty", env = "REPEAT_PENALTY")]
    pub repeat_penalty: Option<f32>,
    /// How long Ollama keeps the model loaded, e.g. `5m` or `-1`.
    #[arg(long = "keep-alive", env = "KEEP_ALIVE")]
    pub keep_alive: Option<String>,
    /// System prompt sent with every generation.
    #[arg(long, env = "SYSTEM")]
    pub system: Option<String>,
    /// Prompt template overriding the model's own.
    #[arg(long, env = "TEMPLATE")]
    pub template: Option<String>,
    /// Wall-clock limit for a single generation, in minutes.
    #[arg(
        long = "timeout-minutes",
        env = "MAX_PROMPT_GENERATION_TIMEOUT_IN_MIN",
        default_value_t = 20
    )]
    pub timeout_minutes: u64,
    /// Capacity of the per-request token channel.
    #[arg(long = "token-buffer", env = "TOKEN_BUFFER", default_value_t = 64)]
    pub token_buffer: usize,
    /// Also time out streams whose backend stops producing tokens.
    #[arg(long = "stall-watchdog", env = "STALL_WATCHDOG", default_value_t = false)]
    pub stall_watchdog: bool,
}

impl Args {
    /// Build the immutable configuration shared by the whole process.
    pub fn into_config(self) -> GatewayConfig {
        GatewayConfig {
            host: self.host,
            port: self.port,
            ollama: OllamaConfig {
                base_url: self.ollama_url,
                model: self.model,
                options: GenerationOptions {
                    temperature: Some(self.temperature),
                    top_p: self.top_p,
                    top_k: self.top_k,
                    num_ctx: self.num_ctx,
                    num_gpu: self.num_gpu,
                    num_thread: self.num_thread,
                    repeat_penalty: self.repeat_penalty,
                },
                system: Some(
                    self.system
                        .unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.trim().to_string()),
                ),
                template: self.template,
                keep_alive: self.keep_alive,
            },
            timeout: Duration::from_secs(self.timeout_minutes.saturating_mul(60)),
            token_buffer: self.token_buffer.max(1),
            stall_watchdog: self.stall_watchdog,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_override_defaults() {
        let args = Args::try_parse_from([
            "ollama-gateway",
            "--model",
            "qwen3:8b",
            "--top-k",
            "40",
            "--timeout-minutes",
            "2",
            "--system",
            "be brief",
        ])
        .unwrap();
        let cfg = args.into_config();
        assert_eq!(cfg.ollama.model, "qwen3:8b");
        assert_eq!(cfg.ollama.options.top_k, Some(40));
        assert_eq!(cfg.ollama.system.as_deref(), Some("be brief"));
        assert_eq!(cfg.timeout, Duration::from_secs(120));
    }

    #[test]
    fn missing_system_prompt_uses_builtin() {
        let mut args = Args::try_parse_from(["ollama-gateway"]).unwrap();
        args.system = None;
        let cfg = args.into_config();
        let system = cfg.ollama.system.unwrap();
        assert!(system.starts_with("You are a smart and helpful assistant."));
    }

    #[test]
    fn rejects_non_numeric_sampling_values() {
        let res = Args::try_parse_from(["ollama-gateway", "--top-k", "many"]);
        assert!(res.is_err());
    }
}
