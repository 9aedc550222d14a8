use async_stream::stream;
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use super::{InferenceBackend, LocalModel, Token, TokenStream};
use crate::config::{GenerationOptions, OllamaConfig};
use crate::error::InferenceError;

#[derive(Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    template: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    keep_alive: Option<&'a str>,
    options: &'a GenerationOptions,
}

#[derive(Deserialize)]
struct GenerateChunk {
    #[serde(default)]
    response: String,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Deserialize)]
struct ErrorBody {
    error: String,
}

#[derive(Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<LocalModel>,
}

/// [`InferenceBackend`] talking to an Ollama server over HTTP.
#[derive(Clone, Debug)]
pub struct OllamaBackend {
    http: Client,
    config: OllamaConfig,
}

impl OllamaBackend {
    /// Creates a backend with its own HTTP client.
    pub fn new(config: OllamaConfig) -> Self {
        let http = Client::builder()
            .pool_max_idle_per_host(10)
            .build()
            .unwrap_or_default();
        Self::with_client(http, config)
    }

    /// Creates a backend sharing an existing HTTP client.
    pub fn with_client(http: Client, config: OllamaConfig) -> Self {
        Self { http, config }
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/api/{}", self.config.base_url.trim_end_matches('/'), path)
    }

    async fn check(resp: reqwest::Response) -> Result<reqwest::Response, InferenceError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        match serde_json::from_str::<ErrorBody>(&body) {
            Ok(err) => Err(InferenceError::Backend(err.error)),
            Err(_) => Err(InferenceError::Status {
                status: status.as_u16(),
                body,
            }),
        }
    }
}

/// Decodes one NDJSON line. Blank lines yield `None`.
fn decode_line(line: &[u8]) -> Result<Option<GenerateChunk>, InferenceError> {
    let text = String::from_utf8_lossy(line);
    let text = text.trim();
    if text.is_empty() {
        return Ok(None);
    }
    let chunk: GenerateChunk = serde_json::from_str(text)
        .map_err(|e| InferenceError::Malformed(format!("{e}: {text}")))?;
    match chunk.error {
        Some(err) => Err(InferenceError::Backend(err)),
        None => Ok(Some(chunk)),
    }
}

/// Removes every complete line from `pending`, leaving a partial tail.
fn split_lines(pending: &mut Vec<u8>) -> Vec<Vec<u8>> {
    let mut lines = Vec::new();
    while let Some(pos) = pending.iter().position(|b| *b == b'\n') {
        lines.push(pending.drain(..=pos).collect());
    }
    lines
}

/// Map Ollama's newline-delimited JSON body into a [`TokenStream`].
fn token_stream(resp: reqwest::Response) -> TokenStream {
    let mut body = resp.bytes_stream();
    let out = stream! {
        let mut pending: Vec<u8> = Vec::new();
        'read: loop {
            let (lines, eof) = match body.next().await {
                Some(Ok(bytes)) => {
                    pending.extend_from_slice(&bytes);
                    (split_lines(&mut pending), false)
                }
                Some(Err(e)) => {
                    debug!(target: "llm", error = %e, "ollama stream error");
                    yield Err(InferenceError::Transport(e));
                    break 'read;
                }
                None => (vec![std::mem::take(&mut pending)], true),
            };
            for line in lines {
                match decode_line(&line) {
                    Ok(Some(chunk)) => {
                        if !chunk.response.is_empty() {
                            trace!(target: "llm", token = %chunk.response, "llm token");
                            yield Ok(Token { text: chunk.response });
                        }
                        if chunk.done {
                            break 'read;
                        }
                    }
                    Ok(None) => {}
                    Err(e) => {
                        yield Err(e);
                        break 'read;
                    }
                }
            }
            if eof {
                break;
            }
        }
    };
    Box::pin(out)
}

#[async_trait]
impl InferenceBackend for OllamaBackend {
    fn model(&self) -> &str {
        &self.config.model
    }

    async fn generate_stream(&self, prompt: &str) -> Result<TokenStream, InferenceError> {
        let body = GenerateRequest {
            model: &self.config.model,
            prompt,
            stream: true,
            system: self.config.system.as_deref(),
            template: self.config.template.as_deref(),
            keep_alive: self.config.keep_alive.as_deref(),
            options: &self.config.options,
        };
        trace!(target: "llm", model = %self.config.model, %prompt, "ollama prompt");
        let resp = self
            .http
            .post(self.endpoint("generate"))
            .json(&body)
            .send()
            .await?;
        let resp = Self::check(resp).await?;
        Ok(token_stream(resp))
    }

    async fn stop(&self, model: &str) -> Result<(), InferenceError> {
        let body = serde_json::json!({ "model": model, "keep_alive": 0 });
        let resp = self
            .http
            .post(self.endpoint("generate"))
            .json(&body)
            .send()
            .await?;
        Self::check(resp).await?;
        debug!(target: "llm", %model, "ollama model unloaded");
        Ok(())
    }

    async fn list_models(&self) -> Result<Vec<LocalModel>, InferenceError> {
        let resp = self.http.get(self.endpoint("tags")).send().await?;
        let tags: TagsResponse = Self::check(resp).await?.json().await?;
        Ok(tags.models)
    }
}
