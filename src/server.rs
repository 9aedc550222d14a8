use axum::{
    Json, Router,
    body::Body,
    extract::State,
    http::header,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use bytes::Bytes;
use std::convert::Infallible;
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::GatewayConfig;
use crate::error::{GatewayError, InferenceError};
use crate::llm::InferenceClient;
use crate::openai::{self, ChatCompletion, ChatRequest, ModelList};
use crate::pump::{ChannelSink, TokenPump};

/// Shared state handed to every request.
#[derive(Clone)]
pub struct AppState {
    client: InferenceClient,
    config: Arc<GatewayConfig>,
    shutdown: CancellationToken,
}

impl AppState {
    pub fn new(
        client: InferenceClient,
        config: Arc<GatewayConfig>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            client,
            config,
            shutdown,
        }
    }
}

/// Build the router exposing the OpenAI-compatible routes.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/chat/completions", post(chat_completions))
        .route("/models", get(list_models))
        .with_state(state)
}

/// Serve `state` on `listener` until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, state: AppState, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, model = %state.config.ollama.model, "serving chat completions");
    }
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
}

async fn chat_completions(
    State(state): State<AppState>,
    Json(request): Json<ChatRequest>,
) -> Result<Response, GatewayError> {
    let prompt = request
        .prompt()
        .ok_or_else(|| GatewayError::BadRequest("messages must not be empty".into()))?
        .to_string();

    if openai::is_task_prompt(&prompt) {
        debug!(model = %request.model, "task prompt, replying with extracted title");
        let raw = complete(&state, prompt).await?;
        return Ok(Json(openai::title_completion(&raw, &request.model)).into_response());
    }

    if request.is_streaming() {
        return Ok(stream_completion(&state, prompt));
    }

    let content = complete(&state, prompt).await?;
    Ok(Json(ChatCompletion::new(request.model, content)).into_response())
}

/// Runs a generation to completion, bounded by the configured timeout.
///
/// A timeout yields [`openai::TIMEOUT_MESSAGE`] instead of an error.
async fn complete(state: &AppState, prompt: String) -> Result<String, InferenceError> {
    let (task, tokens) = state.client.generate(prompt);
    // Nobody reads the fragments here; a full channel would stall the task.
    drop(tokens);
    match task.await_with_timeout(state.config.timeout).await {
        Ok(text) => Ok(text),
        Err(InferenceError::Timeout(limit)) => {
            warn!(?limit, "non-streaming generation timed out");
            Ok(openai::TIMEOUT_MESSAGE.to_string())
        }
        Err(e) => Err(e),
    }
}

fn stream_completion(state: &AppState, prompt: String) -> Response {
    let (tx, rx) = mpsc::channel::<Result<Bytes, Infallible>>(state.config.token_buffer);
    let pump = TokenPump::new(state.client.clone(), &state.config, state.shutdown.clone());
    tokio::spawn(async move {
        let mut sink = ChannelSink::new(tx);
        pump.stream(prompt, &mut sink).await;
    });
    (
        [
            (header::CONTENT_TYPE, "text/event-stream"),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        Body::from_stream(ReceiverStream::new(rx)),
    )
        .into_response()
}

async fn list_models(State(state): State<AppState>) -> Response {
    match state.client.list_models().await {
        Ok(models) => Json(ModelList::from(models)).into_response(),
        Err(e) => {
            warn!(error = %e, "model listing failed");
            let body = serde_json::json!({ "error": format!("Failed to fetch models: {e}") });
            Json(body).into_response()
        }
    }
}
