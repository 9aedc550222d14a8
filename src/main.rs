use anyhow::Context;
use clap::Parser;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use url::Url;

use ollama_gateway::{
    AppState, InferenceClient, OllamaBackend, args::Args, logger, server, shutdown,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logger::init();
    let config = Arc::new(Args::parse().into_config());
    Url::parse(&config.ollama.base_url)
        .with_context(|| format!("invalid Ollama base url {}", config.ollama.base_url))?;

    let backend = Arc::new(OllamaBackend::new(config.ollama.clone()));
    let client = InferenceClient::new(backend, &config);
    let cancel = CancellationToken::new();
    let state = AppState::new(client, config.clone(), cancel.clone());

    let addr = config.listen_addr();
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    server::serve(listener, state, shutdown::cancel_on_signal(cancel)).await?;
    tracing::info!("server stopped");
    Ok(())
}
