//! Thin process entrypoint: load configuration, wire up the process-wide
//! provider singletons, and run the gateway until ctrl-c or SIGTERM.

use std::sync::Arc;

use voicegate::config::GatewayConfig;
use voicegate::connection::SharedProviders;
use voicegate::llm::UpstreamLlmClient;
use voicegate::server::GatewayServer;
use voicegate::stt::HttpSttAdapter;
use voicegate::tts::{KokoroAdapter, OpenAiTtsAdapter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cfg = GatewayConfig::from_env();
    tracing::info!(port = cfg.port, "voicegate starting");

    let providers = Arc::new(SharedProviders {
        stt: Arc::new(HttpSttAdapter::new("parakeet", cfg.parakeet_url.clone())),
        kokoro: Arc::new(KokoroAdapter::new(cfg.kokoro_url.clone())),
        openai: Arc::new(OpenAiTtsAdapter::new(
            cfg.openai_base_url.clone(),
            cfg.openai_api_key.clone().unwrap_or_default(),
        )),
        llm: Arc::new(UpstreamLlmClient::new(
            cfg.llm_gateway_url.clone(),
            cfg.llm_gateway_api_key.clone(),
            cfg.llm_gateway_model.clone(),
        )),
        breaker_defaults: cfg.breaker(),
        rate_limits: cfg.rate_limits(),
        max_audio_bytes_per_turn: cfg.max_audio_bytes_per_turn,
    });

    let server = GatewayServer::start(cfg.port, providers).await?;
    tracing::info!(addr = %server.addr(), "voicegate ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown signal received");
    server.shutdown();

    Ok(())
}
