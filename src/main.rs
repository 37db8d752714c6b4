mod assembler;
mod config;
mod delivery;
mod discord;
mod openrouter;
mod persona;
mod server;

use std::sync::Arc;

use tracing::info;
use tracing_subscriber::prelude::*;

use config::Config;
use delivery::{Engine, HostCaps, Strategy};
use discord::DiscordClient;
use persona::{BaseInstructions, PersonaResolver};
use server::{AppState, SignatureVerifier};

#[tokio::main]
async fn main() {
    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("configuration error: {e}");
            std::process::exit(1);
        }
    };

    // Setup logging
    std::fs::create_dir_all(&config.log_dir).ok();
    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(config.log_dir.join("summerbot.log"))
        .expect("Failed to open log file");
    let (non_blocking, _guard) = tracing_appender::non_blocking(log_file);

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stdout)
                .with_filter(
                    tracing_subscriber::EnvFilter::from_default_env()
                        .add_directive(tracing::Level::INFO.into()),
                ),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_filter(
                    tracing_subscriber::EnvFilter::from_default_env()
                        .add_directive(tracing::Level::INFO.into()),
                ),
        )
        .init();

    info!("🚀 Starting summerbot...");
    info!("Application ID: {}", config.application_id);
    info!("Default model: {}", config.default_model);

    let verifier = match SignatureVerifier::from_hex(&config.public_key) {
        Ok(verifier) => verifier,
        Err(e) => {
            eprintln!("configuration error: {e}");
            std::process::exit(1);
        }
    };

    let resolver = Arc::new(PersonaResolver::new(BaseInstructions::load(
        &config.system_prompt_path,
    )));
    let gateway = Arc::new(openrouter::Client::new(
        config.provider_base_url.clone(),
        &config.provider_api_key,
        config.provider_timeout,
    ));
    let writer = Arc::new(DiscordClient::new(&config.discord_token));
    let engine = Engine::new(gateway, writer, resolver, config.throttle);

    let caps = HostCaps {
        long_running: config.long_running,
        background_continuation: config.background_continuation,
    };
    info!("Delivery strategy: {:?}", Strategy::select(&caps));

    let state = Arc::new(AppState {
        engine,
        verifier,
        allowed_user_id: config.allowed_user_id.clone(),
        caps,
        default_model: config.default_model.clone(),
        max_tokens: config.max_tokens,
        temperature: config.temperature,
    });

    let listener = match tokio::net::TcpListener::bind(config.bind_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            eprintln!("failed to bind {}: {e}", config.bind_addr);
            std::process::exit(1);
        }
    };
    info!("Listening on {}", config.bind_addr);

    if let Err(e) = axum::serve(listener, server::router(state)).await {
        eprintln!("server error: {e}");
        std::process::exit(1);
    }
}
