//! Wiring & DI. Entry point: load config, bootstrap adapters, run the engine until a shutdown signal.
//! No business logic here; exit code reflects how the engine ended (0 stopped, 1 failed).

use std::process::ExitCode;
use std::sync::Arc;
use tg_lanes::adapters::assistant::EchoAssistant;
use tg_lanes::adapters::persistence::{
    InMemorySessionStore, JsonWatermarkStore, SqliteCredentialStore,
};
use tg_lanes::adapters::telegram::TelegramBotApi;
use tg_lanes::ports::{Assistant, CredentialStore, WatermarkStore};
use tg_lanes::shared::{AppConfig, logging};
use tg_lanes::usecases::{Engine, EngineState, conversation};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> ExitCode {
    let cfg = match AppConfig::load() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("configuration error: {}", e);
            return ExitCode::from(1);
        }
    };
    if let Err(e) = logging::init(cfg.log_file().as_deref()) {
        eprintln!("{}", e);
        return ExitCode::from(1);
    }

    match run(cfg).await {
        Ok(state) => ExitCode::from(state.exit_code()),
        Err(e) => {
            error!(error = %e, "startup failed");
            ExitCode::from(1)
        }
    }
}

async fn run(cfg: AppConfig) -> anyhow::Result<EngineState> {
    let engine_cfg = cfg.engine_config()?;
    let token = cfg
        .bot_token
        .clone()
        .ok_or_else(|| anyhow::anyhow!("Set TELEGRAM_BOT_TOKEN (env or .env)"))?;

    let data_dir = cfg.data_dir_or_default();
    info!(path = %data_dir.display(), "data directory");

    let credentials: Arc<dyn CredentialStore> = Arc::new(
        SqliteCredentialStore::connect(&data_dir)
            .await
            .map_err(|e| anyhow::anyhow!("SQLite connect failed: {}", e))?,
    );
    let assistant: Arc<dyn Assistant> = Arc::new(EchoAssistant::new());
    let watermarks: Arc<dyn WatermarkStore> =
        Arc::new(JsonWatermarkStore::new(data_dir.join("watermark.json")));
    let api = Arc::new(
        TelegramBotApi::new(cfg.api_base_url_or_default(), token)
            .with_request_timeout(engine_cfg.outbound.attempt_timeout),
    );

    let engine = Engine::new(
        engine_cfg,
        api.clone(),
        Some(watermarks),
        Arc::new(InMemorySessionStore::new()),
        conversation::router(credentials, Arc::clone(&assistant)),
        api,
    );

    let shutdown = CancellationToken::new();
    tokio::spawn(wait_for_signal(shutdown.clone()));
    let state = engine.run(shutdown).await;

    if let Err(e) = assistant.shutdown().await {
        warn!(error = %e, "assistant shutdown failed");
    }
    info!(state = %state, "exiting");
    Ok(state)
}

/// Cancel `shutdown` on Ctrl-C or SIGTERM.
async fn wait_for_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "cannot listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("shutdown signal received; draining");
    shutdown.cancel();
}
