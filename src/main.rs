use std::{sync::Arc, time::Duration};

use tokio::net::TcpListener;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use model_gateway::{
    AppConfig, AppState, MemoryCache, MemoryLedger, ModelRouter, OllamaClient, build_router,
    model::{GenerationSettings, HubModelLoader},
};

const CACHE_PURGE_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let config = Arc::new(AppConfig::from_env()?);
    tracing::info!(?config.listen_addr, models_dir = %config.models_dir.display(), "starting model gateway");

    std::fs::create_dir_all(config.adapters_dir())?;
    let runtime = Arc::new(OllamaClient::new(
        config.ollama_url.clone(),
        config.runtime_timeout,
    )?);
    let loader = Arc::new(HubModelLoader::new(config.as_ref())?);
    let router = Arc::new(ModelRouter::new(
        runtime,
        loader,
        config.adapters_dir(),
        GenerationSettings {
            max_input_tokens: config.max_input_tokens,
            repetition_penalty: config.repetition_penalty,
        },
    ));

    match router.resolve(&config.default_model, false).await {
        Ok(handle) => tracing::info!(model = %config.default_model, kind = ?handle.kind(), "default model ready"),
        Err(err) => tracing::warn!(model = %config.default_model, error = %err, "failed to load default model"),
    }

    let cache = Arc::new(MemoryCache::new());
    spawn_cache_purge(cache.clone());

    let state = AppState::new(config.clone(), router, cache, Arc::new(MemoryLedger::new()));
    let app = build_router(state);

    let listener = TcpListener::bind(config.listen_addr).await?;
    let addr = listener.local_addr()?;
    tracing::info!(%addr, "REST server ready");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("shutting down model gateway");
    Ok(())
}

fn spawn_cache_purge(cache: Arc<MemoryCache>) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(CACHE_PURGE_INTERVAL);
        loop {
            ticker.tick().await;
            let live = cache.purge_expired();
            tracing::debug!(live, "purged expired cache entries");
        }
    });
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}

fn init_tracing() {
    if tracing::dispatcher::has_been_set() {
        return;
    }
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,hyper=warn,axum::rejection=trace".into());
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .compact();

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}
