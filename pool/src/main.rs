// minepool: Stratum mining pool engine
//
// Startup order: config -> coin profile -> hasher -> daemon -> store ->
// first template -> updater loop -> stratum listener -> HTTP API.

use std::sync::Arc;

use anyhow::Context;
use axum::{extract::State, http::{header, StatusCode}, response::IntoResponse, routing::get, Json};
use serde_json::json;
use tracing_subscriber::EnvFilter;

use minepool::blockchain::{updater, HttpCoinDaemon};
use minepool::coin::CoinProfile;
use minepool::config::Config;
use minepool::metrics::prometheus as metrics;
use minepool::shares::HasherRegistry;
use minepool::state::Pool;
use minepool::store::{MemoryStore, PoolStore, RedisStore};
use minepool::stratum::StratumServer;

#[derive(Clone)]
struct ApiState {
    pool: Arc<Pool>,
}

async fn api_health() -> Json<serde_json::Value> {
    Json(json!({"status": "ok"}))
}

async fn api_metrics() -> impl IntoResponse {
    let body = metrics::render();
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
}

async fn api_stats(State(api): State<ApiState>) -> Json<serde_json::Value> {
    let state = api.pool.state.lock().await;
    Json(json!({
        "ok": true,
        "coin": api.pool.profile.name,
        "algorithm": api.pool.profile.algorithm,
        "blockchain": {
            "height": state.template.height,
            "difficulty": state.template.difficulty,
            "prev_hash": state.template.prev_hash,
        },
        "connections": state.jobs.connection_count(),
        "authorized_workers": state.authorized_count(),
        "cached_jobs": state.jobs.cached_jobs(),
        "pool": {
            "fee": api.pool.config.pool_fee_percent,
            "difficulty": api.pool.config.pool_difficulty,
            "pplns_length": api.pool.config.pplns_length,
        },
    }))
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = sigterm.recv() => tracing::info!("SIGTERM, shutting down"),
                    _ = tokio::signal::ctrl_c() => tracing::info!("SIGINT, shutting down"),
                }
            }
            Err(e) => {
                tracing::warn!("SIGTERM handler unavailable: {}", e);
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("Ctrl+C, shutting down");
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    let cfg = Config::load().context("configuration")?;
    let profile = Arc::new(CoinProfile::resolve(&cfg.coin).context("coin profile")?);
    let hasher = HasherRegistry::default()
        .resolve(&profile.algorithm)
        .context("proof-of-work algorithm")?;
    tracing::info!(
        "🚀 minepool {} for {} ({:?}, {})",
        env!("CARGO_PKG_VERSION"),
        profile.name,
        profile.family,
        profile.algorithm
    );

    let daemon = Arc::new(HttpCoinDaemon::new(&cfg.daemon).context("daemon client")?);
    let store: Arc<dyn PoolStore> = if cfg.redis_url.is_empty() {
        tracing::warn!("No redis url configured, using the in-memory store");
        Arc::new(MemoryStore::new())
    } else {
        Arc::new(RedisStore::new(&cfg.redis_url, &profile.name).context("redis store")?)
    };

    let cfg = Arc::new(cfg);
    let pool = Pool::new(cfg.clone(), profile, daemon, store.clone(), hasher);
    {
        let mut state = pool.state.lock().await;
        updater::init(&pool, &mut state).await.context("initial block template")?;
    }
    let updater_task = updater::spawn(pool.clone());

    let listener = StratumServer::bind(&cfg.listen)?;
    tracing::info!("✅ Stratum server listening on {} (SO_REUSEADDR)", cfg.listen);
    let server = Arc::new(StratumServer::new(pool.clone()));
    let stratum_task = tokio::spawn(async move {
        if let Err(e) = server.serve(listener).await {
            tracing::error!("Stratum server stopped: {}", e);
        }
    });

    let api = axum::Router::new()
        .route("/health", get(api_health))
        .route("/metrics", get(api_metrics))
        .route("/stats", get(api_stats))
        .with_state(ApiState { pool: pool.clone() });
    let api_listener = tokio::net::TcpListener::bind(&cfg.api_listen)
        .await
        .with_context(|| format!("bind API on {}", cfg.api_listen))?;
    tracing::info!("📡 API listening on {}", cfg.api_listen);

    axum::serve(api_listener, api)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    stratum_task.abort();
    updater_task.abort();
    if let Err(e) = store.disconnect_all_workers().await {
        tracing::error!("Failed to mark workers disconnected: {}", e);
    }
    tracing::info!("🏁 minepool shut down cleanly");
    Ok(())
}
