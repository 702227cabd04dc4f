//! # fleet-api — Binary Entry Point
//!
//! Starts the Axum HTTP server for the fleet engine. Uses PostgreSQL when
//! `DATABASE_URL` is set and the in-memory store otherwise.

use std::sync::Arc;

use anyhow::Context;

use fleet_api::state::{AppConfig, AppState};
use fleet_engine::{Engine, EngineConfig, StaticDirectory};
use fleet_store::{FleetStore, MemoryStore, PgStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // RUST_LOG controls verbosity; FLEET_LOG_FORMAT=json switches to JSON lines.
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    if std::env::var("FLEET_LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json")) {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    let config = AppConfig::from_env().context("invalid server configuration")?;
    let engine_config = EngineConfig::from_env().context("invalid engine configuration")?;

    let store: Arc<dyn FleetStore> = match fleet_store::init_pool()
        .await
        .context("database initialization failed")?
    {
        Some(pool) => Arc::new(PgStore::new(pool)),
        None => Arc::new(MemoryStore::new()),
    };

    let engine = Engine::new(store, Arc::new(StaticDirectory::new()), engine_config);
    for tenant in &config.recompute_tenants {
        engine
            .schedule(tenant)
            .with_context(|| format!("cannot schedule recomputation for {tenant}"))?;
    }

    let port = config.port;
    let state = AppState::with_engine(config, engine.clone());
    let app = fleet_api::app(state);

    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("cannot bind {addr}"))?;
    tracing::info!(%addr, "fleet API listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
        .context("server error")?;

    engine.shutdown();
    Ok(())
}
