//! Dropgate server entry point.
//!
//! One process serves the REST API, the SSE event streams, and every
//! drop's lifecycle timers. State lives in the local store; restart
//! re-arms timers for all non-completed drops.

use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

use dropgate::config::Config;
use dropgate::http::build_app;
use dropgate::store::Store;
use dropgate::types::{KV_SWEEP_INTERVAL_SECS, now_ms};

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("dropgate=info".parse().unwrap()),
        )
        .init();

    let config = Config::parse();

    info!("════════════════════════════════════════════════════════════");
    info!("  Dropgate v{VERSION}");
    info!("════════════════════════════════════════════════════════════");
    info!(
        "API port: {} | PoW difficulty: {} | min trust: {}",
        config.api_port, config.pow_difficulty, config.min_trust_score
    );
    if config.queue_disabled {
        info!("Waiting queue: DISABLED for all drops");
    }

    if let Err(e) = std::fs::create_dir_all(&config.data_dir) {
        error!("Failed to create data dir {:?}: {e}", config.data_dir);
        return;
    }
    let store = match Store::open(&config.data_dir) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            error!("Failed to open store: {e}");
            return;
        }
    };

    let app = match build_app(&config, store.clone()) {
        Ok(app) => app,
        Err(e) => {
            error!("Failed to build application: {e}");
            return;
        }
    };

    // timers for drops that were live at last shutdown
    match app.drops.clone().rearm_active() {
        Ok(n) if n > 0 => info!("Resumed {n} active drops"),
        Ok(_) => {}
        Err(e) => error!("Failed to re-arm drop timers: {e}"),
    }
    match store.list_drops() {
        Ok(drop_ids) => match app.queue.clone().rearm_loops(&drop_ids).await {
            Ok(n) if n > 0 => info!("Resumed {n} admission loops"),
            Ok(_) => {}
            Err(e) => error!("Failed to re-arm admission loops: {e}"),
        },
        Err(e) => error!("Failed to list drops: {e}"),
    }

    // periodic TTL sweep over challenges, queue tokens, and counters
    let sweep_store = store.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(KV_SWEEP_INTERVAL_SECS));
        loop {
            interval.tick().await;
            if let Err(e) = sweep_store.sweep_expired(now_ms()) {
                error!("kv sweep failed: {e}");
            }
        }
    });

    let router = app.clone().router();

    // optional second listener so event streams can be fronted apart
    // from the API; both serve the same routes
    if let Some(sse_port) = config.sse_port {
        let sse_router = router.clone();
        tokio::spawn(async move {
            let addr = SocketAddr::from(([0, 0, 0, 0], sse_port));
            match tokio::net::TcpListener::bind(addr).await {
                Ok(listener) => {
                    info!("SSE listener on {addr}");
                    if let Err(e) = axum::serve(
                        listener,
                        sse_router.into_make_service_with_connect_info::<SocketAddr>(),
                    )
                    .await
                    {
                        error!("SSE listener failed: {e}");
                    }
                }
                Err(e) => error!("Failed to bind SSE port {sse_port}: {e}"),
            }
        });
    }

    let addr = SocketAddr::from(([0, 0, 0, 0], config.api_port));
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to bind API port {}: {e}", config.api_port);
            return;
        }
    };
    info!("Dropgate listening on {addr}");

    let serve = axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async {
        tokio::signal::ctrl_c().await.ok();
        info!("Shutting down...");
    });

    if let Err(e) = serve.await {
        error!("Server error: {e}");
    }

    if let Err(e) = store.flush() {
        error!("Final store flush failed: {e}");
    }
}
