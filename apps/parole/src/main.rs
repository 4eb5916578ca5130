mod auth;
mod cli;
mod config;
mod protocol;
mod queue;
mod scheduler;
mod session;
mod storage;
mod websocket;

use clap::Parser;
use std::future::IntoFuture;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::{
    cli::{Cli, Commands},
    config::Config,
    storage::{RedisStore, TimeoutStore},
    websocket::{router, RelayState},
};

#[tokio::main]
async fn main() {
    // Default to INFO when RUST_LOG is not set.
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info");
    }
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    if let Some(Commands::Debug { url, auth, command }) = cli.command {
        if let Err(err) = cli::run_debug_client(url, auth, command).await {
            error!("debug client error: {err:#}");
            std::process::exit(1);
        }
        return;
    }

    let config = Config::from_env();
    let Some(auth_secret) = config.auth_secret.clone() else {
        error!("PAROLE_AUTH is not set; refusing to start without a controller secret");
        std::process::exit(1);
    };

    info!(
        version = env!("CARGO_PKG_VERSION"),
        "starting parole relay on port {}", config.port
    );
    info!("redis url: {}", config.redis_url);

    // An unreachable store at construction is the one store error that is
    // fatal; everything after this degrades instead.
    let store: Arc<dyn TimeoutStore> =
        match RedisStore::connect(&config.redis_url, &config.namespace).await {
            Ok(store) => Arc::new(store),
            Err(err) => {
                error!("failed to connect to redis: {err:#}");
                std::process::exit(1);
            }
        };

    let state = RelayState::new(store.clone(), auth_secret);

    // Whatever the previous run could not deliver replays once a controller
    // shows up.
    match store.take_snapshot().await {
        Ok(entries) if !entries.is_empty() => {
            info!(
                count = entries.len(),
                "recovered replay queue from previous shutdown"
            );
            state.queue.extend(entries).await;
        }
        Ok(_) => {}
        Err(err) => warn!("unable to recover the replay snapshot: {err:#}"),
    }

    let app = router(state.clone());
    let addr = format!("0.0.0.0:{}", config.port);
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err) => {
            error!("failed to bind {addr}: {err}");
            std::process::exit(1);
        }
    };
    info!("parole listening on {addr}");

    tokio::select! {
        served = axum::serve(listener, app).into_future() => {
            if let Err(err) = served {
                error!("server error: {err}");
                std::process::exit(1);
            }
        }
        _ = shutdown_signal() => {
            warn!("closing off the relay due to signal");
        }
    }

    // Everything after the signal must finish inside the grace window; a
    // hung store write must not keep the process alive forever.
    let grace = Duration::from_secs(config.shutdown_grace_seconds);
    let persist = async {
        let pending = state.queue.snapshot().await;
        info!(count = pending.len(), "saving replay queue");
        if let Err(err) = store.save_snapshot(&pending).await {
            error!("unable to save replay queue: {err:#}");
        }
    };

    match tokio::time::timeout(grace, persist).await {
        Ok(()) => {
            drop(store);
            info!("goodbye");
        }
        Err(_) => {
            error!("graceful shutdown timed out, forcing exit");
            std::process::exit(1);
        }
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                error!("unable to install the SIGTERM handler: {err}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("received ctrl-c"),
        _ = terminate => info!("received SIGTERM"),
    }
}
