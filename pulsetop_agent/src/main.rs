//! pulsetop_agent entry point: parse args, prime the cache, start the
//! samplers, and serve viewers over ws:// or wss://.

use std::time::Duration;

use anyhow::Context;
use pulsetop_agent::config::AgentConfig;
use pulsetop_agent::sampler::{spawn_process_sampler, spawn_sampler};
use pulsetop_agent::server::{router, serve};
use pulsetop_agent::state::AppState;
use pulsetop_agent::tls::ensure_self_signed_cert;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = match AgentConfig::from_env(std::env::args()) {
        Ok(c) => c,
        Err(msg) => {
            eprintln!("{msg}");
            return Ok(());
        }
    };

    // Generate TLS material before anything slow, so a bad config dir fails fast.
    let tls = if config.enable_tls {
        Some(ensure_self_signed_cert()?)
    } else {
        None
    };

    let addr = config.addr();
    let system_every = config.system_interval;
    let processes_every = config.process_interval;
    let state = AppState::new(config);

    state.cache.prime().await;
    info!(ready = state.cache.is_ready(), "initial snapshots collected");

    let _system = spawn_sampler(state.hub.clone(), system_every);
    let _processes = spawn_process_sampler(state.hub.clone(), processes_every);

    match tls {
        Some((cert, key)) => {
            let rustls = axum_server::tls_rustls::RustlsConfig::from_pem_file(&cert, &key)
                .await
                .with_context(|| format!("loading TLS material from {}", cert.display()))?;
            let handle = axum_server::Handle::new();
            let shutdown = handle.clone();
            tokio::spawn(async move {
                shutdown_signal().await;
                shutdown.graceful_shutdown(Some(Duration::from_secs(2)));
            });
            info!("pulsetop_agent: listening at wss://{addr}/ws");
            axum_server::bind_rustls(addr, rustls)
                .handle(handle)
                .serve(router(state).into_make_service())
                .await?;
        }
        None => {
            let listener = tokio::net::TcpListener::bind(addr)
                .await
                .with_context(|| format!("binding {addr}"))?;
            serve(listener, state, shutdown_signal()).await?;
        }
    }
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("failed to listen for ctrl-c: {e}");
        std::future::pending::<()>().await;
    }
    info!("shutting down");
}
