//! Rotanet - Entry Point
//!
//! Enters a session from the environment, then rotates the proxy and the
//! anonymity identity on a fixed interval until Ctrl+C or SIGTERM.

use std::time::Duration;

use anyhow::Context;
use futures::FutureExt;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use rotanet::config::LogConfig;
use rotanet::{Config, ProxySource, RotanetError, SessionContext, UserAgentPool};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env().context("loading configuration")?;
    init_tracing(&config.log);

    info!("Starting rotanet");

    let proxy_source = config.proxy_source()?;
    let user_agents = config.user_agents().context("loading user agents")?;
    let interval = config.rotation.interval;

    let mut session = config.session_context();
    session
        .scoped(move |session| {
            async move { run_rotation(session, proxy_source, user_agents, interval).await }.boxed()
        })
        .await?;

    info!("Rotanet stopped");
    Ok(())
}

fn init_tracing(log: &LogConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("rotanet={}", log.level).into());
    let registry = tracing_subscriber::registry().with(filter);

    if log.format == "json" {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

async fn run_rotation(
    session: &SessionContext,
    mut proxy_source: Option<ProxySource>,
    user_agents: UserAgentPool,
    interval: Duration,
) -> rotanet::Result<()> {
    let connector = session.build_proxy_connector();
    match serde_json::to_string(&connector) {
        Ok(json) => info!(connector = %json, "Session ready"),
        Err(e) => warn!("Failed to serialize connector: {}", e),
    }

    let rotate_identity = session.anonymity().is_some_and(|config| config.enabled);
    if proxy_source.is_none() && !rotate_identity {
        info!("Nothing to rotate, waiting for shutdown");
    }

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    let mut ticker = tokio::time::interval(interval);
    // The first tick completes immediately
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            _ = ticker.tick() => {}
        }

        if let Some(source) = proxy_source.take() {
            proxy_source = rotate_from_source(session, source).await;
        }

        if rotate_identity {
            tokio::select! {
                _ = &mut shutdown => break,
                result = session.request_new_identity() => match result {
                    Ok(waited) => info!("New identity ready after {:?}", waited),
                    Err(e) => warn!("New identity request failed: {}", e),
                },
            }
        }

        info!(
            proxy = %session.build_proxy_connector(),
            user_agent = user_agents.pick(),
            "Rotated"
        );
    }

    info!("Shutdown signal received");
    Ok(())
}

/// Pull the next proxy off the runtime threads, since the source reads its
/// file with blocking I/O. The source is handed back while it can still
/// produce.
async fn rotate_from_source(
    session: &SessionContext,
    mut source: ProxySource,
) -> Option<ProxySource> {
    let pulled = tokio::task::spawn_blocking(move || {
        let next = source.next_proxy();
        (source, next)
    })
    .await;

    match pulled {
        Ok((source, Ok(proxy))) => {
            session.rotate_proxy(proxy);
            Some(source)
        }
        Ok((_, Err(RotanetError::ExhaustedSource))) => {
            info!("Proxy source exhausted, keeping current proxy");
            None
        }
        Ok((_, Err(e))) => {
            error!("Proxy source failed, no longer rotating proxies: {}", e);
            None
        }
        Err(e) => {
            error!("Proxy source task failed: {}", e);
            None
        }
    }
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
