//! Delegated-access relay API.
//!
//! Accepts the SPA's bearer token and, per route, calls Graph and the search
//! service on the user's behalf (or with the shared search key), returning
//! one normalized response. On each request it:
//!
//! 1. Validates the token against the identity provider's signing keys.
//! 2. Resolves a credential per downstream target (On-Behalf-Of or key).
//! 3. Calls every target concurrently and reports each outcome.

mod config;
mod error;
mod routes;

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use obo_relay::{OidcIdentityProvider, Relay};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::AppConfig;

/// Delegated-access relay API.
#[derive(Parser, Debug)]
#[command(name = "obo-api", about = "Delegated-access relay API")]
struct Args {
    /// Listen address; overrides `API_HOST`.
    #[arg(long)]
    host: Option<String>,
    /// Listen port; overrides `API_PORT`.
    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = AppConfig::from_env()?;

    let http = reqwest::Client::new();
    let provider = OidcIdentityProvider::discover(http.clone(), config.oidc.clone())
        .await
        .context("identity provider discovery failed")?;

    let shutdown = CancellationToken::new();
    let relay = Relay::new(
        Arc::new(provider),
        config.secrets(),
        http,
        config.targets(),
        AppConfig::operations(),
    )?
    .with_retry_backoff(config.retry_backoff)
    .with_shutdown(shutdown.clone());

    for target in config.targets() {
        info!(
            target = %target.name,
            url = %target.endpoint(),
            strategy = %target.auth_strategy,
            "downstream target registered"
        );
    }
    if config.search.api_key.is_none() {
        info!("SEARCH_API_KEY not set; shared-key search targets will report a misconfigured credential");
    }

    let app = routes::router(relay, &config.cors_origins);

    let host = args.host.unwrap_or(config.host);
    let port = args.port.unwrap_or(config.port);
    let addr = format!("{host}:{port}");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    info!(address = %addr, "relay API listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            exit_signal().await;
            shutdown.cancel();
        })
        .await
        .context("server error")?;

    info!("relay API stopped");
    Ok(())
}

/// Resolve on Ctrl-C or SIGTERM.
async fn exit_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
    info!("shutdown signal received, cancelling in-flight requests");
}
