use std::{net::SocketAddr, path::PathBuf, sync::Arc};

use anyhow::Context;
use tokio::signal;
use tracing::{info, warn};

use keymux::{aimd::AdaptiveController, api, proxy::ProxyState, Config};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // When invoked as a Docker HEALTHCHECK, hit /healthz and exit immediately.
    // This avoids needing any external tool (curl/wget) in the container image.
    if std::env::args().nth(1).as_deref() == Some("--healthcheck") {
        return healthcheck().await;
    }

    // Initialise tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "keymux=info,tower_http=warn".into()),
        )
        .init();

    // Load config
    let config_path = std::env::var("KEYMUX_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/etc/keymux/config.json"));

    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;

    if config.api_keys.is_empty() {
        warn!("no apiKeys configured — every request will fail with provider_no_keys_configured");
    }

    info!(
        port = config.port,
        keys = config.api_keys.len(),
        target = %config.target_host,
        routing = config.model_routing.enabled,
        "keymux starting"
    );

    let config = Arc::new(config);
    let state = ProxyState::new(Arc::clone(&config));

    // Spawn the AIMD tick when adaptive concurrency is on.
    let adaptive_task = config.adaptive_concurrency.enabled.then(|| {
        AdaptiveController::new(
            Arc::clone(&state.router),
            config.adaptive_concurrency.clone(),
        )
        .spawn()
    });

    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "listening");

    let trace_layer = tower_http::trace::TraceLayer::new_for_http()
        .make_span_with(tower_http::trace::DefaultMakeSpan::new().level(tracing::Level::INFO))
        .on_response(tower_http::trace::DefaultOnResponse::new().level(tracing::Level::INFO));

    let app = api::routes::router(Arc::clone(&state))
        .layer(axum::middleware::from_fn(api::request_id::request_id_middleware))
        .layer(trace_layer);

    // Graceful shutdown: the signal closes admission and clears the queue,
    // then connections drain; the watchdog bounds the drain.
    let signal_state = Arc::clone(&state);
    let server = axum::serve(listener, app).with_graceful_shutdown(async move {
        shutdown_signal().await;
        info!("shutdown signal received");
        signal_state.begin_shutdown();
    });

    tokio::select! {
        result = server => {
            result.context("server error")?;
            info!("all connections drained");
        }
        _ = drain_watchdog(Arc::clone(&state)) => {
            warn!(
                in_flight = state.requests_in_flight(),
                "drain budget exceeded, forcing close"
            );
        }
    }

    if let Some(task) = adaptive_task {
        task.abort();
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

/// Resolves `shutdown_timeout` after shutdown begins — the force-close arm
/// of the select in `main`.
async fn drain_watchdog(state: Arc<ProxyState>) {
    state.shutdown_begun().await;
    tokio::time::sleep(state.config.shutdown_timeout()).await;
}

/// Lightweight healthcheck: GET /healthz and exit 0 on 200, 1 otherwise.
/// Invoked via `keymux --healthcheck` from Docker HEALTHCHECK.
async fn healthcheck() -> anyhow::Result<()> {
    let port = std::env::var("KEYMUX_PORT")
        .ok()
        .and_then(|v| v.parse::<u16>().ok())
        .unwrap_or(8080);

    let url = format!("http://127.0.0.1:{port}/healthz");
    let resp = reqwest::get(&url).await?;

    if resp.status().is_success() {
        std::process::exit(0);
    } else {
        std::process::exit(1);
    }
}
