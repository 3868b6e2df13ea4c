use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use anyhow::Context;
use tokio::signal;
use tracing::{info, warn};

mod api;
mod catalog;
mod config;
mod dedup;
mod error;
mod gateway;
mod providers;
mod sanitize;
mod scorer;
mod selector;
mod session;
mod traffic;
mod usage;

pub use config::Config;
pub use traffic::TrafficLog;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // When invoked as a Docker HEALTHCHECK, hit /health and exit immediately.
    // This avoids needing any external tool (curl/wget) in the container image.
    if std::env::args().nth(1).as_deref() == Some("--healthcheck") {
        return healthcheck().await;
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "gateway=info,tower_http=warn".into()),
        )
        .init();

    let config_path = std::env::var("GATEWAY_CONFIG").map(PathBuf::from).ok();
    let config = match &config_path {
        Some(path) => Config::load(path).with_context(|| format!("loading config from {}", path.display()))?,
        None => {
            info!("GATEWAY_CONFIG unset — booting from built-in defaults (local Ollama, SIMPLE tier only)");
            Config::defaults()
        }
    };

    let catalog = catalog::Catalog::with_defaults();
    config.validate_against_catalog(&catalog).context("config does not match the model catalog")?;

    info!(port = config.proxy.port, providers = config.providers.len(), "gateway starting");

    let traffic_log = Arc::new(TrafficLog::new(4096));
    let config = Arc::new(config);

    let state = Arc::new(
        gateway::GatewayState::new(Arc::clone(&config), catalog, Arc::clone(&traffic_log))
            .context("failed to build gateway state from config")?,
    );

    if let Some(path) = config_path.clone() {
        tokio::spawn(config_watcher(Arc::clone(&state), path));
    }
    tokio::spawn(sweep_task(Arc::clone(&state)));

    let addr: SocketAddr = format!("0.0.0.0:{}", config.proxy.port).parse()?;
    info!(%addr, "listening");

    let app = gateway::router(Arc::clone(&state))
        .layer(axum::middleware::from_fn(api::request_id::request_id_middleware))
        .layer(
            tower_http::trace::TraceLayer::new_for_http()
                .make_span_with(tower_http::trace::DefaultMakeSpan::new().level(tracing::Level::INFO))
                .on_response(tower_http::trace::DefaultOnResponse::new().level(tracing::Level::INFO)),
        );

    let listener = tokio::net::TcpListener::bind(addr).await?;

    tokio::select! {
        result = axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>()) => {
            result.context("server error")?;
        }
        _ = shutdown_signal() => {
            info!("shutdown signal received");
        }
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

/// Lightweight healthcheck: GET /health and exit 0 on 200, 1 otherwise.
/// Invoked via `gateway --healthcheck` from a container HEALTHCHECK directive.
async fn healthcheck() -> anyhow::Result<()> {
    let port = std::env::var("GATEWAY_PORT").ok().and_then(|v| v.parse::<u16>().ok()).unwrap_or(8402);

    let url = format!("http://127.0.0.1:{port}/health");
    let resp = reqwest::get(&url).await?;

    if resp.status().is_success() {
        std::process::exit(0);
    } else {
        std::process::exit(1);
    }
}

/// Background task: reclaims expired session pins and dedup entries every 30
/// seconds. Neither store evicts inline on the request path, so without this
/// task both grow until process restart.
async fn sweep_task(state: Arc<gateway::GatewayState>) {
    let mut interval = tokio::time::interval(Duration::from_secs(30));
    loop {
        interval.tick().await;
        state.sweep_expired();
    }
}

/// Background task: polls the config file every 5 seconds and hot-reloads on change.
///
/// Uses filesystem `mtime` for change detection — no inotify/kqueue dependencies.
/// Parse failures are logged and ignored; the running config is unchanged.
async fn config_watcher(state: Arc<gateway::GatewayState>, path: PathBuf) {
    let mut last_mtime = std::fs::metadata(&path).and_then(|m| m.modified()).ok();

    // Initial tick fires immediately; skip it so we don't reload on startup.
    let mut interval = tokio::time::interval(Duration::from_secs(5));
    interval.tick().await;

    loop {
        interval.tick().await;

        let mtime = std::fs::metadata(&path).and_then(|m| m.modified()).ok();
        if mtime == last_mtime {
            continue;
        }

        match Config::load(&path) {
            Ok(new_cfg) => {
                let catalog = catalog::Catalog::with_defaults();
                if let Err(e) = new_cfg.validate_against_catalog(&catalog) {
                    warn!(path = %path.display(), error = %e, "config reload failed validation — keeping previous config");
                    continue;
                }
                state.replace_config(Arc::new(new_cfg));
                info!(path = %path.display(), "config hot-reloaded");
                last_mtime = mtime;
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "config reload failed — keeping previous config");
            }
        }
    }
}
