use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use hf_hub::api::tokio::ApiBuilder;
use tokio::{self, net::TcpListener};
use tracing::info;
use tracing_subscriber::EnvFilter;
use zimage_core::{DeviceMap, EngineConfig, FluxLoader, Loader, ProcessLifecycle};

mod routes;

use routes::AppState;

// Every setting has a default so the platform can start the worker bare.
#[derive(Parser, Debug)]
#[command(author, version, about = "Text-to-image job worker")]
struct Args {
    /// Use CPU instead of GPU
    #[arg(long, env = "ZIMAGE_FORCE_CPU")]
    cpu: bool,

    /// GPU ordinal to place the model on
    #[arg(long, env = "ZIMAGE_DEVICE_ORDINAL", default_value_t = 0)]
    device_ordinal: usize,

    /// Model repository to load
    #[arg(long, env = "ZIMAGE_MODEL", default_value = "black-forest-labs/FLUX.1-schnell")]
    model: String,

    /// Host address to bind the worker to
    #[arg(long, env = "ZIMAGE_HOST", default_value = "0.0.0.0")]
    host: String,

    /// Port to bind the worker to
    #[arg(long, env = "PORT", default_value_t = 8000)]
    port: u16,

    /// Read token for the model repository
    #[arg(long, env = "HF_TOKEN", hide_env_values = true)]
    hf_token: Option<String>,
}

async fn shutdown_signal(lifecycle: Arc<ProcessLifecycle>) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!("Failed to listen for ctrl-c: {e}");
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
                tracing::warn!("Failed to listen for SIGTERM: {e}");
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
    info!("Shutdown requested");
    lifecycle.shutdown();
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let args = Args::parse();

    let mut api = ApiBuilder::new().with_progress(false);
    if let Some(token) = args.hf_token.clone() {
        api = api.with_token(Some(token));
    }
    let api = api.build().context("failed to create hf hub API")?;

    let config = EngineConfig {
        model: args.model.clone(),
        device_map: DeviceMap::from_settings(args.cpu, args.device_ordinal),
    };

    // A load failure ends the process; the platform brings up a fresh worker.
    let lifecycle = Arc::new(ProcessLifecycle::new());
    lifecycle.start(FluxLoader::load(api, config)).await?;

    let app = routes::router(AppState {
        lifecycle: lifecycle.clone(),
    });

    let bind_address = format!("{}:{}", args.host, args.port);
    let listener = TcpListener::bind(&bind_address)
        .await
        .with_context(|| format!("failed to bind {bind_address}"))?;
    info!("Started worker on {}", listener.local_addr()?);
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal(lifecycle.clone()))
        .await?;

    lifecycle.shutdown();
    Ok(())
}
