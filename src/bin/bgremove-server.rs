//! Background removal HTTP server
//!
//! Loads configuration from the environment (and an optional `.env` file),
//! applies command-line overrides, optionally preloads the default model and
//! serves the API until interrupted.

use anyhow::{Context, Result};
use clap::Parser;
use imgly_bgremove_server::{
    api, events, AppState, ServiceConfig, SharedState, TracingConfig, TracingFormat,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

/// Background removal HTTP server
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
#[command(name = "bgremove-server")]
struct Cli {
    /// Address to bind (overrides API_HOST)
    #[arg(long)]
    host: Option<String>,

    /// Port to listen on (overrides API_PORT)
    #[arg(short, long)]
    port: Option<u16>,

    /// Segmentation model to serve (overrides REMBG_MODEL)
    #[arg(short, long)]
    model: Option<String>,

    /// Enable verbose logging (-v: DEBUG, -vv: TRACE)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Log output format: console, compact or json (overrides LOG_FORMAT)
    #[arg(long, value_name = "FORMAT")]
    log_format: Option<String>,

    /// Environment file to load before reading configuration
    #[arg(long, value_name = "PATH")]
    env_file: Option<PathBuf>,

    /// Load the model on first request instead of at startup
    #[arg(long)]
    no_preload: bool,
}

impl Cli {
    fn apply(&self, config: &mut ServiceConfig) {
        if let Some(host) = &self.host {
            config.api_host.clone_from(host);
        }
        if let Some(port) = self.port {
            config.api_port = port;
        }
        if let Some(model) = &self.model {
            config.rembg_model.clone_from(model);
        }
        if let Some(format) = &self.log_format {
            config.log_format.clone_from(format);
        }
        if self.no_preload {
            config.preload_model = false;
        }
    }
}

fn load_env_file(path: Option<&PathBuf>) -> Result<()> {
    match path {
        Some(path) => {
            dotenvy::from_path(path)
                .with_context(|| format!("Failed to load env file '{}'", path.display()))?;
        },
        None => {
            // A missing default .env is fine
            dotenvy::dotenv().ok();
        },
    }
    Ok(())
}

fn init_tracing(cli: &Cli, config: &ServiceConfig) -> Result<()> {
    let format: TracingFormat = config
        .log_format
        .parse()
        .map_err(|e: String| anyhow::anyhow!(e))?;

    let mut tracing_config = TracingConfig::new()
        .with_verbosity(cli.verbose)
        .with_format(format)
        .with_instance_id(uuid::Uuid::new_v4().to_string());

    if let Ok(filter) = std::env::var("RUST_LOG") {
        tracing_config = tracing_config.with_env_filter(filter);
    } else if cli.verbose == 0 {
        tracing_config = tracing_config.with_env_filter(config.log_level.to_ascii_lowercase());
    }

    tracing_config.init()
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            },
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Shutting down background removal server, draining in-flight requests");
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    load_env_file(cli.env_file.as_ref())?;

    let mut config = ServiceConfig::from_env().context("Invalid configuration")?;
    cli.apply(&mut config);
    config.validate().context("Invalid configuration")?;

    init_tracing(&cli, &config)?;
    info!(
        model = %config.rembg_model,
        backend = %config.inference_backend,
        environment = %config.environment,
        max_concurrent_requests = config.max_concurrent_requests,
        auth = config.api_key.is_some(),
        "Starting background removal server"
    );

    let address = config.bind_address();
    let preload = config.preload_model;
    let state: SharedState = Arc::new(AppState::from_config(config)?);

    if preload {
        let preload_state = Arc::clone(&state);
        tokio::spawn(async move {
            if let Err(e) = preload_state.sessions.preload().await {
                events::warning_with_recommendation(
                    &format!("Model preload failed: {e}"),
                    "The server keeps running and retries on the next request; check /api/v1/health",
                );
            }
        });
    }

    let app = api::create_router(Arc::clone(&state));
    let listener = tokio::net::TcpListener::bind(&address)
        .await
        .with_context(|| format!("Failed to bind {address}"))?;
    info!("Server listening on {}", address);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Queued requests finished while axum drained; nothing is admitted after this
    state.gate().close();
    info!("Server stopped");
    Ok(())
}
