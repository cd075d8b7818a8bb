use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;

mod api;
mod config;
mod templates;

use config::{AppState, ServerConfig};

#[derive(Parser, Debug)]
#[command(name = "ruleflow")]
#[command(about = "Rule-driven workflow engine", long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "ruleflow.toml")]
    config: PathBuf,

    /// Data directory for storage
    #[arg(short, long, default_value = "./data")]
    data_dir: PathBuf,

    /// Port to listen on
    #[arg(short, long, default_value = "8080")]
    port: u16,

    /// Host to bind to
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Externally visible base URL used in links, defaults to http://<host>:<port>
    #[arg(long, env = "RULEFLOW_BASE_URL")]
    base_url: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ruleflow_core=info,ruleflow_server=info,tower_http=debug".into()),
        )
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .init();

    let args = Args::parse();

    tracing::info!("Starting ruleflow");
    tracing::info!("Data directory: {}", args.data_dir.display());

    let config = ServerConfig::load(&args.config, args.data_dir)?;

    let addr = format!("{}:{}", args.host, args.port);
    let base_url = args
        .base_url
        .unwrap_or_else(|| format!("http://{}", addr));
    tracing::info!(backend = ?config.engine.backend, base_url = %base_url, "Engine configured");

    let state = AppState::new(&config, &base_url)?;

    tracing::info!("Starting API server on {}", addr);
    api::serve(&addr, state, &config.api.path_prefix).await?;

    Ok(())
}
