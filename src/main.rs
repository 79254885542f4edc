use std::env;
use std::path::PathBuf;

use anyhow::anyhow;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

use callwright::core::graph::read_graph_dir;
use callwright::{ServerConfig, routes, state::AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let mut args = env::args();
    let _ = args.next();
    let mut config_path: Option<PathBuf> = None;
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "validate-graphs" => {
                let dir = args
                    .next()
                    .ok_or_else(|| anyhow!("validate-graphs requires a directory"))?;
                if let Some(extra) = args.next() {
                    anyhow::bail!("Unexpected argument '{extra}' after the graph directory");
                }
                return validate_graphs(PathBuf::from(dir));
            }
            "-c" | "--config" => {
                let path = args
                    .next()
                    .ok_or_else(|| anyhow!("--config requires a file path"))?;
                config_path = Some(PathBuf::from(path));
            }
            other => {
                anyhow::bail!(
                    "Unknown argument '{other}'. Usage: callwright [--config <file>] | validate-graphs <dir>"
                );
            }
        }
    }

    let config = match &config_path {
        Some(path) => ServerConfig::from_file(path),
        None => ServerConfig::from_env(),
    }
    .map_err(|e| anyhow!(e.to_string()))?;
    let address = config.address();

    let app_state = AppState::new(config).await?;
    let registry = app_state.core_state.registry.clone();
    let app = routes::create_app(app_state);

    let listener = TcpListener::bind(&address).await?;
    tracing::info!(address = %address, "Server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for shutdown signal");
                return;
            }
            tracing::info!("Shutdown requested");
            registry.shutdown_all().await;
        })
        .await?;

    Ok(())
}

fn validate_graphs(dir: PathBuf) -> anyhow::Result<()> {
    let graphs = read_graph_dir(&dir).map_err(|e| anyhow!("{}: {e}", dir.display()))?;
    for graph in &graphs {
        println!("ok  {} ({} nodes)", graph.id(), graph.len());
    }
    println!("{} graph(s) valid", graphs.len());
    Ok(())
}
