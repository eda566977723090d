use std::sync::Arc;

use anyhow::Result;
use tracing::info;
use tracing_subscriber::EnvFilter;

use transporter::config::Config;
use transporter::engine::{Assembler, DockerEngine};
use transporter::server::DownloadServer;
use transporter::store::JsonRegistry;

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();

    let config = Arc::new(Config::from_env());
    info!(
        "starting {} v{} (compendia at {}, engine at {})",
        config.service_name,
        env!("CARGO_PKG_VERSION"),
        config.compendium_path.display(),
        config.docker_host
    );
    tokio::fs::create_dir_all(&config.compendium_path).await?;

    let registry = Arc::new(JsonRegistry::new(config.registry_file.clone()));
    let engine = Arc::new(DockerEngine::new(&config.docker_host));
    let assembler = Arc::new(Assembler::new(
        Arc::clone(&config),
        registry.clone(),
        registry,
        engine,
    ));

    let server = DownloadServer::start(assembler).await?;

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    server.shutdown();
    Ok(())
}
