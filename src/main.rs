use anyhow::{Context, Result};
use env_logger::Env;
use log::info;

use mbserver::cli::{build_cli, handle_subcommands};
use mbserver::{Config, Server};

#[tokio::main]
async fn main() -> Result<()> {
    let matches = build_cli().get_matches();

    let mut config = match matches.get_one::<String>("config") {
        Some(path) => Config::from_file(path).with_context(|| format!("Failed to load {}", path))?,
        None => Config::default(),
    };
    config.apply_matches(&matches)?;

    env_logger::Builder::from_env(Env::default().default_filter_or(config.log_level.as_str()))
        .init();

    if handle_subcommands(&matches, &config)? {
        return Ok(());
    }

    info!("🚀 Starting {} v{}", config.server_name, mbserver::VERSION);

    let server = Server::with_config(&config);
    config.apply_presets(server.store())?;
    info!("📋 Loaded {} register preset(s)", config.presets.len());

    server
        .listen_tcp(&config.listen_address)
        .await
        .context("Failed to start Modbus TCP listener")?;

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    info!("Ctrl-C received, shutting down");

    server.close().await;
    Ok(())
}
