mod config;

use config::Config;
use easel_sync::SyncServer;
use log::{error, info, warn};

#[tokio::main]
async fn main() {
    let config = Config::load();

    let log_level = config
        .as_ref()
        .map(|c| c.log_level.clone())
        .unwrap_or_else(|_| "info".to_string());
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level)).init();

    let config = config.unwrap_or_else(|e| {
        error!("Failed to load configuration: {e}");
        warn!("Using default configuration");
        Config::default()
    });

    info!("Starting easel sync server...");

    let server = match SyncServer::new(config.server_config()) {
        Ok(server) => server,
        Err(e) => {
            error!("Failed to open storage: {e}");
            std::process::exit(1);
        }
    };

    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                error!("Server error: {e}");
                std::process::exit(1);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down");
        }
    }
}
