pub mod constants;
pub mod error;
pub mod models;
pub mod modules;
pub mod proxy;
pub mod utils;

use tracing::{error, info};

/// Boot sequence: logger, config (hard exit on failure), server.
pub async fn run() -> std::process::ExitCode {
    modules::system::logger::init_logger();

    let config_path = modules::system::config::config_path();
    let config = match modules::system::config::load_or_init(&config_path) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            return std::process::ExitCode::FAILURE;
        }
    };
    info!(
        "Configuration loaded: {} caller key(s), projects: {:?}",
        config.keys.len(),
        config.enabled_projects()
    );

    let server = match proxy::AxumServer::build(config).await {
        Ok(server) => server,
        Err(e) => {
            error!("Failed to start server: {}", e);
            return std::process::ExitCode::FAILURE;
        }
    };

    let shutdown = server.shutdown_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown signal received");
            shutdown.cancel();
        }
    });

    match server.run().await {
        Ok(()) => std::process::ExitCode::SUCCESS,
        Err(e) => {
            error!("Server exited with error: {}", e);
            std::process::ExitCode::FAILURE
        }
    }
}
