//! Main application entry point for the gate server.
//!
//! Loads configuration, applies CLI overrides, starts the TCP network core
//! with the built-in routes and runs until a termination signal arrives.

mod cli;
mod config;
mod logging;
mod routes;
mod signals;

use anyhow::Context;
use cli::CliArgs;
use config::AppConfig;
use game_net::Server;
use tracing::{error, info};

/// The gate application: configuration plus the server it drives.
pub struct Application {
    config: AppConfig,
    server: Server,
}

impl Application {
    pub async fn new(args: CliArgs) -> anyhow::Result<Self> {
        // Load configuration first (before logging setup)
        let mut config = AppConfig::load_from_file(&args.config_path).await?;
        config.apply_cli(&args)?;
        config
            .validate()
            .context("Configuration validation failed")?;

        logging::setup_logging(&config.logging)?;

        let server = Server::new(config.to_server_config());
        routes::register_routes(&server)?;

        info!(
            "📂 Config: {} | Version: {}",
            args.config_path.display(),
            env!("CARGO_PKG_VERSION")
        );
        Ok(Self { config, server })
    }

    pub async fn run(self) -> anyhow::Result<()> {
        info!("📋 Configuration Summary:");
        info!("  🌐 Address: {} ({:?})", self.config.server.address(), self.config.server.ip_version);
        info!("  👥 Max connections: {}", self.config.server.max_connections);
        info!("  🧵 Workers: {}", self.config.server.worker_pool_size);
        info!("  📦 Max packet size: {} bytes", self.config.server.max_packet_size);

        let addr = self.server.start().await?;
        info!("🎮 Ready to accept connections on {}", addr);
        info!("🛑 Press Ctrl+C to gracefully shutdown");

        let signal_result = signals::wait_for_shutdown_signal().await;
        match &signal_result {
            Ok(name) => info!("📡 {} received, initiating graceful shutdown...", name),
            Err(e) => error!("Signal handling failed, shutting down: {}", e),
        }

        self.server.stop().await;
        info!("✅ Gate server shutdown complete");

        signal_result.map(|_| ()).context("signal handling failed")
    }
}

#[tokio::main(flavor = "multi_thread")]
async fn main() {
    let args = CliArgs::parse();

    match Application::new(args).await {
        Ok(app) => {
            if let Err(e) = app.run().await {
                error!("❌ Application error: {:?}", e);
                std::process::exit(1);
            }
        }
        Err(e) => {
            eprintln!("❌ Failed to start application: {:?}", e);
            std::process::exit(1);
        }
    }
}
