use anyhow::Result;
use clap::{Parser, Subcommand};
use std::sync::Arc;
use tracing::info;

use querygate::config::GatewayConfig;
use querygate::query::gateway::NullExecutor;
use querygate::server;
use querygate::utils;

#[derive(Parser)]
#[command(name = "querygate", version, about = "Authenticated query gateway")]
struct AppCli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP gateway
    Serve {
        /// Override the configured listen port
        #[arg(long)]
        port: Option<u16>,
    },
    /// Print the effective configuration and exit
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    utils::logging::init();

    let args = AppCli::parse();
    let mut config = GatewayConfig::from_env();

    match args.command {
        Some(Commands::Config) => {
            println!("listen         {}:{}", config.server.host, config.server.port);
            println!("auth enabled   {}", config.oidc.is_active());
            println!("issuer         {}", config.oidc.issuer_url);
            println!("max query len  {}", config.query.max_length);
            println!("row limit      {} (max {})", config.query.default_row_limit, config.query.max_row_limit);
        }
        Some(Commands::Serve { port }) => {
            if let Some(port) = port {
                config.server.port = port;
            }
            info!(port = config.server.port, "starting gateway");
            server::serve(config, Arc::new(NullExecutor)).await?;
        }
        None => {
            info!(port = config.server.port, "starting gateway");
            server::serve(config, Arc::new(NullExecutor)).await?;
        }
    }

    Ok(())
}
