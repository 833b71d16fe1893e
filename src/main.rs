#![deny(warnings)]
#![deny(clippy::unwrap_used)]

use std::sync::Arc;

use clap::Parser;
use dotenv::dotenv;
use session_relay::relay::config::{CliArgs, RelayConfig};
use session_relay::relay::{Registry, server};
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();

    // Initialize logging with proper tracing default
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("info".parse().expect("valid directive")),
        )
        .init();

    let config = RelayConfig::from_args(CliArgs::parse());
    info!(
        "SSH: timeout {:?}, {} retries, compression {}",
        config.ssh.connect_timeout, config.ssh.max_retries, config.ssh.compress
    );

    let registry = Arc::new(Registry::new(&config));

    server::serve(config.port, registry).await?;

    Ok(())
}
