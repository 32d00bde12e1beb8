//! Read-only IMAP proxy daemon

use clap::Parser;
use imap_proxy::{Config, Server};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "imap-proxy")]
#[command(about = "Read-only IMAP proxy mapping local logins to upstream accounts")]
struct Args {
    /// Path to the TOML config file
    #[arg(long, default_value = "config.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let config = Arc::new(Config::load(&args.config)?);
    info!(
        listen = %config.server.listen,
        accounts = config.accounts.len(),
        "starting imap-proxy"
    );

    let server = Server::new(config);
    tokio::select! {
        result = server.listen_and_serve() => result?,
        _ = tokio::signal::ctrl_c() => info!("received ctrl-c, shutting down"),
    }

    Ok(())
}
