use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use flashlight_client::{Client, FileConfig};

#[derive(Parser, Debug)]
#[command(name = "flashlight-client")]
struct Args {
    /// Path to the YAML configuration file
    #[arg(short, long)]
    config: String,
    /// Listen address, overriding the one in the config file
    #[arg(short, long)]
    listen: Option<String>,
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let args = Args::parse();

    let level = if args.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber).ok();

    let config = FileConfig::from_file(&args.config)
        .with_context(|| format!("loading config from {}", args.config))?;

    let addr: SocketAddr = args
        .listen
        .as_deref()
        .unwrap_or(&config.listen.addr)
        .parse()
        .context("parsing listen address")?;

    let client = Arc::new(Client::new(
        addr,
        config.read_timeout(),
        config.write_timeout(),
    ));
    client.configure(config.client_config())?;

    info!("starting client proxy at {addr}");
    client.run().await
}
