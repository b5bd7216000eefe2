//! Mock add-on process
//!
//! Launched by the hub through an exec template such as
//! `hearth-mock-addon --id {name}`; the hub address comes from
//! `HEARTH_IPC_ADDR`.

use std::net::SocketAddr;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use hearth_mock_addon::{MockAddonConfig, run};

#[derive(Parser, Debug)]
#[command(name = "hearth-mock-addon")]
#[command(about = "Reference add-on for the Hearth hub", long_about = None)]
struct Args {
    /// Hub IPC address
    #[arg(long, env = "HEARTH_IPC_ADDR")]
    hub: SocketAddr,

    /// Package id to register as
    #[arg(long)]
    id: String,

    /// Id of the announced adapter
    #[arg(long, default_value = "mock-adapter")]
    adapter_id: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("hearth_mock_addon=info")),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let args = Args::parse();
    let mut config = MockAddonConfig::new(args.hub, args.id);
    config.adapter_id = args.adapter_id;
    run(config).await
}
