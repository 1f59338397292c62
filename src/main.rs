use clap::Parser;
use fog_node::config::Config;
use fog_node::orchestrator::FogNode;
use fog_node::transport::{MockCloudTransport, MockEdgeTransport, MockPeerTransport};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "fog-node", about = "Regional fog node for federated learning")]
struct Args {
    /// Path to the fog node TOML configuration file
    #[arg(long, default_value = "fog-node.toml")]
    config: PathBuf,

    /// Increase log verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn init_tracing(verbosity: u8) {
    let default_level = match verbosity {
        0 => "fog_node=info",
        1 => "fog_node=debug",
        _ => "fog_node=trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
        .init();
}

#[tokio::main]
async fn main() -> fog_node::Result<()> {
    let args = Args::parse();
    init_tracing(args.verbose);

    let config = if args.config.exists() {
        Config::load(&args.config)?
    } else {
        tracing::warn!(path = %args.config.display(), "config file not found, using defaults");
        Config::default()
    };

    // Concrete MQTT/HTTP/gRPC transports are out of scope for this crate;
    // the mocks below exercise the wiring until a real adapter is plugged in.
    let node = FogNode::new(
        &config,
        Arc::new(MockEdgeTransport::default()),
        Arc::new(MockCloudTransport::default()),
        Arc::new(MockPeerTransport::default()),
    );
    node.start();

    tracing::info!(fog_node_id = %config.fog_node.id, "fog node running, press ctrl-c to stop");
    tokio::signal::ctrl_c().await.map_err(fog_node::Error::Io)?;

    node.stop();
    Ok(())
}
