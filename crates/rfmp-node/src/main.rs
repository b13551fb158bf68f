//! RFMP node binary.
//!
//! Wires configuration from CLI flags, structured logging, and graceful
//! shutdown around the [`rfmp_node::Node`] runtime. The REST/WebSocket API
//! layer attaches to the same library surface; this binary is the headless
//! radio-side daemon.

use clap::Parser;
use tracing_subscriber::EnvFilter;

use rfmp_core::Config;
use rfmp_node::{Node, NodeError};

/// RFMP packet-radio microblog node.
#[derive(Parser, Debug)]
#[command(name = "rfmp-node", version, about)]
struct Args {
    /// Station callsign (e.g. N0CALL).
    #[arg(long)]
    callsign: String,

    /// SSID 0-15.
    #[arg(long, default_value_t = 0)]
    ssid: u8,

    /// KISS-over-TCP TNC host.
    #[arg(long, default_value = "127.0.0.1")]
    tnc_host: String,

    /// KISS-over-TCP TNC port.
    #[arg(long, default_value_t = 8001)]
    tnc_port: u16,

    /// Database file path.
    #[arg(long, default_value = "rfmp.redb")]
    database: std::path::PathBuf,

    /// Air MTU in bytes.
    #[arg(long, default_value_t = 200)]
    mtu: u16,

    /// Seconds between SYNC emissions.
    #[arg(long, default_value_t = 30)]
    sync_interval: u32,

    /// Disable wire I/O (offline mode).
    #[arg(long)]
    offline: bool,
}

impl Args {
    fn into_config(self) -> Config {
        let mut config = Config::default();
        config.node.callsign = self.callsign;
        config.node.ssid = self.ssid;
        config.network.tnc_host = self.tnc_host;
        config.network.tnc_port = self.tnc_port;
        config.network.offline_mode = self.offline;
        config.protocol.mtu = self.mtu;
        config.protocol.sync_interval_s = self.sync_interval;
        config.storage.database_path = self.database;
        config
    }
}

#[tokio::main]
async fn main() -> Result<(), NodeError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Args::parse().into_config();
    let node = Node::open(config)?;

    let mut runner = {
        let node = node.clone();
        tokio::spawn(async move { node.run().await })
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("interrupt received, shutting down");
            node.shutdown();
        },
        result = &mut runner => {
            // The runtime stopped on its own; surface its verdict.
            return flatten(result);
        },
    }

    flatten(runner.await)
}

fn flatten(joined: Result<Result<(), NodeError>, tokio::task::JoinError>) -> Result<(), NodeError> {
    match joined {
        Ok(result) => result,
        Err(join_err) => {
            tracing::error!(%join_err, "runtime task panicked");
            Ok(())
        },
    }
}
