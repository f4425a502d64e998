#![forbid(unsafe_code)]

//! Confluence node entrypoint.
//!
//! Opens (or creates) a single ledger and runs its worker until ctrl-c.
//! Peers and transport wiring come from the deployment; standalone the
//! node still makes progress as its own witness.

use confluence::core::config::NodeConfig;
use confluence::core::node::LedgerNode;
use confluence::core::validator::AcceptAllValidator;
use confluence::monitoring::metrics::Metrics;
use confluence::networking::transport::LoopbackNetwork;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

fn env(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = tracing_subscriber::fmt()
        .with_target(false)
        .with_level(true)
        .compact()
        .try_init();

    let config_path = env("CONFLUENCE_CONFIG", "./confluence.toml");
    let config = if Path::new(&config_path).exists() {
        NodeConfig::load(&config_path)?
    } else {
        warn!(path = %config_path, "no config file; using defaults");
        NodeConfig {
            node: confluence::core::config::NodeSettings {
                name: "confluence".into(),
                data_dir: env("CONFLUENCE_DATA_DIR", "./data"),
            },
            ledger: Default::default(),
            engine: Default::default(),
        }
    };

    let metrics = Arc::new(Metrics::new().map_err(|e| anyhow::anyhow!("metrics: {e}"))?);
    let network = LoopbackNetwork::new();
    let validator = Arc::new(AcceptAllValidator);

    let data_dir = Path::new(&config.node.data_dir).to_path_buf();
    let ledger_name = if config.ledger.ledger_name.is_empty() {
        config.node.name.clone()
    } else {
        config.ledger.ledger_name.clone()
    };

    let (node, worker) = match &config.ledger.ledger_id {
        Some(id) => LedgerNode::join(
            &data_dir,
            id,
            config.engine.clone(),
            network.clone(),
            validator,
            metrics,
        )?,
        None => LedgerNode::create(
            &data_dir,
            &ledger_name,
            Vec::new(),
            config.engine.clone(),
            network.clone(),
            validator,
            metrics,
        )?,
    };

    network.register(
        node.creator().clone(),
        node.gossip_server(),
        node.wake_handle(),
    );

    info!(
        node = %config.node.name,
        creator = %node.creator(),
        ledger = %node.ledger_id(),
        "confluence node starting"
    );

    let worker_task = tokio::spawn(worker.run());

    tokio::signal::ctrl_c().await?;
    info!("ctrl-c received; shutting down");
    node.shutdown();
    let _ = worker_task.await;
    Ok(())
}
