//! `bleep-node`: parses configuration, seeds structured logging, and runs
//! a single consensus node until the process is killed.

use bleep_cli::{NodeConfig, NodeRuntime};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = NodeConfig::parse_with_config()?;
    let key = config.network_key()?;
    let node = NodeRuntime::new(config, key);
    node.run().await
}
