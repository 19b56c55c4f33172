//! Node configuration: everything the operator supplies at startup, either
//! as CLI flags or, for deployment-wide settings that rarely change between
//! runs, a JSON config file layered under the CLI.

use std::collections::HashMap;
use std::path::Path;

use clap::Parser;
use serde::Deserialize;

#[derive(Debug, Clone, Parser)]
#[command(name = "bleep-node", about = "A BLEEP consensus node")]
pub struct NodeConfig {
    /// This node's id.
    #[arg(long)]
    pub node_id: u32,

    /// Every node id in the deployment, comma-separated.
    #[arg(long, value_delimiter = ',')]
    pub nodes: Vec<u32>,

    /// Bind host for this node's listener.
    #[arg(long, default_value = "127.0.0.1")]
    pub host: String,

    /// This node's TCP port is `base_port + node_id`.
    #[arg(long, default_value_t = 5000)]
    pub base_port: u16,

    /// Shard this node belongs to.
    #[arg(long, default_value_t = 0)]
    pub shard_id: u32,

    /// Simulate Byzantine behavior for testing (silently drops votes it
    /// should cast, never used to bypass the engine's own checks).
    #[arg(long, default_value_t = false)]
    pub byzantine: bool,

    /// How long to hold outbound frames before flushing a batch.
    #[arg(long, default_value_t = 100)]
    pub batch_interval_ms: u64,

    /// Snapshot a committed block into `checkpoints` every K rounds.
    #[arg(long, default_value_t = 5)]
    pub checkpoint_interval: u64,

    /// Minimum spacing between shard-rebalance checks.
    #[arg(long, default_value_t = 30)]
    pub shard_adjustment_interval_secs: u64,

    /// Seconds between consensus rounds.
    #[arg(long, default_value_t = 3)]
    pub round_interval_secs: u64,

    /// Opening balances as `account=amount` pairs.
    #[arg(long, value_parser = parse_balance)]
    pub initial_balance: Vec<(String, f64)>,

    /// 64 hex chars (32 bytes), the shared transport key for this
    /// deployment. Every node must be given the same value out of band;
    /// omitting it is only for local single-process simulation.
    #[arg(long)]
    pub network_key_hex: Option<String>,

    /// Load deployment-wide defaults from a JSON file before applying these
    /// flags. Any flag left at its compiled-in default is overwritten by
    /// the file; anything passed explicitly on the command line wins.
    #[arg(long)]
    pub config: Option<String>,
}

/// Mirrors [`NodeConfig`]'s overridable fields. Every field is optional:
/// only the ones present in the file are applied, and each only overwrites
/// a [`NodeConfig`] field still sitting at its clap default.
#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    host: Option<String>,
    base_port: Option<u16>,
    shard_id: Option<u32>,
    byzantine: Option<bool>,
    batch_interval_ms: Option<u64>,
    checkpoint_interval: Option<u64>,
    shard_adjustment_interval_secs: Option<u64>,
    round_interval_secs: Option<u64>,
    initial_balance: Option<HashMap<String, f64>>,
    network_key_hex: Option<String>,
}

impl ConfigFile {
    fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Overwrite a flag in `config` with the file's value only if the flag
    /// is still exactly the compiled-in default — a CLI flag explicitly set
    /// to that same value is indistinguishable from "not passed", which is
    /// harmless here.
    fn merge_into(self, config: &mut NodeConfig) {
        if let Some(v) = self.host {
            if config.host == "127.0.0.1" {
                config.host = v;
            }
        }
        if let Some(v) = self.base_port {
            if config.base_port == 5000 {
                config.base_port = v;
            }
        }
        if let Some(v) = self.shard_id {
            if config.shard_id == 0 {
                config.shard_id = v;
            }
        }
        if let Some(v) = self.byzantine {
            if !config.byzantine {
                config.byzantine = v;
            }
        }
        if let Some(v) = self.batch_interval_ms {
            if config.batch_interval_ms == 100 {
                config.batch_interval_ms = v;
            }
        }
        if let Some(v) = self.checkpoint_interval {
            if config.checkpoint_interval == 5 {
                config.checkpoint_interval = v;
            }
        }
        if let Some(v) = self.shard_adjustment_interval_secs {
            if config.shard_adjustment_interval_secs == 30 {
                config.shard_adjustment_interval_secs = v;
            }
        }
        if let Some(v) = self.round_interval_secs {
            if config.round_interval_secs == 3 {
                config.round_interval_secs = v;
            }
        }
        if let Some(v) = self.initial_balance {
            if config.initial_balance.is_empty() {
                config.initial_balance = v.into_iter().collect();
            }
        }
        if let Some(v) = self.network_key_hex {
            if config.network_key_hex.is_none() {
                config.network_key_hex = Some(v);
            }
        }
    }
}

fn parse_balance(s: &str) -> Result<(String, f64), String> {
    let (account, amount) = s
        .split_once('=')
        .ok_or_else(|| format!("expected account=amount, got {s}"))?;
    let amount: f64 = amount.parse().map_err(|_| format!("invalid amount in {s}"))?;
    Ok((account.to_string(), amount))
}

impl NodeConfig {
    /// Parse CLI flags, then layer a `--config` file's values underneath
    /// them if one was given.
    pub fn parse_with_config() -> anyhow::Result<Self> {
        let mut config = Self::parse();
        if let Some(path) = config.config.clone() {
            let file = ConfigFile::load(Path::new(&path))?;
            file.merge_into(&mut config);
        }
        Ok(config)
    }

    pub fn address(&self, node_id: u32) -> String {
        format!("{}:{}", self.host, self.base_port + node_id as u16)
    }

    pub fn own_address(&self) -> String {
        self.address(self.node_id)
    }

    pub fn initial_balances(&self) -> HashMap<String, f64> {
        self.initial_balance.iter().cloned().collect()
    }

    pub fn round_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.round_interval_secs)
    }

    pub fn batch_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.batch_interval_ms)
    }

    pub fn shard_adjustment_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.shard_adjustment_interval_secs)
    }

    /// 2x the batch interval plus a fixed RTT allowance, per the
    /// round-deadline policy: the source has no timeout at all.
    pub fn round_deadline(&self) -> std::time::Duration {
        self.batch_interval() * 2 + std::time::Duration::from_millis(200)
    }

    /// Resolve the shared transport key from `--network-key-hex`, falling
    /// back to a fixed all-zero key for local simulation runs where no
    /// operator-distributed secret exists yet.
    pub fn network_key(&self) -> anyhow::Result<bleep_crypto::NetworkKey> {
        match &self.network_key_hex {
            Some(hex_str) => {
                let bytes = hex::decode(hex_str)?;
                let bytes: [u8; 32] = bytes
                    .try_into()
                    .map_err(|_| anyhow::anyhow!("--network-key-hex must decode to exactly 32 bytes"))?;
                Ok(bleep_crypto::NetworkKey::from_bytes(bytes))
            }
            None => Ok(bleep_crypto::NetworkKey::from_bytes([0u8; 32])),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_account_equals_amount() {
        assert_eq!(parse_balance("alice=1000").unwrap(), ("alice".to_string(), 1000.0));
        assert!(parse_balance("alice").is_err());
    }

    #[test]
    fn round_deadline_follows_batch_interval() {
        let cfg = NodeConfig {
            node_id: 0,
            nodes: vec![0],
            host: "127.0.0.1".to_string(),
            base_port: 5000,
            shard_id: 0,
            byzantine: false,
            batch_interval_ms: 100,
            checkpoint_interval: 5,
            shard_adjustment_interval_secs: 30,
            round_interval_secs: 3,
            initial_balance: vec![],
            network_key_hex: None,
            config: None,
        };
        assert_eq!(cfg.round_deadline(), std::time::Duration::from_millis(400));
    }

    #[test]
    fn config_file_only_overwrites_fields_left_at_their_default() {
        let mut cfg = NodeConfig {
            node_id: 0,
            nodes: vec![0, 1],
            host: "127.0.0.1".to_string(),
            base_port: 9000,
            shard_id: 0,
            byzantine: false,
            batch_interval_ms: 100,
            checkpoint_interval: 5,
            shard_adjustment_interval_secs: 30,
            round_interval_secs: 3,
            initial_balance: vec![],
            network_key_hex: None,
            config: None,
        };
        let file = ConfigFile {
            host: Some("0.0.0.0".to_string()),
            base_port: Some(6000),
            ..Default::default()
        };
        file.merge_into(&mut cfg);
        assert_eq!(cfg.host, "0.0.0.0");
        assert_eq!(cfg.base_port, 9000);
    }
}
