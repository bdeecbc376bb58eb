//! Shard-assignment authority client interface, plus a static in-memory
//! authority used by standalone deployments and tests.

use std::collections::HashMap;
use std::sync::RwLock;

use crate::manager::{Configuration, ConfNum, GroupId, NUM_SHARDS};
use crate::utils::ShardKvError;

use async_trait::async_trait;

use serde::Deserialize;

/// Query interface of the external shard-assignment authority.
#[async_trait]
pub trait ShardCtrler: Send + Sync {
    /// Returns the configuration numbered `num`, or the latest known one if
    /// `num` is `None` or larger than the latest number.
    async fn query(
        &self,
        num: Option<ConfNum>,
    ) -> Result<Configuration, ShardKvError>;
}

/// One configuration as written in a configurations TOML file.
#[derive(Debug, Deserialize)]
struct ConfigFileEntry {
    shards: Vec<GroupId>,
    #[serde(default)]
    groups: HashMap<String, Vec<String>>,
}

/// Layout of a configurations TOML file.
#[derive(Debug, Deserialize)]
struct ConfigFile {
    configs: Vec<ConfigFileEntry>,
}

/// Authority holding an append-only in-memory list of configurations.
/// Configuration 0 (every shard unassigned) always exists.
#[derive(Debug)]
pub struct StaticCtrler {
    configs: RwLock<Vec<Configuration>>,
}

impl StaticCtrler {
    /// Creates an authority knowing only the initial configuration.
    pub fn new() -> Self {
        StaticCtrler {
            configs: RwLock::new(vec![Configuration::default()]),
        }
    }

    /// Creates an authority from a TOML file content of the form:
    /// ```toml
    /// [[configs]]
    /// shards = [100, 100, 100, 100, 100, 101, 101, 101, 101, 101]
    /// groups = { 100 = ["127.0.0.1:52700"], 101 = ["127.0.0.1:52710"] }
    /// ```
    /// Entries become configurations 1, 2, ... in file order.
    pub fn from_toml(content: &str) -> Result<Self, ShardKvError> {
        let file: ConfigFile = toml::from_str(content)?;
        let ctrler = Self::new();
        for entry in file.configs {
            if entry.shards.len() != NUM_SHARDS {
                return Err(ShardKvError::msg(format!(
                    "config entry has {} shards, expected {}",
                    entry.shards.len(),
                    NUM_SHARDS
                )));
            }
            let mut shards = [0; NUM_SHARDS];
            shards.copy_from_slice(&entry.shards);
            let mut groups = HashMap::new();
            for (gid, servers) in entry.groups {
                groups.insert(gid.parse::<GroupId>()?, servers);
            }
            ctrler.install(shards, groups)?;
        }
        Ok(ctrler)
    }

    /// Appends the next configuration and returns its number. Every group
    /// assigned a shard must have a non-empty server list.
    pub fn install(
        &self,
        shards: [GroupId; NUM_SHARDS],
        groups: HashMap<GroupId, Vec<String>>,
    ) -> Result<ConfNum, ShardKvError> {
        for gid in shards.iter().filter(|&&gid| gid != 0) {
            if groups.get(gid).map_or(true, |servers| servers.is_empty()) {
                return Err(ShardKvError::msg(format!(
                    "group {} owns shards but has no servers",
                    gid
                )));
            }
        }

        let mut configs = self
            .configs
            .write()
            .map_err(|e| ShardKvError::msg(e.to_string()))?;
        let num = configs.len() as ConfNum;
        configs.push(Configuration {
            num,
            shards,
            groups,
        });
        Ok(num)
    }
}

impl Default for StaticCtrler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ShardCtrler for StaticCtrler {
    async fn query(
        &self,
        num: Option<ConfNum>,
    ) -> Result<Configuration, ShardKvError> {
        let configs = self
            .configs
            .read()
            .map_err(|e| ShardKvError::msg(e.to_string()))?;
        let latest = configs.len() - 1;
        let idx = match num {
            Some(n) if (n as usize) < latest => n as usize,
            _ => latest,
        };
        Ok(configs[idx].clone())
    }
}
