//! In-process cluster harness: several groups of replicas, each group on its
//! own local consensus log, all wired through one local peer network.

#![allow(dead_code)]

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use shardkv::{
    Clerk, GroupId, LocalLog, LocalNetwork, ReplicaId, ShardKvError,
    ShardKvServer, ShardState, StaticCtrler, NUM_SHARDS,
};
use tokio::time::{self, Instant};

/// Replica config used by every test cluster unless overridden.
pub const FAST_CONFIG: &str = "poll_interval_ms = 20\n\
                               handoff_retry_ms = 50\n\
                               request_timeout_ms = 500";

/// One key per shard: leading bytes '0'..'9' cover every shard once.
pub fn key_of_shard(shard: usize, tag: &str) -> String {
    let lead = (b'0'..=b'9')
        .find(|b| (*b as usize) % NUM_SHARDS == shard)
        .unwrap_or(b'0');
    format!("{}{}", lead as char, tag)
}

pub struct Group {
    pub log: LocalLog,
    pub ctrler: Arc<StaticCtrler>,
    pub replicas: Vec<Option<Arc<ShardKvServer>>>,
    pub config_str: String,
}

pub struct Cluster {
    pub network: Arc<LocalNetwork>,
    pub ctrler: Arc<StaticCtrler>,
    pub groups: HashMap<GroupId, Group>,
}

pub fn server_name(gid: GroupId, replica: usize) -> String {
    format!("g{}-{}", gid, replica)
}

impl Cluster {
    pub fn new() -> Self {
        shardkv::logger_init();
        Cluster {
            network: Arc::new(LocalNetwork::new()),
            ctrler: Arc::new(StaticCtrler::new()),
            groups: HashMap::new(),
        }
    }

    /// Starts a group of `population` replicas polling the shared ctrler,
    /// with replica 0 as primary.
    pub async fn add_group(
        &mut self,
        gid: GroupId,
        population: usize,
    ) -> Result<(), ShardKvError> {
        let ctrler = self.ctrler.clone();
        self.add_group_with(gid, population, ctrler, FAST_CONFIG).await
    }

    /// Starts a group polling its own ctrler with given replica config.
    pub async fn add_group_with(
        &mut self,
        gid: GroupId,
        population: usize,
        ctrler: Arc<StaticCtrler>,
        config_str: &str,
    ) -> Result<(), ShardKvError> {
        let log = LocalLog::new();
        log.set_leader(Some(0))?;
        self.groups.insert(
            gid,
            Group {
                log,
                ctrler,
                replicas: vec![None; population],
                config_str: config_str.into(),
            },
        );
        for replica in 0..population {
            self.start_replica(gid, replica).await?;
        }
        Ok(())
    }

    fn group(&self, gid: GroupId) -> Result<&Group, ShardKvError> {
        self.groups
            .get(&gid)
            .ok_or_else(|| ShardKvError::msg(format!("no group {}", gid)))
    }

    /// (Re)starts one replica from whatever its log kept for it.
    pub async fn start_replica(
        &mut self,
        gid: GroupId,
        replica: usize,
    ) -> Result<Arc<ShardKvServer>, ShardKvError> {
        let group = self.group(gid)?;
        let (handle, rx_apply) = group.log.connect(replica as ReplicaId)?;
        let server = ShardKvServer::new_and_setup(
            replica as ReplicaId,
            gid,
            Box::new(handle),
            rx_apply,
            group.ctrler.clone(),
            self.network.clone(),
            Some(&group.config_str),
        )
        .await?;
        self.network.register(server_name(gid, replica), &server);
        if let Some(group) = self.groups.get_mut(&gid) {
            group.replicas[replica] = Some(server.clone());
        }
        Ok(server)
    }

    /// Stops one replica and cuts it off everything.
    pub async fn crash_replica(
        &mut self,
        gid: GroupId,
        replica: usize,
    ) -> Result<(), ShardKvError> {
        self.network.unregister(&server_name(gid, replica));
        let group = self
            .groups
            .get_mut(&gid)
            .ok_or_else(|| ShardKvError::msg(format!("no group {}", gid)))?;
        group.log.disconnect(replica as ReplicaId)?;
        if let Some(server) = group.replicas[replica].take() {
            server.kill();
            server.join().await?;
        }
        Ok(())
    }

    pub fn replica(
        &self,
        gid: GroupId,
        replica: usize,
    ) -> Result<Arc<ShardKvServer>, ShardKvError> {
        self.group(gid)?.replicas[replica]
            .clone()
            .ok_or_else(|| ShardKvError::msg("replica is down"))
    }

    pub fn live_replicas(&self, gid: GroupId) -> Vec<Arc<ShardKvServer>> {
        self.groups
            .get(&gid)
            .map(|group| group.replicas.iter().flatten().cloned().collect())
            .unwrap_or_default()
    }

    /// Server lists of every group in the cluster.
    pub fn memberships(&self) -> HashMap<GroupId, Vec<String>> {
        self.groups
            .iter()
            .map(|(&gid, group)| {
                let names = (0..group.replicas.len())
                    .map(|r| server_name(gid, r))
                    .collect();
                (gid, names)
            })
            .collect()
    }

    /// Installs the next configuration on the shared ctrler.
    pub fn reconfigure(
        &self,
        shards: [GroupId; NUM_SHARDS],
    ) -> Result<u64, ShardKvError> {
        self.ctrler.install(shards, self.memberships())
    }

    pub async fn clerk(&self) -> Result<Clerk, ShardKvError> {
        Clerk::new_and_setup(self.ctrler.clone(), self.network.clone()).await
    }

    /// Waits until every live replica of `gid` applied config `num` and has
    /// no migration in flight.
    pub async fn wait_settled(
        &self,
        gid: GroupId,
        num: u64,
    ) -> Result<(), ShardKvError> {
        let replicas = self.live_replicas(gid);
        wait_until(Duration::from_secs(10), || {
            replicas.iter().all(|server| {
                server.config_num() >= num
                    && server
                        .shard_states()
                        .iter()
                        .all(|&s| s == ShardState::Serving)
            })
        })
        .await
        .map_err(|_| {
            ShardKvError::msg(format!("group {} not settled at #{}", gid, num))
        })
    }

    pub async fn shutdown(mut self) -> Result<(), ShardKvError> {
        let targets: Vec<(GroupId, usize)> = self
            .groups
            .iter()
            .flat_map(|(&gid, group)| (0..group.replicas.len()).map(move |r| (gid, r)))
            .collect();
        for (gid, replica) in targets {
            self.crash_replica(gid, replica).await?;
        }
        Ok(())
    }
}

/// Polls `cond` until it holds or `limit` passes.
pub async fn wait_until(
    limit: Duration,
    mut cond: impl FnMut() -> bool,
) -> Result<(), ShardKvError> {
    let deadline = Instant::now() + limit;
    while !cond() {
        if Instant::now() >= deadline {
            return Err(ShardKvError::msg("condition not reached in time"));
        }
        time::sleep(Duration::from_millis(20)).await;
    }
    Ok(())
}

/// Runs a clerk operation with an upper bound on how long it may retry.
pub async fn bounded<T>(
    fut: impl Future<Output = Result<T, ShardKvError>>,
) -> Result<T, ShardKvError> {
    time::timeout(Duration::from_secs(10), fut).await?
}
