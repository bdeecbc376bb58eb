//! Versioned shard -> group assignment.

use std::collections::HashMap;
use std::fmt;

use serde::{Serialize, Deserialize};

/// Replica group ID type. Zero is never a real group.
pub type GroupId = u64;

/// Shard ID type, always in `0..NUM_SHARDS`.
pub type ShardId = usize;

/// Configuration number type.
pub type ConfNum = u64;

/// Fixed number of shards the keyspace is partitioned into.
pub const NUM_SHARDS: usize = 10;

/// Owner of a shard nobody has been assigned.
pub const INVALID_GID: GroupId = 0;

/// Maps a key to the shard it belongs to.
pub fn key2shard(key: &str) -> ShardId {
    match key.as_bytes().first() {
        Some(&b) => b as ShardId % NUM_SHARDS,
        None => 0,
    }
}

/// One configuration observed from the shard-assignment authority. Immutable
/// once observed.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct Configuration {
    /// Monotonically increasing configuration number.
    pub num: ConfNum,

    /// Shard ID -> owning group ID.
    pub shards: [GroupId; NUM_SHARDS],

    /// Group ID -> ordered list of server addresses.
    pub groups: HashMap<GroupId, Vec<String>>,
}

impl Configuration {
    /// The owning group of given shard.
    #[inline]
    pub fn owner(&self, shard: ShardId) -> GroupId {
        self.shards[shard]
    }

    /// Shards owned by given group.
    pub fn shards_of(&self, gid: GroupId) -> Vec<ShardId> {
        (0..NUM_SHARDS).filter(|&s| self.shards[s] == gid).collect()
    }
}

impl Default for Configuration {
    fn default() -> Self {
        Configuration {
            num: 0,
            shards: [INVALID_GID; NUM_SHARDS],
            groups: HashMap::new(),
        }
    }
}

impl fmt::Display for Configuration {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut gids: Vec<&GroupId> = self.groups.keys().collect();
        gids.sort();
        write!(f, "{{#{} {:?} groups {:?}}}", self.num, self.shards, gids)
    }
}
