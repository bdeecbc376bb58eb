//! Shard-assignment authority interface and configuration types.

mod shardconf;
mod ctrler;

pub use shardconf::{
    Configuration, ConfNum, GroupId, ShardId, NUM_SHARDS, INVALID_GID,
    key2shard,
};
pub use ctrler::{ShardCtrler, StaticCtrler};
