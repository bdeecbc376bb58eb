//! ShardKV: one replica group of a horizontally sharded, replicated
//! key-value store, with shard migration between groups.

#[macro_use]
mod utils;

mod manager;
mod server;
mod client;

pub use utils::{logger_init, ShardKvError};

pub use manager::{
    key2shard, ConfNum, Configuration, GroupId, ShardCtrler, ShardId,
    StaticCtrler, INVALID_GID, NUM_SHARDS,
};

pub use server::{
    ApiReply, ApiRequest, ApplyMsg, Command, CommandResult, ConsensusLog,
    ExternalApi, HandoffArgs, HandoffDoneArgs, LocalLog, LocalLogHandle,
    LocalNetwork, LogIndex, Outcome, PeerNetwork, PutOp, ReplicaConfigShardKv,
    ReplicaId, SeqNum, ShardKvServer, ShardState, TcpNetwork, Term,
};

pub use client::{Clerk, ClientId};
