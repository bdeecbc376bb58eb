//! Replicated state of one group: the key-value store, the per-client dedup
//! table, and the configuration state with one migration tag per shard.
//!
//! Everything in here is mutated only by the apply loop, in committed log
//! order. The functions are pure with respect to the outside world so that
//! every replica of a group reaches the same state from the same log.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::mem;

use crate::client::ClientId;
use crate::manager::{
    key2shard, Configuration, ConfNum, GroupId, ShardId, INVALID_GID,
    NUM_SHARDS,
};
use crate::server::{LogIndex, ReplicaId};

use serde::{Serialize, Deserialize};

/// Client operation sequence number type.
pub type SeqNum = u64;

/// Kind of a write operation.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Serialize, Deserialize)]
pub enum PutOp {
    /// Overwrite the value.
    Put,

    /// Concatenate to the existing value (or to the empty string).
    Append,
}

/// Migration tag of a shard, local to this group.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Serialize, Deserialize)]
pub enum ShardState {
    /// No migration in flight; answered here iff owned in current config.
    Serving,

    /// Owned now, waiting for the previous owner to push its data.
    Pulling,

    /// Lost to another group; data still held until the push is confirmed.
    Pushing,
}

impl Default for ShardState {
    fn default() -> Self {
        ShardState::Serving
    }
}

/// Outcome code carried back to callers.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Serialize, Deserialize)]
pub enum Outcome {
    Ok,
    NoKey,
    WrongGroup,
    NotReady,
    NotLeader,
    Timeout,
    StaleConfig,
}

impl Outcome {
    /// Whether the caller may safely retry the same request at the same group.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Outcome::NotReady
                | Outcome::NotLeader
                | Outcome::Timeout
                | Outcome::StaleConfig
        )
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// "Install this shard data here", pushed from the losing group.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct HandoffArgs {
    /// Configuration number that moved the shards.
    pub num: ConfNum,

    /// Group that held the shards before.
    pub origin: GroupId,

    /// Shards being transferred.
    pub shards: Vec<ShardId>,

    /// All key-value pairs of those shards.
    pub kv: HashMap<String, String>,

    /// The origin's full dedup table at push time.
    pub dedup: HashMap<ClientId, SeqNum>,

    /// Client identity of the pushing replica.
    pub client: ClientId,

    /// Sequence number under that identity.
    pub seq: SeqNum,
}

/// "Transfer confirmed, drop the keys", sent back to the origin group.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct HandoffDoneArgs {
    /// Configuration number that moved the shards.
    pub num: ConfNum,

    /// Group that installed the shards.
    pub receiver: GroupId,

    /// Shards transferred.
    pub shards: Vec<ShardId>,

    /// Keys transferred, safe to delete at the origin now.
    pub keys: Vec<String>,
}

/// Command proposed through the consensus log.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub enum Command {
    /// Read the value of a key.
    Get { key: String },

    /// Put or append a value under a client's sequence number.
    PutAppend {
        key: String,
        value: String,
        op: PutOp,
        client: ClientId,
        seq: SeqNum,
    },

    /// Move to a new configuration, tagged with the replica that proposed it.
    Configuration {
        config: Configuration,
        proposer: ReplicaId,
    },

    /// Install shard data pushed from another group.
    Handoff(HandoffArgs),

    /// Delete shard data confirmed installed by another group.
    HandoffDone(HandoffDoneArgs),
}

impl Command {
    /// Short name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Command::Get { .. } => "Get",
            Command::PutAppend { .. } => "PutAppend",
            Command::Configuration { .. } => "Configuration",
            Command::Handoff(_) => "Handoff",
            Command::HandoffDone(_) => "HandoffDone",
        }
    }
}

/// Result of applying a command.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct CommandResult {
    pub outcome: Outcome,

    /// Present only for a successful Get.
    pub value: Option<String>,
}

impl CommandResult {
    #[inline]
    pub fn of(outcome: Outcome) -> Self {
        CommandResult {
            outcome,
            value: None,
        }
    }

    #[inline]
    pub fn ok() -> Self {
        Self::of(Outcome::Ok)
    }

    #[inline]
    pub fn value(value: String) -> Self {
        CommandResult {
            outcome: Outcome::Ok,
            value: Some(value),
        }
    }
}

/// Group ID -> shards grouped by the target a handoff must go to.
pub(crate) type HandoffTargets = BTreeMap<GroupId, Vec<ShardId>>;

/// The replicated state of this group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ShardKvState {
    /// My group ID.
    pub(crate) gid: GroupId,

    /// Key -> value store of the shards held.
    pub(crate) kv: HashMap<String, String>,

    /// Client ID -> highest applied sequence number.
    pub(crate) dedup: HashMap<ClientId, SeqNum>,

    /// Migration tag per shard.
    pub(crate) shard_states: [ShardState; NUM_SHARDS],

    /// Configuration before `config`.
    pub(crate) last_config: Configuration,

    /// Current configuration.
    pub(crate) config: Configuration,

    /// Every group membership seen so far.
    pub(crate) groups: HashMap<GroupId, Vec<String>>,

    /// Log index of the last applied entry or installed snapshot.
    pub(crate) last_applied: LogIndex,
}

impl ShardKvState {
    /// Creates the zero state of given group.
    pub(crate) fn new(gid: GroupId) -> Self {
        ShardKvState {
            gid,
            kv: HashMap::new(),
            dedup: HashMap::new(),
            shard_states: [ShardState::Serving; NUM_SHARDS],
            last_config: Configuration::default(),
            config: Configuration::default(),
            groups: HashMap::new(),
            last_applied: 0,
        }
    }

    /// Whether this group may answer requests on `key` right now.
    pub(crate) fn check_key(&self, key: &str) -> Outcome {
        let shard = key2shard(key);
        if self.config.owner(shard) != self.gid {
            Outcome::WrongGroup
        } else if self.shard_states[shard] != ShardState::Serving {
            Outcome::NotReady
        } else {
            Outcome::Ok
        }
    }

    /// True if no migration is in flight for any shard.
    pub(crate) fn all_serving(&self) -> bool {
        self.shard_states.iter().all(|&s| s == ShardState::Serving)
    }

    #[inline]
    fn is_duplicate(&self, client: ClientId, seq: SeqNum) -> bool {
        self.dedup.get(&client).map_or(false, |&applied| seq <= applied)
    }

    #[inline]
    fn valid_shards(shards: &[ShardId]) -> bool {
        shards.iter().all(|&s| s < NUM_SHARDS)
    }

    /// Server list of a group, from the current configuration or else from
    /// memberships seen before.
    pub(crate) fn servers_of(&self, gid: GroupId) -> Option<&Vec<String>> {
        self.config
            .groups
            .get(&gid)
            .or_else(|| self.groups.get(&gid))
            .filter(|servers| !servers.is_empty())
    }

    /// Key-value pairs belonging to any of `shards`.
    pub(crate) fn shard_slice(
        &self,
        shards: &[ShardId],
    ) -> HashMap<String, String> {
        self.kv
            .iter()
            .filter(|(k, _)| shards.contains(&key2shard(k)))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Shards still marked Pushing, grouped by the group they move to.
    pub(crate) fn pushing_targets(&self) -> HandoffTargets {
        let mut targets = HandoffTargets::new();
        for shard in 0..NUM_SHARDS {
            if self.shard_states[shard] != ShardState::Pushing {
                continue;
            }
            let target = self.config.owner(shard);
            if self.last_config.owner(shard) == self.gid
                && target != self.gid
                && target != INVALID_GID
            {
                targets.entry(target).or_default().push(shard);
            }
        }
        targets
    }

    /// Moves to a new configuration and computes per-shard transitions.
    /// Returns `None` if `config` is not newer than the current one, else
    /// the shards this group must now push, grouped by target.
    pub(crate) fn apply_config(
        &mut self,
        config: Configuration,
    ) -> Option<HandoffTargets> {
        if config.num <= self.config.num {
            return None;
        }

        self.last_config = mem::replace(&mut self.config, config);
        for (&gid, servers) in &self.config.groups {
            self.groups.insert(gid, servers.clone());
        }

        let mut targets = HandoffTargets::new();
        for shard in 0..NUM_SHARDS {
            let prev = self.last_config.owner(shard);
            let next = self.config.owner(shard);
            if prev == self.gid && next != self.gid {
                // unassigned target: nobody to push to, keep the data
                if next != INVALID_GID {
                    self.shard_states[shard] = ShardState::Pushing;
                    targets.entry(next).or_default().push(shard);
                }
            } else if prev != self.gid && next == self.gid {
                self.shard_states[shard] = if prev == INVALID_GID {
                    ShardState::Serving
                } else {
                    ShardState::Pulling
                };
            }
        }
        Some(targets)
    }

    /// Applies a Get.
    pub(crate) fn exec_get(&self, key: &str) -> CommandResult {
        match self.check_key(key) {
            Outcome::Ok => match self.kv.get(key) {
                Some(value) => CommandResult::value(value.clone()),
                None => CommandResult::of(Outcome::NoKey),
            },
            outcome => CommandResult::of(outcome),
        }
    }

    /// Applies a PutAppend, at most once per `(client, seq)`.
    pub(crate) fn exec_put_append(
        &mut self,
        key: &str,
        value: &str,
        op: PutOp,
        client: ClientId,
        seq: SeqNum,
    ) -> CommandResult {
        let outcome = self.check_key(key);
        if outcome != Outcome::Ok {
            return CommandResult::of(outcome);
        }
        if self.is_duplicate(client, seq) {
            return CommandResult::ok();
        }

        match op {
            PutOp::Put => {
                self.kv.insert(key.into(), value.into());
            }
            PutOp::Append => {
                self.kv.entry(key.into()).or_default().push_str(value);
            }
        }
        self.dedup.insert(client, seq);
        CommandResult::ok()
    }

    /// Applies a Handoff pushed from `args.origin`.
    pub(crate) fn exec_handoff(&mut self, args: &HandoffArgs) -> CommandResult {
        if self.is_duplicate(args.client, args.seq) {
            return CommandResult::ok();
        }
        if args.num > self.config.num {
            return CommandResult::of(Outcome::StaleConfig);
        }
        if args.num < self.config.num {
            return CommandResult::ok();
        }
        if !Self::valid_shards(&args.shards)
            || args.shards.iter().any(|&s| self.config.owner(s) != self.gid)
        {
            return CommandResult::of(Outcome::WrongGroup);
        }
        if args
            .shards
            .iter()
            .all(|&s| self.shard_states[s] == ShardState::Serving)
        {
            return CommandResult::ok();
        }

        for (key, value) in &args.kv {
            self.kv.insert(key.clone(), value.clone());
        }
        for &shard in &args.shards {
            self.shard_states[shard] = ShardState::Serving;
        }
        for (&client, &seq) in &args.dedup {
            let applied = self.dedup.entry(client).or_insert(seq);
            if seq > *applied {
                *applied = seq;
            }
        }
        self.dedup.insert(args.client, args.seq);
        CommandResult::ok()
    }

    /// Applies a HandoffDone confirmed by `args.receiver`.
    pub(crate) fn exec_handoff_done(
        &mut self,
        args: &HandoffDoneArgs,
    ) -> CommandResult {
        if args.num > self.config.num {
            return CommandResult::of(Outcome::StaleConfig);
        }
        if args.num < self.config.num {
            return CommandResult::ok();
        }
        if !Self::valid_shards(&args.shards)
            || args
                .shards
                .iter()
                .any(|&s| self.last_config.owner(s) != self.gid)
        {
            return CommandResult::of(Outcome::WrongGroup);
        }

        for key in &args.keys {
            if args.shards.contains(&key2shard(key)) {
                self.kv.remove(key);
            }
        }
        for &shard in &args.shards {
            self.shard_states[shard] = ShardState::Serving;
        }
        CommandResult::ok()
    }
}
