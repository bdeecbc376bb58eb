//! One replica of a sharded key-value replica group.
//!
//! The replica is a set of cooperating tasks around one lock-guarded state:
//!   - the apply loop, sole consumer of the committed-entry stream and sole
//!     mutator of the state (`applier`)
//!   - client-facing request handlers that propose and wait (`gateway`)
//!   - the handoff sender worker pool and receiver handlers (`handoff`)
//!   - the configuration poller (`poller`)
//!
//! No task holds the state lock across a network call or any `.await`.

mod statemach;
mod consensus;
mod locallog;
mod snapshot;
mod applier;
mod gateway;
mod handoff;
mod poller;
mod external;
mod transport;

pub use statemach::{
    Command, CommandResult, HandoffArgs, HandoffDoneArgs, Outcome, PutOp,
    SeqNum, ShardState,
};
pub use consensus::{ApplyMsg, ConsensusLog, LogIndex, Term};
pub use locallog::{LocalLog, LocalLogHandle};
pub use external::{ApiReply, ApiRequest, ExternalApi};
pub use transport::{LocalNetwork, PeerNetwork, TcpNetwork};

pub(crate) use statemach::{HandoffTargets, ShardKvState};
pub(crate) use gateway::PendingCompletions;
pub(crate) use handoff::HandoffIntent;

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::client::ClientId;
use crate::manager::{ConfNum, GroupId, ShardCtrler, NUM_SHARDS};
use crate::utils::ShardKvError;

use futures::future::join_all;

use serde::Deserialize;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// Server replica ID type, unique within a group.
pub type ReplicaId = u8;

/// Configuration parameters struct.
#[derive(Debug, Clone, Deserialize)]
pub struct ReplicaConfigShardKv {
    /// Snapshot once the consensus log grows to this many bytes; 0 disables.
    pub max_state_size: usize,

    /// Configuration poller period in millisecs.
    pub poll_interval_ms: u64,

    /// Pause between rounds of handoff retries in millisecs.
    pub handoff_retry_ms: u64,

    /// How long a client request waits for its entry to apply, in millisecs.
    pub request_timeout_ms: u64,

    /// Number of handoff sender workers.
    pub handoff_workers: usize,

    /// Per-call timeout of peer RPCs over TCP in millisecs.
    pub rpc_timeout_ms: u64,
}

#[allow(clippy::derivable_impls)]
impl Default for ReplicaConfigShardKv {
    fn default() -> Self {
        ReplicaConfigShardKv {
            max_state_size: 0,
            poll_interval_ms: 100,
            handoff_retry_ms: 200,
            request_timeout_ms: 500,
            handoff_workers: 2,
            rpc_timeout_ms: 300,
        }
    }
}

impl ReplicaConfigShardKv {
    /// Parses protocol-specific configs from a TOML string over defaults.
    pub fn parse(config_str: Option<&str>) -> Result<Self, ShardKvError> {
        let config = parsed_config!(config_str => ReplicaConfigShardKv;
                                    max_state_size, poll_interval_ms,
                                    handoff_retry_ms, request_timeout_ms,
                                    handoff_workers, rpc_timeout_ms)?;
        if config.poll_interval_ms == 0 {
            return logged_err!("config"; "invalid config.poll_interval_ms '{}'",
                                         config.poll_interval_ms);
        }
        if config.handoff_retry_ms == 0 {
            return logged_err!("config"; "invalid config.handoff_retry_ms '{}'",
                                         config.handoff_retry_ms);
        }
        if config.request_timeout_ms == 0 {
            return logged_err!("config"; "invalid config.request_timeout_ms '{}'",
                                         config.request_timeout_ms);
        }
        if config.handoff_workers == 0 {
            return logged_err!("config"; "invalid config.handoff_workers '{}'",
                                         config.handoff_workers);
        }
        if config.rpc_timeout_ms == 0 {
            return logged_err!("config"; "invalid config.rpc_timeout_ms '{}'",
                                         config.rpc_timeout_ms);
        }
        Ok(config)
    }
}

/// Everything behind the replica's single state lock.
#[derive(Debug)]
pub(crate) struct Guarded {
    /// Replicated group state.
    pub(crate) sm: ShardKvState,

    /// Log index -> waiting request handler.
    pub(crate) pending: PendingCompletions,
}

/// Sharded key-value server replica.
pub struct ShardKvServer {
    /// Replica ID within my group.
    me: ReplicaId,

    /// My group ID.
    gid: GroupId,

    /// Logging prefix `g<gid>/<me>`.
    name: String,

    /// Configuration parameters struct.
    config: ReplicaConfigShardKv,

    /// Consensus log of my group.
    log: Box<dyn ConsensusLog>,

    /// Shard-assignment authority.
    ctrler: Arc<dyn ShardCtrler>,

    /// RPC channel to servers of other groups.
    network: Arc<dyn PeerNetwork>,

    /// The single state lock.
    guarded: Mutex<Guarded>,

    /// Client identity this replica pushes handoffs under.
    handoff_client: ClientId,

    /// Next sequence number under `handoff_client`.
    handoff_seq: AtomicU64,

    /// Sender side of the handoff intent queue.
    tx_handoff: mpsc::Sender<HandoffIntent>,

    /// Receiver side of the handoff intent queue, shared by the workers.
    rx_handoff: tokio::sync::Mutex<mpsc::Receiver<HandoffIntent>>,

    /// Intents queued or being pushed, by config number and target group.
    handoff_inflight: Mutex<HashSet<(ConfNum, GroupId)>>,

    /// Termination signal broadcast to every background task.
    tx_term: watch::Sender<bool>,

    /// Fatal error that halted this replica, if any.
    fatal: Mutex<Option<ShardKvError>>,

    /// Join handles of background tasks.
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl ShardKvServer {
    /// Creates a new server replica, restores state from the log's latest
    /// snapshot, requeues any interrupted handoff, and spawns the background
    /// tasks. `rx_apply` is the replica's committed-entry stream.
    #[allow(clippy::too_many_arguments)]
    pub async fn new_and_setup(
        me: ReplicaId,
        gid: GroupId,
        log: Box<dyn ConsensusLog>,
        rx_apply: mpsc::UnboundedReceiver<ApplyMsg>,
        ctrler: Arc<dyn ShardCtrler>,
        network: Arc<dyn PeerNetwork>,
        config_str: Option<&str>,
    ) -> Result<Arc<Self>, ShardKvError> {
        let name = format!("g{}/{}", gid, me);
        if gid == crate::manager::INVALID_GID {
            return logged_err!(name; "invalid group ID {}", gid);
        }
        let config = ReplicaConfigShardKv::parse(config_str)?;

        let mut sm = ShardKvState::new(gid);
        if let Some((index, data)) = log.read_snapshot() {
            let restored = sm.restore_snapshot(&data);
            sm.last_applied = index;
            pf_info!(name; "restored {} fields from snapshot at {}: config #{} states {:?}",
                           restored, index, sm.config.num, sm.shard_states);
        }

        let (tx_handoff, rx_handoff) = mpsc::channel(NUM_SHARDS);
        let (tx_term, _) = watch::channel(false);

        let server = Arc::new(ShardKvServer {
            me,
            gid,
            name,
            config,
            log,
            ctrler,
            network,
            guarded: Mutex::new(Guarded {
                sm,
                pending: PendingCompletions::new(),
            }),
            handoff_client: rand::random(),
            handoff_seq: AtomicU64::new(1),
            tx_handoff,
            rx_handoff: tokio::sync::Mutex::new(rx_handoff),
            handoff_inflight: Mutex::new(HashSet::new()),
            tx_term,
            fatal: Mutex::new(None),
            handles: Mutex::new(vec![]),
        });

        // crash-recovery: shards left Pushing must still be pushed
        server.resume_handoff().await?;

        let mut handles = vec![tokio::spawn(
            server.clone().apply_loop(rx_apply, server.tx_term.subscribe()),
        )];
        handles.push(tokio::spawn(
            server.clone().config_poller(server.tx_term.subscribe()),
        ));
        for worker in 0..server.config.handoff_workers {
            handles.push(tokio::spawn(
                server
                    .clone()
                    .handoff_worker(worker, server.tx_term.subscribe()),
            ));
        }
        server.handles_lock().extend(handles);

        pf_info!(server.name; "server replica set up, handoff client {}",
                              server.handoff_client);
        Ok(server)
    }

    /// Locks the replica state. A poisoned lock is recovered since every
    /// mutation under it is completed before any panic could unwind.
    pub(crate) fn guarded(&self) -> MutexGuard<'_, Guarded> {
        self.guarded.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn handles_lock(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.handles.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Dispatches an inbound RPC from a client or a peer group.
    pub async fn handle_request(self: &Arc<Self>, req: ApiRequest) -> ApiReply {
        if self.is_killed() {
            return CommandResult::of(Outcome::NotLeader);
        }
        match req {
            ApiRequest::Get { key } => self.handle_get(key).await,
            ApiRequest::PutAppend {
                key,
                value,
                op,
                client,
                seq,
            } => self.handle_put_append(key, value, op, client, seq).await,
            ApiRequest::Handoff(args) => self.handle_handoff(args).await,
            ApiRequest::HandoffDone(args) => {
                self.handle_handoff_done(args).await
            }
        }
    }

    /// Records a fatal error and stops every background task.
    pub(crate) fn halt(&self, err: ShardKvError) {
        pf_error!(self.name; "halting: {}", err);
        {
            let mut fatal = self.fatal.lock().unwrap_or_else(|e| e.into_inner());
            if fatal.is_none() {
                *fatal = Some(err);
            }
        }
        self.tx_term.send_replace(true);
    }

    /// Stops every background task. Requests arriving afterwards are answered
    /// with `NotLeader`.
    pub fn kill(&self) {
        if !self.tx_term.send_replace(true) {
            pf_info!(self.name; "server replica killed");
        }
    }

    /// Waits until all background tasks have exited.
    pub async fn join(&self) -> Result<(), ShardKvError> {
        let handles: Vec<JoinHandle<()>> =
            self.handles_lock().drain(..).collect();
        for result in join_all(handles).await {
            result?;
        }
        Ok(())
    }

    /// Waits until this replica is killed or halted.
    pub async fn terminated(&self) {
        let mut rx_term = self.tx_term.subscribe();
        while !*rx_term.borrow_and_update() {
            if rx_term.changed().await.is_err() {
                return;
            }
        }
    }

    /// Subscribes to the termination signal.
    pub(crate) fn subscribe_term(&self) -> watch::Receiver<bool> {
        self.tx_term.subscribe()
    }

    #[inline]
    pub fn is_killed(&self) -> bool {
        *self.tx_term.borrow()
    }

    /// The fatal error that halted this replica, if any.
    pub fn fatal_error(&self) -> Option<ShardKvError> {
        self.fatal.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    #[inline]
    pub fn me(&self) -> ReplicaId {
        self.me
    }

    #[inline]
    pub fn gid(&self) -> GroupId {
        self.gid
    }

    #[inline]
    pub fn is_leader(&self) -> bool {
        self.log.is_leader()
    }

    /// Number of the configuration currently applied.
    pub fn config_num(&self) -> ConfNum {
        self.guarded().sm.config.num
    }

    /// Migration tag of every shard.
    pub fn shard_states(&self) -> [ShardState; NUM_SHARDS] {
        self.guarded().sm.shard_states
    }

    /// Whether the local store currently holds `key`, owned or not.
    pub fn holds_key(&self, key: &str) -> bool {
        self.guarded().sm.kv.contains_key(key)
    }

    /// Log index of the last applied entry.
    pub fn last_applied(&self) -> LogIndex {
        self.guarded().sm.last_applied
    }

    /// Next sequence number to be used for a handoff push.
    fn next_handoff_seq(&self) -> SeqNum {
        self.handoff_seq.fetch_add(1, Ordering::SeqCst)
    }
}
