//! In-process consensus log shared by the replicas of one group.
//!
//! A single ordered log with a designated primary. Every connected replica
//! gets its own committed-entry stream and its own snapshot slot. Entries
//! covered by the newest snapshot are truncated; a replica reconnecting behind
//! the truncation point first receives that snapshot out-of-band.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::server::{
    ApplyMsg, Command, ConsensusLog, LogIndex, ReplicaId, Term,
};
use crate::utils::ShardKvError;

use rmp_serde::encode::to_vec as encode_to_vec;

use tokio::sync::mpsc;

/// A committed log entry.
#[derive(Debug, Clone)]
struct LogEntry {
    cmd: Command,

    /// Encoded size in bytes.
    size: usize,
}

/// State shared by every handle of one log.
#[derive(Debug)]
struct LogInner {
    /// Index of `entries[0]`.
    start: LogIndex,

    /// Retained entries.
    entries: Vec<LogEntry>,

    /// Total encoded size of retained entries.
    bytes: usize,

    /// Current term, bumped on every primary change.
    term: Term,

    /// Current primary, if any.
    leader: Option<ReplicaId>,

    /// Replica ID -> sender side of its committed-entry stream.
    subscribers: HashMap<ReplicaId, mpsc::UnboundedSender<ApplyMsg>>,

    /// Replica ID -> its latest base state and the index it covers.
    snapshots: HashMap<ReplicaId, (LogIndex, Vec<u8>)>,
}

impl LogInner {
    #[inline]
    fn next_index(&self) -> LogIndex {
        self.start + self.entries.len() as LogIndex
    }

    /// Drops every retained entry at or below `index`.
    fn truncate_upto(&mut self, index: LogIndex) {
        if index < self.start {
            return;
        }
        let cut = ((index - self.start + 1) as usize).min(self.entries.len());
        for entry in self.entries.drain(..cut) {
            self.bytes -= entry.size;
        }
        self.start += cut as LogIndex;
    }

    /// Newest snapshot kept by any replica.
    fn newest_snapshot(&self) -> Option<(LogIndex, Vec<u8>)> {
        self.snapshots
            .values()
            .max_by_key(|(index, _)| *index)
            .cloned()
    }
}

/// Group-wide handle used to connect replicas and steer primaryship.
#[derive(Debug, Clone)]
pub struct LocalLog {
    inner: Arc<Mutex<LogInner>>,
}

impl LocalLog {
    /// Creates an empty log with no primary.
    pub fn new() -> Self {
        LocalLog {
            inner: Arc::new(Mutex::new(LogInner {
                start: 1,
                entries: vec![],
                bytes: 0,
                term: 0,
                leader: None,
                subscribers: HashMap::new(),
                snapshots: HashMap::new(),
            })),
        }
    }

    fn lock(&self) -> Result<MutexGuard<LogInner>, ShardKvError> {
        self.inner.lock().map_err(|e| ShardKvError::msg(e.to_string()))
    }

    /// Connects (or reconnects after a crash) replica `me`. Everything the
    /// replica has not covered by its own snapshot is queued on the returned
    /// stream, preceded by an out-of-band snapshot if its own one is behind
    /// the truncation point.
    pub fn connect(
        &self,
        me: ReplicaId,
    ) -> Result<
        (LocalLogHandle, mpsc::UnboundedReceiver<ApplyMsg>),
        ShardKvError,
    > {
        let (tx_apply, rx_apply) = mpsc::unbounded_channel();
        let mut inner = self.lock()?;

        let own_index = inner.snapshots.get(&me).map_or(0, |(index, _)| *index);
        let mut from = own_index + 1;
        if from < inner.start {
            if let Some((index, data)) = inner.newest_snapshot() {
                tx_apply.send(ApplyMsg::Snapshot {
                    term: inner.term,
                    index,
                    data,
                })?;
                from = index + 1;
            }
        }
        let skip = from.saturating_sub(inner.start) as usize;
        for (offset, entry) in inner.entries.iter().enumerate().skip(skip) {
            tx_apply.send(ApplyMsg::Command {
                index: inner.start + offset as LogIndex,
                cmd: entry.cmd.clone(),
            })?;
        }

        inner.subscribers.insert(me, tx_apply);
        Ok((
            LocalLogHandle {
                me,
                inner: self.inner.clone(),
            },
            rx_apply,
        ))
    }

    /// Stops delivering to replica `me`, as if it crashed.
    pub fn disconnect(&self, me: ReplicaId) -> Result<(), ShardKvError> {
        self.lock()?.subscribers.remove(&me);
        Ok(())
    }

    /// Makes `leader` the primary (or nobody), starting a new term.
    pub fn set_leader(
        &self,
        leader: Option<ReplicaId>,
    ) -> Result<Term, ShardKvError> {
        let mut inner = self.lock()?;
        inner.term += 1;
        inner.leader = leader;
        Ok(inner.term)
    }

    /// The current primary.
    pub fn leader(&self) -> Result<Option<ReplicaId>, ShardKvError> {
        Ok(self.lock()?.leader)
    }

    /// Index the next committed entry will take.
    pub fn next_index(&self) -> Result<LogIndex, ShardKvError> {
        Ok(self.lock()?.next_index())
    }
}

impl Default for LocalLog {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-replica handle implementing the consensus log operations.
#[derive(Debug)]
pub struct LocalLogHandle {
    me: ReplicaId,
    inner: Arc<Mutex<LogInner>>,
}

impl LocalLogHandle {
    /// Runs `f` on the shared log, treating a poisoned lock as unusable.
    fn with<T>(&self, default: T, f: impl FnOnce(&mut LogInner) -> T) -> T {
        match self.inner.lock() {
            Ok(mut inner) => f(&mut inner),
            Err(e) => {
                pf_error!(self.me; "local log lock poisoned: {}", e);
                default
            }
        }
    }
}

impl ConsensusLog for LocalLogHandle {
    fn propose(&self, cmd: Command) -> (LogIndex, Term, bool) {
        self.with((0, 0, false), |inner| {
            if inner.leader != Some(self.me) {
                return (0, inner.term, false);
            }
            let size = match encode_to_vec(&cmd) {
                Ok(bytes) => bytes.len(),
                Err(e) => {
                    pf_error!(self.me; "error encoding command: {}", e);
                    return (0, inner.term, false);
                }
            };

            let index = inner.next_index();
            inner.entries.push(LogEntry {
                cmd: cmd.clone(),
                size,
            });
            inner.bytes += size;
            for tx_apply in inner.subscribers.values() {
                // a closed stream belongs to a replica that is gone
                let _ = tx_apply.send(ApplyMsg::Command {
                    index,
                    cmd: cmd.clone(),
                });
            }
            (index, inner.term, true)
        })
    }

    fn is_leader(&self) -> bool {
        self.with(false, |inner| inner.leader == Some(self.me))
    }

    fn cond_install_snapshot(
        &self,
        _term: Term,
        index: LogIndex,
        data: &[u8],
    ) -> bool {
        self.with(false, |inner| {
            let own_index =
                inner.snapshots.get(&self.me).map_or(0, |(index, _)| *index);
            if index <= own_index {
                return false;
            }
            inner.snapshots.insert(self.me, (index, data.to_vec()));
            true
        })
    }

    fn snapshot(&self, index: LogIndex, data: Vec<u8>) {
        self.with((), |inner| {
            let own_index =
                inner.snapshots.get(&self.me).map_or(0, |(index, _)| *index);
            if index <= own_index || index >= inner.next_index() {
                return;
            }
            inner.snapshots.insert(self.me, (index, data));
            inner.truncate_upto(index);
        })
    }

    fn state_size(&self) -> usize {
        self.with(0, |inner| inner.bytes)
    }

    fn read_snapshot(&self) -> Option<(LogIndex, Vec<u8>)> {
        self.with(None, |inner| inner.snapshots.get(&self.me).cloned())
    }
}
