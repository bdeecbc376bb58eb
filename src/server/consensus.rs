//! Boundary to the external consensus log of a replica group.

use crate::server::Command;

/// Consensus log index type. Index 0 is never occupied.
pub type LogIndex = u64;

/// Consensus term type.
pub type Term = u64;

/// Notice delivered, in log order, on a replica's committed-entry stream.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum ApplyMsg {
    /// A proposed command reached consensus at `index`.
    Command { index: LogIndex, cmd: Command },

    /// Out-of-band state transfer covering everything up to `index`.
    Snapshot {
        term: Term,
        index: LogIndex,
        data: Vec<u8>,
    },
}

/// The operations a replica needs from its consensus log. The committed-entry
/// stream itself is handed over separately as the receiver side of a channel
/// of `ApplyMsg`s.
pub trait ConsensusLog: Send + Sync {
    /// Starts agreement on `cmd` without waiting for it. Returns the index it
    /// will occupy if committed, the current term, and whether this replica
    /// is the primary right now.
    fn propose(&self, cmd: Command) -> (LogIndex, Term, bool);

    /// Whether this replica is the primary right now.
    fn is_leader(&self) -> bool;

    /// Gate for an out-of-band snapshot notice: returns true if the log
    /// switched its base state to `data` and the caller must install it.
    fn cond_install_snapshot(
        &self,
        term: Term,
        index: LogIndex,
        data: &[u8],
    ) -> bool;

    /// Lets the log discard every entry up to `index`, keeping `data` as the
    /// new base state.
    fn snapshot(&self, index: LogIndex, data: Vec<u8>);

    /// Current persisted log size in bytes, used to decide compaction.
    fn state_size(&self) -> usize;

    /// Latest base state kept for this replica, with its log index.
    fn read_snapshot(&self) -> Option<(LogIndex, Vec<u8>)>;
}
