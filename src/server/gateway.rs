//! Client-facing request handling: propose, then wait for the apply loop to
//! report the outcome at the proposed index.

use std::collections::HashMap;
use std::time::Duration;

use crate::client::ClientId;
use crate::server::{
    Command, CommandResult, LogIndex, Outcome, PutOp, SeqNum, ShardKvServer,
};

use tokio::sync::oneshot;
use tokio::time;

/// A request handler waiting for its command to apply.
#[derive(Debug)]
pub(crate) struct PendingSlot {
    /// The command proposed at this index.
    cmd: Command,

    /// Where to deliver the result.
    tx_result: oneshot::Sender<CommandResult>,
}

/// Log index -> waiting request handler.
pub(crate) type PendingCompletions = HashMap<LogIndex, PendingSlot>;

/// Completes the slot waiting at `index`, if any. A different command applied
/// at that index means the proposal was lost to a primary change.
pub(crate) fn signal_pending(
    pending: &mut PendingCompletions,
    index: LogIndex,
    applied: &Command,
    result: CommandResult,
) {
    if let Some(slot) = pending.remove(&index) {
        let result = if slot.cmd == *applied {
            result
        } else {
            CommandResult::of(Outcome::NotLeader)
        };
        // the handler may have given up already
        let _ = slot.tx_result.send(result);
    }
}

impl ShardKvServer {
    /// Proposes `cmd` and waits for its outcome, up to the request timeout.
    pub(crate) async fn start_and_wait(&self, cmd: Command) -> CommandResult {
        let (tx_result, rx_result) = oneshot::channel();
        let index = {
            // proposing under the lock so that the apply loop cannot reach
            // this index before the slot is in place
            let mut guarded = self.guarded();
            let (index, term, is_leader) = self.log.propose(cmd.clone());
            if !is_leader {
                return CommandResult::of(Outcome::NotLeader);
            }
            pf_trace!(self.name; "proposed {} at {} term {}", cmd.kind(), index, term);
            // an older slot at the same index belongs to a lost proposal;
            // dropping its sender wakes that handler with NotLeader
            guarded.pending.insert(index, PendingSlot { cmd, tx_result });
            index
        };

        let timeout = Duration::from_millis(self.config.request_timeout_ms);
        match time::timeout(timeout, rx_result).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => CommandResult::of(Outcome::NotLeader),
            Err(_) => {
                let mut guarded = self.guarded();
                // only clean up the slot if it is still ours
                if guarded
                    .pending
                    .get(&index)
                    .map_or(false, |slot| slot.tx_result.is_closed())
                {
                    guarded.pending.remove(&index);
                }
                pf_debug!(self.name; "request at {} timed out", index);
                CommandResult::of(Outcome::Timeout)
            }
        }
    }

    /// Early rejection shared by client requests: not the primary, or the
    /// key's shard is not answerable here right now.
    fn precheck_key(&self, key: &str) -> Option<CommandResult> {
        if !self.log.is_leader() {
            return Some(CommandResult::of(Outcome::NotLeader));
        }
        match self.guarded().sm.check_key(key) {
            Outcome::Ok => None,
            outcome => Some(CommandResult::of(outcome)),
        }
    }

    /// Handles a client Get.
    pub async fn handle_get(&self, key: String) -> CommandResult {
        if let Some(rejected) = self.precheck_key(&key) {
            return rejected;
        }
        self.start_and_wait(Command::Get { key }).await
    }

    /// Handles a client Put or Append.
    pub async fn handle_put_append(
        &self,
        key: String,
        value: String,
        op: PutOp,
        client: ClientId,
        seq: SeqNum,
    ) -> CommandResult {
        if let Some(rejected) = self.precheck_key(&key) {
            return rejected;
        }
        self.start_and_wait(Command::PutAppend {
            key,
            value,
            op,
            client,
            seq,
        })
        .await
    }
}
