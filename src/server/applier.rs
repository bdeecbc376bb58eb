//! The apply loop: sole consumer of the committed-entry stream.

use std::sync::Arc;

use crate::server::gateway::signal_pending;
use crate::server::{
    ApplyMsg, Command, CommandResult, HandoffIntent, LogIndex, ShardKvServer,
    Term,
};
use crate::utils::ShardKvError;

use tokio::sync::{mpsc, watch};

impl ShardKvServer {
    /// Applies committed entries and snapshots in order until terminated or
    /// the stream closes.
    pub(crate) async fn apply_loop(
        self: Arc<Self>,
        mut rx_apply: mpsc::UnboundedReceiver<ApplyMsg>,
        mut rx_term: watch::Receiver<bool>,
    ) {
        pf_debug!(self.name; "apply loop spawned");

        loop {
            if *rx_term.borrow() {
                break;
            }
            let msg = tokio::select! {
                msg = rx_apply.recv() => match msg {
                    Some(msg) => msg,
                    None => {
                        pf_warn!(self.name; "committed-entry stream closed");
                        break;
                    }
                },
                _ = rx_term.changed() => break,
            };

            if let Err(e) = self.apply_msg(msg).await {
                if e.is_protocol_violation() {
                    self.halt(e);
                    break;
                }
                pf_error!(self.name; "error applying: {}", e);
            }
        }

        pf_debug!(self.name; "apply loop exited");
    }

    async fn apply_msg(&self, msg: ApplyMsg) -> Result<(), ShardKvError> {
        match msg {
            ApplyMsg::Snapshot { term, index, data } => {
                self.apply_snapshot(term, index, &data);
                Ok(())
            }
            ApplyMsg::Command { index, cmd } => {
                let intents = self.apply_command(index, cmd);
                // enqueued outside the lock; workers take it to build args
                for intent in intents {
                    self.enqueue_handoff(intent).await?;
                }
                self.maybe_snapshot()
            }
        }
    }

    /// Installs an out-of-band snapshot if it is newer than what is applied
    /// and the log agrees to switch to it.
    fn apply_snapshot(&self, term: Term, index: LogIndex, data: &[u8]) {
        let mut guarded = self.guarded();
        if index <= guarded.sm.last_applied {
            pf_debug!(self.name; "ignored snapshot at {} <= applied {}",
                                 index, guarded.sm.last_applied);
            return;
        }
        if !self.log.cond_install_snapshot(term, index, data) {
            pf_debug!(self.name; "log declined snapshot at {}", index);
            return;
        }

        let restored = guarded.sm.restore_snapshot(data);
        guarded.sm.last_applied = index;
        pf_info!(self.name; "installed snapshot at {} ({} fields): config #{}",
                            index, restored, guarded.sm.config.num);
    }

    /// Applies one committed command and signals its waiter. Returns the
    /// handoff intents a newly applied configuration requires this replica
    /// to act on.
    fn apply_command(&self, index: LogIndex, cmd: Command) -> Vec<HandoffIntent> {
        let mut guarded = self.guarded();
        if index <= guarded.sm.last_applied {
            pf_trace!(self.name; "ignored {} at {} <= applied {}",
                                 cmd.kind(), index, guarded.sm.last_applied);
            return vec![];
        }
        guarded.sm.last_applied = index;

        let mut intents = vec![];
        let result = match &cmd {
            Command::Get { key } => guarded.sm.exec_get(key),

            Command::PutAppend {
                key,
                value,
                op,
                client,
                seq,
            } => guarded.sm.exec_put_append(key, value, *op, *client, *seq),

            Command::Configuration { config, proposer } => {
                let num = config.num;
                if let Some(targets) = guarded.sm.apply_config(config.clone()) {
                    pf_info!(self.name; "applied config #{} at {}: owning {:?}",
                                        num, index,
                                        guarded.sm.config.shards_of(self.gid));
                    // the proposer always pushes; a current primary also
                    // pushes in case the proposer has crashed since
                    if self.log.is_leader() || *proposer == self.me {
                        intents = HandoffIntent::from_targets(num, targets);
                    }
                }
                CommandResult::ok()
            }

            Command::Handoff(args) => {
                let result = guarded.sm.exec_handoff(args);
                pf_debug!(self.name; "handoff of {:?} from group {} at #{}: {}",
                                     args.shards, args.origin, args.num,
                                     result.outcome);
                result
            }

            Command::HandoffDone(args) => {
                let result = guarded.sm.exec_handoff_done(args);
                pf_debug!(self.name; "handoff done of {:?} by group {} at #{}: {}",
                                     args.shards, args.receiver, args.num,
                                     result.outcome);
                result
            }
        };

        pf_trace!(self.name; "applied {} at {}: {}", cmd.kind(), index, result.outcome);
        signal_pending(&mut guarded.pending, index, &cmd, result);
        intents
    }

    /// Hands a snapshot to the log once it has grown past the threshold.
    fn maybe_snapshot(&self) -> Result<(), ShardKvError> {
        if self.config.max_state_size == 0
            || self.log.state_size() < self.config.max_state_size
        {
            return Ok(());
        }

        let (index, data) = {
            let guarded = self.guarded();
            (guarded.sm.last_applied, guarded.sm.encode_snapshot()?)
        };
        pf_debug!(self.name; "taking snapshot at {} ({} bytes)", index, data.len());
        self.log.snapshot(index, data);
        Ok(())
    }
}
