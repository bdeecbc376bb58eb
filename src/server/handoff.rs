//! Shard migration between groups.
//!
//! Sender side: a pool of workers pushes the data of every Pushing shard to
//! the group that now owns it, retrying until that group's primary accepts.
//! The config poller queues the push again while the shard stays Pushing.
//! Receiver side: a replica that installed a handoff keeps telling the origin
//! group it may drop the transferred keys, until the origin's primary accepts.
//!
//! A `WrongGroup` answer to either is impossible under the configuration
//! ordering both groups follow; it halts this replica.

use std::collections::HashSet;
use std::sync::{Arc, MutexGuard};
use std::time::Duration;

use crate::manager::{ConfNum, GroupId, ShardId};
use crate::server::{
    ApiRequest, CommandResult, HandoffArgs, HandoffDoneArgs, HandoffTargets,
    Outcome, ShardKvServer, ShardState,
};
use crate::server::Command;
use crate::utils::ShardKvError;

use tokio::sync::watch;
use tokio::time;

/// Shards to be pushed to one target group, as decided at config `num`.
#[derive(Debug, PartialEq, Eq, Clone)]
pub(crate) struct HandoffIntent {
    pub(crate) num: ConfNum,
    pub(crate) target: GroupId,
    pub(crate) shards: Vec<ShardId>,
}

impl HandoffIntent {
    /// One intent per target group.
    pub(crate) fn from_targets(
        num: ConfNum,
        targets: HandoffTargets,
    ) -> Vec<HandoffIntent> {
        targets
            .into_iter()
            .map(|(target, shards)| HandoffIntent {
                num,
                target,
                shards,
            })
            .collect()
    }
}

impl ShardKvServer {
    /// Queues `intent` for the workers unless the same push is already
    /// queued or in progress. Returns true if queued.
    pub(crate) async fn enqueue_handoff(
        &self,
        intent: HandoffIntent,
    ) -> Result<bool, ShardKvError> {
        let key = (intent.num, intent.target);
        if !self.inflight().insert(key) {
            return Ok(false);
        }
        if let Err(e) = self.tx_handoff.send(intent).await {
            self.inflight().remove(&key);
            return Err(e.into());
        }
        Ok(true)
    }

    fn inflight(&self) -> MutexGuard<HashSet<(ConfNum, GroupId)>> {
        self.handoff_inflight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }

    /// Requeues a push for every shard still tagged Pushing. An accepted
    /// push is sent again, since only the receiver's HandoffDone clears the
    /// Pushing tag and the replica sending it may have crashed.
    pub(crate) async fn resume_handoff(&self) -> Result<(), ShardKvError> {
        let intents = {
            let guarded = self.guarded();
            HandoffIntent::from_targets(
                guarded.sm.config.num,
                guarded.sm.pushing_targets(),
            )
        };
        let mut queued = 0;
        for intent in intents {
            if self.enqueue_handoff(intent).await? {
                queued += 1;
            }
        }
        if queued > 0 {
            pf_debug!(self.name; "requeued {} pending handoffs", queued);
        }
        Ok(())
    }

    /// Sleeps one retry pause. Returns false if terminated meanwhile.
    async fn retry_pause(&self, rx_term: &mut watch::Receiver<bool>) -> bool {
        tokio::select! {
            _ = time::sleep(Duration::from_millis(self.config.handoff_retry_ms)) => true,
            _ = rx_term.changed() => false,
        }
    }

    /// Handoff sender worker: takes intents off the shared queue one at a
    /// time and pushes each to completion.
    pub(crate) async fn handoff_worker(
        self: Arc<Self>,
        worker: usize,
        mut rx_term: watch::Receiver<bool>,
    ) {
        pf_debug!(self.name; "handoff worker {} spawned", worker);

        loop {
            if *rx_term.borrow() {
                break;
            }
            let intent = {
                let mut rx_handoff = self.rx_handoff.lock().await;
                tokio::select! {
                    intent = rx_handoff.recv() => intent,
                    _ = rx_term.changed() => None,
                }
            };
            let Some(intent) = intent else {
                break;
            };

            let key = (intent.num, intent.target);
            let pushed = self.push_handoff(intent, &mut rx_term).await;
            self.inflight().remove(&key);
            if let Err(e) = pushed {
                self.halt(e);
                break;
            }
        }

        pf_debug!(self.name; "handoff worker {} exited", worker);
    }

    /// Builds the handoff arguments for `intent` from current state, or
    /// `None` if its shards are no longer being pushed.
    fn prepare_handoff(
        &self,
        intent: &HandoffIntent,
    ) -> Result<Option<(HandoffArgs, Vec<String>)>, ShardKvError> {
        let guarded = self.guarded();
        let sm = &guarded.sm;
        if sm.config.num != intent.num
            || intent
                .shards
                .iter()
                .any(|&s| sm.shard_states[s] != ShardState::Pushing)
        {
            return Ok(None);
        }

        let servers = match sm.servers_of(intent.target) {
            Some(servers) => servers.clone(),
            None => {
                return Err(ShardKvError::protocol_violation(format!(
                    "no servers known for target group {}",
                    intent.target
                )))
            }
        };
        let args = HandoffArgs {
            num: intent.num,
            origin: self.gid,
            shards: intent.shards.clone(),
            kv: sm.shard_slice(&intent.shards),
            dedup: sm.dedup.clone(),
            client: self.handoff_client,
            seq: self.next_handoff_seq(),
        };
        Ok(Some((args, servers)))
    }

    /// Pushes one intent until some server of the target group accepts it.
    /// Retries reuse the same sequence number.
    async fn push_handoff(
        &self,
        intent: HandoffIntent,
        rx_term: &mut watch::Receiver<bool>,
    ) -> Result<(), ShardKvError> {
        let (args, servers) = match self.prepare_handoff(&intent)? {
            Some(prepared) => prepared,
            None => {
                pf_debug!(self.name; "skipped stale handoff intent {:?}", intent);
                return Ok(());
            }
        };
        pf_info!(self.name; "pushing shards {:?} at #{} to group {} ({} keys, seq {})",
                            args.shards, args.num, intent.target,
                            args.kv.len(), args.seq);

        let req = ApiRequest::Handoff(args);
        loop {
            if *rx_term.borrow() {
                return Ok(());
            }
            for server in &servers {
                match self.network.call(server, req.clone()).await {
                    Some(reply) if reply.outcome == Outcome::Ok => {
                        pf_info!(self.name; "handoff of {:?} accepted by {}",
                                            intent.shards, server);
                        return Ok(());
                    }
                    Some(reply) if reply.outcome == Outcome::WrongGroup => {
                        return Err(ShardKvError::protocol_violation(format!(
                            "{} of group {} refused shards {:?} at #{}",
                            server, intent.target, intent.shards, intent.num
                        )));
                    }
                    reply => {
                        pf_trace!(self.name; "handoff to {} not taken: {:?}",
                                             server, reply.map(|r| r.outcome));
                    }
                }
            }
            if !self.retry_pause(rx_term).await {
                return Ok(());
            }
        }
    }

    /// Handles a handoff pushed by another group's replica.
    pub async fn handle_handoff(self: &Arc<Self>, args: HandoffArgs) -> CommandResult {
        if !self.log.is_leader() {
            return CommandResult::of(Outcome::NotLeader);
        }

        let origin = args.origin;
        let done = HandoffDoneArgs {
            num: args.num,
            receiver: self.gid,
            shards: args.shards.clone(),
            keys: args.kv.keys().cloned().collect(),
        };
        let result = self.start_and_wait(Command::Handoff(args)).await;
        if result.outcome == Outcome::Ok {
            tokio::spawn(self.clone().notify_handoff_done(origin, done));
        }
        result
    }

    /// Tells the origin group to drop transferred keys, retrying until one
    /// of its servers accepts.
    async fn notify_handoff_done(self: Arc<Self>, origin: GroupId, done: HandoffDoneArgs) {
        let mut rx_term = self.subscribe_term();
        let req = ApiRequest::HandoffDone(done);

        loop {
            if *rx_term.borrow() {
                return;
            }
            let servers = self.guarded().sm.servers_of(origin).cloned();
            let servers = match servers {
                Some(servers) => servers,
                None => {
                    self.halt(ShardKvError::protocol_violation(format!(
                        "no servers known for origin group {}",
                        origin
                    )));
                    return;
                }
            };

            for server in &servers {
                match self.network.call(server, req.clone()).await {
                    Some(reply) if reply.outcome == Outcome::Ok => {
                        pf_debug!(self.name; "handoff done accepted by {}", server);
                        return;
                    }
                    Some(reply) if reply.outcome == Outcome::WrongGroup => {
                        self.halt(ShardKvError::protocol_violation(format!(
                            "{} of origin group {} refused handoff done",
                            server, origin
                        )));
                        return;
                    }
                    reply => {
                        pf_trace!(self.name; "handoff done to {} not taken: {:?}",
                                             server, reply.map(|r| r.outcome));
                    }
                }
            }
            if !self.retry_pause(&mut rx_term).await {
                return;
            }
        }
    }

    /// Handles a handoff confirmation from the group that took our shards.
    pub async fn handle_handoff_done(&self, args: HandoffDoneArgs) -> CommandResult {
        if !self.log.is_leader() {
            return CommandResult::of(Outcome::NotLeader);
        }
        self.start_and_wait(Command::HandoffDone(args)).await
    }
}
