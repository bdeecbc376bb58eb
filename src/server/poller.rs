//! Configuration poller.

use std::sync::Arc;
use std::time::Duration;

use crate::server::{Command, ShardKvServer};
use crate::utils::ShardKvError;

use tokio::sync::watch;
use tokio::time::{self, Instant, MissedTickBehavior};

impl ShardKvServer {
    /// Periodically asks the shard controller for the next configuration and
    /// proposes it, while this replica is the primary. On becoming primary,
    /// and every `handoff_retry_ms` while some shard stays Pushing, requeues
    /// the pushes of those shards.
    pub(crate) async fn config_poller(
        self: Arc<Self>,
        mut rx_term: watch::Receiver<bool>,
    ) {
        pf_debug!(self.name; "config poller spawned");

        let mut ticker =
            time::interval(Duration::from_millis(self.config.poll_interval_ms));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut was_leader = self.log.is_leader();
        let resume_every = Duration::from_millis(self.config.handoff_retry_ms);
        let mut last_resume = Instant::now();

        loop {
            tokio::select! {
                _ = ticker.tick() => {},
                _ = rx_term.changed() => break,
            }
            if *rx_term.borrow() {
                break;
            }

            if !self.log.is_leader() {
                was_leader = false;
                continue;
            }
            let migrating = !self.guarded().sm.all_serving();
            if !was_leader
                || (migrating && last_resume.elapsed() >= resume_every)
            {
                if !was_leader {
                    was_leader = true;
                    pf_info!(self.name; "became primary");
                }
                last_resume = Instant::now();
                if let Err(e) = self.resume_handoff().await {
                    pf_error!(self.name; "error resuming handoffs: {}", e);
                }
            }

            if let Err(e) = self.poll_config_once().await {
                pf_warn!(self.name; "error polling config: {}", e);
            }
        }

        pf_debug!(self.name; "config poller exited");
    }

    /// One poll round. Returns true if a new configuration was proposed.
    pub(crate) async fn poll_config_once(&self) -> Result<bool, ShardKvError> {
        let num = {
            let guarded = self.guarded();
            if !guarded.sm.all_serving() {
                return Ok(false);
            }
            guarded.sm.config.num + 1
        };

        let config = self.ctrler.query(Some(num)).await?;
        if config.num < num {
            // nothing newer yet
            return Ok(false);
        }
        pf_debug!(self.name; "proposing config #{}", config.num);
        let (_, _, is_leader) = self.log.propose(Command::Configuration {
            config,
            proposer: self.me,
        });
        Ok(is_leader)
    }
}
