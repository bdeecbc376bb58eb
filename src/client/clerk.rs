//! Clerk: routes each operation to the group owning its key's shard and
//! retries, refreshing its configuration, until some server answers it.

use std::sync::Arc;
use std::time::Duration;

use crate::client::ClientId;
use crate::manager::{key2shard, Configuration, ShardCtrler};
use crate::server::{ApiReply, ApiRequest, Outcome, PeerNetwork, PutOp, SeqNum};
use crate::utils::ShardKvError;

use tokio::time;

/// Pause between full rounds over the owning group's servers.
const RETRY_INTERVAL: Duration = Duration::from_millis(100);

/// Key-value client handle. Operations of one clerk are issued one at a time.
pub struct Clerk {
    /// My client ID.
    id: ClientId,

    /// Sequence number of the latest write issued.
    seq: SeqNum,

    /// Shard-assignment authority.
    ctrler: Arc<dyn ShardCtrler>,

    /// Channel to the servers.
    network: Arc<dyn PeerNetwork>,

    /// Latest configuration known.
    config: Configuration,
}

impl Clerk {
    /// Creates a clerk with a random client ID and the latest configuration.
    pub async fn new_and_setup(
        ctrler: Arc<dyn ShardCtrler>,
        network: Arc<dyn PeerNetwork>,
    ) -> Result<Self, ShardKvError> {
        let config = ctrler.query(None).await?;
        Ok(Clerk {
            id: rand::random(),
            seq: 0,
            ctrler,
            network,
            config,
        })
    }

    /// My client ID.
    pub fn id(&self) -> ClientId {
        self.id
    }

    /// Fetches the current value of `key`, or `None` if it has none.
    pub async fn get(&mut self, key: &str) -> Result<Option<String>, ShardKvError> {
        let reply = self
            .request(key, ApiRequest::Get { key: key.into() })
            .await?;
        Ok(reply.value)
    }

    /// Sets `key` to `value`.
    pub async fn put(&mut self, key: &str, value: &str) -> Result<(), ShardKvError> {
        self.put_append(key, value, PutOp::Put).await
    }

    /// Appends `value` to the current value of `key`.
    pub async fn append(&mut self, key: &str, value: &str) -> Result<(), ShardKvError> {
        self.put_append(key, value, PutOp::Append).await
    }

    async fn put_append(
        &mut self,
        key: &str,
        value: &str,
        op: PutOp,
    ) -> Result<(), ShardKvError> {
        // retries of this write all carry the same sequence number
        self.seq += 1;
        let req = ApiRequest::PutAppend {
            key: key.into(),
            value: value.into(),
            op,
            client: self.id,
            seq: self.seq,
        };
        self.request(key, req).await?;
        Ok(())
    }

    /// Sends `req` to servers of the group owning `key` until one answers
    /// with a final outcome. Never gives up by itself.
    async fn request(
        &mut self,
        key: &str,
        req: ApiRequest,
    ) -> Result<ApiReply, ShardKvError> {
        let shard = key2shard(key);
        loop {
            let gid = self.config.owner(shard);
            if let Some(servers) = self.config.groups.get(&gid) {
                for server in servers {
                    match self.network.call(server, req.clone()).await {
                        Some(reply)
                            if matches!(
                                reply.outcome,
                                Outcome::Ok | Outcome::NoKey
                            ) =>
                        {
                            return Ok(reply);
                        }
                        Some(reply) if reply.outcome == Outcome::WrongGroup => {
                            break;
                        }
                        _ => {}
                    }
                }
            }

            time::sleep(RETRY_INTERVAL).await;
            self.config = self.ctrler.query(None).await?;
        }
    }
}
