//! Outbound RPC to servers of other groups.
//!
//! Servers are named by strings taken from configurations. `TcpNetwork`
//! treats a name as a socket address served by an `ExternalApi`;
//! `LocalNetwork` maps names to in-process server replicas and can cut
//! individual ones off.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;

use crate::server::{ApiReply, ApiRequest, ShardKvServer};
use crate::utils::{tcp_read_obj, tcp_write_obj, ShardKvError};

use async_trait::async_trait;

use tokio::net::TcpStream;
use tokio::time;

/// Request/reply channel to named servers.
#[async_trait]
pub trait PeerNetwork: Send + Sync {
    /// Sends `req` to `server` and waits for its reply. `None` means the
    /// server could not be reached or did not answer in time.
    async fn call(&self, server: &str, req: ApiRequest) -> Option<ApiReply>;
}

/// Peer network over TCP, one short-lived connection per call.
#[derive(Debug, Clone)]
pub struct TcpNetwork {
    rpc_timeout: Duration,
}

impl TcpNetwork {
    pub fn new(rpc_timeout: Duration) -> Self {
        TcpNetwork { rpc_timeout }
    }

    async fn call_once(
        server: &str,
        req: &ApiRequest,
    ) -> Result<ApiReply, ShardKvError> {
        let conn = TcpStream::connect(server).await?;
        conn.set_nodelay(true)?;
        let (mut conn_read, mut conn_write) = conn.into_split();
        tcp_write_obj(req, &mut conn_write).await?;
        tcp_read_obj(&mut conn_read).await
    }
}

#[async_trait]
impl PeerNetwork for TcpNetwork {
    async fn call(&self, server: &str, req: ApiRequest) -> Option<ApiReply> {
        match time::timeout(self.rpc_timeout, Self::call_once(server, &req)).await
        {
            Ok(Ok(reply)) => Some(reply),
            Ok(Err(e)) => {
                pf_trace!("tcp"; "call to {} failed: {}", server, e);
                None
            }
            Err(_) => {
                pf_trace!("tcp"; "call to {} timed out", server);
                None
            }
        }
    }
}

/// A registered in-process server.
#[derive(Debug)]
struct LocalEndpoint {
    server: Weak<ShardKvServer>,
    connected: bool,
}

/// In-process peer network for running several groups inside one runtime.
#[derive(Debug, Default)]
pub struct LocalNetwork {
    endpoints: RwLock<HashMap<String, LocalEndpoint>>,
}

impl LocalNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes `server` reachable under `name`, replacing any older binding.
    pub fn register(&self, name: impl Into<String>, server: &Arc<ShardKvServer>) {
        self.endpoints_write().insert(
            name.into(),
            LocalEndpoint {
                server: Arc::downgrade(server),
                connected: true,
            },
        );
    }

    /// Removes the binding of `name`.
    pub fn unregister(&self, name: &str) {
        self.endpoints_write().remove(name);
    }

    /// Cuts `name` off (or reconnects it). Calls to a cut-off server fail
    /// without reaching it.
    pub fn set_connected(&self, name: &str, connected: bool) {
        if let Some(endpoint) = self.endpoints_write().get_mut(name) {
            endpoint.connected = connected;
        }
    }

    fn endpoints_write(
        &self,
    ) -> std::sync::RwLockWriteGuard<'_, HashMap<String, LocalEndpoint>> {
        self.endpoints.write().unwrap_or_else(|e| e.into_inner())
    }

    fn lookup(&self, name: &str) -> Option<Arc<ShardKvServer>> {
        let endpoints = self.endpoints.read().unwrap_or_else(|e| e.into_inner());
        endpoints
            .get(name)
            .filter(|endpoint| endpoint.connected)
            .and_then(|endpoint| endpoint.server.upgrade())
    }
}

#[async_trait]
impl PeerNetwork for LocalNetwork {
    async fn call(&self, server: &str, req: ApiRequest) -> Option<ApiReply> {
        let target = self.lookup(server)?;
        Some(target.handle_request(req).await)
    }
}
