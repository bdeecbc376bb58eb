//! Server external API: the RPC surface that clerks and peer groups talk to.

use std::net::SocketAddr;
use std::sync::Arc;

use crate::client::ClientId;
use crate::server::{
    CommandResult, HandoffArgs, HandoffDoneArgs, PutOp, SeqNum, ShardKvServer,
};
use crate::utils::{tcp_write_obj, ShardKvError, MAX_OBJ_LEN};

use bytes::{Bytes, BytesMut};

use serde::{Serialize, Deserialize};

use rmp_serde::decode::from_slice as decode_from_slice;

use tokio::io::AsyncReadExt;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Request received from a clerk or from another group's replica.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub enum ApiRequest {
    /// Read a key.
    Get { key: String },

    /// Put or append to a key.
    PutAppend {
        key: String,
        value: String,
        op: PutOp,
        client: ClientId,
        seq: SeqNum,
    },

    /// Install pushed shard data.
    Handoff(HandoffArgs),

    /// Drop shard data confirmed transferred.
    HandoffDone(HandoffDoneArgs),
}

/// Reply to an `ApiRequest`: its outcome plus the value for a successful Get.
pub type ApiReply = CommandResult;

/// TCP front end of one server replica.
pub struct ExternalApi {
    /// Logging prefix.
    name: String,

    /// Address actually bound.
    local_addr: SocketAddr,

    /// Join handle of the client acceptor thread.
    client_acceptor_handle: JoinHandle<()>,
}

impl ExternalApi {
    /// Binds `api_addr` and spawns the client acceptor thread serving
    /// requests to `server` until it is killed.
    pub async fn new_and_setup(
        server: Arc<ShardKvServer>,
        api_addr: SocketAddr,
    ) -> Result<Self, ShardKvError> {
        let name = format!("g{}/{}", server.gid(), server.me());
        let listener = TcpListener::bind(api_addr).await?;
        let local_addr = listener.local_addr()?;
        pf_info!(name; "accepting requests on '{}'", local_addr);

        let client_acceptor_handle =
            tokio::spawn(Self::client_acceptor_thread(server, listener));
        Ok(ExternalApi {
            name,
            local_addr,
            client_acceptor_handle,
        })
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stops accepting new connections.
    pub fn shutdown(&self) {
        pf_debug!(self.name; "external API shut down");
        self.client_acceptor_handle.abort();
    }
}

// ExternalApi client_acceptor thread implementation
impl ExternalApi {
    /// Client acceptor thread function.
    async fn client_acceptor_thread(
        server: Arc<ShardKvServer>,
        listener: TcpListener,
    ) {
        let name = format!("g{}/{}", server.gid(), server.me());
        pf_debug!(name; "client_acceptor thread spawned");
        let mut rx_term = server.subscribe_term();

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((conn, addr)) => {
                            pf_debug!(name; "accepted connection from {}", addr);
                            tokio::spawn(Self::client_servant_thread(
                                server.clone(),
                                addr,
                                conn,
                                server.subscribe_term(),
                            ));
                        }
                        Err(e) => {
                            pf_warn!(name; "error accepting connection: {}", e);
                        }
                    }
                },

                _ = rx_term.changed() => break,
            }
        }

        pf_debug!(name; "client_acceptor thread exited");
    }
}

// ExternalApi client_servant thread implementation
impl ExternalApi {
    /// Reads a request from given connection.
    async fn read_req(
        // first 8 bytes being the request length, and the rest bytes being the
        // request itself
        req_buf: &mut BytesMut,
        conn_read: &mut OwnedReadHalf,
    ) -> Result<ApiRequest, ShardKvError> {
        // CANCELLATION SAFETY: we cannot use `read_u64()` and `read_exact()`
        // here because this function is used as a `tokio::select!` branch and
        // that those two methods are not cancellation-safe

        while req_buf.len() < 8 {
            if conn_read.read_buf(req_buf).await? == 0 {
                return Err(ShardKvError::msg("connection closed"));
            }
        }
        let mut len_bytes = [0u8; 8];
        len_bytes.copy_from_slice(&req_buf[..8]);
        let req_len = u64::from_be_bytes(len_bytes);
        if req_len > MAX_OBJ_LEN {
            return Err(ShardKvError::msg(format!(
                "request length {} too large",
                req_len
            )));
        }

        let req_end = 8 + req_len as usize;
        if req_buf.capacity() < req_end {
            req_buf.reserve(req_end - req_buf.len());
        }
        while req_buf.len() < req_end {
            if conn_read.read_buf(req_buf).await? == 0 {
                return Err(ShardKvError::msg("connection closed"));
            }
        }
        let req = decode_from_slice(&req_buf[8..req_end])?;

        // no more awaits ahead; discard bytes consumed by this request
        if req_buf.len() > req_end {
            let buf_tail = Bytes::copy_from_slice(&req_buf[req_end..]);
            req_buf.clear();
            req_buf.extend_from_slice(&buf_tail);
        } else {
            req_buf.clear();
        }

        Ok(req)
    }

    /// Request listener and reply sender thread function, one per connection.
    async fn client_servant_thread(
        server: Arc<ShardKvServer>,
        addr: SocketAddr,
        conn: TcpStream,
        mut rx_term: watch::Receiver<bool>,
    ) {
        let name = format!("g{}/{}", server.gid(), server.me());
        pf_debug!(name; "client_servant thread for {} spawned", addr);

        let (mut conn_read, mut conn_write) = conn.into_split();
        let mut req_buf = BytesMut::with_capacity(8 + 1024);

        loop {
            let req = tokio::select! {
                req = Self::read_req(&mut req_buf, &mut conn_read) => req,
                _ = rx_term.changed() => break,
            };
            let req = match req {
                Ok(req) => req,
                Err(e) => {
                    pf_debug!(name; "connection from {} ended: {}", addr, e);
                    break;
                }
            };

            let reply = server.handle_request(req).await;
            if let Err(e) = tcp_write_obj(&reply, &mut conn_write).await {
                pf_warn!(name; "error replying to {}: {}", addr, e);
                break;
            }
        }

        pf_debug!(name; "client_servant thread for {} exited", addr);
    }
}
