//! Length-prefixed MessagePack framing over TCP streams.

use std::marker::Unpin;

use crate::utils::ShardKvError;

use serde::Serialize;
use serde::de::DeserializeOwned;

use rmp_serde::encode::to_vec as encode_to_vec;
use rmp_serde::decode::from_slice as decode_from_slice;

use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Upper bound on a single framed object; a larger length prefix means the
/// stream is garbage.
pub(crate) const MAX_OBJ_LEN: u64 = 256 * 1024 * 1024;

/// Writes an object of type `T` through given writable connection, sending
/// its encoded length as a big-endian `u64` first.
pub(crate) async fn tcp_write_obj<T, Conn>(
    obj: &T,
    conn_write: &mut Conn,
) -> Result<(), ShardKvError>
where
    T: Serialize,
    Conn: AsyncWriteExt + Unpin,
{
    let obj_bytes = encode_to_vec(obj)?;
    conn_write.write_u64(obj_bytes.len() as u64).await?; // send length first
    conn_write.write_all(&obj_bytes[..]).await?;
    conn_write.flush().await?;
    Ok(())
}

/// Reads an object of type `T` from given readable connection.
///
/// Not cancellation-safe: must not be used as a `tokio::select!` branch that
/// may lose the race midway.
pub(crate) async fn tcp_read_obj<T, Conn>(
    conn_read: &mut Conn,
) -> Result<T, ShardKvError>
where
    T: DeserializeOwned,
    Conn: AsyncReadExt + Unpin,
{
    let obj_len = conn_read.read_u64().await?; // receive length first
    if obj_len > MAX_OBJ_LEN {
        return Err(ShardKvError::msg(format!(
            "framed object length {} too large",
            obj_len
        )));
    }
    let mut obj_buf: Vec<u8> = vec![0; obj_len as usize];
    conn_read.read_exact(&mut obj_buf[..]).await?;
    let obj = decode_from_slice(&obj_buf)?;
    Ok(obj)
}
