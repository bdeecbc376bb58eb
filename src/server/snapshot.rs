//! Snapshot codec of the replicated group state.
//!
//! Fields are written back-to-back as separate MessagePack values in a fixed
//! order: dedup table, store, shard states, previous configuration, current
//! configuration, group memberships. Decoding stops at the first field that
//! is missing or unreadable and keeps the in-memory value of every field from
//! there on, so snapshots written by older versions with fewer trailing
//! fields still restore.

use std::io::Read;

use crate::server::ShardKvState;
use crate::utils::ShardKvError;

use serde::de::DeserializeOwned;

use rmp_serde::decode::from_read as decode_from_read;
use rmp_serde::encode::write as encode_write;

/// Number of fields a complete snapshot carries.
pub(crate) const SNAPSHOT_FIELDS: usize = 6;

/// Reads the next field, or `None` if the input is exhausted or malformed.
fn read_field<T, R>(rd: &mut R) -> Option<T>
where
    T: DeserializeOwned,
    R: Read,
{
    decode_from_read(rd).ok()
}

impl ShardKvState {
    /// Serializes the snapshot-worthy part of the state.
    pub(crate) fn encode_snapshot(&self) -> Result<Vec<u8>, ShardKvError> {
        let mut buf = Vec::new();
        encode_write(&mut buf, &self.dedup)?;
        encode_write(&mut buf, &self.kv)?;
        encode_write(&mut buf, &self.shard_states)?;
        encode_write(&mut buf, &self.last_config)?;
        encode_write(&mut buf, &self.config)?;
        encode_write(&mut buf, &self.groups)?;
        Ok(buf)
    }

    /// Overwrites state fields from a snapshot, in order, for as many fields
    /// as the snapshot holds. Returns the number of fields restored.
    pub(crate) fn restore_snapshot(&mut self, data: &[u8]) -> usize {
        let mut rd = data;

        macro_rules! restore_fields {
            ($state:expr; $($field:ident),+) => {{
                let mut restored = 0;
                $({
                    match read_field(&mut rd) {
                        Some(v) => $state.$field = v,
                        None => return restored,
                    }
                    restored += 1;
                })+
                restored
            }};
        }

        restore_fields!(self; dedup, kv, shard_states, last_config, config, groups)
    }
}
