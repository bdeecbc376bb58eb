//! Customized unified error type.

use std::error;
use std::fmt;
use std::io;
use std::net;
use std::num;

/// Prefix marking an error as a broken cross-group protocol invariant.
const VIOLATION_PREFIX: &str = "protocol violation: ";

/// Customized error type for the sharded key-value store.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct ShardKvError(pub(crate) String);

impl ShardKvError {
    pub fn msg(msg: impl ToString) -> Self {
        ShardKvError(msg.to_string())
    }

    /// A peer answered in a way this group's configuration ordering says is
    /// impossible. Never retried; halts the worker that observed it.
    pub fn protocol_violation(msg: impl ToString) -> Self {
        ShardKvError(format!("{}{}", VIOLATION_PREFIX, msg.to_string()))
    }

    pub fn is_protocol_violation(&self) -> bool {
        self.0.starts_with(VIOLATION_PREFIX)
    }
}

impl fmt::Display for ShardKvError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0) // do not display literal quotes
    }
}

impl error::Error for ShardKvError {}

// Helper macro for saving boiler-plate `impl From<X>`s for transparent
// conversion from various common error types to `ShardKvError`.
macro_rules! impl_from_error {
    ($error:ty) => {
        impl From<$error> for ShardKvError {
            fn from(e: $error) -> Self {
                // just store the source error's string representation
                ShardKvError(e.to_string())
            }
        }
    };
}

// Helper macro for saving boiler-plate `impl From<X<T>>`s for transparent
// conversion from various common generic error types to `ShardKvError`.
macro_rules! impl_from_error_generic {
    ($error:ty) => {
        impl<T> From<$error> for ShardKvError {
            fn from(e: $error) -> ShardKvError {
                ShardKvError::msg(e.to_string())
            }
        }
    };
}

impl_from_error!(io::Error);
impl_from_error!(num::ParseIntError);
impl_from_error!(net::AddrParseError);
impl_from_error!(rmp_serde::encode::Error);
impl_from_error!(rmp_serde::decode::Error);
impl_from_error!(toml::de::Error);
impl_from_error!(ctrlc::Error);
impl_from_error!(tokio::time::error::Elapsed);
impl_from_error!(tokio::task::JoinError);

impl_from_error_generic!(tokio::sync::watch::error::SendError<T>);
impl_from_error_generic!(tokio::sync::mpsc::error::SendError<T>);
