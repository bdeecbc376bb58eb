//! Helper utilities, functions, and macros.

#[macro_use]
mod print;

#[macro_use]
mod config;

mod error;
mod safetcp;

pub use error::ShardKvError;
pub use print::logger_init;

pub(crate) use safetcp::{tcp_read_obj, tcp_write_obj, MAX_OBJ_LEN};
