//! Client-side library routing key operations to the owning group.

mod clerk;

pub use clerk::Clerk;

/// Client ID type.
pub type ClientId = u64;
