//! Common types, wire formats, and errors shared across the `ksp` crates.

pub mod error;
pub mod protocol;
pub mod secret;

pub use error::ProxyError;
pub use protocol::Status;
pub use secret::{ByteString, ObjectMeta, Secret, INJECT_ANNOTATION};
