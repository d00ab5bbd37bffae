//! Structured logging setup.
//!
//! # Telemetry invariants
//!
//! - **No secret material** (data values, ciphertext, private keys, bearer
//!   tokens) may appear in any log field.
//! - Log level comes from `RUST_LOG` when set, otherwise from
//!   `KSP_PROXY_LOG_LEVEL` (default: `info`, `debug` with `--verbose`).

pub mod init;

pub use init::init;
