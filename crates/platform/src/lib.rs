//! Shared platform types for the limpet resumable-SSH layer.
//!
//! The protocol crates agree on one error surface, [`LimpetError`], whose
//! variants encode the layer's failure policy: transport faults detach,
//! protocol violations kill the session, handshake failures close the
//! socket with a marker byte. See [`error`] for the full taxonomy.
//!
//! # Examples
//!
//! ```
//! use limpet_platform::{LimpetError, LimpetResult};
//!
//! fn reject_resume(token_hex: &str) -> LimpetResult<()> {
//!     Err(LimpetError::Closed(format!("session {} is closed", token_hex)))
//! }
//!
//! let err = reject_resume("a1b2").unwrap_err();
//! assert_eq!(err.to_string(), "session closed: session a1b2 is closed");
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod error;

pub use error::{LimpetError, LimpetResult};

/// Platform version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
