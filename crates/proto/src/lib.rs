//! Resumable byte-stream layer for SSH servers.
//!
//! This crate wraps an SSH server so that a single logical SSH session
//! survives the death of its underlying TCP transport. A client whose
//! connection breaks can reconnect, re-authenticate cryptographically, and
//! have the server splice the new socket onto the same in-memory stream at
//! the exact byte offset where data flow was interrupted, losing no bytes
//! and injecting no duplicates in either direction.
//!
//! # Architecture
//!
//! The layer is built from the following pieces (see [`resume`]):
//!
//! 1. **Version probe** ([`resume::server`]) - sends the resumption banner
//!    carrying an ephemeral ECDH public key and sniffs the client prelude
//! 2. **Handshake** ([`resume::handshake`]) - P-256 key agreement and
//!    session-token derivation
//! 3. **Resumable connection** ([`resume::conn`]) - the ring-buffered
//!    reliable stream handed to the inner SSH server
//! 4. **Session registry** ([`resume::registry`]) - token to connection map
//!    with detached-timeout eviction
//! 5. **Data-plane framing** ([`resume::frame`]) - DATA/ACK/CLOSE frames
//!    exchanged once a transport is attached
//!
//! # Security
//!
//! - Ephemeral key agreement uses vetted primitives (`ring`)
//! - Token comparison is constant time (`subtle`)
//! - Derived secrets are zeroized after use (`zeroize`)
//! - No `unsafe` code
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use limpet_proto::resume::{ResumableSshServer, ResumeConfig};
//! use tokio::net::TcpListener;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let server = Arc::new(ResumableSshServer::new(
//!     Arc::new(|stream| {
//!         Box::pin(async move {
//!             // hand `stream` to the inner SSH server
//!             let _ = stream;
//!         })
//!     }),
//!     "host-1".to_string(),
//!     ResumeConfig::default(),
//! ));
//!
//! let listener = TcpListener::bind("127.0.0.1:2222").await?;
//! loop {
//!     let (socket, _) = listener.accept().await?;
//!     let server = Arc::clone(&server);
//!     tokio::spawn(async move { server.handle_connection(socket).await });
//! }
//! # }
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod resume;
