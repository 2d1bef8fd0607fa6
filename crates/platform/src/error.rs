//! Error taxonomy for the resumption layer.
//!
//! The variants mirror how the layer reacts to failure, because callers
//! dispatch on them:
//!
//! - [`LimpetError::Io`] is a transport fault. The transport tasks detach
//!   and the session survives, awaiting reattachment.
//! - [`LimpetError::Protocol`] means the peer broke the resumption wire
//!   protocol (impossible offsets, malformed frames). The peer proved
//!   knowledge of the session secret, so a violation is corruption or
//!   malice and the whole session is destroyed.
//! - [`LimpetError::Security`] covers the handshake path: failed key
//!   agreement, an unverifiable token claim, a refused authorization. The
//!   socket gets a marker byte and is closed; no session is touched.
//! - [`LimpetError::Closed`] is returned to callers racing a session that
//!   already ended, by orderly close or detached-timeout expiry.
//! - [`LimpetError::Config`] rejects invalid tunables or identity records
//!   before they reach a live session.

use std::fmt;

/// Error type shared across the resumption layer.
#[derive(Debug)]
pub enum LimpetError {
    /// The transport failed mid-operation. Detaches the transport; the
    /// session and its buffers persist.
    Io(std::io::Error),

    /// The peer violated the resumption protocol. Fatal to the session.
    Protocol(String),

    /// Handshake or authorization failure: bad key material, a token
    /// claim that does not unmask, a refused peer.
    Security(String),

    /// The session is closed; no further attachments or writes.
    Closed(String),

    /// Rejected configuration or identity record.
    Config(String),
}

impl fmt::Display for LimpetError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LimpetError::Io(e) => write!(f, "transport error: {}", e),
            LimpetError::Protocol(msg) => write!(f, "protocol violation: {}", msg),
            LimpetError::Security(msg) => write!(f, "handshake refused: {}", msg),
            LimpetError::Closed(msg) => write!(f, "session closed: {}", msg),
            LimpetError::Config(msg) => write!(f, "invalid configuration: {}", msg),
        }
    }
}

impl std::error::Error for LimpetError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            LimpetError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for LimpetError {
    fn from(err: std::io::Error) -> Self {
        LimpetError::Io(err)
    }
}

/// Result type used throughout the resumption layer.
pub type LimpetResult<T> = Result<T, LimpetError>;
