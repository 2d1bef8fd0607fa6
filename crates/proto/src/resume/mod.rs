//! Connection resumption for SSH servers.
//!
//! An incoming socket first passes through the version probe
//! ([`ResumableSshServer::probe`]), which writes the server banner carrying
//! an ephemeral P-256 public key and peeks the client's first bytes. Legacy
//! SSH clients are handed back wrapped so the banner is not sent twice;
//! clients that send the resumption prelude continue into the handshake,
//! which derives a 16-byte session token from the ECDH shared secret and
//! either creates a new [`ResumableConn`] or reattaches an existing one from
//! the [`SessionRegistry`].
//!
//! Once attached, the transport carries length-prefixed DATA/ACK/CLOSE
//! frames ([`frame`]) between the paired ring buffers of the connection.
//! Transport failure detaches the connection; the session itself survives
//! until the detached timeout fires.

pub mod buffer;
pub mod config;
pub mod conn;
pub mod frame;
pub mod handshake;
pub mod identity;
pub mod peek;
pub mod registry;
pub mod server;
pub mod version;

pub use config::ResumeConfig;
pub use conn::ResumableConn;
pub use handshake::{HandshakeSecret, ServerHandshakeKey, SessionToken};
pub use identity::{AllowAllAuthorizer, BotIdentity, SessionAuthorizer};
pub use peek::{BannerSkipStream, PeekStream};
pub use registry::{RegistryHook, SessionRegistry};
pub use server::{
    ProbeOutcome, ResumableSshServer, SessionIo, SessionStream, SshServerHandler,
};
pub use version::{client_prelude, server_banner, SSH_VERSION_PREFIX};
