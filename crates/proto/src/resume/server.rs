//! SSH server wrapper with connection resumption.
//!
//! [`ResumableSshServer`] wraps an inner SSH server (any consumer of a
//! bidirectional byte stream) so that its sessions survive transport
//! death. Every accepted socket first receives the resumption banner with
//! a fresh ephemeral public key; the wrapper then sniffs the client's
//! first bytes. Legacy SSH clients are handed back wrapped so the banner
//! is not sent twice. Clients that sent the resumption prelude continue
//! into the handshake and are spliced onto a new or existing
//! [`ResumableConn`].

use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;

use limpet_platform::{LimpetError, LimpetResult};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, error, info, warn};

use crate::resume::config::ResumeConfig;
use crate::resume::conn::ResumableConn;
use crate::resume::handshake::{
    HandshakeSecret, ServerHandshakeKey, SessionToken, ERR_HANDSHAKE, ERR_NO_SUCH_SESSION,
    TOKEN_LEN,
};
use crate::resume::identity::{AllowAllAuthorizer, SessionAuthorizer};
use crate::resume::peek::{is_ok_network_error, BannerSkipStream, PeekStream};
use crate::resume::registry::{RegistryHook, SessionRegistry};
use crate::resume::version::{self, client_prelude, ECDH_P256_UNCOMPRESSED_LEN};

/// Byte stream handed to the inner SSH server.
///
/// Both the legacy passthrough and the resumable connection present this
/// interface: an async bidirectional stream plus the addresses of the
/// (current) underlying socket and, where the wrapper has already
/// committed an identification line on the wire, the exact line the inner
/// SSH server must present as its own.
pub trait SessionIo: AsyncRead + AsyncWrite + Send + Unpin {
    /// Local address of the underlying socket, if known.
    fn local_addr(&self) -> Option<SocketAddr>;

    /// Remote address of the underlying socket; for resumable sessions it
    /// may change over the session lifetime.
    fn remote_addr(&self) -> Option<SocketAddr>;

    /// The identification line (without CRLF) the inner SSH server must
    /// use, when one is already committed on the wire.
    fn server_version_override(&self) -> Option<String> {
        None
    }
}

/// Boxed [`SessionIo`] stream.
pub type SessionStream = Box<dyn SessionIo>;

/// The inner SSH server, as an async callback consuming one session
/// stream.
pub type SshServerHandler =
    Arc<dyn Fn(SessionStream) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

impl SessionIo for BannerSkipStream<PeekStream<TcpStream>> {
    fn local_addr(&self) -> Option<SocketAddr> {
        BannerSkipStream::local_addr(self)
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        BannerSkipStream::remote_addr(self)
    }

    fn server_version_override(&self) -> Option<String> {
        let line = self.server_version();
        if line.is_empty() {
            None
        } else {
            Some(line.to_string())
        }
    }
}

impl SessionIo for ResumableConn {
    fn local_addr(&self) -> Option<SocketAddr> {
        ResumableConn::local_addr(self)
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        ResumableConn::remote_addr(self)
    }

    fn server_version_override(&self) -> Option<String> {
        Some(self.server_version().to_string())
    }
}

/// Decision produced by the version probe.
pub enum ProbeOutcome {
    /// The socket was consumed by the resumption path.
    Hijacked,
    /// A legacy SSH client; hand the wrapped socket to the inner server.
    Passthrough(SessionStream),
}

/// Wraps an SSH server so its connections can be resumed.
///
/// One wrapper owns one [`SessionRegistry`]; sessions that stay without a
/// transport for the configured detached timeout are forcibly closed.
pub struct ResumableSshServer {
    handler: SshServerHandler,
    host_id: String,
    config: ResumeConfig,
    registry: Arc<SessionRegistry>,
    authorizer: Arc<dyn SessionAuthorizer>,
}

impl ResumableSshServer {
    /// Creates a wrapper around the given inner SSH server.
    ///
    /// # Arguments
    ///
    /// * `handler` - the inner SSH server, invoked once per session stream
    /// * `host_id` - opaque ASCII host identifier quoted in the banner
    /// * `config` - resumption tunables
    pub fn new(handler: SshServerHandler, host_id: String, config: ResumeConfig) -> Self {
        Self {
            handler,
            host_id,
            config,
            registry: Arc::new(SessionRegistry::new()),
            authorizer: Arc::new(AllowAllAuthorizer),
        }
    }

    /// Replaces the session authorizer.
    pub fn with_authorizer(mut self, authorizer: Arc<dyn SessionAuthorizer>) -> Self {
        self.authorizer = authorizer;
        self
    }

    /// Number of live resumable sessions.
    pub fn session_count(&self) -> usize {
        self.registry.len()
    }

    /// Runs one accepted socket through probe, handshake, and dispatch.
    ///
    /// Never returns an error: failures close the socket and are logged at
    /// a level matching their severity.
    pub async fn handle_connection(&self, stream: TcpStream) {
        match self.probe(stream).await {
            Ok(ProbeOutcome::Hijacked) => {}
            Ok(ProbeOutcome::Passthrough(session)) => {
                debug!("Returning non-resumable connection to the inner SSH server");
                (self.handler)(session).await;
            }
            Err(LimpetError::Io(e)) if is_ok_network_error(&e) => {
                debug!("Connection went away during detection: {}", e);
            }
            Err(e) => {
                warn!("Error while handling connection: {}", e);
            }
        }
    }

    /// Writes the banner, sniffs the client's first bytes, and decides the
    /// socket's fate.
    ///
    /// Returns [`ProbeOutcome::Hijacked`] when the resumption path consumed
    /// the socket, or [`ProbeOutcome::Passthrough`] with the wrapped socket
    /// for the inner SSH server. Dropping the socket on error closes it.
    pub async fn probe(&self, mut stream: TcpStream) -> LimpetResult<ProbeOutcome> {
        let local = stream.local_addr().ok();
        let remote = stream.peer_addr().ok();

        let key = match ServerHandshakeKey::generate() {
            Ok(key) => key,
            Err(e) => {
                error!(
                    "Failed to generate handshake key, proceeding without resumption (this is a bug): {}",
                    e
                );
                let banner = version::plain_banner();
                stream.write_all(banner.as_bytes()).await?;
                let peeked = PeekStream::new(stream);
                return Ok(ProbeOutcome::Passthrough(Box::new(BannerSkipStream::new(
                    peeked, banner, local, remote,
                ))));
            }
        };

        let banner = version::server_banner(key.public_bytes(), &self.host_id);
        stream.write_all(banner.as_bytes()).await?;

        let mut peeked = PeekStream::new(stream);
        if peeked.peek_prelude(client_prelude()).await? {
            peeked.discard(client_prelude().len());
            debug!("Proceeding with connection resumption exchange");
            self.resumption_exchange(peeked, key, banner).await?;
            Ok(ProbeOutcome::Hijacked)
        } else {
            Ok(ProbeOutcome::Passthrough(Box::new(BannerSkipStream::new(
                peeked, banner, local, remote,
            ))))
        }
    }

    /// Completes the key agreement and dispatches to the new-session or
    /// resumption path.
    async fn resumption_exchange(
        &self,
        mut stream: PeekStream<TcpStream>,
        key: ServerHandshakeKey,
        banner: String,
    ) -> LimpetResult<()> {
        let remote = stream.get_ref().peer_addr().ok();

        let mut client_public = [0u8; ECDH_P256_UNCOMPRESSED_LEN];
        stream.read_exact(&mut client_public).await?;
        let mut wire_token = [0u8; TOKEN_LEN];
        stream.read_exact(&mut wire_token).await?;

        let secret = match key.agree(&client_public) {
            Ok(secret) => secret,
            Err(e) => {
                warn!("Resumption handshake failed for {:?}: {}", remote, e);
                let _ = stream.write_all(&[ERR_HANDSHAKE]).await;
                return Err(e);
            }
        };

        let declared = secret.unmask(&wire_token);
        if !declared.is_zero() {
            return self.resume_existing(stream, &secret, declared).await;
        }

        // New session.
        if let Err(e) = self.authorizer.authorize_new(remote).await {
            warn!("New resumable session refused for {:?}: {}", remote, e);
            let _ = stream.write_all(&[ERR_HANDSHAKE]).await;
            return Err(e);
        }

        let token = secret.token();
        if self.registry.lookup(&token).is_some() {
            warn!(
                "Derived token {} collides with a live session, treating as resumption",
                token
            );
            return self.resume_existing(stream, &secret, token).await;
        }

        let conn = ResumableConn::new(
            token,
            self.config,
            Arc::clone(&self.registry) as Arc<dyn RegistryHook>,
            banner,
        );
        if self.registry.insert(token, conn.clone()).is_err() {
            // Lost a (vanishingly unlikely) race for the same token.
            conn.abandon().await;
            return self.resume_existing(stream, &secret, token).await;
        }

        stream.write_all(&secret.mask(&token)).await?;
        stream.flush().await?;
        info!("New resumable session {} from {:?}", token, remote);

        let handler = Arc::clone(&self.handler);
        let session: SessionStream = Box::new(conn.clone());
        tokio::spawn(async move { handler(session).await });

        conn.attach(stream).await
    }

    /// Reattaches a transport to a registered session.
    async fn resume_existing(
        &self,
        mut stream: PeekStream<TcpStream>,
        secret: &HandshakeSecret,
        token: SessionToken,
    ) -> LimpetResult<()> {
        let remote = stream.get_ref().peer_addr().ok();

        let conn = match self.registry.lookup(&token) {
            Some(conn) if !conn.closed().await => conn,
            _ => {
                info!("Resumption attempt for unknown session from {:?}", remote);
                let _ = stream.write_all(&[ERR_NO_SUCH_SESSION]).await;
                return Err(LimpetError::Security(
                    "resumption of unknown or closed session".to_string(),
                ));
            }
        };

        let identity = conn.identity();
        if let Err(e) = self
            .authorizer
            .authorize_resume(remote, identity.as_ref())
            .await
        {
            warn!("Resumption of session {} refused for {:?}: {}", token, remote, e);
            let _ = stream.write_all(&[ERR_HANDSHAKE]).await;
            return Err(e);
        }

        stream.write_all(&secret.mask(&token)).await?;
        stream.flush().await?;
        info!("Resuming session {} from {:?}", token, remote);
        conn.attach(stream).await
    }
}

impl std::fmt::Debug for ResumableSshServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResumableSshServer")
            .field("host_id", &self.host_id)
            .field("sessions", &self.registry.len())
            .finish_non_exhaustive()
    }
}
