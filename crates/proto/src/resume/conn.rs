//! The resumable connection: a byte stream that outlives its transports.
//!
//! A [`ResumableConn`] impersonates a bidirectional reliable stream toward
//! the inner SSH server while, underneath, transports (TCP sockets) come
//! and go. Bytes written on one side are observed in order, without loss or
//! duplication, on the other side, across arbitrarily many transport
//! swaps. That property rests on three pieces:
//!
//! - the paired ring-buffer halves ([`super::buffer`]), which hold every
//!   unacknowledged byte;
//! - the attach/detach state machine below, which guarantees at most one
//!   live transport and re-arms the detachment timer whenever the session
//!   has none;
//! - the transport pump tasks, which exchange replay positions on attach
//!   and then move DATA/ACK/CLOSE frames until the socket dies.
//!
//! Transport failure is invisible to the inner SSH server: its reads and
//! writes simply block until a new transport attaches or the detached
//! timeout destroys the session.

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use limpet_platform::{LimpetError, LimpetResult};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{Mutex as AsyncMutex, Notify};
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::resume::buffer::{RecvHalf, SendHalf};
use crate::resume::config::ResumeConfig;
use crate::resume::frame::{self, Frame, MAX_DATA_PAYLOAD};
use crate::resume::handshake::SessionToken;
use crate::resume::identity::BotIdentity;
use crate::resume::peek::{is_ok_network_error, PeekStream};
use crate::resume::registry::RegistryHook;

/// Bounded wait for an evicted transport's tasks to exit.
const EVICT_WAIT: Duration = Duration::from_secs(5);

/// Bounded wait for the close marker to drain during an orderly close.
const CLOSE_DRAIN_WAIT: Duration = Duration::from_secs(5);

/// Transport currently bound to a session.
struct TransportHandle {
    shutdown: Arc<Notify>,
    remote: Option<SocketAddr>,
}

/// Attachment state, guarded by an async mutex because attach awaits the
/// eviction of an incumbent while holding its place in line.
struct AttachState {
    /// Bumped on every successful attach; a pump task acts only while its
    /// generation is current.
    generation: u64,
    transport: Option<TransportHandle>,
    /// Bumped whenever the detachment timer is stopped or re-armed, so a
    /// stale timer task cannot kill a reattached session.
    timer_epoch: u64,
    closed: bool,
}

struct Shared {
    token: SessionToken,
    config: ResumeConfig,
    send: Mutex<SendHalf>,
    recv: Mutex<RecvHalf>,
    state: AsyncMutex<AttachState>,
    /// Signalled every time a transport fully detaches.
    detach_notify: Notify,
    addrs: Mutex<(Option<SocketAddr>, Option<SocketAddr>)>,
    identity: Mutex<Option<BotIdentity>>,
    registry: Arc<dyn RegistryHook>,
    server_version: String,
}

/// Handle to a resumable session's shared state.
///
/// Clones are cheap and refer to the same session. The handle implements
/// [`AsyncRead`] and [`AsyncWrite`] with reliable-stream semantics: reads
/// return EOF only after the peer's orderly close (or session death) and
/// writes block while the send buffer is full.
#[derive(Clone)]
pub struct ResumableConn {
    shared: Arc<Shared>,
}

impl ResumableConn {
    /// Creates a session in the detached state with its timer armed.
    ///
    /// The first [`attach`](Self::attach) stops the timer; if no transport
    /// ever attaches, the timer destroys the session.
    pub(crate) fn new(
        token: SessionToken,
        config: ResumeConfig,
        registry: Arc<dyn RegistryHook>,
        server_version: String,
    ) -> Self {
        let conn = Self {
            shared: Arc::new(Shared {
                token,
                config,
                send: Mutex::new(SendHalf::new(config.send_buffer_capacity)),
                recv: Mutex::new(RecvHalf::new(config.recv_buffer_capacity)),
                state: AsyncMutex::new(AttachState {
                    generation: 0,
                    transport: None,
                    timer_epoch: 0,
                    closed: false,
                }),
                detach_notify: Notify::new(),
                addrs: Mutex::new((None, None)),
                identity: Mutex::new(None),
                registry,
                server_version,
            }),
        };
        conn.spawn_detach_timer(0);
        conn
    }

    /// The session token this connection is registered under.
    pub fn token(&self) -> SessionToken {
        self.shared.token
    }

    /// Local address of the most recent transport.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.shared.addrs.lock().unwrap().0
    }

    /// Remote address of the most recent transport; may change over the
    /// session lifetime.
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.shared.addrs.lock().unwrap().1
    }

    /// The identification line committed on the wire for this session.
    pub fn server_version(&self) -> &str {
        self.shared.server_version.trim_end_matches("\r\n")
    }

    /// Records the identity the inner SSH server authenticated.
    pub fn set_identity(&self, identity: BotIdentity) {
        *self.shared.identity.lock().unwrap() = Some(identity);
    }

    /// The identity recorded for this session, if any.
    pub fn identity(&self) -> Option<BotIdentity> {
        self.shared.identity.lock().unwrap().clone()
    }

    /// Whether a transport is currently attached.
    pub async fn attached(&self) -> bool {
        self.shared.state.lock().await.transport.is_some()
    }

    /// Whether the session has been closed or destroyed.
    pub async fn closed(&self) -> bool {
        self.shared.state.lock().await.closed
    }

    /// Binds a fresh transport to the session.
    ///
    /// Any incumbent transport is detached first: its tasks are signalled
    /// and given a bounded wait to exit, which resolves the common case of
    /// a zombified old transport lingering while the client reconnects.
    /// The replay-position exchange then runs on the new socket: each side
    /// sends the count of bytes it has received so far, trims its send
    /// buffer below the peer's position, and retransmits from there.
    pub(crate) async fn attach(&self, mut stream: PeekStream<TcpStream>) -> LimpetResult<()> {
        let local = stream.get_ref().local_addr().ok();
        let remote = stream.get_ref().peer_addr().ok();

        let (generation, shutdown) = loop {
            let mut notified = std::pin::pin!(self.shared.detach_notify.notified());
            notified.as_mut().enable();
            {
                let mut state = self.shared.state.lock().await;
                if state.closed {
                    return Err(LimpetError::Closed(format!(
                        "session {} is closed",
                        self.shared.token
                    )));
                }
                match &state.transport {
                    None => {
                        state.generation += 1;
                        state.timer_epoch += 1;
                        let shutdown = Arc::new(Notify::new());
                        state.transport = Some(TransportHandle {
                            shutdown: Arc::clone(&shutdown),
                            remote,
                        });

                        let mut addrs = self.shared.addrs.lock().unwrap();
                        if let (Some(prev), Some(new)) = (addrs.1, remote) {
                            if prev.ip() != new.ip() {
                                info!(
                                    "Session {} reattached from {} (previously {})",
                                    self.shared.token, new, prev
                                );
                            }
                        }
                        addrs.0 = local.or(addrs.0);
                        addrs.1 = remote.or(addrs.1);

                        break (state.generation, shutdown);
                    }
                    Some(incumbent) => {
                        debug!(
                            "Evicting incumbent transport of session {} (remote {:?})",
                            self.shared.token, incumbent.remote
                        );
                        incumbent.shutdown.notify_waiters();
                    }
                }
            }

            if timeout(EVICT_WAIT, &mut notified).await.is_err() {
                let mut state = self.shared.state.lock().await;
                if let Some(stale) = state.transport.take() {
                    warn!(
                        "Forcibly detaching unresponsive transport of session {}",
                        self.shared.token
                    );
                    stale.shutdown.notify_waiters();
                    state.generation += 1;
                }
            }
        };

        // Replay-position exchange. On I/O failure the session goes back to
        // detached; on an impossible position the peer is lying and the
        // session is destroyed.
        let result = self.exchange_positions(&mut stream).await;
        let start_cursor = match result {
            Ok(cursor) => cursor,
            Err(LimpetError::Io(e)) => {
                debug!(
                    "Replay exchange failed on session {}: {}",
                    self.shared.token, e
                );
                self.detach(generation).await;
                return Err(LimpetError::Io(e));
            }
            Err(e) => {
                warn!(
                    "Invalid replay position on session {}: {}",
                    self.shared.token, e
                );
                self.destroy("invalid replay position").await;
                return Err(e);
            }
        };

        self.shared.recv.lock().unwrap().on_attach();

        let (rd, wr) = tokio::io::split(stream);
        let reader = self.clone();
        let writer = self.clone();
        let reader_shutdown = Arc::clone(&shutdown);
        tokio::spawn(async move { reader.run_reader(rd, generation, reader_shutdown).await });
        tokio::spawn(async move { writer.run_writer(wr, generation, shutdown, start_cursor).await });

        info!(
            "Transport attached to session {} (remote {:?})",
            self.shared.token, remote
        );
        Ok(())
    }

    /// Sends our receive count, reads the peer's, and trims the send
    /// buffer accordingly. Returns the transmit cursor for the new
    /// transport writer.
    async fn exchange_positions(&self, stream: &mut PeekStream<TcpStream>) -> LimpetResult<u64> {
        let received = self.shared.recv.lock().unwrap().received();
        stream.write_u64(received).await?;
        stream.flush().await?;
        let peer_received = stream.read_u64().await?;

        let mut send = self.shared.send.lock().unwrap();
        if peer_received > send.write_offset() {
            return Err(LimpetError::Protocol(format!(
                "peer claims {} bytes received, only {} were written",
                peer_received,
                send.write_offset()
            )));
        }
        // Everything below the peer's position counts as acknowledged,
        // even bytes no ACK frame ever covered.
        send.ack(peer_received)?;
        Ok(peer_received.max(send.peer_acked()))
    }

    /// Unbinds the transport of `generation`, if it is still the current
    /// one, and re-arms the detachment timer. Idempotent per generation:
    /// the reader and writer task both call this on exit.
    async fn detach(&self, generation: u64) {
        {
            let mut state = self.shared.state.lock().await;
            if state.generation != generation || state.transport.is_none() {
                self.shared.detach_notify.notify_waiters();
                return;
            }
            let handle = state.transport.take().unwrap();
            // Make sure the sibling task exits too.
            handle.shutdown.notify_waiters();
            state.timer_epoch += 1;
            let epoch = state.timer_epoch;
            if !state.closed {
                self.spawn_detach_timer(epoch);
            }
        }
        self.shared.detach_notify.notify_waiters();
        debug!("Transport detached from session {}", self.shared.token);
    }

    fn spawn_detach_timer(&self, epoch: u64) {
        let conn = self.clone();
        let grace = self.shared.config.detached_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            conn.expire(epoch).await;
        });
    }

    /// Fires when the detached timeout elapses; destroys the session
    /// unless a transport reattached (which bumped the epoch) in time.
    async fn expire(&self, epoch: u64) {
        let expired = self
            .destroy_if("detached timeout expired", true, |state| {
                state.timer_epoch == epoch && state.transport.is_none()
            })
            .await;
        if expired {
            info!(
                "Session {} had no transport for {:?}, closing",
                self.shared.token, self.shared.config.detached_timeout
            );
        }
    }

    /// Marks the connection closed, drains pending sends best-effort, then
    /// destroys it and removes it from the registry.
    pub async fn close(&self) {
        self.shared.send.lock().unwrap().mark_closed();
        // Without a transport there is nothing to drain into.
        if self.attached().await {
            let _ = timeout(CLOSE_DRAIN_WAIT, self.drained()).await;
        }
        self.destroy("closed by the inner SSH server").await;
    }

    /// Resolves once the close marker has gone out (or the session died).
    async fn drained(&self) {
        std::future::poll_fn(|cx| {
            let mut send = self.shared.send.lock().unwrap();
            if send.is_dead() || send.close_sent() {
                Poll::Ready(())
            } else {
                send.register_writer(cx);
                Poll::Pending
            }
        })
        .await
    }

    async fn destroy(&self, reason: &str) {
        self.destroy_if(reason, true, |_| true).await;
    }

    /// Tears down a connection that was never registered, leaving whatever
    /// session currently owns the token untouched in the registry.
    pub(crate) async fn abandon(&self) {
        self.destroy_if("abandoned before registration", false, |_| true)
            .await;
    }

    /// Destroys the session if `check` still holds under the state lock:
    /// fails every blocked operation, refuses future attachments, and
    /// (unless abandoned) removes the registry entry.
    async fn destroy_if(
        &self,
        reason: &str,
        remove_from_registry: bool,
        check: impl FnOnce(&AttachState) -> bool,
    ) -> bool {
        {
            let mut state = self.shared.state.lock().await;
            if state.closed || !check(&state) {
                return false;
            }
            state.closed = true;
            state.timer_epoch += 1;
            if let Some(handle) = state.transport.take() {
                handle.shutdown.notify_waiters();
            }
        }
        self.shared.send.lock().unwrap().mark_dead();
        self.shared.recv.lock().unwrap().mark_dead();
        self.shared.detach_notify.notify_waiters();
        if remove_from_registry {
            self.shared.registry.remove_session(&self.shared.token);
        }
        debug!("Session {} destroyed: {}", self.shared.token, reason);
        true
    }

    /// Transport reader: parses inbound frames and feeds the receive half.
    async fn run_reader(
        self,
        mut rd: ReadHalf<PeekStream<TcpStream>>,
        generation: u64,
        shutdown: Arc<Notify>,
    ) {
        loop {
            let result = tokio::select! {
                _ = shutdown.notified() => break,
                result = frame::read_frame(&mut rd) => result,
            };

            match result {
                Ok(Frame::Data { offset, payload }) => {
                    let absorbed = self.shared.recv.lock().unwrap().absorb(offset, &payload);
                    if let Err(e) = absorbed {
                        warn!("Protocol violation on session {}: {}", self.shared.token, e);
                        self.destroy("protocol violation").await;
                        break;
                    }
                }
                Ok(Frame::Ack { offset }) => {
                    let acked = self.shared.send.lock().unwrap().ack(offset);
                    if let Err(e) = acked {
                        warn!("Protocol violation on session {}: {}", self.shared.token, e);
                        self.destroy("protocol violation").await;
                        break;
                    }
                }
                Ok(Frame::Close) => {
                    debug!("Peer closed its direction of session {}", self.shared.token);
                    self.shared.recv.lock().unwrap().mark_remote_closed();
                }
                Err(LimpetError::Io(e)) => {
                    if is_ok_network_error(&e) {
                        debug!("Transport of session {} went away: {}", self.shared.token, e);
                    } else {
                        warn!("Transport read error on session {}: {}", self.shared.token, e);
                    }
                    break;
                }
                Err(e) => {
                    warn!("Protocol violation on session {}: {}", self.shared.token, e);
                    self.destroy("protocol violation").await;
                    break;
                }
            }
        }
        self.detach(generation).await;
    }

    /// Transport writer: drains the send half into DATA frames, emits ACKs
    /// for delivered bytes, and sends the close marker when the local side
    /// has finished.
    async fn run_writer(
        self,
        mut wr: WriteHalf<PeekStream<TcpStream>>,
        generation: u64,
        shutdown: Arc<Notify>,
        mut cursor: u64,
    ) {
        let mut ack_timer = interval(self.shared.config.ack_max_interval);
        ack_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ack_timer.tick().await; // the first tick is immediate

        loop {
            let cur = cursor;
            let pump = std::future::poll_fn(|cx| self.poll_pump_work(cx, cur));

            let work = tokio::select! {
                _ = shutdown.notified() => break,
                work = pump => work,
                _ = ack_timer.tick() => {
                    match self.shared.recv.lock().unwrap().ack_pending() {
                        Some(offset) => PumpWork::Ack(offset),
                        None => continue,
                    }
                }
            };

            let written = match work {
                PumpWork::Data { offset, chunk } => {
                    let end = offset + chunk.len() as u64;
                    let frame = Frame::Data {
                        offset,
                        payload: chunk,
                    };
                    let result = frame::write_frame(&mut wr, &frame).await;
                    if result.is_ok() {
                        cursor = end;
                    }
                    result
                }
                PumpWork::Ack(offset) => {
                    let result = frame::write_frame(&mut wr, &Frame::Ack { offset }).await;
                    if result.is_ok() {
                        self.shared.recv.lock().unwrap().mark_acked(offset);
                    }
                    result
                }
                PumpWork::Close => {
                    let result = frame::write_frame(&mut wr, &Frame::Close).await;
                    if result.is_ok() {
                        self.shared.send.lock().unwrap().mark_close_sent();
                    }
                    result
                }
                PumpWork::Dead => break,
            };

            if let Err(e) = written {
                match e {
                    LimpetError::Io(e) if is_ok_network_error(&e) => {
                        debug!("Transport of session {} went away: {}", self.shared.token, e);
                    }
                    e => {
                        warn!("Transport write error on session {}: {}", self.shared.token, e);
                    }
                }
                break;
            }
        }
        self.detach(generation).await;
    }

    /// Finds the writer's next unit of work, registering with both buffer
    /// halves when there is none. Lock order: send half, then receive half,
    /// never nested.
    fn poll_pump_work(&self, cx: &mut Context<'_>, cursor: u64) -> Poll<PumpWork> {
        {
            let mut send = self.shared.send.lock().unwrap();
            if send.is_dead() {
                return Poll::Ready(PumpWork::Dead);
            }
            if let Some((offset, chunk)) = send.chunk_from(
                cursor,
                MAX_DATA_PAYLOAD,
                self.shared.config.recv_buffer_capacity,
            ) {
                return Poll::Ready(PumpWork::Data { offset, chunk });
            }
            if send.is_closed() && !send.close_sent() && cursor == send.write_offset() {
                return Poll::Ready(PumpWork::Close);
            }
            send.register_pump(cx);
        }
        {
            let mut recv = self.shared.recv.lock().unwrap();
            if recv.is_dead() {
                return Poll::Ready(PumpWork::Dead);
            }
            if let Some(offset) = recv.ack_due(self.shared.config.ack_threshold) {
                return Poll::Ready(PumpWork::Ack(offset));
            }
            recv.register_pump(cx);
        }
        Poll::Pending
    }
}

enum PumpWork {
    Data { offset: u64, chunk: Bytes },
    Ack(u64),
    Close,
    Dead,
}

impl AsyncRead for ResumableConn {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        self.shared.recv.lock().unwrap().poll_read(cx, buf)
    }
}

impl AsyncWrite for ResumableConn {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.shared.send.lock().unwrap().poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        // Writes are durable once buffered; there is no further flush.
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        // Refuse further writes immediately; the orderly close (drain the
        // marker, destroy, deregister) completes in the background.
        self.shared.send.lock().unwrap().mark_closed();
        let conn = self.clone();
        tokio::spawn(async move { conn.close().await });
        Poll::Ready(Ok(()))
    }
}

impl std::fmt::Debug for ResumableConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResumableConn")
            .field("token", &self.shared.token.to_string())
            .finish_non_exhaustive()
    }
}
