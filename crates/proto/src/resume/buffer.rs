//! Ring-buffer halves backing a resumable connection.
//!
//! Each connection owns one [`SendHalf`] (bytes produced locally, awaiting
//! acknowledgement by the peer) and one [`RecvHalf`] (bytes received from
//! the peer, awaiting delivery to the inner SSH server). Both are plain
//! data structures guarded by a `std::sync::Mutex` in the connection; all
//! blocking is expressed through waker registrations so that callers
//! survive transport swaps: a waiter is bound to buffer state, never to a
//! socket. Stream-side waiters queue in wait lists; the transport writer,
//! of which there is at most one, uses a single overwritten slot.
//!
//! Offsets are cumulative 64-bit byte counts over the lifetime of the
//! session. The send half holds exactly the bytes in
//! `[peer_acked, write_offset)`; the receive half holds exactly the bytes
//! in `[delivered, received)`.

use std::collections::VecDeque;
use std::io;
use std::task::{Context, Poll, Waker};

use bytes::Bytes;
use limpet_platform::{LimpetError, LimpetResult};
use tokio::io::ReadBuf;

fn closed_error() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "resumable connection is closed")
}

fn wake_all(wakers: &mut Vec<Waker>) {
    for waker in wakers.drain(..) {
        waker.wake();
    }
}

fn wake_slot(slot: &mut Option<Waker>) {
    if let Some(waker) = slot.take() {
        waker.wake();
    }
}

/// Outbound half: locally produced bytes not yet acknowledged by the peer.
#[derive(Debug)]
pub(crate) struct SendHalf {
    data: VecDeque<u8>,
    /// Total bytes ever written by the inner SSH server.
    write_offset: u64,
    /// Highest offset the peer has confirmed; bytes below it are gone.
    peer_acked: u64,
    capacity: usize,
    /// Local orderly close: no further writes are accepted.
    closed: bool,
    /// The transport writer has emitted the close marker.
    close_sent: bool,
    /// Session destroyed: every blocked operation fails.
    dead: bool,
    writer_wakers: Vec<Waker>,
    /// The transport writer; one task per attached transport, so a single
    /// slot that each registration overwrites.
    pump_waker: Option<Waker>,
}

impl SendHalf {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            data: VecDeque::with_capacity(capacity.min(64 * 1024)),
            write_offset: 0,
            peer_acked: 0,
            capacity,
            closed: false,
            close_sent: false,
            dead: false,
            writer_wakers: Vec::new(),
            pump_waker: None,
        }
    }

    /// Appends bytes from the inner SSH server, up to the free capacity.
    pub(crate) fn poll_write(&mut self, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        if self.dead || self.closed {
            return Poll::Ready(Err(closed_error()));
        }

        let space = self.capacity - self.data.len();
        if space == 0 {
            self.writer_wakers.push(cx.waker().clone());
            return Poll::Pending;
        }

        let n = space.min(buf.len());
        self.data.extend(&buf[..n]);
        self.write_offset += n as u64;
        debug_assert_eq!(self.data.len() as u64, self.write_offset - self.peer_acked);
        wake_slot(&mut self.pump_waker);
        Poll::Ready(Ok(n))
    }

    /// Advances the peer-ack offset, discarding acknowledged bytes.
    ///
    /// Non-advancing offsets are ignored: after a reattachment trim the
    /// peer's in-flight delivery acks can legitimately lag `peer_acked`.
    /// An offset beyond `write_offset` acknowledges bytes that were never
    /// sent and is a protocol violation.
    pub(crate) fn ack(&mut self, to: u64) -> LimpetResult<bool> {
        if to <= self.peer_acked {
            return Ok(false);
        }
        if to > self.write_offset {
            return Err(LimpetError::Protocol(format!(
                "ACK for offset {} beyond written offset {}",
                to, self.write_offset
            )));
        }

        self.data.drain(..(to - self.peer_acked) as usize);
        self.peer_acked = to;
        debug_assert_eq!(self.data.len() as u64, self.write_offset - self.peer_acked);
        wake_all(&mut self.writer_wakers);
        wake_slot(&mut self.pump_waker);
        Ok(true)
    }

    /// Copies up to `max` bytes starting at `cursor`, bounded by the peer's
    /// flow-control window. Returns the actual start offset with the bytes:
    /// a cursor below `peer_acked` (everything there was acknowledged while
    /// in flight) is resynced forward. `None` when nothing is sendable.
    pub(crate) fn chunk_from(
        &self,
        cursor: u64,
        max: usize,
        recv_capacity: usize,
    ) -> Option<(u64, Bytes)> {
        let cursor = cursor.max(self.peer_acked);
        debug_assert!(cursor <= self.write_offset);

        let window_end = self.peer_acked + recv_capacity as u64;
        let end = self.write_offset.min(window_end).min(cursor + max as u64);
        if end <= cursor {
            return None;
        }

        let start = (cursor - self.peer_acked) as usize;
        let len = (end - cursor) as usize;
        let chunk: Bytes = self
            .data
            .iter()
            .skip(start)
            .take(len)
            .copied()
            .collect::<Vec<u8>>()
            .into();
        Some((cursor, chunk))
    }

    pub(crate) fn register_pump(&mut self, cx: &mut Context<'_>) {
        match &self.pump_waker {
            Some(waker) if waker.will_wake(cx.waker()) => {}
            _ => self.pump_waker = Some(cx.waker().clone()),
        }
    }

    pub(crate) fn register_writer(&mut self, cx: &mut Context<'_>) {
        self.writer_wakers.push(cx.waker().clone());
    }

    /// Marks the local orderly close; pending data still drains.
    pub(crate) fn mark_closed(&mut self) {
        self.closed = true;
        wake_slot(&mut self.pump_waker);
        wake_all(&mut self.writer_wakers);
    }

    /// Records that the close marker went out on the wire.
    pub(crate) fn mark_close_sent(&mut self) {
        self.close_sent = true;
        wake_all(&mut self.writer_wakers);
    }

    /// Kills the half: every blocked and future operation fails.
    pub(crate) fn mark_dead(&mut self) {
        self.dead = true;
        wake_all(&mut self.writer_wakers);
        wake_slot(&mut self.pump_waker);
    }

    pub(crate) fn write_offset(&self) -> u64 {
        self.write_offset
    }

    pub(crate) fn peer_acked(&self) -> u64 {
        self.peer_acked
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed
    }

    pub(crate) fn is_dead(&self) -> bool {
        self.dead
    }

    pub(crate) fn close_sent(&self) -> bool {
        self.close_sent
    }

    pub(crate) fn buffered(&self) -> usize {
        self.data.len()
    }
}

/// Inbound half: bytes received from the peer, not yet delivered upstream.
#[derive(Debug)]
pub(crate) struct RecvHalf {
    data: VecDeque<u8>,
    /// Total bytes absorbed from the peer.
    received: u64,
    /// Total bytes handed to the inner SSH server.
    delivered: u64,
    /// Highest ACK offset sent to the peer.
    acked: u64,
    /// Offsets at or beyond this are a flow-control violation.
    absorb_limit: u64,
    capacity: usize,
    /// The peer sent its close marker; reads drain to EOF.
    remote_closed: bool,
    dead: bool,
    reader_wakers: Vec<Waker>,
    /// The transport writer waiting for an ack to become due; a single
    /// slot, overwritten on every registration.
    pump_waker: Option<Waker>,
}

impl RecvHalf {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            data: VecDeque::with_capacity(capacity.min(64 * 1024)),
            received: 0,
            delivered: 0,
            acked: 0,
            absorb_limit: capacity as u64,
            capacity,
            remote_closed: false,
            dead: false,
            reader_wakers: Vec::new(),
            pump_waker: None,
        }
    }

    /// Absorbs a DATA frame.
    ///
    /// Bytes below `received` are duplicates from a retransmission and are
    /// trimmed from the left; an offset above `received` (a gap) or a frame
    /// overrunning the flow-control window is a protocol violation.
    pub(crate) fn absorb(&mut self, offset: u64, payload: &[u8]) -> LimpetResult<()> {
        if offset > self.received {
            return Err(LimpetError::Protocol(format!(
                "DATA offset {} ahead of receive offset {}",
                offset, self.received
            )));
        }

        let end = offset + payload.len() as u64;
        if end <= self.received {
            // Entirely retransmitted bytes.
            return Ok(());
        }
        if end > self.absorb_limit {
            return Err(LimpetError::Protocol(format!(
                "DATA through offset {} overruns the flow-control window at {}",
                end, self.absorb_limit
            )));
        }

        let fresh = &payload[(self.received - offset) as usize..];
        self.data.extend(fresh);
        self.received = end;
        debug_assert_eq!(self.data.len() as u64, self.received - self.delivered);
        wake_all(&mut self.reader_wakers);
        Ok(())
    }

    /// Delivers buffered bytes to the inner SSH server.
    ///
    /// EOF (`Ready(Ok(()))` with nothing copied) is reported only once the
    /// peer has closed its direction and the buffer has drained, or the
    /// session is dead.
    pub(crate) fn poll_read(&mut self, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        if !self.data.is_empty() {
            let n = self.data.len().min(buf.remaining());
            let (front, back) = self.data.as_slices();
            let from_front = front.len().min(n);
            buf.put_slice(&front[..from_front]);
            if from_front < n {
                buf.put_slice(&back[..n - from_front]);
            }
            self.data.drain(..n);
            self.delivered += n as u64;
            self.absorb_limit = self.absorb_limit.max(self.delivered + self.capacity as u64);
            debug_assert_eq!(self.data.len() as u64, self.received - self.delivered);
            wake_slot(&mut self.pump_waker);
            return Poll::Ready(Ok(()));
        }

        if self.dead || self.remote_closed {
            return Poll::Ready(Ok(()));
        }

        self.reader_wakers.push(cx.waker().clone());
        Poll::Pending
    }

    /// Returns the next ACK offset if delivery progressed past `threshold`.
    ///
    /// `acked` can sit above `delivered` right after a reattachment (the
    /// replay exchange acknowledged the absorbed backlog wholesale), so the
    /// comparison saturates.
    pub(crate) fn ack_due(&self, threshold: usize) -> Option<u64> {
        if self.delivered > self.acked && self.delivered - self.acked >= threshold as u64 {
            Some(self.delivered)
        } else {
            None
        }
    }

    /// Returns an ACK offset for the periodic flush, if any progress is
    /// unacknowledged.
    pub(crate) fn ack_pending(&self) -> Option<u64> {
        if self.delivered > self.acked {
            Some(self.delivered)
        } else {
            None
        }
    }

    /// Records an emitted ACK; offsets sent to the peer stay strictly
    /// monotonic.
    pub(crate) fn mark_acked(&mut self, to: u64) {
        debug_assert!(to >= self.acked);
        self.acked = to;
    }

    /// Resets ack bookkeeping and the flow-control window for a freshly
    /// attached transport. The peer treats everything below `received` as
    /// acknowledged after the replay exchange.
    pub(crate) fn on_attach(&mut self) {
        self.acked = self.acked.max(self.received);
        self.absorb_limit = self
            .absorb_limit
            .max(self.received + self.capacity as u64);
    }

    pub(crate) fn register_pump(&mut self, cx: &mut Context<'_>) {
        match &self.pump_waker {
            Some(waker) if waker.will_wake(cx.waker()) => {}
            _ => self.pump_waker = Some(cx.waker().clone()),
        }
    }

    pub(crate) fn mark_remote_closed(&mut self) {
        self.remote_closed = true;
        wake_all(&mut self.reader_wakers);
    }

    pub(crate) fn mark_dead(&mut self) {
        self.dead = true;
        wake_all(&mut self.reader_wakers);
        wake_slot(&mut self.pump_waker);
    }

    pub(crate) fn received(&self) -> u64 {
        self.received
    }

    pub(crate) fn delivered(&self) -> u64 {
        self.delivered
    }

    pub(crate) fn is_dead(&self) -> bool {
        self.dead
    }
}
