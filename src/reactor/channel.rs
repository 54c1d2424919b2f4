//! Per-connection channel state machine.
//!
//! A channel owns its socket, one pooled read buffer, and a FIFO queue of
//! outbound buffers. Everything here is touched only by the owning event-loop
//! thread; other threads reach a channel through a [`ChannelRef`], which
//! submits tasks to that loop.
//!
//! Lifecycle: `Inactive -> Active -> Closed`. Closing is idempotent and
//! terminal: it cancels the multiplexer registration, releases every buffer
//! back to the arena, and gives the admission slot back exactly once.

use crate::admission::ConnectionLimiter;
use crate::buffer::{BufferArena, PooledBuf};
use crate::codec;
use crate::reactor::event_loop::LoopHandle;
use crate::reactor::FrameHandler;
use mio::net::TcpStream;
use mio::{Interest, Registry, Token};
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChannelState {
    Inactive,
    Active,
    Closed,
}

struct Outbound {
    buf: PooledBuf,
    written: usize,
}

pub(crate) struct Channel {
    id: u64,
    token: Token,
    stream: TcpStream,
    state: ChannelState,
    /// Shared with [`ChannelRef`] so business threads get a best-effort
    /// liveness view without touching loop-owned state.
    closed: Arc<AtomicBool>,
    read_buf: PooledBuf,
    write_queue: VecDeque<Outbound>,
    interest: Interest,
    chan_ref: ChannelRef,
}

impl Channel {
    pub(crate) fn new(
        id: u64,
        stream: TcpStream,
        token: Token,
        read_buf: PooledBuf,
        handle: Arc<LoopHandle>,
    ) -> Self {
        let closed = Arc::new(AtomicBool::new(false));
        let chan_ref = ChannelRef {
            handle,
            token,
            channel_id: id,
            closed: Arc::clone(&closed),
        };
        Self {
            id,
            token,
            stream,
            state: ChannelState::Inactive,
            closed,
            read_buf,
            write_queue: VecDeque::new(),
            interest: Interest::READABLE,
            chan_ref,
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn is_open(&self) -> bool {
        self.state == ChannelState::Active && !self.closed.load(Ordering::Acquire)
    }

    /// Register with the multiplexer and enter the `Active` state.
    pub(crate) fn activate(&mut self, registry: &Registry) -> io::Result<()> {
        debug_assert_eq!(self.state, ChannelState::Inactive);
        registry.register(&mut self.stream, self.token, Interest::READABLE)?;
        self.state = ChannelState::Active;
        Ok(())
    }

    /// Read until the socket would block, decoding and dispatching every
    /// complete frame.
    ///
    /// Any error return means the channel must close: EOF, an I/O failure,
    /// a framing violation, or a single frame too large for the read buffer.
    pub(crate) fn handle_readable(
        &mut self,
        handler: &dyn FrameHandler,
    ) -> io::Result<()> {
        loop {
            match self.stream.read(self.read_buf.unfilled_mut()) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "connection closed by peer",
                    ));
                }
                Ok(n) => {
                    self.read_buf.fill(n);
                    self.dispatch_frames(handler)?;
                    if self.closed.load(Ordering::Acquire) {
                        // Close requested mid-dispatch; the teardown task is
                        // already queued.
                        return Ok(());
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn dispatch_frames(&mut self, handler: &dyn FrameHandler) -> io::Result<()> {
        let (frames, consumed) = codec::decode(self.read_buf.as_slice())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

        for frame in &frames {
            if self.closed.load(Ordering::Acquire) {
                break;
            }
            trace!(channel = self.id, frame_type = ?frame.frame_type, "frame received");
            handler.on_frame(frame, &self.chan_ref);
        }

        self.read_buf.consume(consumed);
        if self.read_buf.len() == self.read_buf.capacity() {
            // No complete frame fits the remaining space: a single message
            // larger than the read buffer can never be decoded.
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "frame exceeds read buffer capacity",
            ));
        }
        Ok(())
    }

    /// Flush queued buffers after a writability event, dropping write
    /// interest once the queue drains.
    pub(crate) fn handle_writable(
        &mut self,
        registry: &Registry,
        arena: &BufferArena,
    ) -> io::Result<()> {
        self.flush_outbound(arena)?;
        self.update_interest(registry)
    }

    /// Append a response and flush as much as the socket accepts.
    ///
    /// Only the owning event-loop thread calls this; cross-thread producers
    /// go through [`ChannelRef::send_response`].
    pub(crate) fn queue_response(
        &mut self,
        buf: PooledBuf,
        registry: &Registry,
        arena: &BufferArena,
    ) -> io::Result<()> {
        self.write_queue.push_back(Outbound { buf, written: 0 });
        self.flush_outbound(arena)?;
        self.update_interest(registry)
    }

    fn flush_outbound(&mut self, arena: &BufferArena) -> io::Result<()> {
        loop {
            let Some(front) = self.write_queue.front_mut() else {
                break;
            };
            if front.written == front.buf.len() {
                if let Some(done) = self.write_queue.pop_front() {
                    arena.release(done.buf);
                }
                continue;
            }
            match self.stream.write(&front.buf.as_slice()[front.written..]) {
                Ok(0) => {
                    return Err(io::Error::new(io::ErrorKind::WriteZero, "write returned zero"));
                }
                Ok(n) => front.written += n,
                // A partially written buffer stays at the head of the queue.
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn update_interest(&mut self, registry: &Registry) -> io::Result<()> {
        let desired = if self.write_queue.is_empty() {
            Interest::READABLE
        } else {
            Interest::READABLE | Interest::WRITABLE
        };
        if desired != self.interest {
            registry.reregister(&mut self.stream, self.token, desired)?;
            self.interest = desired;
        }
        Ok(())
    }

    /// Tear the channel down: cancel the registration, release every buffer,
    /// and give the admission slot back. The socket closes when the stream
    /// drops.
    pub(crate) fn teardown(
        mut self,
        registry: &Registry,
        arena: &BufferArena,
        admission: &ConnectionLimiter,
    ) {
        self.state = ChannelState::Closed;
        self.closed.store(true, Ordering::Release);
        if let Err(e) = registry.deregister(&mut self.stream) {
            trace!(channel = self.id, error = %e, "deregister failed");
        }
        arena.release(self.read_buf);
        for out in self.write_queue {
            arena.release(out.buf);
        }
        admission.release();
    }

    /// Undo a channel that never activated: release its resources without
    /// touching the registry.
    pub(crate) fn abort(self, arena: &BufferArena, admission: &ConnectionLimiter) {
        self.closed.store(true, Ordering::Release);
        arena.release(self.read_buf);
        admission.release();
    }
}

/// Cross-thread reference to a channel.
///
/// Cloneable and `Send`; every mutation it expresses travels as a task to
/// the owning event loop and is applied on that loop's thread.
#[derive(Clone)]
pub struct ChannelRef {
    handle: Arc<LoopHandle>,
    token: Token,
    channel_id: u64,
    closed: Arc<AtomicBool>,
}

impl ChannelRef {
    pub fn channel_id(&self) -> u64 {
        self.channel_id
    }

    /// Best-effort liveness view. Authoritative checks happen on the owning
    /// loop thread when a task is applied.
    pub fn is_open(&self) -> bool {
        !self.closed.load(Ordering::Acquire)
    }

    /// Hand an encoded response to the owning event loop.
    ///
    /// If the channel is already closed by the time the task runs, the
    /// buffer is released straight back to the arena.
    pub fn send_response(&self, buf: PooledBuf) {
        let (token, id) = (self.token, self.channel_id);
        self.handle
            .submit(Box::new(move |event_loop: &mut crate::reactor::EventLoop| {
                event_loop.enqueue_response(token, id, buf);
            }));
    }

    /// Request an idempotent close on the owning event loop.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        let (token, id) = (self.token, self.channel_id);
        self.handle
            .submit(Box::new(move |event_loop: &mut crate::reactor::EventLoop| {
                event_loop.request_close(token, id);
            }));
    }
}
