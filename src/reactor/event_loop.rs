//! Worker event loop.
//!
//! One per worker thread. Owns a `mio::Poll` instance and a slab of channels
//! keyed by token; no other thread ever touches either. Cross-thread work
//! arrives on a lock-free task queue paired with a `Waker`, so an unbounded
//! poll can never strand a submitted task.
//!
//! Loop body: drain tasks, register pending sockets handed off by the
//! acceptors, block on poll, dispatch readiness events. Shutdown is
//! cooperative: the flag is observed at the top of the iteration, remaining
//! tasks are drained once more, and every still-attached channel is closed.

use crate::admission::ConnectionLimiter;
use crate::buffer::{BufferArena, PooledBuf, SizeClass};
use crate::reactor::channel::Channel;
use crate::reactor::FrameHandler;
use crossbeam_queue::SegQueue;
use mio::net::TcpStream;
use mio::{Events, Poll, Token, Waker};
use slab::Slab;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, trace, warn};

/// Token reserved for the cross-thread waker.
const WAKER_TOKEN: Token = Token(usize::MAX);

const EVENTS_CAPACITY: usize = 1024;

/// A deferred closure executed on the owning loop's thread, at most once.
pub(crate) type Task = Box<dyn FnOnce(&mut EventLoop) + Send + 'static>;

/// Thread-safe submission side of an event loop.
///
/// Any thread may push tasks or pending sockets; only the owning loop
/// drains them. Every push wakes the poll.
pub struct LoopHandle {
    loop_id: usize,
    tasks: SegQueue<Task>,
    pending: SegQueue<TcpStream>,
    waker: Waker,
    shutdown: AtomicBool,
}

impl LoopHandle {
    pub(crate) fn submit(&self, task: Task) {
        if self.shutdown.load(Ordering::Acquire) {
            trace!(loop_id = self.loop_id, "task dropped after shutdown");
            return;
        }
        self.tasks.push(task);
        self.wake();
    }

    /// Hand a freshly accepted socket to this loop.
    ///
    /// Returns `false` when the loop is shutting down; the caller keeps
    /// ownership of the admission slot it holds and the socket is dropped.
    pub(crate) fn register(&self, stream: TcpStream) -> bool {
        if self.shutdown.load(Ordering::Acquire) {
            return false;
        }
        self.pending.push(stream);
        self.wake();
        true
    }

    /// Flag the loop for shutdown and wake it.
    pub fn initiate_shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.wake();
    }

    pub(crate) fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    fn wake(&self) {
        if let Err(e) = self.waker.wake() {
            warn!(loop_id = self.loop_id, error = %e, "waker failed");
        }
    }
}

/// A worker event loop and the channels it owns.
pub struct EventLoop {
    id: usize,
    poll: Poll,
    channels: Slab<Channel>,
    handle: Arc<LoopHandle>,
    arena: Arc<BufferArena>,
    admission: Arc<ConnectionLimiter>,
    handler: Arc<dyn FrameHandler>,
    next_channel_id: Arc<AtomicU64>,
}

impl EventLoop {
    pub fn new(
        id: usize,
        arena: Arc<BufferArena>,
        admission: Arc<ConnectionLimiter>,
        handler: Arc<dyn FrameHandler>,
        next_channel_id: Arc<AtomicU64>,
    ) -> io::Result<Self> {
        let poll = Poll::new()?;
        let waker = Waker::new(poll.registry(), WAKER_TOKEN)?;
        let handle = Arc::new(LoopHandle {
            loop_id: id,
            tasks: SegQueue::new(),
            pending: SegQueue::new(),
            waker,
            shutdown: AtomicBool::new(false),
        });
        Ok(Self {
            id,
            poll,
            channels: Slab::new(),
            handle,
            arena,
            admission,
            handler,
            next_channel_id,
        })
    }

    pub fn handle(&self) -> Arc<LoopHandle> {
        Arc::clone(&self.handle)
    }

    /// Run until shutdown is flagged.
    pub fn run(&mut self) {
        let mut events = Events::with_capacity(EVENTS_CAPACITY);
        debug!(worker = self.id, "event loop started");

        loop {
            self.run_tasks();
            self.register_pending();
            if self.handle.is_shutdown() {
                break;
            }

            match self.poll.poll(&mut events, None) {
                Ok(()) => {}
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!(worker = self.id, error = %e, "poll failed");
                    break;
                }
            }

            for event in events.iter() {
                let token = event.token();
                if token == WAKER_TOKEN {
                    continue;
                }
                let readable = event.is_readable() || event.is_read_closed();
                let writable = event.is_writable() || event.is_write_closed();
                self.dispatch(token, readable, writable);
            }
        }

        self.drain_on_shutdown();
        debug!(worker = self.id, "event loop stopped");
    }

    fn run_tasks(&mut self) {
        let handle = Arc::clone(&self.handle);
        while let Some(task) = handle.tasks.pop() {
            task(self);
        }
    }

    /// Construct and activate channels for sockets the acceptors handed off.
    pub(crate) fn register_pending(&mut self) {
        while let Some(stream) = self.handle.pending.pop() {
            let id = self.next_channel_id.fetch_add(1, Ordering::Relaxed) + 1;
            let read_buf = self.arena.acquire(SizeClass::Read);
            let entry = self.channels.vacant_entry();
            let token = Token(entry.key());
            let mut channel = Channel::new(id, stream, token, read_buf, Arc::clone(&self.handle));

            match channel.activate(self.poll.registry()) {
                Ok(()) => {
                    trace!(worker = self.id, channel = id, "channel active");
                    entry.insert(channel);
                }
                Err(e) => {
                    warn!(worker = self.id, error = %e, "failed to register connection");
                    channel.abort(&self.arena, &self.admission);
                }
            }
        }
    }

    fn dispatch(&mut self, token: Token, readable: bool, writable: bool) {
        if readable {
            let handler = Arc::clone(&self.handler);
            let result = match self.channels.get_mut(token.0) {
                Some(channel) => channel.handle_readable(handler.as_ref()),
                // Stale event for a channel closed earlier in this batch
                None => return,
            };
            if let Err(e) = result {
                debug!(worker = self.id, error = %e, "read failed");
                self.close_channel(token);
                return;
            }
        }

        if writable {
            let registry = self.poll.registry();
            let result = match self.channels.get_mut(token.0) {
                Some(channel) => channel.handle_writable(registry, &self.arena),
                None => return,
            };
            if let Err(e) = result {
                debug!(worker = self.id, error = %e, "write failed");
                self.close_channel(token);
            }
        }
    }

    /// Apply a cross-thread response handoff.
    ///
    /// The channel id guards against token reuse: a response aimed at a
    /// closed channel whose slot was recycled is released, not delivered.
    pub(crate) fn enqueue_response(&mut self, token: Token, channel_id: u64, buf: PooledBuf) {
        let registry = self.poll.registry();
        match self.channels.get_mut(token.0) {
            Some(channel) if channel.id() == channel_id && channel.is_open() => {
                if let Err(e) = channel.queue_response(buf, registry, &self.arena) {
                    debug!(worker = self.id, channel = channel_id, error = %e, "response write failed");
                    self.close_channel(token);
                }
            }
            _ => {
                trace!(
                    worker = self.id,
                    channel = channel_id,
                    "response for closed channel released"
                );
                self.arena.release(buf);
            }
        }
    }

    /// Apply a cross-thread close request.
    pub(crate) fn request_close(&mut self, token: Token, channel_id: u64) {
        let matches = self
            .channels
            .get(token.0)
            .map(|channel| channel.id() == channel_id)
            .unwrap_or(false);
        if matches {
            self.close_channel(token);
        }
    }

    pub(crate) fn close_channel(&mut self, token: Token) {
        if let Some(channel) = self.channels.try_remove(token.0) {
            debug!(worker = self.id, channel = channel.id(), "channel closed");
            channel.teardown(self.poll.registry(), &self.arena, &self.admission);
        }
    }

    fn drain_on_shutdown(&mut self) {
        self.run_tasks();

        // Sockets still waiting for registration hold admission slots.
        while let Some(stream) = self.handle.pending.pop() {
            drop(stream);
            self.admission.release();
        }

        let keys: Vec<usize> = self.channels.iter().map(|(key, _)| key).collect();
        for key in keys {
            self.close_channel(Token(key));
        }
    }
}
