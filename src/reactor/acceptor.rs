//! Connection acceptor.
//!
//! Each acceptor thread watches one listening socket with its own poll
//! instance. Acceptors sharing a port rely on SO_REUSEPORT so the kernel
//! spreads accept storms across them. Accepted sockets take an admission
//! slot, get their low-latency options set, and are handed round-robin to a
//! worker event loop; any failure on that path releases the slot and drops
//! the socket.

use crate::admission::ConnectionLimiter;
use crate::reactor::event_loop::LoopHandle;
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

const LISTENER_TOKEN: Token = Token(0);

/// Upper bound on accepts per readiness event, so a connection burst cannot
/// monopolize the thread.
const ACCEPT_BATCH: usize = 128;

/// Poll timeout; bounds how long shutdown can go unnoticed.
const POLL_TIMEOUT: Duration = Duration::from_millis(500);

pub struct Acceptor {
    id: usize,
    poll: Poll,
    listener: TcpListener,
    loops: Vec<Arc<LoopHandle>>,
    admission: Arc<ConnectionLimiter>,
    shutdown: Arc<AtomicBool>,
    next_worker: u64,
}

impl Acceptor {
    pub fn new(
        id: usize,
        listener: std::net::TcpListener,
        loops: Vec<Arc<LoopHandle>>,
        admission: Arc<ConnectionLimiter>,
        shutdown: Arc<AtomicBool>,
    ) -> io::Result<Self> {
        let poll = Poll::new()?;
        let mut listener = TcpListener::from_std(listener);
        poll.registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;

        Ok(Self {
            id,
            poll,
            listener,
            loops,
            admission,
            shutdown,
            next_worker: 0,
        })
    }

    pub fn run(&mut self) {
        let mut events = Events::with_capacity(16);
        // Set when a batch hit its bound with accepts possibly pending, so
        // the backlog is drained without waiting for another edge.
        let mut backlog = false;
        info!(acceptor = self.id, "acceptor started");

        while !self.shutdown.load(Ordering::Acquire) {
            match self.poll.poll(&mut events, Some(POLL_TIMEOUT)) {
                Ok(()) => {}
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!(acceptor = self.id, error = %e, "poll failed");
                    break;
                }
            }
            if self.shutdown.load(Ordering::Acquire) {
                break;
            }
            if backlog || !events.is_empty() {
                backlog = self.accept_batch();
            }
        }

        debug!(acceptor = self.id, "acceptor stopped");
    }

    /// Accept up to [`ACCEPT_BATCH`] connections.
    ///
    /// Returns `true` when the bound was hit, meaning more connections may
    /// still be queued in the kernel backlog.
    fn accept_batch(&mut self) -> bool {
        for _ in 0..ACCEPT_BATCH {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    if !self.admission.try_acquire() {
                        warn!(
                            acceptor = self.id,
                            peer = %peer,
                            limit = self.admission.max(),
                            "connection rejected: admission limit reached"
                        );
                        continue;
                    }
                    if let Err(e) = configure_stream(&stream) {
                        warn!(acceptor = self.id, peer = %peer, error = %e, "failed to configure socket");
                        self.admission.release();
                        continue;
                    }

                    let target = (self.next_worker % self.loops.len() as u64) as usize;
                    self.next_worker = self.next_worker.wrapping_add(1);
                    if self.loops[target].register(stream) {
                        trace!(acceptor = self.id, peer = %peer, worker = target, "connection accepted");
                    } else {
                        self.admission.release();
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return false,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!(acceptor = self.id, error = %e, "accept failed");
                    return false;
                }
            }
        }
        true
    }
}

/// Disable Nagling and enable keepalive on an accepted socket.
fn configure_stream(stream: &TcpStream) -> io::Result<()> {
    stream.set_nodelay(true)?;
    socket2::SockRef::from(stream).set_keepalive(true)?;
    Ok(())
}
