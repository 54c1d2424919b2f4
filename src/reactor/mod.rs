//! Reactor transport engine.
//!
//! Acceptor threads share the listen port and distribute sockets round-robin
//! across worker event loops. Each event loop owns a private multiplexer and
//! its channels for their entire lifetime: all cross-thread influence on a
//! channel is expressed as a task on the owning loop's queue, never direct
//! mutation from a foreign thread.

pub mod acceptor;
pub mod channel;
pub mod event_loop;

pub use acceptor::Acceptor;
pub use channel::ChannelRef;
pub use event_loop::{EventLoop, LoopHandle};

use crate::codec::Frame;

/// Dispatch boundary between the transport and business logic.
///
/// Invoked on the owning event-loop thread for every decoded frame. The
/// implementation must not block: CPU-bound work is handed to an executor
/// and re-enters the loop through the [`ChannelRef`] task API.
pub trait FrameHandler: Send + Sync {
    fn on_frame(&self, frame: &Frame<'_>, channel: &ChannelRef);
}
