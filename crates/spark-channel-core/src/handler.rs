//! The handler capability: a pluggable protocol stage hosted by one slot in
//! a channel's chain.

use crate::error::CoreError;
use crate::message::Message;
use crate::sealed::Sealed;
use crate::slot::SlotHandle;

/// Direction a message or a shutdown phase travels through the chain.
///
/// `Read` flows left-to-right (I/O toward application); `Write` flows
/// right-to-left (application toward I/O).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Direction {
    Read,
    Write,
}

impl Direction {
    pub fn opposite(self) -> Direction {
        match self {
            Direction::Read => Direction::Write,
            Direction::Write => Direction::Read,
        }
    }
}

/// A pluggable protocol stage: socket, TLS, ALPN, application, etc.
///
/// All methods run on the channel's event-loop thread. A handler may
/// "suspend" — return from a callback without having produced output yet —
/// and resume later by scheduling a [`ChannelTask`] on the channel; this is
/// the only legal form of asynchrony inside the core (see the concurrency
/// model).
///
/// [`ChannelTask`]: crate::task::ChannelTask
pub trait Handler: Send + Sealed {
    /// Take ownership of a READ message arriving from the left neighbor.
    /// The slot has already decremented its window by `msg.len()` before
    /// this call. The handler must eventually release `msg` (by dropping it,
    /// forwarding it via [`SlotHandle::send_message`], or calling
    /// `msg.release(..)`).
    fn process_read_message(
        &mut self,
        slot: &SlotHandle,
        msg: Message,
    ) -> Result<(), CoreError>;

    /// Take ownership of a WRITE message arriving from the right neighbor.
    fn process_write_message(
        &mut self,
        slot: &SlotHandle,
        msg: Message,
    ) -> Result<(), CoreError>;

    /// A credit delta arrived from downstream. The default forwards the same
    /// delta upstream unchanged, which is correct for handlers that do not
    /// reshape window accounting (most do not).
    fn increment_read_window(&mut self, slot: &SlotHandle, n: u64) {
        let _ = slot.increment_read_window(n);
    }

    /// Begin shutting down in `dir`. May complete synchronously (by calling
    /// [`SlotHandle::on_handler_shutdown_complete`] before returning) or
    /// asynchronously (by scheduling a task that calls it later). MUST
    /// eventually call it exactly once per direction. If `free_scarce` is
    /// true, scarce OS resources must be released before this call returns,
    /// even if overall completion is deferred.
    fn shutdown(
        &mut self,
        slot: &SlotHandle,
        dir: Direction,
        err: i32,
        free_scarce: bool,
    ) -> Result<(), CoreError>;

    /// Read credit this handler wants upstream to observe at insertion.
    fn initial_window_size(&self) -> u64 {
        0
    }

    /// Bytes this handler adds to each message it forwards, so slots to its
    /// right can size pool allocations without fragmenting.
    fn message_overhead(&self) -> usize {
        0
    }

    /// Release handler memory. Not called until shutdown has completed in
    /// both directions for this handler's slot.
    fn destroy(&mut self) {}
}
