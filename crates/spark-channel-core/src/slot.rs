//! The public face of a chain position: an opaque index plus the handle
//! passed to [`Handler`] callbacks.
//!
//! The slot *records* (handler, neighbors, window, overhead, shutdown phase)
//! live in the channel's arena (`crate::channel`) rather than behind
//! individually heap-allocated, cyclically-linked nodes — slots reference
//! the channel and each other, so the arena-plus-index approach sidesteps
//! the cyclic-ownership problem that a pointer-linked chain would run into,
//! keeping the handler chain behind one owned `Vec` rather than intrusive
//! pointers.
//!
//! [`Handler`]: crate::handler::Handler

use alloc::sync::Arc;

use crate::channel::ChannelShared;
use crate::error::CoreError;
use crate::event_loop::LocalObject;
use crate::handler::Direction;
use crate::message::Message;
use crate::task::ChannelTask;

/// Opaque, stable reference to a position in a channel's slot chain.
///
/// Indices are never reused while the channel is alive and remain stable
/// across chain mutations (insert/remove only relink neighbors; they never
/// shift other slots' indices).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SlotIndex(pub(crate) usize);

/// Handle passed to [`Handler`](crate::handler::Handler) callbacks, letting
/// a handler act back on its own slot and on the owning channel without
/// holding a direct reference to either.
#[derive(Clone)]
pub struct SlotHandle {
    pub(crate) channel: Arc<ChannelShared>,
    pub(crate) index: SlotIndex,
}

impl SlotHandle {
    pub fn index(&self) -> SlotIndex {
        self.index
    }

    /// Route `msg` to the adjacent slot in direction `dir`. On success the
    /// neighbor now owns `msg`. On failure the tuple returned in `Err` hands
    /// `msg` back to the caller untouched.
    pub fn send_message(&self, msg: Message, dir: Direction) -> Result<(), (Message, CoreError)> {
        self.channel.send_message(self.index, msg, dir)
    }

    /// Add `n` to this slot's window, saturating, then propagate to the left
    /// neighbor's handler if one exists.
    pub fn increment_read_window(&self, n: u64) {
        self.channel.increment_read_window(self.index, n);
    }

    /// Current read-window this slot advertises upstream.
    pub fn window_size(&self) -> u64 {
        self.channel.window_size(self.index)
    }

    /// The right neighbor's current window, or 0 if there is none.
    pub fn downstream_read_window(&self) -> u64 {
        self.channel.downstream_read_window(self.index)
    }

    /// Sum of per-handler overhead of every handler to this slot's left.
    pub fn upstream_message_overhead(&self) -> usize {
        self.channel.upstream_message_overhead(self.index)
    }

    /// Tell the slot that this handler has finished shutting down in `dir`.
    /// Drives the shutdown state machine forward (see [`crate::channel`]).
    /// MUST be called exactly once per direction, per the contract on
    /// [`Handler::shutdown`](crate::handler::Handler::shutdown).
    pub fn on_handler_shutdown_complete(&self, dir: Direction, err: i32, free_scarce: bool) {
        self.channel
            .on_handler_shutdown_complete(self.index, dir, err, free_scarce);
    }

    pub fn schedule_task_now(&self, task: ChannelTask) {
        self.channel.schedule_task_now(task);
    }

    pub fn schedule_task_future(&self, task: ChannelTask, run_at_nanos: u64) {
        self.channel.schedule_task_future(task, run_at_nanos);
    }

    pub fn current_clock_nanos(&self) -> u64 {
        self.channel.current_clock_nanos()
    }

    pub fn fetch_local_object(&self, key: &str) -> Option<LocalObject> {
        self.channel.fetch_local_object(key)
    }
}
