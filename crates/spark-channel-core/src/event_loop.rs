//! The event loop capability interface.
//!
//! This is the primary external collaborator: a threaded task executor,
//! timer, thread-local-ish storage and message pool supplied by the host.
//! The core depends only on this trait; it never picks a concrete async
//! runtime, which keeps the crate free of a `tokio`/`async-std` dependency
//! and leaves that binding to adapter crates.
//!
//! This crate ships no production implementation of [`EventLoop`] — only a
//! deterministic single-threaded test double, in `spark-channel-contract-tests`.

use alloc::sync::Arc;
use core::any::Any;

use crate::error::CoreError;
use crate::message::{Message, MessageKind};
use crate::sealed::Sealed;
use crate::task::ChannelTask;

/// Type-erased value stored in an event loop's per-loop local storage.
pub type LocalObject = Arc<dyn Any + Send + Sync>;

/// Capability interface for the host's task executor, clock, local storage
/// and message pool.
///
/// All methods must be safe to call from any thread; the loop itself is
/// responsible for routing `schedule_task_*` to its single owning thread
/// when called from elsewhere, and for executing every scheduled task on
/// that same thread, one at a time.
pub trait EventLoop: Send + Sync + Sealed {
    /// Schedule `task` to run as soon as the loop is free. Tasks scheduled
    /// `now` from the same calling thread must run in FIFO order relative to
    /// each other.
    fn schedule_task_now(&self, task: ChannelTask);

    /// Schedule `task` to run at or after `run_at_nanos` on the loop's
    /// monotonic clock.
    fn schedule_task_future(&self, task: ChannelTask, run_at_nanos: u64);

    /// Current reading of the loop's monotonic clock, in nanoseconds.
    fn current_clock_nanos(&self) -> u64;

    /// True iff the calling thread is the loop's owning thread.
    fn is_on_this_thread(&self) -> bool;

    fn fetch_local_object(&self, key: &str) -> Option<LocalObject>;
    fn put_local_object(&self, key: &str, value: LocalObject);
    fn remove_local_object(&self, key: &str) -> Option<LocalObject>;

    /// Acquire a message from the loop's pool. `size_hint` is a request, not
    /// a guarantee — the returned message's capacity may be smaller (see
    /// [`Channel::acquire_message_from_pool`] for the fragmentation clamp
    /// applied on top of this) and is never required to be larger.
    ///
    /// [`Channel::acquire_message_from_pool`]: crate::channel::Channel::acquire_message_from_pool
    fn acquire_message_from_pool(
        &self,
        kind: MessageKind,
        size_hint: usize,
    ) -> Result<Message, CoreError>;
}
