//! Schedulable units of work executed on a channel's event-loop thread.
//!
//! The original design wraps a user function, an argument, and a type tag
//! behind intrusive list linkage so a C host can allocate and queue the
//! struct itself. In Rust the function and argument collapse into one
//! `FnOnce` closure, and the pending queue (see [`crate::channel`]) owns the
//! linkage instead of the task carrying it — there is no correctness reason
//! to hand-roll an intrusive list here.

use alloc::boxed::Box;

/// Status passed to a [`ChannelTask`] at invocation time.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskStatus {
    /// Normal execution: the channel is not torn down.
    RunReady,
    /// The channel was destroyed before this task got to run. The task's
    /// function is still invoked exactly once, so it can release any state
    /// it captured.
    Canceled,
}

/// A scheduled unit of work.
///
/// Once handed to [`Channel::schedule_task_now`]/[`Channel::schedule_task_future`],
/// the task is executed (with `Canceled` standing in for "never ran") exactly
/// once and then dropped — there is no re-scheduling primitive.
///
/// [`Channel::schedule_task_now`]: crate::channel::Channel::schedule_task_now
/// [`Channel::schedule_task_future`]: crate::channel::Channel::schedule_task_future
pub struct ChannelTask {
    type_tag: &'static str,
    func: Option<Box<dyn FnOnce(TaskStatus) + Send + 'static>>,
}

impl ChannelTask {
    /// `type_tag` is a diagnostic label (logged on cancellation), not part
    /// of dispatch — pick something stable like `"tls.handshake_timeout"`.
    pub fn new(type_tag: &'static str, func: impl FnOnce(TaskStatus) + Send + 'static) -> Self {
        Self {
            type_tag,
            func: Some(Box::new(func)),
        }
    }

    pub fn type_tag(&self) -> &'static str {
        self.type_tag
    }

    /// Invoke the task's function with the given status. Consumes the task;
    /// there is nothing left to run afterward.
    pub(crate) fn run(mut self, status: TaskStatus) {
        if let Some(func) = self.func.take() {
            func(status);
        }
    }

    /// Split a task into its diagnostic tag and its function, so a caller
    /// can re-wrap the function behind its own dispatch (the channel uses
    /// this to make a channel-scheduled task cancelable without requiring
    /// the event loop itself to know anything about cancellation).
    pub(crate) fn into_parts(mut self) -> (&'static str, Box<dyn FnOnce(TaskStatus) + Send + 'static>) {
        let func = self.func.take().expect("ChannelTask function taken twice");
        (self.type_tag, func)
    }
}

impl core::fmt::Debug for ChannelTask {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ChannelTask")
            .field("type_tag", &self.type_tag)
            .finish()
    }
}
