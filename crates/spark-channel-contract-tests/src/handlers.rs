//! Handler test doubles shared by `spark-channel-core`'s own test suite and
//! by downstream crates wiring a new protocol stage against the core.

use std::sync::Arc;

use spin::Mutex;

use spark_channel_core::error::CoreError;
use spark_channel_core::handler::{Direction, Handler};
use spark_channel_core::message::Message;
use spark_channel_core::slot::SlotHandle;
use spark_channel_core::task::TaskStatus;

/// One recorded event a [`RecordingHandler`] observed, in order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RecordedEvent {
    Read(usize),
    Write(usize),
    WindowIncrement(u64),
    ShutdownStarted(Direction, i32, bool),
    ShutdownCompleted(Direction),
    Destroyed,
}

#[derive(Default)]
struct Shared {
    events: Vec<RecordedEvent>,
}

/// A pass-through handler that forwards READ messages rightward and WRITE
/// messages leftward unchanged, recording every callback it receives into a
/// shared, externally-inspectable log.
///
/// Shutdown completes synchronously by default (calls
/// [`SlotHandle::on_handler_shutdown_complete`] before `shutdown` returns).
/// Use [`RecordingHandler::deferred`] to make shutdown suspend instead, the
/// way a handler waiting on an in-flight TLS close-notify would.
pub struct RecordingHandler {
    log: Arc<Mutex<Shared>>,
    initial_window: u64,
    overhead: usize,
    defer_shutdown: bool,
    fail_next_read: bool,
}

impl RecordingHandler {
    pub fn new(initial_window: u64, overhead: usize) -> Self {
        Self {
            log: Arc::new(Mutex::new(Shared::default())),
            initial_window,
            overhead,
            defer_shutdown: false,
            fail_next_read: false,
        }
    }

    /// Make `shutdown` suspend: it records the request but relies on a test
    /// calling [`RecordingHandler::finish_pending_shutdown`] (via the handle
    /// returned by [`RecordingHandler::handle`]) — or, more realistically, it
    /// schedules a task that resumes and finishes on its own.
    pub fn deferred(mut self) -> Self {
        self.defer_shutdown = true;
        self
    }

    /// Make the next `process_read_message` call return a [`CoreError`]
    /// instead of forwarding, to exercise the handler-error shutdown path.
    pub fn failing_next_read(mut self) -> Self {
        self.fail_next_read = true;
        self
    }

    /// A cheap, cloneable view into this handler's recorded events, usable
    /// after the handler itself has been moved into a slot.
    pub fn handle(&self) -> RecordingHandle {
        RecordingHandle { log: self.log.clone() }
    }

    fn record(&self, event: RecordedEvent) {
        self.log.lock().events.push(event);
    }
}

/// Cloneable observer half of a [`RecordingHandler`].
#[derive(Clone)]
pub struct RecordingHandle {
    log: Arc<Mutex<Shared>>,
}

impl RecordingHandle {
    pub fn events(&self) -> Vec<RecordedEvent> {
        self.log.lock().events.clone()
    }

    pub fn event_count(&self) -> usize {
        self.log.lock().events.len()
    }
}

impl Handler for RecordingHandler {
    fn process_read_message(&mut self, slot: &SlotHandle, msg: Message) -> Result<(), CoreError> {
        self.record(RecordedEvent::Read(msg.len()));
        if std::mem::take(&mut self.fail_next_read) {
            msg.release(spark_channel_core::message::MessageCompletion::Discarded);
            return Err(CoreError::handler(
                spark_channel_core::error::codes::HANDLER_PROCESS_FAILED,
                "RecordingHandler configured to fail the next read",
            ));
        }
        match slot.send_message(msg, Direction::Read) {
            Ok(()) => Ok(()),
            Err((msg, _err)) => {
                // Terminal (rightmost) slot: nothing further to forward to,
                // so this is the sink — release and move on.
                msg.release(spark_channel_core::message::MessageCompletion::Delivered);
                Ok(())
            }
        }
    }

    fn process_write_message(&mut self, slot: &SlotHandle, msg: Message) -> Result<(), CoreError> {
        self.record(RecordedEvent::Write(msg.len()));
        match slot.send_message(msg, Direction::Write) {
            Ok(()) => Ok(()),
            Err((msg, _err)) => {
                msg.release(spark_channel_core::message::MessageCompletion::Delivered);
                Ok(())
            }
        }
    }

    fn increment_read_window(&mut self, slot: &SlotHandle, n: u64) {
        self.record(RecordedEvent::WindowIncrement(n));
        slot.increment_read_window(n);
    }

    fn shutdown(&mut self, slot: &SlotHandle, dir: Direction, err: i32, free_scarce: bool) -> Result<(), CoreError> {
        self.record(RecordedEvent::ShutdownStarted(dir, err, free_scarce));
        if self.defer_shutdown {
            let handle = slot.clone();
            let log = self.log.clone();
            slot.schedule_task_now(spark_channel_core::task::ChannelTask::new(
                "recording_handler.deferred_shutdown",
                move |status| {
                    if status == TaskStatus::RunReady {
                        log.lock().events.push(RecordedEvent::ShutdownCompleted(dir));
                        handle.on_handler_shutdown_complete(dir, err, free_scarce);
                    }
                },
            ));
        } else {
            self.record(RecordedEvent::ShutdownCompleted(dir));
            slot.on_handler_shutdown_complete(dir, err, free_scarce);
        }
        Ok(())
    }

    fn initial_window_size(&self) -> u64 {
        self.initial_window
    }

    fn message_overhead(&self) -> usize {
        self.overhead
    }

    fn destroy(&mut self) {
        self.record(RecordedEvent::Destroyed);
    }
}

/// A handler that always fails: every `process_*` call returns a
/// [`CoreError`] without forwarding, and `shutdown` both reports an error
/// *and* still completes (per the contract that a handler shutdown error
/// never stalls the automaton). Used to exercise the "errors during
/// shutdown are captured but do not halt the sequence" behavior.
pub struct FlakyHandler {
    label: &'static str,
}

impl FlakyHandler {
    pub fn new(label: &'static str) -> Self {
        Self { label }
    }
}

impl Handler for FlakyHandler {
    fn process_read_message(&mut self, _slot: &SlotHandle, msg: Message) -> Result<(), CoreError> {
        msg.release(spark_channel_core::message::MessageCompletion::Discarded);
        Err(CoreError::handler(
            spark_channel_core::error::codes::HANDLER_PROCESS_FAILED,
            self.label,
        ))
    }

    fn process_write_message(&mut self, _slot: &SlotHandle, msg: Message) -> Result<(), CoreError> {
        msg.release(spark_channel_core::message::MessageCompletion::Discarded);
        Err(CoreError::handler(
            spark_channel_core::error::codes::HANDLER_PROCESS_FAILED,
            self.label,
        ))
    }

    fn shutdown(&mut self, slot: &SlotHandle, dir: Direction, err: i32, free_scarce: bool) -> Result<(), CoreError> {
        slot.on_handler_shutdown_complete(dir, err, free_scarce);
        Err(CoreError::handler(
            spark_channel_core::error::codes::HANDLER_SHUTDOWN_FAILED,
            self.label,
        ))
    }
}
