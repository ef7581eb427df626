//! A deterministic, single-threaded [`EventLoop`] test double.
//!
//! Real event loops run tasks the instant their owning thread is free;
//! `TestEventLoop` instead queues everything and only runs queued work when
//! the test explicitly pumps it (`run_until_idle` / `advance_clock`). That
//! makes shutdown cascades, suspended handlers, and future-scheduled tasks
//! reproducible step by step instead of racing a real thread.

use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::thread::{self, ThreadId};

use spin::Mutex;

use spark_channel_core::error::CoreError;
use spark_channel_core::event_loop::{EventLoop, LocalObject};
use spark_channel_core::message::{Message, MessageKind};
use spark_channel_core::task::{ChannelTask, TaskStatus};

struct Inner {
    now_queue: VecDeque<ChannelTask>,
    future_queue: Vec<(u64, ChannelTask)>,
    clock_nanos: u64,
    locals: HashMap<String, LocalObject>,
}

/// Single-threaded, manually-pumped stand-in for a production event loop.
///
/// All task queues live behind one [`spin::Mutex`] for interior mutability;
/// the loop has exactly one owning thread (the thread that constructed it),
/// recorded once at construction and checked by
/// [`EventLoop::is_on_this_thread`].
pub struct TestEventLoop {
    owner: ThreadId,
    inner: Mutex<Inner>,
}

impl TestEventLoop {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            owner: thread::current().id(),
            inner: Mutex::new(Inner {
                now_queue: VecDeque::new(),
                future_queue: Vec::new(),
                clock_nanos: 0,
                locals: HashMap::new(),
            }),
        })
    }

    /// Run every currently-queued "now" task, including ones newly enqueued
    /// by a task that just ran, until the now-queue is empty. Future tasks
    /// are left untouched — advance the clock to bring them due.
    pub fn run_until_idle(&self) {
        loop {
            let next = self.inner.lock().now_queue.pop_front();
            match next {
                Some(task) => task.run(TaskStatus::RunReady),
                None => break,
            }
        }
    }

    /// Move the clock forward by `delta_nanos`, promote any future task
    /// whose deadline has now arrived into the now-queue, then drain the
    /// now-queue to idle.
    pub fn advance_clock(&self, delta_nanos: u64) {
        let ready = {
            let mut inner = self.inner.lock();
            inner.clock_nanos = inner.clock_nanos.saturating_add(delta_nanos);
            let now = inner.clock_nanos;
            let (ready, pending): (Vec<_>, Vec<_>) =
                inner.future_queue.drain(..).partition(|(at, _)| *at <= now);
            inner.future_queue = pending;
            ready
        };
        for (_, task) in ready {
            self.inner.lock().now_queue.push_back(task);
        }
        self.run_until_idle();
    }

    pub fn current_clock_nanos_for_test(&self) -> u64 {
        self.inner.lock().clock_nanos
    }

    /// True once both queues are empty.
    pub fn is_idle(&self) -> bool {
        let inner = self.inner.lock();
        inner.now_queue.is_empty() && inner.future_queue.is_empty()
    }
}

impl EventLoop for TestEventLoop {
    fn schedule_task_now(&self, task: ChannelTask) {
        self.inner.lock().now_queue.push_back(task);
    }

    fn schedule_task_future(&self, task: ChannelTask, run_at_nanos: u64) {
        self.inner.lock().future_queue.push((run_at_nanos, task));
    }

    fn current_clock_nanos(&self) -> u64 {
        self.inner.lock().clock_nanos
    }

    fn is_on_this_thread(&self) -> bool {
        thread::current().id() == self.owner
    }

    fn fetch_local_object(&self, key: &str) -> Option<LocalObject> {
        self.inner.lock().locals.get(key).cloned()
    }

    fn put_local_object(&self, key: &str, value: LocalObject) {
        self.inner.lock().locals.insert(key.to_string(), value);
    }

    fn remove_local_object(&self, key: &str) -> Option<LocalObject> {
        self.inner.lock().locals.remove(key)
    }

    fn acquire_message_from_pool(&self, kind: MessageKind, size_hint: usize) -> Result<Message, CoreError> {
        Ok(Message::with_capacity(kind, size_hint))
    }
}

/// Type-erase a value for [`EventLoop::put_local_object`] in tests without
/// each call site writing out the `Arc<dyn Any + Send + Sync>` cast.
pub fn local_object<T: Any + Send + Sync>(value: T) -> LocalObject {
    Arc::new(value)
}
