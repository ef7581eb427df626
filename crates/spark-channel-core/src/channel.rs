//! The channel: owner of the slot arena and driver of the two-phase shutdown
//! automaton.
//!
//! Slots are kept in a `Vec<Option<SlotRecord>>` indexed by [`SlotIndex`]
//! rather than linked through owned pointers — removal tombstones an entry
//! (sets it to `None`) instead of shifting the vector, so indices handed out
//! earlier stay valid for the channel's whole life. All chain mutation and
//! dispatch happens behind one `spin::Mutex<Machine>`; handlers are always
//! taken out of their slot record before a callback into them and put back
//! afterward, so a handler that reenters the channel mid-callback (the
//! shutdown cascade routinely does this) never tries to re-lock a mutex it
//! already holds.

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicI32, Ordering};

use spin::Mutex;

use crate::error::{codes, CoreError};
use crate::event_loop::{EventLoop, LocalObject};
use crate::handler::{Direction, Handler};
use crate::limits::CoreLimits;
use crate::message::{Message, MessageKind};
use crate::observability::{clog, LogSeverity, Logger};
use crate::slot::{SlotHandle, SlotIndex};
use crate::task::{ChannelTask, TaskStatus};

/// Channel lifecycle state, advanced only on the channel's event-loop
/// thread.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChannelState {
    Initializing,
    Active,
    ShuttingDownRead,
    ShuttingDownWrite,
    ShutDown,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ShutdownPhase {
    NotStarted,
    Pending,
    Done,
}

struct SlotRecord {
    handler: Option<Box<dyn Handler>>,
    left: Option<SlotIndex>,
    right: Option<SlotIndex>,
    window_size: u64,
    upstream_message_overhead: usize,
    read_phase: ShutdownPhase,
    write_phase: ShutdownPhase,
}

impl SlotRecord {
    fn empty() -> Self {
        Self {
            handler: None,
            left: None,
            right: None,
            window_size: 0,
            upstream_message_overhead: 0,
            read_phase: ShutdownPhase::NotStarted,
            write_phase: ShutdownPhase::NotStarted,
        }
    }
}

struct PendingTask {
    task: ChannelTask,
    run_at_nanos: Option<u64>,
}

/// The function half of a task handed to the event loop, shared between the
/// wrapped task the loop actually holds and the channel's own bookkeeping so
/// either side can be the one to invoke it — whichever happens first wins,
/// and `Option::take` keeps that a true "exactly once" regardless of which
/// side gets there. See [`ChannelShared::track`].
type SharedTaskFn = Arc<Mutex<Option<Box<dyn FnOnce(TaskStatus) + Send>>>>;

struct Machine {
    state: ChannelState,
    slots: Vec<Option<SlotRecord>>,
    head: Option<SlotIndex>,
    pending_tasks: Vec<PendingTask>,
    live_tasks: BTreeMap<u64, SharedTaskFn>,
    next_task_id: u64,
    on_setup_completed: Option<Box<dyn FnOnce(i32) + Send>>,
    on_shutdown_completed: Option<Box<dyn FnOnce(i32) + Send>>,
}

enum NextShutdownStep {
    Continue(SlotIndex, Direction),
    StartWrite(SlotIndex),
    Completed,
}

pub(crate) struct ChannelShared {
    event_loop: Arc<dyn EventLoop>,
    limits: CoreLimits,
    logger: Arc<dyn Logger>,
    shutdown_called: AtomicBool,
    first_error: AtomicI32,
    machine: Mutex<Machine>,
    on_drop: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl Drop for ChannelShared {
    fn drop(&mut self) {
        if let Some(hook) = self.on_drop.lock().take() {
            hook();
        }
    }
}

impl ChannelShared {
    fn state(&self) -> ChannelState {
        self.machine.lock().state
    }

    fn with_handler<R>(
        self: &Arc<Self>,
        idx: SlotIndex,
        f: impl FnOnce(&mut dyn Handler, &SlotHandle) -> R,
    ) -> Option<R> {
        let taken = {
            let mut m = self.machine.lock();
            m.slots
                .get_mut(idx.0)
                .and_then(|s| s.as_mut())
                .and_then(|rec| rec.handler.take())
        };
        let mut handler = taken?;
        let slot_handle = SlotHandle {
            channel: self.clone(),
            index: idx,
        };
        let result = f(handler.as_mut(), &slot_handle);
        {
            let mut m = self.machine.lock();
            if let Some(rec) = m.slots.get_mut(idx.0).and_then(|s| s.as_mut()) {
                rec.handler = Some(handler);
            }
            // If the slot vanished (removed concurrently mid-callback) the
            // handler is simply dropped here without a second `destroy()`
            // call — `remove`/`replace` already ran it before tombstoning.
        }
        Some(result)
    }

    fn report_handler_error(self: &Arc<Self>, err: CoreError) {
        clog!(
            self.logger,
            LogSeverity::Error,
            "channel.handler_error",
            "handler reported an error: {}",
            err
        );
        self.shutdown(err.stable_code());
    }

    // ---- chain mutation -------------------------------------------------

    pub(crate) fn new_slot(self: &Arc<Self>) -> SlotIndex {
        let mut m = self.machine.lock();
        let idx = SlotIndex(m.slots.len());
        m.slots.push(Some(SlotRecord::empty()));
        idx
    }

    pub(crate) fn insert_right(self: &Arc<Self>, existing: SlotIndex, new: SlotIndex) -> Result<(), CoreError> {
        let mut m = self.machine.lock();
        if m.slots.get(existing.0).and_then(|s| s.as_ref()).is_none() {
            return Err(CoreError::state(codes::UNDELIVERABLE, "existing slot not found"));
        }
        link_right_of(&mut m, existing, new);
        Ok(())
    }

    pub(crate) fn insert_left(self: &Arc<Self>, existing: SlotIndex, new: SlotIndex) -> Result<(), CoreError> {
        let mut m = self.machine.lock();
        let old_left = m
            .slots
            .get(existing.0)
            .and_then(|s| s.as_ref())
            .ok_or_else(|| CoreError::state(codes::UNDELIVERABLE, "existing slot not found"))?
            .left;
        {
            let new_rec = m.slots[new.0].as_mut().expect("new slot index must come from new_slot");
            new_rec.left = old_left;
            new_rec.right = Some(existing);
        }
        match old_left {
            Some(ol) => m.slots[ol.0].as_mut().unwrap().right = Some(new),
            None => m.head = Some(new),
        }
        m.slots[existing.0].as_mut().unwrap().left = Some(new);
        recompute_overhead_from(&mut m, new);
        Ok(())
    }

    pub(crate) fn insert_end(self: &Arc<Self>, new: SlotIndex) -> Result<(), CoreError> {
        let mut m = self.machine.lock();
        match m.head {
            None => {
                m.head = Some(new);
                Ok(())
            }
            Some(head) => {
                let mut cur = head;
                loop {
                    let right = m.slots[cur.0].as_ref().unwrap().right;
                    match right {
                        Some(r) => cur = r,
                        None => break,
                    }
                }
                link_right_of(&mut m, cur, new);
                Ok(())
            }
        }
    }

    pub(crate) fn set_handler(self: &Arc<Self>, idx: SlotIndex, handler: Box<dyn Handler>) -> Result<(), CoreError> {
        let (initial_window, left) = {
            let mut m = self.machine.lock();
            let rec = m
                .slots
                .get_mut(idx.0)
                .and_then(|s| s.as_mut())
                .ok_or_else(|| CoreError::state(codes::UNDELIVERABLE, "slot not found"))?;
            if rec.handler.is_some() {
                return Err(CoreError::state(codes::HANDLER_ALREADY_SET, "slot already has a handler"));
            }
            let initial_window = handler.initial_window_size();
            rec.window_size = initial_window;
            rec.handler = Some(handler);
            let left = rec.left;
            recompute_overhead_from(&mut m, idx);
            (initial_window, left)
        };
        // A slot with no left neighbor computes its window but silently
        // skips upstream propagation — there is nothing upstream to
        // propagate to.
        if let Some(left_idx) = left {
            self.with_handler(left_idx, |handler, slot_handle| {
                handler.increment_read_window(slot_handle, initial_window);
            });
        }
        Ok(())
    }

    pub(crate) fn remove(self: &Arc<Self>, idx: SlotIndex) -> Result<(), CoreError> {
        if self.state() != ChannelState::Active {
            return Err(CoreError::state(
                codes::SLOT_REMOVE_WHILE_INACTIVE,
                "slot_remove is only permitted while the channel is ACTIVE",
            ));
        }
        let mut handler = {
            let mut m = self.machine.lock();
            let rec = m
                .slots
                .get_mut(idx.0)
                .and_then(|s| s.take())
                .ok_or_else(|| CoreError::state(codes::UNDELIVERABLE, "slot not found"))?;
            match rec.left {
                Some(l) => m.slots[l.0].as_mut().unwrap().right = rec.right,
                None => m.head = rec.right,
            }
            if let Some(r) = rec.right {
                m.slots[r.0].as_mut().unwrap().left = rec.left;
            }
            if let Some(r) = rec.right {
                recompute_overhead_from(&mut m, r);
            }
            rec.handler
        };
        if let Some(h) = handler.as_mut() {
            h.destroy();
        }
        Ok(())
    }

    pub(crate) fn replace(self: &Arc<Self>, old: SlotIndex, new: SlotIndex) -> Result<(), CoreError> {
        let mut old_handler = {
            let mut m = self.machine.lock();
            let (left, right) = {
                let old_rec = m
                    .slots
                    .get(old.0)
                    .and_then(|s| s.as_ref())
                    .ok_or_else(|| CoreError::state(codes::UNDELIVERABLE, "old slot not found"))?;
                (old_rec.left, old_rec.right)
            };
            {
                let new_rec = m.slots[new.0].as_mut().expect("new slot index must come from new_slot");
                new_rec.left = left;
                new_rec.right = right;
            }
            match left {
                Some(l) => m.slots[l.0].as_mut().unwrap().right = Some(new),
                None => m.head = Some(new),
            }
            if let Some(r) = right {
                m.slots[r.0].as_mut().unwrap().left = Some(new);
            }
            let old_handler = m.slots[old.0].take().and_then(|rec| rec.handler);
            recompute_overhead_from(&mut m, new);
            old_handler
        };
        if let Some(h) = old_handler.as_mut() {
            h.destroy();
        }
        Ok(())
    }

    // ---- per-slot accessors ---------------------------------------------

    pub(crate) fn window_size(&self, idx: SlotIndex) -> u64 {
        self.machine
            .lock()
            .slots
            .get(idx.0)
            .and_then(|s| s.as_ref())
            .map(|r| r.window_size)
            .unwrap_or(0)
    }

    pub(crate) fn downstream_read_window(&self, idx: SlotIndex) -> u64 {
        let m = self.machine.lock();
        m.slots
            .get(idx.0)
            .and_then(|s| s.as_ref())
            .and_then(|rec| rec.right)
            .and_then(|r| m.slots.get(r.0).and_then(|s| s.as_ref()).map(|rr| rr.window_size))
            .unwrap_or(0)
    }

    pub(crate) fn upstream_message_overhead(&self, idx: SlotIndex) -> usize {
        self.machine
            .lock()
            .slots
            .get(idx.0)
            .and_then(|s| s.as_ref())
            .map(|r| r.upstream_message_overhead)
            .unwrap_or(0)
    }

    pub(crate) fn get_first_slot(&self) -> Option<SlotIndex> {
        self.machine.lock().head
    }

    pub(crate) fn get_last_slot(&self) -> Option<SlotIndex> {
        let m = self.machine.lock();
        let mut cur = m.head?;
        loop {
            match m.slots[cur.0].as_ref().unwrap().right {
                Some(r) => cur = r,
                None => return Some(cur),
            }
        }
    }

    // ---- messages ---------------------------------------------------------

    pub(crate) fn send_message(
        self: &Arc<Self>,
        from: SlotIndex,
        msg: Message,
        dir: Direction,
    ) -> Result<(), (Message, CoreError)> {
        let target = {
            let m = self.machine.lock();
            let rec = match m.slots.get(from.0).and_then(|s| s.as_ref()) {
                Some(r) => r,
                None => return Err((msg, CoreError::state(codes::UNDELIVERABLE, "sending slot not found"))),
            };
            match dir {
                Direction::Read => rec.right,
                Direction::Write => rec.left,
            }
        };
        let target = match target {
            Some(t) => t,
            None => {
                let code = match dir {
                    Direction::Read => codes::NO_RIGHT_NEIGHBOR,
                    Direction::Write => codes::NO_LEFT_NEIGHBOR,
                };
                return Err((msg, CoreError::state(code, "no neighbor in that direction")));
            }
        };
        // WRITE sends perform no window check at all, only READ sends draw
        // down the target's window.
        if dir == Direction::Read {
            let mut m = self.machine.lock();
            let rec = match m.slots.get_mut(target.0).and_then(|s| s.as_mut()) {
                Some(r) => r,
                None => return Err((msg, CoreError::state(codes::UNDELIVERABLE, "target slot not found"))),
            };
            if (msg.len() as u64) > rec.window_size {
                return Err((msg, CoreError::capacity(codes::WINDOW_EXCEEDED, "message exceeds downstream window")));
            }
            rec.window_size -= msg.len() as u64;
        }
        let taken = {
            let mut m = self.machine.lock();
            m.slots.get_mut(target.0).and_then(|s| s.as_mut()).and_then(|rec| rec.handler.take())
        };
        let mut handler = match taken {
            Some(h) => h,
            None => {
                if dir == Direction::Read {
                    let mut m = self.machine.lock();
                    if let Some(rec) = m.slots.get_mut(target.0).and_then(|s| s.as_mut()) {
                        rec.window_size = rec.window_size.saturating_add(msg.len() as u64);
                    }
                }
                return Err((msg, CoreError::state(codes::UNDELIVERABLE, "target slot has no handler")));
            }
        };
        let slot_handle = SlotHandle {
            channel: self.clone(),
            index: target,
        };
        let outcome = match dir {
            Direction::Read => handler.process_read_message(&slot_handle, msg),
            Direction::Write => handler.process_write_message(&slot_handle, msg),
        };
        {
            let mut m = self.machine.lock();
            if let Some(rec) = m.slots.get_mut(target.0).and_then(|s| s.as_mut()) {
                rec.handler = Some(handler);
            }
        }
        if let Err(err) = outcome {
            self.report_handler_error(err);
        }
        Ok(())
    }

    pub(crate) fn increment_read_window(self: &Arc<Self>, idx: SlotIndex, n: u64) {
        let left = {
            let mut m = self.machine.lock();
            match m.slots.get_mut(idx.0).and_then(|s| s.as_mut()) {
                Some(rec) => {
                    rec.window_size = rec.window_size.saturating_add(n);
                    rec.left
                }
                None => None,
            }
        };
        if let Some(left_idx) = left {
            self.with_handler(left_idx, |handler, slot_handle| {
                handler.increment_read_window(slot_handle, n);
            });
        }
    }

    pub(crate) fn acquire_message_from_pool(&self, kind: MessageKind, size_hint: usize) -> Result<Message, CoreError> {
        let head_overhead = {
            let m = self.machine.lock();
            m.head
                .and_then(|h| m.slots.get(h.0).and_then(|s| s.as_ref()))
                .map(|r| r.upstream_message_overhead)
                .unwrap_or(0)
        };
        let budget = self.limits.max_fragment_size().saturating_sub(head_overhead).max(1);
        let clamped = size_hint.min(budget);
        self.event_loop.acquire_message_from_pool(kind, clamped)
    }

    // ---- task scheduling --------------------------------------------------

    /// Wrap `task` so the channel can force it to run with `Canceled` at
    /// teardown even though the real event loop now owns the scheduling of
    /// it. The task's function moves into a `Mutex<Option<_>>` shared
    /// between the wrapper handed to the event loop and an entry in
    /// `live_tasks`; whichever side reaches it first (the event loop running
    /// it normally, or [`ChannelShared::cancel_live_tasks`] at teardown)
    /// takes the function and runs it, the other finds `None` and is a
    /// no-op. This is how a channel-scheduled task stays cancelable even
    /// though ownership of the `ChannelTask` itself has already passed to an
    /// event loop this crate does not control.
    fn track(self: &Arc<Self>, task: ChannelTask) -> ChannelTask {
        let (type_tag, func) = task.into_parts();
        let shared: SharedTaskFn = Arc::new(Mutex::new(Some(func)));
        let id = {
            let mut m = self.machine.lock();
            let id = m.next_task_id;
            m.next_task_id = m.next_task_id.wrapping_add(1);
            m.live_tasks.insert(id, shared.clone());
            id
        };
        let channel = self.clone();
        ChannelTask::new(type_tag, move |status| {
            channel.machine.lock().live_tasks.remove(&id);
            if let Some(func) = shared.lock().take() {
                func(status);
            }
        })
    }

    /// Force every task this channel has handed to the event loop but that
    /// has not yet run to run now, with `TaskStatus::Canceled`. Called once
    /// the channel finishes tearing down — by that point shutdown-critical
    /// deferred tasks (e.g. a handler's own suspended-shutdown completion)
    /// have already run and removed themselves from `live_tasks`, so what
    /// remains here is genuinely unrelated, never-going-to-run-otherwise
    /// work (a timeout scheduled an hour out, say).
    fn cancel_live_tasks(self: &Arc<Self>) {
        let remaining: Vec<SharedTaskFn> = {
            let mut m = self.machine.lock();
            core::mem::take(&mut m.live_tasks).into_values().collect()
        };
        for shared in remaining {
            if let Some(func) = shared.lock().take() {
                func(TaskStatus::Canceled);
            }
        }
    }

    pub(crate) fn schedule_task_now(self: &Arc<Self>, task: ChannelTask) {
        match self.state() {
            ChannelState::Initializing => self
                .machine
                .lock()
                .pending_tasks
                .push(PendingTask { task, run_at_nanos: None }),
            ChannelState::Active | ChannelState::ShuttingDownRead | ChannelState::ShuttingDownWrite => {
                let tracked = self.track(task);
                self.event_loop.schedule_task_now(tracked);
            }
            ChannelState::ShutDown => post_with_status(&self.event_loop, task, TaskStatus::Canceled),
        }
    }

    pub(crate) fn schedule_task_future(self: &Arc<Self>, task: ChannelTask, run_at_nanos: u64) {
        match self.state() {
            ChannelState::Initializing => self.machine.lock().pending_tasks.push(PendingTask {
                task,
                run_at_nanos: Some(run_at_nanos),
            }),
            ChannelState::Active | ChannelState::ShuttingDownRead | ChannelState::ShuttingDownWrite => {
                let tracked = self.track(task);
                self.event_loop.schedule_task_future(tracked, run_at_nanos);
            }
            ChannelState::ShutDown => post_with_status(&self.event_loop, task, TaskStatus::Canceled),
        }
    }

    pub(crate) fn current_clock_nanos(&self) -> u64 {
        self.event_loop.current_clock_nanos()
    }

    pub(crate) fn fetch_local_object(&self, key: &str) -> Option<LocalObject> {
        self.event_loop.fetch_local_object(key)
    }

    pub(crate) fn put_local_object(&self, key: &str, value: LocalObject) {
        self.event_loop.put_local_object(key, value);
    }

    pub(crate) fn remove_local_object(&self, key: &str) -> Option<LocalObject> {
        self.event_loop.remove_local_object(key)
    }

    pub(crate) fn thread_is_callers_thread(&self) -> bool {
        self.event_loop.is_on_this_thread()
    }

    pub(crate) fn max_fragment_size(&self) -> usize {
        self.limits.max_fragment_size()
    }

    // ---- setup --------------------------------------------------------------

    fn complete_setup(self: &Arc<Self>) {
        let (pending, setup_cb) = {
            let mut m = self.machine.lock();
            m.state = ChannelState::Active;
            let pending = core::mem::take(&mut m.pending_tasks);
            let cb = m.on_setup_completed.take();
            (pending, cb)
        };
        let shutdown_already_requested = self.shutdown_called.load(Ordering::Acquire);
        // If shutdown raced ahead of setup, every task queued before the
        // channel ever left INITIALIZING is invoked with `Canceled` here
        // rather than handed to the event loop: it will never get a chance
        // to run normally, since the very next thing this function does is
        // drive the channel straight into shutdown.
        for p in pending {
            if shutdown_already_requested {
                p.task.run(TaskStatus::Canceled);
            } else {
                match p.run_at_nanos {
                    Some(at) => {
                        let tracked = self.track(p.task);
                        self.event_loop.schedule_task_future(tracked, at)
                    }
                    None => {
                        let tracked = self.track(p.task);
                        self.event_loop.schedule_task_now(tracked)
                    }
                }
            }
        }
        let reported = if shutdown_already_requested {
            self.first_error.load(Ordering::Acquire)
        } else {
            0
        };
        if let Some(cb) = setup_cb {
            cb(reported);
        }
        if shutdown_already_requested {
            self.shutdown_on_channel_thread();
        }
    }

    // ---- shutdown -------------------------------------------------------

    pub(crate) fn shutdown(self: &Arc<Self>, err: i32) {
        self.shutdown_with_urgency(err, false)
    }

    pub(crate) fn shutdown_with_urgency(self: &Arc<Self>, err: i32, free_scarce: bool) {
        let already_called = self.shutdown_called.swap(true, Ordering::AcqRel);
        if already_called {
            return;
        }
        self.first_error.store(err, Ordering::Release);
        if self.event_loop.is_on_this_thread() {
            if self.state() != ChannelState::Initializing {
                self.shutdown_on_channel_thread_with(free_scarce);
            }
            // Initializing: `complete_setup` checks `shutdown_called` and
            // starts the sequence itself once setup finishes.
        } else {
            let me = self.clone();
            let task = ChannelTask::new("channel.shutdown", move |_status| {
                if me.state() != ChannelState::Initializing {
                    me.shutdown_on_channel_thread_with(free_scarce);
                }
            });
            self.schedule_task_now(task);
        }
    }

    fn shutdown_on_channel_thread(self: &Arc<Self>) {
        self.shutdown_on_channel_thread_with(false)
    }

    fn shutdown_on_channel_thread_with(self: &Arc<Self>, free_scarce: bool) {
        let head = {
            let mut m = self.machine.lock();
            if matches!(
                m.state,
                ChannelState::ShuttingDownRead | ChannelState::ShuttingDownWrite | ChannelState::ShutDown
            ) {
                return;
            }
            m.state = ChannelState::ShuttingDownRead;
            m.head
        };
        match head {
            Some(first) => self.drive_shutdown(first, Direction::Read, free_scarce),
            None => self.complete_shutdown(),
        }
    }

    pub(crate) fn drive_shutdown(self: &Arc<Self>, idx: SlotIndex, dir: Direction, free_scarce: bool) {
        let err = self.first_error.load(Ordering::Acquire);
        {
            let mut m = self.machine.lock();
            if let Some(rec) = m.slots.get_mut(idx.0).and_then(|s| s.as_mut()) {
                match dir {
                    Direction::Read => rec.read_phase = ShutdownPhase::Pending,
                    Direction::Write => rec.write_phase = ShutdownPhase::Pending,
                }
            }
        }
        let outcome = self.with_handler(idx, |handler, slot_handle| handler.shutdown(slot_handle, dir, err, free_scarce));
        match outcome {
            Some(Ok(())) => {}
            Some(Err(handler_err)) => {
                clog!(
                    self.logger,
                    LogSeverity::Error,
                    "channel.handler_shutdown_error",
                    "handler.shutdown({:?}) returned an error: {}",
                    dir,
                    handler_err
                );
                // The handler still owes an eventual on_handler_shutdown_complete
                // call; we only log here, we do not advance the automaton on its
                // behalf, since the handler may yet complete asynchronously.
            }
            None => self.on_handler_shutdown_complete(idx, dir, err, free_scarce),
        }
    }

    pub(crate) fn on_handler_shutdown_complete(self: &Arc<Self>, idx: SlotIndex, dir: Direction, _err: i32, free_scarce: bool) {
        let next = {
            let mut m = self.machine.lock();
            if let Some(rec) = m.slots.get_mut(idx.0).and_then(|s| s.as_mut()) {
                match dir {
                    Direction::Read => rec.read_phase = ShutdownPhase::Done,
                    Direction::Write => rec.write_phase = ShutdownPhase::Done,
                }
            }
            match dir {
                Direction::Read => {
                    let right = m.slots.get(idx.0).and_then(|s| s.as_ref()).and_then(|r| r.right);
                    match right {
                        Some(r) => NextShutdownStep::Continue(r, Direction::Read),
                        None => {
                            m.state = ChannelState::ShuttingDownWrite;
                            NextShutdownStep::StartWrite(idx)
                        }
                    }
                }
                Direction::Write => {
                    let left = m.slots.get(idx.0).and_then(|s| s.as_ref()).and_then(|r| r.left);
                    match left {
                        Some(l) => NextShutdownStep::Continue(l, Direction::Write),
                        None => {
                            m.state = ChannelState::ShutDown;
                            NextShutdownStep::Completed
                        }
                    }
                }
            }
        };
        // A handler is allowed to complete synchronously — calling this
        // method from inside its own `shutdown()`, before `with_handler` has
        // put it back into its slot record. Driving the next step with a
        // direct reentrant call here would run it while that slot (and, for
        // a fully synchronous cascade, potentially every slot visited so
        // far) still shows no handler present, which makes `with_handler`
        // think the slot is empty and silently auto-completes the phase
        // without ever invoking a real `shutdown()` call — exactly the kind
        // of corruption invariant 4 and 7 rule out. Posting the next step as
        // a task instead lets every `with_handler` frame on the call stack
        // return and restore its handler first.
        let channel = self.clone();
        match next {
            NextShutdownStep::Continue(next_idx, next_dir) => {
                self.event_loop
                    .schedule_task_now(ChannelTask::new("channel.shutdown_step", move |_status| {
                        channel.drive_shutdown(next_idx, next_dir, free_scarce);
                    }));
            }
            NextShutdownStep::StartWrite(rightmost) => {
                self.event_loop
                    .schedule_task_now(ChannelTask::new("channel.shutdown_step", move |_status| {
                        channel.drive_shutdown(rightmost, Direction::Write, free_scarce);
                    }));
            }
            NextShutdownStep::Completed => {
                self.event_loop
                    .schedule_task_now(ChannelTask::new("channel.shutdown_complete", move |_status| {
                        channel.complete_shutdown();
                    }));
            }
        }
    }

    fn complete_shutdown(self: &Arc<Self>) {
        let cb = {
            let mut m = self.machine.lock();
            m.state = ChannelState::ShutDown;
            m.on_shutdown_completed.take()
        };
        self.destroy_all_handlers();
        self.cancel_live_tasks();
        let err = self.first_error.load(Ordering::Acquire);
        if let Some(cb) = cb {
            cb(err);
        }
    }

    fn destroy_all_handlers(self: &Arc<Self>) {
        let mut handlers = Vec::new();
        {
            let mut m = self.machine.lock();
            for slot in m.slots.iter_mut() {
                if let Some(rec) = slot.as_mut() {
                    if let Some(h) = rec.handler.take() {
                        handlers.push(h);
                    }
                }
                *slot = None;
            }
            m.head = None;
        }
        for mut h in handlers {
            h.destroy();
        }
    }
}

fn link_right_of(m: &mut Machine, existing: SlotIndex, new: SlotIndex) {
    let old_right = m.slots[existing.0].as_ref().unwrap().right;
    {
        let new_rec = m.slots[new.0].as_mut().expect("new slot index must come from new_slot");
        new_rec.left = Some(existing);
        new_rec.right = old_right;
    }
    m.slots[existing.0].as_mut().unwrap().right = Some(new);
    if let Some(orr) = old_right {
        m.slots[orr.0].as_mut().unwrap().left = Some(new);
    }
    recompute_overhead_from(m, new);
}

/// Recompute `upstream_message_overhead` for `start` and every slot to its
/// right, since a chain edit can invalidate all of them at once.
fn recompute_overhead_from(m: &mut Machine, start: SlotIndex) {
    let mut cur = Some(start);
    while let Some(idx) = cur {
        let left = m.slots[idx.0].as_ref().unwrap().left;
        let overhead = match left {
            Some(l) => {
                let lrec = m.slots[l.0].as_ref().unwrap();
                let lh = lrec.handler.as_ref().map(|h| h.message_overhead()).unwrap_or(0);
                lrec.upstream_message_overhead + lh
            }
            None => 0,
        };
        let rec = m.slots[idx.0].as_mut().unwrap();
        rec.upstream_message_overhead = overhead;
        cur = rec.right;
    }
}

fn post_with_status(event_loop: &Arc<dyn EventLoop>, task: ChannelTask, status: TaskStatus) {
    let tag = task.type_tag();
    event_loop.schedule_task_now(ChannelTask::new(tag, move |_ignored| task.run(status)));
}

/// The owning handle to a channel: the result of [`Channel::new`], consumed
/// by [`Channel::destroy`].
///
/// Not `Clone` — ownership of a channel is meant to be unique: the owner
/// calls [`Channel::destroy`] exactly once. Anyone else who needs to keep
/// the channel alive takes a [`ChannelHold`] instead.
pub struct Channel {
    inner: Arc<ChannelShared>,
}

/// A reference that keeps a channel's shared state alive without implying
/// ownership of its lifecycle. Safe to hold and to drop from any thread.
#[derive(Clone)]
pub struct ChannelHold {
    inner: Arc<ChannelShared>,
}

impl Channel {
    /// Construct a new channel. `on_setup_completed` and `on_shutdown_completed`
    /// each fire exactly once: the former once the channel transitions out of
    /// `INITIALIZING`, the latter once it reaches `SHUT_DOWN`.
    pub fn new(
        event_loop: Arc<dyn EventLoop>,
        limits: CoreLimits,
        logger: Arc<dyn Logger>,
        on_setup_completed: impl FnOnce(i32) + Send + 'static,
        on_shutdown_completed: impl FnOnce(i32) + Send + 'static,
    ) -> Channel {
        let inner = Arc::new(ChannelShared {
            event_loop: event_loop.clone(),
            limits,
            logger,
            shutdown_called: AtomicBool::new(false),
            first_error: AtomicI32::new(0),
            machine: Mutex::new(Machine {
                state: ChannelState::Initializing,
                slots: Vec::new(),
                head: None,
                pending_tasks: Vec::new(),
                live_tasks: BTreeMap::new(),
                next_task_id: 0,
                on_setup_completed: Some(Box::new(on_setup_completed)),
                on_shutdown_completed: Some(Box::new(on_shutdown_completed)),
            }),
            on_drop: Mutex::new(None),
        });
        let setup_channel = inner.clone();
        let task = ChannelTask::new("channel.setup", move |_status| {
            setup_channel.complete_setup();
        });
        event_loop.schedule_task_now(task);
        Channel { inner }
    }

    pub fn state(&self) -> ChannelState {
        self.inner.state()
    }

    /// Begin an orderly two-phase shutdown with `err` as the reported cause
    /// (0 means "no error"). Idempotent: only the first call has any effect.
    pub fn shutdown(&self, err: i32) {
        self.inner.shutdown(err)
    }

    /// Like [`shutdown`](Self::shutdown), but marks the shutdown as arising
    /// from an adversarial condition: handlers are asked to release scarce
    /// OS resources (sockets, file descriptors) before returning from their
    /// `shutdown` callback, even if full completion is deferred.
    pub fn shutdown_urgent(&self, err: i32) {
        self.inner.shutdown_with_urgency(err, true)
    }

    pub fn acquire_hold(&self) -> ChannelHold {
        ChannelHold {
            inner: self.inner.clone(),
        }
    }

    /// Number of live references to this channel's shared state: this
    /// handle (if not yet consumed) plus every outstanding [`ChannelHold`].
    pub fn reference_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    /// Register a callback fired exactly once, when the last reference to
    /// this channel's shared state is dropped. Primarily useful for tests
    /// asserting that memory is reclaimed once a channel is destroyed and
    /// every hold released.
    pub fn on_teardown(&self, hook: impl FnOnce() + Send + 'static) {
        *self.inner.on_drop.lock() = Some(Box::new(hook));
    }

    pub fn schedule_task_now(&self, task: ChannelTask) {
        self.inner.schedule_task_now(task)
    }

    pub fn schedule_task_future(&self, task: ChannelTask, run_at_nanos: u64) {
        self.inner.schedule_task_future(task, run_at_nanos)
    }

    pub fn current_clock_nanos(&self) -> u64 {
        self.inner.current_clock_nanos()
    }

    pub fn thread_is_callers_thread(&self) -> bool {
        self.inner.thread_is_callers_thread()
    }

    pub fn fetch_local_object(&self, key: &str) -> Option<LocalObject> {
        self.inner.fetch_local_object(key)
    }

    pub fn put_local_object(&self, key: &str, value: LocalObject) {
        self.inner.put_local_object(key, value)
    }

    pub fn remove_local_object(&self, key: &str) -> Option<LocalObject> {
        self.inner.remove_local_object(key)
    }

    pub fn acquire_message_from_pool(&self, kind: MessageKind, size_hint: usize) -> Result<Message, CoreError> {
        self.inner.acquire_message_from_pool(kind, size_hint)
    }

    pub fn max_fragment_size(&self) -> usize {
        self.inner.max_fragment_size()
    }

    pub fn get_first_slot(&self) -> Option<SlotIndex> {
        self.inner.get_first_slot()
    }

    pub fn get_last_slot(&self) -> Option<SlotIndex> {
        self.inner.get_last_slot()
    }

    pub fn new_slot(&self) -> SlotIndex {
        debug_assert!(self.inner.thread_is_callers_thread());
        self.inner.new_slot()
    }

    pub fn insert_right(&self, existing: SlotIndex, new: SlotIndex) -> Result<(), CoreError> {
        debug_assert!(self.inner.thread_is_callers_thread());
        self.inner.insert_right(existing, new)
    }

    pub fn insert_left(&self, existing: SlotIndex, new: SlotIndex) -> Result<(), CoreError> {
        debug_assert!(self.inner.thread_is_callers_thread());
        self.inner.insert_left(existing, new)
    }

    pub fn insert_end(&self, new: SlotIndex) -> Result<(), CoreError> {
        debug_assert!(self.inner.thread_is_callers_thread());
        self.inner.insert_end(new)
    }

    pub fn set_handler(&self, idx: SlotIndex, handler: Box<dyn Handler>) -> Result<(), CoreError> {
        debug_assert!(self.inner.thread_is_callers_thread());
        self.inner.set_handler(idx, handler)
    }

    /// Remove a slot from the chain, destroying its handler immediately.
    /// Rejected unless the channel is `ACTIVE`.
    pub fn remove(&self, idx: SlotIndex) -> Result<(), CoreError> {
        debug_assert!(self.inner.thread_is_callers_thread());
        self.inner.remove(idx)
    }

    /// Swap `old` for `new` at the same chain position, destroying `old`'s
    /// handler immediately (e.g. retiring a handshake handler once a
    /// handshake completes).
    pub fn replace(&self, old: SlotIndex, new: SlotIndex) -> Result<(), CoreError> {
        debug_assert!(self.inner.thread_is_callers_thread());
        self.inner.replace(old, new)
    }

    pub fn send_message(&self, from: SlotIndex, msg: Message, dir: Direction) -> Result<(), (Message, CoreError)> {
        debug_assert!(self.inner.thread_is_callers_thread());
        self.inner.send_message(from, msg, dir)
    }

    pub fn increment_read_window(&self, idx: SlotIndex, n: u64) {
        debug_assert!(self.inner.thread_is_callers_thread());
        self.inner.increment_read_window(idx, n)
    }

    pub fn window_size(&self, idx: SlotIndex) -> u64 {
        self.inner.window_size(idx)
    }

    pub fn downstream_read_window(&self, idx: SlotIndex) -> u64 {
        self.inner.downstream_read_window(idx)
    }

    pub fn upstream_message_overhead(&self, idx: SlotIndex) -> usize {
        self.inner.upstream_message_overhead(idx)
    }

    /// Give up this handle's ownership stake in the channel. Shared state is
    /// freed once this and every outstanding [`ChannelHold`] have dropped —
    /// Rust's own `Arc` refcounting stands in for a hand-rolled
    /// destroy-flag-plus-refcount pairing, since by the time the last
    /// reference drops here, shutdown has always already quiesced handler
    /// activity.
    pub fn destroy(self) {
        drop(self)
    }
}

impl ChannelHold {
    pub fn reference_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    pub fn shutdown(&self, err: i32) {
        self.inner.shutdown(err)
    }

    pub fn schedule_task_now(&self, task: ChannelTask) {
        self.inner.schedule_task_now(task)
    }

    pub fn schedule_task_future(&self, task: ChannelTask, run_at_nanos: u64) {
        self.inner.schedule_task_future(task, run_at_nanos)
    }

    pub fn thread_is_callers_thread(&self) -> bool {
        self.inner.thread_is_callers_thread()
    }

    /// Release this hold. Equivalent to dropping it; provided for call sites
    /// that prefer an explicit verb.
    pub fn release(self) {
        drop(self)
    }
}
