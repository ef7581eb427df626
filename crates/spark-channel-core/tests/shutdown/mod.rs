//! The two-phase shutdown automaton: ordering, cross-thread initiation, and
//! handler-error resilience.

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use spark_channel_core::channel::{Channel, ChannelState};
use spark_channel_core::handler::Direction;
use spark_channel_core::limits::CoreLimits;
use spark_channel_core::observability::NoopLogger;
use spark_channel_contract_tests::{FlakyHandler, RecordedEvent, RecordingHandler, TestEventLoop};

fn new_active_channel() -> (Channel, Arc<TestEventLoop>, Arc<AtomicI32>) {
    let event_loop = TestEventLoop::new();
    let shutdown_err = Arc::new(AtomicI32::new(i32::MIN));
    let shutdown_err2 = shutdown_err.clone();
    let channel = Channel::new(
        event_loop.clone(),
        CoreLimits::default(),
        Arc::new(NoopLogger),
        |_err| {},
        move |err| shutdown_err2.store(err, Ordering::SeqCst),
    );
    event_loop.run_until_idle();
    (channel, event_loop, shutdown_err)
}

#[test]
fn clean_shutdown_runs_read_left_to_right_then_write_right_to_left() {
    let (channel, event_loop, shutdown_err) = new_active_channel();

    let h1 = RecordingHandler::new(100, 0);
    let h1_obs = h1.handle();
    let s1 = channel.new_slot();
    channel.insert_end(s1).unwrap();
    channel.set_handler(s1, Box::new(h1)).unwrap();

    let h2 = RecordingHandler::new(50, 0);
    let h2_obs = h2.handle();
    let s2 = channel.new_slot();
    channel.insert_end(s2).unwrap();
    channel.set_handler(s2, Box::new(h2)).unwrap();

    channel.shutdown(7);
    event_loop.run_until_idle();

    assert_eq!(channel.state(), ChannelState::ShutDown);
    assert_eq!(shutdown_err.load(Ordering::SeqCst), 7);

    let h1_events = h1_obs.events();
    let h2_events = h2_obs.events();

    // Each handler sees its own four shutdown callbacks in READ-then-WRITE
    // order — it cannot be asked to shut down WRITE before its READ phase
    // has completed — followed by exactly one `Destroyed`, fired only once
    // both directions are done for every slot.
    let expected_tail = [
        RecordedEvent::ShutdownStarted(Direction::Read, 7, false),
        RecordedEvent::ShutdownCompleted(Direction::Read),
        RecordedEvent::ShutdownStarted(Direction::Write, 7, false),
        RecordedEvent::ShutdownCompleted(Direction::Write),
        RecordedEvent::Destroyed,
    ];
    assert_eq!(&h1_events[h1_events.len() - 5..], &expected_tail);
    assert_eq!(&h2_events[h2_events.len() - 5..], &expected_tail);
}

#[test]
fn shutdown_is_idempotent() {
    let (channel, event_loop, shutdown_err) = new_active_channel();
    channel.shutdown(3);
    channel.shutdown(99); // second call must be a no-op
    event_loop.run_until_idle();
    assert_eq!(shutdown_err.load(Ordering::SeqCst), 3, "only the first shutdown() call's error sticks");
}

#[test]
fn shutdown_with_no_slots_completes_immediately() {
    let (channel, event_loop, shutdown_err) = new_active_channel();
    channel.shutdown(0);
    event_loop.run_until_idle();
    assert_eq!(channel.state(), ChannelState::ShutDown);
    assert_eq!(shutdown_err.load(Ordering::SeqCst), 0);
}

#[test]
fn handler_shutdown_error_does_not_stall_the_automaton() {
    let (channel, event_loop, shutdown_err) = new_active_channel();

    let s1 = channel.new_slot();
    channel.insert_end(s1).unwrap();
    channel.set_handler(s1, Box::new(FlakyHandler::new("s1.flaky"))).unwrap();

    let h2 = RecordingHandler::new(10, 0);
    let h2_obs = h2.handle();
    let s2 = channel.new_slot();
    channel.insert_end(s2).unwrap();
    channel.set_handler(s2, Box::new(h2)).unwrap();

    channel.shutdown(11);
    event_loop.run_until_idle();

    assert_eq!(channel.state(), ChannelState::ShutDown, "a handler returning Err from shutdown() must not halt the sequence");
    assert!(h2_obs.events().contains(&RecordedEvent::ShutdownCompleted(Direction::Write)));
    let _ = shutdown_err;
}

#[test]
fn deferred_shutdown_completes_once_the_scheduled_task_runs() {
    let (channel, event_loop, _shutdown_err) = new_active_channel();

    let h1 = RecordingHandler::new(10, 0).deferred();
    let s1 = channel.new_slot();
    channel.insert_end(s1).unwrap();
    channel.set_handler(s1, Box::new(h1)).unwrap();

    channel.shutdown(1);
    // Shutdown started, but h1's shutdown() only scheduled a task — the
    // automaton cannot have reached SHUT_DOWN yet.
    assert_ne!(channel.state(), ChannelState::ShutDown);

    event_loop.run_until_idle();
    assert_eq!(channel.state(), ChannelState::ShutDown);
}

#[test]
fn shutdown_urgent_asks_handlers_to_free_scarce_resources() {
    let (channel, event_loop, _shutdown_err) = new_active_channel();

    let h1 = RecordingHandler::new(10, 0);
    let h1_obs = h1.handle();
    let s1 = channel.new_slot();
    channel.insert_end(s1).unwrap();
    channel.set_handler(s1, Box::new(h1)).unwrap();

    channel.shutdown_urgent(5);
    event_loop.run_until_idle();

    assert!(h1_obs
        .events()
        .iter()
        .any(|e| matches!(e, RecordedEvent::ShutdownStarted(_, _, true))));
}

#[test]
fn shutdown_initiated_from_a_foreign_thread_is_deferred_to_the_owning_thread() {
    let (channel, event_loop, shutdown_err) = new_active_channel();

    let h1 = RecordingHandler::new(10, 0);
    let h1_obs = h1.handle();
    let s1 = channel.new_slot();
    channel.insert_end(s1).unwrap();
    channel.set_handler(s1, Box::new(h1)).unwrap();

    let hold = channel.acquire_hold();
    let worker = std::thread::spawn(move || {
        hold.shutdown(42);
    });
    worker.join().unwrap();

    // The foreign thread only enqueued a task; nothing has run yet.
    assert_ne!(channel.state(), ChannelState::ShutDown);

    event_loop.run_until_idle();

    assert_eq!(channel.state(), ChannelState::ShutDown);
    assert_eq!(shutdown_err.load(Ordering::SeqCst), 42);
    assert!(h1_obs.events().contains(&RecordedEvent::ShutdownCompleted(Direction::Read)));
}
