//! Chain construction, window accounting, and message routing.

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use spark_channel_core::channel::Channel;
use spark_channel_core::handler::Direction;
use spark_channel_core::limits::CoreLimits;
use spark_channel_core::message::{Message, MessageKind};
use spark_channel_core::observability::NoopLogger;
use spark_channel_contract_tests::{RecordedEvent, RecordingHandler, TestEventLoop};

fn new_active_channel() -> (Channel, Arc<TestEventLoop>) {
    let event_loop = TestEventLoop::new();
    let setup_err = Arc::new(AtomicI32::new(-1));
    let setup_err2 = setup_err.clone();
    let channel = Channel::new(
        event_loop.clone(),
        CoreLimits::default(),
        Arc::new(NoopLogger),
        move |err| setup_err2.store(err, Ordering::SeqCst),
        |_err| {},
    );
    event_loop.run_until_idle();
    assert_eq!(setup_err.load(Ordering::SeqCst), 0, "setup should report success");
    (channel, event_loop)
}

#[test]
fn happy_path_two_handlers_wire_window_and_overhead() {
    let (channel, _loop) = new_active_channel();

    let h1 = RecordingHandler::new(1024, 0);
    let h1_obs = h1.handle();
    let s1 = channel.new_slot();
    channel.insert_end(s1).unwrap();
    channel.set_handler(s1, Box::new(h1)).unwrap();

    assert_eq!(channel.window_size(s1), 1024);

    let h2 = RecordingHandler::new(512, 8);
    let s2 = channel.new_slot();
    channel.insert_end(s2).unwrap();
    channel.set_handler(s2, Box::new(h2)).unwrap();

    assert_eq!(channel.window_size(s2), 512);
    assert_eq!(channel.upstream_message_overhead(s2), 0, "only h1 is to h2's left, and h1 has no overhead");

    // h1 observed the window increment h2's attach propagated upstream.
    assert!(h1_obs
        .events()
        .iter()
        .any(|e| *e == RecordedEvent::WindowIncrement(512)));
}

#[test]
fn set_handler_with_no_left_neighbor_skips_propagation_silently() {
    let (channel, _loop) = new_active_channel();
    let s1 = channel.new_slot();
    channel.insert_end(s1).unwrap();
    // Must not panic even though there is nothing upstream of s1.
    channel.set_handler(s1, Box::new(RecordingHandler::new(100, 0))).unwrap();
    assert_eq!(channel.window_size(s1), 100);
}

#[test]
fn set_handler_twice_on_same_slot_is_rejected() {
    let (channel, _loop) = new_active_channel();
    let s1 = channel.new_slot();
    channel.insert_end(s1).unwrap();
    channel.set_handler(s1, Box::new(RecordingHandler::new(10, 0))).unwrap();
    let err = channel.set_handler(s1, Box::new(RecordingHandler::new(10, 0))).unwrap_err();
    assert_eq!(err.code(), spark_channel_core::error::codes::HANDLER_ALREADY_SET);
}

fn two_slot_pipeline(channel: &Channel, w1: u64, w2: u64) -> (spark_channel_core::slot::SlotIndex, spark_channel_core::slot::SlotIndex) {
    let s1 = channel.new_slot();
    channel.insert_end(s1).unwrap();
    channel.set_handler(s1, Box::new(RecordingHandler::new(w1, 0))).unwrap();
    let s2 = channel.new_slot();
    channel.insert_end(s2).unwrap();
    channel.set_handler(s2, Box::new(RecordingHandler::new(w2, 0))).unwrap();
    (s1, s2)
}

#[test]
fn backpressure_rejects_reads_larger_than_downstream_window() {
    let (channel, _loop) = new_active_channel();
    let (s1, s2) = two_slot_pipeline(&channel, 100, 50);

    let msg = Message::new(MessageKind::Raw, vec![0u8; 80]);
    let err = channel.send_message(s1, msg, Direction::Read).unwrap_err().1;
    assert_eq!(err.code(), spark_channel_core::error::codes::WINDOW_EXCEEDED);
    assert_eq!(channel.window_size(s2), 50, "a rejected send must not touch the window");

    let msg = Message::new(MessageKind::Raw, vec![0u8; 50]);
    channel.send_message(s1, msg, Direction::Read).unwrap();
    assert_eq!(channel.window_size(s2), 0);

    let msg = Message::new(MessageKind::Raw, vec![0u8; 1]);
    let err = channel.send_message(s1, msg, Direction::Read).unwrap_err().1;
    assert_eq!(err.code(), spark_channel_core::error::codes::WINDOW_EXCEEDED);
}

#[test]
fn send_message_exactly_at_window_boundary_succeeds_and_drains_to_zero() {
    let (channel, _loop) = new_active_channel();
    let (s1, s2) = two_slot_pipeline(&channel, 100, 50);
    let msg = Message::new(MessageKind::Raw, vec![0u8; 50]);
    channel.send_message(s1, msg, Direction::Read).unwrap();
    assert_eq!(channel.window_size(s2), 0);
}

#[test]
fn reading_from_rightmost_slot_is_undeliverable() {
    let (channel, _loop) = new_active_channel();
    let (_s1, s2) = two_slot_pipeline(&channel, 100, 50);
    let msg = Message::new(MessageKind::Raw, vec![0u8; 1]);
    let (returned, err) = channel.send_message(s2, msg, Direction::Read).unwrap_err();
    assert_eq!(err.code(), spark_channel_core::error::codes::NO_RIGHT_NEIGHBOR);
    assert_eq!(returned.len(), 1, "caller must retain ownership on error");
}

#[test]
fn writing_from_leftmost_slot_is_undeliverable() {
    let (channel, _loop) = new_active_channel();
    let (s1, _s2) = two_slot_pipeline(&channel, 100, 50);
    let msg = Message::new(MessageKind::Raw, vec![0u8; 1]);
    let (returned, err) = channel.send_message(s1, msg, Direction::Write).unwrap_err();
    assert_eq!(err.code(), spark_channel_core::error::codes::NO_LEFT_NEIGHBOR);
    assert_eq!(returned.len(), 1);
}

#[test]
fn write_direction_performs_no_window_check() {
    let (channel, _loop) = new_active_channel();
    let (s1, s2) = two_slot_pipeline(&channel, 0, 0);
    // s1's window is 0, but WRITE flows toward s1 and must not be bounded by it.
    let msg = Message::new(MessageKind::ApplicationData, vec![0u8; 10_000]);
    channel.send_message(s2, msg, Direction::Write).unwrap();
}

#[test]
fn increment_read_window_is_additive_and_saturating() {
    let (channel, _loop) = new_active_channel();
    let s1 = channel.new_slot();
    channel.insert_end(s1).unwrap();
    channel.set_handler(s1, Box::new(RecordingHandler::new(0, 0))).unwrap();

    channel.increment_read_window(s1, 10);
    channel.increment_read_window(s1, 32);
    assert_eq!(channel.window_size(s1), 42);

    channel.increment_read_window(s1, u64::MAX);
    assert_eq!(channel.window_size(s1), u64::MAX, "increments saturate rather than overflow");
}

#[test]
fn downstream_read_window_reflects_right_neighbor_and_zero_when_absent() {
    let (channel, _loop) = new_active_channel();
    let (s1, _s2) = two_slot_pipeline(&channel, 100, 50);
    assert_eq!(channel.downstream_read_window(s1), 50);
    let tail = channel.get_last_slot().unwrap();
    assert_eq!(channel.downstream_read_window(tail), 0);
}

#[test]
fn chain_mutation_recomputes_overhead_to_the_right() {
    let (channel, _loop) = new_active_channel();
    let (s1, s2) = two_slot_pipeline(&channel, 100, 50);
    assert_eq!(channel.upstream_message_overhead(s2), 0);

    // Insert a 12-byte-overhead handler between s1 and s2; s2's cached
    // overhead must be recomputed to include it.
    let middle = channel.new_slot();
    channel.insert_right(s1, middle).unwrap();
    channel.set_handler(middle, Box::new(RecordingHandler::new(50, 12))).unwrap();

    assert_eq!(channel.upstream_message_overhead(middle), 0);
    assert_eq!(channel.upstream_message_overhead(s2), 12);
}

#[test]
fn insert_left_wires_neighbors_and_head_correctly() {
    let (channel, _loop) = new_active_channel();
    let (s1, _s2) = two_slot_pipeline(&channel, 100, 50);

    let new_head = channel.new_slot();
    channel.insert_left(s1, new_head).unwrap();
    channel.set_handler(new_head, Box::new(RecordingHandler::new(10, 0))).unwrap();

    assert_eq!(channel.get_first_slot(), Some(new_head));
}

#[test]
fn remove_unlinks_and_destroys_handler_immediately() {
    let (channel, _loop) = new_active_channel();
    let (s1, s2) = two_slot_pipeline(&channel, 100, 50);

    let middle = channel.new_slot();
    channel.insert_right(s1, middle).unwrap();
    let mid_handler = RecordingHandler::new(50, 0);
    let mid_obs = mid_handler.handle();
    channel.set_handler(middle, Box::new(mid_handler)).unwrap();

    channel.remove(middle).unwrap();
    assert!(mid_obs.events().contains(&RecordedEvent::Destroyed));

    // s1 and s2 are directly linked again.
    assert_eq!(channel.downstream_read_window(s1), channel.window_size(s2));
}

#[test]
fn replace_swaps_position_and_destroys_old_handler() {
    let (channel, _loop) = new_active_channel();
    let s1 = channel.new_slot();
    channel.insert_end(s1).unwrap();
    let old_handler = RecordingHandler::new(100, 0);
    let old_obs = old_handler.handle();
    channel.set_handler(s1, Box::new(old_handler)).unwrap();

    let new_slot = channel.new_slot();
    channel.replace(s1, new_slot).unwrap();
    channel
        .set_handler(new_slot, Box::new(RecordingHandler::new(77, 0)))
        .unwrap();

    assert_eq!(channel.get_first_slot(), Some(new_slot));
    assert!(old_obs.events().contains(&RecordedEvent::Destroyed));
}

#[test]
fn acquire_message_from_pool_clamps_to_fragment_budget() {
    let (channel, _loop) = new_active_channel();
    let s1 = channel.new_slot();
    channel.insert_end(s1).unwrap();
    channel
        .set_handler(s1, Box::new(RecordingHandler::new(0, 100)))
        .unwrap();

    let limit = channel.max_fragment_size();
    let msg = channel
        .acquire_message_from_pool(MessageKind::Raw, limit * 2)
        .unwrap();
    assert!(
        msg.capacity() <= limit,
        "pool acquisition must never exceed the process-wide fragment budget"
    );
}
