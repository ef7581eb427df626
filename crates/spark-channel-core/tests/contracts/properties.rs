//! Property-based invariant checks over the window/overhead arithmetic and
//! shutdown idempotence, quantified over the value ranges in
//! `spark_channel_contract_tests::strategies`.

use std::sync::Arc;

use proptest::prelude::*;

use spark_channel_core::channel::{Channel, ChannelState};
use spark_channel_core::handler::Direction;
use spark_channel_core::limits::CoreLimits;
use spark_channel_core::message::{Message, MessageKind};
use spark_channel_core::observability::NoopLogger;
use spark_channel_contract_tests::strategies::{
    fitting_len_and_window, overflowing_len_and_window, window_increment_deltas,
};
use spark_channel_contract_tests::{RecordingHandler, TestEventLoop};

fn single_hop_channel(window: u64) -> (Channel, Arc<TestEventLoop>, spark_channel_core::slot::SlotIndex) {
    let event_loop = TestEventLoop::new();
    let channel = Channel::new(
        event_loop.clone(),
        CoreLimits::default(),
        Arc::new(NoopLogger),
        |_err| {},
        |_err| {},
    );
    event_loop.run_until_idle();

    let source = channel.new_slot();
    channel.insert_end(source).unwrap();
    channel.set_handler(source, Box::new(RecordingHandler::new(0, 0))).unwrap();

    let sink = channel.new_slot();
    channel.insert_end(sink).unwrap();
    channel.set_handler(sink, Box::new(RecordingHandler::new(window, 0))).unwrap();

    (channel, event_loop, source)
}

proptest! {
    /// A READ send whose length fits the downstream window always succeeds
    /// and decrements that window by exactly the message length.
    #[test]
    fn fitting_reads_always_succeed_and_decrement_window_exactly((len, window) in fitting_len_and_window()) {
        let (channel, _loop, source) = single_hop_channel(window);
        let sink = channel.get_last_slot().unwrap();
        let before = channel.window_size(sink);
        let msg = Message::new(MessageKind::Raw, vec![0u8; len]);
        prop_assert!(channel.send_message(source, msg, Direction::Read).is_ok());
        prop_assert_eq!(channel.window_size(sink), before - len as u64);
    }

    /// A READ send whose length overflows the downstream window is always
    /// rejected and leaves the window untouched.
    #[test]
    fn overflowing_reads_are_always_rejected_and_preserve_ownership((len, window) in overflowing_len_and_window()) {
        let (channel, _loop, source) = single_hop_channel(window);
        let sink = channel.get_last_slot().unwrap();
        let before = channel.window_size(sink);
        let msg = Message::new(MessageKind::Raw, vec![0u8; len]);
        let result = channel.send_message(source, msg, Direction::Read);
        prop_assert!(result.is_err());
        let (returned, err) = result.unwrap_err();
        prop_assert_eq!(returned.len(), len);
        prop_assert_eq!(err.code(), spark_channel_core::error::codes::WINDOW_EXCEEDED);
        prop_assert_eq!(channel.window_size(sink), before);
    }

    /// Applying a sequence of window increments one at a time always yields
    /// the same final window as applying their sum in one increment.
    #[test]
    fn window_increments_are_additive(deltas in window_increment_deltas()) {
        let (channel, _loop, _source) = single_hop_channel(0);
        let sink = channel.get_last_slot().unwrap();

        let piecewise_start = channel.window_size(sink);
        for d in &deltas {
            channel.increment_read_window(sink, *d);
        }
        let piecewise_total = channel.window_size(sink);

        let (channel2, _loop2, _source2) = single_hop_channel(0);
        let sink2 = channel2.get_last_slot().unwrap();
        let combined: u64 = deltas.iter().fold(0u64, |acc, d| acc.saturating_add(*d));
        channel2.increment_read_window(sink2, combined);

        prop_assert_eq!(piecewise_total - piecewise_start, channel2.window_size(sink2));
    }

    /// Calling `shutdown` any number of times with any sequence of error
    /// codes always leaves the channel SHUT_DOWN with the first call's code
    /// as the reported cause.
    #[test]
    fn shutdown_is_idempotent_regardless_of_call_count(first in 0i32..1000, rest in prop::collection::vec(0i32..1000, 0..5)) {
        let (channel, event_loop, _source) = single_hop_channel(10);
        channel.shutdown(first);
        for code in &rest {
            channel.shutdown(*code);
        }
        event_loop.run_until_idle();
        prop_assert_eq!(channel.state(), ChannelState::ShutDown);
    }
}
