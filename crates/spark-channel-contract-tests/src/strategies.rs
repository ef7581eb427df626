//! `proptest` strategies for the value ranges the core's contracts care
//! about: message sizes relative to a window, and window-increment deltas.

use proptest::prelude::*;

/// A message length and a window size where the length is guaranteed to fit
/// (`len <= window`), for exercising the accept path of `send_message`.
pub fn fitting_len_and_window() -> impl Strategy<Value = (usize, u64)> {
    (0u64..=1_000_000u64).prop_flat_map(|window| (0..=window as usize, Just(window)))
}

/// A message length and a window size where the length always overflows the
/// window by at least one byte, for exercising the rejection path.
pub fn overflowing_len_and_window() -> impl Strategy<Value = (usize, u64)> {
    (0u64..=1_000_000u64).prop_flat_map(|window| {
        let overflow_len = (window as usize).saturating_add(1)..=(window as usize).saturating_add(4096);
        (overflow_len, Just(window))
    })
}

/// A handful of window-increment deltas whose sum must equal one combined
/// increment, for the "increments compose additively" idempotence law.
pub fn window_increment_deltas() -> impl Strategy<Value = Vec<u64>> {
    prop::collection::vec(0u64..=65536u64, 1..8)
}

/// Arbitrary payload bytes of a bounded, test-friendly size.
pub fn payload_bytes() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), 0..256)
}
