//! Shared test doubles for exercising `spark-channel-core`'s contracts:
//! a deterministic [`event_loop::TestEventLoop`], recording/flaky
//! [`handlers::Handler`](spark_channel_core::handler::Handler) implementations,
//! a [`logger::RecordingLogger`], and `proptest` [`strategies`] for the
//! value ranges the core's invariants quantify over.
//!
//! Consumed as a dev-dependency by `spark-channel-core`'s own test suite and
//! by any downstream crate wiring a new protocol stage against the core.

pub mod event_loop;
pub mod handlers;
pub mod logger;
pub mod strategies;

pub use event_loop::{local_object, TestEventLoop};
pub use handlers::{FlakyHandler, RecordedEvent, RecordingHandle, RecordingHandler};
pub use logger::{LoggedRecord, RecordingLogger};
