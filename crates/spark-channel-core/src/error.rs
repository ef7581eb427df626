//! Stable error taxonomy for the channel pipeline core.
//!
//! A struct carrying a stable code, a human-readable message and an
//! optional cause, rather than a bare enum. Call sites match on
//! [`ErrorKind`]; the `code` field is for logs and metrics, not for
//! branching.

use alloc::boxed::Box;
use alloc::string::String;
use core::fmt;

/// The five error kinds distinguished by the pipeline core (see the
/// error-handling design: capacity, state, resource, handler, setup).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum ErrorKind {
    /// A message was too large for a downstream window or for the pool.
    Capacity,
    /// An operation was not permitted in the channel's current lifecycle state.
    State,
    /// An allocation failed.
    Resource,
    /// A handler callback returned an error.
    Handler,
    /// The channel could not complete initialization.
    Setup,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::Capacity => "capacity",
            ErrorKind::State => "state",
            ErrorKind::Resource => "resource",
            ErrorKind::Handler => "handler",
            ErrorKind::Setup => "setup",
        };
        f.write_str(s)
    }
}

/// The core's stable error type: a kind, a stable code, a message, and an
/// optional cause.
///
/// `code` should follow a `<kind>.<reason>` convention (e.g.
/// `"capacity.window_exceeded"`) so downstream log aggregation can group on
/// it without parsing `message`.
#[derive(Debug)]
pub struct CoreError {
    kind: ErrorKind,
    code: &'static str,
    message: String,
    source: Option<Box<dyn fmt::Debug + Send + Sync>>,
}

impl CoreError {
    /// Construct a new error. `code` is expected to be a `'static` literal.
    pub fn new(kind: ErrorKind, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            kind,
            code,
            message: message.into(),
            source: None,
        }
    }

    /// Attach a cause, returning the updated error.
    pub fn with_source(mut self, source: impl fmt::Debug + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn code(&self) -> &'static str {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    // --- Convenience constructors for the call sites that recur throughout
    // the core (window rejection, off-thread misuse, double set_handler, ...).

    pub fn capacity(code: &'static str, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Capacity, code, message)
    }

    pub fn state(code: &'static str, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::State, code, message)
    }

    pub fn resource(code: &'static str, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Resource, code, message)
    }

    pub fn handler(code: &'static str, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Handler, code, message)
    }

    pub fn setup(code: &'static str, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Setup, code, message)
    }

    /// A deterministic, non-zero integer derived from `code`, suitable for
    /// channels that only carry an opaque `i32` shutdown cause (the shutdown
    /// automaton does not understand `CoreError` itself, only the code it
    /// was first asked to shut down with).
    pub fn stable_code(&self) -> i32 {
        let mut hash: u32 = 2166136261;
        for byte in self.code.as_bytes() {
            hash ^= *byte as u32;
            hash = hash.wrapping_mul(16777619);
        }
        // Keep it non-zero (0 is reserved to mean "no error") and positive.
        ((hash & 0x7fff_ffff) as i32).max(1)
    }
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}): {}", self.kind, self.code, self.message)
    }
}

#[cfg(feature = "std")]
impl std::error::Error for CoreError {}

/// Stable error codes used by the core. Kept as a flat module (rather than
/// inline string literals scattered through the implementation) so a future
/// error-contract doc generator has a single place to walk.
pub mod codes {
    pub const WINDOW_EXCEEDED: &str = "capacity.window_exceeded";
    pub const POOL_SIZE_REJECTED: &str = "capacity.pool_size_rejected";

    pub const NO_RIGHT_NEIGHBOR: &str = "state.no_right_neighbor";
    pub const NO_LEFT_NEIGHBOR: &str = "state.no_left_neighbor";
    pub const HANDLER_ALREADY_SET: &str = "state.handler_already_set";
    pub const NOT_ON_CHANNEL_THREAD: &str = "state.not_on_channel_thread";
    pub const CHANNEL_SHUT_DOWN: &str = "state.channel_shut_down";
    pub const SLOT_REMOVE_WHILE_INACTIVE: &str = "state.slot_remove_while_inactive";
    pub const UNDELIVERABLE: &str = "state.undeliverable";

    pub const ALLOCATION_FAILED: &str = "resource.allocation_failed";

    pub const HANDLER_SHUTDOWN_FAILED: &str = "handler.shutdown_failed";
    pub const HANDLER_PROCESS_FAILED: &str = "handler.process_failed";

    pub const EVENT_LOOP_SCHEDULE_FAILED: &str = "setup.event_loop_schedule_failed";
}
