//! Convenience re-exports for implementors of [`Handler`](crate::handler::Handler)
//! and hosts of [`EventLoop`](crate::event_loop::EventLoop).
//!
//! ```ignore
//! use spark_channel_core::prelude::*;
//! ```

pub use crate::channel::{Channel, ChannelHold, ChannelState};
pub use crate::error::{CoreError, ErrorKind};
pub use crate::event_loop::{EventLoop, LocalObject};
pub use crate::handler::{Direction, Handler};
pub use crate::limits::CoreLimits;
pub use crate::message::{Message, MessageCompletion, MessageKind};
pub use crate::observability::{LogSeverity, Logger};
pub use crate::slot::{SlotHandle, SlotIndex};
pub use crate::task::{ChannelTask, TaskStatus};
