#![cfg_attr(not(feature = "std"), no_std)]
#![deny(unsafe_code)]
#![allow(private_bounds)]
//! Single-threaded channel pipeline core: a doubly-linked chain of handler
//! slots, credit-based backpressure, and a two-phase shutdown state machine.
//!
//! A [`channel::Channel`] owns a chain of [`slot::SlotIndex`]-addressed slots,
//! each hosting one [`handler::Handler`]. Bytes enter the leftmost slot and
//! flow rightward as READ messages; application writes enter the rightmost
//! slot and flow leftward as WRITE messages. Window credit flows upstream
//! (leftward) to bound in-flight read bytes. Shutdown flows left-to-right in
//! the READ direction, then right-to-left in the WRITE direction.
//!
//! Every callback into a [`handler::Handler`] and every channel-chain
//! mutation runs on the owning [`event_loop::EventLoop`]'s single thread; the
//! handful of operations safe to call from any thread are documented on
//! [`channel::Channel`] itself.

extern crate alloc;

pub mod channel;
pub mod error;
pub mod event_loop;
pub mod handler;
pub mod limits;
pub mod message;
pub mod observability;
pub mod prelude;
pub mod slot;
pub mod task;

mod sealed;
