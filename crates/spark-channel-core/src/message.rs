//! The unit of data that flows through the pipeline.
//!
//! A [`Message`] is owned by whoever currently holds it. `send_message`
//! transfers ownership to the recipient slot's handler on success; on a
//! rejected send the caller keeps the message (see
//! [`SlotHandle::send_message`](crate::slot::SlotHandle::send_message)).

use alloc::boxed::Box;
use alloc::vec::Vec;

/// What a message carries, orthogonal to its direction through the pipeline.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MessageKind {
    /// Application data produced by a write from the right-hand side.
    ApplicationData,
    /// Application data produced by a read, on its way rightward.
    ApplicationDataRead,
    /// Raw bytes with no application framing (typical at the socket slot).
    Raw,
}

/// Outcome handed to a message's completion callback.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MessageCompletion {
    /// The message was fully processed and released.
    Delivered,
    /// The message was dropped before being forwarded (e.g. during
    /// shutdown), without necessarily failing.
    Discarded,
}

type CompletionCallback = Box<dyn FnOnce(MessageCompletion) + Send>;

/// A message flowing through the pipeline.
///
/// The original C-flavored design separates "allocator", "payload
/// buffer", and "on-completion callback + user data" into independent
/// fields. In idiomatic Rust the payload is just an owned `Vec<u8>` (no
/// separate allocator handle is needed — dropping the message frees the
/// buffer through the ambient global allocator), and "callback + user
/// data" collapses into a single `FnOnce` closure, since Rust closures
/// already capture their own state.
pub struct Message {
    payload: Vec<u8>,
    kind: MessageKind,
    on_complete: Option<CompletionCallback>,
    copy_mark: Option<usize>,
}

impl Message {
    pub fn new(kind: MessageKind, payload: Vec<u8>) -> Self {
        Self {
            payload,
            kind,
            on_complete: None,
            copy_mark: None,
        }
    }

    pub fn with_capacity(kind: MessageKind, capacity: usize) -> Self {
        Self::new(kind, Vec::with_capacity(capacity))
    }

    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    /// Length of the payload in bytes — what window accounting measures.
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.payload.capacity()
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn payload_mut(&mut self) -> &mut Vec<u8> {
        &mut self.payload
    }

    /// Register a callback invoked exactly once, whenever the message is
    /// dropped (see the `Drop` impl below). Replaces any previously set
    /// callback.
    pub fn on_complete(mut self, callback: impl FnOnce(MessageCompletion) + Send + 'static) -> Self {
        self.on_complete = Some(Box::new(callback));
        self
    }

    /// Mark an offset within the payload past which bytes must be copied
    /// rather than shared, e.g. because a handler needs to retain a
    /// zero-copy view of the prefix. Purely advisory to handlers.
    pub fn set_copy_mark(&mut self, offset: usize) {
        self.copy_mark = Some(offset);
    }

    pub fn copy_mark(&self) -> Option<usize> {
        self.copy_mark
    }

    /// Explicitly release the message with a given completion outcome. A
    /// handler that transforms a message in place and forwards it should NOT
    /// call this — ownership moves on with the forward. This is for the
    /// terminal case: a handler decides no further forwarding will happen.
    pub fn release(self, outcome: MessageCompletion) {
        drop(self.finish(outcome));
    }

    fn finish(mut self, outcome: MessageCompletion) -> Vec<u8> {
        if let Some(cb) = self.on_complete.take() {
            cb(outcome);
        }
        core::mem::take(&mut self.payload)
    }
}

impl Drop for Message {
    fn drop(&mut self) {
        if let Some(cb) = self.on_complete.take() {
            cb(MessageCompletion::Discarded);
        }
    }
}

impl core::fmt::Debug for Message {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Message")
            .field("kind", &self.kind)
            .field("len", &self.payload.len())
            .field("copy_mark", &self.copy_mark)
            .finish()
    }
}
