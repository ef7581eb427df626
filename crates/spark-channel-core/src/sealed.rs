//! Internal marker used to keep room for future default methods on the
//! core's externally-implementable traits without that being a breaking
//! change.
//!
//! `Sealed` carries a blanket impl for every type, so it does not currently
//! restrict who may implement [`Handler`](crate::handler::Handler) or
//! [`EventLoop`](crate::event_loop::EventLoop) — both are meant to be
//! implemented outside this crate. It exists so a future version can tighten
//! the blanket impl if that ever becomes necessary, without touching the
//! public trait signatures.
pub(crate) trait Sealed {}

impl<T: ?Sized> Sealed for T {}
