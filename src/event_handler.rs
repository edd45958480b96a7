//! The inbound event handler contract consumed by the event loop.
//!
//! Registration/dispatch policy for handlers is an external concern (see
//! `spec.md` §1's "external collaborators"); the core only needs to call
//! `has_event_type` and `handle` for each event it pops off the incoming
//! queue.

use crate::event::{BoxFuture, Event};

/// How a handler wants its [`EventHandler::handle`] result treated: run to
/// completion already, or awaited before the event loop moves on.
pub enum Handling {
    /// The handler has already finished synchronously.
    Done,
    /// Await this before processing the next event.
    Async(BoxFuture),
}

/// Consumes events popped from a connection's incoming queue.
///
/// Unknown event types are skipped by the event loop calling
/// [`EventHandler::has_event_type`] first; `handle` is only called for
/// events the handler claims to own.
pub trait EventHandler: Send + Sync + 'static {
    /// Whether this handler recognizes `event`'s type. Events it does not
    /// recognize are silently dropped by the event loop.
    fn has_event_type(&self, event: &Event) -> bool;

    /// Handles one event. Implementations that need to `.await` something
    /// should return [`Handling::Async`]; the event loop awaits it before
    /// popping the next event.
    fn handle(&self, event: Event) -> Handling;
}

/// An optional sink events are additionally forwarded to on receipt,
/// independent of the event loop's own handler (`spec.md` §4.9).
///
/// Grounded on `original_source/pygase/connection.py`'s `event_wire`
/// constructor parameter and its `_push_event` call, used there to repeat
/// a connection's incoming events out to some other collaborator (e.g. a
/// server rebroadcasting one client's events to the rest). Forwarding is
/// unconditional - unlike [`EventHandler`], there is no `has_event_type`
/// gate, since the wire's job is to repeat, not to interpret.
pub trait EventWire: Send + Sync + 'static {
    /// Forwards `event`. Implementations that need to `.await` something
    /// should return [`Handling::Async`]; the caller awaits it before
    /// forwarding the next event.
    fn push_event(&self, event: Event) -> Handling;
}

/// An [`EventHandler`] that recognizes nothing and drops every event.
///
/// Useful as a default for connections that only care about state-delta
/// replication and never dispatch domain events.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullEventHandler;

impl EventHandler for NullEventHandler {
    fn has_event_type(&self, _event: &Event) -> bool {
        false
    }

    fn handle(&self, _event: Event) -> Handling {
        Handling::Done
    }
}
