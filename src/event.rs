//! Event dispatch and the ack/timeout callback registry.
//!
//! Events are opaque byte payloads; the core does not interpret their
//! contents, only ferries them between the outbound/inbound queues and
//! tracks which outbound packet(s) carried which callback ids. See
//! `spec.md` §4.9 and the `Connection` state model in §3.

use std::{collections::HashMap, future::Future, pin::Pin};

use bytes::Bytes;

use crate::seq::Sqn;

/// An opaque event payload exchanged between peers.
pub type Event = Bytes;

/// A boxed, `'static` future used for asynchronous callbacks and handlers.
pub type BoxFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// A user callback, either a plain synchronous closure or one that returns
/// a future to be awaited before the event loop continues.
///
/// Kept as an explicit tagged variant (rather than one trait object with a
/// blanket async-fn impl) so the event loop can tell at invocation time
/// whether it needs to `.await` anything.
pub enum Callback {
    /// Run to completion synchronously.
    Sync(Box<dyn FnOnce() + Send>),
    /// Awaited before the next event is processed.
    Async(Box<dyn FnOnce() -> BoxFuture + Send>),
}

impl Callback {
    /// Invokes this callback, awaiting it if asynchronous.
    pub async fn invoke(self) {
        match self {
            Callback::Sync(f) => f(),
            Callback::Async(f) => f().await,
        }
    }
}

impl std::fmt::Debug for Callback {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self {
            Callback::Sync(_) => "Sync",
            Callback::Async(_) => "Async",
        };
        f.debug_tuple("Callback").field(&kind).finish()
    }
}

/// The pair of callbacks optionally attached to one dispatched event.
#[derive(Default)]
pub struct EventCallbacks {
    /// Invoked once when the packet carrying this event is acknowledged.
    pub on_ack: Option<Callback>,
    /// Invoked once if the packet carrying this event times out unacked.
    pub on_timeout: Option<Callback>,
}

/// Registry mapping outbound packet sequences to the callback ids they
/// carry, and callback ids to their registered callbacks.
///
/// Mirrors `spec.md` §3's `events_with_callbacks` / `event_callbacks` pair.
#[derive(Default)]
pub struct CallbackRegistry {
    next_id: Sqn,
    events_with_callbacks: HashMap<Sqn, Vec<Sqn>>,
    event_callbacks: HashMap<Sqn, EventCallbacks>,
}

impl CallbackRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a callback pair if either is present, returning the
    /// callback id to enqueue alongside the event (or [`Sqn::NONE`] if
    /// neither callback was given - matching `spec.md`'s "callback sequence
    /// `0`" convention for events with no callbacks).
    pub fn register(&mut self, on_ack: Option<Callback>, on_timeout: Option<Callback>) -> Sqn {
        if on_ack.is_none() && on_timeout.is_none() {
            return Sqn::NONE;
        }
        self.next_id = self.next_id.increment();
        let id = self.next_id;
        self.event_callbacks
            .insert(id, EventCallbacks { on_ack, on_timeout });
        id
    }

    /// Records that outbound packet `seq` carries callback id `callback_id`
    /// (a no-op if `callback_id` is [`Sqn::NONE`]).
    pub fn attach(&mut self, seq: Sqn, callback_id: Sqn) {
        if callback_id.is_none() {
            return;
        }
        self.events_with_callbacks
            .entry(seq)
            .or_default()
            .push(callback_id);
    }

    /// Removes and returns all callback pairs carried by outbound packet
    /// `seq`, in the order they were attached.
    pub fn take_for_packet(&mut self, seq: Sqn) -> Vec<EventCallbacks> {
        let Some(ids) = self.events_with_callbacks.remove(&seq) else {
            return Vec::new();
        };
        ids.into_iter()
            .filter_map(|id| self.event_callbacks.remove(&id))
            .collect()
    }

    /// All outbound packet sequences currently carrying registered
    /// callbacks, snapshotted so callers may mutate the registry while
    /// iterating.
    #[must_use]
    pub fn pending_packets(&self) -> Vec<Sqn> {
        self.events_with_callbacks.keys().copied().collect()
    }
}
