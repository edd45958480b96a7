//! External state-store contract consumed by [`crate::server::ServerConnection`]
//! and [`crate::client::ClientConnection`].
//!
//! The generic game-state container, its merge semantics and its storage
//! policy are all external collaborators per `spec.md` §1 - this module
//! only fixes the trait boundary the core needs, clarified against
//! `original_source/pygase/gamestate.py`'s `GameStateStore` /
//! `GameStateUpdate`. A trivial in-memory implementation is provided for
//! tests and doc examples, not as a production state container.

use std::sync::Mutex;

use bytes::Bytes;

use crate::seq::Sqn;

/// A state-delta update, totally ordered by [`Update::time_order`] and
/// mergeable with another update of the same type into a combined update
/// carrying the greater of the two orders.
pub trait Update: Clone + Send + Sync + 'static {
    /// Decode failure type.
    type DecodeError: std::error::Error + Send + Sync + 'static;

    /// This update's position in the server's total order.
    fn time_order(&self) -> Sqn;

    /// Combines `self` with a later update, yielding one update at the
    /// greater `time_order` that carries the net effect of both.
    #[must_use]
    fn merge(self, other: Self) -> Self;

    /// The neutral update at `time_order`: carries no state change of its
    /// own, used as the fold base when replaying cached updates newer than
    /// a client's last known order (`spec.md` §4.11).
    #[must_use]
    fn zero(time_order: Sqn) -> Self;

    /// Serializes this update to its opaque wire representation.
    fn to_bytes(&self) -> Bytes;

    /// Deserializes an update from its opaque wire representation.
    ///
    /// # Errors
    ///
    /// Returns `Self::DecodeError` if `bytes` is not a valid encoding.
    fn from_bytes(bytes: Bytes) -> Result<Self, Self::DecodeError>
    where
        Self: Sized;
}

/// Read/write access to a server's replicated game state, as consumed by
/// [`crate::server::ServerConnection`].
///
/// Implementations are assumed internally synchronized and non-blocking;
/// the core treats every method as atomic and never holds a lock across
/// network I/O while calling them.
pub trait StateStore: Send + Sync + 'static {
    /// The update type this store produces and accepts.
    type Update: Update;

    /// The current state expressed as a single update carrying a full
    /// snapshot, used to bootstrap a client with `last_client_time_order ==
    /// 0`.
    fn snapshot_update(&self) -> Self::Update;

    /// Recent updates in ascending `time_order`, bounded to a fixed size
    /// (`spec.md` §6: typically 100).
    fn update_cache(&self) -> Vec<Self::Update>;

    /// Records a new update, applying it to the current snapshot and
    /// evicting the oldest cache entry if the cache is at capacity.
    fn push_update(&self, update: Self::Update);
}

/// A minimal in-memory [`StateStore`], bounding its cache at a fixed size.
///
/// Not meant for production use - it exists so the core's connection
/// logic can be exercised end-to-end in tests and doc examples without an
/// external state container.
pub struct InMemoryStateStore<U: Update> {
    cache_size: usize,
    inner: Mutex<InMemoryStateStoreInner<U>>,
}

struct InMemoryStateStoreInner<U> {
    snapshot: U,
    cache: Vec<U>,
}

impl<U: Update> InMemoryStateStore<U> {
    /// Creates a store seeded with `initial` as both the current snapshot
    /// and the sole cache entry, bounding the cache at `cache_size`.
    pub fn new(initial: U, cache_size: usize) -> Self {
        Self {
            cache_size,
            inner: Mutex::new(InMemoryStateStoreInner {
                cache: vec![initial.clone()],
                snapshot: initial,
            }),
        }
    }
}

impl<U: Update> StateStore for InMemoryStateStore<U> {
    type Update = U;

    fn snapshot_update(&self) -> U {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).snapshot.clone()
    }

    fn update_cache(&self) -> Vec<U> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).cache.clone()
    }

    fn push_update(&self, update: U) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if update.time_order() > inner.snapshot.time_order() {
            inner.snapshot = inner.snapshot.clone().merge(update.clone());
        }
        inner.cache.push(update);
        if inner.cache.len() > self.cache_size {
            inner.cache.remove(0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::Infallible;

    #[derive(Debug, Clone, PartialEq, Eq)]
    struct CounterUpdate {
        time_order: Sqn,
        delta: i64,
    }

    impl Update for CounterUpdate {
        type DecodeError = Infallible;

        fn time_order(&self) -> Sqn {
            self.time_order
        }

        fn merge(self, other: Self) -> Self {
            if other.time_order() > self.time_order() {
                Self {
                    time_order: other.time_order,
                    delta: self.delta + other.delta,
                }
            } else {
                Self {
                    time_order: self.time_order,
                    delta: self.delta + other.delta,
                }
            }
        }

        fn zero(time_order: Sqn) -> Self {
            Self { time_order, delta: 0 }
        }

        fn to_bytes(&self) -> Bytes {
            let mut buf = Vec::with_capacity(10);
            buf.extend_from_slice(&self.time_order.0.to_be_bytes());
            buf.extend_from_slice(&self.delta.to_be_bytes());
            Bytes::from(buf)
        }

        fn from_bytes(bytes: Bytes) -> Result<Self, Infallible> {
            let time_order = Sqn(u16::from_be_bytes([bytes[0], bytes[1]]));
            let delta = i64::from_be_bytes(bytes[2..10].try_into().unwrap());
            Ok(Self { time_order, delta })
        }
    }

    #[test]
    fn push_update_merges_into_snapshot_and_bounds_cache() {
        let store = InMemoryStateStore::new(
            CounterUpdate {
                time_order: Sqn(1),
                delta: 0,
            },
            2,
        );
        store.push_update(CounterUpdate {
            time_order: Sqn(2),
            delta: 5,
        });
        store.push_update(CounterUpdate {
            time_order: Sqn(3),
            delta: 2,
        });
        store.push_update(CounterUpdate {
            time_order: Sqn(4),
            delta: 1,
        });

        assert_eq!(store.update_cache().len(), 2);
        assert_eq!(store.snapshot_update().delta, 8);
        assert_eq!(store.snapshot_update().time_order, Sqn(4));
    }

    #[test]
    fn update_round_trips_through_bytes() {
        let u = CounterUpdate {
            time_order: Sqn(7),
            delta: -3,
        };
        let decoded = CounterUpdate::from_bytes(u.to_bytes()).unwrap();
        assert_eq!(u, decoded);
    }
}
