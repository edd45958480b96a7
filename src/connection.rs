//! Per-peer connection state: the sliding-window ack algorithm, pending-ack
//! resolution, the latency/congestion pair, and the event-callback
//! bookkeeping that ties them together.
//!
//! This is deliberately transport- and direction-agnostic: [`Connection`]
//! knows nothing about sockets or which side of the wire it's on. The
//! send/receive/event tasks and the `ClientPacket`/`ServerPacket` framing
//! live in [`crate::client`] and [`crate::server`].

use std::{
    collections::HashMap,
    net::SocketAddr,
    time::Instant,
};

use tracing::{debug, trace, warn};

use crate::{
    ack::RemoteAck,
    config::Config,
    congestion::{Congestion, Quality},
    error::AckError,
    event::{Callback, CallbackRegistry, Event},
    header::Header,
    latency::LatencyEstimator,
    seq::Sqn,
};

/// Lifecycle state of a connection, driven entirely by observed traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// No packet has been received from the peer yet.
    Connecting,
    /// At least one packet has been received within the timeout window.
    Connected,
    /// No packet has been received within `connection_timeout`.
    Disconnected,
}

/// Callbacks released by [`Connection::recv`] for the event loop (or
/// whatever task owns the callbacks) to invoke, in the order `spec.md`
/// §4.4 specifies: ascending pending sequence, then registration order
/// within a packet.
#[derive(Default)]
pub struct ReleasedCallbacks {
    /// Fired because their packet was acknowledged.
    pub acked: Vec<Callback>,
    /// Fired because their packet's pending age exceeded the packet
    /// timeout.
    pub timed_out: Vec<Callback>,
}

/// Per-peer connection state machine.
pub struct Connection {
    /// The peer this connection talks to.
    pub remote_address: SocketAddr,
    /// Sequence number of the last packet we sent.
    pub local_sequence: Sqn,
    /// Our bookkeeping of what we've received from the peer.
    pub remote_ack: RemoteAck,
    /// Smoothed round-trip-time estimate.
    pub latency: LatencyEstimator,
    /// Lifecycle status.
    pub status: Status,
    /// Adaptive send-pacing controller.
    pub congestion: Congestion,
    /// Outbound sequence -> send timestamp, for packets awaiting ack.
    pending_acks: HashMap<Sqn, Instant>,
    /// Event ack/timeout callback registry.
    pub callbacks: CallbackRegistry,
    last_recv_time: Instant,
    config: Config,
}

impl Connection {
    /// Creates a new connection to `remote_address`, starting
    /// [`Status::Connecting`], anchored at `now`.
    #[must_use]
    pub fn new(remote_address: SocketAddr, config: Config, now: Instant) -> Self {
        Self {
            remote_address,
            local_sequence: Sqn::NONE,
            remote_ack: RemoteAck::default(),
            latency: LatencyEstimator::default(),
            status: Status::Connecting,
            congestion: Congestion::new(now),
            pending_acks: HashMap::new(),
            callbacks: CallbackRegistry::new(),
            last_recv_time: now,
            config,
        }
    }

    /// The configuration this connection was built with.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Whether no packet has arrived within `connection_timeout` of `now`.
    #[must_use]
    pub fn is_timed_out(&self, now: Instant) -> bool {
        now.duration_since(self.last_recv_time) > self.config.connection_timeout
    }

    /// Processes a received header: folds the sender's sequence into our
    /// ack bookkeeping, then resolves our own pending acks against the
    /// sender's reported `(ack, ack_bitfield)`.
    ///
    /// On [`AckError::DuplicateSequence`] nothing else is touched - the
    /// datagram is dropped with no bookkeeping side effects, per `spec.md`
    /// §7.
    ///
    /// # Errors
    ///
    /// See above.
    pub fn recv(&mut self, header: &Header, now: Instant) -> Result<ReleasedCallbacks, AckError> {
        self.remote_ack.observe(header.sequence)?;
        self.last_recv_time = now;
        if self.status != Status::Connected {
            debug!(peer = %self.remote_address, "connection established");
        }
        self.status = Status::Connected;
        trace!(peer = %self.remote_address, seq = header.sequence.0, "packet accepted");

        Ok(self.resolve_pending_acks(header.ack, header.ack_bitfield, now))
    }

    /// `spec.md` §4.4: scan every outbound sequence awaiting ack, firing
    /// `on_ack` for those the peer's `(ack, ack_bitfield)` confirms and
    /// `on_timeout` for those whose pending age exceeds `packet_timeout`.
    fn resolve_pending_acks(&mut self, ack: Sqn, ack_bitfield: u32, now: Instant) -> ReleasedCallbacks {
        let mut pending: Vec<Sqn> = self.pending_acks.keys().copied().collect();
        pending.sort_by(|a, b| a.cmp(b));

        let mut released = ReleasedCallbacks::default();
        for p in pending {
            let pd = ack.diff(p);
            let is_acked = pd == 0 || (pd > 0 && pd <= 32 && ack_bitfield & (1 << (pd - 1)) != 0);
            if is_acked {
                if let Some(send_time) = self.pending_acks.remove(&p) {
                    self.latency.sample(now.duration_since(send_time).as_secs_f64());
                    for cbs in self.callbacks.take_for_packet(p) {
                        if let Some(cb) = cbs.on_ack {
                            released.acked.push(cb);
                        }
                    }
                }
                continue;
            }
            let Some(send_time) = self.pending_acks.get(&p).copied() else {
                continue;
            };
            if now.duration_since(send_time) > self.config.packet_timeout {
                self.pending_acks.remove(&p);
                for cbs in self.callbacks.take_for_packet(p) {
                    if let Some(cb) = cbs.on_timeout {
                        released.timed_out.push(cb);
                    }
                }
            }
        }
        released
    }

    /// Re-evaluates the congestion controller against the current latency
    /// estimate. Called periodically by the congestion monitor task.
    pub fn evaluate_congestion(&mut self, now: Instant) {
        let before = self.congestion.quality();
        self.congestion.evaluate(self.latency.latency, now);
        if self.congestion.quality() != before {
            debug!(
                peer = %self.remote_address,
                quality = ?self.congestion.quality(),
                "congestion quality changed"
            );
        }
    }

    /// Increments and returns the sequence number the next outbound packet
    /// should use. Must be called exactly once per outbound packet, before
    /// building its header.
    pub fn next_local_sequence(&mut self) -> Sqn {
        self.local_sequence = self.local_sequence.increment();
        self.local_sequence
    }

    /// The header for the next outbound packet, given its sequence number
    /// (obtained from [`Connection::next_local_sequence`]).
    #[must_use]
    pub fn header_for(&self, sequence: Sqn) -> Header {
        Header {
            sequence,
            ack: self.remote_ack.remote_sequence,
            ack_bitfield: self.remote_ack.ack_bitfield,
        }
    }

    /// Records that packet `seq` was just sent, starting its pending-ack
    /// clock.
    pub fn record_sent(&mut self, seq: Sqn, now: Instant) {
        self.pending_acks.insert(seq, now);
    }

    /// Attaches a callback id (from [`CallbackRegistry::register`]) to
    /// outbound packet `seq`. A no-op for [`Sqn::NONE`].
    pub fn attach_callback(&mut self, seq: Sqn, callback_id: Sqn) {
        self.callbacks.attach(seq, callback_id);
    }

    /// Marks the connection disconnected due to inactivity.
    pub fn mark_disconnected(&mut self) {
        if self.status != Status::Disconnected {
            warn!(peer = %self.remote_address, "connection timed out");
        }
        self.status = Status::Disconnected;
    }

    /// Resets the inactivity clock and lifecycle status ahead of reviving a
    /// timed-out connection whose peer has just sent a fresh packet. Called
    /// before the new send loop is spawned, so its first `is_timed_out`
    /// check can't race a stale `last_recv_time` against the `recv` call
    /// that `feed` makes for the same datagram.
    pub fn revive(&mut self, now: Instant) {
        self.last_recv_time = now;
        self.status = Status::Connecting;
    }

    /// Quality for diagnostics/tests.
    #[must_use]
    pub fn quality(&self) -> Quality {
        self.congestion.quality()
    }
}

/// Invokes every callback in `released`, in order, isolating panics so a
/// misbehaving user callback cannot bring down the owning task.
///
/// `spec.md` §7: "Exceptions from callbacks must not terminate the
/// connection tasks; implementations log and continue."
pub async fn invoke_released(released: ReleasedCallbacks) {
    for cb in released.acked {
        invoke_one(cb, "on_ack").await;
    }
    for cb in released.timed_out {
        invoke_one(cb, "on_timeout").await;
    }
}

async fn invoke_one(cb: Callback, kind: &'static str) {
    match cb {
        Callback::Sync(f) => {
            if std::panic::catch_unwind(std::panic::AssertUnwindSafe(f)).is_err() {
                tracing::error!(callback = kind, "event callback panicked");
            }
        }
        Callback::Async(f) => {
            // Spawned rather than awaited inline: a panicking user future
            // then only takes down its own task, which tokio already
            // converts into a `JoinError` instead of unwinding the caller.
            let fut = f();
            if let Err(err) = tokio::spawn(fut).await {
                tracing::error!(callback = kind, %err, "event callback panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use super::*;

    fn addr() -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 9999)
    }

    #[test]
    fn first_handshake_sets_remote_sequence() {
        let now = Instant::now();
        let mut conn = Connection::new(addr(), Config::default(), now);
        let header = Header {
            sequence: Sqn(1),
            ack: Sqn::NONE,
            ack_bitfield: 0,
        };
        conn.recv(&header, now).unwrap();
        assert_eq!(conn.remote_ack.remote_sequence, Sqn(1));
        assert_eq!(conn.status, Status::Connected);
    }

    #[test]
    fn ack_resolution_fires_on_ack_exactly_once() {
        let now = Instant::now();
        let mut conn = Connection::new(addr(), Config::default(), now);
        let fired = Arc::new(Mutex::new(0));
        let fired2 = fired.clone();

        let seq = conn.next_local_sequence();
        let id = conn
            .callbacks
            .register(Some(Callback::Sync(Box::new(move || *fired2.lock().unwrap() += 1))), None);
        conn.attach_callback(seq, id);
        conn.record_sent(seq, now);

        // peer acks directly
        let header = Header {
            sequence: Sqn(1),
            ack: seq,
            ack_bitfield: 0,
        };
        let released = conn.recv(&header, now + Duration::from_millis(10)).unwrap();
        assert_eq!(released.acked.len(), 1);
        assert_eq!(released.timed_out.len(), 0);

        // second ack of the same (now absent) packet does nothing
        let released2 = conn.recv(&Header { sequence: Sqn(2), ..header }, now + Duration::from_millis(20)).unwrap();
        assert_eq!(released2.acked.len(), 0);
    }

    #[test]
    fn timeout_fires_after_packet_timeout_elapses() {
        let now = Instant::now();
        let mut conn = Connection::new(addr(), Config::default(), now);

        let seq = conn.next_local_sequence();
        let id = conn.callbacks.register(None, Some(Callback::Sync(Box::new(|| {}))));
        conn.attach_callback(seq, id);
        conn.record_sent(seq, now);

        // peer's ack doesn't cover `seq`, and 1.0s+ has passed
        let header = Header {
            sequence: Sqn(1),
            ack: Sqn::NONE,
            ack_bitfield: 0,
        };
        let released = conn
            .recv(&header, now + Duration::from_millis(1100))
            .unwrap();
        assert_eq!(released.timed_out.len(), 1);
        assert_eq!(released.acked.len(), 0);
    }

    #[test]
    fn duplicate_sequence_is_rejected_without_side_effects() {
        let now = Instant::now();
        let mut conn = Connection::new(addr(), Config::default(), now);
        let header = Header {
            sequence: Sqn(5),
            ack: Sqn::NONE,
            ack_bitfield: 0,
        };
        conn.recv(&header, now).unwrap();
        assert!(matches!(conn.recv(&header, now), Err(AckError::DuplicateSequence)));
        assert_eq!(conn.remote_ack.remote_sequence, Sqn(5));
    }
}
