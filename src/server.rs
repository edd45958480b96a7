//! Server-side UDP demultiplexer: one shared socket fanned out to a
//! [`ServerConnection`] per remote peer, keyed by address, with the
//! host-client designation and the `shutdown`/`shut_me_down` control
//! literals from `spec.md` §4.8 and §6.

use std::{collections::HashMap, net::SocketAddr, sync::Arc, time::Instant};

use bytes::Bytes;
use tokio::{
    net::UdpSocket,
    sync::{Mutex as AsyncMutex, Notify},
    time::sleep,
};
use tracing::{debug, info, trace, warn};

use crate::{
    client::{SHUTDOWN, SHUT_ME_DOWN},
    config::Config,
    connection::{invoke_released, Connection, Status},
    error::FrameError,
    event::{Callback, Event},
    event_handler::{EventHandler, EventWire, Handling, NullEventHandler},
    packet::{ClientPacket, ServerPacket},
    seq::Sqn,
    state::{StateStore, Update},
};

struct ConnectionState {
    connection: Connection,
    last_client_time_order: Sqn,
}

/// Per-peer server-side connection state.
///
/// `S` is the state store shared across every connected client; `H` handles
/// inbound events.
pub struct ServerConnection<S: StateStore, H: EventHandler = NullEventHandler> {
    inner: AsyncMutex<ConnectionState>,
    remote_address: SocketAddr,
    socket: Arc<UdpSocket>,
    state_store: Arc<S>,
    event_handler: Arc<H>,
    event_wire: Option<Arc<dyn EventWire>>,
    outbound_tx: flume::Sender<(Event, Sqn)>,
    outbound_rx: flume::Receiver<(Event, Sqn)>,
    inbound_tx: flume::Sender<Event>,
    inbound_rx: flume::Receiver<Event>,
    shutdown: Notify,
}

impl<S: StateStore, H: EventHandler> ServerConnection<S, H> {
    fn new(
        remote_address: SocketAddr,
        socket: Arc<UdpSocket>,
        state_store: Arc<S>,
        config: Config,
        event_handler: Arc<H>,
        event_wire: Option<Arc<dyn EventWire>>,
    ) -> Arc<Self> {
        let (outbound_tx, outbound_rx) = flume::unbounded();
        let (inbound_tx, inbound_rx) = flume::unbounded();
        Arc::new(Self {
            inner: AsyncMutex::new(ConnectionState {
                connection: Connection::new(remote_address, config, Instant::now()),
                last_client_time_order: Sqn::NONE,
            }),
            remote_address,
            socket,
            state_store,
            event_handler,
            event_wire,
            outbound_tx,
            outbound_rx,
            inbound_tx,
            inbound_rx,
            shutdown: Notify::new(),
        })
    }

    /// Current connection status.
    pub async fn status(&self) -> Status {
        self.inner.lock().await.connection.status
    }

    /// Enqueues an event for the send loop, optionally with ack/timeout
    /// callbacks. See `spec.md` §4.9.
    pub async fn dispatch_event(
        &self,
        event: Event,
        on_ack: Option<Callback>,
        on_timeout: Option<Callback>,
    ) {
        let id = self
            .inner
            .lock()
            .await
            .connection
            .callbacks
            .register(on_ack, on_timeout);
        let _ = self.outbound_tx.send((event, id));
    }

    /// Spawns this connection's send loop, event loop, and congestion
    /// monitor.
    fn spawn(self: &Arc<Self>) {
        tokio::spawn(self.clone().send_loop());
        tokio::spawn(self.clone().event_loop());
        tokio::spawn(self.clone().congestion_monitor());
    }

    /// Re-spawns every per-connection task for a connection the
    /// demultiplexer found [`Status::Disconnected`] but whose peer has just
    /// sent a fresh packet (`spec.md` §4.8, "revival").
    ///
    /// Resets the inactivity clock and status *before* spawning the new
    /// send loop: otherwise that loop's first `is_timed_out` check and this
    /// same datagram's own `feed` call race for `inner`'s lock, and if the
    /// send loop wins it immediately re-marks the connection
    /// `Disconnected` with no send loop left to revive it again.
    async fn revive(self: &Arc<Self>) {
        self.inner.lock().await.connection.revive(Instant::now());
        self.spawn();
    }

    /// Feeds a freshly received, already-parsed client packet to this
    /// connection: folds its header into the ack bookkeeping, records its
    /// `time_order`, and forwards its events to the event loop and, if
    /// configured, the event wire.
    async fn feed(&self, packet: ClientPacket) {
        let now = Instant::now();
        let released = {
            let mut inner = self.inner.lock().await;
            let released = match inner.connection.recv(&packet.header, now) {
                Ok(released) => released,
                Err(err) => {
                    debug!(%err, peer = %self.remote_address, "dropped client packet");
                    return;
                }
            };
            inner.last_client_time_order = packet.time_order;
            released
        };
        invoke_released(released).await;

        for event in packet.events() {
            let _ = self.inbound_tx.send(event.clone());
            if let Some(wire) = &self.event_wire {
                if let Handling::Async(fut) = wire.push_event(event.clone()) {
                    fut.await;
                }
            }
        }
    }

    fn build_payload(&self, last_client_time_order: Sqn) -> S::Update {
        if last_client_time_order.is_none() {
            return self.state_store.snapshot_update();
        }
        self.state_store
            .update_cache()
            .into_iter()
            .filter(|update| update.time_order() > last_client_time_order)
            .fold(S::Update::zero(last_client_time_order), |acc, update| acc.merge(update))
    }

    async fn send_loop(self: Arc<Self>) {
        loop {
            let iteration_start = Instant::now();
            let mut inner = self.inner.lock().await;
            if inner.connection.is_timed_out(iteration_start) {
                inner.connection.mark_disconnected();
                drop(inner);
                // spec.md §4.7: exit also cancels the sibling congestion
                // monitor (and, here, the event loop) - `revive` respawns
                // all three together if this peer reappears.
                self.shutdown.notify_waiters();
                return;
            }
            let seq = inner.connection.next_local_sequence();
            let header = inner.connection.header_for(seq);
            let payload = self.build_payload(inner.last_client_time_order);
            let mut packet = ServerPacket::new(header, payload.to_bytes());

            let events_per_packet = inner.connection.config().events_per_packet;
            for _ in 0..events_per_packet {
                let Ok((event, callback_id)) = self.outbound_rx.try_recv() else {
                    break;
                };
                if packet.add_event(event).is_err() {
                    break;
                }
                inner.connection.attach_callback(seq, callback_id);
            }

            let send_interval = inner.connection.congestion.send_interval();
            inner.connection.record_sent(seq, iteration_start);
            drop(inner);

            match packet.to_bytes() {
                Ok(bytes) => {
                    if let Err(err) = self.socket.send_to(&bytes, self.remote_address).await {
                        warn!(%err, peer = %self.remote_address, "send failed");
                    } else {
                        trace!(seq = seq.0, peer = %self.remote_address, "sent server packet");
                    }
                }
                Err(err) => warn!(%err, "failed to serialize outbound packet"),
            }

            let elapsed = iteration_start.elapsed();
            let delay = send_interval.saturating_sub(elapsed);
            tokio::select! {
                () = sleep(delay) => {}
                () = self.shutdown.notified() => return,
            }
        }
    }

    async fn event_loop(self: Arc<Self>) {
        loop {
            let recv = self.inbound_rx.recv_async();
            tokio::select! {
                event = recv => {
                    let Ok(event) = event else { return };
                    if !self.event_handler.has_event_type(&event) {
                        continue;
                    }
                    if let Handling::Async(fut) = self.event_handler.handle(event) {
                        fut.await;
                    }
                }
                () = self.shutdown.notified() => return,
            }
        }
    }

    async fn congestion_monitor(self: Arc<Self>) {
        loop {
            let min_throttle = self.inner.lock().await.connection.config().min_throttle_time;
            let interval = min_throttle / 2;
            tokio::select! {
                () = sleep(interval) => {}
                () = self.shutdown.notified() => return,
            }
            let now = Instant::now();
            let mut inner = self.inner.lock().await;
            inner.connection.evaluate_congestion(now);
        }
    }

    async fn stop(&self) {
        self.shutdown.notify_waiters();
    }
}

/// The UDP demultiplexer: binds one socket and fans datagrams out to a
/// [`ServerConnection`] per remote peer.
pub struct Server<S: StateStore, H: EventHandler = NullEventHandler> {
    socket: Arc<UdpSocket>,
    state_store: Arc<S>,
    config: Config,
    event_handler: Arc<H>,
    event_wire: Option<Arc<dyn EventWire>>,
    connections: AsyncMutex<HashMap<SocketAddr, Arc<ServerConnection<S, H>>>>,
    host_client: AsyncMutex<Option<SocketAddr>>,
}

impl<S: StateStore, H: EventHandler> Server<S, H> {
    /// Binds a UDP socket to `bind_addr`.
    ///
    /// # Errors
    ///
    /// Returns any [`std::io::Error`] from binding the socket.
    pub async fn bind(
        bind_addr: SocketAddr,
        state_store: S,
        config: Config,
        event_handler: H,
        event_wire: Option<Arc<dyn EventWire>>,
    ) -> std::io::Result<Arc<Self>> {
        let socket = UdpSocket::bind(bind_addr).await?;
        Ok(Arc::new(Self {
            socket: Arc::new(socket),
            state_store: Arc::new(state_store),
            config,
            event_handler: Arc::new(event_handler),
            event_wire,
            connections: AsyncMutex::new(HashMap::new()),
            host_client: AsyncMutex::new(None),
        }))
    }

    /// The address this server is bound to.
    ///
    /// # Errors
    ///
    /// Returns any [`std::io::Error`] from querying the socket.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// The remote address of the current host-client, if any has connected
    /// yet.
    pub async fn host_client(&self) -> Option<SocketAddr> {
        *self.host_client.lock().await
    }

    /// Runs the receive demultiplexer until a `shutdown`/`shut_me_down`
    /// control datagram is accepted, per `spec.md` §4.8. Cancels every
    /// spawned per-connection task on exit.
    pub async fn run(self: Arc<Self>) {
        let mut buf = vec![0u8; crate::packet::MAX_DATAGRAM_SIZE];
        loop {
            let (n, from) = match self.socket.recv_from(&mut buf).await {
                Ok(result) => result,
                Err(err) => {
                    warn!(%err, "demultiplexer recv failed");
                    continue;
                }
            };
            let datagram = &buf[..n];

            if datagram == SHUTDOWN {
                if self.host_client.lock().await.as_ref() == Some(&from) {
                    info!(peer = %from, "host-client requested shutdown");
                    break;
                }
                continue;
            }
            if datagram == SHUT_ME_DOWN {
                info!("in-process shutdown requested");
                break;
            }

            let bytes = Bytes::copy_from_slice(datagram);
            let packet = match ClientPacket::from_bytes(bytes) {
                Ok(packet) => packet,
                Err(FrameError::ProtocolMismatch) => continue,
                Err(err) => {
                    warn!(%err, peer = %from, "malformed client packet");
                    continue;
                }
            };

            let connection = self.connection_for(from).await;
            connection.feed(packet).await;
        }

        let mut connections = self.connections.lock().await;
        for (_, connection) in connections.drain() {
            connection.stop().await;
        }
    }

    async fn connection_for(self: &Arc<Self>, from: SocketAddr) -> Arc<ServerConnection<S, H>> {
        let mut connections = self.connections.lock().await;
        if let Some(existing) = connections.get(&from) {
            if existing.status().await == Status::Disconnected {
                debug!(peer = %from, "reviving disconnected connection");
                existing.revive().await;
            }
            return existing.clone();
        }

        let connection = ServerConnection::new(
            from,
            self.socket.clone(),
            self.state_store.clone(),
            self.config,
            self.event_handler.clone(),
            self.event_wire.clone(),
        );
        connection.spawn();
        connections.insert(from, connection.clone());
        drop(connections);

        let mut host_client = self.host_client.lock().await;
        if host_client.is_none() {
            *host_client = Some(from);
            info!(peer = %from, "designated host-client");
        }
        drop(host_client);

        info!(peer = %from, "new client connected");
        connection
    }
}

#[cfg(test)]
mod tests {
    use std::convert::Infallible;

    use super::*;
    use crate::state::InMemoryStateStore;

    #[derive(Debug, Clone, Default, PartialEq, Eq)]
    struct CounterState {
        time_order: Sqn,
        total: i64,
    }

    impl Update for CounterState {
        type DecodeError = Infallible;

        fn time_order(&self) -> Sqn {
            self.time_order
        }

        fn merge(self, other: Self) -> Self {
            let time_order = if other.time_order > self.time_order {
                other.time_order
            } else {
                self.time_order
            };
            Self {
                time_order,
                total: self.total + other.total,
            }
        }

        fn zero(time_order: Sqn) -> Self {
            Self { time_order, total: 0 }
        }

        fn to_bytes(&self) -> Bytes {
            let mut buf = Vec::with_capacity(10);
            buf.extend_from_slice(&self.time_order.0.to_be_bytes());
            buf.extend_from_slice(&self.total.to_be_bytes());
            Bytes::from(buf)
        }

        fn from_bytes(bytes: Bytes) -> Result<Self, Infallible> {
            Ok(Self {
                time_order: Sqn(u16::from_be_bytes([bytes[0], bytes[1]])),
                total: i64::from_be_bytes(bytes[2..10].try_into().unwrap()),
            })
        }
    }

    #[tokio::test]
    async fn bind_reports_no_host_client_yet() {
        let store = InMemoryStateStore::new(CounterState::default(), 100);
        let server = Server::bind(
            "127.0.0.1:0".parse().unwrap(),
            store,
            Config::default(),
            NullEventHandler,
            None,
        )
        .await
        .unwrap();
        assert_eq!(server.host_client().await, None);
    }

    #[test]
    fn build_payload_folds_cache_onto_zero_base() {
        // exercised indirectly through ServerConnection in integration
        // tests; here we just check the fold semantics directly.
        let updates = [
            CounterState { time_order: Sqn(2), total: 3 },
            CounterState { time_order: Sqn(3), total: 4 },
        ];
        let folded = updates
            .into_iter()
            .filter(|u| u.time_order() > Sqn(1))
            .fold(CounterState::zero(Sqn(1)), |acc, update| acc.merge(update));
        assert_eq!(folded.total, 7);
        assert_eq!(folded.time_order, Sqn(3));
    }
}
