//! Client-side connection: a single [`Connection`] talking to one server,
//! driving a locked local game-state container with `ClientPacket` framing.
//!
//! Task shape (send loop / receive loop / event loop / congestion monitor)
//! mirrors the per-connection task split in
//! `aeronet_webtransport::internal`'s `send_loop`/`recv_loop`/
//! `update_rtt_loop`, adapted from an mpsc-channel backend to a real UDP
//! socket.

use std::{net::SocketAddr, sync::Arc, time::Instant};

use bytes::Bytes;
use tokio::{
    net::UdpSocket,
    sync::{Mutex as AsyncMutex, Notify},
    time::sleep,
};
use tracing::{debug, trace, warn};

use crate::{
    config::Config,
    connection::{invoke_released, Connection, Status},
    event::{Callback, Event},
    event_handler::{EventHandler, EventWire, Handling, NullEventHandler},
    packet::ServerPacket,
    seq::Sqn,
    state::Update,
};

/// The literal payload that asks a server to shut down, accepted only from
/// its host-client.
pub const SHUTDOWN: &[u8] = b"shutdown";
/// The literal payload that asks a server to shut down, accepted from any
/// source.
pub const SHUT_ME_DOWN: &[u8] = b"shut_me_down";

/// A client's connection to a server.
///
/// `U` is the locally held game-state type; `H` handles inbound events.
pub struct ClientConnection<U: Update, H: EventHandler = NullEventHandler> {
    connection: AsyncMutex<Connection>,
    socket: UdpSocket,
    local_state: std::sync::Mutex<U>,
    event_handler: H,
    event_wire: Option<Arc<dyn EventWire>>,
    outbound_tx: flume::Sender<(Event, Sqn)>,
    outbound_rx: flume::Receiver<(Event, Sqn)>,
    inbound_tx: flume::Sender<Event>,
    inbound_rx: flume::Receiver<Event>,
    first_sent: Notify,
    shutdown: Notify,
}

impl<U: Update, H: EventHandler> ClientConnection<U, H> {
    /// Binds a UDP socket to `bind_addr`, connects it to `server_address`,
    /// and builds a client connection seeded with `initial_state`.
    ///
    /// # Errors
    ///
    /// Returns any [`std::io::Error`] from binding or connecting the
    /// socket.
    pub async fn connect(
        bind_addr: SocketAddr,
        server_address: SocketAddr,
        config: Config,
        initial_state: U,
        event_handler: H,
        event_wire: Option<Arc<dyn EventWire>>,
    ) -> std::io::Result<Arc<Self>> {
        let socket = UdpSocket::bind(bind_addr).await?;
        socket.connect(server_address).await?;
        let (outbound_tx, outbound_rx) = flume::unbounded();
        let (inbound_tx, inbound_rx) = flume::unbounded();
        Ok(Arc::new(Self {
            connection: AsyncMutex::new(Connection::new(server_address, config, Instant::now())),
            socket,
            local_state: std::sync::Mutex::new(initial_state),
            event_handler,
            event_wire,
            outbound_tx,
            outbound_rx,
            inbound_tx,
            inbound_rx,
            first_sent: Notify::new(),
            shutdown: Notify::new(),
        }))
    }

    /// The server this client is connected to.
    pub async fn remote_address(&self) -> SocketAddr {
        self.connection.lock().await.remote_address
    }

    /// This client's own locally bound address, as seen by the server.
    ///
    /// # Errors
    ///
    /// Returns any [`std::io::Error`] from querying the socket.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// A clone of the client's currently held local state.
    pub fn local_state(&self) -> U {
        self.local_state.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Current connection status.
    pub async fn status(&self) -> Status {
        self.connection.lock().await.status
    }

    /// Enqueues an event for the send loop to attach to its next outbound
    /// packet, optionally registering ack/timeout callbacks for it.
    ///
    /// `spec.md` §4.9.
    pub async fn dispatch_event(
        &self,
        event: Event,
        on_ack: Option<Callback>,
        on_timeout: Option<Callback>,
    ) {
        let id = self
            .connection
            .lock()
            .await
            .callbacks
            .register(on_ack, on_timeout);
        let _ = self.outbound_tx.send((event, id));
    }

    /// Spawns the send, receive, event and congestion-monitor tasks and
    /// runs until [`ClientConnection::shutdown`] is called or the
    /// connection times out.
    pub async fn run(self: Arc<Self>) {
        let send = tokio::spawn(self.clone().send_loop());
        let recv = tokio::spawn(self.clone().recv_loop());
        let events = tokio::spawn(self.clone().event_loop());
        let congestion = tokio::spawn(self.clone().congestion_monitor());

        let _ = tokio::join!(send, recv, events, congestion);
    }

    /// Requests that the running tasks stop. If `notify_server` is set, the
    /// literal `shutdown` payload is sent first (only effective if this
    /// client is the server's host-client); otherwise the client tears down
    /// silently, per `spec.md` §4.10.
    pub async fn shutdown(&self, notify_server: bool) {
        if notify_server {
            if let Err(err) = self.socket.send(SHUTDOWN).await {
                warn!(%err, "failed to send shutdown notice");
            }
        }
        self.shutdown.notify_waiters();
    }

    async fn send_loop(self: Arc<Self>) {
        loop {
            let iteration_start = Instant::now();
            let mut connection = self.connection.lock().await;
            if connection.is_timed_out(iteration_start) {
                connection.mark_disconnected();
                drop(connection);
                self.shutdown.notify_waiters();
                return;
            }
            let seq = connection.next_local_sequence();
            let header = connection.header_for(seq);
            let time_order = self.local_state.lock().unwrap_or_else(|e| e.into_inner()).time_order();
            let mut packet = crate::packet::ClientPacket::new(header, time_order);

            let events_per_packet = connection.config().events_per_packet;
            for _ in 0..events_per_packet {
                let Ok((event, callback_id)) = self.outbound_rx.try_recv() else {
                    break;
                };
                if packet.add_event(event).is_err() {
                    break;
                }
                connection.attach_callback(seq, callback_id);
            }

            let send_interval = connection.congestion.send_interval();
            connection.record_sent(seq, iteration_start);
            drop(connection);

            match packet.to_bytes() {
                Ok(bytes) => {
                    if let Err(err) = self.socket.send(&bytes).await {
                        warn!(%err, "send failed");
                    } else {
                        trace!(seq = seq.0, "sent client packet");
                    }
                }
                Err(err) => warn!(%err, "failed to serialize outbound packet"),
            }
            if seq.0 == 1 {
                // `notify_one` latches a permit if `recv_loop` hasn't
                // reached its `notified().await` yet; `notify_waiters`
                // would drop the wakeup on the floor in that case.
                self.first_sent.notify_one();
            }

            let elapsed = iteration_start.elapsed();
            let delay = send_interval.saturating_sub(elapsed);
            tokio::select! {
                () = sleep(delay) => {}
                () = self.shutdown.notified() => return,
            }
        }
    }

    async fn recv_loop(self: Arc<Self>) {
        // spec.md §4.8: the client must not listen before its first packet
        // has gone out, or the server won't yet know where to reply.
        self.first_sent.notified().await;

        let mut buf = vec![0u8; crate::packet::MAX_DATAGRAM_SIZE];
        loop {
            let recv = self.socket.recv(&mut buf);
            tokio::select! {
                result = recv => {
                    match result {
                        Ok(n) => self.handle_datagram(Bytes::copy_from_slice(&buf[..n])).await,
                        Err(err) => warn!(%err, "recv failed"),
                    }
                }
                () = self.shutdown.notified() => return,
            }
        }
    }

    async fn handle_datagram(&self, datagram: Bytes) {
        let packet = match ServerPacket::from_bytes(datagram) {
            Ok(packet) => packet,
            Err(crate::error::FrameError::ProtocolMismatch) => return,
            Err(err) => {
                warn!(%err, "malformed server packet");
                return;
            }
        };

        let now = Instant::now();
        let released = {
            let mut connection = self.connection.lock().await;
            match connection.recv(&packet.header, now) {
                Ok(released) => released,
                Err(err) => {
                    debug!(%err, "dropped server packet");
                    return;
                }
            }
        };
        invoke_released(released).await;

        match U::from_bytes(packet.state_update.clone()) {
            Ok(update) => {
                let mut state = self.local_state.lock().unwrap_or_else(|e| e.into_inner());
                *state = state.clone().merge(update);
            }
            Err(err) => warn!(%err, "failed to decode state update"),
        }

        for event in packet.events() {
            let _ = self.inbound_tx.send(event.clone());
            if let Some(wire) = &self.event_wire {
                if let Handling::Async(fut) = wire.push_event(event.clone()) {
                    fut.await;
                }
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
            let min_throttle = self.connection.lock().await.config().min_throttle_time;
            let interval = min_throttle / 2;
            tokio::select! {
                () = sleep(interval) => {}
                () = self.shutdown.notified() => return,
            }
            let now = Instant::now();
            let mut connection = self.connection.lock().await;
            let latency = connection.latency.latency;
            connection.evaluate_congestion(now);
            drop(connection);
            trace!(latency, "congestion monitor tick");
        }
    }
}

impl<U: Update, H: EventHandler> std::fmt::Debug for ClientConnection<U, H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConnection").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::convert::Infallible;

    use super::*;

    #[derive(Debug, Clone, Default, PartialEq, Eq)]
    struct NullState {
        time_order: Sqn,
    }

    impl Update for NullState {
        type DecodeError = Infallible;

        fn time_order(&self) -> Sqn {
            self.time_order
        }

        fn merge(self, other: Self) -> Self {
            if other.time_order > self.time_order {
                other
            } else {
                self
            }
        }

        fn zero(time_order: Sqn) -> Self {
            Self { time_order }
        }

        fn to_bytes(&self) -> Bytes {
            Bytes::copy_from_slice(&self.time_order.0.to_be_bytes())
        }

        fn from_bytes(bytes: Bytes) -> Result<Self, Infallible> {
            Ok(Self {
                time_order: Sqn(u16::from_be_bytes([bytes[0], bytes[1]])),
            })
        }
    }

    #[tokio::test]
    async fn connect_binds_and_records_remote() {
        let server_sock = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server_addr = server_sock.local_addr().unwrap();

        let client = ClientConnection::connect(
            "127.0.0.1:0".parse().unwrap(),
            server_addr,
            Config::default(),
            NullState::default(),
            NullEventHandler,
            None,
        )
        .await
        .unwrap();

        assert_eq!(client.remote_address().await, server_addr);
        assert_eq!(client.status().await, Status::Connecting);
    }
}
