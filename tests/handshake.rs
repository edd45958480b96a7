//! End-to-end scenarios over real loopback UDP sockets, matching the
//! workflows described in `spec.md` §8's testable-properties list.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::time::Duration;

use aeronet_core::{
    client::ClientConnection,
    config::Config,
    connection::Status,
    event_handler::NullEventHandler,
    seq::Sqn,
    server::Server,
    state::{InMemoryStateStore, Update},
};
use bytes::Bytes;

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

async fn spawn_server() -> (std::sync::Arc<Server<InMemoryStateStore<CounterState>>>, SocketAddr) {
    let store = InMemoryStateStore::new(
        CounterState {
            time_order: Sqn(1),
            total: 42,
        },
        100,
    );
    let server = Server::bind(
        "127.0.0.1:0".parse().unwrap(),
        store,
        Config::default(),
        NullEventHandler,
        None,
    )
    .await
    .unwrap();
    let addr = server.local_addr().unwrap();
    (server, addr)
}

#[tokio::test]
async fn first_handshake_delivers_snapshot_and_marks_host_client() {
    let (server, server_addr) = spawn_server().await;
    tokio::spawn(server.clone().run());

    let client = ClientConnection::connect(
        "127.0.0.1:0".parse().unwrap(),
        server_addr,
        Config::default(),
        CounterState::default(),
        NullEventHandler,
        None,
    )
    .await
    .unwrap();
    tokio::spawn(client.clone().run());

    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(client.status().await, Status::Connected);
    assert_eq!(client.local_state().total, 42);
    assert!(server.host_client().await.is_some());

    client.shutdown(false).await;
}

#[tokio::test]
async fn non_host_shutdown_is_ignored_but_host_shutdown_stops_server() {
    let (server, server_addr) = spawn_server().await;
    let server_task = tokio::spawn(server.clone().run());

    let first = ClientConnection::connect(
        "127.0.0.1:0".parse().unwrap(),
        server_addr,
        Config::default(),
        CounterState::default(),
        NullEventHandler,
        None,
    )
    .await
    .unwrap();
    tokio::spawn(first.clone().run());

    let second = ClientConnection::connect(
        "127.0.0.1:0".parse().unwrap(),
        server_addr,
        Config::default(),
        CounterState::default(),
        NullEventHandler,
        None,
    )
    .await
    .unwrap();
    tokio::spawn(second.clone().run());

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(server.host_client().await, Some(first.local_addr().unwrap()));

    // non-host shutdown: server keeps running
    second.shutdown(true).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!server_task.is_finished());

    // host shutdown: server exits
    first.shutdown(true).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(server_task.is_finished());
}
