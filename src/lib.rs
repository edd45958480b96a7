//! Reliability and congestion-control core for a real-time client/server
//! UDP transport: sequence-number bookkeeping, selective acknowledgment,
//! latency estimation, a hysteretic congestion controller, and the
//! client/server connection tasks built on top of them.
//!
//! Wire framing, state replication and event dispatch are layered over a
//! plain `tokio::net::UdpSocket` - there is no built-in retransmission.
//! Packets that never arrive are simply never acknowledged; callers attach
//! `on_timeout` callbacks ([`event::Callback`]) to events they care about
//! and decide for themselves whether to resend.

pub mod ack;
pub mod client;
pub mod config;
pub mod congestion;
pub mod connection;
pub mod error;
pub mod event;
pub mod event_handler;
pub mod header;
pub mod latency;
pub mod packet;
pub mod seq;
pub mod server;
pub mod state;

pub use ack::RemoteAck;
pub use client::ClientConnection;
pub use config::Config;
pub use congestion::{Congestion, Quality};
pub use connection::{Connection, Status};
pub use error::{AckError, FrameError};
pub use event::{Callback, CallbackRegistry, Event, EventCallbacks};
pub use event_handler::{EventHandler, EventWire, Handling, NullEventHandler};
pub use header::Header;
pub use latency::LatencyEstimator;
pub use packet::{ClientPacket, Packet, ServerPacket};
pub use seq::Sqn;
pub use server::{Server, ServerConnection};
pub use state::{InMemoryStateStore, StateStore, Update};
