//! Tunable constants, collected behind one [`Config`] rather than scattered
//! module-level consts, so a constructor can be handed a single value.

use std::time::Duration;

use crate::congestion;

/// Tunables for a connection or server. `Default` matches the values
/// `spec.md` §6 calls out as configurable.
#[derive(Debug, Clone, Copy)]
pub struct Config {
    /// How long an unacknowledged outbound packet may stay pending before
    /// its callbacks fire as timed out.
    pub packet_timeout: Duration,
    /// How long without any inbound traffic before a connection is
    /// considered disconnected.
    pub connection_timeout: Duration,
    /// Maximum serialized packet size in bytes.
    pub max_datagram_size: usize,
    /// Floor for the congestion controller's throttle-time dwell.
    pub min_throttle_time: Duration,
    /// Ceiling for the congestion controller's throttle-time dwell.
    pub max_throttle_time: Duration,
    /// Smoothed latency above which quality flips to bad.
    pub latency_threshold: f64,
    /// Send interval while quality is good.
    pub good_interval: Duration,
    /// Send interval while quality is bad.
    pub bad_interval: Duration,
    /// Maximum events drained into a single outbound packet.
    pub events_per_packet: usize,
    /// Maximum entries retained in a server's state-update cache.
    pub update_cache_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            packet_timeout: Duration::from_secs(1),
            connection_timeout: Duration::from_secs(5),
            max_datagram_size: crate::packet::MAX_DATAGRAM_SIZE,
            min_throttle_time: congestion::MIN_THROTTLE_TIME,
            max_throttle_time: congestion::MAX_THROTTLE_TIME,
            latency_threshold: congestion::LATENCY_THRESHOLD,
            good_interval: congestion::GOOD_INTERVAL,
            bad_interval: congestion::BAD_INTERVAL,
            events_per_packet: 5,
            update_cache_size: 100,
        }
    }
}
