//! Packet framing: header + optional direction-specific preamble + event
//! block, with a memoized, incrementally-extendable encoded form.

use bytes::{Buf, Bytes, BytesMut};

use crate::{error::FrameError, header::Header, seq::Sqn};

/// Maximum serialized packet size in bytes, including the header.
pub const MAX_DATAGRAM_SIZE: usize = 2048;

fn encode_event_block(events: &[Bytes], out: &mut BytesMut) {
    for event in events {
        out.extend_from_slice(&(event.len() as u16).to_be_bytes());
        out.extend_from_slice(event);
    }
}

/// Appends one event to a memoized datagram cache, if one exists.
///
/// Shared by [`Packet`], [`ClientPacket`] and [`ServerPacket`], whose
/// `add_event` only needs to extend an existing cache; rebuilding it from
/// scratch is [`Packet::to_bytes`]'s job.
fn try_append_to_cache(cache: &mut Option<BytesMut>, event: &Bytes) -> Result<(), FrameError> {
    if let Some(cache) = cache {
        if cache.len() + 2 + event.len() > MAX_DATAGRAM_SIZE {
            return Err(FrameError::Overflow);
        }
        cache.extend_from_slice(&(event.len() as u16).to_be_bytes());
        cache.extend_from_slice(event);
    }
    Ok(())
}

fn decode_event_block(mut buf: Bytes) -> Result<Vec<Bytes>, FrameError> {
    let mut events = Vec::new();
    while buf.has_remaining() {
        if buf.remaining() < 2 {
            return Err(FrameError::MalformedEventBlock);
        }
        let len = usize::from(buf.get_u16());
        if buf.remaining() < len {
            return Err(FrameError::MalformedEventBlock);
        }
        events.push(buf.copy_to_bytes(len));
    }
    Ok(events)
}

/// A base packet: a [`Header`] plus an ordered list of opaque event
/// payloads.
///
/// Encoding is memoized: once [`Packet::to_bytes`] has been called, further
/// [`Packet::add_event`] calls append incrementally to the cached datagram
/// instead of re-serializing from scratch.
#[derive(Debug, Clone, Default)]
pub struct Packet {
    /// The packet header.
    pub header: Header,
    events: Vec<Bytes>,
    cache: Option<BytesMut>,
}

impl Packet {
    /// Creates a new, empty packet with the given header.
    #[must_use]
    pub fn new(header: Header) -> Self {
        Self {
            header,
            events: Vec::new(),
            cache: None,
        }
    }

    /// The events attached to this packet, in insertion order.
    #[must_use]
    pub fn events(&self) -> &[Bytes] {
        &self.events
    }

    /// Appends an event to this packet.
    ///
    /// If a datagram has already been cached (a prior [`Packet::to_bytes`]
    /// call), this appends to that cache directly and fails with
    /// [`FrameError::Overflow`] without mutating the packet if the new total
    /// would exceed [`MAX_DATAGRAM_SIZE`]. If no cache exists yet, the event
    /// is always accepted (oversize is only caught on the next
    /// [`Packet::to_bytes`]).
    ///
    /// # Errors
    ///
    /// See above.
    pub fn add_event(&mut self, event: Bytes) -> Result<(), FrameError> {
        try_append_to_cache(&mut self.cache, &event)?;
        self.events.push(event);
        Ok(())
    }

    /// Serializes this packet, computing and caching the datagram if no
    /// cache exists yet.
    ///
    /// # Errors
    ///
    /// Returns [`FrameError::Overflow`] if the result exceeds
    /// [`MAX_DATAGRAM_SIZE`]. The packet remains usable afterwards in its
    /// pre-overflow state (no cache is stored on failure).
    pub fn to_bytes(&mut self) -> Result<Bytes, FrameError> {
        if let Some(cache) = &self.cache {
            return Ok(cache.clone().freeze());
        }
        let mut buf = BytesMut::with_capacity(crate::header::HEADER_LEN);
        self.header.encode(&mut buf);
        encode_event_block(&self.events, &mut buf);
        if buf.len() > MAX_DATAGRAM_SIZE {
            return Err(FrameError::Overflow);
        }
        self.cache = Some(buf.clone());
        Ok(buf.freeze())
    }

    /// Parses a base packet from a received datagram.
    ///
    /// # Errors
    ///
    /// See [`Header::decode`] and [`decode_event_block`].
    pub fn from_bytes(datagram: Bytes) -> Result<Self, FrameError> {
        let mut buf = datagram.clone();
        let header = Header::decode(&mut buf)?;
        let events = decode_event_block(buf)?;
        Ok(Self {
            header,
            events,
            cache: Some(BytesMut::from(&datagram[..])),
        })
    }
}

/// A packet sent by a client: a [`Packet`] with a `time_order` preamble
/// naming the client's latest known game-state ordering.
#[derive(Debug, Clone, Default)]
pub struct ClientPacket {
    /// The packet header.
    pub header: Header,
    /// The client's latest known game-state ordering.
    pub time_order: Sqn,
    events: Vec<Bytes>,
    cache: Option<BytesMut>,
}

impl ClientPacket {
    /// Creates a new, empty client packet.
    #[must_use]
    pub fn new(header: Header, time_order: Sqn) -> Self {
        Self {
            header,
            time_order,
            events: Vec::new(),
            cache: None,
        }
    }

    /// The events attached to this packet, in insertion order.
    #[must_use]
    pub fn events(&self) -> &[Bytes] {
        &self.events
    }

    /// See [`Packet::add_event`].
    ///
    /// # Errors
    ///
    /// See [`Packet::add_event`].
    pub fn add_event(&mut self, event: Bytes) -> Result<(), FrameError> {
        try_append_to_cache(&mut self.cache, &event)?;
        self.events.push(event);
        Ok(())
    }

    /// See [`Packet::to_bytes`].
    ///
    /// # Errors
    ///
    /// See [`Packet::to_bytes`].
    pub fn to_bytes(&mut self) -> Result<Bytes, FrameError> {
        if let Some(cache) = &self.cache {
            return Ok(cache.clone().freeze());
        }
        let mut buf = BytesMut::with_capacity(crate::header::HEADER_LEN + 2);
        self.header.encode(&mut buf);
        buf.extend_from_slice(&self.time_order.0.to_be_bytes());
        encode_event_block(&self.events, &mut buf);
        if buf.len() > MAX_DATAGRAM_SIZE {
            return Err(FrameError::Overflow);
        }
        self.cache = Some(buf.clone());
        Ok(buf.freeze())
    }

    /// Parses a client packet from a received datagram.
    ///
    /// # Errors
    ///
    /// See [`Header::decode`] and [`decode_event_block`]; also fails with
    /// [`FrameError::MalformedHeader`] if the `time_order` preamble is
    /// truncated.
    pub fn from_bytes(datagram: Bytes) -> Result<Self, FrameError> {
        let mut buf = datagram.clone();
        let header = Header::decode(&mut buf)?;
        if buf.remaining() < 2 {
            return Err(FrameError::MalformedHeader);
        }
        let time_order = Sqn(buf.get_u16());
        let events = decode_event_block(buf)?;
        Ok(Self {
            header,
            time_order,
            events,
            cache: Some(BytesMut::from(&datagram[..])),
        })
    }
}

/// A packet sent by a server: a [`Packet`] with a length-prefixed opaque
/// state-update preamble.
#[derive(Debug, Clone, Default)]
pub struct ServerPacket {
    /// The packet header.
    pub header: Header,
    /// Opaque state-delta payload, supplied by an external state store.
    pub state_update: Bytes,
    events: Vec<Bytes>,
    cache: Option<BytesMut>,
}

impl ServerPacket {
    /// Creates a new, empty server packet.
    #[must_use]
    pub fn new(header: Header, state_update: Bytes) -> Self {
        Self {
            header,
            state_update,
            events: Vec::new(),
            cache: None,
        }
    }

    /// The events attached to this packet, in insertion order.
    #[must_use]
    pub fn events(&self) -> &[Bytes] {
        &self.events
    }

    /// See [`Packet::add_event`].
    ///
    /// # Errors
    ///
    /// See [`Packet::add_event`].
    pub fn add_event(&mut self, event: Bytes) -> Result<(), FrameError> {
        try_append_to_cache(&mut self.cache, &event)?;
        self.events.push(event);
        Ok(())
    }

    /// See [`Packet::to_bytes`].
    ///
    /// # Errors
    ///
    /// See [`Packet::to_bytes`].
    pub fn to_bytes(&mut self) -> Result<Bytes, FrameError> {
        if let Some(cache) = &self.cache {
            return Ok(cache.clone().freeze());
        }
        let mut buf = BytesMut::with_capacity(crate::header::HEADER_LEN + 2 + self.state_update.len());
        self.header.encode(&mut buf);
        buf.extend_from_slice(&(self.state_update.len() as u16).to_be_bytes());
        buf.extend_from_slice(&self.state_update);
        encode_event_block(&self.events, &mut buf);
        if buf.len() > MAX_DATAGRAM_SIZE {
            return Err(FrameError::Overflow);
        }
        self.cache = Some(buf.clone());
        Ok(buf.freeze())
    }

    /// Parses a server packet from a received datagram.
    ///
    /// # Errors
    ///
    /// See [`Header::decode`] and [`decode_event_block`]; also fails with
    /// [`FrameError::MalformedEventBlock`] if the state-update preamble is
    /// truncated.
    pub fn from_bytes(datagram: Bytes) -> Result<Self, FrameError> {
        let mut buf = datagram.clone();
        let header = Header::decode(&mut buf)?;
        if buf.remaining() < 2 {
            return Err(FrameError::MalformedEventBlock);
        }
        let len = usize::from(buf.get_u16());
        if buf.remaining() < len {
            return Err(FrameError::MalformedEventBlock);
        }
        let state_update = buf.copy_to_bytes(len);
        let events = decode_event_block(buf)?;
        Ok(Self {
            header,
            state_update,
            events,
            cache: Some(BytesMut::from(&datagram[..])),
        })
    }
}
