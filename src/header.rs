//! Fixed 12-byte packet header: protocol tag, sequence, ack, ack bitfield.

use bytes::{Buf, BufMut};

use crate::{error::FrameError, seq::Sqn};

/// 4-byte tag prefixed to every datagram, used to reject foreign traffic on
/// the same socket.
pub const PROTOCOL_TAG: [u8; 4] = [0xFF, 0xD0, 0xFA, 0xB9];

/// Size in bytes of an encoded [`Header`].
pub const HEADER_LEN: usize = 4 + 2 + 2 + 4;

/// The 12-byte prefix carried by every packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Header {
    /// The sender's outgoing sequence number for this packet.
    pub sequence: Sqn,
    /// The most recent sequence the sender has received from its peer, or
    /// [`Sqn::NONE`].
    pub ack: Sqn,
    /// Bit `i` set means sequence `ack - (i + 1)` has been received.
    pub ack_bitfield: u32,
}

impl Header {
    /// Encodes this header as exactly [`HEADER_LEN`] bytes.
    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_slice(&PROTOCOL_TAG);
        buf.put_u16(self.sequence.0);
        buf.put_u16(self.ack.0);
        buf.put_u32(self.ack_bitfield);
    }

    /// Decodes a header from the front of `buf`, advancing it past the
    /// consumed bytes.
    ///
    /// # Errors
    ///
    /// Returns [`FrameError::MalformedHeader`] if fewer than [`HEADER_LEN`]
    /// bytes remain, or [`FrameError::ProtocolMismatch`] if the leading 4
    /// bytes are not [`PROTOCOL_TAG`].
    pub fn decode(buf: &mut impl Buf) -> Result<Self, FrameError> {
        if buf.remaining() < HEADER_LEN {
            return Err(FrameError::MalformedHeader);
        }
        let mut tag = [0u8; 4];
        buf.copy_to_slice(&mut tag);
        if tag != PROTOCOL_TAG {
            return Err(FrameError::ProtocolMismatch);
        }
        let sequence = Sqn(buf.get_u16());
        let ack = Sqn(buf.get_u16());
        let ack_bitfield = buf.get_u32();
        Ok(Self {
            sequence,
            ack,
            ack_bitfield,
        })
    }
}

#[cfg(test)]
mod tests {
    use bytes::BytesMut;

    use super::*;

    #[test]
    fn round_trip() {
        let h = Header {
            sequence: Sqn(42),
            ack: Sqn(40),
            ack_bitfield: 0b1011,
        };
        let mut buf = BytesMut::with_capacity(HEADER_LEN);
        h.encode(&mut buf);
        assert_eq!(HEADER_LEN, buf.len());

        let decoded = Header::decode(&mut buf.freeze()).unwrap();
        assert_eq!(h, decoded);
    }

    #[test]
    fn rejects_foreign_tag() {
        let mut buf = BytesMut::new();
        buf.put_slice(&[0, 0, 0, 0]);
        buf.put_u16(1);
        buf.put_u16(0);
        buf.put_u32(0);
        assert!(matches!(
            Header::decode(&mut buf.freeze()),
            Err(FrameError::ProtocolMismatch)
        ));
    }

    #[test]
    fn rejects_short_buffer() {
        let mut buf = BytesMut::new();
        buf.put_slice(&PROTOCOL_TAG);
        assert!(matches!(
            Header::decode(&mut buf.freeze()),
            Err(FrameError::MalformedHeader)
        ));
    }
}
