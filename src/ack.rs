//! Tracks which remote sequence numbers have been observed, as a "last
//! received" sequence plus a 32-bit bitfield of the 32 preceding sequences.
//!
//! See `spec.md` §4.3 for the exact transition table this implements.

use crate::{error::AckError, seq::Sqn};

/// The receive-side half of the ack bookkeeping: `remote_sequence` and its
/// `ack_bitfield`.
#[derive(Debug, Clone, Copy, Default)]
pub struct RemoteAck {
    /// The newest sequence observed from the peer, or [`Sqn::NONE`] before
    /// the first packet arrives.
    pub remote_sequence: Sqn,
    /// Bit `i` set means sequence `remote_sequence - (i + 1)` was observed.
    pub ack_bitfield: u32,
}

impl RemoteAck {
    /// Folds a newly-received sequence number into the tracked state.
    ///
    /// # Errors
    ///
    /// Returns [`AckError::DuplicateSequence`] if `seq` has already been
    /// recorded, or is older than the 32-entry window behind
    /// `remote_sequence` and so cannot be told apart from a duplicate.
    pub fn observe(&mut self, seq: Sqn) -> Result<(), AckError> {
        if self.remote_sequence.is_none() {
            self.remote_sequence = seq;
            return Ok(());
        }

        let d = self.remote_sequence.diff(seq);
        if d < 0 {
            let jump = (-d) as u32;
            self.remote_sequence = seq;
            // the old `remote_sequence` becomes bit `jump - 1`; everything
            // else shifts `jump` places toward the older end, overflow
            // dropped. A jump spanning the whole window discards the old
            // bitfield entirely rather than marking a bit past it.
            self.ack_bitfield = if jump < 32 {
                (self.ack_bitfield << jump) | (1 << (jump - 1))
            } else {
                0
            };
            Ok(())
        } else if d == 0 {
            Err(AckError::DuplicateSequence)
        } else if d <= 32 {
            let bit = 1u32 << (d - 1);
            if self.ack_bitfield & bit != 0 {
                Err(AckError::DuplicateSequence)
            } else {
                self.ack_bitfield |= bit;
                Ok(())
            }
        } else {
            Err(AckError::DuplicateSequence)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_packet_sets_remote_sequence_with_empty_bitfield() {
        let mut ack = RemoteAck::default();
        ack.observe(Sqn(1)).unwrap();
        assert_eq!(ack.remote_sequence, Sqn(1));
        assert_eq!(ack.ack_bitfield, 0);
    }

    #[test]
    fn out_of_order_window_fills_bitfield() {
        let mut ack = RemoteAck::default();
        for s in [1u16, 3, 5, 2, 4] {
            ack.observe(Sqn(s)).unwrap();
        }
        assert_eq!(ack.remote_sequence, Sqn(5));
        // bits 0..3 correspond to seqs 4,3,2,1, all observed
        assert_eq!(ack.ack_bitfield & 0b1111, 0b1111);
    }

    #[test]
    fn duplicate_is_rejected() {
        let mut ack = RemoteAck::default();
        for s in [1u16, 3, 5, 2, 4] {
            ack.observe(Sqn(s)).unwrap();
        }
        // 3 was already observed as bit index 1 (5-3-1=1)
        assert_eq!(ack.observe(Sqn(3)), Err(AckError::DuplicateSequence));
    }

    #[test]
    fn consecutive_advance_shifts_by_one() {
        let mut ack = RemoteAck::default();
        ack.observe(Sqn(1)).unwrap();
        ack.observe(Sqn(2)).unwrap();
        assert_eq!(ack.remote_sequence, Sqn(2));
        assert_eq!(ack.ack_bitfield, 0b1);
    }

    #[test]
    fn stale_beyond_window_is_duplicate() {
        let mut ack = RemoteAck::default();
        ack.observe(Sqn(100)).unwrap();
        assert_eq!(ack.observe(Sqn(50)), Err(AckError::DuplicateSequence));
    }

    #[test]
    fn big_jump_degenerates_to_all_zero_bitfield() {
        let mut ack = RemoteAck::default();
        ack.observe(Sqn(1)).unwrap();
        ack.observe(Sqn(2)).unwrap();
        ack.observe(Sqn(1000)).unwrap();
        assert_eq!(ack.remote_sequence, Sqn(1000));
        assert_eq!(ack.ack_bitfield, 0);
    }
}
