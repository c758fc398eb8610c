use tracing::trace;

use crate::message::{AckReport, LogicalMessage};
use crate::seq::Seq16;

/// Reasons for dropping an authentic data message before it is stored
#[derive(Debug, Clone, Copy, Eq, PartialEq, thiserror::Error)]
pub enum InboundRejection {
    #[error("message #{seq} is outside the receive window starting at #{in_seq}")]
    WindowReject { seq: Seq16, in_seq: Seq16 },
    #[error("message #{0} was received before")]
    Duplicate(Seq16),
}

#[derive(Debug, Clone)]
pub struct OutboundEntry {
    pub message: LogicalMessage,
    /// the remote side confirmed receipt, either cumulatively or selectively
    pub delivered: bool,
    /// value of the attempt counter when this message was last put on the wire
    pub last_attempt: Seq16,
}

/// The two ring buffers of the sliding window, one per direction.
///
/// Slots are addressed by `sequence mod capacity`. Nothing is cleared on read: a slot's occupant is
///  valid for a given sequence number only if it was stored under exactly that number, which is what
///  every accessor checks.
pub struct MessageHistory {
    capacity: usize,
    inbound: Vec<Option<LogicalMessage>>,
    outbound: Vec<Option<OutboundEntry>>,
}

impl MessageHistory {
    pub fn new(capacity: u16) -> MessageHistory {
        let capacity = capacity as usize;
        assert!(capacity.is_power_of_two());

        MessageHistory {
            capacity,
            inbound: vec![None; capacity],
            outbound: vec![None; capacity],
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// marks every slot in both directions as empty
    pub fn clear(&mut self) {
        self.inbound.iter_mut().for_each(|slot| *slot = None);
        self.outbound.iter_mut().for_each(|slot| *slot = None);
    }

    /// Stores an inbound message if it is inside the window `[in_seq, in_seq + capacity)` and was
    ///  not stored before.
    pub fn record_inbound(&mut self, msg: LogicalMessage, in_seq: Seq16) -> Result<(), InboundRejection> {
        let seq = msg.sequence;
        if seq.distance_from(in_seq) as usize >= self.capacity {
            return Err(InboundRejection::WindowReject { seq, in_seq });
        }

        let slot = &mut self.inbound[seq.slot(self.capacity)];
        if matches!(slot, Some(m) if m.sequence == seq) {
            return Err(InboundRejection::Duplicate(seq));
        }

        trace!("storing inbound message #{}", seq);
        *slot = Some(msg);
        Ok(())
    }

    pub fn inbound(&self, seq: Seq16) -> Option<&LogicalMessage> {
        self.inbound[seq.slot(self.capacity)].as_ref()
            .filter(|m| m.sequence == seq)
    }

    /// The acknowledgement state of the inbound window: the first sequence number from `in_seq`
    ///  onward that was not received yet, and a bitmap of received messages after it.
    pub fn ack_report(&self, in_seq: Seq16, report_count: usize) -> AckReport {
        let mut base = in_seq;
        for _ in 0..self.capacity {
            if self.inbound(base).is_none() {
                break;
            }
            base = base.next();
        }

        let mut report = AckReport::new(base, report_count);
        for offset in 0..report_count {
            if self.inbound(base.plus(offset + 1)).is_some() {
                report.set(offset);
            }
        }
        report
    }

    /// Marks outbound messages as delivered based on a remote ack report, returning the number of
    ///  messages that were not marked as delivered before.
    pub fn apply_ack(&mut self, report: &AckReport) -> usize {
        let mut newly_delivered = 0;

        for entry in self.outbound.iter_mut().flatten() {
            let behind = report.base.distance_from(entry.message.sequence) as usize;
            if 0 < behind && behind <= self.capacity && !entry.delivered {
                entry.delivered = true;
                newly_delivered += 1;
            }
        }

        for seq in report.selectively_acked() {
            if let Some(entry) = self.outbound[seq.slot(self.capacity)].as_mut() {
                if entry.message.sequence == seq && !entry.delivered {
                    entry.delivered = true;
                    newly_delivered += 1;
                }
            }
        }

        if newly_delivered > 0 {
            trace!("ack report with base #{} confirmed {} messages", report.base, newly_delivered);
        }
        newly_delivered
    }

    /// Stores a freshly composed message, returning whatever previously occupied its slot
    pub fn store_outbound(&mut self, message: LogicalMessage, attempt: Seq16) -> Option<OutboundEntry> {
        let slot = message.sequence.slot(self.capacity);
        self.outbound[slot].replace(OutboundEntry {
            message,
            delivered: false,
            last_attempt: attempt,
        })
    }

    pub fn outbound(&self, seq: Seq16) -> Option<&OutboundEntry> {
        self.outbound[seq.slot(self.capacity)].as_ref()
            .filter(|e| e.message.sequence == seq)
    }

    /// Picks the undelivered outbound message that went longest without being sent, if it is due
    ///  for retransmission. It is due if at least half a window's worth of send attempts happened
    ///  since it was last sent, or if the oldest message in the window is still undelivered: that
    ///  message blocks the next fresh message from being stored.
    ///
    /// The returned entry's `last_attempt` is updated to `attempt_seq`.
    pub fn select_retransmission(&mut self, attempt_seq: Seq16, out_seq: Seq16) -> Option<&mut LogicalMessage> {
        let mut best: Option<usize> = None;
        for (idx, entry) in self.outbound.iter().enumerate() {
            let Some(entry) = entry else { continue };
            if entry.delivered {
                continue;
            }
            match best {
                None => best = Some(idx),
                Some(b) => {
                    if let Some(current) = &self.outbound[b] {
                        if entry.last_attempt.is_before(current.last_attempt) {
                            best = Some(idx);
                        }
                    }
                }
            }
        }
        let best = best?;

        let oldest_seq = out_seq.minus(self.capacity);
        let oldest_pending = matches!(self.outbound(oldest_seq), Some(e) if !e.delivered);

        let entry = self.outbound[best].as_mut()?;
        let since_last_attempt = attempt_seq.distance_from(entry.last_attempt) as usize;
        if since_last_attempt < self.capacity / 2 && !oldest_pending {
            return None;
        }

        trace!("retransmitting message #{} (last attempt {}, now {})", entry.message.sequence, entry.last_attempt, attempt_seq);
        entry.last_attempt = attempt_seq;
        Some(&mut entry.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::test_message;
    use rstest::rstest;

    fn msg(seq: u16) -> LogicalMessage {
        test_message(Seq16::from_raw(seq), &[b"x", b"", b""])
    }

    fn history_with_outbound(seqs: &[u16]) -> MessageHistory {
        let mut history = MessageHistory::new(8);
        for (i, &seq) in seqs.iter().enumerate() {
            history.store_outbound(msg(seq), Seq16::from_raw(i as u16));
        }
        history
    }

    #[rstest]
    #[case::at_in_seq(10, 10, true)]
    #[case::last_in_window(17, 10, true)]
    #[case::beyond_window(18, 10, false)]
    #[case::behind_window(9, 10, false)]
    #[case::wrapped_window(3, 65534, true)]
    #[case::wrapped_beyond(6, 65534, false)]
    fn test_record_inbound_window(#[case] seq: u16, #[case] in_seq: u16, #[case] accepted: bool) {
        let mut history = MessageHistory::new(8);
        let result = history.record_inbound(msg(seq), Seq16::from_raw(in_seq));
        assert_eq!(result.is_ok(), accepted);
        assert_eq!(history.inbound(Seq16::from_raw(seq)).is_some(), accepted);
    }

    #[test]
    fn test_record_inbound_duplicate() {
        let mut history = MessageHistory::new(8);
        history.record_inbound(msg(3), Seq16::ZERO).unwrap();
        assert_eq!(history.record_inbound(msg(3), Seq16::ZERO), Err(InboundRejection::Duplicate(Seq16::from_raw(3))));
    }

    #[test]
    fn test_stale_slot_occupant_is_ignored() {
        let mut history = MessageHistory::new(8);
        history.record_inbound(msg(3), Seq16::ZERO).unwrap();

        assert!(history.inbound(Seq16::from_raw(11)).is_none());
        // the slot is reused for the next lap
        history.record_inbound(msg(11), Seq16::from_raw(8)).unwrap();
        assert!(history.inbound(Seq16::from_raw(3)).is_none());
        assert!(history.inbound(Seq16::from_raw(11)).is_some());
    }

    #[rstest]
    #[case::empty(vec![], 5, 5, vec![0])]
    #[case::contiguous(vec![5, 6], 5, 7, vec![0])]
    #[case::gap(vec![5, 7, 9], 5, 6, vec![0b1010_0000])]
    #[case::only_later(vec![8], 5, 5, vec![0b0010_0000])]
    #[case::wrap_around(vec![65535, 0, 2], 65535, 1, vec![0b1000_0000])]
    fn test_ack_report(#[case] stored: Vec<u16>, #[case] in_seq: u16, #[case] base: u16, #[case] bitmap: Vec<u8>) {
        let mut history = MessageHistory::new(8);
        for seq in stored {
            history.record_inbound(msg(seq), Seq16::from_raw(in_seq)).unwrap();
        }

        let report = history.ack_report(Seq16::from_raw(in_seq), 8);
        assert_eq!(report.base, Seq16::from_raw(base));
        assert_eq!(report.bitmap, bitmap);
    }

    #[test]
    fn test_apply_cumulative_ack() {
        let mut history = history_with_outbound(&[10, 11, 12, 13]);

        assert_eq!(history.apply_ack(&AckReport::new(Seq16::from_raw(12), 8)), 2);
        assert!(history.outbound(Seq16::from_raw(10)).unwrap().delivered);
        assert!(history.outbound(Seq16::from_raw(11)).unwrap().delivered);
        assert!(!history.outbound(Seq16::from_raw(12)).unwrap().delivered);
        assert!(!history.outbound(Seq16::from_raw(13)).unwrap().delivered);

        // repeated acks confirm nothing new
        assert_eq!(history.apply_ack(&AckReport::new(Seq16::from_raw(12), 8)), 0);
    }

    #[test]
    fn test_apply_selective_ack() {
        let mut history = history_with_outbound(&[65534, 65535, 0, 1]);

        let mut report = AckReport::new(Seq16::from_raw(65534), 8);
        report.set(1);
        report.set(5);
        assert_eq!(history.apply_ack(&report), 1);

        assert!(!history.outbound(Seq16::from_raw(65534)).unwrap().delivered);
        assert!(!history.outbound(Seq16::from_raw(65535)).unwrap().delivered);
        assert!(history.outbound(Seq16::from_raw(0)).unwrap().delivered);
        assert!(!history.outbound(Seq16::from_raw(1)).unwrap().delivered);
    }

    #[test]
    fn test_store_outbound_returns_displaced() {
        let mut history = history_with_outbound(&[0, 1]);
        let displaced = history.store_outbound(msg(8), Seq16::from_raw(5)).unwrap();
        assert_eq!(displaced.message.sequence, Seq16::ZERO);
        assert!(history.outbound(Seq16::ZERO).is_none());
    }

    #[test]
    fn test_retransmission_waits_for_half_a_window() {
        let mut history = history_with_outbound(&[0, 1]);

        assert!(history.select_retransmission(Seq16::from_raw(3), Seq16::from_raw(2)).is_none());
        let resent = history.select_retransmission(Seq16::from_raw(4), Seq16::from_raw(2)).unwrap();
        assert_eq!(resent.sequence, Seq16::ZERO);

        // message 0 was just sent again, so now message 1 has the older attempt
        assert!(history.select_retransmission(Seq16::from_raw(5), Seq16::from_raw(2)).is_some_and(|m| m.sequence == Seq16::from_raw(1)));
        assert!(history.select_retransmission(Seq16::from_raw(6), Seq16::from_raw(2)).is_none());
    }

    #[test]
    fn test_retransmission_skips_delivered() {
        let mut history = history_with_outbound(&[0, 1, 2]);
        history.apply_ack(&AckReport::new(Seq16::from_raw(2), 8));

        let resent = history.select_retransmission(Seq16::from_raw(100), Seq16::from_raw(3)).unwrap();
        assert_eq!(resent.sequence, Seq16::from_raw(2));
    }

    #[test]
    fn test_retransmission_of_oldest_is_immediate() {
        let mut history = MessageHistory::new(8);
        for seq in 0..8 {
            history.store_outbound(msg(seq), Seq16::from_raw(10));
        }

        // all attempts are recent, but message 0 blocks the slot for message 8
        let resent = history.select_retransmission(Seq16::from_raw(11), Seq16::from_raw(8)).unwrap();
        assert_eq!(resent.sequence, Seq16::ZERO);

        history.apply_ack(&AckReport::new(Seq16::from_raw(1), 8));
        assert!(history.select_retransmission(Seq16::from_raw(12), Seq16::from_raw(8)).is_none());
    }

    #[test]
    fn test_retransmission_ties_go_to_first_slot() {
        let mut history = MessageHistory::new(8);
        history.store_outbound(msg(2), Seq16::ZERO);
        history.store_outbound(msg(1), Seq16::ZERO);

        let resent = history.select_retransmission(Seq16::from_raw(4), Seq16::from_raw(3)).unwrap();
        assert_eq!(resent.sequence, Seq16::from_raw(1));
    }

    #[test]
    fn test_nothing_to_retransmit() {
        let mut history = MessageHistory::new(8);
        assert!(history.select_retransmission(Seq16::from_raw(100), Seq16::ZERO).is_none());
    }

    #[test]
    fn test_clear() {
        let mut history = history_with_outbound(&[0, 1]);
        history.record_inbound(msg(0), Seq16::ZERO).unwrap();

        history.clear();
        assert!(history.inbound(Seq16::ZERO).is_none());
        assert!(history.outbound(Seq16::ZERO).is_none());
        assert!(history.outbound(Seq16::from_raw(1)).is_none());
    }
}
