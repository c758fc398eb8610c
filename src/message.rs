use num_enum::{IntoPrimitive, TryFromPrimitive};
use crate::seq::Seq16;

/// The single byte body of a control datagram
#[derive(Copy, Clone, Debug, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum ControlKind {
    Reset = 2,
    ResetOk = 3,
}

/// What a peer's slice of a message looks like: how many payload bytes belong to it, and which
///  stream lifecycle edges it signals
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct Segment {
    /// the sender started a new stream for this peer with this message
    pub opened: bool,
    /// the sender's side of the stream ended, all its bytes are in this or earlier messages
    pub closed: bool,
    /// the sender's receive buffer for this peer is (nearly) full: stop sending for this peer
    pub blocked: bool,
    pub size: usize,
}

/// Acknowledgement state of the sender's inbound window, piggybacked on every data message
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct AckReport {
    /// everything before this sequence number was received
    pub base: Seq16,
    /// bit `i` (MSB first) set means `base + 1 + i` was received as well
    pub bitmap: Vec<u8>,
}

impl AckReport {
    pub fn new(base: Seq16, report_count: usize) -> AckReport {
        AckReport {
            base,
            bitmap: vec![0; report_count / 8],
        }
    }

    pub fn report_count(&self) -> usize {
        self.bitmap.len() * 8
    }

    pub fn set(&mut self, offset: usize) {
        self.bitmap[offset >> 3] |= Self::mask(offset);
    }

    pub fn is_set(&self, offset: usize) -> bool {
        self.bitmap[offset >> 3] & Self::mask(offset) != 0
    }

    /// sequence numbers after `base` that are reported as received
    pub fn selectively_acked(&self) -> impl Iterator<Item = Seq16> + '_ {
        (0..self.report_count())
            .filter(|&offset| self.is_set(offset))
            .map(|offset| self.base.plus(offset + 1))
    }

    fn mask(offset: usize) -> u8 {
        1 << (7 - (offset & 7))
    }
}

/// One unit of the sliding window: a sequence number, the ack state of the sender's inbound
///  window, and a slice of payload for each peer.
///
/// `segments` always has exactly one entry per peer, in peer order, and their sizes add up to the
///  payload's length.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct LogicalMessage {
    pub sequence: Seq16,
    pub ack_report: AckReport,
    pub segments: Vec<Segment>,
    pub payload: Vec<u8>,
}

impl LogicalMessage {
    /// splits the payload into per-peer slices, in peer order
    pub fn segment_data(&self) -> impl Iterator<Item = (usize, &Segment, &[u8])> + '_ {
        let mut offs = 0;
        self.segments.iter()
            .enumerate()
            .map(move |(idx, segment)| {
                let data = &self.payload[offs..offs + segment.size];
                offs += segment.size;
                (idx, segment, data)
            })
    }
}

/// A decoded datagram
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Datagram {
    Control(ControlKind),
    Data(LogicalMessage),
}
