//! Packing the peers' send buffers into messages, and unpacking received messages into the
//!  peers' receive buffers.

use std::cmp::min;
use tracing::{debug, trace};

use crate::config::TunnelConfig;
use crate::message::{AckReport, LogicalMessage, Segment};
use crate::peer::PeerTable;
use crate::seq::Seq16;

/// The smallest per-peer cap `c` for which `sum(min(demand, c))` reaches `capacity`, found by binary
///  search in `[0, max_cap]`. If total demand is below capacity, this is `max_cap`.
///
/// Capping every peer at this value fills the message while no single busy peer can crowd out the
///  others.
pub fn fair_share(demands: &[usize], max_cap: usize, capacity: usize) -> usize {
    let mut low = 0;
    let mut high = max_cap;

    while low < high {
        let mid = (low + high) / 2;
        let total = demands.iter()
            .map(|&d| min(d, mid))
            .sum::<usize>();

        if total == capacity {
            return mid;
        }
        if total < capacity {
            low = mid + 1;
        }
        else {
            high = mid;
        }
    }
    low
}

/// Builds the next fresh message from the peers' send buffers, consuming the bytes that go into it
///  and the stream edges it signals.
///
/// The returned message carries an empty ack report: that is filled in whenever the message is
///  actually put on the wire.
pub fn compose<D>(peers: &mut PeerTable<D>, config: &TunnelConfig, sequence: Seq16) -> LogicalMessage {
    let demands = peers.iter()
        .map(|p| if p.dont_send { 0 } else { p.send.data.len() })
        .collect::<Vec<_>>();
    let limit = fair_share(&demands, config.peer_max_send(), config.message_data_max_size());
    let alert_size = config.alert_size();

    let mut remaining = config.message_data_max_size();
    let mut segments = Vec::with_capacity(peers.len());
    let mut payload = Vec::new();

    for (idx, peer) in peers.iter_mut().enumerate() {
        let size = min(min(demands[idx], limit), remaining);
        payload.extend_from_slice(&peer.send.data.split_to(size));
        remaining -= size;

        let opened = peer.send.open;
        peer.send.open = false;

        let mut closed = false;
        if peer.send.data.is_empty() {
            closed = peer.send.close;
            peer.send.close = false;
        }

        // the wire format can not express 'closed' without 'blocked'
        let blocked = closed || peer.recv.data.len() >= alert_size;

        if opened || closed {
            debug!("message #{}: peer {}{}{}", sequence, idx, if opened { " opened" } else { "" }, if closed { " closed" } else { "" });
        }
        segments.push(Segment { opened, closed, blocked, size });
    }

    trace!("composed message #{} with {} payload bytes (fair share {})", sequence, payload.len(), limit);
    LogicalMessage {
        sequence,
        ack_report: AckReport::default(),
        segments,
        payload,
    }
}

/// Applies a message's segments to the peers' receive buffers. Bytes that do not fit into a
///  receive buffer are dropped: flow control is supposed to prevent that from happening.
pub fn deliver<D>(peers: &mut PeerTable<D>, msg: &LogicalMessage) {
    let capacity = peers.recv_capacity();

    for (idx, segment, data) in msg.segment_data() {
        let peer = peers.get_mut(idx);

        if segment.opened {
            peer.recv.data.clear();
            peer.recv.open = true;
            peer.recv.close = false;
        }

        let room = capacity.saturating_sub(peer.recv.data.len());
        if data.len() > room {
            debug!("message #{}: receive buffer of peer {} is full, dropping {} bytes", msg.sequence, idx, data.len() - room);
        }
        peer.recv.data.extend_from_slice(&data[..min(data.len(), room)]);

        if segment.closed {
            peer.recv.close = true;
        }
        peer.dont_send = segment.blocked;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{test_config, test_message};
    use rstest::rstest;

    fn table_with_demands(demands: &[usize]) -> PeerTable<()> {
        let mut peers = PeerTable::new(&test_config());
        for (idx, &demand) in demands.iter().enumerate() {
            peers.attach(());
            peers.get_mut(idx).send.open = false;
            peers.push_send(idx, &vec![idx as u8; demand]);
        }
        peers
    }

    #[rstest]
    #[case::one_busy(vec![1000, 10, 0], 1000, 100, 90)]
    #[case::two_busy(vec![1000, 1000, 0], 1000, 100, 50)]
    #[case::all_fit(vec![10, 5, 0], 1000, 100, 1000)]
    #[case::nothing(vec![0, 0, 0], 1000, 100, 1000)]
    #[case::capped(vec![1000, 1000, 1000], 20, 100, 20)]
    #[case::no_exact_fill(vec![1000, 1000, 1000], 1000, 100, 34)]
    fn test_fair_share(#[case] demands: Vec<usize>, #[case] max_cap: usize, #[case] capacity: usize, #[case] expected: usize) {
        assert_eq!(fair_share(&demands, max_cap, capacity), expected);
    }

    #[test]
    fn test_compose_shares_fairly() {
        let config = test_config();
        let data_max = config.message_data_max_size();
        let mut peers = table_with_demands(&[data_max, 10, 0]);

        let msg = compose(&mut peers, &config, Seq16::from_raw(7));
        assert_eq!(msg.sequence, Seq16::from_raw(7));
        assert_eq!(msg.segments.iter().map(|s| s.size).collect::<Vec<_>>(), vec![data_max - 10, 10, 0]);
        assert_eq!(msg.payload.len(), data_max);
        assert_eq!(&msg.payload[data_max - 10..], &[1u8; 10]);

        assert_eq!(peers.get(0).send.data.len(), 10);
        assert!(peers.get(1).send.data.is_empty());
    }

    #[test]
    fn test_compose_skips_blocked_peers() {
        let config = test_config();
        let mut peers = table_with_demands(&[50, 50]);
        peers.get_mut(0).dont_send = true;

        let msg = compose(&mut peers, &config, Seq16::ZERO);
        assert_eq!(msg.segments[0].size, 0);
        assert_eq!(msg.segments[1].size, 50);
        assert_eq!(peers.get(0).send.data.len(), 50);
    }

    #[test]
    fn test_compose_flags() {
        let config = test_config();
        let mut peers = table_with_demands(&[5, 5, 0]);
        peers.get_mut(0).send.open = true;
        peers.get_mut(1).send.close = true;
        peers.get_mut(2).recv.data.extend_from_slice(&vec![0u8; config.alert_size()]);

        let msg = compose(&mut peers, &config, Seq16::ZERO);
        assert_eq!(msg.segments[0], Segment { opened: true, closed: false, blocked: false, size: 5 });
        assert_eq!(msg.segments[1], Segment { opened: false, closed: true, blocked: true, size: 5 });
        assert_eq!(msg.segments[2], Segment { opened: false, closed: false, blocked: true, size: 0 });

        // edges are signalled once
        assert!(!peers.get(0).send.open);
        assert!(!peers.get(1).send.close);
        let next = compose(&mut peers, &config, Seq16::from_raw(1));
        assert!(!next.segments[0].opened);
        assert!(!next.segments[1].closed);
    }

    #[test]
    fn test_close_waits_for_buffered_data() {
        let config = test_config();
        let data_max = config.message_data_max_size();
        let mut peers = table_with_demands(&[data_max, data_max]);
        peers.get_mut(0).send.close = true;

        let first = compose(&mut peers, &config, Seq16::ZERO);
        assert_eq!(first.segments[0].size, data_max / 2);
        assert!(!first.segments[0].closed);
        let second = compose(&mut peers, &config, Seq16::from_raw(1));
        assert_eq!(second.segments[0].size, data_max / 2);
        assert!(second.segments[0].closed);
    }

    #[test]
    fn test_deliver() {
        let mut peers = PeerTable::<()>::new(&test_config());
        let mut msg = test_message(Seq16::ZERO, &[b"abc", b"de", b""]);
        msg.segments[0].opened = true;
        msg.segments[1].closed = true;
        msg.segments[1].blocked = true;

        deliver(&mut peers, &msg);
        assert_eq!(peers.recv_pending(0), b"abc");
        assert!(peers.get(0).recv.open);
        assert!(!peers.get(0).dont_send);
        assert_eq!(peers.recv_pending(1), b"de");
        assert!(peers.get(1).recv.close);
        assert!(peers.get(1).dont_send);
        assert!(peers.recv_pending(2).is_empty());
    }

    #[test]
    fn test_deliver_opened_restarts_stream() {
        let mut peers = PeerTable::<()>::new(&test_config());
        deliver(&mut peers, &test_message(Seq16::ZERO, &[b"old", b"", b""]));
        peers.get_mut(0).recv.close = true;

        let mut msg = test_message(Seq16::from_raw(1), &[b"new", b"", b""]);
        msg.segments[0].opened = true;
        deliver(&mut peers, &msg);

        assert_eq!(peers.recv_pending(0), b"new");
        assert!(!peers.get(0).recv.close);
    }

    #[test]
    fn test_deliver_truncates_when_full() {
        let mut peers = PeerTable::<()>::new(&test_config());
        let capacity = peers.recv_capacity();
        peers.get_mut(0).recv.data.extend_from_slice(&vec![0u8; capacity - 2]);

        deliver(&mut peers, &test_message(Seq16::ZERO, &[b"abcd", b"", b""]));
        assert_eq!(peers.recv_pending(0).len(), capacity);
        assert_eq!(&peers.recv_pending(0)[capacity - 2..], b"ab");
    }
}
