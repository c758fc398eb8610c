use crate::config::TunnelConfig;
use crate::message::{AckReport, LogicalMessage, Segment};
use crate::seq::Seq16;

/// A small configuration for unit tests: three peers and small datagrams, so that buffers and
///  windows fill up quickly
pub fn test_config() -> TunnelConfig {
    TunnelConfig {
        shared_secret: b"test secret".to_vec(),
        message_history: 128,
        peers_max: 3,
        datagram_max_size: 512,
        peer_recv_buf_size: 65536,
        ..Default::default()
    }
}

/// convenience for unit test code: a message for [test_config] with one slice of payload per peer
///  and no flags set
pub fn test_message(sequence: Seq16, data: &[&[u8]]) -> LogicalMessage {
    let config = test_config();
    assert_eq!(data.len(), config.peers_max);

    LogicalMessage {
        sequence,
        ack_report: AckReport::new(Seq16::ZERO, config.report_count()),
        segments: data.iter()
            .map(|d| Segment { size: d.len(), ..Default::default() })
            .collect(),
        payload: data.concat(),
    }
}

#[test]
fn test_config_is_valid() {
    test_config().validate().unwrap();
}
