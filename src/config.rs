use std::time::Duration;
use anyhow::bail;

/// Bytes in front of the (obfuscated) message: 8 bytes nonce and 8 bytes auth tag
pub const DATAGRAM_PREFIX_LEN: usize = 16;

/// Largest value of a per-peer segment field: `size * 3 + flag` must fit 15 bits, the 16th bit
///  is the 'opened' flag
const MAX_SEGMENT_FIELD: usize = 0x7fff;

/// All tunables of the protocol engine. Both ends of a tunnel *must* use identical values - nothing
///  in the wire format negotiates or verifies them, and a mismatch shows up as every datagram being
///  rejected.
#[derive(Debug, Clone)]
pub struct TunnelConfig {
    /// The pre-shared secret used for both authentication and obfuscation of datagrams.
    ///
    /// NB: This is *not* encryption. It keeps casual observers from reading the payload and
    ///      stops datagrams from being injected by anyone who does not know the secret, but it
    ///      offers no confidentiality against a determined attacker and no forward secrecy.
    pub shared_secret: Vec<u8>,

    /// Number of messages in the sliding window, in each direction. Must be a power of two.
    pub message_history: u16,

    /// Number of byte streams that can be multiplexed over the tunnel
    pub peers_max: usize,

    /// The maximum UDP payload size, including nonce, auth tag and padding.
    pub datagram_max_size: usize,

    /// Receive buffer capacity per peer. This must be big enough to absorb a full window of
    ///  messages after the sender was asked to stop (see [TunnelConfig::alert_size]).
    pub peer_recv_buf_size: usize,

    /// Datagrams sent per second, in total. This is the only rate control the protocol has.
    pub send_frequency: u32,

    /// Maximum difference between a datagram's timestamp and local wall clock time.
    pub time_diff_max: Duration,

    /// Number of consecutive send opportunities without progress after which the session is
    ///  reset.
    pub reset_after_ticks: u32,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        let send_frequency = 40;
        TunnelConfig {
            shared_secret: vec![1, 2, 3, 4, 5, 6, 7, 8],
            message_history: 128,
            peers_max: 18,
            datagram_max_size: 9216,
            peer_recv_buf_size: 5 << 19,
            send_frequency,
            time_diff_max: Duration::from_secs(300),
            reset_after_ticks: 60 * send_frequency,
        }
    }
}

impl TunnelConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.shared_secret.is_empty() {
            bail!("shared secret must not be empty");
        }
        if self.message_history == 0 || !self.message_history.is_power_of_two() {
            bail!("message history must be a power of two, was {}", self.message_history);
        }
        if self.message_history > 0x8000 {
            bail!("message history must not exceed half the sequence number space");
        }
        if self.peers_max == 0 || self.peers_max > 255 {
            bail!("number of peers must be between 1 and 255, was {}", self.peers_max);
        }
        if self.datagram_max_size <= DATAGRAM_PREFIX_LEN + self.header_size() {
            bail!("datagram size {} leaves no room for payload", self.datagram_max_size);
        }
        if self.message_data_max_size() * 3 + 2 > MAX_SEGMENT_FIELD {
            bail!("datagram size {} is too big for the segment size encoding", self.datagram_max_size);
        }
        if self.peer_recv_buf_size <= (self.message_history as usize + 1) * self.peer_max_send() {
            bail!("peer receive buffer of {} bytes can not absorb a full window of messages", self.peer_recv_buf_size);
        }
        if self.send_frequency < 2 {
            bail!("send frequency must be at least 2");
        }
        if self.reset_after_ticks == 0 {
            bail!("reset period must be positive");
        }
        Ok(())
    }

    /// sequence number and ack base (two bytes each) plus one bit per window slot
    pub fn report_size(&self) -> usize {
        2 + self.message_history as usize / 8
    }

    /// number of sequence numbers after the ack base covered by the selective ack bitmap
    pub fn report_count(&self) -> usize {
        (self.report_size() - 2) * 8
    }

    /// timestamp, sequence number, ack report and per-peer segment headers
    pub fn header_size(&self) -> usize {
        6 + self.report_size() + 2 * self.peers_max
    }

    pub fn message_data_max_size(&self) -> usize {
        self.datagram_max_size - DATAGRAM_PREFIX_LEN - self.header_size()
    }

    pub fn peer_max_send(&self) -> usize {
        self.message_data_max_size()
    }

    /// When a peer's receive buffer holds this many bytes, the remote side is asked to stop
    ///  sending for that peer. The rest of the buffer is reserved for messages in flight.
    pub fn alert_size(&self) -> usize {
        self.peer_recv_buf_size - (self.message_history as usize + 1) * self.peer_max_send()
    }

    pub fn send_period(&self) -> Duration {
        Duration::from_secs(1) / self.send_frequency
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_default_sizes() {
        let config = TunnelConfig::default();
        config.validate().unwrap();

        assert_eq!(config.report_size(), 18);
        assert_eq!(config.report_count(), 128);
        assert_eq!(config.header_size(), 6 + 18 + 36);
        assert_eq!(config.message_data_max_size(), 9216 - 16 - 60);
        assert_eq!(config.alert_size(), (5 << 19) - 129 * 9140);
        assert_eq!(config.send_period(), Duration::from_millis(25));
        assert_eq!(config.reset_after_ticks, 2400);
    }

    #[rstest]
    #[case::empty_secret(TunnelConfig { shared_secret: vec![], ..Default::default() })]
    #[case::history_not_power_of_two(TunnelConfig { message_history: 100, ..Default::default() })]
    #[case::history_zero(TunnelConfig { message_history: 0, ..Default::default() })]
    #[case::no_peers(TunnelConfig { peers_max: 0, ..Default::default() })]
    #[case::datagram_too_small(TunnelConfig { datagram_max_size: 60, ..Default::default() })]
    #[case::datagram_too_big(TunnelConfig { datagram_max_size: 20_000, ..Default::default() })]
    #[case::recv_buf_too_small(TunnelConfig { peer_recv_buf_size: 1 << 20, ..Default::default() })]
    #[case::send_frequency(TunnelConfig { send_frequency: 1, ..Default::default() })]
    fn test_validate_rejects(#[case] config: TunnelConfig) {
        assert!(config.validate().is_err());
    }
}
