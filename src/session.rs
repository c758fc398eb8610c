use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

use crate::codec::{unix_time, DatagramCodec, DatagramError};
use crate::config::TunnelConfig;
use crate::history::{InboundRejection, MessageHistory};
use crate::message::{ControlKind, Datagram, LogicalMessage};
use crate::multiplexer;
use crate::peer::PeerTable;
use crate::reset::{HandshakeProgress, ResetHandshake};
use crate::scheduler::Pacer;
use crate::seq::Seq16;
use crate::util::random::{Random, RngRandom};

/// Reasons for dropping a received datagram. None of them is reported to the remote side.
#[derive(Debug, Clone, Eq, PartialEq, thiserror::Error)]
pub enum ReceiveError {
    #[error("bad datagram: {0}")]
    Bad(#[from] DatagramError),
    #[error(transparent)]
    Rejected(#[from] InboundRejection),
}

/// What a successfully received datagram did
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Received {
    Control(ControlKind),
    /// A data message was stored. This number of messages (possibly zero if there is a gap before
    ///  it) were handed to the peers in sequence order as a result.
    Data { delivered: usize },
    /// data messages are dropped while a reset handshake is in progress
    IgnoredDuringReset,
}

/// The protocol engine for one end of a tunnel.
///
/// A session does no I/O and never blocks. The host feeds it received datagrams, asks it for
///  datagrams to send when [Session::timeout] says a send opportunity is due, and moves data
///  between local streams and the peers' buffers.
///
/// A new session starts with a reset handshake, so the remote side is resynchronized before any
///  data flows.
pub struct Session<D, R: Random = RngRandom> {
    config: Arc<TunnelConfig>,
    codec: DatagramCodec<R>,
    history: MessageHistory,
    peers: PeerTable<D>,
    pacer: Pacer,
    handshake: Option<ResetHandshake>,

    /// next inbound message to deliver
    in_seq: Seq16,
    /// sequence number of the next fresh outbound message
    out_seq: Seq16,
    /// counts every data datagram put on the wire, fresh or retransmitted
    attempt_seq: Seq16,
    /// consecutive send opportunities without progress
    idle_ticks: u32,
}

impl<D, R: Random> Session<D, R> {
    pub fn new(config: Arc<TunnelConfig>) -> anyhow::Result<Session<D, R>> {
        config.validate()?;

        Ok(Session {
            codec: DatagramCodec::new(config.clone()),
            history: MessageHistory::new(config.message_history),
            peers: PeerTable::new(&config),
            pacer: Pacer::new(config.send_period()),
            handshake: Some(ResetHandshake::initiate()),
            in_seq: Seq16::ZERO,
            out_seq: Seq16::ZERO,
            attempt_seq: Seq16::ZERO,
            idle_ticks: 0,
            config,
        })
    }

    pub fn config(&self) -> &TunnelConfig {
        &self.config
    }

    pub fn peers(&self) -> &PeerTable<D> {
        &self.peers
    }

    pub fn peers_mut(&mut self) -> &mut PeerTable<D> {
        &mut self.peers
    }

    /// `true` while a reset handshake is in progress
    pub fn is_resetting(&self) -> bool {
        self.handshake.is_some()
    }

    /// Time until the next send opportunity, `None` if it is due now
    pub fn timeout(&self, now: Instant) -> Option<Duration> {
        self.pacer.timeout(now)
    }

    /// Uses a send opportunity, returning the datagram to send (if any).
    ///
    /// Each call does at most one of the following: send a handshake datagram, retransmit an
    ///  unacknowledged message, or send a fresh message. After too many send opportunities without
    ///  progress, the session gives up on the remote side and starts a reset handshake.
    pub fn poll_transmit(&mut self, now: Instant) -> Option<Vec<u8>> {
        if self.handshake.is_none() && self.idle_ticks >= self.config.reset_after_ticks {
            warn!("no progress for {} send opportunities - resetting the session", self.idle_ticks);
            self.idle_ticks = 0;
            self.handshake = Some(ResetHandshake::initiate());
        }

        if !self.pacer.try_consume(now) {
            return None;
        }
        let timestamp = unix_time();

        if let Some(handshake) = &self.handshake {
            let kind = handshake.control_kind();
            trace!("sending {:?}", kind);
            let datagram = self.codec.encode_control(kind, timestamp);
            if handshake.on_sent() == HandshakeProgress::Complete {
                self.complete_handshake();
            }
            return Some(datagram);
        }

        let ack_report = self.history.ack_report(self.in_seq, self.config.report_count());
        let attempt_seq = self.attempt_seq;
        self.attempt_seq = attempt_seq.next();

        if let Some(msg) = self.history.select_retransmission(attempt_seq, self.out_seq) {
            self.idle_ticks += 1;
            msg.ack_report = ack_report;
            return Some(self.codec.encode_data(msg, timestamp));
        }

        let mut msg = multiplexer::compose(&mut self.peers, &self.config, self.out_seq);
        msg.ack_report = ack_report;
        let datagram = self.codec.encode_data(&msg, timestamp);

        if let Some(displaced) = self.history.store_outbound(msg, attempt_seq) {
            self.on_displaced(&displaced.message);
        }
        self.out_seq = self.out_seq.next();
        self.idle_ticks = 0;

        Some(datagram)
    }

    pub fn on_datagram(&mut self, datagram: &[u8]) -> Result<Received, ReceiveError> {
        self.on_datagram_at(datagram, unix_time())
    }

    fn on_datagram_at(&mut self, datagram: &[u8], now_unix: u32) -> Result<Received, ReceiveError> {
        match self.codec.decode(datagram, now_unix)? {
            Datagram::Control(kind) => {
                self.on_control(kind);
                Ok(Received::Control(kind))
            }
            Datagram::Data(msg) => {
                if self.handshake.is_some() {
                    trace!("ignoring message #{} during reset handshake", msg.sequence);
                    return Ok(Received::IgnoredDuringReset);
                }
                self.on_message(msg)
            }
        }
    }

    fn on_control(&mut self, kind: ControlKind) {
        match self.handshake.as_mut().map(|h| h.on_control(kind)) {
            Some(HandshakeProgress::Complete) => self.complete_handshake(),
            Some(HandshakeProgress::Pending) => {}
            None => match kind {
                ControlKind::Reset => {
                    warn!("remote side requested a session reset");
                    self.handshake = Some(ResetHandshake::answer());
                }
                ControlKind::ResetOk => {
                    debug!("ignoring RESET_OK outside of a reset handshake");
                }
            },
        }
    }

    fn on_message(&mut self, msg: LogicalMessage) -> Result<Received, ReceiveError> {
        let ack_report = msg.ack_report.clone();
        self.history.record_inbound(msg, self.in_seq)?;

        if self.history.apply_ack(&ack_report) > 0 {
            self.idle_ticks = 0;
        }

        let mut delivered = 0;
        while self.deliver_next() {
            delivered += 1;
        }
        Ok(Received::Data { delivered })
    }

    /// Hands the next inbound message to the peers if it was received, returning `false` if it was
    ///  not.
    pub fn deliver_next(&mut self) -> bool {
        let Some(msg) = self.history.inbound(self.in_seq) else {
            return false;
        };

        trace!("delivering message #{}", msg.sequence);
        multiplexer::deliver(&mut self.peers, msg);
        self.in_seq = self.in_seq.next();
        true
    }

    /// A slot of the outbound window is reused, so its previous occupant was acknowledged. Peers
    ///  whose end-of-stream it carried are done.
    fn on_displaced(&mut self, msg: &LogicalMessage) {
        for (idx, segment) in msg.segments.iter().enumerate() {
            if segment.closed {
                self.peers.close_acknowledged(idx);
            }
        }
    }

    fn complete_handshake(&mut self) {
        self.handshake = None;
        self.reset();
        info!("reset handshake complete");
    }

    /// Discards all session state: counters, both directions of the window, and all peers
    ///  including their local streams.
    pub fn reset(&mut self) {
        debug!("resetting session state");
        self.in_seq = Seq16::ZERO;
        self.out_seq = Seq16::ZERO;
        self.attempt_seq = Seq16::ZERO;
        self.idle_ticks = 0;
        self.history.clear();
        self.peers.clear();
    }
}
