pub mod obfuscation;

use std::cmp::min;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use bytes::{Buf, BufMut, BytesMut};
use tracing::trace;

use crate::codec::obfuscation::{Obfuscation, NONCE_LEN, TAG_LEN};
use crate::config::{TunnelConfig, DATAGRAM_PREFIX_LEN};
use crate::message::{AckReport, ControlKind, Datagram, LogicalMessage, Segment};
use crate::util::safe_converter::PrecheckedCast;
use crate::seq::Seq16;
use crate::util::random::{Random, RngRandom};

const MAX_PADDING: usize = 15;
const FLAG_OPENED: u16 = 0x8000;

/// Reasons for rejecting a datagram. All of them lead to the datagram being dropped silently.
#[derive(Debug, Clone, Eq, PartialEq, thiserror::Error)]
pub enum DatagramError {
    #[error("datagram size {0} is out of range")]
    Size(usize),
    #[error("authentication tag mismatch")]
    AuthTag,
    #[error("timestamp is {skew} seconds off local time")]
    Stale { skew: u32 },
    #[error("unknown control byte {0}")]
    UnknownControl(u8),
    #[error("datagram is truncated")]
    Truncated,
    #[error("segment sizes add up to {declared} bytes, but only {available} are present")]
    Inconsistent { declared: usize, available: usize },
}

/// seconds since epoch, truncated to 32 bits as they go on the wire
pub fn unix_time() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}

/// Serialization of datagrams, including authentication and obfuscation.
///
/// ```ascii
///  0: nonce (8 random bytes)
///  8: auth tag (8 bytes): MD5(nonce | secret | plaintext starting at offset 16)
/// 16: timestamp (u32 BE, seconds since epoch)
/// 20: either a single control byte (2: RESET, 3: RESET_OK), or a data message:
///     20: sequence number (u16 BE)
///     22: ack base (u16 BE)
///     24: ack bitmap (report_size - 2 bytes)
///      *: one u16 BE per peer: size * 3 + (2 if closed, 1 if blocked, 0 otherwise),
///          high bit set if opened
///      *: the peers' payload, concatenated in peer order
///      *: 0 to 15 bytes of random padding
/// ```
///
/// Everything from offset 16 onward is XOR'ed with a keystream derived from nonce and secret.
pub struct DatagramCodec<R: Random = RngRandom> {
    config: Arc<TunnelConfig>,
    obfuscation: Obfuscation,
    _random: PhantomData<R>,
}

impl<R: Random> DatagramCodec<R> {
    pub fn new(config: Arc<TunnelConfig>) -> DatagramCodec<R> {
        let obfuscation = Obfuscation::new(&config.shared_secret);
        DatagramCodec {
            config,
            obfuscation,
            _random: PhantomData,
        }
    }

    pub fn encode_control(&self, kind: ControlKind, timestamp: u32) -> Vec<u8> {
        let mut buf = Self::init_buffer(DATAGRAM_PREFIX_LEN + 5);
        buf.put_u32(timestamp);
        buf.put_u8(kind.into());
        self.seal(buf)
    }

    pub fn encode_data(&self, msg: &LogicalMessage, timestamp: u32) -> Vec<u8> {
        debug_assert_eq!(msg.segments.len(), self.config.peers_max);
        debug_assert_eq!(msg.ack_report.bitmap.len(), self.config.report_size() - 2);
        debug_assert_eq!(msg.segments.iter().map(|s| s.size).sum::<usize>(), msg.payload.len());

        let mut buf = Self::init_buffer(self.config.datagram_max_size);
        buf.put_u32(timestamp);
        buf.put_u16(msg.sequence.to_raw());
        buf.put_u16(msg.ack_report.base.to_raw());
        buf.put_slice(&msg.ack_report.bitmap);

        for segment in &msg.segments {
            let flag = if segment.closed { 2 } else if segment.blocked { 1 } else { 0 };
            let mut field: u16 = (segment.size * 3 + flag).prechecked_cast();
            if segment.opened {
                field |= FLAG_OPENED;
            }
            buf.put_u16(field);
        }
        buf.put_slice(&msg.payload);

        if buf.len() < self.config.datagram_max_size {
            let padding_len = R::gen_padding_len(min(MAX_PADDING, self.config.datagram_max_size - buf.len()));
            let offs = buf.len();
            buf.put_bytes(0, padding_len);
            R::fill_bytes(&mut buf[offs..]);
        }

        trace!("encoding message #{} ({} payload bytes) into {} bytes", msg.sequence, msg.payload.len(), buf.len());
        self.seal(buf)
    }

    pub fn decode(&self, datagram: &[u8], now: u32) -> Result<Datagram, DatagramError> {
        if datagram.len() < DATAGRAM_PREFIX_LEN || datagram.len() > self.config.datagram_max_size {
            return Err(DatagramError::Size(datagram.len()));
        }

        let mut buf = datagram.to_vec();
        let (head, body) = buf.split_at_mut(DATAGRAM_PREFIX_LEN);
        let nonce = &head[..NONCE_LEN];

        self.obfuscation.apply_keystream(nonce, body);
        if self.obfuscation.auth_tag(nonce, body) != head[NONCE_LEN..NONCE_LEN + TAG_LEN] {
            return Err(DatagramError::AuthTag);
        }

        let mut body: &[u8] = body;
        if body.remaining() < 4 {
            return Err(DatagramError::Truncated);
        }
        let timestamp = body.get_u32();
        let skew = (timestamp.wrapping_sub(now) as i32).unsigned_abs();
        if skew as u64 > self.config.time_diff_max.as_secs() {
            return Err(DatagramError::Stale { skew });
        }

        if body.remaining() == 1 {
            let raw = body.get_u8();
            return ControlKind::try_from(raw)
                .map(Datagram::Control)
                .map_err(|_| DatagramError::UnknownControl(raw));
        }

        let bitmap_len = self.config.report_size() - 2;
        if body.remaining() < 4 + bitmap_len + 2 * self.config.peers_max {
            return Err(DatagramError::Truncated);
        }

        let sequence = Seq16::from_raw(body.get_u16());
        let base = Seq16::from_raw(body.get_u16());
        let bitmap = body[..bitmap_len].to_vec();
        body.advance(bitmap_len);

        let mut segments = Vec::with_capacity(self.config.peers_max);
        for _ in 0..self.config.peers_max {
            let field = body.get_u16();
            let value = (field & !FLAG_OPENED) as usize;
            let flag = value % 3;
            segments.push(Segment {
                opened: field & FLAG_OPENED != 0,
                closed: flag > 1,
                blocked: flag > 0,
                size: value / 3,
            });
        }

        let declared = segments.iter().map(|s| s.size).sum::<usize>();
        if declared > body.remaining() {
            return Err(DatagramError::Inconsistent { declared, available: body.remaining() });
        }

        Ok(Datagram::Data(LogicalMessage {
            sequence,
            ack_report: AckReport { base, bitmap },
            segments,
            payload: body[..declared].to_vec(),
        }))
    }

    fn init_buffer(capacity: usize) -> BytesMut {
        let mut buf = BytesMut::with_capacity(capacity);
        buf.put_bytes(0, DATAGRAM_PREFIX_LEN);
        buf
    }

    /// fills in nonce and auth tag, and obfuscates everything after them
    fn seal(&self, mut buf: BytesMut) -> Vec<u8> {
        R::fill_bytes(&mut buf[..NONCE_LEN]);

        let (head, body) = buf.split_at_mut(DATAGRAM_PREFIX_LEN);
        let (nonce, tag) = head.split_at_mut(NONCE_LEN);
        tag.copy_from_slice(&self.obfuscation.auth_tag(nonce, body));
        self.obfuscation.apply_keystream(nonce, body);

        buf.to_vec()
    }
}
