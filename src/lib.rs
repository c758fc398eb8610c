//! A tunnel for several TCP-like byte streams between two fixed endpoints, carried by a single
//!  UDP conversation. The point is crossing a NAT or firewall boundary through one punched hole:
//!  one side (the 'client') accepts local connections, the other side (the 'server') connects
//!  each of them to a fixed target.
//!
//! ## Design goals
//!
//! * A fixed number of *peers* (multiplexed streams) share a single sequence of *messages*. Every
//!   message has a slice for every peer, possibly empty.
//!   * in-order, reliable delivery of messages, which gives in-order, reliable delivery of each
//!     peer's byte stream
//!   * per-peer backpressure: a message carries a 'blocked' flag per peer when the sender's
//!     receive buffer for that peer fills up
//!   * fairness: when demand exceeds a message's capacity, no single busy peer can crowd out the
//!     others
//! * Messages are sent at a fixed frequency, whether there is data or not. There is no congestion
//!   control beyond that.
//!   * every send opportunity either retransmits an unacknowledged message or sends a fresh one
//! * A sliding window of 16 bit sequence numbers, with a fixed number of messages in flight
//!   * every message carries a cumulative and a selective acknowledgement of the other direction
//! * Both sides resynchronize through a reset handshake at startup and after a long time without
//!   progress. A reset drops all streams.
//! * Datagrams are authenticated and obfuscated with a pre-shared secret.
//!   * NB: This keeps casual observers from reading the payload and prevents injection of
//!     datagrams, but it is *not* encryption: there is no confidentiality against a determined
//!     attacker, and no forward secrecy.
//!   * Datagrams with timestamps too far from local time are dropped to limit replays
//!
//! ## Datagram format
//!
//! All numbers are big endian.
//!
//! ```ascii
//!  0: nonce (8 bytes, random)
//!  8: auth tag (8 bytes): first half of MD5(nonce | secret | everything from offset 16)
//! 16: timestamp (u32): seconds since epoch
//! 20: either a control byte (2: RESET, 3: RESET_OK), or the rest of a data message:
//! 20: sequence number (u16)
//! 22: ack base (u16): all messages before this were received
//! 24: ack bitmap (one bit per window slot, MSB first): bit i set means 'base + 1 + i' was received
//!  *: one u16 per peer: `size * 3 + (2 if closed, 1 if blocked, 0 otherwise)`, high bit set
//!      if the message opens a new stream for the peer
//!  *: the peers' data, in peer order
//!  *: 0 to 15 bytes of random padding
//! ```
//!
//! Everything from offset 16 is XOR'ed with a keystream: the first 16 byte block is
//!  `MD5(nonce | secret)`, every following block is `MD5(previous block | secret)`.
//!
//! Receivers drop invalid datagrams silently: an attacker can not tell 'rejected' from 'lost'.
//!
//! ## Engine vs. host
//!
//! The protocol engine ([session::Session] and everything below it) does no I/O and never blocks.
//!  [host::Tunnel] drives it from a single tokio task, with UDP and TCP sockets.

pub mod codec;
pub mod config;
pub mod history;
pub mod host;
pub mod message;
pub mod multiplexer;
pub mod peer;
pub mod reset;
pub mod scheduler;
pub mod seq;
pub mod session;
pub mod util;

#[cfg(test)] pub mod test_util;
