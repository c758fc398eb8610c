use std::cmp::min;
use bytes::{Buf, BytesMut};
use tracing::{debug, trace};

use crate::config::TunnelConfig;

/// Bytes waiting to go into the tunnel, plus the stream edges still to be signalled
#[derive(Debug, Default)]
pub struct SendBuffer {
    pub data: BytesMut,
    /// the next message carrying this peer's segment has to announce a new stream
    pub open: bool,
    /// the local source is exhausted: signal end-of-stream once `data` is sent
    pub close: bool,
}

/// Bytes that came out of the tunnel and wait to be written to the local stream
#[derive(Debug, Default)]
pub struct RecvBuffer {
    pub data: BytesMut,
    pub open: bool,
    pub close: bool,
}

/// One multiplexed byte stream.
///
/// `D` is whatever the host uses to represent the local end of the stream (a socket, a handle to
///  I/O tasks, ...). The engine never looks inside it, it only keeps it and drops it.
#[derive(Debug)]
pub struct Peer<D> {
    pub link: Option<D>,
    /// A free peer can be claimed for a new stream. A peer becomes free only after its stream was
    ///  closed in both directions, so a peer without a `link` is not necessarily free.
    pub free: bool,
    /// the remote side asked us not to send data for this peer
    pub dont_send: bool,
    /// the remote side opened a stream and the host is still connecting its local end
    pub connecting: bool,
    pub send: SendBuffer,
    pub recv: RecvBuffer,
}

impl<D> Peer<D> {
    fn new() -> Peer<D> {
        Peer {
            link: None,
            free: true,
            dont_send: true,
            connecting: false,
            send: Default::default(),
            recv: Default::default(),
        }
    }

    fn clear(&mut self) {
        self.link = None;
        self.free = true;
        self.dont_send = true;
        self.connecting = false;
        self.send = Default::default();
        self.recv = Default::default();
    }
}

/// The fixed set of peers multiplexed over a tunnel, addressed by index
pub struct PeerTable<D> {
    peers: Vec<Peer<D>>,
    peer_max_send: usize,
    peer_recv_buf_size: usize,
}

impl<D> PeerTable<D> {
    pub fn new(config: &TunnelConfig) -> PeerTable<D> {
        PeerTable {
            peers: (0..config.peers_max).map(|_| Peer::new()).collect(),
            peer_max_send: config.peer_max_send(),
            peer_recv_buf_size: config.peer_recv_buf_size,
        }
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn get(&self, idx: usize) -> &Peer<D> {
        &self.peers[idx]
    }

    pub fn get_mut(&mut self, idx: usize) -> &mut Peer<D> {
        &mut self.peers[idx]
    }

    pub fn iter(&self) -> impl Iterator<Item = &Peer<D>> {
        self.peers.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Peer<D>> {
        self.peers.iter_mut()
    }

    pub fn recv_capacity(&self) -> usize {
        self.peer_recv_buf_size
    }

    pub fn has_free_peer(&self) -> bool {
        self.peers.iter().any(|p| p.free)
    }

    /// Claims the first free peer for a newly accepted local stream. The next message will
    ///  announce the stream to the remote side.
    pub fn attach(&mut self, link: D) -> Option<usize> {
        let idx = self.peers.iter().position(|p| p.free)?;
        let peer = &mut self.peers[idx];

        peer.link = Some(link);
        peer.free = false;
        peer.dont_send = false;
        peer.send = SendBuffer {
            open: true,
            ..Default::default()
        };
        peer.recv = Default::default();

        debug!("attached local stream to peer {}", idx);
        Some(idx)
    }

    /// room left in the peer's send buffer
    pub fn send_room(&self, idx: usize) -> usize {
        self.peer_max_send.saturating_sub(self.peers[idx].send.data.len())
    }

    /// Appends as much of `data` to the peer's send buffer as fits, returning the number of bytes
    ///  taken
    pub fn push_send(&mut self, idx: usize, data: &[u8]) -> usize {
        let n = min(data.len(), self.send_room(idx));
        self.peers[idx].send.data.extend_from_slice(&data[..n]);
        n
    }

    /// The local stream ended (or failed): end-of-stream goes to the remote side after whatever is
    ///  still buffered
    pub fn local_closed(&mut self, idx: usize) {
        let peer = &mut self.peers[idx];
        debug!("local stream of peer {} closed", idx);
        peer.link = None;
        peer.send.close = true;
    }

    pub fn recv_pending(&self, idx: usize) -> &[u8] {
        &self.peers[idx].recv.data
    }

    pub fn consume_recv(&mut self, idx: usize, n: usize) {
        self.peers[idx].recv.data.advance(n);
    }

    /// Once the remote side closed the stream and everything was written locally, the local stream
    ///  is dropped and the peer is free for reuse.
    pub fn release_if_drained(&mut self, idx: usize) -> bool {
        let peer = &mut self.peers[idx];
        if !peer.recv.close || !peer.recv.data.is_empty() {
            return false;
        }

        debug!("peer {} drained after remote close", idx);
        peer.link = None;
        peer.free = true;
        peer.connecting = false;
        peer.recv.close = false;
        true
    }

    /// Peers for which the remote side announced a new stream since the last call. Each of them is
    ///  claimed and its previous local stream (if any) is dropped: the host is expected to connect
    ///  a new one and report back through [PeerTable::connected].
    pub fn take_open_requests(&mut self) -> Vec<usize> {
        let mut result = Vec::new();
        for (idx, peer) in self.peers.iter_mut().enumerate() {
            if peer.recv.open {
                peer.recv.open = false;
                peer.link = None;
                peer.free = false;
                peer.connecting = true;
                peer.send = Default::default();
                result.push(idx);
            }
        }
        result
    }

    /// Outcome of connecting a local stream for a remote open request. A failed connect is
    ///  reported to the remote side as the stream being closed.
    pub fn connected(&mut self, idx: usize, link: Option<D>) {
        let peer = &mut self.peers[idx];
        peer.connecting = false;
        match link {
            Some(link) => {
                debug!("peer {} connected", idx);
                peer.link = Some(link);
                peer.dont_send = false;
            }
            None => {
                debug!("peer {} failed to connect", idx);
                peer.link = None;
                peer.send.close = true;
            }
        }
    }

    /// A message carrying `closed` for this peer was acknowledged (its slot is being reused). If
    ///  the local stream is gone as well, the peer is done.
    ///
    /// The acknowledged close may belong to an earlier stream on the same peer. A peer that is
    ///  still connecting for a newer stream, or that has a close of its own yet to signal, stays
    ///  claimed.
    pub(crate) fn close_acknowledged(&mut self, idx: usize) {
        let peer = &mut self.peers[idx];
        if peer.link.is_none() && !peer.free && !peer.connecting && !peer.send.close {
            trace!("peer {} is free after its close was acknowledged", idx);
            peer.free = true;
        }
    }

    /// Drops every local stream and clears all buffers and flags
    pub fn clear(&mut self) {
        self.peers.iter_mut().for_each(Peer::clear);
    }
}
