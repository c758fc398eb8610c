//! Runs a [Session] on top of tokio: a UDP socket for the tunnel, and TCP streams for the peers.
//!
//! A single task owns the session, so all engine calls are serialized. Each local stream gets a
//!  reader task and a writer task that talk to the session task through a channel. A reader holds a
//!  single-permit semaphore while its data is waiting to get into the peer's send buffer, so at most
//!  one chunk per stream is read ahead.

use std::cmp::min;
use std::future::pending;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::select;
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, trace, warn};

use crate::config::TunnelConfig;
use crate::session::{Received, Session};

const EVENT_QUEUE_LEN: usize = 256;
const WRITE_CHUNK_LEN: usize = 64 * 1024;
const ACCEPT_ERROR_PAUSE: Duration = Duration::from_millis(100);

/// Which side of the tunnel this is. Local streams are accepted on the client side, and connected
///  on the server side whenever the client announces a new stream.
#[derive(Debug, Clone)]
pub enum Role {
    Client { listen: SocketAddr },
    Server { connect: SocketAddr },
}

enum LocalEnd {
    Acceptor(TcpListener),
    Connector(SocketAddr),
}

/// Data read from a local stream that did not fit into the peer's send buffer yet
struct Staged {
    data: Bytes,
    _permit: OwnedSemaphorePermit,
}

/// The session's handle to a local stream. Dropping it stops the stream's I/O tasks, which closes
///  the stream.
pub struct PeerLink {
    id: u64,
    writer: mpsc::Sender<Bytes>,
    write_in_flight: bool,
    staged: Option<Staged>,
    tasks: [JoinHandle<()>; 2],
}

impl Drop for PeerLink {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

enum LinkEvent {
    Read { link: u64, data: Bytes, permit: OwnedSemaphorePermit },
    Written { link: u64 },
    /// the local stream reached EOF, or reading or writing failed
    Closed { link: u64 },
    Connected { peer: usize, link: u64, result: io::Result<TcpStream> },
}

pub struct Tunnel {
    config: Arc<TunnelConfig>,
    socket: UdpSocket,
    remote: SocketAddr,
    local: LocalEnd,
}

impl Tunnel {
    pub async fn bind(config: Arc<TunnelConfig>, role: Role, udp_bind: SocketAddr, udp_remote: SocketAddr) -> anyhow::Result<Tunnel> {
        config.validate()?;

        let socket = UdpSocket::bind(udp_bind).await?;
        info!("bound UDP socket to {:?}, remote side is {:?}", socket.local_addr()?, udp_remote);

        let local = match role {
            Role::Client { listen } => {
                let listener = TcpListener::bind(listen).await?;
                info!("accepting local connections on {:?}", listener.local_addr()?);
                LocalEnd::Acceptor(listener)
            }
            Role::Server { connect } => {
                info!("connecting local streams to {:?}", connect);
                LocalEnd::Connector(connect)
            }
        };

        Ok(Tunnel {
            config,
            socket,
            remote: udp_remote,
            local,
        })
    }

    pub fn udp_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    pub fn tcp_listen_addr(&self) -> Option<SocketAddr> {
        match &self.local {
            LocalEnd::Acceptor(listener) => listener.local_addr().ok(),
            LocalEnd::Connector(_) => None,
        }
    }

    /// Runs the tunnel. This returns only if the session can not be set up.
    pub async fn run(self) -> anyhow::Result<()> {
        let session: Session<PeerLink> = Session::new(self.config.clone())?;
        let (events, mut event_receiver) = mpsc::channel(EVENT_QUEUE_LEN);

        let mut reactor = Reactor {
            connecting: vec![None; session.peers().len()],
            read_chunk_len: self.config.peer_max_send(),
            session,
            socket: self.socket,
            remote: self.remote,
            local: self.local,
            events,
            next_link_id: 0,
            accept_paused_until: None,
        };

        let mut buf = vec![0u8; self.config.datagram_max_size + 1];
        info!("starting tunnel");
        loop {
            reactor.service_peers();

            let now = Instant::now();
            let timeout = reactor.session.timeout(now).unwrap_or(Duration::ZERO);
            let accepting = reactor.is_accepting(now);

            select! {
                _ = sleep(timeout) => {
                    reactor.transmit().await;
                }
                received = reactor.socket.recv_from(&mut buf) => {
                    match received {
                        Ok((len, from)) => reactor.on_datagram(&buf[..len], from),
                        Err(e) => warn!("error receiving from UDP socket: {}", e),
                    }
                }
                Some(event) = event_receiver.recv() => {
                    reactor.on_link_event(event);
                }
                accepted = accept(&reactor.local), if accepting => {
                    reactor.on_accepted(accepted, Instant::now());
                }
            }
        }
    }
}

async fn accept(local: &LocalEnd) -> io::Result<TcpStream> {
    match local {
        LocalEnd::Acceptor(listener) => listener.accept().await.map(|(stream, _)| stream),
        LocalEnd::Connector(_) => pending().await,
    }
}

struct Reactor {
    session: Session<PeerLink>,
    socket: UdpSocket,
    remote: SocketAddr,
    local: LocalEnd,
    events: mpsc::Sender<LinkEvent>,
    next_link_id: u64,
    /// per peer: the link id of an outstanding connect
    connecting: Vec<Option<u64>>,
    read_chunk_len: usize,
    /// accept errors tend to persist (e.g. running out of file descriptors)
    accept_paused_until: Option<Instant>,
}

impl Reactor {
    async fn transmit(&mut self) {
        if let Some(datagram) = self.session.poll_transmit(Instant::now()) {
            if let Err(e) = self.socket.send_to(&datagram, self.remote).await {
                warn!("error sending datagram to {:?}: {}", self.remote, e);
            }
        }
    }

    fn on_datagram(&mut self, datagram: &[u8], from: SocketAddr) {
        if from != self.remote {
            debug!("received datagram from unexpected address {:?} - dropping", from);
            return;
        }

        match self.session.on_datagram(datagram) {
            Ok(Received::Data { delivered }) => trace!("received data message, {} delivered", delivered),
            Ok(other) => trace!("received {:?}", other),
            Err(e) => debug!("dropping datagram: {}", e),
        }
        self.on_open_requests();
    }

    fn on_open_requests(&mut self) {
        for idx in self.session.peers_mut().take_open_requests() {
            let target = match &self.local {
                LocalEnd::Connector(target) => *target,
                LocalEnd::Acceptor(_) => {
                    debug!("remote side opened a stream on peer {}, but this side does not connect - rejecting", idx);
                    self.session.peers_mut().connected(idx, None);
                    continue;
                }
            };

            let link = self.next_link_id();
            self.connecting[idx] = Some(link);

            let events = self.events.clone();
            tokio::spawn(async move {
                let result = TcpStream::connect(target).await;
                let _ = events.send(LinkEvent::Connected { peer: idx, link, result }).await;
            });
        }
    }

    fn is_accepting(&self, now: Instant) -> bool {
        matches!(self.local, LocalEnd::Acceptor(_))
            && self.accept_paused_until.map_or(true, |until| now >= until)
            && !self.session.is_resetting()
            && self.session.peers().has_free_peer()
    }

    fn on_accepted(&mut self, accepted: io::Result<TcpStream>, now: Instant) {
        match accepted {
            Ok(stream) => {
                let link = self.spawn_link(stream);
                match self.session.peers_mut().attach(link) {
                    Some(idx) => info!("accepted local connection as peer {}", idx),
                    None => warn!("no free peer for accepted connection - closing it"),
                }
            }
            Err(e) => {
                warn!("error accepting local connection: {} - pausing for {:?}", e, ACCEPT_ERROR_PAUSE);
                self.accept_paused_until = Some(now + ACCEPT_ERROR_PAUSE);
            }
        }
    }

    fn on_link_event(&mut self, event: LinkEvent) {
        match event {
            LinkEvent::Read { link, data, permit } => {
                let Some(idx) = self.peer_for_link(link) else { return };
                if let Some(peer_link) = self.session.peers_mut().get_mut(idx).link.as_mut() {
                    peer_link.staged = Some(Staged { data, _permit: permit });
                }
                self.flush_staged(idx);
            }
            LinkEvent::Written { link } => {
                let Some(idx) = self.peer_for_link(link) else { return };
                if let Some(peer_link) = self.session.peers_mut().get_mut(idx).link.as_mut() {
                    peer_link.write_in_flight = false;
                }
            }
            LinkEvent::Closed { link } => {
                let Some(idx) = self.peer_for_link(link) else { return };
                info!("local stream of peer {} closed", idx);
                self.session.peers_mut().local_closed(idx);
            }
            LinkEvent::Connected { peer, link, result } => {
                if self.connecting[peer] != Some(link) {
                    return;
                }
                self.connecting[peer] = None;

                if !self.session.peers().get(peer).connecting {
                    debug!("peer {} changed while connecting - discarding connection", peer);
                    return;
                }

                match result {
                    Ok(stream) => {
                        let link = self.spawn_link(stream);
                        self.session.peers_mut().connected(peer, Some(link));
                    }
                    Err(e) => {
                        warn!("error connecting local stream for peer {}: {}", peer, e);
                        self.session.peers_mut().connected(peer, None);
                    }
                }
            }
        }
    }

    /// moves staged data into send buffers, and received data to the local streams' writers
    fn service_peers(&mut self) {
        for idx in 0..self.session.peers().len() {
            self.flush_staged(idx);
            self.drain_recv(idx);
        }
    }

    fn flush_staged(&mut self, idx: usize) {
        let peers = self.session.peers_mut();
        let Some(mut staged) = peers.get_mut(idx).link.as_mut().and_then(|l| l.staged.take()) else {
            return;
        };

        let n = peers.push_send(idx, &staged.data);
        staged.data.advance(n);
        if staged.data.has_remaining() {
            if let Some(link) = peers.get_mut(idx).link.as_mut() {
                link.staged = Some(staged);
            }
        }
    }

    fn drain_recv(&mut self, idx: usize) {
        let peers = self.session.peers_mut();
        if peers.get(idx).link.as_ref().is_some_and(|l| l.write_in_flight) {
            return;
        }

        let pending_len = peers.recv_pending(idx).len();
        if pending_len == 0 {
            if peers.release_if_drained(idx) {
                info!("peer {} closed by remote side", idx);
            }
            return;
        }

        let n = min(pending_len, WRITE_CHUNK_LEN);
        let chunk = Bytes::copy_from_slice(&peers.recv_pending(idx)[..n]);
        let Some(link) = peers.get_mut(idx).link.as_mut() else { return };
        if link.writer.try_send(chunk).is_ok() {
            link.write_in_flight = true;
            peers.consume_recv(idx, n);
        }
    }

    fn peer_for_link(&self, link: u64) -> Option<usize> {
        self.session.peers().iter()
            .position(|p| p.link.as_ref().is_some_and(|l| l.id == link))
    }

    fn next_link_id(&mut self) -> u64 {
        let id = self.next_link_id;
        self.next_link_id += 1;
        id
    }

    fn spawn_link(&mut self, stream: TcpStream) -> PeerLink {
        let id = self.next_link_id();
        let (read_half, write_half) = stream.into_split();
        let (writer, chunks) = mpsc::channel(1);

        let reader_task = tokio::spawn(read_loop(id, read_half, self.read_chunk_len, self.events.clone()));
        let writer_task = tokio::spawn(write_loop(id, write_half, chunks, self.events.clone()));

        PeerLink {
            id,
            writer,
            write_in_flight: false,
            staged: None,
            tasks: [reader_task, writer_task],
        }
    }
}

async fn read_loop(link: u64, mut stream: OwnedReadHalf, chunk_len: usize, events: mpsc::Sender<LinkEvent>) {
    let semaphore = Arc::new(Semaphore::new(1));
    loop {
        let Ok(permit) = semaphore.clone().acquire_owned().await else { return };

        let mut buf = BytesMut::with_capacity(chunk_len);
        let event = match stream.read_buf(&mut buf).await {
            Ok(0) => LinkEvent::Closed { link },
            Ok(_) => LinkEvent::Read { link, data: buf.freeze(), permit },
            Err(e) => {
                debug!("error reading local stream: {}", e);
                LinkEvent::Closed { link }
            }
        };

        let is_closed = matches!(event, LinkEvent::Closed { .. });
        if events.send(event).await.is_err() || is_closed {
            return;
        }
    }
}

async fn write_loop(link: u64, mut stream: OwnedWriteHalf, mut chunks: mpsc::Receiver<Bytes>, events: mpsc::Sender<LinkEvent>) {
    while let Some(chunk) = chunks.recv().await {
        let event = match stream.write_all(&chunk).await {
            Ok(()) => LinkEvent::Written { link },
            Err(e) => {
                debug!("error writing local stream: {}", e);
                LinkEvent::Closed { link }
            }
        };

        let is_closed = matches!(event, LinkEvent::Closed { .. });
        if events.send(event).await.is_err() || is_closed {
            return;
        }
    }
}
