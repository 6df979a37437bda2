//! In-process transport.
//!
//! A [`MemoryNetwork`] is a hub that connects any number of
//! [`MemoryTransport`] endpoints living in the same process. Streams
//! are pairs of in-memory pipes, so nodes can be simulated without
//! sockets, encryption or a muxer.

use {
  super::{BoxedStream, Endpoint, Error, Event, Transport},
  async_trait::async_trait,
  bytes::{Buf, BytesMut},
  futures::{AsyncRead, AsyncWrite},
  libp2p::{Multiaddr, PeerId},
  parking_lot::{Mutex, RwLock},
  std::{
    collections::{HashMap, HashSet},
    io,
    pin::Pin,
    sync::{
      atomic::{AtomicBool, Ordering},
      Arc,
      Weak,
    },
    task::{Context, Poll, Waker},
  },
  tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender},
  tracing::debug,
};

/// One direction of a pipe.
#[derive(Debug, Default)]
struct Half {
  buffer: BytesMut,
  /// the writer closed its side, readers see EOF once drained.
  closed: bool,
  /// the reader is gone, writes fail.
  orphaned: bool,
  /// the connection was torn down, both sides fail.
  reset: bool,
  waker: Option<Waker>,
}

impl Half {
  fn wake(&mut self) {
    if let Some(waker) = self.waker.take() {
      waker.wake();
    }
  }
}

type HalfRef = Arc<Mutex<Half>>;

/// One end of an in-memory duplex pipe.
#[derive(Debug)]
pub struct MemoryStream {
  read: HalfRef,
  write: HalfRef,
}

/// Creates a connected pair of stream ends.
pub fn pipe() -> (MemoryStream, MemoryStream) {
  let (left, right) = (HalfRef::default(), HalfRef::default());
  (
    MemoryStream {
      read: Arc::clone(&left),
      write: Arc::clone(&right),
    },
    MemoryStream {
      read: right,
      write: left,
    },
  )
}

impl AsyncRead for MemoryStream {
  fn poll_read(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &mut [u8],
  ) -> Poll<io::Result<usize>> {
    let mut half = self.read.lock();
    if half.reset {
      return Poll::Ready(Err(io::ErrorKind::ConnectionReset.into()));
    }

    if !half.buffer.is_empty() {
      let len = half.buffer.len().min(buf.len());
      buf[..len].copy_from_slice(&half.buffer[..len]);
      half.buffer.advance(len);
      return Poll::Ready(Ok(len));
    }

    if half.closed {
      return Poll::Ready(Ok(0));
    }

    half.waker = Some(cx.waker().clone());
    Poll::Pending
  }
}

impl AsyncWrite for MemoryStream {
  fn poll_write(
    self: Pin<&mut Self>,
    _: &mut Context<'_>,
    buf: &[u8],
  ) -> Poll<io::Result<usize>> {
    let mut half = self.write.lock();
    if half.reset {
      return Poll::Ready(Err(io::ErrorKind::ConnectionReset.into()));
    }

    if half.closed || half.orphaned {
      return Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()));
    }

    half.buffer.extend_from_slice(buf);
    half.wake();
    Poll::Ready(Ok(buf.len()))
  }

  fn poll_flush(
    self: Pin<&mut Self>,
    _: &mut Context<'_>,
  ) -> Poll<io::Result<()>> {
    Poll::Ready(Ok(()))
  }

  fn poll_close(
    self: Pin<&mut Self>,
    _: &mut Context<'_>,
  ) -> Poll<io::Result<()>> {
    let mut half = self.write.lock();
    half.closed = true;
    half.wake();
    Poll::Ready(Ok(()))
  }
}

impl Drop for MemoryStream {
  fn drop(&mut self) {
    let mut write = self.write.lock();
    write.closed = true;
    write.wake();
    drop(write);

    let mut read = self.read.lock();
    read.orphaned = true;
    read.buffer.clear();
  }
}

/// Both halves of a pipe, kept by the connection so they can be reset
/// when the connection goes away.
type PipeRef = (Weak<Mutex<Half>>, Weak<Mutex<Half>>);

fn reset(pipes: Vec<PipeRef>) {
  for half in pipes.into_iter().flat_map(|(a, b)| [a, b]) {
    if let Some(half) = half.upgrade() {
      let mut half = half.lock();
      half.reset = true;
      half.wake();
    }
  }
}

#[derive(Debug)]
struct Node {
  peer: PeerId,
  events: UnboundedSender<Event>,
  protocols: RwLock<HashSet<String>>,
  connections: Mutex<HashMap<PeerId, Vec<PipeRef>>>,
  banned: RwLock<HashSet<PeerId>>,
  closed: AtomicBool,
}

impl Node {
  fn emit(&self, event: Event) {
    // the receiver is gone only when the node was shut down
    let _ = self.events.send(event);
  }

  fn connect(&self, peer: PeerId, endpoint: Endpoint) -> bool {
    let mut connections = self.connections.lock();
    if connections.contains_key(&peer) {
      return false;
    }
    connections.insert(peer, vec![]);
    drop(connections);
    self.emit(Event::Connected { peer, endpoint });
    true
  }

  fn disconnect(&self, peer: &PeerId) {
    let pipes = self.connections.lock().remove(peer);
    if let Some(pipes) = pipes {
      reset(pipes);
      self.emit(Event::Disconnected { peer: *peer });
    }
  }

  fn attach(&self, peer: &PeerId, pipe: &PipeRef) -> bool {
    let mut connections = self.connections.lock();
    match connections.get_mut(peer) {
      Some(pipes) => {
        pipes.retain(|(a, b)| a.strong_count() + b.strong_count() != 0);
        pipes.push(pipe.clone());
        true
      }
      None => false,
    }
  }
}

/// Hub connecting in-process transports.
#[derive(Debug, Clone, Default)]
pub struct MemoryNetwork {
  nodes: Arc<RwLock<HashMap<PeerId, Arc<Node>>>>,
}

impl MemoryNetwork {
  pub fn new() -> Self {
    Self::default()
  }

  /// Creates a new endpoint with a random identity.
  pub fn transport(
    &self,
  ) -> (Arc<MemoryTransport>, UnboundedReceiver<Event>) {
    self.transport_with_id(PeerId::random())
  }

  pub fn transport_with_id(
    &self,
    peer: PeerId,
  ) -> (Arc<MemoryTransport>, UnboundedReceiver<Event>) {
    let (tx, rx) = unbounded_channel();
    let node = Arc::new(Node {
      peer,
      events: tx,
      protocols: RwLock::new(HashSet::new()),
      connections: Mutex::new(HashMap::new()),
      banned: RwLock::new(HashSet::new()),
      closed: AtomicBool::new(false),
    });

    self.nodes.write().insert(peer, Arc::clone(&node));
    let transport = MemoryTransport {
      node,
      hub: self.clone(),
    };
    (Arc::new(transport), rx)
  }

  fn node(&self, peer: &PeerId) -> Option<Arc<Node>> {
    self.nodes.read().get(peer).cloned()
  }
}

/// Endpoint of a [`MemoryNetwork`].
#[derive(Debug)]
pub struct MemoryTransport {
  node: Arc<Node>,
  hub: MemoryNetwork,
}

impl MemoryTransport {
  fn check_open(&self) -> Result<(), Error> {
    match self.node.closed.load(Ordering::Acquire) {
      true => Err(Error::Closed),
      false => Ok(()),
    }
  }

  fn disconnect_now(&self, peer: &PeerId) {
    self.node.disconnect(peer);
    if let Some(remote) = self.hub.node(peer) {
      remote.disconnect(&self.node.peer);
    }
  }
}

#[async_trait]
impl Transport for MemoryTransport {
  fn local_peer_id(&self) -> PeerId {
    self.node.peer
  }

  fn register_protocol(&self, protocol: &str) -> Result<(), Error> {
    self.check_open()?;
    self.node.protocols.write().insert(protocol.to_owned());
    Ok(())
  }

  async fn open_stream(
    &self,
    peer: PeerId,
    protocol: &str,
  ) -> Result<BoxedStream, Error> {
    self.check_open()?;
    let remote = self.hub.node(&peer).ok_or(Error::NotConnected(peer))?;
    if !remote.protocols.read().contains(protocol) {
      return Err(Error::UnsupportedProtocol(peer, protocol.to_owned()));
    }

    let (local_end, remote_end) = pipe();
    let halves: PipeRef = (
      Arc::downgrade(&local_end.read),
      Arc::downgrade(&local_end.write),
    );

    if !self.node.attach(&peer, &halves)
      || !remote.attach(&self.node.peer, &halves)
    {
      return Err(Error::NotConnected(peer));
    }

    remote.emit(Event::InboundStream {
      peer: self.node.peer,
      protocol: protocol.to_owned(),
      stream: Box::new(remote_end),
    });

    Ok(Box::new(local_end))
  }

  fn connected_peers(&self) -> Vec<PeerId> {
    self.node.connections.lock().keys().copied().collect()
  }

  async fn dial(&self, peer: PeerId, _: Vec<Multiaddr>) -> Result<(), Error> {
    self.check_open()?;
    if peer == self.node.peer {
      return Err(Error::Dial(peer, "cannot dial self".into()));
    }

    if self.node.banned.read().contains(&peer) {
      return Err(Error::Banned(peer));
    }

    let remote = match self.hub.node(&peer) {
      Some(remote) if !remote.closed.load(Ordering::Acquire) => remote,
      _ => return Err(Error::Dial(peer, "unreachable".into())),
    };

    if remote.banned.read().contains(&self.node.peer) {
      return Err(Error::Dial(peer, "connection refused".into()));
    }

    if self.node.connect(peer, Endpoint::Dialer) {
      debug!(local = %self.node.peer, remote = %peer, "memory connection");
      remote.connect(self.node.peer, Endpoint::Listener);
    }

    Ok(())
  }

  async fn disconnect(&self, peer: PeerId) {
    self.disconnect_now(&peer);
  }

  fn ban_peer(&self, peer: PeerId) {
    self.node.banned.write().insert(peer);
    self.disconnect_now(&peer);
  }

  fn unban_peer(&self, peer: PeerId) {
    self.node.banned.write().remove(&peer);
  }

  async fn close(&self) {
    if self.node.closed.swap(true, Ordering::AcqRel) {
      return;
    }

    for peer in self.connected_peers() {
      self.disconnect_now(&peer);
    }
    self.hub.nodes.write().remove(&self.node.peer);
  }
}
