//! The boundary between the notification engine and the host that
//! actually moves bytes between machines.
//!
//! Connection establishment, encryption and multiplexing all happen
//! behind the [`Transport`] trait. The engine only asks for streams
//! by peer and protocol name and is told about connections and
//! inbound streams through [`Event`]s.

pub mod memory;
pub mod swarm;

use {
  async_trait::async_trait,
  futures::{AsyncRead, AsyncWrite},
  libp2p::{multiaddr::Protocol, Multiaddr, PeerId},
  parking_lot::RwLock,
  std::{collections::HashMap, fmt::Debug},
  thiserror::Error,
};

#[derive(Debug, Error)]
pub enum Error {
  #[error("IO Error: {0}")]
  Io(#[from] std::io::Error),

  #[error("Not connected to peer {0}")]
  NotConnected(PeerId),

  #[error("Peer {0} does not support protocol {1}")]
  UnsupportedProtocol(PeerId, String),

  #[error("Failed to dial peer {0}: {1}")]
  Dial(PeerId, String),

  #[error("Peer {0} is banned")]
  Banned(PeerId),

  #[error("Transport error: {0}")]
  Transport(String),

  #[error("Transport is closed")]
  Closed,
}

/// A raw bidirectional byte stream with a remote peer.
pub trait RawStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin + 'static> RawStream for T {}

pub type BoxedStream = Box<dyn RawStream>;

/// Which side initiated a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
  /// We dialed the remote peer.
  Dialer,
  /// The remote peer dialed us.
  Listener,
}

/// Activity reported by the transport, in the order it happened.
pub enum Event {
  /// The first connection with a peer was established.
  Connected { peer: PeerId, endpoint: Endpoint },

  /// The last connection with a peer was closed.
  Disconnected { peer: PeerId },

  /// A peer opened a stream on one of the registered protocols.
  InboundStream {
    peer: PeerId,
    protocol: String,
    stream: BoxedStream,
  },
}

impl Debug for Event {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      Self::Connected { peer, endpoint } => f
        .debug_struct("Connected")
        .field("peer", peer)
        .field("endpoint", endpoint)
        .finish(),
      Self::Disconnected { peer } => {
        f.debug_struct("Disconnected").field("peer", peer).finish()
      }
      Self::InboundStream { peer, protocol, .. } => f
        .debug_struct("InboundStream")
        .field("peer", peer)
        .field("protocol", protocol)
        .finish(),
    }
  }
}

/// The host consumed by the network. Implementations deliver their
/// [`Event`]s on a channel handed out when they are constructed.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
  fn local_peer_id(&self) -> PeerId;

  /// Accept inbound streams negotiated on this protocol name.
  fn register_protocol(&self, protocol: &str) -> Result<(), Error>;

  /// Opens a new outbound stream on an existing connection.
  async fn open_stream(
    &self,
    peer: PeerId,
    protocol: &str,
  ) -> Result<BoxedStream, Error>;

  fn connected_peers(&self) -> Vec<PeerId>;

  /// Addresses on which the transport accepts connections, once the
  /// listeners are up.
  fn listen_addrs(&self) -> Vec<Multiaddr> {
    Vec::new()
  }

  /// Establishes a connection with a peer using any of the addresses.
  async fn dial(&self, peer: PeerId, addrs: Vec<Multiaddr>)
    -> Result<(), Error>;

  /// Closes all connections with a peer. Does nothing if there
  /// are none.
  async fn disconnect(&self, peer: PeerId);

  fn ban_peer(&self, peer: PeerId);

  fn unban_peer(&self, peer: PeerId);

  /// Closes all connections and streams, pending reads fail.
  async fn close(&self);
}

/// Resolves peers to dialable addresses.
#[async_trait]
pub trait Discovery: Send + Sync + 'static {
  async fn resolve(&self, peer: &PeerId) -> Vec<Multiaddr>;

  /// Announces the local node to the rest of the network.
  async fn advertise(&self) -> Result<(), Error>;
}

/// Returns the peer identity carried by the `/p2p/...` component
/// of an address.
pub fn peer_id_of(addr: &Multiaddr) -> Option<PeerId> {
  addr.iter().find_map(|p| match p {
    Protocol::P2p(hash) => PeerId::from_multihash(hash).ok(),
    _ => None,
  })
}

/// Static discovery backed by a list of known addresses.
#[derive(Debug, Default)]
pub struct AddressBook {
  addrs: RwLock<HashMap<PeerId, Vec<Multiaddr>>>,
}

impl AddressBook {
  /// Builds an address book from addresses that end with a peer
  /// identity. Addresses without one are skipped.
  pub fn from_addrs<'a>(
    addrs: impl IntoIterator<Item = &'a Multiaddr>,
  ) -> Self {
    let book = Self::default();
    for addr in addrs {
      if let Some(peer) = peer_id_of(addr) {
        book.insert(peer, addr.clone());
      }
    }
    book
  }

  pub fn insert(&self, peer: PeerId, addr: Multiaddr) {
    let mut addrs = self.addrs.write();
    let known = addrs.entry(peer).or_default();
    if !known.contains(&addr) {
      known.push(addr);
    }
  }

  pub fn peers(&self) -> Vec<PeerId> {
    self.addrs.read().keys().copied().collect()
  }
}

#[async_trait]
impl Discovery for AddressBook {
  async fn resolve(&self, peer: &PeerId) -> Vec<Multiaddr> {
    self.addrs.read().get(peer).cloned().unwrap_or_default()
  }

  async fn advertise(&self) -> Result<(), Error> {
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn address_book_indexes_by_peer_id() {
    let peer = PeerId::random();
    let addr: Multiaddr = format!("/ip4/10.0.0.1/tcp/30333/p2p/{peer}")
      .parse()
      .unwrap();
    let anonymous: Multiaddr = "/ip4/10.0.0.2/tcp/30333".parse().unwrap();

    let book = AddressBook::from_addrs([&addr, &anonymous]);
    assert_eq!(book.peers(), vec![peer]);
    assert_eq!(book.resolve(&peer).await, vec![addr.clone()]);
    assert!(book.resolve(&PeerId::random()).await.is_empty());

    book.insert(peer, addr.clone());
    assert_eq!(book.resolve(&peer).await.len(), 1);
  }
}
