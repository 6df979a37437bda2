use {
  super::{
    handler::{HandlerIn, HandlerOut, StreamHandler},
    upgrade::InboundProtocols,
  },
  crate::{
    channel::Channel,
    transport::{Endpoint, Event},
  },
  libp2p::{
    core::{connection::ConnectionId, ConnectedPoint},
    swarm::{
      NetworkBehaviour,
      NetworkBehaviourAction,
      NotifyHandler,
      PollParameters,
    },
    Multiaddr,
    PeerId,
  },
  parking_lot::RwLock,
  std::{
    collections::HashMap,
    sync::Arc,
    task::{Context, Poll},
  },
  tracing::debug,
};

/// Known addresses of peers, consulted by the swarm when dialing.
pub type AddressMap = Arc<RwLock<HashMap<PeerId, Vec<Multiaddr>>>>;

pub(crate) struct Behaviour {
  protocols: InboundProtocols,
  addresses: AddressMap,
  events: Channel<Event>,
  requests: Channel<(PeerId, HandlerIn)>,
}

impl Behaviour {
  pub fn new(protocols: InboundProtocols, addresses: AddressMap) -> Self {
    Self {
      protocols,
      addresses,
      events: Channel::new(),
      requests: Channel::new(),
    }
  }

  /// Asks any connection with the peer to open an outbound substream.
  pub fn open_stream(&self, peer: PeerId, request: HandlerIn) {
    self.requests.send((peer, request));
  }
}

impl NetworkBehaviour for Behaviour {
  type ConnectionHandler = StreamHandler;
  type OutEvent = Event;

  fn new_handler(&mut self) -> Self::ConnectionHandler {
    StreamHandler::new(self.protocols.clone())
  }

  fn addresses_of_peer(&mut self, peer: &PeerId) -> Vec<Multiaddr> {
    self
      .addresses
      .read()
      .get(peer)
      .cloned()
      .unwrap_or_default()
  }

  fn inject_event(
    &mut self,
    peer: PeerId,
    connection: ConnectionId,
    event: HandlerOut,
  ) {
    match event {
      HandlerOut::InboundStream { protocol, stream } => {
        debug!(%peer, ?connection, %protocol, "inbound substream");
        self.events.send(Event::InboundStream {
          peer,
          protocol,
          stream: Box::new(stream),
        });
      }
    }
  }

  /// Only the first connection with a peer is reported, the network
  /// works with peers and not with individual connections.
  fn inject_connection_established(
    &mut self,
    peer_id: &PeerId,
    _: &ConnectionId,
    endpoint: &ConnectedPoint,
    _: Option<&Vec<Multiaddr>>,
    other_established: usize,
  ) {
    if other_established == 0 {
      self.events.send(Event::Connected {
        peer: *peer_id,
        endpoint: match endpoint.is_dialer() {
          true => Endpoint::Dialer,
          false => Endpoint::Listener,
        },
      });
    }
  }

  /// A call to this method is always paired with an earlier call to
  /// [`NetworkBehaviour::inject_connection_established`] with the same
  /// peer ID, connection ID and endpoint.
  fn inject_connection_closed(
    &mut self,
    peer_id: &PeerId,
    _: &ConnectionId,
    _: &ConnectedPoint,
    _: StreamHandler,
    remaining_established: usize,
  ) {
    if remaining_established == 0 {
      self.events.send(Event::Disconnected { peer: *peer_id });
    }
  }

  fn poll(
    &mut self,
    cx: &mut Context<'_>,
    _: &mut impl PollParameters,
  ) -> Poll<NetworkBehaviourAction<Self::OutEvent, Self::ConnectionHandler>> {
    // propagate any generated events to the network API.
    if let Poll::Ready(Some(event)) = self.events.poll_recv(cx) {
      return Poll::Ready(NetworkBehaviourAction::GenerateEvent(event));
    }

    // forward substream requests to any connection handler of the peer.
    if let Poll::Ready(Some((peer_id, event))) = self.requests.poll_recv(cx) {
      return Poll::Ready(NetworkBehaviourAction::NotifyHandler {
        peer_id,
        handler: NotifyHandler::Any,
        event,
      });
    }

    Poll::Pending
  }
}
