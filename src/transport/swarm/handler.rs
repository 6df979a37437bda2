//! A single connection with a peer may carry many different
//! protocols simultaneously, each on its own substream multiplexed
//! by the muxer. This handler does not read or write anything, it
//! only negotiates substreams and hands them over to the network.

use {
  super::upgrade::{InboundProtocols, OutboundProtocol},
  crate::transport::Error,
  libp2p::swarm::{
    ConnectionHandler,
    ConnectionHandlerEvent,
    ConnectionHandlerUpgrErr,
    KeepAlive,
    NegotiatedSubstream,
    SubstreamProtocol,
  },
  std::{
    collections::VecDeque,
    convert::Infallible,
    fmt::Debug,
    task::{Context, Poll},
  },
  tokio::sync::oneshot,
  tracing::warn,
};

/// Receives the outcome of an outbound substream request.
pub type StreamReply = oneshot::Sender<Result<NegotiatedSubstream, Error>>;

/// Requests sent by the behaviour to the handler of a connection.
pub enum HandlerIn {
  OpenStream {
    protocol: String,
    reply: StreamReply,
  },
}

impl Debug for HandlerIn {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      Self::OpenStream { protocol, .. } => f
        .debug_struct("OpenStream")
        .field("protocol", protocol)
        .finish(),
    }
  }
}

/// Substreams opened by the remote peer.
pub enum HandlerOut {
  InboundStream {
    protocol: String,
    stream: NegotiatedSubstream,
  },
}

impl Debug for HandlerOut {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      Self::InboundStream { protocol, .. } => f
        .debug_struct("InboundStream")
        .field("protocol", protocol)
        .finish(),
    }
  }
}

type StreamHandlerEvent = ConnectionHandlerEvent<
  OutboundProtocol,
  StreamReply,
  HandlerOut,
  Infallible,
>;

pub struct StreamHandler {
  /// Protocols accepted on inbound substreams.
  inbound: InboundProtocols,

  /// Outbound substream requests not yet handed to libp2p.
  requests: VecDeque<(String, StreamReply)>,

  /// Negotiated inbound substreams not yet reported.
  events: VecDeque<HandlerOut>,
}

impl StreamHandler {
  pub fn new(inbound: InboundProtocols) -> Self {
    Self {
      inbound,
      requests: VecDeque::new(),
      events: VecDeque::new(),
    }
  }
}

impl ConnectionHandler for StreamHandler {
  type Error = Infallible;
  type InEvent = HandlerIn;
  type InboundOpenInfo = ();
  type InboundProtocol = InboundProtocols;
  type OutEvent = HandlerOut;
  type OutboundOpenInfo = StreamReply;
  type OutboundProtocol = OutboundProtocol;

  fn listen_protocol(
    &self,
  ) -> SubstreamProtocol<Self::InboundProtocol, Self::InboundOpenInfo> {
    SubstreamProtocol::new(self.inbound.clone(), ())
  }

  fn inject_fully_negotiated_inbound(
    &mut self,
    (stream, protocol): (NegotiatedSubstream, String),
    _: Self::InboundOpenInfo,
  ) {
    self
      .events
      .push_back(HandlerOut::InboundStream { protocol, stream });
  }

  fn inject_fully_negotiated_outbound(
    &mut self,
    stream: NegotiatedSubstream,
    reply: Self::OutboundOpenInfo,
  ) {
    // the requester may have given up waiting
    let _ = reply.send(Ok(stream));
  }

  fn inject_event(&mut self, event: Self::InEvent) {
    match event {
      HandlerIn::OpenStream { protocol, reply } => {
        self.requests.push_back((protocol, reply));
      }
    }
  }

  fn inject_dial_upgrade_error(
    &mut self,
    reply: Self::OutboundOpenInfo,
    error: ConnectionHandlerUpgrErr<Infallible>,
  ) {
    warn!("Outbound substream negotiation failed: {error:?}");
    let _ = reply.send(Err(Error::Transport(format!("{error:?}"))));
  }

  /// Connections are closed explicitly by the network, never because
  /// they have no open substreams.
  fn connection_keep_alive(&self) -> KeepAlive {
    KeepAlive::Yes
  }

  fn poll(&mut self, _: &mut Context<'_>) -> Poll<StreamHandlerEvent> {
    if let Some(event) = self.events.pop_front() {
      return Poll::Ready(ConnectionHandlerEvent::Custom(event));
    }

    if let Some((protocol, reply)) = self.requests.pop_front() {
      let protocol = OutboundProtocol::new(protocol);
      return Poll::Ready(ConnectionHandlerEvent::OutboundSubstreamRequest {
        protocol: SubstreamProtocol::new(protocol, reply),
      });
    }

    Poll::Pending
  }
}
