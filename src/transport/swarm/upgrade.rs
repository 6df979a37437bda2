use {
  futures::future,
  libp2p::{core::UpgradeInfo, InboundUpgrade, OutboundUpgrade},
  parking_lot::RwLock,
  std::{convert::Infallible, iter, sync::Arc},
};

/// Protocol names accepted on inbound substreams.
///
/// The list is shared by all connection handlers, protocols registered
/// after a connection was established are negotiable on it right away.
#[derive(Debug, Clone, Default)]
pub struct InboundProtocols {
  names: Arc<RwLock<Vec<String>>>,
}

impl InboundProtocols {
  pub fn insert(&self, name: &str) {
    let mut names = self.names.write();
    if !names.iter().any(|n| n == name) {
      names.push(name.to_owned());
    }
  }
}

impl UpgradeInfo for InboundProtocols {
  type Info = String;
  type InfoIter = std::vec::IntoIter<String>;

  fn protocol_info(&self) -> Self::InfoIter {
    // unique libp2p protocol identifiers used when negotiating
    // common protocols between both endpoints.
    self.names.read().clone().into_iter()
  }
}

/// Invoked when a remote node opens a substream with us. The raw
/// substream is handed to the network together with the negotiated
/// protocol name, framing happens there.
impl<Socket: Send + 'static> InboundUpgrade<Socket> for InboundProtocols {
  type Error = Infallible;
  type Future = future::Ready<Result<Self::Output, Self::Error>>;
  type Output = (Socket, String);

  fn upgrade_inbound(self, socket: Socket, info: Self::Info) -> Self::Future {
    future::ok((socket, info))
  }
}

/// A single protocol requested for an outbound substream.
#[derive(Debug, Clone)]
pub struct OutboundProtocol {
  name: String,
}

impl OutboundProtocol {
  pub fn new(name: String) -> Self {
    Self { name }
  }
}

impl UpgradeInfo for OutboundProtocol {
  type Info = String;
  type InfoIter = iter::Once<String>;

  fn protocol_info(&self) -> Self::InfoIter {
    iter::once(self.name.clone())
  }
}

impl<Socket: Send + 'static> OutboundUpgrade<Socket> for OutboundProtocol {
  type Error = Infallible;
  type Future = future::Ready<Result<Self::Output, Self::Error>>;
  type Output = Socket;

  fn upgrade_outbound(self, socket: Socket, _: Self::Info) -> Self::Future {
    future::ok(socket)
  }
}
