//! Request-response protocols.
//!
//! Every exchange uses a fresh stream carrying exactly one request
//! frame and one response frame. Requests are not handshaken. Peers
//! that keep asking the same question are cut off by the spam limiter.

use {
  crate::{
    codec,
    peerset::ReputationChange,
    protocol,
    shared::Shared,
    spam::SpamLimiter,
    stream::Substream,
    transport::{self, BoxedStream},
  },
  bytes::Bytes,
  dashmap::{mapref::entry::Entry, DashMap},
  libp2p::PeerId,
  metrics::increment_counter,
  multihash::{Code, MultihashDigest},
  std::sync::Arc,
  thiserror::Error,
  tokio::time::timeout,
  tracing::{debug, info},
};

#[derive(Debug, Error)]
pub enum Error {
  #[error("Request protocol {0} is already registered")]
  DuplicateProtocol(String),

  #[error("Request protocol {0} is not registered")]
  UnknownProtocol(String),

  #[error("Request to peer {0} timed out")]
  Timeout(PeerId),

  #[error("Peer {0} repeated the same request too often")]
  SpamLimited(PeerId),

  #[error("Request rejected: {0}")]
  Handler(protocol::Error),

  #[error("Framing error: {0}")]
  Codec(#[from] codec::Error),

  #[error("Transport error: {0}")]
  Transport(#[from] transport::Error),
}

impl Error {
  /// Penalty the remote peer deserves for causing this error.
  pub fn reputation_change(&self) -> Option<ReputationChange> {
    match self {
      Error::SpamLimited(_) => Some(ReputationChange::SPAM_LIMITED),
      Error::Handler(e) => e.reputation_change(),
      Error::Codec(e) if e.is_protocol_violation() => {
        Some(ReputationChange::BAD_MESSAGE)
      }
      _ => None,
    }
  }
}

/// Answers a request from a peer.
pub type RequestHandler =
  Arc<dyn Fn(&PeerId, Bytes) -> Result<Bytes, protocol::Error> + Send + Sync>;

struct RequestProtocol {
  name: String,
  max_request_size: usize,
  max_response_size: usize,
  handler: RequestHandler,
}

pub(crate) struct Requests {
  shared: Arc<Shared>,
  protocols: DashMap<String, Arc<RequestProtocol>>,
  limiter: SpamLimiter,
}

impl Requests {
  pub fn new(shared: Arc<Shared>) -> Self {
    let config = &shared.config;
    let limiter = SpamLimiter::new(
      config.spam_window,
      config.spam_max_requests,
      config.spam_max_peers,
      config.spam_max_hashes_per_peer,
    );

    Self {
      shared,
      limiter,
      protocols: DashMap::new(),
    }
  }

  pub fn register(
    &self,
    name: &str,
    max_request_size: usize,
    max_response_size: usize,
    handler: RequestHandler,
  ) -> Result<(), Error> {
    let entry = match self.protocols.entry(name.to_owned()) {
      Entry::Occupied(_) => {
        return Err(Error::DuplicateProtocol(name.to_owned()))
      }
      Entry::Vacant(entry) => entry,
    };

    self.shared.transport.register_protocol(name)?;
    entry.insert(Arc::new(RequestProtocol {
      name: name.to_owned(),
      max_request_size,
      max_response_size,
      handler,
    }));

    info!(protocol = %name, "request protocol registered");
    Ok(())
  }

  pub fn is_registered(&self, name: &str) -> bool {
    self.protocols.contains_key(name)
  }

  fn protocol(&self, name: &str) -> Result<Arc<RequestProtocol>, Error> {
    self
      .protocols
      .get(name)
      .map(|protocol| Arc::clone(protocol.value()))
      .ok_or_else(|| Error::UnknownProtocol(name.to_owned()))
  }

  /// Sends a request and waits for the response.
  pub async fn request(
    &self,
    peer: PeerId,
    name: &str,
    payload: Bytes,
  ) -> Result<Bytes, Error> {
    let protocol = self.protocol(name)?;
    let exchange = async {
      let io = self.shared.transport.open_stream(peer, name).await?;
      let mut stream = self.shared.substream(
        peer,
        name,
        io,
        protocol.max_request_size,
      );

      stream.write_frame(payload).await?;
      stream.close().await?;

      stream.set_max_message_size(protocol.max_response_size);
      Ok::<_, Error>(stream.read_frame().await?)
    };

    let response = timeout(self.shared.config.request_timeout, exchange)
      .await
      .map_err(|_| Error::Timeout(peer))??;

    increment_counter!("requests_sent", "protocol" => protocol.name.clone());
    Ok(response)
  }

  /// Takes over a stream opened by a remote peer.
  pub fn inbound_stream(
    self: &Arc<Self>,
    peer: PeerId,
    name: &str,
    io: BoxedStream,
  ) {
    let Ok(protocol) = self.protocol(name) else {
      debug!(%peer, protocol = %name, "stream on unknown protocol");
      return;
    };

    let stream = self.shared.substream(
      peer,
      name,
      io,
      protocol.max_request_size,
    );
    tokio::spawn(Arc::clone(self).serve(protocol, stream));
  }

  async fn serve(
    self: Arc<Self>,
    protocol: Arc<RequestProtocol>,
    mut stream: Substream,
  ) {
    let peer = *stream.peer();
    let id = stream.id();
    let idle = self.shared.reaper.track(id);

    let result = tokio::select! {
      result = self.respond(&protocol, &mut stream) => result,
      _ = idle.notified() => {
        debug!(%peer, protocol = %protocol.name, "closing idle request");
        Ok(())
      }
    };
    self.shared.reaper.untrack(id);

    if let Err(e) = result {
      if let Some(change) = e.reputation_change() {
        self.shared.report(peer, change);
      }
      debug!(%peer, protocol = %protocol.name, "request failed: {e}");
    }

    let _ = stream.close().await;
  }

  async fn respond(
    &self,
    protocol: &RequestProtocol,
    stream: &mut Substream,
  ) -> Result<(), Error> {
    let peer = *stream.peer();
    let request = stream.read_frame().await?;
    self.shared.reaper.touch(stream.id());
    increment_counter!(
      "requests_received",
      "protocol" => protocol.name.clone()
    );

    let hash = Code::Sha3_256.digest(&request);
    self.limiter.add_request(&peer, &hash);
    if self.limiter.is_limit_exceeded(&peer, &hash) {
      return Err(Error::SpamLimited(peer));
    }

    let response =
      (protocol.handler)(&peer, request).map_err(Error::Handler)?;
    stream.set_max_message_size(protocol.max_response_size);
    stream.write_frame(response).await?;
    Ok(())
  }
}
