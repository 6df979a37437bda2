//! Notification protocol engine.
//!
//! Every registered protocol runs over its own transport streams. The
//! peer that wants to send opens a stream and writes its handshake,
//! the receiving peer validates it, answers with its own handshake on
//! the same stream and half-closes its write side. From then on the
//! stream carries messages in one direction only, from the opener to
//! the acceptor. Each direction of a (peer, protocol) pair therefore
//! has its own handshake state.

use {
  crate::{
    codec,
    gossip::{Forwarders, Outbound},
    handshake::{HandshakeData, HandshakeMap, SharedStream},
    peerset::ReputationChange,
    protocol::{
      self,
      message_hash,
      BatchHandler,
      Message,
      MessageType,
      ProtocolDescriptor,
    },
    shared::Shared,
    stream::Substream,
    transport::{self, BoxedStream},
  },
  bytes::Bytes,
  dashmap::{mapref::entry::Entry, DashMap, DashSet},
  libp2p::PeerId,
  metrics::increment_counter,
  multihash::Multihash,
  parking_lot::Mutex,
  rand::seq::SliceRandom,
  std::sync::Arc,
  thiserror::Error,
  tokio::{sync::Mutex as AsyncMutex, time::sleep},
  tracing::{debug, info, trace, warn},
};

#[derive(Debug, Error)]
pub enum Error {
  #[error("Not connected to peer {0}")]
  NotConnected(PeerId),

  #[error("Message type {0} is already registered")]
  DuplicateMessageType(MessageType),

  #[error("Protocol {0} is already registered")]
  DuplicateProtocol(String),

  #[error("No protocol handles message type {0}")]
  UnsupportedMessageType(MessageType),

  #[error("Handshake with peer {0} timed out")]
  HandshakeTimeout(PeerId),

  #[error("Peer {0} sent an invalid handshake on this protocol")]
  InvalidHandshake(PeerId),

  #[error("Handshake rejected: {0}")]
  HandshakeRejected(protocol::Error),

  #[error("Framing error: {0}")]
  Codec(#[from] codec::Error),

  #[error("Transport error: {0}")]
  Transport(#[from] transport::Error),

  #[error("Protocol error: {0}")]
  Protocol(#[from] protocol::Error),

  #[error("Network is shutting down")]
  Shutdown,
}

impl Error {
  /// Penalty the remote peer deserves for causing this error.
  pub fn reputation_change(&self) -> Option<ReputationChange> {
    match self {
      Error::HandshakeRejected(e) | Error::Protocol(e) => {
        e.reputation_change()
      }
      Error::Codec(e) if e.is_protocol_violation() => {
        Some(ReputationChange::BAD_MESSAGE)
      }
      _ => None,
    }
  }
}

/// A received message waiting in a protocol batch.
struct Pending {
  peer: PeerId,
  message: Box<dyn Message>,
  payload: Bytes,
  hash: Multihash,
}

/// Runtime state of one registered protocol.
struct ProtocolState {
  descriptor: ProtocolDescriptor,
  max_message_size: usize,

  /// Handshakes received on streams opened by peers.
  inbound: HandshakeMap,

  /// Handshakes sent on streams opened by us.
  outbound: HandshakeMap,

  /// Serializes handshakes and writes to each peer. Present only
  /// while the peer is connected.
  locks: DashMap<PeerId, Arc<AsyncMutex<()>>>,

  batch: Mutex<Vec<Pending>>,
  forwarders: Forwarders,
}

impl ProtocolState {
  fn name(&self) -> &str {
    &self.descriptor.name
  }

  fn purge(&self, peer: &PeerId) {
    self.locks.remove(peer);
    self.inbound.delete(peer);
    self.outbound.delete(peer);
    self.forwarders.remove(peer);
  }
}

pub(crate) struct Notifications {
  shared: Arc<Shared>,
  protocols: DashMap<MessageType, Arc<ProtocolState>>,
  names: DashMap<String, MessageType>,

  /// Peers admitted by the peer set.
  peers: DashSet<PeerId>,
}

impl Notifications {
  pub fn new(shared: Arc<Shared>) -> Self {
    Self {
      shared,
      protocols: DashMap::new(),
      names: DashMap::new(),
      peers: DashSet::new(),
    }
  }

  /// Registers a protocol and starts accepting its streams.
  pub fn register(&self, descriptor: ProtocolDescriptor) -> Result<(), Error> {
    if self.names.contains_key(&descriptor.name) {
      return Err(Error::DuplicateProtocol(descriptor.name));
    }

    let entry = match self.protocols.entry(descriptor.message_type) {
      Entry::Occupied(_) => {
        return Err(Error::DuplicateMessageType(descriptor.message_type))
      }
      Entry::Vacant(entry) => entry,
    };

    self.shared.transport.register_protocol(&descriptor.name)?;

    let state = ProtocolState {
      max_message_size: descriptor
        .max_message_size
        .unwrap_or(self.shared.config.max_message_size),
      inbound: HandshakeMap::new(),
      outbound: HandshakeMap::new(),
      locks: DashMap::new(),
      batch: Mutex::new(Vec::new()),
      forwarders: Forwarders::new(),
      descriptor,
    };

    for peer in self.peers.iter() {
      state.locks.insert(*peer, Arc::default());
    }

    info!(
      protocol = %state.name(),
      message_type = state.descriptor.message_type,
      "protocol registered"
    );
    self
      .names
      .insert(state.name().to_owned(), state.descriptor.message_type);
    entry.insert(Arc::new(state));
    Ok(())
  }

  pub fn is_registered(&self, protocol: &str) -> bool {
    self.names.contains_key(protocol)
  }

  fn protocol(
    &self,
    message_type: MessageType,
  ) -> Result<Arc<ProtocolState>, Error> {
    self
      .protocols
      .get(&message_type)
      .map(|state| Arc::clone(state.value()))
      .ok_or(Error::UnsupportedMessageType(message_type))
  }

  fn protocol_by_name(&self, name: &str) -> Option<Arc<ProtocolState>> {
    let message_type = *self.names.get(name)?;
    self.protocol(message_type).ok()
  }

  /// Invoked once the peer set admitted a connected peer.
  pub fn peer_connected(&self, peer: PeerId) {
    if !self.peers.insert(peer) {
      return;
    }

    for state in self.protocols.iter() {
      state.locks.entry(peer).or_default();
    }
    increment_counter!("peers_connected");
  }

  /// Invoked when the connection with a peer is gone. All state kept
  /// for the peer is dropped here and nowhere else.
  pub fn peer_disconnected(&self, peer: &PeerId) {
    self.peers.remove(peer);
    for state in self.protocols.iter() {
      state.purge(peer);
    }
    self.shared.bandwidth.forget(peer);
    increment_counter!("peers_disconnected");
  }

  pub fn peers(&self) -> Vec<PeerId> {
    self.peers.iter().map(|peer| *peer).collect()
  }

  pub fn peer_count(&self) -> usize {
    self.peers.len()
  }

  /// Whether the peer set admitted the peer.
  pub fn is_connected(&self, peer: &PeerId) -> bool {
    self.peers.contains(peer)
  }

  /// Floods a message to all admitted peers.
  pub fn broadcast(
    self: &Arc<Self>,
    message: &dyn Message,
  ) -> Result<(), Error> {
    let state = self.protocol(message.message_type())?;
    let payload = message.encode()?;
    let hash = message_hash(state.descriptor.message_type, &payload);

    // our own message echoed back by other peers is not new to us
    self.shared.gossip.has_seen(&hash);
    self.broadcast_excluding(&state, None, payload, hash);
    Ok(())
  }

  /// Sends a message to a single peer and waits for it to be written.
  pub async fn send_to(
    &self,
    peer: PeerId,
    message: &dyn Message,
  ) -> Result<(), Error> {
    let state = self.protocol(message.message_type())?;
    let payload = message.encode()?;
    let hash = message_hash(state.descriptor.message_type, &payload);
    self.send_data(&state, peer, payload, hash).await
  }

  fn broadcast_excluding(
    self: &Arc<Self>,
    state: &Arc<ProtocolState>,
    exclude: Option<PeerId>,
    payload: Bytes,
    hash: Multihash,
  ) {
    let mut peers: Vec<PeerId> = self
      .peers
      .iter()
      .map(|peer| *peer)
      .filter(|peer| Some(*peer) != exclude)
      .collect();
    peers.shuffle(&mut rand::thread_rng());

    trace!(protocol = %state.name(), peers = peers.len(), "flood-fill");
    for peer in peers {
      let message = Outbound {
        payload: payload.clone(),
        hash,
      };

      if let Some(first) = state.forwarders.enqueue(peer, message) {
        tokio::spawn(Arc::clone(self).forward(Arc::clone(state), peer, first));
      }
    }
  }

  /// Drains the forwarding queue of one peer.
  async fn forward(
    self: Arc<Self>,
    state: Arc<ProtocolState>,
    peer: PeerId,
    first: Outbound,
  ) {
    let mut next = Some(first);
    while let Some(message) = next {
      let result = self
        .send_data(&state, peer, message.payload, message.hash)
        .await;

      if let Err(e) = result {
        debug!(%peer, protocol = %state.name(), "gossip not delivered: {e}");
        if matches!(e, Error::NotConnected(_) | Error::Shutdown) {
          state.forwarders.remove(&peer);
          return;
        }
      }

      next = state.forwarders.next(&peer);
    }
  }

  /// Writes a message to a peer, performing the outbound handshake
  /// first if there is no validated stream yet.
  async fn send_data(
    &self,
    state: &ProtocolState,
    peer: PeerId,
    payload: Bytes,
    hash: Multihash,
  ) -> Result<(), Error> {
    let lock = state
      .locks
      .get(&peer)
      .map(|lock| Arc::clone(lock.value()))
      .ok_or(Error::NotConnected(peer))?;
    let _guard = lock.lock().await;

    let cached = match state.outbound.get(&peer) {
      Some(existing) if existing.is_rejected() => {
        return Err(Error::InvalidHandshake(peer));
      }
      Some(HandshakeData {
        validated: true,
        stream: Some(stream),
        ..
      }) => self.reusable(state, peer, stream).await,
      _ => None,
    };

    // peers holding the message do not need a stream at all
    if state.descriptor.dedupe && !self.shared.gossip.should_send(&peer, &hash)
    {
      trace!(%peer, protocol = %state.name(), "already sent");
      return Ok(());
    }

    let stream = match cached {
      Some(stream) => stream,
      None => match self.outbound_handshake(state, peer).await {
        Ok(stream) => stream,
        Err(e) => {
          self.shared.gossip.forget_sent(&peer, &hash);
          return Err(e);
        }
      },
    };

    let mut stream = stream.lock().await;
    if let Err(e) = stream.write_frame(payload).await {
      let id = stream.id();
      state.outbound.remove_if(&peer, |s| s.stream_id == Some(id));
      self.shared.gossip.forget_sent(&peer, &hash);
      return Err(e.into());
    }

    increment_counter!(
      "messages_sent",
      "protocol" => state.descriptor.name.clone()
    );
    Ok(())
  }

  /// Returns the cached outbound stream unless it stayed quiet for so
  /// long that the remote reaper may have closed it already. Expired
  /// streams are closed and forgotten so the next send starts over
  /// with a fresh handshake.
  ///
  /// Must be called with the peer lock held.
  async fn reusable(
    &self,
    state: &ProtocolState,
    peer: PeerId,
    stream: SharedStream,
  ) -> Option<SharedStream> {
    // the remote reaper sweeps once per interval, so a stream is never
    // closed before it has been idle for a full interval
    let expiry = self.shared.config.stream_idle_interval / 2;
    let expired = {
      let mut io = stream.lock().await;
      let expired = io.idle_for() >= expiry;
      if expired {
        let id = io.id();
        debug!(%peer, protocol = %state.name(), "replacing idle stream");
        increment_counter!("outbound_streams_expired");
        state.outbound.remove_if(&peer, |s| s.stream_id == Some(id));
        let _ = io.close().await;
      }
      expired
    };

    (!expired).then_some(stream)
  }

  /// Opens a stream, sends our handshake and waits for the response.
  ///
  /// Must be called with the peer lock held.
  async fn outbound_handshake(
    &self,
    state: &ProtocolState,
    peer: PeerId,
  ) -> Result<SharedStream, Error> {
    let io = self
      .shared
      .transport
      .open_stream(peer, state.name())
      .await?;
    let mut stream = self.shared.substream(
      peer,
      state.name(),
      io,
      state.max_message_size,
    );
    let id = stream.id();

    let handshake = (state.descriptor.handshake)()?.encode()?;
    stream.write_frame(handshake).await?;
    state.outbound.set(peer, HandshakeData::sent(id));
    increment_counter!(
      "handshakes_sent",
      "protocol" => state.descriptor.name.clone()
    );

    let mut shutdown = self.shared.shutdown.clone();
    let response = tokio::select! {
      response = stream.read_frame() => response,
      _ = sleep(self.shared.config.handshake_timeout) => {
        warn!(%peer, protocol = %state.name(), "handshake timed out");
        increment_counter!("handshakes_timed_out");
        state.outbound.remove_if(&peer, |s| s.stream_id == Some(id));
        self.shared.report(peer, ReputationChange::TIMEOUT);
        let _ = stream.close().await;
        return Err(Error::HandshakeTimeout(peer));
      }
      _ = shutdown.changed() => {
        state.outbound.remove_if(&peer, |s| s.stream_id == Some(id));
        return Err(Error::Shutdown);
      }
    };

    let response = match response {
      Ok(response) => response,
      Err(e) => {
        state.outbound.remove_if(&peer, |s| s.stream_id == Some(id));
        let e = Error::from(e);
        if let Some(change) = e.reputation_change() {
          self.shared.report(peer, change);
        }
        return Err(e);
      }
    };

    let handshake = match (state.descriptor.handshake_decoder)(&response[..]) {
      Ok(handshake) => handshake,
      Err(e) => {
        state.outbound.set(peer, HandshakeData::rejected(None));
        return Err(self.reject_handshake(state, peer, e));
      }
    };

    if let Err(e) = (state.descriptor.handshake_validator)(&peer, &*handshake)
    {
      let handshake = Some(Arc::from(handshake));
      state.outbound.set(peer, HandshakeData::rejected(handshake));
      return Err(self.reject_handshake(state, peer, e));
    }

    debug!(%peer, protocol = %state.name(), "outbound handshake validated");
    increment_counter!("handshakes_validated", "direction" => "outbound");

    let stream = Arc::new(AsyncMutex::new(stream));
    state.outbound.set(peer, HandshakeData {
      received: true,
      validated: true,
      handshake: Some(Arc::from(handshake)),
      stream_id: Some(id),
      stream: Some(Arc::clone(&stream)),
    });
    Ok(stream)
  }

  fn reject_handshake(
    &self,
    state: &ProtocolState,
    peer: PeerId,
    error: protocol::Error,
  ) -> Error {
    debug!(%peer, protocol = %state.name(), "invalid handshake: {error}");
    increment_counter!(
      "handshakes_failed",
      "protocol" => state.descriptor.name.clone()
    );
    if let Some(change) = error.reputation_change() {
      self.shared.report(peer, change);
    }
    Error::HandshakeRejected(error)
  }

  /// Takes over a stream opened by a remote peer.
  pub fn inbound_stream(
    self: &Arc<Self>,
    peer: PeerId,
    protocol: &str,
    io: BoxedStream,
  ) {
    let Some(state) = self.protocol_by_name(protocol) else {
      debug!(%peer, %protocol, "stream on unknown protocol");
      return;
    };

    let stream = self.shared.substream(
      peer,
      protocol,
      io,
      state.max_message_size,
    );
    tokio::spawn(Arc::clone(self).serve_inbound(state, stream));
  }

  /// Reads frames from an inbound stream until it fails, is closed by
  /// the remote, goes idle or the network shuts down.
  async fn serve_inbound(
    self: Arc<Self>,
    state: Arc<ProtocolState>,
    mut stream: Substream,
  ) {
    let peer = *stream.peer();
    let id = stream.id();
    let idle = self.shared.reaper.track(id);
    let mut shutdown = self.shared.shutdown.clone();

    loop {
      let frame = tokio::select! {
        frame = stream.read_frame() => frame,
        _ = idle.notified() => {
          debug!(%peer, protocol = %state.name(), "closing idle stream");
          break;
        }
        _ = shutdown.changed() => break,
      };

      let result = match frame {
        Ok(frame) => {
          self.shared.reaper.touch(id);
          self.handle_frame(&state, &mut stream, frame).await
        }
        Err(e) => Err(e.into()),
      };

      if let Err(e) = result {
        if let Some(change) = e.reputation_change() {
          self.shared.report(peer, change);
        }

        match e {
          Error::Codec(codec::Error::Eof) => {
            trace!(%peer, protocol = %state.name(), "stream closed by peer")
          }
          e => debug!(%peer, protocol = %state.name(), "closing stream: {e}"),
        }
        break;
      }
    }

    self.shared.reaper.untrack(id);
    state
      .inbound
      .remove_if(&peer, |s| s.validated && s.stream_id == Some(id));
    let _ = stream.close().await;
  }

  async fn handle_frame(
    self: &Arc<Self>,
    state: &Arc<ProtocolState>,
    stream: &mut Substream,
    frame: Bytes,
  ) -> Result<(), Error> {
    let peer = *stream.peer();
    let id = stream.id();

    match state.inbound.get(&peer) {
      Some(existing) if existing.is_rejected() => {
        return Err(Error::InvalidHandshake(peer));
      }
      Some(existing)
        if existing.validated && existing.stream_id == Some(id) =>
      {
        return self.handle_message(state, peer, frame);
      }
      _ => {}
    }

    // first frame on this stream, it has to be a handshake
    let handshake = (state.descriptor.handshake_decoder)(&frame[..])?;
    if let Err(e) = (state.descriptor.handshake_validator)(&peer, &*handshake)
    {
      increment_counter!(
        "handshakes_failed",
        "protocol" => state.descriptor.name.clone()
      );
      state
        .inbound
        .set(peer, HandshakeData::rejected(Some(Arc::from(handshake))));
      return Err(Error::HandshakeRejected(e));
    }

    state.inbound.set(peer, HandshakeData {
      received: true,
      validated: true,
      handshake: Some(Arc::from(handshake)),
      stream_id: Some(id),
      stream: None,
    });
    debug!(%peer, protocol = %state.name(), "inbound handshake validated");
    increment_counter!("handshakes_validated", "direction" => "inbound");

    let ours = (state.descriptor.handshake)()?.encode()?;
    stream.write_frame(ours).await?;
    stream.close().await?;
    Ok(())
  }

  fn handle_message(
    self: &Arc<Self>,
    state: &Arc<ProtocolState>,
    peer: PeerId,
    frame: Bytes,
  ) -> Result<(), Error> {
    let message = (state.descriptor.message_decoder)(&frame[..])?;
    let hash = message_hash(state.descriptor.message_type, &frame);
    increment_counter!(
      "messages_received",
      "protocol" => state.descriptor.name.clone()
    );

    // whoever sent it to us, first or not, already has it
    if state.descriptor.dedupe {
      self.shared.gossip.mark_held(&peer, &hash);
    }

    if self.shared.gossip.has_seen(&hash) {
      trace!(%peer, protocol = %state.name(), "duplicate message");
      increment_counter!("duplicate_messages");
      self.shared.report(peer, ReputationChange::DUPLICATE_GOSSIP);
      return Ok(());
    }

    let Some(batch_handler) = &state.descriptor.batch_handler else {
      match (state.descriptor.handler)(&peer, message) {
        Ok(true) => self.broadcast_excluding(state, Some(peer), frame, hash),
        Ok(false) => {}
        Err(e) => self.reject_message(state, peer, e),
      }
      return Ok(());
    };

    let full = {
      let mut batch = state.batch.lock();
      batch.push(Pending {
        peer,
        message,
        payload: frame,
        hash,
      });
      match batch.len() >= self.shared.config.batch_size {
        true => Some(std::mem::take(&mut *batch)),
        false => None,
      }
    };

    if let Some(items) = full {
      self.process_batch(state, batch_handler, items);
    }
    Ok(())
  }

  fn process_batch(
    self: &Arc<Self>,
    state: &Arc<ProtocolState>,
    handler: &BatchHandler,
    items: Vec<Pending>,
  ) {
    trace!(protocol = %state.name(), size = items.len(), "processing batch");
    let mut origins = Vec::with_capacity(items.len());
    let mut messages = Vec::with_capacity(items.len());
    for item in items {
      origins.push((item.peer, item.payload, item.hash));
      messages.push((item.peer, item.message));
    }

    let outcomes = handler(messages);
    if outcomes.len() != origins.len() {
      warn!(
        protocol = %state.name(),
        messages = origins.len(),
        outcomes = outcomes.len(),
        "batch handler outcomes do not match the batch"
      );
      increment_counter!("batch_outcome_mismatch");
    }

    for ((peer, payload, hash), outcome) in origins.into_iter().zip(outcomes) {
      match outcome {
        Ok(true) => self.broadcast_excluding(state, Some(peer), payload, hash),
        Ok(false) => {}
        Err(e) => self.reject_message(state, peer, e),
      }
    }
  }

  /// Hands partially filled batches to their handlers so messages do
  /// not wait indefinitely on quiet protocols.
  pub fn flush_batches(self: &Arc<Self>) {
    let states: Vec<_> = self
      .protocols
      .iter()
      .map(|state| Arc::clone(state.value()))
      .collect();

    for state in states {
      let Some(handler) = &state.descriptor.batch_handler else {
        continue;
      };

      let items = std::mem::take(&mut *state.batch.lock());
      if !items.is_empty() {
        self.process_batch(&state, handler, items);
      }
    }
  }

  /// A message handler refused a message, the stream stays open.
  fn reject_message(
    &self,
    state: &ProtocolState,
    peer: PeerId,
    error: protocol::Error,
  ) {
    debug!(%peer, protocol = %state.name(), "message rejected: {error}");
    increment_counter!("messages_rejected");
    if let Some(change) = error.reputation_change() {
      self.shared.report(peer, change);
    }
  }

  /// Number of peers with a validated handshake in each direction.
  pub fn handshakes(&self, message_type: MessageType) -> (usize, usize) {
    match self.protocol(message_type) {
      Ok(state) => (state.inbound.len(), state.outbound.len()),
      Err(_) => (0, 0),
    }
  }
}
