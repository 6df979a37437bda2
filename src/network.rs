use {
  crate::{
    config,
    notifications::{self, Notifications},
    peerset::{
      self,
      PeerSet,
      Reputation,
      ReputationChange,
      SetConfig,
      DEFAULT_SET,
    },
    protocol::{self, Message, MessageType, ProtocolDescriptor},
    request::{self, Requests},
    shared::Shared,
    stream::Bandwidth,
    transport::{
      self,
      peer_id_of,
      swarm::SwarmTransport,
      AddressBook,
      Discovery,
      Endpoint,
      Event,
      Transport,
    },
    Config,
  },
  bytes::Bytes,
  libp2p::{identity::Keypair, Multiaddr, PeerId},
  metrics::gauge,
  parking_lot::Mutex,
  std::sync::Arc,
  thiserror::Error,
  tokio::{
    sync::{mpsc::UnboundedReceiver, watch},
    time::{interval, MissedTickBehavior},
  },
  tracing::{debug, info, trace, warn},
};

#[derive(Debug, Error)]
pub enum Error {
  #[error("Invalid configuration: {0}")]
  Config(#[from] config::Error),

  #[error("Transport error: {0}")]
  Transport(#[from] transport::Error),

  #[error("Notification error: {0}")]
  Notifications(#[from] notifications::Error),

  #[error("Request error: {0}")]
  Request(#[from] request::Error),

  #[error("Peer set error: {0}")]
  PeerSet(#[from] peerset::Error),

  #[error("Network is already started")]
  AlreadyStarted,
}

/// Receivers consumed by the background tasks once the network starts.
struct Startup {
  events: UnboundedReceiver<Event>,
  peerset: UnboundedReceiver<peerset::Message>,
}

struct Inner {
  shared: Arc<Shared>,
  notifications: Arc<Notifications>,
  requests: Arc<Requests>,
  discovery: Arc<dyn Discovery>,
  startup: Mutex<Option<Startup>>,

  /// Flipped to `true` on shutdown. Every background task holds a
  /// receiver, so this sender lives as long as the network.
  shutdown: watch::Sender<bool>,
}

/// This type is the entrypoint to using the network API.
///
/// A network owns one transport and runs every registered
/// notification and request protocol over it. Peers are admitted by a
/// reputation based peer set shared by all protocols.
///
/// Protocols are registered before calling [`Network::start`], which
/// spawns the background tasks and connects to the configured peers.
/// The handle is cheap to clone and all clones refer to the same
/// network.
#[derive(Clone)]
pub struct Network {
  inner: Arc<Inner>,
}

impl Network {
  /// Creates a network over an existing transport. `events` is the
  /// event channel handed out by the transport.
  ///
  /// Peers are resolved to addresses using the configured bootnodes
  /// and persistent peers.
  pub fn new(
    config: Config,
    transport: Arc<dyn Transport>,
    events: UnboundedReceiver<Event>,
  ) -> Result<Self, Error> {
    let book = AddressBook::from_addrs(
      config.bootnodes.iter().chain(config.persistent_peers.iter()),
    );
    Self::with_discovery(config, transport, events, Arc::new(book))
  }

  /// Creates a network that resolves peer addresses using a custom
  /// discovery mechanism.
  pub fn with_discovery(
    config: Config,
    transport: Arc<dyn Transport>,
    events: UnboundedReceiver<Event>,
    discovery: Arc<dyn Discovery>,
  ) -> Result<Self, Error> {
    config.validate()?;
    debug!("local identity: {}", transport.local_peer_id());

    let (peerset, peerset_rx) = PeerSet::new(vec![SetConfig {
      max_inbound: config.max_inbound,
      max_outbound: config.max_outbound,
      reserved_only: config.reserved_only,
    }]);

    let (shutdown, shutdown_rx) = watch::channel(false);
    let shared =
      Arc::new(Shared::new(config, transport, peerset, shutdown_rx));

    Ok(Self {
      inner: Arc::new(Inner {
        notifications: Arc::new(Notifications::new(Arc::clone(&shared))),
        requests: Arc::new(Requests::new(Arc::clone(&shared))),
        shared,
        discovery,
        startup: Mutex::new(Some(Startup {
          events,
          peerset: peerset_rx,
        })),
        shutdown,
      }),
    })
  }

  /// Creates a network over libp2p TCP connections secured with noise
  /// and multiplexed with yamux, listening on the configured addresses.
  pub fn with_keypair(
    config: Config,
    keypair: Keypair,
  ) -> Result<Self, Error> {
    config.validate()?;
    let (transport, events) = SwarmTransport::new(&config, keypair)?;
    Self::new(config, transport, events)
  }

  pub fn local_peer_id(&self) -> PeerId {
    self.inner.shared.transport.local_peer_id()
  }

  pub fn config(&self) -> &Config {
    &self.inner.shared.config
  }

  /// Addresses other nodes can dial, with the ports the operating
  /// system picked for wildcard listeners.
  pub fn listen_addrs(&self) -> Vec<Multiaddr> {
    self.inner.shared.transport.listen_addrs()
  }

  /// Registers a notification protocol.
  pub fn register_protocol(
    &self,
    descriptor: ProtocolDescriptor,
  ) -> Result<(), Error> {
    Ok(self.inner.notifications.register(descriptor)?)
  }

  /// Registers a request-response protocol. Requests larger than
  /// `max_request_size` and responses larger than `max_response_size`
  /// are refused.
  pub fn register_request_protocol<H>(
    &self,
    name: &str,
    max_request_size: usize,
    max_response_size: usize,
    handler: H,
  ) -> Result<(), Error>
  where
    H: Fn(&PeerId, Bytes) -> Result<Bytes, protocol::Error>
      + Send
      + Sync
      + 'static,
  {
    Ok(self.inner.requests.register(
      name,
      max_request_size,
      max_response_size,
      Arc::new(handler),
    )?)
  }

  /// Spawns the background tasks and starts connecting to peers.
  ///
  /// Persistent peers become reserved peers, bootnodes are added to
  /// the peer set as regular candidates. Must be called from within
  /// a tokio runtime.
  pub fn start(&self) -> Result<(), Error> {
    let Startup { events, peerset } = self
      .inner
      .startup
      .lock()
      .take()
      .ok_or(Error::AlreadyStarted)?;

    let shared = &self.inner.shared;
    let config = &shared.config;

    for addr in &config.persistent_peers {
      match peer_id_of(addr) {
        Some(peer) => shared.peerset.add_reserved_peer(DEFAULT_SET, peer)?,
        None => warn!("persistent peer address without identity: {addr}"),
      }
    }

    for addr in &config.bootnodes {
      match peer_id_of(addr) {
        Some(peer) => shared.peerset.add_peer(DEFAULT_SET, peer)?,
        None => warn!("bootnode address without identity: {addr}"),
      }
    }

    tokio::spawn(Arc::clone(&self.inner).run(events, peerset));
    tokio::spawn(
      Arc::clone(&shared.peerset)
        .run(config.slot_alloc_interval, shared.shutdown.clone()),
    );
    tokio::spawn(Arc::clone(&shared.reaper).run(shared.shutdown.clone()));

    let discovery = Arc::clone(&self.inner.discovery);
    tokio::spawn(async move {
      if let Err(e) = discovery.advertise().await {
        warn!("failed to advertise local node: {e}");
      }
    });

    info!(peer = %self.local_peer_id(), "network started");
    Ok(())
  }

  /// Floods a message to every connected peer that supports its
  /// protocol. Delivery happens in the background.
  pub fn broadcast(&self, message: &dyn Message) -> Result<(), Error> {
    Ok(self.inner.notifications.broadcast(message)?)
  }

  /// Sends a message to one peer, handshaking first if needed.
  pub async fn send_to(
    &self,
    peer: PeerId,
    message: &dyn Message,
  ) -> Result<(), Error> {
    if self.inner.shared.is_shutting_down() {
      return Err(notifications::Error::Shutdown.into());
    }
    Ok(self.inner.notifications.send_to(peer, message).await?)
  }

  /// Sends a request and waits for the response.
  pub async fn request(
    &self,
    peer: PeerId,
    protocol: &str,
    payload: Bytes,
  ) -> Result<Bytes, Error> {
    Ok(self.inner.requests.request(peer, protocol, payload).await?)
  }

  pub fn report_peer(&self, peer: PeerId, change: ReputationChange) {
    self.inner.shared.report(peer, change);
  }

  pub fn add_peer(&self, peer: PeerId) -> Result<(), Error> {
    Ok(self.inner.shared.peerset.add_peer(DEFAULT_SET, peer)?)
  }

  pub fn remove_peer(&self, peer: PeerId) -> Result<(), Error> {
    Ok(self.inner.shared.peerset.remove_peer(DEFAULT_SET, peer)?)
  }

  pub fn add_reserved_peer(&self, peer: PeerId) -> Result<(), Error> {
    Ok(self.inner.shared.peerset.add_reserved_peer(DEFAULT_SET, peer)?)
  }

  pub fn remove_reserved_peer(&self, peer: PeerId) -> Result<(), Error> {
    let peerset = &self.inner.shared.peerset;
    Ok(peerset.remove_reserved_peer(DEFAULT_SET, peer)?)
  }

  pub fn set_reserved_peers(&self, peers: Vec<PeerId>) -> Result<(), Error> {
    let peerset = &self.inner.shared.peerset;
    Ok(peerset.set_reserved_peers(DEFAULT_SET, peers)?)
  }

  pub fn set_reserved_only(&self, value: bool) -> Result<(), Error> {
    let peerset = &self.inner.shared.peerset;
    Ok(peerset.set_reserved_only(DEFAULT_SET, value)?)
  }

  /// Closes the connection with a peer and frees its slot.
  pub fn disconnect_peer(&self, peer: PeerId) -> Result<(), Error> {
    Ok(self.inner.shared.peerset.disconnect(DEFAULT_SET, peer)?)
  }

  /// Disconnects a peer and refuses its connections until unbanned.
  pub fn ban_peer(&self, peer: PeerId) {
    let shared = &self.inner.shared;
    shared.report(peer, ReputationChange::BAD_PROTOCOL);
    shared.transport.ban_peer(peer);
  }

  pub fn unban_peer(&self, peer: PeerId) {
    self.inner.shared.transport.unban_peer(peer);
  }

  /// Peers admitted by the peer set.
  pub fn peers(&self) -> Vec<PeerId> {
    self.inner.notifications.peers()
  }

  pub fn peer_count(&self) -> usize {
    self.inner.notifications.peer_count()
  }

  /// Connected peers, highest reputation first.
  pub fn sorted_peers(&self) -> Vec<PeerId> {
    let peerset = &self.inner.shared.peerset;
    peerset.sorted_peers(DEFAULT_SET).unwrap_or_default()
  }

  /// Number of peers holding handshake state for a protocol, inbound
  /// and outbound.
  pub fn handshakes(&self, message_type: MessageType) -> (usize, usize) {
    self.inner.notifications.handshakes(message_type)
  }

  pub fn reputation(&self, peer: &PeerId) -> Option<Reputation> {
    self.inner.shared.peerset.reputation(peer)
  }

  /// Traffic counters of all framed streams.
  pub fn bandwidth(&self) -> Arc<Bandwidth> {
    Arc::clone(&self.inner.shared.bandwidth)
  }

  /// Stops all background tasks and closes the transport. Pending
  /// sends fail with a shutdown error.
  pub async fn shutdown(&self) {
    if self.inner.shutdown.send_replace(true) {
      return;
    }
    info!(peer = %self.local_peer_id(), "network shutting down");
    self.inner.shared.transport.close().await;
  }
}

impl Inner {
  /// Dispatches transport events and peer set decisions until shutdown.
  async fn run(
    self: Arc<Self>,
    mut events: UnboundedReceiver<Event>,
    mut decisions: UnboundedReceiver<peerset::Message>,
  ) {
    let mut shutdown = self.shared.shutdown.clone();
    let mut tick = interval(self.shared.config.maintenance_tick_interval);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
      tokio::select! {
        Some(event) = events.recv() => self.inject_event(event),
        Some(decision) = decisions.recv() => self.apply(decision),
        _ = tick.tick() => self.maintenance(),
        _ = shutdown.changed() => break,
      }
    }
    debug!("network runloop stopped");
  }

  fn inject_event(self: &Arc<Self>, event: Event) {
    trace!(?event, "transport event");
    let peerset = &self.shared.peerset;

    match event {
      Event::Connected { peer, endpoint } => {
        let decision = match endpoint {
          Endpoint::Listener => peerset.incoming(DEFAULT_SET, peer),
          Endpoint::Dialer => peerset.outgoing(DEFAULT_SET, peer),
        };

        match decision {
          Ok(peerset::Message::Accept { .. }) => {
            debug!(%peer, ?endpoint, "peer admitted");
            self.notifications.peer_connected(peer);
          }
          Ok(_) => {
            debug!(%peer, ?endpoint, "peer refused");
            self.disconnect(peer);
          }
          Err(e) => warn!(%peer, "peer set error: {e}"),
        }
      }
      Event::Disconnected { peer } => {
        peerset.dropped(DEFAULT_SET, peer);
        self.notifications.peer_disconnected(&peer);
      }
      Event::InboundStream {
        peer,
        protocol,
        stream,
      } => {
        if !self.notifications.is_connected(&peer) {
          debug!(%peer, %protocol, "stream from peer that was not admitted");
        } else if self.notifications.is_registered(&protocol) {
          self.notifications.inbound_stream(peer, &protocol, stream);
        } else if self.requests.is_registered(&protocol) {
          self.requests.inbound_stream(peer, &protocol, stream);
        } else {
          debug!(%peer, %protocol, "stream on unknown protocol");
        }
      }
    }
  }

  fn apply(self: &Arc<Self>, decision: peerset::Message) {
    match decision {
      peerset::Message::Connect { set, peer } => {
        let this = Arc::clone(self);
        tokio::spawn(async move {
          let addrs = this.discovery.resolve(&peer).await;
          if let Err(e) = this.shared.transport.dial(peer, addrs).await {
            debug!(%peer, "dial failed: {e}");
            this.shared.peerset.dropped(set, peer);
          }
        });
      }
      peerset::Message::Drop { peer, .. } => self.disconnect(peer),
      peerset::Message::Accept { .. } | peerset::Message::Reject { .. } => {}
    }
  }

  fn disconnect(&self, peer: PeerId) {
    let transport = Arc::clone(&self.shared.transport);
    tokio::spawn(async move { transport.disconnect(peer).await });
  }

  fn maintenance(self: &Arc<Self>) {
    self.shared.gossip.prune_expired();
    self.notifications.flush_batches();

    let bandwidth = &self.shared.bandwidth;
    gauge!("connected_peers", self.notifications.peer_count() as f64);
    gauge!("pooled_buffers", self.shared.pool.len() as f64);
    gauge!("bandwidth_inbound", bandwidth.total_inbound() as f64);
    gauge!("bandwidth_outbound", bandwidth.total_outbound() as f64);
  }
}
