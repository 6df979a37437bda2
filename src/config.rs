use {
  libp2p::Multiaddr,
  std::time::Duration,
  thiserror::Error,
};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum Error {
  #[error("Invalid configuration: {0}")]
  Invalid(&'static str),
}

/// Network wide configuration shared by all notification protocols,
/// the peer set and the resource management layer.
#[derive(Debug, Clone)]
pub struct Config {
  /// Local network addresses this node will listen on for incoming
  /// connections. Only used by transports that listen on sockets.
  pub listen_addrs: Vec<Multiaddr>,

  /// Addresses of peers dialed on startup. Each address must end with
  /// a `/p2p/<peer id>` component, those peers are added to the peer
  /// set as regular (evictable) peers.
  pub bootnodes: Vec<Multiaddr>,

  /// Addresses of peers this node should always stay connected to.
  /// They are added to the peer set as reserved peers and never
  /// evicted to make room for other peers.
  pub persistent_peers: Vec<Multiaddr>,

  /// When set, only reserved peers are accepted and dialed.
  pub reserved_only: bool,

  /// Maximum number of slot occupying peers that connected to us.
  pub max_inbound: usize,

  /// Maximum number of slot occupying peers that we have dialed.
  pub max_outbound: usize,

  /// How often the peer set tries to fill free outbound slots with
  /// known but not connected peers.
  pub slot_alloc_interval: Duration,

  /// How long an outbound handshake waits for the remote handshake
  /// before the send attempt is considered failed.
  pub handshake_timeout: Duration,

  /// How long identical messages are ignored.
  ///
  /// This single value drives both sides of deduplication: messages
  /// that were already seen are not processed again when received, and
  /// messages already sent to a peer are not sent to it again. `None`
  /// turns deduplication off entirely.
  ///
  /// Note: Some higher level protocols might need to see duplicate
  /// values, they should be registered as non-deduplicable.
  pub dedupe_interval: Option<Duration>,

  /// Upper bound on the number of (peer, message) entries remembered
  /// by the outbound message cache.
  pub message_cache_capacity: usize,

  /// Upper bound on the number of message hashes remembered by
  /// the gossip engine.
  pub seen_cache_capacity: usize,

  /// Inbound streams with no activity for longer than this interval
  /// are closed. This is also the interval of the idle stream sweeper.
  pub stream_idle_interval: Duration,

  /// Sliding window used by the request spam limiter.
  pub spam_window: Duration,

  /// Maximum number of identical requests a peer may issue within
  /// [`Config::spam_window`].
  pub spam_max_requests: usize,

  /// Maximum number of peers tracked by the spam limiter.
  pub spam_max_peers: usize,

  /// Maximum number of distinct request hashes tracked per peer by
  /// the spam limiter.
  pub spam_max_hashes_per_peer: usize,

  /// Number of reusable stream buffers kept around.
  pub buffer_pool_size: usize,

  /// Number of messages collected by protocols with a batch handler
  /// before the batch is processed.
  pub batch_size: usize,

  /// How long a request-response exchange may take.
  pub request_timeout: Duration,

  /// This is a periodic event that triggers cache pruning and telemetry.
  pub maintenance_tick_interval: Duration,

  /// Maximum size of a message for protocols that do not specify
  /// their own limit.
  pub max_message_size: usize,
}

impl Config {
  /// Rejects configurations the network cannot operate with.
  ///
  /// Called when the network is instantiated, so malformed values fail
  /// at startup instead of misbehaving later.
  pub fn validate(&self) -> Result<(), Error> {
    if self.max_inbound == 0 && self.max_outbound == 0 && !self.reserved_only
    {
      return Err(Error::Invalid("no inbound nor outbound slots"));
    }

    if self.handshake_timeout.is_zero() {
      return Err(Error::Invalid("handshake timeout is zero"));
    }

    if self.request_timeout.is_zero() {
      return Err(Error::Invalid("request timeout is zero"));
    }

    if self.stream_idle_interval.is_zero()
      || self.slot_alloc_interval.is_zero()
      || self.maintenance_tick_interval.is_zero()
    {
      return Err(Error::Invalid("periodic interval is zero"));
    }

    if matches!(self.dedupe_interval, Some(ttl) if ttl.is_zero()) {
      return Err(Error::Invalid("dedupe interval is zero"));
    }

    if self.message_cache_capacity == 0
      || self.seen_cache_capacity == 0
      || self.spam_max_peers == 0
      || self.spam_max_hashes_per_peer == 0
    {
      return Err(Error::Invalid("cache capacity is zero"));
    }

    if self.spam_window.is_zero() || self.spam_max_requests == 0 {
      return Err(Error::Invalid("spam limiter window or limit is zero"));
    }

    if self.batch_size == 0 {
      return Err(Error::Invalid("batch size is zero"));
    }

    if self.max_message_size == 0 {
      return Err(Error::Invalid("max message size is zero"));
    }

    Ok(())
  }

  /// Total number of peers this node may hold slots for.
  pub fn max_peers(&self) -> usize {
    self.max_inbound + self.max_outbound
  }
}

impl Default for Config {
  fn default() -> Self {
    Self {
      listen_addrs: vec![
        "/ip4/0.0.0.0/tcp/30333".parse().unwrap(),
        "/ip6/::/tcp/30333".parse().unwrap(),
      ],
      bootnodes: vec![],
      persistent_peers: vec![],
      reserved_only: false,
      max_inbound: 25,
      max_outbound: 25,
      slot_alloc_interval: Duration::from_secs(2),
      handshake_timeout: Duration::from_secs(10),
      dedupe_interval: Some(Duration::from_secs(300)), // 5 minutes
      message_cache_capacity: 64 * 1024,
      seen_cache_capacity: 64 * 1024,
      stream_idle_interval: Duration::from_secs(60),
      spam_window: Duration::from_secs(10),
      spam_max_requests: 5,
      spam_max_peers: 1000,
      spam_max_hashes_per_peer: 100,
      buffer_pool_size: 128,
      batch_size: 100,
      request_timeout: Duration::from_secs(20),
      maintenance_tick_interval: Duration::from_secs(5),
      max_message_size: 16 * 1024 * 1024, // 16MB
    }
  }
}
