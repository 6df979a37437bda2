use {
  crate::{
    gossip::Gossip,
    peerset::{PeerSet, ReputationChange},
    pool::BufferPool,
    reaper::Reaper,
    stream::{Bandwidth, Substream},
    transport::{BoxedStream, Transport},
    Config,
  },
  libp2p::PeerId,
  std::sync::Arc,
  tokio::sync::watch,
  tracing::debug,
};

/// Capacity of pooled stream buffers. Larger frames still work, their
/// buffers are just not returned to the pool.
const BUFFER_SIZE: usize = 64 * 1024;

/// Components of one network instance shared by all of its tasks.
///
/// Built once when the network is created and handed to every
/// component that needs it, nothing in this crate is global.
pub(crate) struct Shared {
  pub config: Config,
  pub transport: Arc<dyn Transport>,
  pub peerset: Arc<PeerSet>,
  pub pool: Arc<BufferPool>,
  pub bandwidth: Arc<Bandwidth>,
  pub reaper: Arc<Reaper>,
  pub gossip: Gossip,
  pub shutdown: watch::Receiver<bool>,
}

impl Shared {
  pub fn new(
    config: Config,
    transport: Arc<dyn Transport>,
    peerset: Arc<PeerSet>,
    shutdown: watch::Receiver<bool>,
  ) -> Self {
    Self {
      pool: Arc::new(BufferPool::new(config.buffer_pool_size, BUFFER_SIZE)),
      bandwidth: Arc::new(Bandwidth::default()),
      reaper: Arc::new(Reaper::new(config.stream_idle_interval)),
      gossip: Gossip::new(&config),
      config,
      transport,
      peerset,
      shutdown,
    }
  }

  pub fn report(&self, peer: PeerId, change: ReputationChange) {
    debug!(%peer, %change, "reputation change");
    self.peerset.report_peer(peer, change);
  }

  /// Wraps a raw transport stream into a framed one.
  pub fn substream(
    &self,
    peer: PeerId,
    protocol: &str,
    io: BoxedStream,
    max_message_size: usize,
  ) -> Substream {
    Substream::new(
      peer,
      protocol.to_owned(),
      io,
      max_message_size,
      Arc::clone(&self.pool),
      Arc::clone(&self.bandwidth),
    )
  }

  pub fn is_shutting_down(&self) -> bool {
    *self.shutdown.borrow()
  }
}
