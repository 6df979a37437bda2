//! Flood-fill bookkeeping.
//!
//! Two questions are answered here: has this node already seen a
//! message, and has a message already been sent to a given peer.
//! Both answers come from expiring sets controlled by the same
//! `dedupe_interval` setting. Per-peer forwarding queues make sure
//! that a slow peer only delays messages destined to itself.

use {
  crate::{cache::ExpiringSet, Config},
  bytes::Bytes,
  dashmap::DashMap,
  libp2p::PeerId,
  metrics::{gauge, increment_counter},
  multihash::{Code, Multihash, MultihashDigest},
  parking_lot::Mutex,
  std::collections::VecDeque,
};

/// Maximum number of messages waiting to be forwarded to one peer.
/// Once reached, the oldest pending message is dropped.
pub const MAX_PENDING: usize = 1024;

/// Seen-message and sent-message caches.
#[derive(Debug)]
pub struct Gossip {
  /// Hashes of messages received by this node.
  seen: Option<Mutex<ExpiringSet<Multihash>>>,

  /// Hashes of (peer, message) pairs already sent.
  sent: Option<Mutex<ExpiringSet<Multihash>>>,
}

impl Gossip {
  pub fn new(config: &Config) -> Self {
    Self {
      seen: config.dedupe_interval.map(|ttl| {
        Mutex::new(ExpiringSet::new(ttl, config.seen_cache_capacity))
      }),
      sent: config.dedupe_interval.map(|ttl| {
        Mutex::new(ExpiringSet::new(ttl, config.message_cache_capacity))
      }),
    }
  }

  /// Tests and marks a message as seen.
  ///
  /// The first call for a hash returns `false`, later calls return
  /// `true` until the entry expires. Always `false` when
  /// de-duplication is turned off.
  pub fn has_seen(&self, hash: &Multihash) -> bool {
    match &self.seen {
      Some(seen) => seen.lock().insert(*hash),
      None => false,
    }
  }

  /// Tests and marks a message as sent to a peer. Returns `false` if
  /// it was already sent recently and should not be sent again.
  pub fn should_send(&self, peer: &PeerId, hash: &Multihash) -> bool {
    match &self.sent {
      Some(sent) => !sent.lock().insert(cache_key(peer, hash)),
      None => true,
    }
  }

  /// Records that a peer already holds a message, typically because
  /// it sent the message to us. It is never sent back to that peer.
  pub fn mark_held(&self, peer: &PeerId, hash: &Multihash) {
    if let Some(sent) = &self.sent {
      sent.lock().insert(cache_key(peer, hash));
    }
  }

  /// Undoes [`Gossip::should_send`] after a failed delivery.
  pub fn forget_sent(&self, peer: &PeerId, hash: &Multihash) {
    if let Some(sent) = &self.sent {
      sent.lock().remove(&cache_key(peer, hash));
    }
  }

  pub fn prune_expired(&self) {
    if let Some(seen) = &self.seen {
      let mut seen = seen.lock();
      seen.prune_expired();
      gauge!("gossip_seen_messages", seen.len() as f64);
    }

    if let Some(sent) = &self.sent {
      let mut sent = sent.lock();
      sent.prune_expired();
      gauge!("gossip_sent_messages", sent.len() as f64);
    }
  }
}

fn cache_key(peer: &PeerId, hash: &Multihash) -> Multihash {
  let mut bytes = peer.to_bytes();
  bytes.extend_from_slice(&hash.to_bytes());
  Code::Sha3_256.digest(&bytes)
}

/// A message waiting to be written to a peer.
#[derive(Debug, Clone)]
pub struct Outbound {
  pub payload: Bytes,
  pub hash: Multihash,
}

#[derive(Debug)]
enum ForwardState {
  /// No forwarding task is running for the peer.
  Idle,

  /// A forwarding task is writing to the peer, further messages
  /// wait in the queue.
  Busy(VecDeque<Outbound>),
}

/// Per-peer forwarding queues of one protocol.
///
/// At most one forwarding task runs per peer. Whoever moves a peer
/// from idle to busy is responsible for spawning it, the task then
/// drains the queue with [`Forwarders::next`] until it is empty.
#[derive(Debug, Default)]
pub struct Forwarders {
  peers: DashMap<PeerId, ForwardState>,
}

impl Forwarders {
  pub fn new() -> Self {
    Self::default()
  }

  /// Queues a message for a peer. Returns the message back if the
  /// peer was idle, in which case the caller has to start forwarding.
  pub fn enqueue(&self, peer: PeerId, message: Outbound) -> Option<Outbound> {
    let mut state = self.peers.entry(peer).or_insert(ForwardState::Idle);
    match &mut *state {
      ForwardState::Idle => {
        *state = ForwardState::Busy(VecDeque::new());
        Some(message)
      }
      ForwardState::Busy(pending) => {
        if pending.len() >= MAX_PENDING {
          increment_counter!("gossip_dropped_messages");
          pending.pop_front();
        }
        pending.push_back(message);
        None
      }
    }
  }

  /// Next message for a busy peer, marks the peer idle once its queue
  /// is empty.
  pub fn next(&self, peer: &PeerId) -> Option<Outbound> {
    let mut state = self.peers.get_mut(peer)?;
    match &mut *state {
      ForwardState::Busy(pending) => match pending.pop_front() {
        Some(message) => Some(message),
        None => {
          *state = ForwardState::Idle;
          None
        }
      },
      ForwardState::Idle => None,
    }
  }

  /// Drops everything queued for a peer.
  pub fn remove(&self, peer: &PeerId) {
    self.peers.remove(peer);
  }
}
