use {
  crate::cache::nonzero,
  libp2p::PeerId,
  lru::LruCache,
  metrics::increment_counter,
  multihash::Multihash,
  parking_lot::Mutex,
  std::{collections::VecDeque, time::Duration},
  tokio::time::Instant,
};

type RequestLog = LruCache<Multihash, VecDeque<Instant>>;

/// Sliding window limiter for repeated identical requests.
///
/// Tracks, per peer and per request hash, the timestamps of recent
/// requests. Both peers and hashes per peer are kept in LRU caches
/// of fixed capacity, so the memory used by the limiter does not
/// depend on how many requests peers send.
#[derive(Debug)]
pub struct SpamLimiter {
  window: Duration,
  max_requests: usize,
  max_hashes: usize,
  peers: Mutex<LruCache<PeerId, RequestLog>>,
}

impl SpamLimiter {
  pub fn new(
    window: Duration,
    max_requests: usize,
    max_peers: usize,
    max_hashes_per_peer: usize,
  ) -> Self {
    Self {
      window,
      max_requests,
      max_hashes: max_hashes_per_peer,
      peers: Mutex::new(LruCache::new(nonzero(max_peers))),
    }
  }

  /// Records a request from a peer.
  pub fn add_request(&self, peer: &PeerId, hash: &Multihash) {
    let mut peers = self.peers.lock();
    let max_hashes = self.max_hashes;
    let requests =
      peers.get_or_insert_mut(*peer, || LruCache::new(nonzero(max_hashes)));
    let timestamps = requests.get_or_insert_mut(*hash, VecDeque::new);
    timestamps.push_back(Instant::now());
    prune(timestamps, self.window);
  }

  /// Returns true if the peer issued more than the allowed number of
  /// requests with this hash within the window.
  pub fn is_limit_exceeded(&self, peer: &PeerId, hash: &Multihash) -> bool {
    let mut peers = self.peers.lock();
    let Some(requests) = peers.get_mut(peer) else {
      return false;
    };

    let Some(timestamps) = requests.get_mut(hash) else {
      return false;
    };

    prune(timestamps, self.window);
    let exceeded = timestamps.len() > self.max_requests;
    if exceeded {
      increment_counter!("spam_limited_requests");
    }
    exceeded
  }
}

fn prune(timestamps: &mut VecDeque<Instant>, window: Duration) {
  while let Some(oldest) = timestamps.front() {
    if oldest.elapsed() <= window {
      break;
    }
    timestamps.pop_front();
  }
}

#[cfg(test)]
mod tests {
  use {
    super::*,
    multihash::{Code, MultihashDigest},
  };

  fn hash(data: &[u8]) -> Multihash {
    Code::Sha3_256.digest(data)
  }

  #[tokio::test(start_paused = true)]
  async fn limit_trips_after_max_and_resets_after_window() {
    let window = Duration::from_secs(10);
    let limiter = SpamLimiter::new(window, 3, 16, 16);
    let (peer, request) = (PeerId::random(), hash(b"block 1"));

    for _ in 0..3 {
      limiter.add_request(&peer, &request);
      assert!(!limiter.is_limit_exceeded(&peer, &request));
    }

    limiter.add_request(&peer, &request);
    assert!(limiter.is_limit_exceeded(&peer, &request));

    // independent per peer and per hash
    assert!(!limiter.is_limit_exceeded(&PeerId::random(), &request));
    assert!(!limiter.is_limit_exceeded(&peer, &hash(b"block 2")));

    tokio::time::advance(window + Duration::from_millis(1)).await;
    assert!(!limiter.is_limit_exceeded(&peer, &request));
    limiter.add_request(&peer, &request);
    assert!(!limiter.is_limit_exceeded(&peer, &request));
  }

  #[test]
  fn memory_is_bounded_by_capacities() {
    let limiter = SpamLimiter::new(Duration::from_secs(10), 1, 2, 2);
    let peers: Vec<_> = (0..3).map(|_| PeerId::random()).collect();
    let request = hash(b"request");

    for peer in &peers {
      limiter.add_request(peer, &request);
      limiter.add_request(peer, &request);
    }

    // the first peer was evicted and starts from scratch
    assert!(!limiter.is_limit_exceeded(&peers[0], &request));
    assert!(limiter.is_limit_exceeded(&peers[2], &request));

    let peer = peers[2];
    limiter.add_request(&peer, &hash(b"a"));
    limiter.add_request(&peer, &hash(b"b"));
    assert_eq!(limiter.peers.lock().peek(&peer).map(|r| r.len()), Some(2));
  }
}
