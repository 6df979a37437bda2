use {
  lru::LruCache,
  std::{hash::Hash, num::NonZeroUsize, time::Duration},
  tokio::time::Instant,
};

pub(crate) fn nonzero(capacity: usize) -> NonZeroUsize {
  NonZeroUsize::new(capacity.max(1)).expect("capacity is at least one")
}

#[derive(Debug, Clone)]
struct Timestamped<T>(T, Instant);

/// A map whose entries expire after a fixed lifespan.
///
/// Expired entries are treated as absent even before they are
/// physically removed by [`ExpiringMap::prune_expired`]. The map
/// is also bounded in size, once full the oldest entry is evicted
/// to make room for a new one.
///
/// Lookups never refresh an entry, so the eviction order of the
/// backing LRU is also the insertion order.
#[derive(Debug)]
pub struct ExpiringMap<K, V>
where
  K: Eq + Hash,
{
  lifespan: Duration,
  data: LruCache<K, Timestamped<V>>,
}

impl<K: Eq + Hash, V> ExpiringMap<K, V> {
  pub fn new(lifespan: Duration, capacity: usize) -> Self {
    Self {
      lifespan,
      data: LruCache::new(nonzero(capacity)),
    }
  }

  pub fn len(&self) -> usize {
    self.data.len()
  }

  pub fn is_empty(&self) -> bool {
    self.data.is_empty()
  }

  /// Inserts a value and returns the previous one if it
  /// has not expired yet.
  pub fn insert(&mut self, key: K, value: V) -> Option<V> {
    let value = Timestamped(value, Instant::now());
    // pop+put instead of put, so a replaced entry moves to the back
    // of the eviction queue together with its new timestamp.
    let old = self.data.pop(&key);
    self.data.put(key, value);
    match old {
      Some(old) if old.1.elapsed() <= self.lifespan => Some(old.0),
      _ => None,
    }
  }

  pub fn get(&self, key: &K) -> Option<&V> {
    match self.data.peek(key) {
      Some(value) if value.1.elapsed() <= self.lifespan => Some(&value.0),
      _ => None,
    }
  }

  pub fn contains_key(&self, key: &K) -> bool {
    self.get(key).is_some()
  }

  pub fn remove(&mut self, key: &K) -> Option<V> {
    match self.data.pop(key) {
      Some(value) if value.1.elapsed() <= self.lifespan => Some(value.0),
      _ => None,
    }
  }

  pub fn prune_expired(&mut self) {
    while let Some((_, oldest)) = self.data.peek_lru() {
      if oldest.1.elapsed() <= self.lifespan {
        break;
      }
      self.data.pop_lru();
    }
  }
}

#[derive(Debug)]
pub struct ExpiringSet<T>
where
  T: Eq + Hash,
{
  inner: ExpiringMap<T, ()>,
}

impl<T: Eq + Hash> ExpiringSet<T> {
  pub fn new(lifespan: Duration, capacity: usize) -> Self {
    Self {
      inner: ExpiringMap::new(lifespan, capacity),
    }
  }

  pub fn len(&self) -> usize {
    self.inner.len()
  }

  pub fn is_empty(&self) -> bool {
    self.inner.is_empty()
  }

  /// Marks a key as present.
  ///
  /// Returns `true` if the key was already present and not expired,
  /// in that case its original timestamp is preserved.
  pub fn insert(&mut self, key: T) -> bool {
    if self.inner.contains_key(&key) {
      return true;
    }
    self.inner.insert(key, ());
    false
  }

  pub fn contains(&self, key: &T) -> bool {
    self.inner.contains_key(key)
  }

  pub fn remove(&mut self, key: &T) -> bool {
    self.inner.remove(key).is_some()
  }

  pub fn prune_expired(&mut self) {
    self.inner.prune_expired();
  }
}

#[cfg(test)]
mod tests {
  use {super::*, std::time::Duration};

  #[tokio::test(start_paused = true)]
  async fn entries_expire_after_lifespan() {
    let mut set = ExpiringSet::new(Duration::from_secs(10), 16);
    assert!(!set.insert(1));
    assert!(set.insert(1));

    tokio::time::advance(Duration::from_secs(5)).await;
    assert!(set.contains(&1));

    // a hit does not extend the lifespan
    assert!(set.insert(1));
    tokio::time::advance(Duration::from_secs(6)).await;
    assert!(!set.contains(&1));
    assert_eq!(set.len(), 1);

    set.prune_expired();
    assert!(set.is_empty());
    assert!(!set.insert(1));
  }

  #[tokio::test(start_paused = true)]
  async fn prune_keeps_live_entries() {
    let mut map = ExpiringMap::new(Duration::from_secs(10), 16);
    map.insert("old", 1);
    tokio::time::advance(Duration::from_secs(8)).await;
    map.insert("new", 2);
    tokio::time::advance(Duration::from_secs(3)).await;

    map.prune_expired();
    assert_eq!(map.len(), 1);
    assert_eq!(map.get(&"new"), Some(&2));
    assert_eq!(map.get(&"old"), None);
  }

  #[test]
  fn capacity_evicts_oldest() {
    let mut set = ExpiringSet::new(Duration::from_secs(10), 2);
    set.insert(1);
    set.insert(2);
    set.insert(3);
    assert_eq!(set.len(), 2);
    assert!(!set.contains(&1));
    assert!(set.contains(&2));
    assert!(set.contains(&3));
  }
}
