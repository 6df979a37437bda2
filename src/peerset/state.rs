use {
  super::{
    reputation::{self, Reputation, ReputationChange, BANNED_THRESHOLD},
    Direction,
    Error,
    SetId,
  },
  libp2p::PeerId,
  std::{
    collections::{HashMap, HashSet},
    time::Duration,
  },
  tokio::time::Instant,
};

/// Peers that reached reputation zero are forgotten once they have
/// been disconnected for this long.
const FORGET_AFTER: Duration = Duration::from_secs(3600);

/// Relation of a known peer to one peer set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Membership {
  /// The peer does not belong to the set.
  NotMember,

  /// The peer belongs to the set but holds no slot.
  NotConnected { last_connected: Instant },

  /// The peer is connected. Regular peers hold an inbound or outbound
  /// slot of the set, reserved peers are connected without one.
  Connected(Direction),
}

#[derive(Debug)]
struct Node {
  reputation: Reputation,
  sets: Vec<Membership>,
}

impl Node {
  fn new(sets: usize) -> Self {
    Self {
      reputation: 0,
      sets: vec![Membership::NotMember; sets],
    }
  }

  fn is_connected(&self) -> bool {
    self
      .sets
      .iter()
      .any(|m| matches!(m, Membership::Connected(_)))
  }
}

/// Configuration of a single peer set.
#[derive(Debug, Clone)]
pub struct SetConfig {
  pub max_inbound: usize,
  pub max_outbound: usize,
  pub reserved_only: bool,
}

#[derive(Debug)]
struct SetInfo {
  num_in: usize,
  num_out: usize,
  max_in: usize,
  max_out: usize,
  reserved_only: bool,
  /// Reserved peers, they never count against `num_in` or `num_out`.
  reserved: HashSet<PeerId>,
}

impl SetInfo {
  fn occupy(&mut self, direction: Direction) {
    match direction {
      Direction::Inbound => self.num_in += 1,
      Direction::Outbound => self.num_out += 1,
    }
  }

  fn release(&mut self, direction: Direction) {
    match direction {
      Direction::Inbound => self.num_in = self.num_in.saturating_sub(1),
      Direction::Outbound => self.num_out = self.num_out.saturating_sub(1),
    }
  }
}

/// Slot accounting and reputation book keeping for all known peers.
///
/// This type has no notion of time passing or of messages, it is the
/// bookkeeping part of [`super::PeerSet`] and is always accessed
/// under its lock.
#[derive(Debug)]
pub struct PeersState {
  nodes: HashMap<PeerId, Node>,
  sets: Vec<SetInfo>,
}

impl PeersState {
  pub fn new(sets: Vec<SetConfig>) -> Self {
    Self {
      nodes: HashMap::new(),
      sets: sets
        .into_iter()
        .map(|c| SetInfo {
          num_in: 0,
          num_out: 0,
          max_in: c.max_inbound,
          max_out: c.max_outbound,
          reserved_only: c.reserved_only,
          reserved: HashSet::new(),
        })
        .collect(),
    }
  }

  pub fn sets(&self) -> usize {
    self.sets.len()
  }

  pub fn check_set(&self, set: SetId) -> Result<(), Error> {
    match set < self.sets.len() {
      true => Ok(()),
      false => Err(Error::UnknownSet(set)),
    }
  }

  pub fn status(&self, set: SetId, peer: &PeerId) -> Membership {
    self
      .nodes
      .get(peer)
      .and_then(|n| n.sets.get(set).copied())
      .unwrap_or(Membership::NotMember)
  }

  pub fn reputation(&self, peer: &PeerId) -> Option<Reputation> {
    self.nodes.get(peer).map(|n| n.reputation)
  }

  pub fn is_banned(&self, peer: &PeerId) -> bool {
    self
      .reputation(peer)
      .map(|r| r < BANNED_THRESHOLD)
      .unwrap_or(false)
  }

  pub fn is_reserved(&self, set: SetId, peer: &PeerId) -> bool {
    self.sets[set].reserved.contains(peer)
  }

  pub fn reserved(&self, set: SetId) -> Vec<PeerId> {
    self.sets[set].reserved.iter().copied().collect()
  }

  pub fn is_reserved_only(&self, set: SetId) -> bool {
    self.sets[set].reserved_only
  }

  pub fn set_reserved_only(&mut self, set: SetId, value: bool) {
    self.sets[set].reserved_only = value;
  }

  /// Makes the peer a member of the set if it is not one already.
  pub fn insert_peer(&mut self, set: SetId, peer: PeerId) {
    let count = self.sets.len();
    let node = self.nodes.entry(peer).or_insert_with(|| Node::new(count));
    if node.sets[set] == Membership::NotMember {
      node.sets[set] = Membership::NotConnected {
        last_connected: Instant::now(),
      };
    }
  }

  /// Removes the peer from the set. Connected peers must be
  /// disconnected first.
  pub fn forget_peer(&mut self, set: SetId, peer: &PeerId) {
    if let Some(node) = self.nodes.get_mut(peer) {
      if matches!(node.sets[set], Membership::NotConnected { .. }) {
        node.sets[set] = Membership::NotMember;
      }

      // keep the reputation of misbehaving peers around
      if node.reputation == 0
        && node.sets.iter().all(|m| *m == Membership::NotMember)
      {
        self.nodes.remove(peer);
      }
    }
  }

  /// Marks the peer as reserved. A peer that is already connected
  /// gives its slot back.
  pub fn add_reserved(&mut self, set: SetId, peer: PeerId) -> bool {
    self.insert_peer(set, peer);
    if !self.sets[set].reserved.insert(peer) {
      return false;
    }

    if let Membership::Connected(direction) = self.status(set, &peer) {
      self.sets[set].release(direction);
    }
    true
  }

  /// Turns a reserved peer into a regular one. A connected peer takes
  /// a slot again, even if that overcommits the set.
  pub fn remove_reserved(&mut self, set: SetId, peer: &PeerId) -> bool {
    if !self.sets[set].reserved.remove(peer) {
      return false;
    }

    if let Membership::Connected(direction) = self.status(set, peer) {
      self.sets[set].occupy(direction);
    }
    true
  }

  /// Applies a reputation change, returns the new value or `None`
  /// if the peer is unknown.
  pub fn add_reputation(
    &mut self,
    peer: &PeerId,
    change: ReputationChange,
  ) -> Option<Reputation> {
    self.nodes.get_mut(peer).map(|node| {
      node.reputation = change.apply(node.reputation);
      node.reputation
    })
  }

  /// Sets in which the peer currently holds a slot.
  pub fn connected_sets(&self, peer: &PeerId) -> Vec<SetId> {
    self
      .nodes
      .get(peer)
      .map(|n| {
        n.sets
          .iter()
          .enumerate()
          .filter(|(_, m)| matches!(m, Membership::Connected(_)))
          .map(|(i, _)| i)
          .collect()
      })
      .unwrap_or_default()
  }

  pub fn has_free_outgoing_slot(&self, set: SetId) -> bool {
    let info = &self.sets[set];
    info.num_out < info.max_out
  }

  pub fn has_free_incoming_slot(&self, set: SetId) -> bool {
    let info = &self.sets[set];
    info.num_in < info.max_in
  }

  pub fn slots(&self, set: SetId) -> (usize, usize) {
    (self.sets[set].num_in, self.sets[set].num_out)
  }

  /// Connects a member of the set that is not connected yet. Regular
  /// peers occupy a slot in the given direction, reserved peers are
  /// connected regardless of the free slots. Returns false if there is
  /// no free slot or the peer is not eligible.
  pub fn try_connect(
    &mut self,
    set: SetId,
    peer: &PeerId,
    direction: Direction,
  ) -> bool {
    if !matches!(self.status(set, peer), Membership::NotConnected { .. }) {
      return false;
    }

    if !self.is_reserved(set, peer) {
      let free = match direction {
        Direction::Inbound => self.has_free_incoming_slot(set),
        Direction::Outbound => self.has_free_outgoing_slot(set),
      };

      if !free {
        return false;
      }

      self.sets[set].occupy(direction);
    }

    if let Some(node) = self.nodes.get_mut(peer) {
      node.sets[set] = Membership::Connected(direction);
    }

    true
  }

  /// Disconnects a peer, releasing its slot unless it is reserved.
  /// Returns false if the peer was not connected in the set.
  pub fn disconnect(&mut self, set: SetId, peer: &PeerId) -> bool {
    let direction = match self.status(set, peer) {
      Membership::Connected(direction) => direction,
      _ => return false,
    };

    if !self.is_reserved(set, peer) {
      self.sets[set].release(direction);
    }

    if let Some(node) = self.nodes.get_mut(peer) {
      node.sets[set] = Membership::NotConnected {
        last_connected: Instant::now(),
      };
    }

    true
  }

  /// Connected peers of the set, highest reputation first.
  pub fn sorted_peers(&self, set: SetId) -> Vec<PeerId> {
    let mut peers: Vec<_> = self
      .nodes
      .iter()
      .filter(|(_, n)| matches!(n.sets[set], Membership::Connected(_)))
      .map(|(id, n)| (*id, n.reputation))
      .collect();
    peers.sort_by(|a, b| b.1.cmp(&a.1));
    peers.into_iter().map(|(id, _)| id).collect()
  }

  /// The member of the set with the highest reputation that is not
  /// connected and not banned.
  pub fn highest_not_connected(&self, set: SetId) -> Option<PeerId> {
    self
      .nodes
      .iter()
      .filter(|(_, n)| matches!(n.sets[set], Membership::NotConnected { .. }))
      .filter(|(_, n)| n.reputation >= BANNED_THRESHOLD)
      .max_by_key(|(_, n)| n.reputation)
      .map(|(id, _)| *id)
  }

  /// The connected peer with the lowest reputation in the given
  /// direction that may be evicted to make room for a reserved peer.
  pub fn lowest_evictable(
    &self,
    set: SetId,
    direction: Direction,
  ) -> Option<PeerId> {
    let reserved = &self.sets[set].reserved;
    self
      .nodes
      .iter()
      .filter(|(_, n)| n.sets[set] == Membership::Connected(direction))
      .filter(|(id, _)| !reserved.contains(id))
      .min_by_key(|(_, n)| n.reputation)
      .map(|(id, _)| *id)
  }

  /// Applies `seconds` of reputation decay to every known peer and
  /// forgets peers that are neutral and long gone.
  pub fn decay(&mut self, seconds: u64) {
    if seconds == 0 {
      return;
    }

    for node in self.nodes.values_mut() {
      node.reputation = reputation::decay_by(node.reputation, seconds);
    }

    let now = Instant::now();
    let sets = &self.sets;
    self.nodes.retain(|peer, node| {
      if node.reputation != 0 || node.is_connected() {
        return true;
      }

      if sets.iter().any(|s| s.reserved.contains(peer)) {
        return true;
      }

      node.sets.iter().any(|m| match m {
        Membership::NotConnected { last_connected } => {
          now.duration_since(*last_connected) < FORGET_AFTER
        }
        _ => false,
      })
    });
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn state(max_inbound: usize, max_outbound: usize) -> PeersState {
    PeersState::new(vec![SetConfig {
      max_inbound,
      max_outbound,
      reserved_only: false,
    }])
  }

  #[test]
  fn slots_are_bounded_per_direction() {
    let mut state = state(1, 1);
    let (a, b, c) = (PeerId::random(), PeerId::random(), PeerId::random());
    for peer in [a, b, c] {
      state.insert_peer(0, peer);
    }

    assert!(state.try_connect(0, &a, Direction::Inbound));
    assert!(!state.try_connect(0, &b, Direction::Inbound));
    assert!(state.try_connect(0, &b, Direction::Outbound));
    assert!(!state.try_connect(0, &c, Direction::Outbound));
    assert_eq!(state.slots(0), (1, 1));

    // already connected peers do not take a second slot
    assert!(!state.try_connect(0, &a, Direction::Outbound));

    assert!(state.disconnect(0, &a));
    assert!(!state.disconnect(0, &a));
    assert_eq!(state.slots(0), (0, 1));
    assert!(state.try_connect(0, &c, Direction::Inbound));
  }

  #[test]
  fn highest_not_connected_skips_banned() {
    let mut state = state(0, 2);
    let (good, bad) = (PeerId::random(), PeerId::random());
    state.insert_peer(0, good);
    state.insert_peer(0, bad);
    state.add_reputation(&good, ReputationChange::BAD_MESSAGE);
    state.add_reputation(&bad, ReputationChange::GENESIS_MISMATCH);

    assert_eq!(state.highest_not_connected(0), Some(good));
    assert!(state.try_connect(0, &good, Direction::Outbound));
    assert_eq!(state.highest_not_connected(0), None);
  }

  #[test]
  fn reserved_peers_are_never_evictable() {
    let mut state = state(2, 0);
    let (reserved, regular) = (PeerId::random(), PeerId::random());
    state.add_reserved(0, reserved);
    state.insert_peer(0, regular);
    state.add_reputation(&reserved, ReputationChange::BAD_MESSAGE);
    assert!(state.try_connect(0, &reserved, Direction::Inbound));
    assert!(state.try_connect(0, &regular, Direction::Inbound));

    assert_eq!(state.lowest_evictable(0, Direction::Inbound), Some(regular));
    state.disconnect(0, &regular);
    assert_eq!(state.lowest_evictable(0, Direction::Inbound), None);
  }

  #[test]
  fn reserved_peers_hold_no_slots() {
    let mut state = state(1, 0);
    let (reserved, regular, late) =
      (PeerId::random(), PeerId::random(), PeerId::random());
    state.add_reserved(0, reserved);
    state.insert_peer(0, regular);

    assert!(state.try_connect(0, &reserved, Direction::Outbound));
    assert!(state.try_connect(0, &regular, Direction::Inbound));
    assert_eq!(state.slots(0), (1, 0));

    assert!(state.disconnect(0, &reserved));
    assert_eq!(state.slots(0), (1, 0));

    // a connected peer changing role moves in and out of the counters
    state.add_reserved(0, late);
    assert!(state.try_connect(0, &late, Direction::Inbound));
    assert!(state.remove_reserved(0, &late));
    assert_eq!(state.slots(0), (2, 0));
    assert!(state.add_reserved(0, regular));
    assert_eq!(state.slots(0), (1, 0));
    assert!(!state.add_reserved(0, regular));
    assert_eq!(state.slots(0), (1, 0));
  }

  #[tokio::test(start_paused = true)]
  async fn neutral_peers_are_forgotten_after_an_hour() {
    let mut state = state(1, 1);
    let (neutral, penalized) = (PeerId::random(), PeerId::random());
    state.insert_peer(0, neutral);
    state.insert_peer(0, penalized);
    state.add_reputation(&penalized, ReputationChange::GENESIS_MISMATCH);

    state.decay(1);
    assert!(state.reputation(&neutral).is_some());

    tokio::time::advance(FORGET_AFTER + Duration::from_secs(1)).await;
    state.decay(1);
    assert!(state.reputation(&neutral).is_none());
    assert!(state.reputation(&penalized).is_some());
  }
}
