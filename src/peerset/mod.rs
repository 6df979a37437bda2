//! Reputation based admission control.
//!
//! The peer set decides which peer identities occupy the bounded set
//! of inbound and outbound connection slots. It never touches the
//! transport itself, instead it emits [`Message`]s that the network
//! runloop turns into dials and disconnects.

mod reputation;
mod state;

pub use {
  reputation::{
    decay,
    Reputation,
    ReputationChange,
    BANNED_THRESHOLD,
  },
  state::{Membership, SetConfig},
};
use {
  libp2p::PeerId,
  metrics::{gauge, increment_counter},
  parking_lot::Mutex,
  state::PeersState,
  std::{sync::Arc, time::Duration},
  thiserror::Error,
  tokio::{
    sync::{
      mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender},
      watch,
    },
    time::{interval, Instant, MissedTickBehavior},
  },
  tracing::{debug, warn},
};

/// Index of a logical peer set.
pub type SetId = usize;

/// The peer set used by all notification protocols.
pub const DEFAULT_SET: SetId = 0;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum Error {
  #[error("Unknown peer set {0}")]
  UnknownSet(SetId),

  #[error("Peer {0} is not a reserved peer")]
  NotReserved(PeerId),

  #[error("Peer {0} is reserved and cannot be removed")]
  ReservedPeer(PeerId),
}

/// Direction of a connection relative to the local node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
  /// The remote peer dialed us.
  Inbound,
  /// We dialed the remote peer.
  Outbound,
}

/// Decisions emitted by the peer set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Message {
  /// Open a connection to the peer.
  Connect { set: SetId, peer: PeerId },

  /// Close the connection to the peer, or cancel a pending dial.
  Drop { set: SetId, peer: PeerId },

  /// Keep an established connection.
  Accept { set: SetId, peer: PeerId },

  /// Refuse an established connection.
  Reject { set: SetId, peer: PeerId },
}

struct Inner {
  state: PeersState,
  last_decay: Instant,
}

impl Inner {
  /// Applies reputation decay for every whole second elapsed since
  /// the last update. Reputations are always brought up to date
  /// before they are read or modified.
  fn update_time(&mut self) {
    let elapsed = self.last_decay.elapsed().as_secs();
    if elapsed > 0 {
      self.last_decay += Duration::from_secs(elapsed);
      self.state.decay(elapsed);
    }
  }
}

/// Shared handle to the reputation ledger and slot assignment.
///
/// All operations are synchronous and take a short lived lock,
/// the resulting decisions are delivered in order on the channel
/// returned by [`PeerSet::new`].
pub struct PeerSet {
  inner: Mutex<Inner>,
  messages: UnboundedSender<Message>,
}

impl PeerSet {
  pub fn new(
    sets: Vec<SetConfig>,
  ) -> (Arc<Self>, UnboundedReceiver<Message>) {
    let (tx, rx) = unbounded_channel();
    let peerset = Self {
      inner: Mutex::new(Inner {
        state: PeersState::new(sets),
        last_decay: Instant::now(),
      }),
      messages: tx,
    };
    (Arc::new(peerset), rx)
  }

  fn emit(&self, message: Message) {
    debug!(?message, "peerset");
    // receiver goes away only during shutdown
    let _ = self.messages.send(message);
  }

  /// Applies a reputation change to a known peer.
  ///
  /// Peers whose reputation drops below [`BANNED_THRESHOLD`] lose all
  /// their slots and are refused until their reputation decays back
  /// above it. Reports about unknown peers are ignored.
  pub fn report_peer(&self, peer: PeerId, change: ReputationChange) {
    increment_counter!("reputation_reports", "reason" => change.reason);

    let mut inner = self.inner.lock();
    inner.update_time();

    let Some(reputation) = inner.state.add_reputation(&peer, change) else {
      debug!(%peer, %change, "reputation change for unknown peer");
      return;
    };

    debug!(%peer, %change, reputation, "reputation changed");
    if reputation >= BANNED_THRESHOLD {
      return;
    }

    for set in inner.state.connected_sets(&peer) {
      warn!(%peer, reputation, "banning peer");
      increment_counter!("peers_banned");
      inner.state.disconnect(set, &peer);
      self.emit(Message::Drop { set, peer });
      self.alloc_slots_locked(&mut inner, set);
    }
  }

  /// Adds a regular peer to the set, it will be dialed when an
  /// outbound slot is available.
  pub fn add_peer(&self, set: SetId, peer: PeerId) -> Result<(), Error> {
    let mut inner = self.inner.lock();
    inner.state.check_set(set)?;
    if inner.state.status(set, &peer) != Membership::NotMember {
      return Ok(());
    }

    inner.state.insert_peer(set, peer);
    self.alloc_slots_locked(&mut inner, set);
    Ok(())
  }

  /// Removes a regular peer from the set, disconnecting it if needed.
  pub fn remove_peer(&self, set: SetId, peer: PeerId) -> Result<(), Error> {
    let mut inner = self.inner.lock();
    inner.state.check_set(set)?;
    if inner.state.is_reserved(set, &peer) {
      return Err(Error::ReservedPeer(peer));
    }

    if inner.state.disconnect(set, &peer) {
      self.emit(Message::Drop { set, peer });
    }
    inner.state.forget_peer(set, &peer);
    Ok(())
  }

  /// Adds a peer that should always be connected. Reserved peers are
  /// dialed right away, hold no slot and are never evicted.
  pub fn add_reserved_peer(
    &self,
    set: SetId,
    peer: PeerId,
  ) -> Result<(), Error> {
    let mut inner = self.inner.lock();
    inner.state.check_set(set)?;
    if inner.state.add_reserved(set, peer) {
      debug!(%peer, set, "reserved peer added");
      self.alloc_slots_locked(&mut inner, set);
    }
    Ok(())
  }

  /// Turns a reserved peer back into a regular one. Fails if the peer
  /// is not reserved.
  pub fn remove_reserved_peer(
    &self,
    set: SetId,
    peer: PeerId,
  ) -> Result<(), Error> {
    let mut inner = self.inner.lock();
    inner.state.check_set(set)?;
    if !inner.state.remove_reserved(set, &peer) {
      return Err(Error::NotReserved(peer));
    }

    // in reserved only mode the peer has no right to its slot anymore
    if inner.state.is_reserved_only(set) && inner.state.disconnect(set, &peer)
    {
      self.emit(Message::Drop { set, peer });
    }
    Ok(())
  }

  /// Replaces the whole reserved set.
  pub fn set_reserved_peers(
    &self,
    set: SetId,
    peers: impl IntoIterator<Item = PeerId>,
  ) -> Result<(), Error> {
    let peers: Vec<_> = peers.into_iter().collect();
    let current = {
      let inner = self.inner.lock();
      inner.state.check_set(set)?;
      inner.state.reserved(set)
    };

    for peer in current.iter().filter(|p| !peers.contains(p)) {
      self.remove_reserved_peer(set, *peer)?;
    }

    for peer in peers.into_iter().filter(|p| !current.contains(p)) {
      self.add_reserved_peer(set, peer)?;
    }

    Ok(())
  }

  /// Switches reserved only mode. Enabling it drops all connected
  /// non-reserved peers.
  pub fn set_reserved_only(
    &self,
    set: SetId,
    value: bool,
  ) -> Result<(), Error> {
    let mut inner = self.inner.lock();
    inner.state.check_set(set)?;
    inner.state.set_reserved_only(set, value);

    if value {
      for peer in inner.state.sorted_peers(set) {
        if !inner.state.is_reserved(set, &peer) {
          inner.state.disconnect(set, &peer);
          self.emit(Message::Drop { set, peer });
        }
      }
    } else {
      self.alloc_slots_locked(&mut inner, set);
    }
    Ok(())
  }

  /// Decides on a connection established by a remote peer.
  ///
  /// Returns [`Message::Accept`] if the peer may occupy an inbound slot
  /// (or already holds one) and [`Message::Reject`] otherwise. Reserved
  /// peers are always accepted, one arriving at a full set evicts the
  /// lowest reputation regular peer and the eviction is delivered as a
  /// [`Message::Drop`].
  pub fn incoming(&self, set: SetId, peer: PeerId) -> Result<Message, Error> {
    self.connected(set, peer, Direction::Inbound)
  }

  /// Decides on a connection we have established.
  ///
  /// Connections requested by the peer set itself already hold their
  /// slot and are always accepted, other dials are admitted like
  /// inbound connections but against outbound slots.
  pub fn outgoing(&self, set: SetId, peer: PeerId) -> Result<Message, Error> {
    self.connected(set, peer, Direction::Outbound)
  }

  fn connected(
    &self,
    set: SetId,
    peer: PeerId,
    direction: Direction,
  ) -> Result<Message, Error> {
    let mut inner = self.inner.lock();
    inner.update_time();
    inner.state.check_set(set)?;

    let reserved = inner.state.is_reserved(set, &peer);
    if inner.state.is_reserved_only(set) && !reserved {
      debug!(%peer, "rejecting non-reserved peer");
      return Ok(Message::Reject { set, peer });
    }

    if let Membership::Connected(_) = inner.state.status(set, &peer) {
      return Ok(Message::Accept { set, peer });
    }

    inner.state.insert_peer(set, peer);

    if inner.state.is_banned(&peer) {
      debug!(%peer, "rejecting banned peer");
      increment_counter!("peers_rejected", "reason" => "banned");
      return Ok(Message::Reject { set, peer });
    }

    if reserved {
      // reserved peers hold no slot, they are admitted even if nothing
      // can make room for them
      let full = match direction {
        Direction::Inbound => !inner.state.has_free_incoming_slot(set),
        Direction::Outbound => !inner.state.has_free_outgoing_slot(set),
      };

      if full {
        if let Some(evicted) = inner.state.lowest_evictable(set, direction) {
          debug!(%evicted, reserved = %peer, "evicting peer for reserved peer");
          increment_counter!("peers_evicted");
          inner.state.disconnect(set, &evicted);
          self.emit(Message::Drop {
            set,
            peer: evicted,
          });
        }
      }
    }

    if inner.state.try_connect(set, &peer, direction) {
      return Ok(Message::Accept { set, peer });
    }

    debug!(%peer, ?direction, "no slots available");
    increment_counter!("peers_rejected", "reason" => "slots");
    Ok(Message::Reject { set, peer })
  }

  /// Local decision to disconnect from a peer.
  ///
  /// The peer is penalized with [`ReputationChange::DISCONNECT`] and a
  /// [`Message::Drop`] is emitted. Disconnecting a peer that is not
  /// connected does nothing.
  pub fn disconnect(&self, set: SetId, peer: PeerId) -> Result<(), Error> {
    let mut inner = self.inner.lock();
    inner.update_time();
    inner.state.check_set(set)?;

    if !inner.state.disconnect(set, &peer) {
      return Ok(());
    }

    inner
      .state
      .add_reputation(&peer, ReputationChange::DISCONNECT);
    self.emit(Message::Drop { set, peer });
    Ok(())
  }

  /// Notification that the connection with a peer is gone, or that a
  /// dial requested with [`Message::Connect`] failed. Frees the slot
  /// without any reputation change.
  pub fn dropped(&self, set: SetId, peer: PeerId) {
    let mut inner = self.inner.lock();
    if set < inner.state.sets() && inner.state.disconnect(set, &peer) {
      debug!(%peer, set, "slot released");
    }
  }

  /// Connected peers of the set, highest reputation first.
  pub fn sorted_peers(&self, set: SetId) -> Result<Vec<PeerId>, Error> {
    let mut inner = self.inner.lock();
    inner.update_time();
    inner.state.check_set(set)?;
    Ok(inner.state.sorted_peers(set))
  }

  pub fn reputation(&self, peer: &PeerId) -> Option<Reputation> {
    let mut inner = self.inner.lock();
    inner.update_time();
    inner.state.reputation(peer)
  }

  pub fn is_reserved(&self, set: SetId, peer: &PeerId) -> bool {
    let inner = self.inner.lock();
    set < inner.state.sets() && inner.state.is_reserved(set, peer)
  }

  /// Dials every reserved peer that is not connected, then fills free
  /// outbound slots with the best regular peers.
  pub fn alloc_slots(&self, set: SetId) -> Result<(), Error> {
    let mut inner = self.inner.lock();
    inner.state.check_set(set)?;
    self.alloc_slots_locked(&mut inner, set);
    Ok(())
  }

  fn alloc_slots_locked(&self, inner: &mut Inner, set: SetId) {
    inner.update_time();
    let state = &mut inner.state;

    for peer in state.reserved(set) {
      if matches!(state.status(set, &peer), Membership::Connected(_)) {
        continue;
      }

      state.insert_peer(set, peer);
      if state.is_banned(&peer) {
        warn!(%peer, "reserved peer is banned");
        continue;
      }

      if state.try_connect(set, &peer, Direction::Outbound) {
        self.emit(Message::Connect { set, peer });
      }
    }

    // nothing more to do if we're in reserved mode.
    if state.is_reserved_only(set) {
      return;
    }

    while state.has_free_outgoing_slot(set) {
      let Some(peer) = state.highest_not_connected(set) else {
        break;
      };

      if !state.try_connect(set, &peer, Direction::Outbound) {
        break;
      }

      self.emit(Message::Connect { set, peer });
    }
  }

  /// Periodic maintenance: decays reputations and fills free slots.
  pub fn tick(&self) {
    let mut inner = self.inner.lock();
    for set in 0..inner.state.sets() {
      self.alloc_slots_locked(&mut inner, set);
      let (num_in, num_out) = inner.state.slots(set);
      let label = set.to_string();
      gauge!("peerset_inbound_slots", num_in as f64, "set" => label.clone());
      gauge!("peerset_outbound_slots", num_out as f64, "set" => label);
    }
  }

  /// Drives [`PeerSet::tick`] until shutdown is signalled.
  pub async fn run(
    self: Arc<Self>,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
  ) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
      tokio::select! {
        _ = ticker.tick() => self.tick(),
        _ = shutdown.changed() => break,
      }
    }
    debug!("peerset ticker stopped");
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn peerset(
    max_inbound: usize,
    max_outbound: usize,
  ) -> (Arc<PeerSet>, UnboundedReceiver<Message>) {
    PeerSet::new(vec![SetConfig {
      max_inbound,
      max_outbound,
      reserved_only: false,
    }])
  }

  fn drain(rx: &mut UnboundedReceiver<Message>) -> Vec<Message> {
    let mut out = vec![];
    while let Ok(message) = rx.try_recv() {
      out.push(message);
    }
    out
  }

  #[test]
  fn fourth_peer_rejected_unless_reserved() {
    let (peerset, mut rx) = peerset(3, 0);
    let peers: Vec<_> = (0..3).map(|_| PeerId::random()).collect();
    for peer in &peers {
      assert_eq!(
        peerset.incoming(DEFAULT_SET, *peer),
        Ok(Message::Accept {
          set: DEFAULT_SET,
          peer: *peer
        })
      );
    }

    let fourth = PeerId::random();
    assert_eq!(
      peerset.incoming(DEFAULT_SET, fourth),
      Ok(Message::Reject {
        set: DEFAULT_SET,
        peer: fourth
      })
    );

    // make peers[1] the least reputable one
    peerset.report_peer(peers[0], ReputationChange::GOOD_TRANSACTION);
    peerset.report_peer(peers[1], ReputationChange::BAD_MESSAGE);

    // the dial of the reserved peer fails, then it dials us
    let reserved = PeerId::random();
    peerset.add_reserved_peer(DEFAULT_SET, reserved).unwrap();
    assert_eq!(drain(&mut rx), vec![Message::Connect {
      set: DEFAULT_SET,
      peer: reserved
    }]);
    peerset.dropped(DEFAULT_SET, reserved);

    assert_eq!(
      peerset.incoming(DEFAULT_SET, reserved),
      Ok(Message::Accept {
        set: DEFAULT_SET,
        peer: reserved
      })
    );

    assert_eq!(drain(&mut rx), vec![Message::Drop {
      set: DEFAULT_SET,
      peer: peers[1]
    }]);

    let sorted = peerset.sorted_peers(DEFAULT_SET).unwrap();
    assert_eq!(sorted.len(), 3);
    assert_eq!(sorted[0], peers[0]);
    assert!(!sorted.contains(&peers[1]));
  }

  #[test]
  fn reserved_peers_admitted_beyond_slots() {
    let (peerset, _rx) = peerset(1, 0);
    let (a, b) = (PeerId::random(), PeerId::random());
    peerset.add_reserved_peer(DEFAULT_SET, a).unwrap();
    peerset.add_reserved_peer(DEFAULT_SET, b).unwrap();
    peerset.dropped(DEFAULT_SET, a);
    peerset.dropped(DEFAULT_SET, b);

    assert!(matches!(
      peerset.incoming(DEFAULT_SET, a),
      Ok(Message::Accept { .. })
    ));
    assert!(matches!(
      peerset.incoming(DEFAULT_SET, b),
      Ok(Message::Accept { .. })
    ));

    // the only inbound slot is still free for a regular peer
    let (regular, late) = (PeerId::random(), PeerId::random());
    assert!(matches!(
      peerset.incoming(DEFAULT_SET, regular),
      Ok(Message::Accept { .. })
    ));
    assert!(matches!(
      peerset.incoming(DEFAULT_SET, late),
      Ok(Message::Reject { .. })
    ));
    assert_eq!(peerset.sorted_peers(DEFAULT_SET).unwrap().len(), 3);
  }

  #[test]
  fn reserved_peer_dialed_without_outbound_slots() {
    let (peerset, mut rx) = peerset(2, 0);
    let (regular, reserved) = (PeerId::random(), PeerId::random());

    peerset.add_peer(DEFAULT_SET, regular).unwrap();
    assert!(drain(&mut rx).is_empty());

    peerset.add_reserved_peer(DEFAULT_SET, reserved).unwrap();
    assert_eq!(drain(&mut rx), vec![Message::Connect {
      set: DEFAULT_SET,
      peer: reserved
    }]);
    assert!(matches!(
      peerset.outgoing(DEFAULT_SET, reserved),
      Ok(Message::Accept { .. })
    ));

    // failed dials are retried on every allocation
    peerset.dropped(DEFAULT_SET, reserved);
    peerset.tick();
    assert_eq!(drain(&mut rx), vec![Message::Connect {
      set: DEFAULT_SET,
      peer: reserved
    }]);
  }

  #[test]
  fn banned_peer_dropped_and_refused() {
    let (peerset, mut rx) = peerset(2, 0);
    let peer = PeerId::random();
    assert!(matches!(
      peerset.incoming(DEFAULT_SET, peer),
      Ok(Message::Accept { .. })
    ));

    peerset.report_peer(peer, ReputationChange::GENESIS_MISMATCH);
    assert_eq!(drain(&mut rx), vec![Message::Drop {
      set: DEFAULT_SET,
      peer
    }]);
    assert_eq!(peerset.reputation(&peer), Some(i32::MIN));

    assert!(matches!(
      peerset.incoming(DEFAULT_SET, peer),
      Ok(Message::Reject { .. })
    ));
  }

  #[test]
  fn operations_are_idempotent() {
    let (peerset, mut rx) = peerset(2, 0);
    let peer = PeerId::random();

    // unknown peers
    peerset.report_peer(peer, ReputationChange::BAD_MESSAGE);
    assert_eq!(peerset.reputation(&peer), None);
    assert_eq!(
      peerset.remove_reserved_peer(DEFAULT_SET, peer),
      Err(Error::NotReserved(peer))
    );
    assert_eq!(peerset.disconnect(DEFAULT_SET, peer), Ok(()));

    peerset.incoming(DEFAULT_SET, peer).unwrap();
    assert_eq!(peerset.disconnect(DEFAULT_SET, peer), Ok(()));
    assert_eq!(peerset.disconnect(DEFAULT_SET, peer), Ok(()));
    assert_eq!(drain(&mut rx), vec![Message::Drop {
      set: DEFAULT_SET,
      peer
    }]);
    assert_eq!(
      peerset.reputation(&peer),
      Some(ReputationChange::DISCONNECT.value)
    );

    assert_eq!(
      peerset.add_peer(7, peer),
      Err(Error::UnknownSet(7))
    );
  }

  #[test]
  fn alloc_dials_reserved_then_best_peers() {
    let (peerset, mut rx) = peerset(0, 1);
    let (low, high, reserved) =
      (PeerId::random(), PeerId::random(), PeerId::random());

    peerset.add_reserved_peer(DEFAULT_SET, reserved).unwrap();
    assert_eq!(drain(&mut rx), vec![Message::Connect {
      set: DEFAULT_SET,
      peer: reserved
    }]);

    peerset.add_peer(DEFAULT_SET, low).unwrap();
    assert_eq!(drain(&mut rx), vec![Message::Connect {
      set: DEFAULT_SET,
      peer: low
    }]);

    // slots are full now, high waits for the next allocation
    peerset.add_peer(DEFAULT_SET, high).unwrap();
    assert!(drain(&mut rx).is_empty());

    peerset.dropped(DEFAULT_SET, low);
    peerset.report_peer(high, ReputationChange::GOOD_TRANSACTION);
    peerset.tick();
    assert_eq!(drain(&mut rx), vec![Message::Connect {
      set: DEFAULT_SET,
      peer: high
    }]);

    // the dialed connection was requested by the peerset
    assert!(matches!(
      peerset.outgoing(DEFAULT_SET, high),
      Ok(Message::Accept { .. })
    ));
  }

  #[test]
  fn set_reserved_peers_replaces_set() {
    let (peerset, _rx) = peerset(2, 0);
    let (a, b, c) = (PeerId::random(), PeerId::random(), PeerId::random());
    peerset.set_reserved_peers(DEFAULT_SET, [a, b]).unwrap();
    assert!(peerset.is_reserved(DEFAULT_SET, &a));
    assert!(peerset.is_reserved(DEFAULT_SET, &b));

    peerset.set_reserved_peers(DEFAULT_SET, [b, c]).unwrap();
    assert!(!peerset.is_reserved(DEFAULT_SET, &a));
    assert!(peerset.is_reserved(DEFAULT_SET, &b));
    assert!(peerset.is_reserved(DEFAULT_SET, &c));
    assert_eq!(
      peerset.remove_peer(DEFAULT_SET, c),
      Err(Error::ReservedPeer(c))
    );
  }

  #[test]
  fn reserved_only_rejects_regular_peers() {
    let (peerset, _rx) = PeerSet::new(vec![SetConfig {
      max_inbound: 5,
      max_outbound: 5,
      reserved_only: true,
    }]);
    let (regular, reserved) = (PeerId::random(), PeerId::random());
    peerset.add_reserved_peer(DEFAULT_SET, reserved).unwrap();
    assert!(matches!(
      peerset.incoming(DEFAULT_SET, regular),
      Ok(Message::Reject { .. })
    ));
    assert!(matches!(
      peerset.incoming(DEFAULT_SET, reserved),
      Ok(Message::Accept { .. })
    ));
  }
}
