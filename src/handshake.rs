use {
  crate::{
    protocol::Message,
    stream::{StreamId, Substream},
  },
  dashmap::DashMap,
  libp2p::PeerId,
  std::sync::Arc,
  tokio::sync::Mutex,
};

/// Outbound stream shared between consecutive sends to a peer.
pub type SharedStream = Arc<Mutex<Substream>>;

/// Progress of the handshake with one peer on one protocol in one
/// direction.
///
/// `received && !validated` means the peer sent a handshake that we
/// rejected, such peers are refused on this protocol until they
/// reconnect.
#[derive(Debug, Clone, Default)]
pub struct HandshakeData {
  /// The remote handshake arrived.
  pub received: bool,

  /// The remote handshake passed validation.
  pub validated: bool,

  /// Decoded remote handshake.
  pub handshake: Option<Arc<dyn Message>>,

  /// Stream this state is bound to.
  pub stream_id: Option<StreamId>,

  /// Outbound stream messages are written to once validated.
  pub stream: Option<SharedStream>,
}

impl HandshakeData {
  /// Our handshake is out, nothing came back yet.
  pub fn sent(stream_id: StreamId) -> Self {
    Self {
      stream_id: Some(stream_id),
      ..Default::default()
    }
  }

  pub fn rejected(handshake: Option<Arc<dyn Message>>) -> Self {
    Self {
      received: true,
      validated: false,
      handshake,
      ..Default::default()
    }
  }

  pub fn is_rejected(&self) -> bool {
    self.received && !self.validated
  }
}

/// Handshake states of all peers of one protocol in one direction.
///
/// This map is the single source of truth for handshake progress.
/// Values are cloned out, no lock is ever held across an await.
#[derive(Debug, Default)]
pub struct HandshakeMap {
  states: DashMap<PeerId, HandshakeData>,
}

impl HandshakeMap {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn get(&self, peer: &PeerId) -> Option<HandshakeData> {
    self.states.get(peer).map(|state| state.clone())
  }

  pub fn set(&self, peer: PeerId, data: HandshakeData) {
    self.states.insert(peer, data);
  }

  pub fn delete(&self, peer: &PeerId) -> Option<HandshakeData> {
    self.states.remove(peer).map(|(_, state)| state)
  }

  /// Removes the state of a peer only if it matches the predicate,
  /// atomically with respect to other writers.
  pub fn remove_if(
    &self,
    peer: &PeerId,
    predicate: impl FnOnce(&HandshakeData) -> bool,
  ) -> bool {
    self
      .states
      .remove_if(peer, |_, state| predicate(state))
      .is_some()
  }

  pub fn len(&self) -> usize {
    self.states.len()
  }

  pub fn is_empty(&self) -> bool {
    self.states.is_empty()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn remove_if_checks_binding() {
    let map = HandshakeMap::new();
    let peer = PeerId::random();

    map.set(peer, HandshakeData {
      received: true,
      validated: true,
      stream_id: Some(5),
      ..Default::default()
    });

    assert!(!map.remove_if(&peer, |s| s.stream_id == Some(6)));
    assert_eq!(map.len(), 1);
    assert!(map.remove_if(&peer, |s| s.stream_id == Some(5)));
    assert!(map.is_empty());
  }

  #[test]
  fn rejected_state_is_sticky() {
    let map = HandshakeMap::new();
    let peer = PeerId::random();
    map.set(peer, HandshakeData::rejected(None));
    assert!(map.get(&peer).unwrap().is_rejected());
    assert!(!HandshakeData::sent(1).is_rejected());
    assert!(map.delete(&peer).is_some());
    assert!(map.get(&peer).is_none());
  }
}
