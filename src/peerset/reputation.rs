//! Reputation scores and the table of reasons for changing them.

use std::fmt::Display;

/// Reputation of a peer. Positive values are trusted, negative values
/// are suspicious. All arithmetic on reputations saturates.
pub type Reputation = i32;

/// Peers with reputation below this value are disconnected and not
/// accepted or dialed again until their reputation decays above it.
pub const BANNED_THRESHOLD: Reputation = 82 * (i32::MIN / 100);

/// Description of an adjustment of a peer reputation.
///
/// Each reason maps to a fixed delta, components report misbehaviour
/// by picking one of the predefined changes below.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReputationChange {
  pub value: Reputation,
  pub reason: &'static str,
}

impl ReputationChange {
  /// Remote sent a frame or message that could not be decoded.
  pub const BAD_MESSAGE: Self = Self::new(-(1 << 12), "Bad message");
  /// Remote violated the protocol in a way that cannot be an accident.
  pub const BAD_PROTOCOL: Self = Self::new(i32::MIN, "Unsupported protocol");
  /// Remote's handshake announced a different chain.
  pub const GENESIS_MISMATCH: Self = Self::new(i32::MIN, "Genesis mismatch");
  /// Remote's handshake carried invalid values.
  pub const BAD_HANDSHAKE: Self = Self::new(-(1 << 12), "Bad handshake");
  /// Remote re-sent a message we have already seen.
  pub const DUPLICATE_GOSSIP: Self = Self::new(-(1 << 2), "Duplicate gossip");
  /// Remote did not answer a handshake in time.
  pub const TIMEOUT: Self = Self::new(-(1 << 10), "Request timeout");
  /// Remote repeated the same request too often.
  pub const SPAM_LIMITED: Self = Self::new(-(1 << 10), "Repeated request");
  /// Remote sent a valid transaction.
  pub const GOOD_TRANSACTION: Self = Self::new(1 << 7, "Good transaction");
  /// Remote sent an invalid transaction.
  pub const BAD_TRANSACTION: Self = Self::new(-(1 << 12), "Bad transaction");
  /// We disconnected from the remote.
  pub const DISCONNECT: Self = Self::new(-256, "Disconnected");

  pub const fn new(value: Reputation, reason: &'static str) -> Self {
    Self { value, reason }
  }

  pub fn apply(&self, reputation: Reputation) -> Reputation {
    reputation.saturating_add(self.value)
  }
}

impl Display for ReputationChange {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{} ({})", self.reason, self.value)
  }
}

/// Moves a reputation one second worth of decay towards zero.
///
/// Every second the reputation loses 2% of its value, with a minimum
/// step of 1, which halves it in roughly 34 seconds.
pub fn decay(reputation: Reputation) -> Reputation {
  let diff = match reputation / 50 {
    0 if reputation < 0 => -1,
    0 if reputation > 0 => 1,
    diff => diff,
  };
  reputation.saturating_sub(diff)
}

/// Applies `seconds` worth of decay.
pub fn decay_by(mut reputation: Reputation, seconds: u64) -> Reputation {
  for _ in 0..seconds {
    if reputation == 0 {
      break;
    }
    reputation = decay(reputation);
  }
  reputation
}
