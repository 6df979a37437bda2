//! Ready-made notification protocols of a blockchain node.
//!
//! Block announcements carry a handshake describing the chain of the
//! sender, peers on a different chain are rejected before any
//! announcement is accepted. Transactions need no handshake. Both are
//! encoded with MessagePack. What to do with received announcements
//! and transactions is up to the caller.

use {
  crate::{
    peerset::ReputationChange,
    protocol::{Error, Message, MessageType, ProtocolDescriptor},
  },
  bytes::Bytes,
  libp2p::PeerId,
  serde::{Deserialize, Serialize},
  std::{any::Any, ops::BitOr, sync::Arc},
};

pub const BLOCK_ANNOUNCE_TYPE: MessageType = 3;
pub const TRANSACTIONS_TYPE: MessageType = 4;

pub type BlockHash = [u8; 32];

/// Roles a node plays in the network, as a bit set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Roles(pub u8);

impl Roles {
  pub const AUTHORITY: Roles = Roles(4);
  pub const FULL: Roles = Roles(1);
  pub const LIGHT: Roles = Roles(2);

  /// At least one known role and nothing else.
  pub fn is_valid(&self) -> bool {
    let known = Self::FULL.0 | Self::LIGHT.0 | Self::AUTHORITY.0;
    self.0 != 0 && self.0 & !known == 0
  }
}

impl BitOr for Roles {
  type Output = Roles;

  fn bitor(self, rhs: Roles) -> Roles {
    Roles(self.0 | rhs.0)
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockAnnounceHandshake {
  pub roles: Roles,
  pub best_number: u64,
  pub best_hash: BlockHash,
  pub genesis_hash: BlockHash,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockAnnounce {
  pub parent_hash: BlockHash,
  pub number: u64,
  pub header: Bytes,
  pub best_block: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transactions {
  pub extrinsics: Vec<Bytes>,
}

macro_rules! msgpack_message {
  ($type:ty, $tag:expr) => {
    impl Message for $type {
      fn message_type(&self) -> MessageType {
        $tag
      }

      fn encode(&self) -> Result<Bytes, Error> {
        Ok(rmp_serde::to_vec(self)?.into())
      }

      fn as_any(&self) -> &dyn Any {
        self
      }
    }
  };
}

msgpack_message!(BlockAnnounceHandshake, BLOCK_ANNOUNCE_TYPE);
msgpack_message!(BlockAnnounce, BLOCK_ANNOUNCE_TYPE);
msgpack_message!(Transactions, TRANSACTIONS_TYPE);

fn decode<T>(bytes: &[u8]) -> Result<Box<dyn Message>, Error>
where
  T: Message + for<'de> Deserialize<'de>,
{
  Ok(Box::new(rmp_serde::from_slice::<T>(bytes)?))
}

/// Accepts handshakes of peers on the same chain that declare
/// valid roles.
pub fn validate_block_announce_handshake(
  genesis_hash: &BlockHash,
  handshake: &dyn Message,
) -> Result<(), Error> {
  let handshake = handshake
    .downcast_ref::<BlockAnnounceHandshake>()
    .ok_or(Error::Rejected(ReputationChange::BAD_HANDSHAKE))?;

  if &handshake.genesis_hash != genesis_hash {
    return Err(Error::Rejected(ReputationChange::GENESIS_MISMATCH));
  }

  if !handshake.roles.is_valid() {
    return Err(Error::Rejected(ReputationChange::BAD_HANDSHAKE));
  }

  Ok(())
}

/// Block announcement protocol.
///
/// `local` produces our current handshake, it is called for every new
/// stream so it should report the latest best block.
pub fn block_announces<L, H>(
  name: impl Into<String>,
  local: L,
  handler: H,
) -> ProtocolDescriptor
where
  L: Fn() -> BlockAnnounceHandshake + Send + Sync + 'static,
  H: Fn(&PeerId, &BlockAnnounce) -> Result<bool, Error>
    + Send
    + Sync
    + 'static,
{
  let local = Arc::new(local);
  let genesis = Arc::clone(&local);

  ProtocolDescriptor::new(
    name,
    BLOCK_ANNOUNCE_TYPE,
    decode::<BlockAnnounce>,
    move |peer, message| match message.downcast_ref::<BlockAnnounce>() {
      Some(announce) => handler(peer, announce),
      None => Err(Error::Malformed("not a block announcement")),
    },
  )
  .with_handshake(
    move || Ok(Box::new((*local)()) as Box<dyn Message>),
    decode::<BlockAnnounceHandshake>,
    move |_, handshake| {
      validate_block_announce_handshake(&(*genesis)().genesis_hash, handshake)
    },
  )
}

/// Transaction propagation protocol. Transactions are handed to
/// `handler` in batches.
pub fn transactions<H>(
  name: impl Into<String>,
  handler: H,
) -> ProtocolDescriptor
where
  H: Fn(Vec<(PeerId, Transactions)>) -> Vec<Result<bool, Error>>
    + Send
    + Sync
    + 'static,
{
  ProtocolDescriptor::new(
    name,
    TRANSACTIONS_TYPE,
    decode::<Transactions>,
    |_, _| Err(Error::Malformed("transactions are handled in batches")),
  )
  .with_batch_handler(move |batch: Vec<(PeerId, Box<dyn Message>)>| {
    // foreign messages get their outcome here, the rest in order from
    // the handler, so outcomes stay aligned with the batch
    let mut outcomes = Vec::with_capacity(batch.len());
    let mut decoded = Vec::with_capacity(batch.len());
    for (peer, message) in batch {
      match message.downcast_ref::<Transactions>() {
        Some(transactions) => {
          outcomes.push(None);
          decoded.push((peer, transactions.clone()));
        }
        None => outcomes.push(Some(Err(Error::Malformed(
          "not a transactions message",
        )))),
      }
    }

    let mut handled = handler(decoded).into_iter();
    outcomes
      .into_iter()
      .map_while(|outcome| outcome.or_else(|| handled.next()))
      .collect()
  })
}
