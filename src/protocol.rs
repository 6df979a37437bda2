//! Registration surface of notification protocols.
//!
//! A protocol is described by a set of capabilities: how to build and
//! judge handshakes, how to decode steady state messages and what to
//! do with them. The engine never looks inside payloads, it only
//! moves opaque bytes and calls into these capabilities.

use {
  crate::peerset::ReputationChange,
  bytes::Bytes,
  libp2p::PeerId,
  multihash::{Code, Multihash, MultihashDigest},
  std::{any::Any, fmt::Debug, sync::Arc},
  thiserror::Error,
};

/// Tag used to route application messages to their protocol.
pub type MessageType = u8;

#[derive(Debug, Error)]
pub enum Error {
  #[error("Serialization error: {0}")]
  Serialization(#[from] rmp_serde::encode::Error),

  #[error("Deserialization error: {0}")]
  Deserialization(#[from] rmp_serde::decode::Error),

  #[error("Malformed payload: {0}")]
  Malformed(&'static str),

  #[error("Rejected: {0}")]
  Rejected(ReputationChange),
}

impl Error {
  /// Penalty the remote peer deserves for causing this error.
  pub fn reputation_change(&self) -> Option<ReputationChange> {
    match self {
      Error::Serialization(_) => None,
      Error::Deserialization(_) | Error::Malformed(_) => {
        Some(ReputationChange::BAD_MESSAGE)
      }
      Error::Rejected(change) => Some(*change),
    }
  }
}

/// A value exchanged over a notification protocol, either a handshake
/// or a steady state message.
pub trait Message: Debug + Send + Sync + 'static {
  /// Tag of the protocol this message belongs to.
  fn message_type(&self) -> MessageType;

  /// Wire representation of the message.
  fn encode(&self) -> Result<Bytes, Error>;

  fn as_any(&self) -> &dyn Any;
}

impl dyn Message {
  pub fn downcast_ref<T: Message>(&self) -> Option<&T> {
    self.as_any().downcast_ref()
  }
}

/// Content address of a message, used for de-duplication.
///
/// The tag is part of the hash so identical payloads on different
/// protocols are never confused.
pub fn message_hash(message_type: MessageType, payload: &[u8]) -> Multihash {
  let mut bytes = Vec::with_capacity(payload.len() + 1);
  bytes.push(message_type);
  bytes.extend_from_slice(payload);
  Code::Sha3_256.digest(&bytes)
}

/// Handshake of protocols that do not exchange any state before
/// messages start flowing. Encoded as an empty frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EmptyHandshake(pub MessageType);

impl Message for EmptyHandshake {
  fn message_type(&self) -> MessageType {
    self.0
  }

  fn encode(&self) -> Result<Bytes, Error> {
    Ok(Bytes::new())
  }

  fn as_any(&self) -> &dyn Any {
    self
  }
}

/// Builds the local handshake, called for every new stream.
pub type HandshakeGetter =
  Arc<dyn Fn() -> Result<Box<dyn Message>, Error> + Send + Sync>;

/// Turns a frame into a handshake or a message.
pub type Decoder =
  Arc<dyn Fn(&[u8]) -> Result<Box<dyn Message>, Error> + Send + Sync>;

/// Decides whether a remote handshake is acceptable.
pub type HandshakeValidator =
  Arc<dyn Fn(&PeerId, &dyn Message) -> Result<(), Error> + Send + Sync>;

/// Processes one message. Returns whether the message should be
/// propagated to other peers.
pub type MessageHandler = Arc<
  dyn Fn(&PeerId, Box<dyn Message>) -> Result<bool, Error> + Send + Sync,
>;

/// Processes a batch of messages, returning one outcome per message
/// in the same order.
pub type BatchHandler = Arc<
  dyn Fn(Vec<(PeerId, Box<dyn Message>)>) -> Vec<Result<bool, Error>>
    + Send
    + Sync,
>;

/// Everything the engine needs to know about a notification protocol.
///
/// Descriptors start out with an empty handshake that accepts every
/// peer. Protocols that exchange state before messages flow install
/// their own with [`ProtocolDescriptor::with_handshake`].
#[derive(Clone)]
pub struct ProtocolDescriptor {
  /// Protocol name negotiated by the transport, e.g. `/dot/tx/1`.
  pub name: String,
  pub message_type: MessageType,
  pub handshake: HandshakeGetter,
  pub handshake_decoder: Decoder,
  pub handshake_validator: HandshakeValidator,
  pub message_decoder: Decoder,
  pub handler: MessageHandler,
  pub batch_handler: Option<BatchHandler>,
  /// Falls back to the network-wide maximum when not set.
  pub max_message_size: Option<usize>,
  /// Whether identical messages are sent only once to each peer.
  pub dedupe: bool,
}

impl ProtocolDescriptor {
  pub fn new<D, H>(
    name: impl Into<String>,
    message_type: MessageType,
    message_decoder: D,
    handler: H,
  ) -> Self
  where
    D: Fn(&[u8]) -> Result<Box<dyn Message>, Error> + Send + Sync + 'static,
    H: Fn(&PeerId, Box<dyn Message>) -> Result<bool, Error>
      + Send
      + Sync
      + 'static,
  {
    Self {
      name: name.into(),
      message_type,
      handshake: Arc::new(move || {
        Ok(Box::new(EmptyHandshake(message_type)) as Box<dyn Message>)
      }),
      handshake_decoder: Arc::new(move |bytes: &[u8]| {
        if !bytes.is_empty() {
          return Err(Error::Malformed("expected empty handshake"));
        }
        Ok(Box::new(EmptyHandshake(message_type)) as Box<dyn Message>)
      }),
      handshake_validator: Arc::new(|_: &PeerId, _: &dyn Message| Ok(())),
      message_decoder: Arc::new(message_decoder),
      handler: Arc::new(handler),
      batch_handler: None,
      max_message_size: None,
      dedupe: true,
    }
  }

  pub fn with_handshake<G, D, V>(
    mut self,
    getter: G,
    decoder: D,
    validator: V,
  ) -> Self
  where
    G: Fn() -> Result<Box<dyn Message>, Error> + Send + Sync + 'static,
    D: Fn(&[u8]) -> Result<Box<dyn Message>, Error> + Send + Sync + 'static,
    V: Fn(&PeerId, &dyn Message) -> Result<(), Error> + Send + Sync + 'static,
  {
    self.handshake = Arc::new(getter);
    self.handshake_decoder = Arc::new(decoder);
    self.handshake_validator = Arc::new(validator);
    self
  }

  /// Messages are collected and handed to `handler` in batches
  /// instead of one by one.
  pub fn with_batch_handler<B>(mut self, handler: B) -> Self
  where
    B: Fn(Vec<(PeerId, Box<dyn Message>)>) -> Vec<Result<bool, Error>>
      + Send
      + Sync
      + 'static,
  {
    self.batch_handler = Some(Arc::new(handler));
    self
  }

  pub fn with_max_message_size(mut self, size: usize) -> Self {
    self.max_message_size = Some(size);
    self
  }

  /// Identical messages are sent again to peers that already got
  /// them, e.g. consensus votes that are repeated on purpose.
  pub fn non_deduplicable(mut self) -> Self {
    self.dedupe = false;
    self
  }
}

impl Debug for ProtocolDescriptor {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("ProtocolDescriptor")
      .field("name", &self.name)
      .field("message_type", &self.message_type)
      .field("batched", &self.batch_handler.is_some())
      .field("max_message_size", &self.max_message_size)
      .field("dedupe", &self.dedupe)
      .finish()
  }
}
