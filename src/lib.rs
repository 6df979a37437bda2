mod cache;
mod channel;
mod codec;
mod config;
mod gossip;
mod handshake;
mod network;
mod pool;
mod reaper;
mod shared;
mod spam;
mod stream;

pub mod notifications;
pub mod peerset;
pub mod protocol;
pub mod protocols;
pub mod request;
pub mod transport;

pub use {
  codec::Error as CodecError,
  config::{Config, Error as ConfigError},
  libp2p::{core::identity::Keypair, multiaddr, Multiaddr, PeerId},
  network::{Error, Network},
  peerset::{Reputation, ReputationChange},
  protocol::{Message, MessageType, ProtocolDescriptor},
  stream::{Bandwidth, PeerBandwidth},
};
