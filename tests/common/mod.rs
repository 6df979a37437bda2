#![allow(dead_code)]

use {
  bytes::Bytes,
  notiflow::{
    protocol::{self, Message, MessageType, ProtocolDescriptor},
    transport::memory::MemoryNetwork,
    Config,
    Network,
    PeerId,
  },
  std::{
    any::Any,
    sync::{
      atomic::{AtomicUsize, Ordering},
      Arc,
    },
    time::Duration,
  },
  tokio::time::sleep,
};

pub const PING: &str = "/test/ping/1";
pub const PING_TYPE: MessageType = 1;

/// Opaque test message, the payload is sent as is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ping(pub Bytes);

impl Ping {
  pub fn new(content: &'static [u8]) -> Self {
    Self(Bytes::from_static(content))
  }
}

impl Message for Ping {
  fn message_type(&self) -> MessageType {
    PING_TYPE
  }

  fn encode(&self) -> Result<Bytes, protocol::Error> {
    Ok(self.0.clone())
  }

  fn as_any(&self) -> &dyn Any {
    self
  }
}

/// Ping protocol counting received messages, never relays.
pub fn ping_protocol(received: Arc<AtomicUsize>) -> ProtocolDescriptor {
  ProtocolDescriptor::new(
    PING,
    PING_TYPE,
    |bytes: &[u8]| {
      Ok(Box::new(Ping(Bytes::copy_from_slice(bytes))) as Box<dyn Message>)
    },
    move |_: &PeerId, _: Box<dyn Message>| {
      received.fetch_add(1, Ordering::SeqCst);
      Ok(false)
    },
  )
}

pub fn config() -> Config {
  Config {
    listen_addrs: vec![],
    stream_idle_interval: Duration::from_secs(3600),
    ..Config::default()
  }
}

pub fn node(hub: &MemoryNetwork, config: Config) -> Network {
  let (transport, events) = hub.transport();
  Network::new(config, transport, events).unwrap()
}

/// Makes `a` dial `b` and waits until both admitted each other.
pub async fn connect(a: &Network, b: &Network) {
  a.add_peer(b.local_peer_id()).unwrap();
  wait_until(|| {
    a.peers().contains(&b.local_peer_id())
      && b.peers().contains(&a.local_peer_id())
  })
  .await;
}

pub async fn wait_until(mut condition: impl FnMut() -> bool) {
  for _ in 0..1000 {
    if condition() {
      return;
    }
    sleep(Duration::from_millis(10)).await;
  }
  panic!("condition not met in time");
}
