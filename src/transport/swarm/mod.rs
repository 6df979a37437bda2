//! libp2p backed transport: TCP with DNS resolution, NOISE encryption
//! and Yamux substream multiplexing. Every notification or request
//! protocol runs on its own negotiated substream.

mod behaviour;
mod handler;
mod upgrade;

use {
  self::{
    behaviour::{AddressMap, Behaviour},
    handler::{HandlerIn, StreamReply},
    upgrade::InboundProtocols,
  },
  super::{BoxedStream, Error, Event},
  crate::Config,
  async_trait::async_trait,
  futures::StreamExt,
  libp2p::{
    core::{transport::timeout::TransportTimeout, upgrade::Version},
    dns::TokioDnsConfig,
    identity::Keypair,
    noise::{self, NoiseConfig, X25519Spec},
    swarm::{dial_opts::DialOpts, SwarmBuilder, SwarmEvent},
    tcp,
    yamux::YamuxConfig,
    Multiaddr,
    PeerId,
    Swarm,
    Transport as _,
  },
  metrics::increment_counter,
  parking_lot::RwLock,
  std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::Duration,
  },
  tokio::sync::{
    mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender},
    oneshot,
  },
  tracing::{debug, error, info, warn},
};

/// How long establishing a connection, including the security and
/// muxer upgrades, may take.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

type DialReply = oneshot::Sender<Result<(), Error>>;

/// Commands sent to the background swarm runloop.
enum Command {
  Dial {
    peer: PeerId,
    addrs: Vec<Multiaddr>,
    reply: DialReply,
  },
  OpenStream {
    peer: PeerId,
    protocol: String,
    reply: StreamReply,
  },
  Disconnect(PeerId),
  Ban(PeerId),
  Unban(PeerId),
  Shutdown,
}

pub struct SwarmTransport {
  local: PeerId,
  protocols: InboundProtocols,
  addresses: AddressMap,
  connected: Arc<RwLock<HashSet<PeerId>>>,
  listening: Arc<RwLock<Vec<Multiaddr>>>,
  commands: UnboundedSender<Command>,
}

impl SwarmTransport {
  /// Builds the libp2p swarm, starts listening on all configured
  /// addresses and spawns its runloop on the current tokio runtime.
  pub fn new(
    config: &Config,
    keypair: Keypair,
  ) -> Result<(Arc<Self>, UnboundedReceiver<Event>), Error> {
    let local = keypair.public().to_peer_id();
    let protocols = InboundProtocols::default();
    let addresses = AddressMap::default();
    let connected = Arc::new(RwLock::new(HashSet::new()));
    let listening = Arc::new(RwLock::new(Vec::new()));

    let behaviour = Behaviour::new(protocols.clone(), addresses.clone());
    let mut swarm = build_swarm(keypair, behaviour)?;

    // the actual sockets will open once we start polling
    // the swarm on the background task.
    for addr in &config.listen_addrs {
      swarm
        .listen_on(addr.clone())
        .map_err(|e| Error::Transport(e.to_string()))?;
    }

    let (cmdtx, cmdrx) = unbounded_channel();
    let (evtx, evrx) = unbounded_channel();
    tokio::spawn(runloop(
      swarm,
      cmdrx,
      evtx,
      Arc::clone(&connected),
      Arc::clone(&listening),
    ));

    info!("local identity: {local}");
    Ok((
      Arc::new(Self {
        local,
        protocols,
        addresses,
        connected,
        listening,
        commands: cmdtx,
      }),
      evrx,
    ))
  }

  fn send(&self, command: Command) -> Result<(), Error> {
    self.commands.send(command).map_err(|_| Error::Closed)
  }
}

#[async_trait]
impl super::Transport for SwarmTransport {
  fn local_peer_id(&self) -> PeerId {
    self.local
  }

  fn register_protocol(&self, protocol: &str) -> Result<(), Error> {
    self.protocols.insert(protocol);
    Ok(())
  }

  async fn open_stream(
    &self,
    peer: PeerId,
    protocol: &str,
  ) -> Result<BoxedStream, Error> {
    if !self.connected.read().contains(&peer) {
      return Err(Error::NotConnected(peer));
    }

    let (reply, rx) = oneshot::channel();
    self.send(Command::OpenStream {
      peer,
      protocol: protocol.to_owned(),
      reply,
    })?;

    match rx.await {
      Ok(Ok(stream)) => Ok(Box::new(stream)),
      Ok(Err(Error::Transport(_))) => {
        Err(Error::UnsupportedProtocol(peer, protocol.to_owned()))
      }
      Ok(Err(e)) => Err(e),
      // the connection went away before the substream was negotiated
      Err(_) => Err(Error::NotConnected(peer)),
    }
  }

  fn connected_peers(&self) -> Vec<PeerId> {
    self.connected.read().iter().copied().collect()
  }

  fn listen_addrs(&self) -> Vec<Multiaddr> {
    self.listening.read().clone()
  }

  async fn dial(
    &self,
    peer: PeerId,
    addrs: Vec<Multiaddr>,
  ) -> Result<(), Error> {
    if self.connected.read().contains(&peer) {
      return Ok(());
    }

    self.addresses.write().insert(peer, addrs.clone());
    let (reply, rx) = oneshot::channel();
    self.send(Command::Dial { peer, addrs, reply })?;
    rx.await.map_err(|_| Error::Closed)?
  }

  async fn disconnect(&self, peer: PeerId) {
    let _ = self.send(Command::Disconnect(peer));
  }

  fn ban_peer(&self, peer: PeerId) {
    let _ = self.send(Command::Ban(peer));
  }

  fn unban_peer(&self, peer: PeerId) {
    let _ = self.send(Command::Unban(peer));
  }

  async fn close(&self) {
    let _ = self.send(Command::Shutdown);
    self.connected.write().clear();
  }
}

fn build_swarm(
  keypair: Keypair,
  behaviour: Behaviour,
) -> Result<Swarm<Behaviour>, Error> {
  // TCP transport with DNS resolution, NOISE encryption and Yamux
  // substream multiplexing.
  let transport = {
    let transport =
      TokioDnsConfig::system(libp2p::tcp::tokio::Transport::new(
        tcp::Config::new().port_reuse(false).nodelay(true),
      ))?;

    let noise_keys = noise::Keypair::<X25519Spec>::new()
      .into_authentic(&keypair)
      .map_err(|e| Error::Transport(e.to_string()))?;

    TransportTimeout::new(transport, CONNECT_TIMEOUT)
      .upgrade(Version::V1)
      .authenticate(NoiseConfig::xx(noise_keys).into_authenticated())
      .multiplex(YamuxConfig::default())
      .boxed()
  };

  Ok(
    SwarmBuilder::with_tokio_executor(
      transport, //
      behaviour,
      keypair.public().into(),
    )
    .build(),
  )
}

async fn runloop(
  mut swarm: Swarm<Behaviour>,
  mut commands: UnboundedReceiver<Command>,
  events: UnboundedSender<Event>,
  connected: Arc<RwLock<HashSet<PeerId>>>,
  listening: Arc<RwLock<Vec<Multiaddr>>>,
) {
  // dials waiting for the outcome of a connection attempt.
  let mut dials: HashMap<PeerId, Vec<DialReply>> = HashMap::new();

  loop {
    tokio::select! {
      Some(event) = swarm.next() => match event {
        SwarmEvent::Behaviour(event) => {
          match &event {
            Event::Connected { peer, .. } => {
              connected.write().insert(*peer);
            }
            Event::Disconnected { peer } => {
              connected.write().remove(peer);
            }
            Event::InboundStream { .. } => {}
          }

          // this loop is not responsible for any high-level logic
          // except routing commands and events between the network
          // and libp2p.
          if events.send(event).is_err() {
            error!("Terminating swarm runloop, the network is gone");
            break;
          }
        }
        SwarmEvent::ConnectionEstablished { peer_id, .. } => {
          for reply in dials.remove(&peer_id).unwrap_or_default() {
            let _ = reply.send(Ok(()));
          }
        }
        SwarmEvent::OutgoingConnectionError { peer_id: Some(peer), error } => {
          increment_counter!("dial_errors");
          warn!("Failed to dial peer {peer}: {error}");
          for reply in dials.remove(&peer).unwrap_or_default() {
            let _ = reply.send(Err(Error::Dial(peer, error.to_string())));
          }
        }
        SwarmEvent::NewListenAddr { address, .. } => {
          info!("listening on {address}");
          listening.write().push(address);
        }
        SwarmEvent::ExpiredListenAddr { address, .. } => {
          debug!("no longer listening on {address}");
          listening.write().retain(|a| a != &address);
        }
        _ => {}
      },

      Some(command) = commands.recv() => match command {
        Command::Dial { peer, addrs, reply } => {
          if swarm.is_connected(&peer) {
            let _ = reply.send(Ok(()));
            continue;
          }
          let opts = DialOpts::peer_id(peer).addresses(addrs).build();
          match swarm.dial(opts) {
            Ok(()) => dials.entry(peer).or_default().push(reply),
            Err(e) => {
              increment_counter!("dial_errors");
              let _ = reply.send(Err(Error::Dial(peer, e.to_string())));
            }
          }
        }
        Command::OpenStream { peer, protocol, reply } => {
          debug!(%peer, %protocol, "opening substream");
          swarm
            .behaviour()
            .open_stream(peer, HandlerIn::OpenStream { protocol, reply });
        }
        Command::Disconnect(peer) => {
          let _ = swarm.disconnect_peer_id(peer);
        }
        Command::Ban(peer) => {
          increment_counter!("banned_peers");
          swarm.ban_peer_id(peer);
        }
        Command::Unban(peer) => swarm.unban_peer_id(peer),
        Command::Shutdown => {
          info!("swarm runloop shutting down");
          break;
        }
      },

      else => break,
    }
  }

  connected.write().clear();
  listening.write().clear();
}
