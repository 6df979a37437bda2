mod common;

use {
  bytes::Bytes,
  common::{
    connect,
    node,
    ping_protocol,
    wait_until,
    Ping,
    PING,
    PING_TYPE,
  },
  futures::{future::select_all, AsyncReadExt},
  notiflow::{
    notifications,
    peerset::BANNED_THRESHOLD,
    protocols::{
      block_announces,
      transactions,
      BlockAnnounce,
      BlockAnnounceHandshake,
      BlockHash,
      Roles,
      Transactions,
      BLOCK_ANNOUNCE_TYPE,
      TRANSACTIONS_TYPE,
    },
    transport::{memory::MemoryNetwork, Event, Transport},
    Config,
    Error,
    Network,
    ReputationChange,
  },
  parking_lot::Mutex,
  std::{
    sync::{
      atomic::{AtomicU8, AtomicUsize, Ordering},
      Arc,
    },
    time::Duration,
  },
  tokio::time::sleep,
};

const ANNOUNCES: &str = "/test/block-announces/1";

fn announce(number: u64) -> BlockAnnounce {
  BlockAnnounce {
    parent_hash: [7; 32],
    number,
    header: Bytes::from_static(b"header"),
    best_block: true,
  }
}

fn chain_handshake(
  genesis_hash: BlockHash,
  roles: Roles,
) -> BlockAnnounceHandshake {
  BlockAnnounceHandshake {
    roles,
    best_number: 1,
    best_hash: [3; 32],
    genesis_hash,
  }
}

/// Full node speaking the block announce protocol on the given chain.
fn chain_node(
  hub: &MemoryNetwork,
  genesis_hash: BlockHash,
  relay: bool,
) -> (Network, Arc<AtomicUsize>) {
  let local = move || chain_handshake(genesis_hash, Roles::FULL);
  chain_node_with(hub, local, relay)
}

/// Block announce node presenting whatever `local` returns as its
/// handshake.
fn chain_node_with(
  hub: &MemoryNetwork,
  local: impl Fn() -> BlockAnnounceHandshake + Send + Sync + 'static,
  relay: bool,
) -> (Network, Arc<AtomicUsize>) {
  let network = node(hub, common::config());
  let received = Arc::new(AtomicUsize::new(0));
  let counter = Arc::clone(&received);

  network
    .register_protocol(block_announces(
      ANNOUNCES,
      local,
      move |_, _| {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(relay)
      },
    ))
    .unwrap();
  network.start().unwrap();
  (network, received)
}

async fn deliveries_of_five_identical_broadcasts(config: Config) -> usize {
  let hub = MemoryNetwork::new();
  let sender = node(&hub, config.clone());
  let receiver = node(&hub, config);
  let received = Arc::new(AtomicUsize::new(0));

  sender.register_protocol(ping_protocol(Arc::default())).unwrap();
  receiver
    .register_protocol(ping_protocol(Arc::clone(&received)))
    .unwrap();
  sender.start().unwrap();
  receiver.start().unwrap();
  connect(&sender, &receiver).await;

  for _ in 0..5 {
    sender.broadcast(&Ping::new(b"hello")).unwrap();
  }

  sleep(Duration::from_secs(1)).await;
  received.load(Ordering::SeqCst)
}

#[test_log::test(tokio::test(start_paused = true))]
async fn identical_broadcasts_are_delivered_once() {
  let delivered = deliveries_of_five_identical_broadcasts(common::config());
  assert_eq!(delivered.await, 1);
}

#[test_log::test(tokio::test(start_paused = true))]
async fn without_dedupe_every_broadcast_is_delivered() {
  let config = Config {
    dedupe_interval: None,
    ..common::config()
  };
  assert_eq!(deliveries_of_five_identical_broadcasts(config).await, 5);
}

#[test_log::test(tokio::test(start_paused = true))]
async fn duplicate_from_second_peer_is_penalized() {
  let hub = MemoryNetwork::new();
  let first = node(&hub, common::config());
  let second = node(&hub, common::config());
  let receiver = node(&hub, common::config());
  let received = Arc::new(AtomicUsize::new(0));

  first.register_protocol(ping_protocol(Arc::default())).unwrap();
  second.register_protocol(ping_protocol(Arc::default())).unwrap();
  receiver
    .register_protocol(ping_protocol(Arc::clone(&received)))
    .unwrap();
  for network in [&first, &second, &receiver] {
    network.start().unwrap();
  }
  connect(&first, &receiver).await;
  connect(&second, &receiver).await;

  let vote = Ping::new(b"vote");
  first.send_to(receiver.local_peer_id(), &vote).await.unwrap();
  wait_until(|| received.load(Ordering::SeqCst) == 1).await;

  second.send_to(receiver.local_peer_id(), &vote).await.unwrap();
  let second_id = second.local_peer_id();
  wait_until(|| matches!(receiver.reputation(&second_id), Some(r) if r < 0))
    .await;

  assert_eq!(received.load(Ordering::SeqCst), 1);
  assert_eq!(receiver.reputation(&first.local_peer_id()), Some(0));
}

#[test_log::test(tokio::test(start_paused = true))]
async fn announcements_flood_through_relays() {
  let hub = MemoryNetwork::new();
  let (origin, origin_received) = chain_node(&hub, [1; 32], true);
  let (relay, relay_received) = chain_node(&hub, [1; 32], true);
  let (edge, edge_received) = chain_node(&hub, [1; 32], true);

  connect(&origin, &relay).await;
  connect(&relay, &edge).await;
  assert!(!origin.peers().contains(&edge.local_peer_id()));

  origin.broadcast(&announce(2)).unwrap();
  wait_until(|| edge_received.load(Ordering::SeqCst) == 1).await;

  sleep(Duration::from_secs(1)).await;
  assert_eq!(relay_received.load(Ordering::SeqCst), 1);
  assert_eq!(edge_received.load(Ordering::SeqCst), 1);
  assert_eq!(origin_received.load(Ordering::SeqCst), 0);
}

#[test_log::test(tokio::test(start_paused = true))]
async fn peer_on_another_chain_is_rejected() {
  let hub = MemoryNetwork::new();
  let (forked, _) = chain_node(&hub, [9; 32], false);
  let (honest, received) = chain_node(&hub, [1; 32], false);
  connect(&forked, &honest).await;

  let result = forked.send_to(honest.local_peer_id(), &announce(5)).await;
  assert!(result.is_err());

  let forked_id = forked.local_peer_id();
  wait_until(|| !honest.peers().contains(&forked_id)).await;
  assert!(honest.reputation(&forked_id).unwrap() < BANNED_THRESHOLD);
  assert_eq!(received.load(Ordering::SeqCst), 0);
}

#[test_log::test(tokio::test(start_paused = true))]
async fn silent_peer_times_out_handshake_once() {
  let hub = MemoryNetwork::new();
  let network = node(&hub, common::config());
  network.register_protocol(ping_protocol(Arc::default())).unwrap();
  network.start().unwrap();

  // a bare transport that accepts streams and never answers
  let (silent, mut events) = hub.transport();
  silent.register_protocol(PING).unwrap();
  let silent_id = silent.local_peer_id();

  network.add_peer(silent_id).unwrap();
  wait_until(|| network.peer_count() == 1).await;

  let sends: Vec<_> = (0..3)
    .map(|_| {
      let network = network.clone();
      tokio::spawn(async move {
        network.send_to(silent_id, &Ping::new(b"hello")).await
      })
    })
    .collect();

  sleep(Duration::from_secs(1)).await;
  let mut streams = vec![];
  while let Ok(event) = events.try_recv() {
    if let Event::InboundStream { stream, .. } = event {
      streams.push(stream);
    }
  }
  assert_eq!(streams.len(), 1);

  let (first, _, _) = select_all(sends).await;
  assert!(matches!(
    first.unwrap(),
    Err(Error::Notifications(
      notifications::Error::HandshakeTimeout(peer)
    )) if peer == silent_id
  ));
  assert_eq!(
    network.reputation(&silent_id),
    Some(ReputationChange::TIMEOUT.value)
  );

  // the stream carried our empty handshake and was closed
  let mut received = vec![];
  streams[0].read_to_end(&mut received).await.unwrap();
  assert_eq!(received, [0u8]);
}

#[test_log::test(tokio::test(start_paused = true))]
async fn transactions_are_handled_in_batches() {
  let hub = MemoryNetwork::new();
  let config = Config {
    batch_size: 2,
    ..common::config()
  };
  let sender = node(&hub, config.clone());
  let receiver = node(&hub, config);

  let batches = Arc::new(Mutex::new(Vec::new()));
  let seen = Arc::clone(&batches);
  sender
    .register_protocol(transactions("/test/tx/1", |batch| {
      batch.iter().map(|_| Ok(false)).collect()
    }))
    .unwrap();
  receiver
    .register_protocol(transactions("/test/tx/1", move |batch| {
      seen.lock().push(batch.len());
      batch.iter().map(|_| Ok(false)).collect()
    }))
    .unwrap();
  sender.start().unwrap();
  receiver.start().unwrap();
  connect(&sender, &receiver).await;

  for tx in [&b"a"[..], b"b", b"c"] {
    let message = Transactions {
      extrinsics: vec![Bytes::copy_from_slice(tx)],
    };
    sender.send_to(receiver.local_peer_id(), &message).await.unwrap();
  }

  wait_until(|| batches.lock().len() == 1).await;
  assert_eq!(*batches.lock(), vec![2]);

  // the leftover is flushed by the maintenance tick
  let tick = common::config().maintenance_tick_interval;
  sleep(tick + Duration::from_secs(1)).await;
  assert_eq!(*batches.lock(), vec![2, 1]);
}

#[test_log::test(tokio::test(start_paused = true))]
async fn disconnect_clears_peer_state() {
  let hub = MemoryNetwork::new();
  let a = node(&hub, common::config());
  let b = node(&hub, common::config());
  a.register_protocol(ping_protocol(Arc::default())).unwrap();
  b.register_protocol(ping_protocol(Arc::default())).unwrap();
  a.start().unwrap();
  b.start().unwrap();
  connect(&a, &b).await;

  a.send_to(b.local_peer_id(), &Ping::new(b"one")).await.unwrap();
  assert_eq!(a.handshakes(PING_TYPE), (0, 1));
  assert_eq!(b.handshakes(PING_TYPE), (1, 0));

  a.disconnect_peer(b.local_peer_id()).unwrap();
  wait_until(|| a.peer_count() == 0 && b.peer_count() == 0).await;
  assert_eq!(a.handshakes(PING_TYPE), (0, 0));

  assert!(matches!(
    a.send_to(b.local_peer_id(), &Ping::new(b"two")).await,
    Err(Error::Notifications(notifications::Error::NotConnected(_)))
  ));
  assert!(a.bandwidth().peer(&b.local_peer_id()).is_none());
}

#[test_log::test(tokio::test(start_paused = true))]
async fn rejected_peer_is_refused_on_later_streams() {
  let hub = MemoryNetwork::new();
  let roles = Arc::new(AtomicU8::new(0x80));
  let current = Arc::clone(&roles);
  let (odd, _) = chain_node_with(
    &hub,
    move || chain_handshake([1; 32], Roles(current.load(Ordering::SeqCst))),
    false,
  );
  let (honest, received) = chain_node(&hub, [1; 32], false);
  connect(&odd, &honest).await;

  let (odd_id, honest_id) = (odd.local_peer_id(), honest.local_peer_id());
  assert!(odd.send_to(honest_id, &announce(5)).await.is_err());
  wait_until(|| matches!(honest.reputation(&odd_id), Some(r) if r < 0)).await;

  // a valid handshake on a new stream does not lift the rejection
  roles.store(Roles::FULL.0, Ordering::SeqCst);
  assert!(odd.send_to(honest_id, &announce(6)).await.is_err());
  assert!(odd.send_to(honest_id, &announce(7)).await.is_err());

  sleep(Duration::from_secs(1)).await;
  assert_eq!(received.load(Ordering::SeqCst), 0);
  assert!(honest.peers().contains(&odd_id));
  assert!(honest.reputation(&odd_id).unwrap() > BANNED_THRESHOLD);
}

#[test_log::test(tokio::test(start_paused = true))]
async fn invalid_response_handshake_fails_later_sends_locally() {
  let hub = MemoryNetwork::new();
  let (odd, odd_received) = chain_node_with(
    &hub,
    || chain_handshake([1; 32], Roles(0x80)),
    false,
  );
  let (honest, _) = chain_node(&hub, [1; 32], false);
  connect(&honest, &odd).await;

  let odd_id = odd.local_peer_id();
  assert!(matches!(
    honest.send_to(odd_id, &announce(5)).await,
    Err(Error::Notifications(notifications::Error::HandshakeRejected(_)))
  ));

  let written = honest.bandwidth().peer(&odd_id).unwrap().outbound;
  assert!(matches!(
    honest.send_to(odd_id, &announce(6)).await,
    Err(Error::Notifications(notifications::Error::InvalidHandshake(peer)))
      if peer == odd_id
  ));

  // nothing was written, no stream was opened
  assert_eq!(honest.bandwidth().peer(&odd_id).unwrap().outbound, written);
  sleep(Duration::from_secs(1)).await;
  assert_eq!(odd.handshakes(BLOCK_ANNOUNCE_TYPE), (0, 0));
  assert_eq!(odd_received.load(Ordering::SeqCst), 0);
  assert!(honest.peers().contains(&odd_id));
}

#[test_log::test(tokio::test(start_paused = true))]
async fn quiet_stream_is_replaced_before_it_is_reaped() {
  let hub = MemoryNetwork::new();
  let config = Config {
    stream_idle_interval: Duration::from_secs(10),
    ..common::config()
  };
  let sender = node(&hub, config.clone());
  let receiver = node(&hub, config);
  let received = Arc::new(AtomicUsize::new(0));

  sender.register_protocol(ping_protocol(Arc::default())).unwrap();
  receiver
    .register_protocol(ping_protocol(Arc::clone(&received)))
    .unwrap();
  sender.start().unwrap();
  receiver.start().unwrap();
  connect(&sender, &receiver).await;

  sender.broadcast(&Ping::new(b"first")).unwrap();
  wait_until(|| received.load(Ordering::SeqCst) == 1).await;

  // the receiver closed the silent stream in the meantime
  sleep(Duration::from_secs(25)).await;
  assert_eq!(receiver.handshakes(PING_TYPE), (0, 0));
  assert_eq!(sender.handshakes(PING_TYPE), (0, 1));

  sender.broadcast(&Ping::new(b"second")).unwrap();
  wait_until(|| received.load(Ordering::SeqCst) == 2).await;
  assert_eq!(receiver.handshakes(PING_TYPE), (1, 0));
}

/// Node on the transactions protocol counting received transactions,
/// relaying them if `relay` is set.
fn tx_node(hub: &MemoryNetwork, relay: bool) -> (Network, Arc<AtomicUsize>) {
  let network = node(hub, Config {
    batch_size: 10,
    maintenance_tick_interval: Duration::from_secs(1),
    ..common::config()
  });
  let received = Arc::new(AtomicUsize::new(0));
  let counter = Arc::clone(&received);

  network
    .register_protocol(transactions("/test/tx/1", move |batch| {
      counter.fetch_add(batch.len(), Ordering::SeqCst);
      batch.iter().map(|_| Ok(relay)).collect()
    }))
    .unwrap();
  network.start().unwrap();
  (network, received)
}

#[test_log::test(tokio::test(start_paused = true))]
async fn relay_skips_peers_holding_the_message() {
  let hub = MemoryNetwork::new();
  let (relay, _) = tx_node(&hub, true);
  let (origin, origin_received) = tx_node(&hub, false);
  let (holder, holder_received) = tx_node(&hub, false);
  let (downstream, downstream_received) = tx_node(&hub, false);
  for peer in [&origin, &holder, &downstream] {
    connect(peer, &relay).await;
  }

  // both arrive before the relay flushes its batch, whichever comes
  // second is penalized as a duplicate
  let message = Transactions {
    extrinsics: vec![Bytes::from_static(b"tx")],
  };
  let relay_id = relay.local_peer_id();
  origin.send_to(relay_id, &message).await.unwrap();
  holder.send_to(relay_id, &message).await.unwrap();

  let senders = [origin.local_peer_id(), holder.local_peer_id()];
  wait_until(|| {
    senders
      .iter()
      .any(|peer| matches!(relay.reputation(peer), Some(r) if r < 0))
  })
  .await;
  wait_until(|| downstream_received.load(Ordering::SeqCst) == 1).await;

  sleep(Duration::from_secs(3)).await;
  assert_eq!(downstream_received.load(Ordering::SeqCst), 1);
  assert_eq!(origin_received.load(Ordering::SeqCst), 0);
  assert_eq!(holder_received.load(Ordering::SeqCst), 0);
  assert_eq!(relay.handshakes(TRANSACTIONS_TYPE), (2, 1));
}
