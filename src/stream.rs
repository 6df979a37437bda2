//! Framed access to raw transport streams.
//!
//! A single connection with a peer may carry many different
//! notification protocols simultaneously. The transport multiplexes
//! them into independent bidirectional streams, here we deal only
//! with turning one such stream into a sequence of length-prefixed
//! frames.

use {
  crate::{
    codec::{Codec, Error},
    pool::BufferPool,
    transport::BoxedStream,
  },
  asynchronous_codec::{Decoder, Encoder},
  bytes::{Bytes, BytesMut},
  dashmap::DashMap,
  futures::{AsyncReadExt, AsyncWriteExt},
  libp2p::PeerId,
  metrics::counter,
  std::{
    fmt::Debug,
    sync::{
      atomic::{AtomicU64, Ordering},
      Arc,
    },
    time::Duration,
  },
  tokio::time::Instant,
};

/// Size of a single read from the underlying stream.
const READ_CHUNK: usize = 4096;

/// Unique identifier of a stream within this process.
pub type StreamId = u64;

static NEXT_STREAM_ID: AtomicU64 = AtomicU64::new(1);

/// Number of bytes exchanged with one peer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PeerBandwidth {
  pub inbound: u64,
  pub outbound: u64,
}

/// Bandwidth accounting for all streams opened by the network.
///
/// Every byte read from or written to a framed stream is recorded
/// here, both as a network total and per remote peer.
#[derive(Debug, Default)]
pub struct Bandwidth {
  inbound: AtomicU64,
  outbound: AtomicU64,
  peers: DashMap<PeerId, PeerBandwidth>,
}

impl Bandwidth {
  pub fn total_inbound(&self) -> u64 {
    self.inbound.load(Ordering::Relaxed)
  }

  pub fn total_outbound(&self) -> u64 {
    self.outbound.load(Ordering::Relaxed)
  }

  pub fn peer(&self, peer: &PeerId) -> Option<PeerBandwidth> {
    self.peers.get(peer).map(|entry| *entry)
  }

  /// Drops per-peer counters, network totals are kept.
  pub fn forget(&self, peer: &PeerId) {
    self.peers.remove(peer);
  }

  fn record_inbound(&self, peer: &PeerId, bytes: usize) {
    self.inbound.fetch_add(bytes as u64, Ordering::Relaxed);
    self.peers.entry(*peer).or_default().inbound += bytes as u64;
    counter!("bandwidth_inbound_bytes", bytes as u64);
  }

  fn record_outbound(&self, peer: &PeerId, bytes: usize) {
    self.outbound.fetch_add(bytes as u64, Ordering::Relaxed);
    self.peers.entry(*peer).or_default().outbound += bytes as u64;
    counter!("bandwidth_outbound_bytes", bytes as u64);
  }
}

/// A transport stream with a remote peer on one protocol, read and
/// written in whole frames.
///
/// The read buffer is borrowed from the buffer pool for the lifetime
/// of the stream and handed back when the stream is dropped.
pub struct Substream {
  id: StreamId,
  peer: PeerId,
  protocol: String,
  io: BoxedStream,
  codec: Codec,
  read_buffer: BytesMut,
  pool: Arc<BufferPool>,
  bandwidth: Arc<Bandwidth>,
  /// Opening time until the first frame is written.
  last_write: Instant,
}

impl Substream {
  pub fn new(
    peer: PeerId,
    protocol: String,
    io: BoxedStream,
    max_message_size: usize,
    pool: Arc<BufferPool>,
    bandwidth: Arc<Bandwidth>,
  ) -> Self {
    Self {
      id: NEXT_STREAM_ID.fetch_add(1, Ordering::Relaxed),
      peer,
      protocol,
      io,
      codec: Codec::new(max_message_size),
      read_buffer: pool.get(),
      pool,
      bandwidth,
      last_write: Instant::now(),
    }
  }

  pub fn id(&self) -> StreamId {
    self.id
  }

  pub fn peer(&self) -> &PeerId {
    &self.peer
  }

  pub fn protocol(&self) -> &str {
    &self.protocol
  }

  /// Time since the last frame was written, or since the stream was
  /// opened if nothing was written yet.
  pub fn idle_for(&self) -> Duration {
    self.last_write.elapsed()
  }

  /// Changes the frame size limit for subsequent reads and writes.
  ///
  /// Request-response streams use different limits for the request
  /// and the response. Only call this between frames.
  pub fn set_max_message_size(&mut self, max_message_size: usize) {
    self.codec = Codec::new(max_message_size);
  }

  /// Waits for the next complete frame.
  ///
  /// Frames whose announced length exceeds the protocol maximum
  /// fail before their payload is buffered. A stream closed by the
  /// remote side yields [`Error::Eof`]. Cancelling this future
  /// between reads does not lose any bytes.
  pub async fn read_frame(&mut self) -> Result<Bytes, Error> {
    let mut chunk = [0u8; READ_CHUNK];
    loop {
      if let Some(frame) = self.codec.decode(&mut self.read_buffer)? {
        return Ok(frame);
      }

      let read = self.io.read(&mut chunk).await?;
      if read == 0 {
        return Err(Error::Eof);
      }

      self.bandwidth.record_inbound(&self.peer, read);
      self.read_buffer.extend_from_slice(&chunk[..read]);
    }
  }

  /// Writes one frame and flushes it.
  ///
  /// Payloads longer than the protocol maximum are rejected before
  /// anything is written to the stream.
  pub async fn write_frame(&mut self, payload: Bytes) -> Result<(), Error> {
    let mut buffer = self.pool.get();
    if let Err(e) = self.codec.encode(payload, &mut buffer) {
      self.pool.put(buffer);
      return Err(e);
    }

    let result = match self.io.write_all(&buffer).await {
      Ok(()) => self.io.flush().await,
      Err(e) => Err(e),
    };

    if result.is_ok() {
      self.bandwidth.record_outbound(&self.peer, buffer.len());
      self.last_write = Instant::now();
    }

    self.pool.put(buffer);
    Ok(result?)
  }

  /// Closes the write half of the stream.
  ///
  /// The remote end observes end of stream on its read side, our read
  /// side stays usable until the remote closes its write half.
  pub async fn close(&mut self) -> Result<(), Error> {
    Ok(self.io.close().await?)
  }
}

impl Drop for Substream {
  fn drop(&mut self) {
    self.pool.put(std::mem::take(&mut self.read_buffer));
  }
}

impl Debug for Substream {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Substream")
      .field("id", &self.id)
      .field("peer", &self.peer)
      .field("protocol", &self.protocol)
      .finish()
  }
}
