use {bytes::BytesMut, metrics::increment_counter, parking_lot::Mutex};

/// A bounded pool of reusable byte buffers.
///
/// Every inbound stream needs a read buffer for its whole lifetime and
/// every outbound write needs a scratch buffer to encode the frame into.
/// Buffers are handed out from here and returned when they are dropped
/// by their users. When the pool is exhausted a fresh buffer is
/// allocated, and when it is full returned buffers are discarded.
#[derive(Debug)]
pub struct BufferPool {
  capacity: usize,
  buffer_size: usize,
  buffers: Mutex<Vec<BytesMut>>,
}

impl BufferPool {
  pub fn new(capacity: usize, buffer_size: usize) -> Self {
    Self {
      capacity,
      buffer_size,
      buffers: Mutex::new(Vec::with_capacity(capacity)),
    }
  }

  /// Returns an empty buffer, reused if one is available.
  pub fn get(&self) -> BytesMut {
    match self.buffers.lock().pop() {
      Some(buffer) => buffer,
      None => {
        increment_counter!("buffer_pool_allocations");
        BytesMut::with_capacity(self.buffer_size)
      }
    }
  }

  /// Hands a buffer back to the pool.
  ///
  /// Buffers that grew beyond the pool's buffer size while in use
  /// are not kept, so the pool memory stays bounded by
  /// `capacity * buffer_size`.
  pub fn put(&self, mut buffer: BytesMut) {
    if buffer.capacity() > self.buffer_size {
      return;
    }

    let mut buffers = self.buffers.lock();
    if buffers.len() < self.capacity {
      buffer.clear();
      buffers.push(buffer);
    }
  }

  pub fn len(&self) -> usize {
    self.buffers.lock().len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}
