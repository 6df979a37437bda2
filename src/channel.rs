use {
  std::task::{Context, Poll},
  tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender},
};

/// FIFO queue polled from inside `poll` style state machines.
///
/// Values pushed from async code wake the task polling the receiving
/// side, which is how the swarm behaviour learns about new stream
/// requests and transport events.
pub struct Channel<T: Send> {
  tx: UnboundedSender<T>,
  rx: UnboundedReceiver<T>,
}

impl<T: Send> Channel<T> {
  pub fn new() -> Self {
    let (tx, rx) = unbounded_channel();
    Self { tx, rx }
  }

  pub fn send(&self, message: T) {
    // cannot fail, the receiver lives as long as this sender
    let _ = self.tx.send(message);
  }

  pub fn poll_recv(&mut self, cx: &mut Context<'_>) -> Poll<Option<T>> {
    self.rx.poll_recv(cx)
  }
}
