use {
  crate::stream::StreamId,
  dashmap::DashMap,
  metrics::{gauge, increment_counter},
  std::{sync::Arc, time::Duration},
  tokio::{
    sync::{watch, Notify},
    time::{interval, Instant, MissedTickBehavior},
  },
  tracing::debug,
};

#[derive(Debug)]
struct TrackedStream {
  /// Tracking instant until the first frame arrives.
  last_activity: Instant,
  /// Signalled when the stream should be closed by its owner.
  close: Arc<Notify>,
}

/// Closes streams that stay silent for too long.
///
/// Streams are owned by their servicing tasks, the reaper only holds
/// a close signal for each of them. Every `idle` interval it signals
/// all streams that have seen no activity for longer than the interval,
/// counting from the moment they were tracked, and stops tracking them.
#[derive(Debug)]
pub struct Reaper {
  idle: Duration,
  streams: DashMap<StreamId, TrackedStream>,
}

impl Reaper {
  pub fn new(idle: Duration) -> Self {
    Self {
      idle,
      streams: DashMap::new(),
    }
  }

  /// Starts tracking a stream. The owner of the stream should close
  /// it once the returned signal fires.
  pub fn track(&self, id: StreamId) -> Arc<Notify> {
    let close = Arc::new(Notify::new());
    self.streams.insert(id, TrackedStream {
      last_activity: Instant::now(),
      close: Arc::clone(&close),
    });
    close
  }

  /// Records activity on a stream.
  pub fn touch(&self, id: StreamId) {
    if let Some(mut stream) = self.streams.get_mut(&id) {
      stream.last_activity = Instant::now();
    }
  }

  pub fn untrack(&self, id: StreamId) {
    self.streams.remove(&id);
  }

  pub fn len(&self) -> usize {
    self.streams.len()
  }

  pub fn is_empty(&self) -> bool {
    self.streams.is_empty()
  }

  /// Signals and untracks all idle streams, returns how many.
  pub fn sweep(&self) -> usize {
    let idle = self.idle;
    let mut reaped = 0;
    self.streams.retain(|id, stream| {
      let expired = stream.last_activity.elapsed() > idle;

      if expired {
        debug!(stream = id, "closing idle stream");
        stream.close.notify_one();
        reaped += 1;
      }

      !expired
    });

    if reaped != 0 {
      increment_counter!("streams_reaped");
    }
    gauge!("tracked_streams", self.streams.len() as f64);
    reaped
  }

  /// Sweeps every idle interval until shutdown is signalled.
  pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = interval(self.idle);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    // the first tick completes immediately
    ticker.tick().await;
    loop {
      tokio::select! {
        _ = ticker.tick() => { self.sweep(); }
        _ = shutdown.changed() => break,
      }
    }
    debug!("stream reaper stopped");
  }
}

#[cfg(test)]
mod tests {
  use {super::*, std::time::Duration};

  #[tokio::test(start_paused = true)]
  async fn silent_and_idle_streams_are_reaped() {
    let reaper = Reaper::new(Duration::from_secs(10));
    let silent = reaper.track(1);
    let _active = reaper.track(2);
    let idle = reaper.track(3);

    reaper.touch(2);
    reaper.touch(3);
    tokio::time::advance(Duration::from_secs(5)).await;
    reaper.touch(2);
    tokio::time::advance(Duration::from_secs(6)).await;

    assert_eq!(reaper.sweep(), 2);
    assert_eq!(reaper.len(), 1);

    // permits are stored, so owners observe them even if they start
    // waiting after the sweep
    silent.notified().await;
    idle.notified().await;
  }

  #[tokio::test(start_paused = true)]
  async fn fresh_streams_survive_the_next_sweep() {
    let reaper = Reaper::new(Duration::from_secs(10));
    tokio::time::advance(Duration::from_secs(9)).await;
    let _fresh = reaper.track(1);

    tokio::time::advance(Duration::from_secs(1)).await;
    assert_eq!(reaper.sweep(), 0);
    assert_eq!(reaper.len(), 1);

    tokio::time::advance(Duration::from_secs(10)).await;
    assert_eq!(reaper.sweep(), 1);
    assert!(reaper.is_empty());
  }

  #[tokio::test(start_paused = true)]
  async fn runs_until_shutdown() {
    let reaper = Arc::new(Reaper::new(Duration::from_secs(1)));
    let (tx, rx) = watch::channel(false);
    let close = reaper.track(1);
    let task = tokio::spawn(Arc::clone(&reaper).run(rx));

    close.notified().await;
    assert!(reaper.is_empty());

    tx.send(true).unwrap();
    task.await.unwrap();
  }
}
