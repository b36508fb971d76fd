//! tests/common.rs
//! Shared helper functions for integration tests.
#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use delaykeeper::{
  release_fn, BoxedReleaseFn, Clock, EntryId, Partition, Payload, StoreError, TimerEntry, TimerStore,
};
use parking_lot::Mutex;
use tracing_subscriber::fmt::TestWriter;
use uuid::Uuid;

// Initializes tracing subscriber for test output.
pub fn setup_tracing() {
  // Use try_init to avoid panic if called multiple times
  let _ = tracing_subscriber::fmt()
    .with_max_level(tracing::Level::DEBUG)
    .with_writer(TestWriter::new())
    .with_test_writer()
    .try_init();
}

/// Test payload: a routing key plus a sequence number.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Msg {
  pub key: String,
  pub seq: u32,
}

impl Msg {
  pub fn new(key: &str, seq: u32) -> Self {
    Self {
      key: key.to_string(),
      seq,
    }
  }
}

impl Payload for Msg {
  const KIND: &'static str = "test-msg";
}

/// A clock tests can move by hand.
#[derive(Clone)]
pub struct ManualClock {
  now: Arc<Mutex<DateTime<Utc>>>,
}

impl ManualClock {
  pub fn new(start: DateTime<Utc>) -> Self {
    Self {
      now: Arc::new(Mutex::new(start)),
    }
  }

  pub fn now(&self) -> DateTime<Utc> {
    *self.now.lock()
  }

  pub fn advance(&self, by: ChronoDuration) {
    let mut now = self.now.lock();
    *now = *now + by;
  }

  pub fn clock(&self) -> Clock {
    let now = self.now.clone();
    Arc::new(move || *now.lock())
  }
}

/// Records every delivered payload.
pub fn recording_callback(sink: Arc<Mutex<Vec<Msg>>>) -> Arc<BoxedReleaseFn<Msg>> {
  release_fn(move |msg: Msg| {
    let sink = sink.clone();
    async move {
      tracing::debug!(?msg, "Recording delivery");
      sink.lock().push(msg);
      Ok(())
    }
  })
}

/// Records every offered payload, failing those matching `fails`.
pub fn selective_callback<F>(offered: Arc<Mutex<Vec<Msg>>>, fails: F) -> Arc<BoxedReleaseFn<Msg>>
where
  F: Fn(&Msg) -> bool + Send + Sync + 'static,
{
  let fails = Arc::new(fails);
  release_fn(move |msg: Msg| {
    let offered = offered.clone();
    let fails = fails.clone();
    async move {
      let should_fail = fails(&msg);
      offered.lock().push(msg);
      if should_fail {
        Err("consumer rejected payload".into())
      } else {
        Ok(())
      }
    }
  })
}

/// Tracks the peak number of callbacks in flight at once.
pub fn concurrency_tracking_callback(
  active: Arc<AtomicUsize>,
  max_observed: Arc<AtomicUsize>,
  delivered: Arc<AtomicUsize>,
  delay: StdDuration,
) -> Arc<BoxedReleaseFn<Msg>> {
  release_fn(move |_msg: Msg| {
    let active = active.clone();
    let max_observed = max_observed.clone();
    let delivered = delivered.clone();
    async move {
      let current = active.fetch_add(1, Ordering::SeqCst) + 1;
      max_observed.fetch_max(current, Ordering::SeqCst);
      tokio::time::sleep(delay).await;
      active.fetch_sub(1, Ordering::SeqCst);
      delivered.fetch_add(1, Ordering::SeqCst);
      Ok(())
    }
  })
}

/// Saves `count` entries due at `release_time` straight into `partition`.
pub async fn seed<S: TimerStore<Msg>>(
  store: &S,
  key: &str,
  count: u32,
  release_time: DateTime<Utc>,
  partition: Option<Partition>,
) -> Vec<EntryId> {
  let mut ids = Vec::new();
  for seq in 0..count {
    // Stagger by a millisecond so batch order is deterministic.
    let entry = TimerEntry::new(
      Msg::new(key, seq),
      release_time + ChronoDuration::milliseconds(seq as i64),
    );
    store.save(&entry, partition).await.expect("seed save failed");
    ids.push(entry.id());
  }
  ids
}

/// Wraps a store and fails `find_due` for selected partitions.
pub struct FaultyStore<S> {
  pub inner: S,
  pub failing_partitions: Mutex<Vec<Option<Partition>>>,
  pub find_due_calls: AtomicUsize,
}

impl<S> FaultyStore<S> {
  pub fn new(inner: S, failing_partitions: Vec<Option<Partition>>) -> Self {
    Self {
      inner,
      failing_partitions: Mutex::new(failing_partitions),
      find_due_calls: AtomicUsize::new(0),
    }
  }

  pub fn heal(&self) {
    self.failing_partitions.lock().clear();
  }
}

#[async_trait]
impl<S: TimerStore<Msg>> TimerStore<Msg> for FaultyStore<S> {
  async fn save(&self, entry: &TimerEntry<Msg>, partition: Option<Partition>) -> Result<(), StoreError> {
    self.inner.save(entry, partition).await
  }

  async fn remove(&self, id: EntryId, partition: Option<Partition>) -> Result<(), StoreError> {
    self.inner.remove(id, partition).await
  }

  async fn count(&self, cutoff: DateTime<Utc>, partition: Option<Partition>) -> Result<u64, StoreError> {
    self.inner.count(cutoff, partition).await
  }

  async fn find_due(
    &self,
    cutoff: DateTime<Utc>,
    limit: usize,
    partition: Option<Partition>,
  ) -> Result<Vec<TimerEntry<Msg>>, StoreError> {
    self.find_due_calls.fetch_add(1, Ordering::SeqCst);
    if self.failing_partitions.lock().contains(&partition) {
      return Err(StoreError::Backend("injected fetch failure".to_string()));
    }
    self.inner.find_due(cutoff, limit, partition).await
  }

  async fn try_lease(&self, partition: Option<Partition>, holder: Uuid, ttl: StdDuration) -> Result<bool, StoreError> {
    self.inner.try_lease(partition, holder, ttl).await
  }

  async fn release_lease(&self, partition: Option<Partition>, holder: Uuid) -> Result<(), StoreError> {
    self.inner.release_lease(partition, holder).await
  }
}
