//! In-process [`TimerStore`]: ordered per-partition index guarded by `parking_lot` locks.
//!
//! Nothing survives a restart. Useful for tests, single-node deployments and as the
//! reference behavior the Redis store is checked against.

use super::TimerStore;
use crate::entry::{EntryId, Partition, TimerEntry};
use crate::error::StoreError;

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use tracing::trace;
use uuid::Uuid;

#[derive(Debug)]
struct PartitionIndex<P> {
  by_time: BTreeMap<(DateTime<Utc>, EntryId), P>,
  release_times: HashMap<EntryId, DateTime<Utc>>,
}

impl<P> Default for PartitionIndex<P> {
  fn default() -> Self {
    Self {
      by_time: BTreeMap::new(),
      release_times: HashMap::new(),
    }
  }
}

#[derive(Debug, Clone, Copy)]
struct Lease {
  holder: Uuid,
  expires_at: Instant,
}

/// Thread-safe in-memory store.
#[derive(Debug)]
pub struct MemoryStore<P> {
  partitions: RwLock<HashMap<Option<Partition>, PartitionIndex<P>>>,
  leases: Mutex<HashMap<Option<Partition>, Lease>>,
}

impl<P> Default for MemoryStore<P> {
  fn default() -> Self {
    Self {
      partitions: RwLock::new(HashMap::new()),
      leases: Mutex::new(HashMap::new()),
    }
  }
}

impl<P> MemoryStore<P> {
  pub fn new() -> Self {
    Self::default()
  }

  /// Total entries held for `partition`, due or not.
  pub fn len(&self, partition: Option<Partition>) -> usize {
    self
      .partitions
      .read()
      .get(&partition)
      .map_or(0, |index| index.release_times.len())
  }

  /// Whether `id` is currently stored in `partition`.
  pub fn contains(&self, id: EntryId, partition: Option<Partition>) -> bool {
    self
      .partitions
      .read()
      .get(&partition)
      .is_some_and(|index| index.release_times.contains_key(&id))
  }
}

#[async_trait]
impl<P: Clone + Send + Sync + 'static> TimerStore<P> for MemoryStore<P> {
  async fn save(&self, entry: &TimerEntry<P>, partition: Option<Partition>) -> Result<(), StoreError> {
    let mut partitions = self.partitions.write();
    let index = partitions.entry(partition).or_default();
    // Saving an existing id replaces it; drop the stale index position first.
    if let Some(previous) = index.release_times.insert(entry.id(), entry.release_time()) {
      index.by_time.remove(&(previous, entry.id()));
    }
    index
      .by_time
      .insert((entry.release_time(), entry.id()), entry.payload().clone());
    trace!(entry_id = %entry.id(), ?partition, release_time = %entry.release_time(), "Saved entry.");
    Ok(())
  }

  async fn remove(&self, id: EntryId, partition: Option<Partition>) -> Result<(), StoreError> {
    let mut partitions = self.partitions.write();
    if let Some(index) = partitions.get_mut(&partition) {
      if let Some(release_time) = index.release_times.remove(&id) {
        index.by_time.remove(&(release_time, id));
        trace!(entry_id = %id, ?partition, "Removed entry.");
      }
    }
    Ok(())
  }

  async fn count(&self, cutoff: DateTime<Utc>, partition: Option<Partition>) -> Result<u64, StoreError> {
    let partitions = self.partitions.read();
    let count = partitions.get(&partition).map_or(0, |index| {
      index
        .by_time
        .keys()
        .take_while(|(release_time, _)| *release_time <= cutoff)
        .count()
    });
    Ok(count as u64)
  }

  async fn find_due(
    &self,
    cutoff: DateTime<Utc>,
    limit: usize,
    partition: Option<Partition>,
  ) -> Result<Vec<TimerEntry<P>>, StoreError> {
    let partitions = self.partitions.read();
    let due = partitions.get(&partition).map_or_else(Vec::new, |index| {
      index
        .by_time
        .iter()
        .take_while(|((release_time, _), _)| *release_time <= cutoff)
        .take(limit)
        .map(|((release_time, id), payload)| TimerEntry::with_id(*id, payload.clone(), *release_time))
        .collect()
    });
    Ok(due)
  }

  async fn try_lease(&self, partition: Option<Partition>, holder: Uuid, ttl: Duration) -> Result<bool, StoreError> {
    let now = Instant::now();
    let mut leases = self.leases.lock();
    match leases.get(&partition) {
      Some(lease) if lease.holder != holder && lease.expires_at > now => Ok(false),
      _ => {
        leases.insert(
          partition,
          Lease {
            holder,
            expires_at: now + ttl,
          },
        );
        Ok(true)
      }
    }
  }

  async fn release_lease(&self, partition: Option<Partition>, holder: Uuid) -> Result<(), StoreError> {
    let mut leases = self.leases.lock();
    if leases.get(&partition).is_some_and(|lease| lease.holder == holder) {
      leases.remove(&partition);
    }
    Ok(())
  }
}
