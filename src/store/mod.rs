//! Durable storage for timer entries.
//!
//! [`TimerStore`] is the only shared mutable resource in the scheduler. Every call
//! must be atomic per key and safe to issue concurrently from many partitions and
//! many scheduler instances. Cross-key consistency (index vs. value) is kept by
//! convention: readers that find a dangling or undecodable record purge it and move on.

use crate::entry::{EntryId, Partition, TimerEntry};
use crate::error::StoreError;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

pub mod memory;
#[cfg(feature = "redis_store")]
pub mod redis;

pub use memory::MemoryStore;
#[cfg(feature = "redis_store")]
pub use self::redis::{RedisStore, RedisStoreConfig};

/// Storage contract every backing store implements.
///
/// `partition == None` addresses the unpartitioned keyspace used by the
/// single-partition scheduler.
#[async_trait]
pub trait TimerStore<P>: Send + Sync {
  /// Durably persists `entry`. Visible to `find_due`/`count` once this returns.
  async fn save(&self, entry: &TimerEntry<P>, partition: Option<Partition>) -> Result<(), StoreError>;

  /// Removes an entry. Removing an unknown id is a no-op, never an error.
  async fn remove(&self, id: EntryId, partition: Option<Partition>) -> Result<(), StoreError>;

  /// Number of entries with `release_time <= cutoff`.
  async fn count(&self, cutoff: DateTime<Utc>, partition: Option<Partition>) -> Result<u64, StoreError>;

  /// Up to `limit` entries with `release_time <= cutoff`, ascending by release time
  /// where the backend allows it. Undecodable or dangling records are purged, not returned.
  async fn find_due(
    &self,
    cutoff: DateTime<Utc>,
    limit: usize,
    partition: Option<Partition>,
  ) -> Result<Vec<TimerEntry<P>>, StoreError>;

  /// Tries to take a short-lived exclusive lease on a partition's scan.
  ///
  /// Returns `Ok(true)` when `holder` now owns the lease (or already did).
  /// Stores without lease support grant every request.
  async fn try_lease(
    &self,
    _partition: Option<Partition>,
    _holder: Uuid,
    _ttl: Duration,
  ) -> Result<bool, StoreError> {
    Ok(true)
  }

  /// Releases a lease if `holder` still owns it. Releasing a lease held by
  /// someone else, or not held at all, is a no-op.
  async fn release_lease(&self, _partition: Option<Partition>, _holder: Uuid) -> Result<(), StoreError> {
    Ok(())
  }
}
