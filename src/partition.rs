//! Partition assignment strategies.
//!
//! A partition function maps a payload to a partition in `[0, n)` where `n` is the
//! scheduler's registered partition count. Entries whose payloads share a key land
//! in the same partition, which keeps their relative release order within a batch.

use crate::entry::Partition;

use std::sync::Arc;

use uuid::Uuid;

/// Pluggable sharding strategy: `(payload, registered_partition_count) -> partition`.
pub type PartitionFn<P> = Arc<dyn Fn(&P, u32) -> Partition + Send + Sync + 'static>;

/// FNV-1a 32-bit hash. Stable across processes and releases, unlike `std`'s hasher.
#[inline]
pub fn fnv1a32(data: &[u8]) -> u32 {
  const FNV_OFFSET_BASIS: u32 = 2166136261;
  const FNV_PRIME: u32 = 16777619;

  let mut hash = FNV_OFFSET_BASIS;
  for byte in data {
    hash ^= *byte as u32;
    hash = hash.wrapping_mul(FNV_PRIME);
  }
  hash
}

/// Maps arbitrary key bytes onto `[0, partitions)`.
#[inline]
pub fn partition_for_key(key: &[u8], partitions: u32) -> Partition {
  fnv1a32(key) % partitions.max(1)
}

/// Builds a partition function from a key extractor.
/// Payloads with equal keys are always assigned the same partition.
pub fn partition_by_key<P, K, F>(key_fn: F) -> PartitionFn<P>
where
  F: Fn(&P) -> K + Send + Sync + 'static,
  K: AsRef<[u8]>,
{
  Arc::new(move |payload: &P, partitions: u32| {
    partition_for_key(key_fn(payload).as_ref(), partitions)
  })
}

/// Spreads payloads uniformly with no affinity.
pub fn random_partition<P>() -> PartitionFn<P> {
  Arc::new(|_: &P, partitions: u32| partition_for_key(Uuid::new_v4().as_bytes(), partitions))
}
