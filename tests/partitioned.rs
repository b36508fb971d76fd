//! tests/partitioned.rs
//! Release algorithm of the partitioned scheduler (sequential mode).

mod common;

use std::sync::Arc;
use std::time::Duration as StdDuration;

use crate::common::{
  recording_callback, seed, selective_callback, setup_tracing, FaultyStore, ManualClock, Msg,
};
use chrono::{Duration as ChronoDuration, Utc};
use delaykeeper::partition::partition_by_key;
use delaykeeper::{DelayKeeper, DelayScheduler, MemoryStore, PartitionedScheduler, TimerStore};
use parking_lot::Mutex;
use uuid::Uuid;

fn always_partition_zero() -> delaykeeper::partition::PartitionFn<Msg> {
  Arc::new(|_: &Msg, _: u32| 0u32)
}

fn build(
  store: Arc<MemoryStore<Msg>>,
  clock: &ManualClock,
  partitions: u32,
  count_per_release: usize,
) -> PartitionedScheduler<Msg> {
  DelayKeeper::partitioned(store)
    .registered_partitions(partitions)
    .count_per_release(count_per_release)
    .partition_fn(always_partition_zero())
    .clock(clock.clock())
    .build()
    .expect("valid config")
}

#[tokio::test]
async fn test_full_drain_across_passes() {
  setup_tracing();
  let clock = ManualClock::new(Utc::now());
  let store = Arc::new(MemoryStore::<Msg>::new());
  let scheduler = build(store.clone(), &clock, 4, 2);

  for seq in 0..5 {
    scheduler
      .register_at(Msg::new("k", seq), clock.now() - ChronoDuration::seconds(10 - seq as i64))
      .await
      .unwrap();
  }
  assert_eq!(store.len(Some(0)), 5);

  let delivered = Arc::new(Mutex::new(Vec::new()));
  let report = scheduler.release_due(recording_callback(delivered.clone())).await;

  assert_eq!(report.released, 5);
  assert_eq!(report.failed, 0);
  // Partition 0 drains in batches of 2, 2, 1.
  assert_eq!(report.passes, 3);
  assert_eq!(delivered.lock().len(), 5);
  assert_eq!(store.count(clock.now(), Some(0)).await.unwrap(), 0);

  // Within the partition, batches arrive in release-time order.
  let seqs: Vec<u32> = delivered.lock().iter().map(|m| m.seq).collect();
  assert_eq!(seqs, vec![0, 1, 2, 3, 4]);

  let metrics = scheduler.metrics_snapshot();
  assert_eq!(metrics.entries_registered, 5);
  assert_eq!(metrics.entries_released, 5);
  assert_eq!(metrics.release_invocations, 1);
  assert_eq!(metrics.release_passes, 3);
}

#[tokio::test]
async fn test_future_entries_wait_for_their_release_time() {
  setup_tracing();
  let clock = ManualClock::new(Utc::now());
  let store = Arc::new(MemoryStore::<Msg>::new());
  let scheduler = build(store.clone(), &clock, 2, 10);

  scheduler
    .register_after(Msg::new("later", 1), StdDuration::from_secs(60))
    .await
    .unwrap();
  scheduler
    .register_at(Msg::new("now", 0), clock.now())
    .await
    .unwrap();

  let delivered = Arc::new(Mutex::new(Vec::new()));
  let report = scheduler.release_due(recording_callback(delivered.clone())).await;
  assert_eq!(report.released, 1);
  assert_eq!(delivered.lock()[0].key, "now");
  assert_eq!(scheduler.pending_count().await.unwrap(), 0);

  clock.advance(ChronoDuration::seconds(60));
  assert_eq!(scheduler.pending_count().await.unwrap(), 1);
  let report = scheduler.release_due(recording_callback(delivered.clone())).await;
  assert_eq!(report.released, 1);
  assert_eq!(delivered.lock()[1].key, "later");
}

#[tokio::test]
async fn test_failed_entry_is_retained_and_offered_again() {
  setup_tracing();
  let clock = ManualClock::new(Utc::now());
  let store = Arc::new(MemoryStore::<Msg>::new());
  let scheduler = build(store.clone(), &clock, 2, 10);

  let token = scheduler
    .register_at(Msg::new("flaky", 7), clock.now() - ChronoDuration::seconds(1))
    .await
    .unwrap();
  scheduler
    .register_at(Msg::new("fine", 8), clock.now() - ChronoDuration::seconds(1))
    .await
    .unwrap();

  let offered = Arc::new(Mutex::new(Vec::new()));
  let report = scheduler
    .release_due(selective_callback(offered.clone(), |m| m.key == "flaky"))
    .await;
  assert_eq!(report.released, 1);
  assert_eq!(report.failed, 1);
  assert!(store.contains(token.entry_id(), token.partition()));

  // Next invocation offers it again; this time it succeeds.
  let report = scheduler
    .release_due(selective_callback(offered.clone(), |_| false))
    .await;
  assert_eq!(report.released, 1);
  assert!(!store.contains(token.entry_id(), token.partition()));

  let flaky_offers = offered.lock().iter().filter(|m| m.key == "flaky").count();
  assert_eq!(flaky_offers, 2);
  assert_eq!(scheduler.metrics_snapshot().release_callback_failures, 1);
}

#[tokio::test]
async fn test_failing_head_of_line_does_not_spin() {
  setup_tracing();
  let clock = ManualClock::new(Utc::now());
  let store = Arc::new(MemoryStore::<Msg>::new());
  let scheduler = build(store.clone(), &clock, 1, 2);

  seed(store.as_ref(), "poison", 3, clock.now() - ChronoDuration::seconds(5), Some(0)).await;

  let offered = Arc::new(Mutex::new(Vec::new()));
  let report = scheduler
    .release_due(selective_callback(offered.clone(), |_| true))
    .await;

  // Full batch, zero progress: no requeue.
  assert_eq!(report.passes, 1);
  assert_eq!(report.failed, 2);
  assert_eq!(report.released, 0);
  assert_eq!(offered.lock().len(), 2);
  assert_eq!(store.len(Some(0)), 3);
}

#[tokio::test]
async fn test_partial_progress_keeps_requeueing() {
  setup_tracing();
  let clock = ManualClock::new(Utc::now());
  let store = Arc::new(MemoryStore::<Msg>::new());
  let scheduler = build(store.clone(), &clock, 1, 2);

  // seq 0 is earliest and always fails; 1..=3 succeed.
  seed(store.as_ref(), "mixed", 4, clock.now() - ChronoDuration::seconds(5), Some(0)).await;

  let offered = Arc::new(Mutex::new(Vec::new()));
  let report = scheduler
    .release_due(selective_callback(offered.clone(), |m| m.seq == 0))
    .await;

  // Passes fetch [0,1], [0,2], [0,3], [0]; the last batch is short.
  assert_eq!(report.passes, 4);
  assert_eq!(report.released, 3);
  assert_eq!(report.failed, 4);
  assert_eq!(store.len(Some(0)), 1);
}

#[tokio::test]
async fn test_partitions_drain_independently() {
  setup_tracing();
  let clock = ManualClock::new(Utc::now());
  let store = Arc::new(MemoryStore::<Msg>::new());
  let scheduler = DelayKeeper::partitioned(store.clone())
    .registered_partitions(4)
    .count_per_release(3)
    .partition_fn(partition_by_key(|m: &Msg| m.key.clone()))
    .clock(clock.clock())
    .build()
    .unwrap();

  let keys = ["alpha", "beta", "gamma", "delta", "epsilon"];
  for key in keys {
    for seq in 0..4 {
      scheduler
        .register_at(Msg::new(key, seq), clock.now() - ChronoDuration::seconds(1))
        .await
        .unwrap();
    }
  }
  assert_eq!(scheduler.pending_count().await.unwrap(), 20);

  let delivered = Arc::new(Mutex::new(Vec::new()));
  let report = scheduler.release_due(recording_callback(delivered.clone())).await;
  assert_eq!(report.released, 20);
  assert_eq!(scheduler.pending_count().await.unwrap(), 0);
  for partition in 0..4 {
    assert_eq!(store.len(Some(partition)), 0);
  }
}

#[tokio::test]
async fn test_equal_keys_share_a_partition() {
  setup_tracing();
  let store = Arc::new(MemoryStore::<Msg>::new());
  let scheduler = DelayKeeper::partitioned(store.clone())
    .registered_partitions(16)
    .partition_fn(partition_by_key(|m: &Msg| m.key.clone()))
    .build()
    .unwrap();

  let a = scheduler.register(Msg::new("tenant-1", 1)).await.unwrap();
  let b = scheduler.register(Msg::new("tenant-1", 2)).await.unwrap();
  assert_eq!(a.partition(), b.partition());
  assert_eq!(a.partition(), Some(scheduler.partition_for(&Msg::new("tenant-1", 99))));
  assert!(a.partition().unwrap() < 16);
}

#[tokio::test]
async fn test_out_of_range_partition_fn_is_wrapped() {
  setup_tracing();
  let store = Arc::new(MemoryStore::<Msg>::new());
  let scheduler = DelayKeeper::partitioned(store.clone())
    .registered_partitions(4)
    .partition_fn(Arc::new(|_: &Msg, _: u32| 9u32))
    .build()
    .unwrap();

  let token = scheduler.register(Msg::new("x", 0)).await.unwrap();
  assert_eq!(token.partition(), Some(1));
  assert_eq!(store.len(Some(1)), 1);
}

#[tokio::test]
async fn test_scan_wider_than_registered_drains_migrated_partitions() {
  setup_tracing();
  let clock = ManualClock::new(Utc::now());
  let store = Arc::new(MemoryStore::<Msg>::new());

  // Entries written while the deployment still used 8 partitions.
  seed(store.as_ref(), "old", 3, clock.now() - ChronoDuration::minutes(1), Some(6)).await;
  seed(store.as_ref(), "old", 2, clock.now() - ChronoDuration::minutes(1), Some(3)).await;

  let scheduler = DelayKeeper::partitioned(store.clone())
    .registered_partitions(2)
    .scan_partitions(8)
    .count_per_release(10)
    .clock(clock.clock())
    .build()
    .unwrap();

  let token = scheduler.register(Msg::new("new", 0)).await.unwrap();
  assert!(token.partition().unwrap() < 2);
  assert_eq!(scheduler.pending_count().await.unwrap(), 6);

  let delivered = Arc::new(Mutex::new(Vec::new()));
  let report = scheduler.release_due(recording_callback(delivered.clone())).await;
  assert_eq!(report.released, 6);
  assert_eq!(store.len(Some(6)), 0);
  assert_eq!(store.len(Some(3)), 0);
}

#[tokio::test]
async fn test_store_failure_is_isolated_to_its_partition() {
  setup_tracing();
  let clock = ManualClock::new(Utc::now());
  let store = Arc::new(FaultyStore::new(MemoryStore::new(), vec![Some(1)]));
  let scheduler = DelayKeeper::partitioned(store.clone())
    .registered_partitions(3)
    .count_per_release(5)
    .clock(clock.clock())
    .build()
    .unwrap();

  for partition in 0..3 {
    seed(&store.inner, "p", 2, clock.now() - ChronoDuration::seconds(1), Some(partition)).await;
  }

  let delivered = Arc::new(Mutex::new(Vec::new()));
  let report = scheduler.release_due(recording_callback(delivered.clone())).await;
  assert_eq!(report.released, 4);
  assert_eq!(report.store_errors, 1);
  assert_eq!(store.inner.len(Some(1)), 2);
  assert_eq!(scheduler.metrics_snapshot().store_errors, 1);

  store.heal();
  let report = scheduler.release_due(recording_callback(delivered.clone())).await;
  assert_eq!(report.released, 2);
  assert_eq!(report.store_errors, 0);
}

#[tokio::test]
async fn test_leased_partition_is_skipped() {
  setup_tracing();
  let clock = ManualClock::new(Utc::now());
  let store = Arc::new(MemoryStore::<Msg>::new());
  let scheduler = DelayKeeper::partitioned(store.clone())
    .registered_partitions(2)
    .count_per_release(5)
    .partition_lease(StdDuration::from_secs(30))
    .clock(clock.clock())
    .build()
    .unwrap();

  seed(store.as_ref(), "a", 2, clock.now() - ChronoDuration::seconds(1), Some(0)).await;
  seed(store.as_ref(), "b", 2, clock.now() - ChronoDuration::seconds(1), Some(1)).await;

  // Another replica is scanning partition 0.
  let other_replica = Uuid::new_v4();
  assert!(store
    .try_lease(Some(0), other_replica, StdDuration::from_secs(30))
    .await
    .unwrap());

  let delivered = Arc::new(Mutex::new(Vec::new()));
  let report = scheduler.release_due(recording_callback(delivered.clone())).await;
  assert_eq!(report.skipped_leased, 1);
  assert_eq!(report.released, 2);
  assert_eq!(store.len(Some(0)), 2);
  assert_eq!(scheduler.metrics_snapshot().partitions_skipped_leased, 1);

  // Our own leases were released after the pass.
  assert!(store
    .try_lease(Some(1), other_replica, StdDuration::from_secs(30))
    .await
    .unwrap());

  store.release_lease(Some(0), other_replica).await.unwrap();
  store.release_lease(Some(1), other_replica).await.unwrap();
  let report = scheduler.release_due(recording_callback(delivered.clone())).await;
  assert_eq!(report.released, 2);
  assert_eq!(report.skipped_leased, 0);
}

#[tokio::test]
async fn test_declared_release_time_is_honored() {
  #[derive(Clone)]
  struct Scheduled {
    at: chrono::DateTime<Utc>,
  }

  impl delaykeeper::Payload for Scheduled {
    const KIND: &'static str = "scheduled";

    fn release_time(&self) -> Option<chrono::DateTime<Utc>> {
      Some(self.at)
    }
  }

  setup_tracing();
  let clock = ManualClock::new(Utc::now());
  let store = Arc::new(MemoryStore::<Scheduled>::new());
  let scheduler = DelayKeeper::partitioned(store.clone())
    .registered_partitions(1)
    .clock(clock.clock())
    .build()
    .unwrap();

  scheduler
    .register(Scheduled {
      at: clock.now() + ChronoDuration::seconds(30),
    })
    .await
    .unwrap();
  assert_eq!(scheduler.pending_count().await.unwrap(), 0);
  clock.advance(ChronoDuration::seconds(30));
  assert_eq!(scheduler.pending_count().await.unwrap(), 1);
}
