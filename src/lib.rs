//! DelayKeeper: A Partitioned Delayed-Message Scheduler
//!
//! Lets a message carry a future release time, persists it durably, and hands it back
//! to your code once that time has arrived. Delivery is at-least-once: an entry is
//! removed only after your callback accepts it, and a failed callback leaves the entry
//! in place to be offered again on the next release call.
//!
//! # Features
//!
//! - Two scheduler flavors behind one [`DelayScheduler`] trait:
//!   - [`SinglePartitionScheduler`]: one keyspace, one scan loop.
//!   - [`PartitionedScheduler`]: entries sharded by a pluggable [`partition::PartitionFn`],
//!     partitions drained in bounded batches, optionally in parallel on a worker pool.
//! - Full-drain release: one `release_due` call empties the backlog that was due when it
//!   started, requeueing partitions that returned a full batch and made progress.
//! - Independent registered/scanned partition counts for live partition-count migrations.
//! - Opaque, versioned [`RegistrationToken`]s for cancellation (legacy `"<id>:{<n>}"` tokens
//!   still decode).
//! - Pluggable [`store::TimerStore`] backends:
//!   - [`MemoryStore`]: in-process.
//!   - `RedisStore`: sorted-set index + TTL'd value hashes, self-healing on corrupt or
//!     dangling records (requires the `redis_store` feature).
//! - Optional per-partition scan leases so overlapping release calls skip busy partitions.
//! - A [`ReleaseTicker`] to drive `release_due` from one background task.
//! - Built-in metrics (queryable snapshot using [`MetricsSnapshot`]).
//! - Optional Serde support for configuration, tokens, reports and metrics
//!   (requires the `serde` feature).
//!
//! # Usage
//!
//! ```no_run
//! use delaykeeper::{
//!     DelayKeeper, DelayScheduler, MemoryStore, ReleaseTicker, release_fn,
//!     partition::partition_by_key,
//! };
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // tracing_subscriber::fmt().with_env_filter("warn,delaykeeper=info").init();
//!
//!     let store = Arc::new(MemoryStore::<String>::new());
//!     let scheduler = DelayKeeper::partitioned(store)
//!         .registered_partitions(4)
//!         .count_per_release(100)
//!         .partition_fn(partition_by_key(|msg: &String| msg.clone()))
//!         .max_workers(4)
//!         .build()?;
//!     let scheduler = Arc::new(scheduler);
//!
//!     // Register a message for release in 2 seconds. Keep the token to cancel it.
//!     let token = scheduler
//!         .register_after("order-42 reminder".to_string(), Duration::from_secs(2))
//!         .await?;
//!     println!("Registered: {}", token);
//!
//!     // Drive releases from a single ticker.
//!     let ticker = ReleaseTicker::start(
//!         scheduler.clone(),
//!         Duration::from_millis(500),
//!         release_fn(|msg: String| async move {
//!             println!("Delivering {}", msg);
//!             Ok(())
//!         }),
//!     );
//!
//!     tokio::time::sleep(Duration::from_secs(3)).await;
//!     println!("Metrics: {:#?}", scheduler.metrics_snapshot());
//!
//!     ticker.shutdown(Some(Duration::from_secs(5))).await?;
//!     Ok(())
//! }
//! ```
//!
//! # Configuration
//!
//! Use [`DelayKeeper::single`] or [`DelayKeeper::partitioned`] to get a builder:
//! - `count_per_release`: batch size per partition per pass.
//! - `registered_partitions` / `scan_partitions`: assignment width vs. scan width.
//! - `partition_fn`: sharding strategy (see [`partition`]).
//! - `max_workers`: run each partition's pass as its own task, at most N at a time.
//! - `partition_lease`: guard partition scans with a store lease.
//!
//! # Delivery Semantics
//!
//! - No ordering across partitions. Within a partition, each fetched batch is delivered
//!   in ascending release time.
//! - Callback failures are retried on every subsequent release call, without backoff.
//! - Overlapping `release_due` calls may deliver an entry twice; use one ticker or leases.
//!
//! # Observability
//!
//! - Retrieve counters with [`DelayScheduler::metrics_snapshot`]; each `release_due`
//!   also returns a [`ReleaseReport`].
//! - Integrate with the `tracing` crate for detailed logs.

pub mod entry;
pub mod error;
pub mod metrics;
pub mod partition;
pub mod partitioned;
pub mod scheduler;
pub mod single;
pub mod store;
pub mod ticker;
pub mod token;

// --- Public Re-exports ---

// Scheduler entry points and shared types
pub use scheduler::{
  release_fn, BoxedReleaseFn, CallbackError, Clock, DelayKeeper, DelayScheduler, PartitionedBuilder,
  PartitionedConfig, ReleaseFuture, ReleaseReport, SingleBuilder,
};
pub use partitioned::PartitionedScheduler;
pub use single::SinglePartitionScheduler;
pub use ticker::ReleaseTicker;

// Data model
pub use entry::{EntryId, Partition, Payload, TimerEntry};
pub use token::RegistrationToken;

// Stores
pub use store::{MemoryStore, TimerStore};
#[cfg(feature = "redis_store")]
pub use store::{RedisStore, RedisStoreConfig};

// Error types
pub use error::{BuildError, CancelError, ShutdownError, StoreError, TokenError};

// Metrics related types
pub use metrics::{MetricsSnapshot, SchedulerMetrics};
