use crate::entry::{sort_by_release_time, Partition, Payload, TimerEntry};
use crate::error::{BuildError, CancelError, StoreError, TokenError};
use crate::metrics::{MetricsSnapshot, SchedulerMetrics};
use crate::partition::{random_partition, PartitionFn};
use crate::partitioned::PartitionedScheduler;
use crate::single::SinglePartitionScheduler;
use crate::store::TimerStore;
use crate::token::RegistrationToken;

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tracing::{debug, error, warn};

pub(crate) const DEFAULT_COUNT_PER_RELEASE: usize = 100;
pub(crate) const DEFAULT_REGISTERED_PARTITIONS: u32 = 8;

/// Error type release callbacks return to signal a failed delivery.
pub type CallbackError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Future returned by a release callback.
pub type ReleaseFuture = Pin<Box<dyn Future<Output = Result<(), CallbackError>> + Send + 'static>>;

/// The function due payloads are handed to.
///
/// `Ok(())` means the payload was delivered and its entry may be removed.
/// `Err(_)` leaves the entry stored; it is offered again on the next `release_due` call.
pub type BoxedReleaseFn<P> = Box<dyn Fn(P) -> ReleaseFuture + Send + Sync + 'static>;

/// Source of "now" for registration and scans. Defaults to [`Utc::now`].
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync + 'static>;

pub(crate) fn system_clock() -> Clock {
  Arc::new(Utc::now)
}

/// Wraps an async closure into the shared callback form `release_due` expects.
///
/// ```no_run
/// use delaykeeper::release_fn;
///
/// let callback = release_fn(|payload: String| async move {
///   println!("delivering {}", payload);
///   Ok(())
/// });
/// # let _ = callback;
/// ```
pub fn release_fn<P, F, Fut>(f: F) -> Arc<BoxedReleaseFn<P>>
where
  F: Fn(P) -> Fut + Send + Sync + 'static,
  Fut: Future<Output = Result<(), CallbackError>> + Send + 'static,
{
  let boxed: BoxedReleaseFn<P> = Box::new(move |payload: P| -> ReleaseFuture { Box::pin(f(payload)) });
  Arc::new(boxed)
}

/// Release time `delay` after `now`, saturating at the maximum representable instant.
pub(crate) fn release_time_after(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
  ChronoDuration::from_std(delay)
    .ok()
    .and_then(|delay| now.checked_add_signed(delay))
    .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Summary of one `release_due` invocation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ReleaseReport {
  /// Entries delivered and removed.
  pub released: usize,
  /// Callback failures; those entries remain stored.
  pub failed: usize,
  /// Store operations that failed (fetch, remove, lease).
  pub store_errors: usize,
  /// Partition tasks that panicked (worker pool mode).
  pub task_panics: usize,
  /// Passes run before the backlog was drained.
  pub passes: usize,
  /// Partitions skipped because another holder owned their lease.
  pub skipped_leased: usize,
}

impl ReleaseReport {
  pub(crate) fn absorb(&mut self, batch: &BatchOutcome) {
    self.released += batch.released;
    self.failed += batch.failed;
    self.store_errors += batch.store_errors;
  }
}

/// Result of dispatching one fetched batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct BatchOutcome {
  pub fetched: usize,
  pub released: usize,
  pub failed: usize,
  pub store_errors: usize,
}

impl BatchOutcome {
  /// Whether another pass over the same partition should follow: the batch was full
  /// (more may be waiting) and it shrank the backlog by at least one entry.
  pub(crate) fn warrants_requeue(&self, count_per_release: usize) -> bool {
    self.fetched == count_per_release && self.released > 0
  }
}

/// Sorts `batch`, invokes `callback` per entry and removes the delivered ones.
pub(crate) async fn release_batch<P: Payload>(
  store: &dyn TimerStore<P>,
  mut batch: Vec<TimerEntry<P>>,
  callback: &BoxedReleaseFn<P>,
  partition: Option<Partition>,
  metrics: &SchedulerMetrics,
) -> BatchOutcome {
  sort_by_release_time(&mut batch);
  let mut outcome = BatchOutcome {
    fetched: batch.len(),
    ..BatchOutcome::default()
  };

  for entry in batch {
    let entry_id = entry.id();
    let release_time = entry.release_time();
    match callback(entry.into_payload()).await {
      Ok(()) => match store.remove(entry_id, partition).await {
        Ok(()) => {
          outcome.released += 1;
          debug!(%entry_id, ?partition, %release_time, "Released entry.");
        }
        Err(err) => {
          // Delivered but still stored: it will be offered again (at-least-once).
          outcome.store_errors += 1;
          error!(%entry_id, ?partition, error = %err, "Failed to remove released entry.");
        }
      },
      Err(err) => {
        outcome.failed += 1;
        warn!(%entry_id, ?partition, error = %err, "Release callback failed; entry kept for retry.");
      }
    }
  }

  SchedulerMetrics::add(&metrics.entries_released, outcome.released);
  SchedulerMetrics::add(&metrics.release_callback_failures, outcome.failed);
  SchedulerMetrics::add(&metrics.store_errors, outcome.store_errors);
  outcome
}

/// Operations shared by both scheduler flavors.
///
/// `release_due` is synchronous with respect to the backlog: one call drains every
/// entry due at call time before returning. Nothing here runs on its own; drive it
/// from a single ticker (see [`crate::ticker::ReleaseTicker`]) or accept that
/// overlapping calls may deliver the same entry twice.
#[async_trait]
pub trait DelayScheduler<P: Payload>: Send + Sync {
  /// Current time as seen by this scheduler's clock.
  fn now(&self) -> DateTime<Utc>;

  /// Registers `payload` for release at its declared release time (or now).
  async fn register(&self, payload: P) -> Result<RegistrationToken, StoreError> {
    let release_time = payload.release_time().unwrap_or_else(|| self.now());
    self.register_at(payload, release_time).await
  }

  /// Registers `payload` for release at `release_time`, ignoring any declared time.
  async fn register_at(&self, payload: P, release_time: DateTime<Utc>) -> Result<RegistrationToken, StoreError>;

  /// Registers `payload` for release `delay` from now.
  async fn register_after(&self, payload: P, delay: Duration) -> Result<RegistrationToken, StoreError> {
    let release_time = release_time_after(self.now(), delay);
    self.register_at(payload, release_time).await
  }

  /// Cancels a registration. Cancelling an already released or cancelled entry succeeds.
  ///
  /// A token this scheduler could not have issued (unpartitioned on a partitioned
  /// scheduler, partitioned on a single one, or outside the scanned partitions) fails
  /// with [`CancelError::InvalidToken`] without touching the store.
  async fn cancel(&self, token: &RegistrationToken) -> Result<(), CancelError>;

  /// Decodes `token` and cancels it. Fails fast on a malformed token, touching nothing.
  async fn cancel_str(&self, token: &str) -> Result<(), CancelError> {
    let decoded = RegistrationToken::decode(token)?;
    self.cancel(&decoded).await.map_err(|err| match err {
      // Name the string the caller passed, not its canonical re-encoding.
      CancelError::InvalidToken(TokenError::Invalid(_)) => {
        CancelError::InvalidToken(TokenError::Invalid(token.to_string()))
      }
      other => other,
    })
  }

  /// Entries due now. For partitioned schedulers this is a sum of per-partition
  /// counts, not an atomic snapshot.
  async fn pending_count(&self) -> Result<u64, StoreError>;

  /// Delivers every entry due now to `callback`, removing the ones it accepts.
  async fn release_due(&self, callback: Arc<BoxedReleaseFn<P>>) -> ReleaseReport;

  /// Snapshot of this scheduler's counters.
  fn metrics_snapshot(&self) -> MetricsSnapshot;
}

/// Entry point for building schedulers.
///
/// # Example
///
/// ```no_run
/// use delaykeeper::{DelayKeeper, DelayScheduler, MemoryStore, release_fn, partition::partition_by_key};
/// use std::sync::Arc;
/// use std::time::Duration;
///
/// # async fn run() -> Result<(), Box<dyn std::error::Error>> {
/// let store = Arc::new(MemoryStore::<String>::new());
/// let scheduler = DelayKeeper::partitioned(store)
///   .registered_partitions(4)
///   .count_per_release(50)
///   .partition_fn(partition_by_key(|p: &String| p.clone()))
///   .max_workers(4)
///   .build()?;
///
/// let token = scheduler.register_after("hello".to_string(), Duration::from_secs(30)).await?;
/// scheduler.cancel(&token).await?;
///
/// let report = scheduler
///   .release_due(release_fn(|msg: String| async move {
///     println!("{}", msg);
///     Ok(())
///   }))
///   .await;
/// println!("{:?}", report);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, Copy)]
pub struct DelayKeeper;

impl DelayKeeper {
  /// Builder for a scheduler that keeps every entry in one unpartitioned keyspace.
  pub fn single<P, S>(store: Arc<S>) -> SingleBuilder<P>
  where
    P: Payload,
    S: TimerStore<P> + 'static,
  {
    SingleBuilder::new(store)
  }

  /// Builder for a scheduler that shards entries across partitions.
  pub fn partitioned<P, S>(store: Arc<S>) -> PartitionedBuilder<P>
  where
    P: Payload,
    S: TimerStore<P> + 'static,
  {
    PartitionedBuilder::new(store)
  }
}

// --- Single-partition builder ---

/// Builder for [`SinglePartitionScheduler`].
pub struct SingleBuilder<P> {
  store: Arc<dyn TimerStore<P>>,
  count_per_release: usize,
  clock: Clock,
}

impl<P> fmt::Debug for SingleBuilder<P> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("SingleBuilder")
      .field("count_per_release", &self.count_per_release)
      .field("store", &format_args!("<TimerStore>"))
      .finish()
  }
}

impl<P: Payload> SingleBuilder<P> {
  pub fn new<S: TimerStore<P> + 'static>(store: Arc<S>) -> Self {
    Self {
      store,
      count_per_release: DEFAULT_COUNT_PER_RELEASE,
      clock: system_clock(),
    }
  }

  /// Maximum entries fetched per batch (default 100).
  pub fn count_per_release(mut self, count: usize) -> Self {
    self.count_per_release = count;
    self
  }

  /// Overrides the time source (tests pin "now" with this).
  pub fn clock(mut self, clock: Clock) -> Self {
    self.clock = clock;
    self
  }

  /// # Errors
  ///
  /// [`BuildError::ZeroCountPerRelease`] if `count_per_release` is zero.
  pub fn build(self) -> Result<SinglePartitionScheduler<P>, BuildError> {
    if self.count_per_release == 0 {
      return Err(BuildError::ZeroCountPerRelease);
    }
    Ok(SinglePartitionScheduler::new(
      self.store,
      self.count_per_release,
      self.clock,
    ))
  }
}

// --- Partitioned builder ---

/// Plain configuration for [`PartitionedScheduler`], loadable with serde.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct PartitionedConfig {
  /// Batch size per partition per pass.
  pub count_per_release: usize,
  /// Partition count new entries are assigned across.
  pub registered_partitions: u32,
  /// Partition count scanned on release. `None` means equal to `registered_partitions`.
  /// Set it wider than `registered_partitions` while shrinking the partition count so
  /// entries written under the old count are still drained.
  pub scan_partitions: Option<u32>,
  /// Worker pool size for per-partition release tasks. `None` scans sequentially.
  pub max_workers: Option<usize>,
  /// Per-partition scan lease TTL. `None` disables leasing.
  pub partition_lease_ttl: Option<Duration>,
}

impl Default for PartitionedConfig {
  fn default() -> Self {
    Self {
      count_per_release: DEFAULT_COUNT_PER_RELEASE,
      registered_partitions: DEFAULT_REGISTERED_PARTITIONS,
      scan_partitions: None,
      max_workers: None,
      partition_lease_ttl: None,
    }
  }
}

impl PartitionedConfig {
  /// Checks the configuration and resolves the effective scan width.
  ///
  /// # Errors
  ///
  /// See [`BuildError`].
  pub fn validate(&self) -> Result<u32, BuildError> {
    if self.count_per_release == 0 {
      return Err(BuildError::ZeroCountPerRelease);
    }
    if self.registered_partitions == 0 {
      return Err(BuildError::ZeroRegisteredPartitions);
    }
    let scan = self.scan_partitions.unwrap_or(self.registered_partitions);
    if scan < self.registered_partitions {
      return Err(BuildError::ScanNarrowerThanRegistered {
        registered: self.registered_partitions,
        scan,
      });
    }
    if self.max_workers == Some(0) {
      return Err(BuildError::ZeroMaxWorkers);
    }
    if self.partition_lease_ttl == Some(Duration::ZERO) {
      return Err(BuildError::ZeroLeaseTtl);
    }
    Ok(scan)
  }
}

/// Builder for [`PartitionedScheduler`].
pub struct PartitionedBuilder<P> {
  store: Arc<dyn TimerStore<P>>,
  config: PartitionedConfig,
  partition_fn: PartitionFn<P>,
  clock: Clock,
}

impl<P> fmt::Debug for PartitionedBuilder<P> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("PartitionedBuilder")
      .field("config", &self.config)
      .field("partition_fn", &format_args!("<Fn>"))
      .field("store", &format_args!("<TimerStore>"))
      .finish()
  }
}

impl<P: Payload> PartitionedBuilder<P> {
  pub fn new<S: TimerStore<P> + 'static>(store: Arc<S>) -> Self {
    Self {
      store,
      config: PartitionedConfig::default(),
      partition_fn: random_partition(),
      clock: system_clock(),
    }
  }

  /// Replaces every plain setting at once.
  pub fn config(mut self, config: PartitionedConfig) -> Self {
    self.config = config;
    self
  }

  /// Batch size per partition per pass (default 100).
  pub fn count_per_release(mut self, count: usize) -> Self {
    self.config.count_per_release = count;
    self
  }

  /// Partition count new entries are spread across (default 8).
  pub fn registered_partitions(mut self, count: u32) -> Self {
    self.config.registered_partitions = count;
    self
  }

  /// Partition count scanned by `release_due` and `pending_count`.
  pub fn scan_partitions(mut self, count: u32) -> Self {
    self.config.scan_partitions = Some(count);
    self
  }

  /// Runs each partition's release as its own task, at most `count` at a time.
  pub fn max_workers(mut self, count: usize) -> Self {
    self.config.max_workers = Some(count);
    self
  }

  /// Guards each partition scan with a store lease of the given TTL so overlapping
  /// `release_due` calls (other replicas, other tickers) skip partitions in progress.
  pub fn partition_lease(mut self, ttl: Duration) -> Self {
    self.config.partition_lease_ttl = Some(ttl);
    self
  }

  /// Sharding strategy (default: uniform random).
  pub fn partition_fn(mut self, partition_fn: PartitionFn<P>) -> Self {
    self.partition_fn = partition_fn;
    self
  }

  /// Overrides the time source (tests pin "now" with this).
  pub fn clock(mut self, clock: Clock) -> Self {
    self.clock = clock;
    self
  }

  /// # Errors
  ///
  /// Any [`BuildError`] from [`PartitionedConfig::validate`].
  pub fn build(self) -> Result<PartitionedScheduler<P>, BuildError> {
    let scan_partitions = self.config.validate()?;
    if scan_partitions > self.config.registered_partitions {
      warn!(
        registered = self.config.registered_partitions,
        scan = scan_partitions,
        "Scanning more partitions than are registered (partition-count migration)."
      );
    }
    Ok(PartitionedScheduler::new(
      self.store,
      self.config,
      scan_partitions,
      self.partition_fn,
      self.clock,
    ))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn config_validation() {
    let ok = PartitionedConfig::default();
    assert_eq!(ok.validate(), Ok(DEFAULT_REGISTERED_PARTITIONS));

    let widened = PartitionedConfig {
      registered_partitions: 4,
      scan_partitions: Some(8),
      ..Default::default()
    };
    assert_eq!(widened.validate(), Ok(8));

    let narrow = PartitionedConfig {
      registered_partitions: 4,
      scan_partitions: Some(2),
      ..Default::default()
    };
    assert_eq!(
      narrow.validate(),
      Err(BuildError::ScanNarrowerThanRegistered {
        registered: 4,
        scan: 2
      })
    );

    let zero_batch = PartitionedConfig {
      count_per_release: 0,
      ..Default::default()
    };
    assert_eq!(zero_batch.validate(), Err(BuildError::ZeroCountPerRelease));

    let zero_workers = PartitionedConfig {
      max_workers: Some(0),
      ..Default::default()
    };
    assert_eq!(zero_workers.validate(), Err(BuildError::ZeroMaxWorkers));
  }

  #[test]
  fn requeue_requires_full_batch_and_progress() {
    let full_with_progress = BatchOutcome {
      fetched: 2,
      released: 1,
      failed: 1,
      store_errors: 0,
    };
    assert!(full_with_progress.warrants_requeue(2));

    let full_all_failed = BatchOutcome {
      fetched: 2,
      released: 0,
      failed: 2,
      store_errors: 0,
    };
    assert!(!full_all_failed.warrants_requeue(2));

    let short = BatchOutcome {
      fetched: 1,
      released: 1,
      ..Default::default()
    };
    assert!(!short.warrants_requeue(2));
  }

  #[test]
  fn release_time_after_saturates() {
    let now = Utc::now();
    assert_eq!(
      release_time_after(now, Duration::from_secs(5)),
      now + ChronoDuration::seconds(5)
    );
    assert_eq!(
      release_time_after(now, Duration::MAX),
      DateTime::<Utc>::MAX_UTC
    );
  }
}
