//! Partitioned scheduler: shards entries at registration and drains every scanned
//! partition in bounded passes on release.
//!
//! One `release_due` call works like this:
//!
//! 1. The work list starts as every partition in `[0, scan_partitions)`.
//! 2. Each pass fetches up to `count_per_release` due entries per listed partition
//!    (concurrently when a worker pool is configured), delivers them in release-time
//!    order and removes the delivered ones. Pool passes end at a join barrier.
//! 3. A partition goes into the next pass only if its batch was full *and* at least one
//!    entry was released. A partition whose head entries keep failing waits for the next
//!    call instead of spinning.
//! 4. Passes repeat until the work list is empty. Every requeued pass removes at least
//!    one entry, so a finite backlog always drains.

use crate::entry::{Partition, Payload, TimerEntry};
use crate::error::{CancelError, StoreError, TokenError};
use crate::metrics::{MetricsSnapshot, SchedulerMetrics};
use crate::partition::PartitionFn;
use crate::scheduler::{
  release_batch, BatchOutcome, BoxedReleaseFn, Clock, DelayScheduler, PartitionedConfig, ReleaseReport,
};
use crate::store::TimerStore;
use crate::token::RegistrationToken;

use std::fmt;
use std::sync::atomic::Ordering as AtomicOrdering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::{join_all, try_join_all};
use tokio::sync::Semaphore;
use tracing::{debug, error, info, info_span, trace, warn, Instrument};
use uuid::Uuid;

/// How one partition's share of a pass ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PartitionOutcome {
  Batch(BatchOutcome),
  /// Another holder owns the partition's lease.
  Leased,
  /// Fetching (or leasing) failed; the partition is retried on the next call.
  StoreFailed,
  /// The partition task panicked (worker pool mode only).
  Panicked,
}

/// Everything a partition task needs, cheap to clone into spawned tasks.
struct PassContext<P> {
  store: Arc<dyn TimerStore<P>>,
  callback: Arc<BoxedReleaseFn<P>>,
  metrics: SchedulerMetrics,
  count_per_release: usize,
  lease_ttl: Option<Duration>,
  holder: Uuid,
  now: DateTime<Utc>,
}

impl<P> Clone for PassContext<P> {
  fn clone(&self) -> Self {
    Self {
      store: self.store.clone(),
      callback: self.callback.clone(),
      metrics: self.metrics.clone(),
      count_per_release: self.count_per_release,
      lease_ttl: self.lease_ttl,
      holder: self.holder,
      now: self.now,
    }
  }
}

impl<P: Payload> PassContext<P> {
  async fn release_partition(&self, partition: Partition) -> PartitionOutcome {
    if let Some(ttl) = self.lease_ttl {
      match self.store.try_lease(Some(partition), self.holder, ttl).await {
        Ok(true) => {}
        Ok(false) => {
          debug!("Partition lease held elsewhere; skipping.");
          self
            .metrics
            .partitions_skipped_leased
            .fetch_add(1, AtomicOrdering::Relaxed);
          return PartitionOutcome::Leased;
        }
        Err(err) => {
          error!(error = %err, "Failed to acquire partition lease.");
          self.metrics.store_errors.fetch_add(1, AtomicOrdering::Relaxed);
          return PartitionOutcome::StoreFailed;
        }
      }
    }

    let outcome = self.scan_and_release(partition).await;

    if self.lease_ttl.is_some() {
      if let Err(err) = self.store.release_lease(Some(partition), self.holder).await {
        // Harmless: the lease expires on its own.
        warn!(error = %err, "Failed to release partition lease.");
      }
    }
    outcome
  }

  async fn scan_and_release(&self, partition: Partition) -> PartitionOutcome {
    let batch = match self
      .store
      .find_due(self.now, self.count_per_release, Some(partition))
      .await
    {
      Ok(batch) => batch,
      Err(err) => {
        error!(error = %err, "Failed to fetch due entries.");
        self.metrics.store_errors.fetch_add(1, AtomicOrdering::Relaxed);
        return PartitionOutcome::StoreFailed;
      }
    };
    if batch.is_empty() {
      trace!("No due entries.");
      return PartitionOutcome::Batch(BatchOutcome::default());
    }

    let outcome = release_batch(
      self.store.as_ref(),
      batch,
      &self.callback,
      Some(partition),
      &self.metrics,
    )
    .await;
    debug!(
      fetched = outcome.fetched,
      released = outcome.released,
      failed = outcome.failed,
      "Partition batch done."
    );
    PartitionOutcome::Batch(outcome)
  }
}

/// Scheduler sharding entries across `registered_partitions` partitions and
/// scanning `scan_partitions` of them on release.
pub struct PartitionedScheduler<P> {
  store: Arc<dyn TimerStore<P>>,
  config: PartitionedConfig,
  scan_partitions: u32,
  partition_fn: PartitionFn<P>,
  clock: Clock,
  metrics: SchedulerMetrics,
}

impl<P> fmt::Debug for PartitionedScheduler<P> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("PartitionedScheduler")
      .field("config", &self.config)
      .field("scan_partitions", &self.scan_partitions)
      .field("metrics", &self.metrics)
      .finish()
  }
}

impl<P: Payload> PartitionedScheduler<P> {
  pub(crate) fn new(
    store: Arc<dyn TimerStore<P>>,
    config: PartitionedConfig,
    scan_partitions: u32,
    partition_fn: PartitionFn<P>,
    clock: Clock,
  ) -> Self {
    Self {
      store,
      config,
      scan_partitions,
      partition_fn,
      clock,
      metrics: SchedulerMetrics::new(),
    }
  }

  pub fn config(&self) -> &PartitionedConfig {
    &self.config
  }

  pub fn registered_partitions(&self) -> u32 {
    self.config.registered_partitions
  }

  pub fn scan_partitions(&self) -> u32 {
    self.scan_partitions
  }

  /// Shared handle to the live counters.
  pub fn metrics(&self) -> &SchedulerMetrics {
    &self.metrics
  }

  /// Partition a payload would be registered into.
  pub fn partition_for(&self, payload: &P) -> Partition {
    let registered = self.config.registered_partitions;
    let partition = (self.partition_fn)(payload, registered);
    if partition < registered {
      partition
    } else {
      warn!(partition, registered, "Partition function returned an out-of-range partition; wrapping.");
      partition % registered
    }
  }

  async fn run_pass(&self, ctx: &PassContext<P>, work: &[Partition]) -> Vec<(Partition, PartitionOutcome)> {
    match self.config.max_workers {
      None => {
        let mut outcomes = Vec::with_capacity(work.len());
        for &partition in work {
          let outcome = ctx
            .release_partition(partition)
            .instrument(info_span!("release_partition", partition))
            .await;
          outcomes.push((partition, outcome));
        }
        outcomes
      }
      Some(max_workers) => {
        let permits = Arc::new(Semaphore::new(max_workers));
        let handles = work.iter().map(|&partition| {
          let ctx = ctx.clone();
          let permits = permits.clone();
          let task = tokio::spawn(
            async move {
              // Never closed, so acquisition cannot fail.
              let _permit = permits.acquire_owned().await.ok();
              ctx.release_partition(partition).await
            }
            .instrument(info_span!("release_partition", partition)),
          );
          async move { (partition, task.await) }
        });

        // Join barrier: the requeue decision waits for every partition of the pass.
        join_all(handles)
          .await
          .into_iter()
          .map(|(partition, joined)| match joined {
            Ok(outcome) => (partition, outcome),
            Err(join_err) => {
              error!(partition, error = %join_err, "Partition release task failed.");
              self
                .metrics
                .release_task_panics
                .fetch_add(1, AtomicOrdering::Relaxed);
              (partition, PartitionOutcome::Panicked)
            }
          })
          .collect()
      }
    }
  }
}

#[async_trait]
impl<P: Payload> DelayScheduler<P> for PartitionedScheduler<P> {
  fn now(&self) -> DateTime<Utc> {
    (self.clock)()
  }

  async fn register_at(&self, payload: P, release_time: DateTime<Utc>) -> Result<RegistrationToken, StoreError> {
    let partition = self.partition_for(&payload);
    let entry = TimerEntry::new(payload, release_time);
    self.store.save(&entry, Some(partition)).await?;
    self
      .metrics
      .entries_registered
      .fetch_add(1, AtomicOrdering::Relaxed);
    debug!(entry_id = %entry.id(), partition, %release_time, "Registered delayed entry.");
    Ok(RegistrationToken::new(entry.id(), Some(partition)))
  }

  async fn cancel(&self, token: &RegistrationToken) -> Result<(), CancelError> {
    // Unpartitioned or never-scanned partitions cannot hold this scheduler's entries.
    let partition = match token.partition() {
      Some(partition) if partition < self.scan_partitions => partition,
      _ => {
        warn!(%token, scan_partitions = self.scan_partitions, "Token does not address a scanned partition.");
        return Err(TokenError::Invalid(token.encode()).into());
      }
    };
    self.store.remove(token.entry_id(), Some(partition)).await?;
    self
      .metrics
      .entries_cancelled
      .fetch_add(1, AtomicOrdering::Relaxed);
    debug!(entry_id = %token.entry_id(), partition = ?token.partition(), "Cancelled delayed entry.");
    Ok(())
  }

  async fn pending_count(&self) -> Result<u64, StoreError> {
    let now = self.now();
    let counts = try_join_all((0..self.scan_partitions).map(|partition| self.store.count(now, Some(partition)))).await?;
    Ok(counts.into_iter().sum())
  }

  async fn release_due(&self, callback: Arc<BoxedReleaseFn<P>>) -> ReleaseReport {
    let started = Instant::now();
    let ctx = PassContext {
      store: self.store.clone(),
      callback,
      metrics: self.metrics.clone(),
      count_per_release: self.config.count_per_release,
      lease_ttl: self.config.partition_lease_ttl,
      holder: Uuid::new_v4(),
      now: self.now(),
    };
    let mut report = ReleaseReport::default();
    let mut work: Vec<Partition> = (0..self.scan_partitions).collect();

    while !work.is_empty() {
      report.passes += 1;
      trace!(pass = report.passes, partitions = work.len(), "Starting release pass.");

      let outcomes = self.run_pass(&ctx, &work).await;
      work = outcomes
        .into_iter()
        .filter_map(|(partition, outcome)| match outcome {
          PartitionOutcome::Batch(batch) => {
            report.absorb(&batch);
            batch
              .warrants_requeue(ctx.count_per_release)
              .then_some(partition)
          }
          PartitionOutcome::Leased => {
            report.skipped_leased += 1;
            None
          }
          PartitionOutcome::StoreFailed => {
            report.store_errors += 1;
            None
          }
          PartitionOutcome::Panicked => {
            report.task_panics += 1;
            None
          }
        })
        .collect();
    }

    SchedulerMetrics::add(&self.metrics.release_passes, report.passes);
    self
      .metrics
      .release_invocations
      .fetch_add(1, AtomicOrdering::Relaxed);
    let elapsed = started.elapsed();
    self.metrics.release_duration.record(elapsed);
    if report.released > 0 || report.failed > 0 {
      info!(
        released = report.released,
        failed = report.failed,
        passes = report.passes,
        elapsed_ms = elapsed.as_millis(),
        "Released due entries."
      );
    }
    report
  }

  fn metrics_snapshot(&self) -> MetricsSnapshot {
    self.metrics.snapshot()
  }
}
