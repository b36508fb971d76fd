//! The simplest scheduler: one unpartitioned keyspace, one scan loop.

use crate::entry::{Payload, TimerEntry};
use crate::error::{CancelError, StoreError, TokenError};
use crate::metrics::{MetricsSnapshot, SchedulerMetrics};
use crate::scheduler::{release_batch, BoxedReleaseFn, Clock, DelayScheduler, ReleaseReport};
use crate::store::TimerStore;
use crate::token::RegistrationToken;

use std::fmt;
use std::sync::atomic::Ordering as AtomicOrdering;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, error, info, trace, warn};

/// Scheduler storing every entry without a partition.
///
/// Tokens it hands out carry no partition and also decode from the bare entry id.
pub struct SinglePartitionScheduler<P> {
  store: Arc<dyn TimerStore<P>>,
  count_per_release: usize,
  clock: Clock,
  metrics: SchedulerMetrics,
}

impl<P> fmt::Debug for SinglePartitionScheduler<P> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("SinglePartitionScheduler")
      .field("count_per_release", &self.count_per_release)
      .field("metrics", &self.metrics)
      .finish()
  }
}

impl<P: Payload> SinglePartitionScheduler<P> {
  pub(crate) fn new(store: Arc<dyn TimerStore<P>>, count_per_release: usize, clock: Clock) -> Self {
    Self {
      store,
      count_per_release,
      clock,
      metrics: SchedulerMetrics::new(),
    }
  }

  pub fn count_per_release(&self) -> usize {
    self.count_per_release
  }

  /// Shared handle to the live counters.
  pub fn metrics(&self) -> &SchedulerMetrics {
    &self.metrics
  }
}

#[async_trait]
impl<P: Payload> DelayScheduler<P> for SinglePartitionScheduler<P> {
  fn now(&self) -> DateTime<Utc> {
    (self.clock)()
  }

  async fn register_at(&self, payload: P, release_time: DateTime<Utc>) -> Result<RegistrationToken, StoreError> {
    let entry = TimerEntry::new(payload, release_time);
    self.store.save(&entry, None).await?;
    self
      .metrics
      .entries_registered
      .fetch_add(1, AtomicOrdering::Relaxed);
    debug!(entry_id = %entry.id(), %release_time, "Registered delayed entry.");
    Ok(RegistrationToken::new(entry.id(), None))
  }

  async fn cancel(&self, token: &RegistrationToken) -> Result<(), CancelError> {
    if token.partition().is_some() {
      warn!(%token, "Partitioned token passed to a single-partition scheduler.");
      return Err(TokenError::Invalid(token.encode()).into());
    }
    self.store.remove(token.entry_id(), None).await?;
    self
      .metrics
      .entries_cancelled
      .fetch_add(1, AtomicOrdering::Relaxed);
    debug!(entry_id = %token.entry_id(), "Cancelled delayed entry.");
    Ok(())
  }

  async fn pending_count(&self) -> Result<u64, StoreError> {
    self.store.count(self.now(), None).await
  }

  async fn release_due(&self, callback: Arc<BoxedReleaseFn<P>>) -> ReleaseReport {
    let started = Instant::now();
    let now = self.now();
    let mut report = ReleaseReport::default();

    loop {
      report.passes += 1;
      let batch = match self
        .store
        .find_due(now, self.count_per_release, None)
        .await
      {
        Ok(batch) => batch,
        Err(err) => {
          report.store_errors += 1;
          self.metrics.store_errors.fetch_add(1, AtomicOrdering::Relaxed);
          error!(error = %err, "Failed to fetch due entries; retrying on next release.");
          break;
        }
      };
      if batch.is_empty() {
        trace!("No due entries.");
        break;
      }

      let outcome = release_batch(self.store.as_ref(), batch, &callback, None, &self.metrics).await;
      report.absorb(&outcome);
      if !outcome.warrants_requeue(self.count_per_release) {
        break;
      }
    }

    SchedulerMetrics::add(&self.metrics.release_passes, report.passes);
    self
      .metrics
      .release_invocations
      .fetch_add(1, AtomicOrdering::Relaxed);
    self.metrics.release_duration.record(started.elapsed());
    if report.released > 0 || report.failed > 0 {
      info!(
        released = report.released,
        failed = report.failed,
        passes = report.passes,
        "Released due entries."
      );
    }
    report
  }

  fn metrics_snapshot(&self) -> MetricsSnapshot {
    self.metrics.snapshot()
  }
}
