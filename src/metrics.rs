use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

// --- Simple Histogram Implementation ---

/// A basic concurrent histogram storing count and sum.
///
/// Suitable for simple latency tracking without detailed percentile information.
#[derive(Debug, Default)]
pub struct SimpleHistogram {
  count: AtomicUsize,
  sum_micros: AtomicUsize,
}

impl SimpleHistogram {
  /// Records a duration observation in the histogram.
  pub fn record(&self, duration: Duration) {
    self.count.fetch_add(1, Ordering::Relaxed);
    self.sum_micros.fetch_add(
      duration.as_micros().try_into().unwrap_or(usize::MAX),
      Ordering::Relaxed,
    );
  }

  /// Gets the total number of observations recorded.
  pub fn get_count(&self) -> usize {
    self.count.load(Ordering::Relaxed)
  }

  /// Gets the total sum of durations recorded (in microseconds).
  pub fn get_sum_micros(&self) -> usize {
    self.sum_micros.load(Ordering::Relaxed)
  }
}

// --- Main Metrics Struct (Internal State) ---

/// Atomic counters shared by a scheduler and the tasks it spawns.
///
/// Cloning only clones the `Arc`s.
#[derive(Debug, Clone)]
pub struct SchedulerMetrics {
  /// Entries successfully saved through `register*`.
  pub entries_registered: Arc<AtomicUsize>,
  /// Successful `cancel*` calls (idempotent; unknown ids count too).
  pub entries_cancelled: Arc<AtomicUsize>,
  /// Entries whose callback succeeded and which were removed afterwards.
  pub entries_released: Arc<AtomicUsize>,
  /// Callback invocations that returned an error. The entry stays stored.
  pub release_callback_failures: Arc<AtomicUsize>,
  /// Partition tasks that panicked inside the worker pool.
  pub release_task_panics: Arc<AtomicUsize>,
  /// Store operations that failed during release.
  pub store_errors: Arc<AtomicUsize>,
  /// Calls to `release_due`.
  pub release_invocations: Arc<AtomicUsize>,
  /// Passes run across all `release_due` calls.
  pub release_passes: Arc<AtomicUsize>,
  /// Partitions skipped because another holder owned their lease.
  pub partitions_skipped_leased: Arc<AtomicUsize>,

  /// Wall time of whole `release_due` invocations.
  pub release_duration: Arc<SimpleHistogram>,
}

impl Default for SchedulerMetrics {
  fn default() -> Self {
    Self::new()
  }
}

impl SchedulerMetrics {
  /// Creates a new `SchedulerMetrics` instance with all counters initialized to zero.
  pub fn new() -> Self {
    Self {
      entries_registered: Default::default(),
      entries_cancelled: Default::default(),
      entries_released: Default::default(),
      release_callback_failures: Default::default(),
      release_task_panics: Default::default(),
      store_errors: Default::default(),
      release_invocations: Default::default(),
      release_passes: Default::default(),
      partitions_skipped_leased: Default::default(),
      release_duration: Arc::new(SimpleHistogram::default()),
    }
  }

  pub(crate) fn add(counter: &AtomicUsize, n: usize) {
    if n > 0 {
      counter.fetch_add(n, Ordering::Relaxed);
    }
  }

  /// Creates a point-in-time snapshot of the current metric values.
  pub fn snapshot(&self) -> MetricsSnapshot {
    let order = Ordering::Relaxed;

    MetricsSnapshot {
      entries_registered: self.entries_registered.load(order),
      entries_cancelled: self.entries_cancelled.load(order),
      entries_released: self.entries_released.load(order),
      release_callback_failures: self.release_callback_failures.load(order),
      release_task_panics: self.release_task_panics.load(order),
      store_errors: self.store_errors.load(order),
      release_invocations: self.release_invocations.load(order),
      release_passes: self.release_passes.load(order),
      partitions_skipped_leased: self.partitions_skipped_leased.load(order),
      release_duration_count: self.release_duration.get_count(),
      release_duration_sum_micros: self.release_duration.get_sum_micros(),
    }
  }
}

// --- Metrics Snapshot Struct (Public Data) ---

/// A snapshot of a scheduler's metrics at a specific point in time.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct MetricsSnapshot {
  // Counters
  pub entries_registered: usize,
  pub entries_cancelled: usize,
  pub entries_released: usize,
  pub release_callback_failures: usize,
  pub release_task_panics: usize,
  pub store_errors: usize,
  pub release_invocations: usize,
  pub release_passes: usize,
  pub partitions_skipped_leased: usize,
  // Histogram Data
  pub release_duration_count: usize,
  pub release_duration_sum_micros: usize,
}

impl MetricsSnapshot {
  /// Mean `release_due` wall time in microseconds, `None` before the first call.
  pub fn mean_release_duration_micros(&self) -> Option<f64> {
    if self.release_duration_count == 0 {
      None
    } else {
      Some(self.release_duration_sum_micros as f64 / self.release_duration_count as f64)
    }
  }

  /// Mean `release_due` wall time, `None` before the first call.
  pub fn mean_release_duration(&self) -> Option<Duration> {
    self
      .mean_release_duration_micros()
      .map(|micros| Duration::from_micros(micros as u64))
  }
}
