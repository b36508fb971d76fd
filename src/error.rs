use thiserror::Error;

/// Errors that can occur while building a scheduler with [`crate::SingleBuilder`]
/// or [`crate::PartitionedBuilder`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BuildError {
  #[error("`count_per_release` must be greater than zero")]
  ZeroCountPerRelease,
  #[error("`registered_partitions` must be greater than zero")]
  ZeroRegisteredPartitions,
  #[error(
    "`scan_partitions` ({scan}) must be >= `registered_partitions` ({registered}), otherwise newly registered entries are never scanned"
  )]
  ScanNarrowerThanRegistered { registered: u32, scan: u32 },
  #[error("`max_workers` must be greater than zero when a worker pool is configured")]
  ZeroMaxWorkers,
  #[error("Partition lease TTL must be non-zero")]
  ZeroLeaseTtl,
}

/// Errors surfaced by a [`crate::store::TimerStore`] implementation.
///
/// Records that fail to decode on read are never reported through this type;
/// stores purge them and continue the scan.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
  #[error("Store backend failure: {0}")]
  Backend(String),
  #[error("Failed to serialize entry {entry_id}: {reason}")]
  Serialization { entry_id: uuid::Uuid, reason: String },
}

#[cfg(feature = "redis_store")]
impl From<redis::RedisError> for StoreError {
  fn from(err: redis::RedisError) -> Self {
    StoreError::Backend(err.to_string())
  }
}

/// A registration token could not be decoded.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TokenError {
  #[error("Invalid registration token: {0:?}")]
  Invalid(String),
  #[error("Unsupported registration token version {version} in {token:?}")]
  UnsupportedVersion { version: u8, token: String },
}

/// Errors returned by `cancel` / `cancel_str`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CancelError {
  #[error(transparent)]
  InvalidToken(#[from] TokenError),
  #[error("Failed to remove cancelled entry: {0}")]
  Store(#[from] StoreError),
}

/// Errors related to stopping a [`crate::ticker::ReleaseTicker`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ShutdownError {
  #[error("Failed to send shutdown signal (ticker already shut down or watch channel error).")]
  SignalFailed,
  #[error("Timed out waiting for the release ticker to finish its current tick.")]
  Timeout,
  #[error("The release ticker task panicked.")]
  TaskPanic,
  #[error("Shutdown already in progress or completed.")]
  AlreadyShuttingDown,
}
