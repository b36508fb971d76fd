//! A single background task that calls `release_due` on a fixed interval.
//!
//! Running exactly one ticker per scheduler is the simplest way to avoid overlapping
//! `release_due` calls (and the duplicate deliveries they can cause). Across replicas,
//! combine it with [`crate::PartitionedBuilder::partition_lease`].

use crate::entry::Payload;
use crate::error::ShutdownError;
use crate::scheduler::{BoxedReleaseFn, DelayScheduler};

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// Handle to a running release loop.
#[derive(Debug)]
pub struct ReleaseTicker {
  shutdown_tx: watch::Sender<bool>,
  handle: Mutex<Option<JoinHandle<()>>>,
}

impl ReleaseTicker {
  /// Spawns the loop on the current Tokio runtime.
  ///
  /// The first tick fires immediately. Ticks that would overlap a still-running
  /// `release_due` are skipped rather than queued.
  pub fn start<P, S>(
    scheduler: Arc<S>,
    interval: Duration,
    callback: Arc<BoxedReleaseFn<P>>,
  ) -> Self
  where
    P: Payload,
    S: DelayScheduler<P> + ?Sized + 'static,
  {
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

    let handle = tokio::spawn(async move {
      info!(interval_ms = interval.as_millis(), "Release ticker started.");
      let mut ticker = tokio::time::interval(interval);
      ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

      loop {
        tokio::select! {
          biased;

          changed = shutdown_rx.changed() => {
            if changed.is_err() || *shutdown_rx.borrow() {
              break;
            }
          }

          _ = ticker.tick() => {
            // A tick in progress always runs to completion.
            let report = scheduler.release_due(callback.clone()).await;
            debug!(?report, "Release tick finished.");
          }
        }
      }
      info!("Release ticker stopped.");
    });

    Self {
      shutdown_tx,
      handle: Mutex::new(Some(handle)),
    }
  }

  /// Whether the loop task is still running.
  pub async fn is_running(&self) -> bool {
    self
      .handle
      .lock()
      .await
      .as_ref()
      .is_some_and(|handle| !handle.is_finished())
  }

  /// Stops the loop after the current tick and waits for it to exit.
  ///
  /// # Errors
  ///
  /// - [`ShutdownError::AlreadyShuttingDown`]: `shutdown` was already called.
  /// - [`ShutdownError::SignalFailed`]: The loop task is gone (it panicked earlier).
  /// - [`ShutdownError::Timeout`]: The current tick outlasted `timeout`.
  /// - [`ShutdownError::TaskPanic`]: The loop task panicked.
  pub async fn shutdown(&self, timeout: Option<Duration>) -> Result<(), ShutdownError> {
    let Some(handle) = self.handle.lock().await.take() else {
      return Err(ShutdownError::AlreadyShuttingDown);
    };
    info!("Stopping release ticker...");
    if self.shutdown_tx.send(true).is_err() {
      warn!("Release ticker task already exited.");
      return match handle.await {
        Ok(()) => Err(ShutdownError::SignalFailed),
        Err(_) => Err(ShutdownError::TaskPanic),
      };
    }

    let joined = match timeout {
      Some(timeout) => match tokio::time::timeout(timeout, handle).await {
        Ok(joined) => joined,
        Err(_) => {
          error!("Release ticker shutdown timed out after {:?}", timeout);
          return Err(ShutdownError::Timeout);
        }
      },
      None => handle.await,
    };

    joined.map_err(|join_err| {
      error!("Release ticker task panicked: {:?}", join_err);
      ShutdownError::TaskPanic
    })
  }
}
