//! tests/ticker.rs
//! Background release loop and its shutdown.

mod common;

use crate::common::{recording_callback, setup_tracing, Msg};
use delaykeeper::{
  release_fn, DelayKeeper, DelayScheduler, MemoryStore, ReleaseTicker, ShutdownError,
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration as StdDuration, Instant};
use tracing::info;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_ticker_releases_and_stops() {
  setup_tracing();
  let store = Arc::new(MemoryStore::<Msg>::new());
  let scheduler = Arc::new(
    DelayKeeper::partitioned(store.clone())
      .registered_partitions(2)
      .build()
      .unwrap(),
  );

  scheduler.register(Msg::new("now", 0)).await.unwrap();
  scheduler
    .register_after(Msg::new("soon", 1), StdDuration::from_millis(150))
    .await
    .unwrap();

  let delivered = Arc::new(Mutex::new(Vec::new()));
  let ticker = ReleaseTicker::start(
    scheduler.clone(),
    StdDuration::from_millis(50),
    recording_callback(delivered.clone()),
  );
  assert!(ticker.is_running().await);

  tokio::time::sleep(StdDuration::from_millis(500)).await;
  let keys: Vec<String> = delivered.lock().iter().map(|m| m.key.clone()).collect();
  assert_eq!(keys, vec!["now".to_string(), "soon".to_string()]);
  assert!(scheduler.metrics_snapshot().release_invocations > 1);

  ticker
    .shutdown(Some(StdDuration::from_secs(2)))
    .await
    .expect("Shutdown failed");
  assert!(!ticker.is_running().await);
  assert_eq!(ticker.shutdown(None).await, Err(ShutdownError::AlreadyShuttingDown));

  // Nothing is released once the ticker is gone.
  let invocations = scheduler.metrics_snapshot().release_invocations;
  scheduler.register(Msg::new("late", 2)).await.unwrap();
  tokio::time::sleep(StdDuration::from_millis(200)).await;
  assert_eq!(scheduler.metrics_snapshot().release_invocations, invocations);
  assert_eq!(delivered.lock().len(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_ticker_accepts_trait_objects() {
  setup_tracing();
  let store = Arc::new(MemoryStore::<Msg>::new());
  let scheduler: Arc<dyn DelayScheduler<Msg>> = Arc::new(DelayKeeper::single(store).build().unwrap());
  scheduler.register(Msg::new("dyn", 0)).await.unwrap();

  let delivered = Arc::new(Mutex::new(Vec::new()));
  let ticker = ReleaseTicker::start(
    scheduler.clone(),
    StdDuration::from_millis(20),
    recording_callback(delivered.clone()),
  );
  tokio::time::sleep(StdDuration::from_millis(200)).await;
  ticker.shutdown(None).await.unwrap();

  assert_eq!(delivered.lock().len(), 1);
  assert_eq!(scheduler.pending_count().await.unwrap(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_shutdown_times_out_on_a_slow_tick() {
  setup_tracing();
  let store = Arc::new(MemoryStore::<Msg>::new());
  let scheduler = Arc::new(DelayKeeper::single(store.clone()).build().unwrap());
  scheduler.register(Msg::new("slow", 0)).await.unwrap();

  let ticker = ReleaseTicker::start(
    scheduler.clone(),
    StdDuration::from_millis(10),
    release_fn(|msg: Msg| async move {
      info!(?msg, "Slow delivery starting");
      tokio::time::sleep(StdDuration::from_secs(2)).await;
      Ok(())
    }),
  );

  tokio::time::sleep(StdDuration::from_millis(100)).await;
  let started = Instant::now();
  let result = ticker.shutdown(Some(StdDuration::from_millis(100))).await;
  assert_eq!(result, Err(ShutdownError::Timeout));
  assert!(started.elapsed() < StdDuration::from_secs(1));

  // The handle was consumed by the first attempt.
  assert_eq!(ticker.shutdown(None).await, Err(ShutdownError::AlreadyShuttingDown));
}
