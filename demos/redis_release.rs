//! demos/redis_release.rs
//!
//! Durable delayed messages in Redis, with partition leases so several replicas can
//! run this loop at once. Reads the server from `REDIS_URL` (default localhost).

use delaykeeper::{
  release_fn, DelayKeeper, DelayScheduler, Payload, RedisStore, RedisStoreConfig,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration as StdDuration;
use tracing::{info, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct OrderTimeout {
  order_id: u64,
}

impl Payload for OrderTimeout {
  const KIND: &'static str = "order-timeout";
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
  let filter = tracing_subscriber::EnvFilter::try_new("warn,delaykeeper=debug")
    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
  tracing_subscriber::fmt().with_env_filter(filter).init();

  let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());
  let store = RedisStore::<OrderTimeout>::connect(&url, RedisStoreConfig::default().with_key_prefix("demo")).await?;

  let scheduler = DelayKeeper::partitioned(Arc::new(store))
    .registered_partitions(8)
    .partition_fn(Arc::new(|timeout: &OrderTimeout, partitions: u32| {
      (timeout.order_id % partitions as u64) as u32
    }))
    .partition_lease(StdDuration::from_secs(30))
    .build()?;

  for order_id in 100..110 {
    scheduler
      .register_after(OrderTimeout { order_id }, StdDuration::from_secs(1))
      .await?;
  }
  info!("Pending now: {}", scheduler.pending_count().await?);

  tokio::time::sleep(StdDuration::from_millis(1500)).await;
  let report = scheduler
    .release_due(release_fn(|timeout: OrderTimeout| async move {
      if timeout.order_id == 105 {
        warn!("Order {} handler unavailable; will retry", timeout.order_id);
        return Err("handler unavailable".into());
      }
      info!("Order {} timed out", timeout.order_id);
      Ok(())
    }))
    .await;
  info!("Release report: {:?}", report);

  // The failed entry is offered again on the next call.
  let retry = scheduler
    .release_due(release_fn(|timeout: OrderTimeout| async move {
      info!("Order {} timed out (retry)", timeout.order_id);
      Ok(())
    }))
    .await;
  info!("Retry report: {:?}", retry);
  Ok(())
}
