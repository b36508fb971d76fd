//! demos/partitioned_release.rs
//!
//! Registers delayed reminders across partitions, cancels one, and lets a ticker
//! release the rest as they come due.

use delaykeeper::{
  partition::partition_by_key, release_fn, DelayKeeper, DelayScheduler, MemoryStore, Payload,
  ReleaseTicker,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;
use tracing::{error, info};

#[derive(Debug, Clone)]
struct Reminder {
  customer: String,
  text: String,
}

impl Payload for Reminder {
  const KIND: &'static str = "reminder";
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
  // --- Setup Tracing ---
  let filter = tracing_subscriber::EnvFilter::try_new("warn,delaykeeper=info")
    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
  tracing_subscriber::fmt().with_env_filter(filter).init();

  // --- Build Scheduler ---
  let store = Arc::new(MemoryStore::<Reminder>::new());
  let scheduler = Arc::new(
    DelayKeeper::partitioned(store)
      .registered_partitions(4)
      .count_per_release(10)
      .partition_fn(partition_by_key(|r: &Reminder| r.customer.clone()))
      .max_workers(2)
      .build()?,
  );

  // --- Register ---
  for (i, customer) in ["ada", "grace", "linus", "ken"].iter().enumerate() {
    let token = scheduler
      .register_after(
        Reminder {
          customer: customer.to_string(),
          text: format!("Your trial ends soon (#{})", i),
        },
        StdDuration::from_millis(500 * (i as u64 + 1)),
      )
      .await?;
    info!("Registered reminder for {} in partition {:?}: {}", customer, token.partition(), token);
  }

  let doomed = scheduler
    .register_after(
      Reminder {
        customer: "ada".to_string(),
        text: "This one is cancelled".to_string(),
      },
      StdDuration::from_secs(1),
    )
    .await?;
  scheduler.cancel_str(&doomed.to_string()).await?;
  info!("Cancelled {}", doomed);

  // --- Release ---
  let delivered = Arc::new(AtomicUsize::new(0));
  let counter = delivered.clone();
  let ticker = ReleaseTicker::start(
    scheduler.clone(),
    StdDuration::from_millis(200),
    release_fn(move |reminder: Reminder| {
      let counter = counter.clone();
      async move {
        info!("*** Delivering to {}: {} ***", reminder.customer, reminder.text);
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
      }
    }),
  );

  tokio::time::sleep(StdDuration::from_secs(3)).await;
  info!("Final Metrics: {:#?}", scheduler.metrics_snapshot());

  // --- Shutdown ---
  match ticker.shutdown(Some(StdDuration::from_secs(5))).await {
    Ok(()) => info!("Ticker shut down successfully."),
    Err(e) => error!("Shutdown failed: {}", e),
  }

  assert_eq!(delivered.load(Ordering::SeqCst), 4, "Expected four deliveries");
  Ok(())
}
