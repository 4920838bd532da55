//! Periodic settlement.
//!
//! Each tick runs one settlement pass and one expiry sweep on the blocking
//! pool; a failing pass is logged and the next tick tries again.

use std::sync::Arc;
use std::time::Duration;

use fisioflow_core::VoucherEngine;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, error, info};

/// Handle to the running scheduler.
#[derive(Debug)]
pub struct SettlementScheduler {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<u64>,
}

impl SettlementScheduler {
    /// Start ticking every `period`. The first pass runs one period after
    /// start.
    #[must_use]
    pub fn spawn(engine: Arc<VoucherEngine>, period: Duration) -> Self {
        let (shutdown, mut stop) = watch::channel(false);
        let task = tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            let mut passes = 0u64;
            info!(period_secs = period.as_secs_f64(), "Settlement scheduler started");
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    changed = stop.changed() => {
                        if changed.is_err() || *stop.borrow() {
                            break;
                        }
                        continue;
                    }
                }
                let engine = Arc::clone(&engine);
                let outcome = tokio::task::spawn_blocking(move || {
                    let matured = engine.run_settlement();
                    let expired = engine.expire_vouchers();
                    (matured, expired)
                })
                .await;
                passes += 1;
                match outcome {
                    Ok((Ok(matured), Ok(expired))) => debug!(matured, expired, "Scheduled settlement pass"),
                    Ok((matured, expired)) => {
                        if let Err(e) = matured {
                            error!(kind = %e.kind(), error = %e, "Scheduled settlement failed");
                        }
                        if let Err(e) = expired {
                            error!(kind = %e.kind(), error = %e, "Scheduled voucher expiry failed");
                        }
                    }
                    Err(e) => error!(error = %e, "Settlement task panicked"),
                }
            }
            info!(passes, "Settlement scheduler stopped");
            passes
        });
        Self { shutdown, task }
    }

    /// Stop after the current pass; returns the number of passes run.
    pub async fn stop(self) -> u64 {
        let _ = self.shutdown.send(true);
        self.task.await.unwrap_or(0)
    }
}
