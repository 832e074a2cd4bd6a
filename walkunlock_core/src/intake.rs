//! Sensor step intake.
//!
//! Drains step deltas from the sensor channel into the ledger on its own
//! task. Ledger writes are synchronous and share the ledger lock with the
//! enforcer's charges, so the two take turns on the store.

use crate::ledger::StepLedger;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Handle to the running intake task
pub struct StepIntake {
    task: JoinHandle<()>,
}

impl StepIntake {
    pub fn spawn(ledger: Arc<StepLedger>, mut deltas: mpsc::Receiver<u64>) -> Self {
        let task = tokio::spawn(async move {
            while let Some(delta) = deltas.recv().await {
                if delta == 0 {
                    tracing::debug!("Ignoring empty step delta");
                    continue;
                }
                match ledger.add_steps(delta) {
                    Ok(balance) => tracing::info!(
                        steps = delta,
                        total = balance.total,
                        available = balance.available,
                        "Steps recorded"
                    ),
                    Err(e) => tracing::warn!(steps = delta, "Failed to record steps: {}", e),
                }
            }
            tracing::info!("Step source closed");
        });

        Self { task }
    }

    /// Wait for the source to close and the last delta to land
    pub async fn join(self) {
        if let Err(e) = self.task.await {
            if !e.is_cancelled() {
                tracing::error!("Step intake task failed: {}", e);
            }
        }
    }

    /// Stop without draining
    pub fn abort(&self) {
        self.task.abort();
    }
}
