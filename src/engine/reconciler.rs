use std::sync::Arc;
use tokio::time::{Duration, sleep};
use tracing::{debug, error, info};

use super::ReconciliationEngine;

/// Runs the background reconciliation loop. Polls pending transactions whose
/// schedule is due without blocking the HTTP server; missed callbacks are
/// picked up here.
pub async fn run(engine: Arc<ReconciliationEngine>, tick: Duration, batch: i64) {
    info!(
        "reconciliation worker started (tick {}s, batch {})",
        tick.as_secs(),
        batch
    );

    loop {
        match engine.reconcile_due(batch).await {
            Ok(0) => {}
            Ok(polled) => debug!("reconciliation pass polled {} transaction(s)", polled),
            Err(e) => error!("reconciliation pass failed: {}", e),
        }

        sleep(tick).await;
    }
}
