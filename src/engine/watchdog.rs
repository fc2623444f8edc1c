//! Periodic reconciliation. Every pass re-reads the active records and lets
//! the handler re-derive each one's next step from external state.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::EscrowHandler;
use crate::error::SwapResult;

/// Upper bound on consecutive steps taken for one record in a single pass.
const MAX_STEPS_PER_PASS: usize = 8;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub visited: usize,
    pub advanced: usize,
    pub failed: usize,
}

/// One reconciliation pass. Per-record failures are logged and counted; only
/// a storage failure fails the pass.
pub async fn reconcile<H>(handler: &H) -> SwapResult<ReconcileReport>
where
    H: EscrowHandler + ?Sized,
{
    let engine = handler.engine();
    let swaps = engine.store.query(&handler.active_states()).await?;
    let mut report = ReconcileReport::default();

    for swap in swaps {
        report.visited += 1;
        for _ in 0..MAX_STEPS_PER_PASS {
            match handler.process_past_swap(swap.clone()).await {
                Ok(true) => report.advanced += 1,
                Ok(false) => break,
                Err(err) => {
                    report.failed += 1;
                    tracing::warn!(
                        direction = %engine.direction,
                        swap_id = %swap.id,
                        error = %err,
                        "reconciliation failed"
                    );
                    break;
                }
            }
        }
    }

    if report.advanced > 0 || report.failed > 0 {
        tracing::info!(
            direction = %engine.direction,
            visited = report.visited,
            advanced = report.advanced,
            failed = report.failed,
            "reconciliation pass"
        );
    }
    Ok(report)
}

pub fn spawn_watchdog<H>(handler: Arc<H>, interval: Duration) -> JoinHandle<()>
where
    H: EscrowHandler + ?Sized,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(err) = reconcile(handler.as_ref()).await {
                tracing::warn!(
                    direction = %handler.engine().direction,
                    error = %err,
                    "reconciliation pass failed"
                );
            }
        }
    })
}
