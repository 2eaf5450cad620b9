//! Stale-Trade Reaper
//!
//! Background worker that cancels trades nobody acted on within the staleness
//! window. Runs against the same trade records as the coordinator; every cancel is
//! a conditional write on `in-progress`, so a trade being confirmed is never taken.

use chrono::{DateTime, TimeDelta, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::state::{CancelReason, TradeStatus};
use super::types::TradeChange;
use crate::config::ReaperConfig;
use crate::persistence::{StoreResult, TradeRepository};
use crate::shutdown::ShutdownSignal;

/// Outcome of one scan
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReapSummary {
    pub cancelled: usize,
    /// Trades that changed status between the scan and the cancel
    pub skipped: usize,
    /// Confirmations stuck mid-release longer than the window
    pub stuck_claims: usize,
}

pub struct TradeReaper {
    trades: Arc<dyn TradeRepository>,
    poll_interval: Duration,
    stale_after: TimeDelta,
}

impl TradeReaper {
    pub fn new(trades: Arc<dyn TradeRepository>, config: &ReaperConfig) -> Self {
        let stale_after = i64::try_from(config.stale_after_secs)
            .ok()
            .and_then(TimeDelta::try_seconds)
            .unwrap_or(TimeDelta::MAX);
        Self {
            trades,
            poll_interval: Duration::from_secs(config.poll_interval_secs),
            stale_after,
        }
    }

    /// Scan every poll interval until shutdown is requested
    pub async fn run(&self, shutdown: Arc<ShutdownSignal>) {
        info!(
            poll_interval_secs = self.poll_interval.as_secs(),
            stale_after_secs = self.stale_after.num_seconds(),
            "Starting stale-trade reaper"
        );

        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.wait() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.scan_once().await {
                        error!(error = %e, "Reaper scan failed");
                    }
                }
            }
        }

        info!("Stale-trade reaper stopped");
    }

    pub async fn scan_once(&self) -> StoreResult<ReapSummary> {
        self.scan_once_at(Utc::now()).await
    }

    /// One cycle as if the clock read `now`
    pub async fn scan_once_at(&self, now: DateTime<Utc>) -> StoreResult<ReapSummary> {
        let cutoff = now.checked_sub_signed(self.stale_after).unwrap_or(DateTime::<Utc>::MIN_UTC);
        let mut summary = ReapSummary::default();

        let stale = self.trades.find_stale(TradeStatus::InProgress, cutoff).await?;
        if !stale.is_empty() {
            debug!(count = stale.len(), cutoff = %cutoff, "Found stale trades");
        }

        for trade in stale {
            let change = TradeChange::cancelled(CancelReason::Auto, now);
            match self
                .trades
                .transition_trade(trade.id, TradeStatus::InProgress, &change)
                .await
            {
                Ok(true) => {
                    summary.cancelled += 1;
                    info!(
                        trade_id = %trade.id,
                        order_id = %trade.order_id,
                        buyer_id = %trade.buyer_id,
                        lock_time = %trade.lock_time,
                        "Stale trade cancelled"
                    );
                }
                Ok(false) => {
                    summary.skipped += 1;
                    debug!(trade_id = %trade.id, "Trade changed before reaping, skipped");
                }
                Err(e) => {
                    error!(trade_id = %trade.id, error = %e, "Failed to cancel stale trade");
                }
            }
        }

        // The claim stamps updated_at; measure how long it has been held, not trade age
        let stuck: Vec<_> = self
            .trades
            .find_stale(TradeStatus::Pending, cutoff)
            .await?
            .into_iter()
            .filter(|t| t.updated_at <= cutoff)
            .collect();
        for trade in &stuck {
            warn!(
                trade_id = %trade.id,
                order_id = %trade.order_id,
                amount = %trade.amount,
                updated_at = %trade.updated_at,
                "Trade stuck in confirmation; check escrow release and reconcile events"
            );
        }
        summary.stuck_claims = stuck.len();

        Ok(summary)
    }
}
