//! Background maintenance loops.
//!
//! - poll: [`RewardEngine::tick`] rolls expired sessions over and fires
//!   auto-claims for every owner
//! - reconcile: [`RewardEngine::reconcile_all`] recomputes balances from
//!   the event log
//!
//! Both loops stop at the next select point once the shutdown channel flips
//! to `true` or its sender is dropped. An in-flight pass always completes.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use accrue_engine::RewardEngine;

use crate::config::NodeConfig;

pub struct Scheduler {
    engine: Arc<RewardEngine>,
    poll_interval: Duration,
    reconcile_interval: Option<Duration>,
}

impl Scheduler {
    pub fn new(engine: Arc<RewardEngine>, poll_interval: Duration, reconcile_interval: Option<Duration>) -> Self {
        Self {
            engine,
            poll_interval,
            reconcile_interval,
        }
    }

    pub fn from_config(engine: Arc<RewardEngine>, config: &NodeConfig) -> Self {
        Self::new(engine, config.poll_interval(), config.reconcile_interval())
    }

    /// Spawn the loops. Returns one handle per loop.
    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let mut handles = vec![tokio::spawn(poll_loop(
            self.engine.clone(),
            self.poll_interval,
            shutdown.clone(),
        ))];
        if let Some(period) = self.reconcile_interval {
            handles.push(tokio::spawn(reconcile_loop(self.engine, period, shutdown)));
        }
        handles
    }
}

/// Resolves once shutdown is requested.
async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    // A dropped sender counts as shutdown.
    let _ = shutdown.wait_for(|stop| *stop).await;
}

async fn poll_loop(engine: Arc<RewardEngine>, period: Duration, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    info!(period_ms = period.as_millis() as u64, "poll loop started");

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = stopped(&mut shutdown) => break,
        }
        match engine.tick(engine.now()).await {
            Ok(report) if report.rolled_over + report.auto_claims + report.errors > 0 => {
                info!(
                    owners = report.owners,
                    rolled_over = report.rolled_over,
                    auto_claims = report.auto_claims,
                    errors = report.errors,
                    "poll pass"
                );
            }
            Ok(report) => debug!(owners = report.owners, "poll pass idle"),
            Err(e) => warn!("poll pass failed: {e}"),
        }
    }
    info!("poll loop stopped");
}

async fn reconcile_loop(engine: Arc<RewardEngine>, period: Duration, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // The first tick fires immediately; skip it so startup is not a full scan.
    ticker.tick().await;
    info!(period_secs = period.as_secs(), "reconcile loop started");

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = stopped(&mut shutdown) => break,
        }
        match engine.reconcile_all(engine.now()).await {
            Ok(report) => info!(
                owners = report.owners_checked,
                refreshed = report.refreshed,
                corrected = report.corrected,
                failed = report.failed,
                "reconcile pass"
            ),
            Err(e) => warn!("reconcile pass failed: {e}"),
        }
    }
    info!("reconcile loop stopped");
}
