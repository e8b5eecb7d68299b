//! The tick loop.
//!
//! A tick runs the creator over every checkout in registration order, then
//! the reviewer, then the merger. Tick errors are logged and never stop the
//! loop; there is no durable state, so the next tick recomputes everything
//! from truth sources.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use ab_core::checkout::Checkout;
use ab_core::config::RepoConfig;

use crate::creator::PrCreator;
use crate::merger::PrMerger;
use crate::reviewer::PrReviewer;
use crate::shutdown::ShutdownSignal;

pub struct GitopsBot {
    creator: PrCreator,
    reviewer: Option<PrReviewer>,
    merger: PrMerger,
    checkouts: Vec<(RepoConfig, Arc<Checkout>)>,
    interval: Duration,
    trigger_tx: mpsc::Sender<()>,
    trigger_rx: tokio::sync::Mutex<mpsc::Receiver<()>>,
    ticks: AtomicU64,
}

impl GitopsBot {
    pub fn new(
        creator: PrCreator,
        reviewer: Option<PrReviewer>,
        merger: PrMerger,
        checkouts: Vec<(RepoConfig, Arc<Checkout>)>,
        interval: Duration,
    ) -> Self {
        // Capacity 1: a trigger arriving while one is already pending is
        // dropped, which is what coalesces manual triggers.
        let (trigger_tx, trigger_rx) = mpsc::channel(1);
        Self {
            creator,
            reviewer,
            merger,
            checkouts,
            interval,
            trigger_tx,
            trigger_rx: tokio::sync::Mutex::new(trigger_rx),
            ticks: AtomicU64::new(0),
        }
    }

    /// Request a tick without waiting for the interval. Never blocks; a
    /// trigger arriving during an in-flight tick is deferred to the next
    /// loop iteration, and further ones coalesce with it.
    pub fn trigger_now(&self) {
        if self.trigger_tx.try_send(()).is_err() {
            debug!("tick already pending, trigger coalesced");
        }
    }

    /// Completed tick count (for observability and tests).
    pub fn tick_count(&self) -> u64 {
        self.ticks.load(Ordering::SeqCst)
    }

    /// One tick: creator per checkout, then reviewer, then merger.
    ///
    /// A failing checkout does not stop the others; its branches simply
    /// reappear next tick. A failing reviewer or merger aborts the rest of
    /// the tick; everything is retried on the next one.
    pub async fn execute(&self) -> Result<()> {
        for (repo, checkout) in &self.checkouts {
            if let Err(e) = self.creator.execute(repo, checkout).await {
                warn!(repo = %repo, error = %format!("{e:#}"), "unable to create prs");
            }
        }
        if let Some(reviewer) = &self.reviewer {
            reviewer.execute().await?;
        }
        self.merger.execute().await?;
        Ok(())
    }

    async fn run_tick(&self) {
        if let Err(e) = self.execute().await {
            warn!(error = %format!("{e:#}"), "unable to execute iteration of cron");
        }
        self.ticks.fetch_add(1, Ordering::SeqCst);
    }

    /// Loop until shutdown, ticking on the interval or on manual triggers,
    /// whichever fires first.
    pub async fn run(&self, shutdown: ShutdownSignal) {
        let mut shutdown_rx = shutdown.subscribe();
        let mut trigger_rx = self.trigger_rx.lock().await;
        info!(interval_secs = self.interval.as_secs(), "bot loop started");
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("bot loop stopping");
                    return;
                }
                Some(()) = trigger_rx.recv() => self.run_tick().await,
                _ = tokio::time::sleep(self.interval) => self.run_tick().await,
            }
        }
    }
}
