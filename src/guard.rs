//! Threshold policy loop
//!
//! Every tick the guard takes a fresh snapshot, ranks peers by connection
//! count and walks the ranking from the top. The walk stops at the first peer
//! below the kill threshold; since the ranking is descending no later peer
//! can qualify. Whitelisted peers are skipped, everyone else is handed to the
//! [`BlockingAction`].
//!
//! Passes run strictly one after another. A pass that overruns the interval
//! delays the schedule; missed ticks collapse into a single pending tick.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::aggregate::{top, total_connections, AggregationMode};
use crate::error::{GuardError, Result};
use crate::firewall::BlockingAction;
use crate::models::CountItem;
use crate::snapshot::{read_connections, SnapshotLayout, SnapshotSource};
use crate::whitelist::Whitelist;

/// Inputs of the policy loop
#[derive(Debug, Clone)]
pub struct GuardSettings {
    ports: Vec<u16>,
    kill: usize,
    interval: Duration,
    mode: AggregationMode,
    layout: SnapshotLayout,
}

impl GuardSettings {
    pub fn new(
        ports: Vec<u16>,
        kill: usize,
        interval: Duration,
        mode: AggregationMode,
    ) -> Result<Self> {
        if kill == 0 {
            return Err(GuardError::InvalidSetting(
                "kill threshold must be at least 1".to_string(),
            ));
        }
        if interval.is_zero() {
            return Err(GuardError::InvalidSetting(
                "interval must be greater than zero".to_string(),
            ));
        }

        Ok(Self {
            ports,
            kill,
            interval,
            mode,
            layout: SnapshotLayout::default(),
        })
    }

    pub fn with_layout(mut self, layout: SnapshotLayout) -> Self {
        self.layout = layout;
        self
    }

    pub fn ports(&self) -> &[u16] {
        &self.ports
    }

    pub fn kill(&self) -> usize {
        self.kill
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn mode(&self) -> AggregationMode {
        self.mode
    }

    pub fn layout(&self) -> SnapshotLayout {
        self.layout
    }
}

/// Result of handing a peer to the blocking action
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "error", rename_all = "snake_case")]
pub enum BlockOutcome {
    Blocked,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BlockDecision {
    pub peer: String,
    pub count: usize,
    pub outcome: BlockOutcome,
}

/// Summary of one evaluation pass
#[derive(Debug, Clone, Default, Serialize)]
pub struct PassReport {
    /// Distinct peers in the ranking
    pub peers: usize,
    /// Connections across all ranked peers
    pub connections: usize,
    /// Over-threshold peers skipped because they are whitelisted
    pub whitelisted: Vec<String>,
    pub decisions: Vec<BlockDecision>,
}

impl PassReport {
    pub fn blocked(&self) -> impl Iterator<Item = &BlockDecision> {
        self.decisions
            .iter()
            .filter(|d| d.outcome == BlockOutcome::Blocked)
    }
}

/// What the walk does with the current ranking entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WalkStep {
    /// Below threshold: no later entry can qualify
    Stop,
    /// Whitelisted: move on to the next entry
    Skip,
    Block,
}

fn next_step(item: &CountItem, kill: usize, whitelist: &dyn Whitelist) -> WalkStep {
    if item.n < kill {
        WalkStep::Stop
    } else if whitelist.contains(&item.key) {
        WalkStep::Skip
    } else {
        WalkStep::Block
    }
}

/// Walk a descending ranking and block every qualifying peer.
///
/// A failed block is recorded and the walk continues with the next peer.
pub async fn walk(
    ranked: &[CountItem],
    kill: usize,
    whitelist: &dyn Whitelist,
    blocker: &dyn BlockingAction,
) -> PassReport {
    let mut report = PassReport {
        peers: ranked.len(),
        connections: total_connections(ranked),
        ..Default::default()
    };

    for item in ranked {
        match next_step(item, kill, whitelist) {
            WalkStep::Stop => break,
            WalkStep::Skip => {
                debug!("Skipping whitelisted peer {} ({} connections)", item.key, item.n);
                report.whitelisted.push(item.key.clone());
            }
            WalkStep::Block => {
                let outcome = match blocker.block(&item.key).await {
                    Ok(()) => {
                        info!("Blocked {} ({} connections)", item.key, item.n);
                        BlockOutcome::Blocked
                    }
                    Err(e) => {
                        warn!("Failed to block {}: {}", item.key, e);
                        BlockOutcome::Failed(e.to_string())
                    }
                };
                report.decisions.push(BlockDecision {
                    peer: item.key.clone(),
                    count: item.n,
                    outcome,
                });
            }
        }
    }

    report
}

/// Periodic snapshot → rank → block loop
pub struct Guard {
    settings: GuardSettings,
    source: Box<dyn SnapshotSource>,
    whitelist: Arc<dyn Whitelist>,
    blocker: Box<dyn BlockingAction>,
}

impl Guard {
    pub fn new<S, B>(
        settings: GuardSettings,
        source: S,
        whitelist: Arc<dyn Whitelist>,
        blocker: B,
    ) -> Self
    where
        S: SnapshotSource + 'static,
        B: BlockingAction + 'static,
    {
        Self {
            settings,
            source: Box::new(source),
            whitelist,
            blocker: Box::new(blocker),
        }
    }

    pub fn settings(&self) -> &GuardSettings {
        &self.settings
    }

    /// Current ranking without taking any action
    pub async fn ranking(&self) -> Result<Vec<CountItem>> {
        let records = read_connections(self.source.as_ref(), self.settings.layout).await?;
        Ok(top(&records, &self.settings.ports, self.settings.mode))
    }

    /// Run a single evaluation pass
    pub async fn evaluate(&self) -> Result<PassReport> {
        let ranked = self.ranking().await?;
        Ok(walk(
            &ranked,
            self.settings.kill,
            self.whitelist.as_ref(),
            self.blocker.as_ref(),
        )
        .await)
    }

    /// Run passes forever, the first one immediately
    pub async fn run(&self) {
        self.run_until(std::future::pending::<()>()).await
    }

    /// Run passes until `shutdown` resolves. A pass in progress is finished
    /// before the shutdown is observed, and a pending shutdown wins over a
    /// pending tick.
    pub async fn run_until<F>(&self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        let mut ticker = tokio::time::interval(self.settings.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tokio::pin!(shutdown);

        info!(
            "Guard started: every {:?} block peers with >= {} {} connections",
            self.settings.interval, self.settings.kill, self.settings.mode
        );

        loop {
            tokio::select! {
                biased;

                _ = &mut shutdown => {
                    info!("Shutdown signal received");
                    break;
                }
                _ = ticker.tick() => {
                    match self.evaluate().await {
                        Ok(report) => debug!(
                            "Pass complete: {} peers, {} connections, {} blocked, {} whitelisted",
                            report.peers,
                            report.connections,
                            report.blocked().count(),
                            report.whitelisted.len()
                        ),
                        Err(e) => error!("Evaluation failed: {}", e),
                    }
                }
            }
        }

        info!("Guard stopped");
    }
}
