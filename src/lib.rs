pub mod aggregate;
pub mod classifier;
pub mod config;
pub mod error;
pub mod firewall;
pub mod guard;
pub mod models;
pub mod snapshot;
pub mod whitelist;

#[cfg(test)]
mod testing;

use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::info;

pub use aggregate::AggregationMode;
pub use classifier::{classify, is_abnormal, AbnormalReason};
pub use config::Config;
pub use error::GuardError;
pub use firewall::{BlockingAction, DryRunBlocker, IpsetBlocker};
pub use guard::{BlockDecision, BlockOutcome, Guard, GuardSettings, PassReport};
pub use models::{ConnectionRecord, CountItem, Endpoint, TcpState, TimerActive};
pub use snapshot::{parse_snapshot, ProcNetSource, SnapshotLayout, SnapshotSource};
pub use whitelist::{Whitelist, WhitelistSet};

/// Core tcpguard instance
pub struct TcpGuard {
    config: Config,
    source: ProcNetSource,
}

impl TcpGuard {
    /// Create a new tcpguard instance
    pub fn new(config: Config) -> Self {
        let source = ProcNetSource::new(config.guard.sources.clone());
        Self { config, source }
    }

    /// Rank peers from a single snapshot
    pub async fn top(&self) -> Result<Vec<CountItem>> {
        let records = snapshot::read_connections(&self.source, self.config.guard.layout)
            .await
            .context("Failed to read connection table")?;

        Ok(aggregate::top(
            &records,
            &self.config.guard.ports,
            self.config.guard.mode,
        ))
    }

    /// Build the whitelist from the configured file, networks and local addresses
    pub fn build_whitelist(&self) -> WhitelistSet {
        let wl = &self.config.whitelist;
        let mut builder = WhitelistSet::builder();

        info!("Loading whitelist file: {}", wl.file.display());
        builder.add_file(&wl.file);
        builder.add_entries(wl.networks.iter().map(String::as_str));
        if wl.include_local {
            builder.add_local_addresses();
        }

        let set = builder.build();
        info!("Whitelist holds {} networks", set.len());
        set
    }

    /// Make sure the ipset exists
    pub async fn init_firewall(&self) -> Result<()> {
        IpsetBlocker::new(self.config.ipset.clone())
            .create_set()
            .await
            .with_context(|| format!("Failed to create ipset {}", self.config.ipset.name))
    }

    /// Assemble the policy loop. With `dry_run` peers are only logged.
    pub fn guard(&self, whitelist: WhitelistSet, dry_run: bool) -> Result<Guard> {
        let settings = self
            .config
            .guard_settings()
            .context("Invalid guard settings")?;
        let whitelist: Arc<dyn Whitelist> = Arc::new(whitelist);
        let source = self.source.clone();

        let guard = if dry_run {
            Guard::new(settings, source, whitelist, DryRunBlocker)
        } else {
            Guard::new(
                settings,
                source,
                whitelist,
                IpsetBlocker::new(self.config.ipset.clone()),
            )
        };
        Ok(guard)
    }

    /// Get configuration reference
    pub fn config(&self) -> &Config {
        &self.config
    }
}
