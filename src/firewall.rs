use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info};

use crate::config::IpsetConfig;
use crate::error::{GuardError, Result};

/// Capability to add a peer to the block set
#[async_trait]
pub trait BlockingAction: Send + Sync {
    /// Block `peer`. Blocking an already blocked peer succeeds.
    async fn block(&self, peer: &str) -> Result<()>;
}

/// Blocks peers by adding them to an ipset `hash:ip` set
#[derive(Debug, Clone)]
pub struct IpsetBlocker {
    config: IpsetConfig,
}

impl IpsetBlocker {
    pub fn new(config: IpsetConfig) -> Self {
        Self { config }
    }

    pub fn set_name(&self) -> &str {
        &self.config.name
    }

    /// Create the set with its entry timeout; an existing set is left alone
    pub async fn create_set(&self) -> Result<()> {
        let timeout = self.config.timeout_secs.to_string();
        self.run(&[
            "create",
            "-exist",
            &self.config.name,
            "hash:ip",
            "timeout",
            &timeout,
        ])
        .await?;

        info!(
            "ipset {} ready (hash:ip timeout {})",
            self.config.name, self.config.timeout_secs
        );
        Ok(())
    }

    async fn run(&self, args: &[&str]) -> Result<()> {
        let command = format!("{} {}", self.config.binary, args.join(" "));
        debug!("Running: {}", command);

        let output = Command::new(&self.config.binary)
            .args(args)
            .output()
            .await
            .map_err(|source| GuardError::Spawn {
                command: command.clone(),
                source,
            })?;

        if !output.status.success() {
            return Err(GuardError::Command {
                command,
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(())
    }
}

#[async_trait]
impl BlockingAction for IpsetBlocker {
    async fn block(&self, peer: &str) -> Result<()> {
        self.run(&["add", "-exist", &self.config.name, peer]).await
    }
}

/// Logs what would be blocked without touching the firewall
#[derive(Debug, Clone, Default)]
pub struct DryRunBlocker;

#[async_trait]
impl BlockingAction for DryRunBlocker {
    async fn block(&self, peer: &str) -> Result<()> {
        info!("[dry-run] would block {}", peer);
        Ok(())
    }
}

/// iptables rules that drop traffic from members of `set`
pub fn iptables_rules(set: &str, ports: &[u16]) -> Vec<String> {
    let mut rules = Vec::new();

    if !ports.is_empty() {
        let ports = ports
            .iter()
            .map(|p| p.to_string())
            .collect::<Vec<_>>()
            .join(",");
        rules.push(format!(
            "iptables -I INPUT -p tcp -m set --match-set {} src -m multiport --dports {} -j DROP",
            set, ports
        ));
    }

    rules.push(format!(
        "iptables -I INPUT -p tcp -m set --match-set {} src -j DROP",
        set
    ));
    rules
}
