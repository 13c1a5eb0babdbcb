//! Whitelisted networks
//!
//! Peers inside any whitelisted prefix are never blocked. The set is assembled
//! once at startup from:
//! - explicit CIDR / IP entries from the configuration
//! - a whitelist file (whitespace separated, `#` comments)
//! - the IPv4 addresses of the local interfaces
//!
//! After [`WhitelistBuilder::build`] the set is immutable, so the policy loop
//! can share it behind an `Arc` without locking.

use std::net::IpAddr;
use std::path::Path;

use get_if_addrs::{get_if_addrs, IfAddr};
use ipnetwork::IpNetwork;
use tracing::{debug, info, warn};

/// Membership test for peers exempt from blocking
pub trait Whitelist: Send + Sync {
    /// `peer` is the textual peer identity (remote IP)
    fn contains(&self, peer: &str) -> bool;
}

/// Immutable set of whitelisted network prefixes
#[derive(Debug, Clone, Default)]
pub struct WhitelistSet {
    networks: Vec<IpNetwork>,
}

impl WhitelistSet {
    pub fn builder() -> WhitelistBuilder {
        WhitelistBuilder::default()
    }

    /// Empty whitelist: nothing is exempt
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.networks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.networks.is_empty()
    }

    pub fn networks(&self) -> &[IpNetwork] {
        &self.networks
    }

    /// Check if a network contains the IP
    pub fn contains_ip(&self, ip: IpAddr) -> bool {
        self.networks.iter().any(|network| network.contains(ip))
    }
}

impl Whitelist for WhitelistSet {
    fn contains(&self, peer: &str) -> bool {
        match peer.parse::<IpAddr>() {
            Ok(ip) => {
                let hit = self.contains_ip(ip);
                if hit {
                    debug!("Peer {} is whitelisted", peer);
                }
                hit
            }
            Err(_) => false,
        }
    }
}

/// Accumulates whitelist entries before freezing them into a [`WhitelistSet`]
#[derive(Debug, Default)]
pub struct WhitelistBuilder {
    networks: Vec<IpNetwork>,
}

impl WhitelistBuilder {
    /// Add a CIDR or bare IP (bare IPv4 becomes /32, bare IPv6 /128).
    /// Invalid entries are skipped.
    pub fn add_entry(&mut self, entry: &str) -> &mut Self {
        match parse_entry(entry) {
            Some(network) => self.insert(network),
            None => warn!("Invalid whitelist entry: {}", entry),
        }
        self
    }

    pub fn add_entries<'a, I>(&mut self, entries: I) -> &mut Self
    where
        I: IntoIterator<Item = &'a str>,
    {
        for entry in entries {
            self.add_entry(entry);
        }
        self
    }

    /// Load entries from a file. A missing or unreadable file adds nothing.
    pub fn add_file<P: AsRef<Path>>(&mut self, path: P) -> &mut Self {
        let path = path.as_ref();
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) => {
                warn!("Cannot read whitelist file {}: {}", path.display(), e);
                return self;
            }
        };

        let before = self.networks.len();
        for line in content.lines() {
            let line = line.split('#').next().unwrap_or_default();
            for entry in line.split_whitespace() {
                self.add_entry(entry);
            }
        }

        info!(
            "Loaded {} whitelist entries from {}",
            self.networks.len() - before,
            path.display()
        );
        self
    }

    /// Whitelist the IPv4 addresses assigned to local interfaces
    pub fn add_local_addresses(&mut self) -> &mut Self {
        let ifaces = match get_if_addrs() {
            Ok(ifaces) => ifaces,
            Err(e) => {
                warn!("Cannot enumerate local interfaces: {}", e);
                return self;
            }
        };

        for iface in ifaces {
            if let IfAddr::V4(v4) = iface.addr {
                info!("Local IP {} ({})", v4.ip, iface.name);
                self.insert(IpNetwork::from(IpAddr::V4(v4.ip)));
            }
        }
        self
    }

    pub fn len(&self) -> usize {
        self.networks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.networks.is_empty()
    }

    pub fn build(&mut self) -> WhitelistSet {
        WhitelistSet {
            networks: std::mem::take(&mut self.networks),
        }
    }

    fn insert(&mut self, network: IpNetwork) {
        if !self.networks.contains(&network) {
            self.networks.push(network);
        }
    }
}

fn parse_entry(entry: &str) -> Option<IpNetwork> {
    let entry = entry.trim();
    if entry.is_empty() {
        return None;
    }
    if let Ok(ip) = entry.parse::<IpAddr>() {
        return Some(IpNetwork::from(ip));
    }
    entry.parse::<IpNetwork>().ok()
}
