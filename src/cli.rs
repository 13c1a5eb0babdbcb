use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use serde::Serialize;
use std::path::PathBuf;
use tabled::{Table, Tabled};
use tracing::error;

use tcpguard::aggregate::total_connections;
use tcpguard::firewall::iptables_rules;
use tcpguard::{AggregationMode, Config, CountItem, TcpGuard};

#[derive(Parser)]
#[command(name = "tcpguard")]
#[command(author, version, about = "Rank TCP peers by connection count and block abusive ones with ipset")]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub debug: bool,

    /// Local ports to watch, repeatable (default: all ports)
    #[arg(short = 'p', long = "port", global = true)]
    pub ports: Vec<u16>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Show the peers holding the most connections
    Top {
        /// Number of peers to show
        #[arg(short = 'n', long = "top", default_value_t = 10)]
        top: usize,

        /// Count only abnormal connections
        #[arg(short, long)]
        abnormal: bool,

        /// Output format (table, json)
        #[arg(short, long, default_value = "table")]
        format: String,
    },

    /// Block peers automatically (example: run --kill 200)
    Run {
        /// Block a peer once it holds this many connections
        #[arg(short, long)]
        kill: usize,

        /// Seconds between evaluations
        #[arg(short = 'e', long = "every", visible_alias = "duration")]
        every: Option<u64>,

        /// ipset name
        #[arg(long)]
        ipset: Option<String>,

        /// ipset entry timeout in seconds
        #[arg(short, long)]
        timeout: Option<u64>,

        /// Whitelist file
        #[arg(short, long)]
        white: Option<PathBuf>,

        /// Count only abnormal connections
        #[arg(short, long)]
        abnormal: bool,

        /// Log decisions without touching ipset
        #[arg(long)]
        dry_run: bool,
    },

    /// Generate default configuration file
    GenConfig {
        /// Output path (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

/// Table row for the peer ranking
#[derive(Tabled)]
struct PeerRow {
    #[tabled(rename = "#")]
    rank: usize,
    #[tabled(rename = "Peer")]
    peer: String,
    #[tabled(rename = "Connections")]
    connections: usize,
}

#[derive(Serialize)]
struct TopOutput<'a> {
    peers: &'a [CountItem],
    total_peers: usize,
    total_connections: usize,
}

pub fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::load_or_default()?,
    };

    if !cli.ports.is_empty() {
        config.guard.ports = cli.ports.clone();
    }
    Ok(config)
}

pub async fn run_command(cli: Cli, config: Config) -> Result<()> {
    match cli.command {
        None => cmd_top(config, 10, false, "table").await,
        Some(Commands::Top {
            top,
            abnormal,
            format,
        }) => cmd_top(config, top, abnormal, &format).await,
        Some(Commands::Run {
            kill,
            every,
            ipset,
            timeout,
            white,
            abnormal,
            dry_run,
        }) => {
            let mut config = config;
            config.guard.kill = kill;
            if let Some(every) = every {
                config.guard.interval_secs = every;
            }
            if let Some(name) = ipset {
                config.ipset.name = name;
            }
            if let Some(timeout) = timeout {
                config.ipset.timeout_secs = timeout;
            }
            if let Some(white) = white {
                config.whitelist.file = white;
            }
            if abnormal {
                config.guard.mode = AggregationMode::Abnormal;
            }
            cmd_run(config, dry_run).await
        }
        Some(Commands::GenConfig { output }) => cmd_gen_config(output),
    }
}

async fn cmd_top(mut config: Config, top: usize, abnormal: bool, format: &str) -> Result<()> {
    if abnormal {
        config.guard.mode = AggregationMode::Abnormal;
    }
    show_ports(&config);

    let tg = TcpGuard::new(config);
    let ranked = tg.top().await?;
    let shown = &ranked[..top.min(ranked.len())];
    let total = total_connections(&ranked);

    match format {
        "json" => {
            let output = TopOutput {
                peers: shown,
                total_peers: ranked.len(),
                total_connections: total,
            };
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        "table" => {
            if shown.is_empty() {
                println!("{}", "No matching connections".yellow());
            } else {
                let rows: Vec<PeerRow> = shown
                    .iter()
                    .enumerate()
                    .map(|(i, item)| PeerRow {
                        rank: i + 1,
                        peer: item.key.clone(),
                        connections: item.n,
                    })
                    .collect();
                println!("{}", Table::new(rows));
            }
            println!("\n{}", "total".bold());
            println!("ip: {} tcp: {}", ranked.len(), total);
        }
        other => bail!("Unknown output format: {}", other),
    }

    Ok(())
}

async fn cmd_run(config: Config, dry_run: bool) -> Result<()> {
    show_ports(&config);
    let tg = TcpGuard::new(config);
    let ipset = tg.config().ipset.clone();

    let whitelist = tg.build_whitelist();
    let white_count = whitelist.len();
    let guard = tg.guard(whitelist, dry_run)?;

    if dry_run {
        println!("{}", "Dry run: no peer will be added to ipset".yellow());
    } else {
        match tg.init_firewall().await {
            Ok(()) => println!(
                "ipset create {} hash:ip timeout {}",
                ipset.name, ipset.timeout_secs
            ),
            Err(e) => error!("{:#}", e),
        }
    }

    println!("please confirm the following iptables rule is in effect");
    let rules = iptables_rules(&ipset.name, &tg.config().guard.ports);
    println!("{}", rules.join("\nor\n").cyan());

    println!("white ip num: {}", white_count);

    let settings = guard.settings();
    println!(
        "{}",
        format!(
            "every {}s block if {} conn/ip >= {}",
            settings.interval().as_secs(),
            settings.mode(),
            settings.kill()
        )
        .green()
    );

    guard
        .run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Cannot listen for Ctrl-C: {}", e);
                std::future::pending::<()>().await;
            }
        })
        .await;

    Ok(())
}

fn cmd_gen_config(output: Option<PathBuf>) -> Result<()> {
    let config = Config::default();
    match output {
        Some(path) => {
            config.save(&path)?;
            println!("Configuration written to {}", path.display());
        }
        None => {
            let content =
                toml::to_string_pretty(&config).context("Failed to serialize configuration")?;
            print!("{}", content);
        }
    }
    Ok(())
}

fn show_ports(config: &Config) {
    if !config.guard.ports.is_empty() {
        println!("local ports: {:?}", config.guard.ports);
    }
}
