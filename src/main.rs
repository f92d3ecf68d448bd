//! conslogctl - inspect and maintain a consensus log data directory
//!
//! Works offline against the files of a stopped node.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use consensus_log::config::ConsensusLogConfig;
use consensus_log::context::ConsensusContext;
use consensus_log::error::{Error, Result};
use consensus_log::membership::Configuration;
use consensus_log::state::MetaTracker;
use consensus_log::wal::{LogStore, PurgeTarget};

/// Consensus log maintenance tool
#[derive(Parser)]
#[command(name = "conslogctl")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "consensus-log.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "warn")]
    log_level: String,

    /// Print machine-readable JSON where supported
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize a new configuration file
    Init {
        /// Output path for configuration file
        #[arg(short, long, default_value = "consensus-log.toml")]
        output: PathBuf,

        /// Node ID
        #[arg(long, default_value = "node-1")]
        node_id: String,

        /// Address of this node in the membership string
        #[arg(long, default_value = "127.0.0.1:3306")]
        address: String,
    },

    /// Validate configuration file
    Validate,

    /// List log files with their index ranges
    ShowLogs,

    /// Print entry headers in an index range
    ShowEntries {
        /// First index to print
        #[arg(long)]
        from: u64,

        /// Last index to print (defaults to `from`)
        #[arg(long)]
        to: Option<u64>,
    },

    /// Locate the file and byte offset of an index
    FindPosition {
        index: u64,
    },

    /// Show persisted membership and consensus metadata
    Membership,

    /// Delete log files before a cutoff
    Purge {
        /// Purge files whose entries all precede this index
        #[arg(long, conflicts_with_all = ["before_time", "to_file"])]
        before_index: Option<u64>,

        /// Purge files closed before this RFC 3339 time
        #[arg(long, conflicts_with = "to_file")]
        before_time: Option<String>,

        /// Purge files preceding this log file
        #[arg(long)]
        to_file: Option<String>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(&cli.log_level);

    match cli.command {
        Commands::Init {
            output,
            node_id,
            address,
        } => run_init(output, node_id, address),
        Commands::Validate => run_validate(cli.config),
        Commands::ShowLogs => run_show_logs(cli.config, cli.json),
        Commands::ShowEntries { from, to } => run_show_entries(cli.config, from, to.unwrap_or(from)),
        Commands::FindPosition { index } => run_find_position(cli.config, index),
        Commands::Membership => run_membership(cli.config, cli.json),
        Commands::Purge {
            before_index,
            before_time,
            to_file,
        } => {
            let target = match (before_index, before_time, to_file) {
                (Some(index), None, None) => PurgeTarget::Index(index),
                (None, Some(time), None) => {
                    let time = chrono::DateTime::parse_from_rfc3339(&time)
                        .map_err(|e| Error::Config(format!("invalid time {:?}: {}", time, e)))?;
                    PurgeTarget::Time(time.with_timezone(&chrono::Utc))
                }
                (None, None, Some(file)) => PurgeTarget::File(file),
                _ => {
                    return Err(Error::Config(
                        "purge needs one of --before-index, --before-time or --to-file".into(),
                    ))
                }
            };
            run_purge(cli.config, target)
        }
    }
}

/// Initialize logging
fn init_logging(level: &str) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.into());

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn open_store(config: &ConsensusLogConfig) -> Result<LogStore> {
    let ctx = Arc::new(ConsensusContext::new());
    LogStore::open(config.log_dir(), config.log.clone(), ctx)
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String> {
    serde_json::to_string_pretty(value).map_err(|e| Error::Internal(e.to_string()))
}

/// Write a starter configuration file
fn run_init(output: PathBuf, node_id: String, address: String) -> Result<()> {
    let config_content = format!(r#"# Consensus log configuration

[node]
id = "{node_id}"
address = "{address}"
data_dir = "/var/lib/consensus-log/{node_id}"

[log]
basename = "consensus-log"
max_file_size_mb = 1024
max_log_size = 20971520
large_event_split_size = 2097152
split_large_events = true
checksum = true
fsync = true

[prefetch]
window_size = 10
max_cache_entries = 1000
max_cache_bytes = 67108864
fast_fetch = true

[cluster]
members = "{address}#5@1"
learners = ""
election_weight = 5
heartbeat_interval_ms = 500
role_queue_capacity = 64

[logging]
level = "info"
format = "pretty"
"#);

    std::fs::write(&output, config_content)?;
    println!("Configuration file created: {}", output.display());
    println!("Check it with: conslogctl --config {} validate", output.display());

    Ok(())
}

/// Validate configuration
fn run_validate(config_path: PathBuf) -> Result<()> {
    match ConsensusLogConfig::from_file(&config_path) {
        Ok(config) => {
            let membership = Configuration::install(
                &config.cluster.members,
                &config.cluster.learners,
                &config.node.address,
            )?;
            println!("✓ Configuration is valid");
            println!("  Node ID:        {}", config.node.id);
            println!("  Address:        {}", config.node.address);
            println!("  Data Directory: {}", config.data_dir().display());
            println!("  Members:        {}", membership.member_count());
            println!("  Learners:       {}", membership.learner_count());
            println!("  Local Server:   {}", membership.local_id());
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Configuration error: {}", e);
            Err(e)
        }
    }
}

fn run_show_logs(config_path: PathBuf, json: bool) -> Result<()> {
    let config = ConsensusLogConfig::from_file(&config_path)?;
    let store = open_store(&config)?;
    let files = store.list_files();

    if json {
        println!("{}", to_json(&files)?);
        return Ok(());
    }

    println!("{:<28} {:>12} {:>12} {:>14}  Created", "File", "First", "Last", "Size");
    for file in &files {
        let created = chrono::DateTime::from_timestamp(file.timestamp, 0)
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| file.timestamp.to_string());
        println!(
            "{:<28} {:>12} {:>12} {:>14}  {}",
            file.file_name, file.first_index, file.last_index, file.size, created
        );
    }
    println!();
    println!("{} file(s), last index {}", files.len(), store.last_index());
    Ok(())
}

fn run_show_entries(config_path: PathBuf, from: u64, to: u64) -> Result<()> {
    let config = ConsensusLogConfig::from_file(&config_path)?;
    let store = open_store(&config)?;

    println!("{:>12} {:>8} {:>10} {:>10} {:>10}", "Index", "Term", "Flag", "Length", "Checksum");
    for entry in store.read_range(from, to)? {
        println!(
            "{:>12} {:>8} {:>#10x} {:>10} {:>#10x}",
            entry.index,
            entry.term,
            entry.flag.bits(),
            entry.length(),
            entry.checksum
        );
    }
    Ok(())
}

fn run_find_position(config_path: PathBuf, index: u64) -> Result<()> {
    let config = ConsensusLogConfig::from_file(&config_path)?;
    let store = open_store(&config)?;
    let (file, offset) = store.find_position(index)?;
    println!("{} {}", file, offset);
    Ok(())
}

fn run_membership(config_path: PathBuf, json: bool) -> Result<()> {
    let config = ConsensusLogConfig::from_file(&config_path)?;

    let tracker = MetaTracker::open(config.state_dir())?;
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    let meta = runtime.block_on(tracker.snapshot())?;

    if json {
        println!("{}", to_json(&meta)?);
        return Ok(());
    }

    let members = meta.cluster_info.as_deref().unwrap_or(&config.cluster.members);
    let learners = meta
        .cluster_learner_info
        .as_deref()
        .unwrap_or(&config.cluster.learners);
    let membership = Configuration::install(members, learners, &config.node.address)?;

    println!("Consensus Metadata");
    println!("==================");
    println!("Current Term:      {}", meta.current_term);
    println!("Last Leader Term:  {}", meta.last_leader_term);
    println!("Start Apply Index: {}", meta.start_apply_index);
    println!("Recover Status:    {}", meta.recover_status);
    println!();
    println!("Members:");
    for member in membership.members() {
        println!(
            "  {:>3}  {:<24} weight {}{}{}",
            member.server_id,
            member.address,
            member.election_weight,
            if member.force_sync { " force-sync" } else { "" },
            if member.is_local() { " (local)" } else { "" }
        );
    }
    println!("Learners:");
    for learner in membership.learners() {
        println!(
            "  {:>3}  {:<24} source {}{}",
            learner.server_id,
            learner.address,
            learner.learner_source,
            if learner.is_local() { " (local)" } else { "" }
        );
    }
    Ok(())
}

fn run_purge(config_path: PathBuf, target: PurgeTarget) -> Result<()> {
    let config = ConsensusLogConfig::from_file(&config_path)?;
    let store = open_store(&config)?;

    let removed = store.purge_before(target)?;
    if removed.is_empty() {
        println!("Nothing to purge");
    }
    for name in removed {
        println!("Purged {}", name);
    }
    Ok(())
}
