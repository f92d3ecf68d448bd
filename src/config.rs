//! Consensus Log Configuration
//!
//! This module provides configuration structures for the consensus
//! replication core: node identity, log files, prefetch and cluster layout.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsensusLogConfig {
    /// Node-specific configuration
    pub node: NodeConfig,

    /// Replicated log configuration
    #[serde(default)]
    pub log: LogConfig,

    /// Follower prefetch configuration
    #[serde(default)]
    pub prefetch: PrefetchConfig,

    /// Cluster configuration
    #[serde(default)]
    pub cluster: ClusterConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Node-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Unique node identifier
    pub id: String,

    /// Address this node is known by in the membership string
    pub address: String,

    /// Data directory for log files and metadata
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

/// Replicated log configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Base name of log files (`<basename>.000001`)
    #[serde(default = "default_basename")]
    pub basename: String,

    /// Rotate to a new file once the current one reaches this size
    #[serde(default = "default_max_file_size_mb")]
    pub max_file_size_mb: u64,

    /// Largest logical entry written as a single frame, in bytes
    #[serde(default = "default_max_log_size")]
    pub max_log_size: u64,

    /// Fragment size used when a single event exceeds `max_log_size`
    #[serde(default = "default_large_event_split_size")]
    pub large_event_split_size: u64,

    /// Split oversized events instead of rejecting them
    #[serde(default = "default_true")]
    pub split_large_events: bool,

    /// Compute and verify CRC32 checksums
    #[serde(default = "default_true")]
    pub checksum: bool,

    /// Use fsync for durability (slower but safer)
    #[serde(default = "default_true")]
    pub fsync: bool,
}

/// Follower prefetch configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrefetchConfig {
    /// Entries this far behind the requested index are still delivered
    #[serde(default = "default_window_size")]
    pub window_size: u64,

    /// Maximum entries buffered per channel
    #[serde(default = "default_max_cache_entries")]
    pub max_cache_entries: usize,

    /// Maximum payload bytes buffered per channel
    #[serde(default = "default_max_cache_bytes")]
    pub max_cache_bytes: u64,

    /// Seek past entries outside the window instead of reading them
    #[serde(default = "default_true")]
    pub fast_fetch: bool,

    /// How long a blocked producer waits before re-checking for cancellation
    #[serde(default = "default_full_wait_ms")]
    pub full_wait_ms: u64,
}

/// Cluster configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Initial membership string (`addr#weight[S];...@local`)
    #[serde(default)]
    pub members: String,

    /// Initial learner string (`addr$source;...`)
    #[serde(default)]
    pub learners: String,

    /// Election weight of this node (0-9)
    #[serde(default = "default_election_weight")]
    pub election_weight: u8,

    /// Heartbeat interval in milliseconds
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,

    /// Capacity of the role-change event queue
    #[serde(default = "default_role_queue_capacity")]
    pub role_queue_capacity: usize,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (pretty, json)
    #[serde(default = "default_log_format")]
    pub format: String,
}

// Default value functions
fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/consensus-log")
}

fn default_basename() -> String {
    "consensus-log".to_string()
}

fn default_max_file_size_mb() -> u64 {
    256
}

fn default_max_log_size() -> u64 {
    20 * 1024 * 1024
}

fn default_large_event_split_size() -> u64 {
    2 * 1024 * 1024
}

fn default_window_size() -> u64 {
    10
}

fn default_max_cache_entries() -> usize {
    1000
}

fn default_max_cache_bytes() -> u64 {
    64 * 1024 * 1024
}

fn default_full_wait_ms() -> u64 {
    100
}

fn default_election_weight() -> u8 {
    5
}

fn default_heartbeat_interval_ms() -> u64 {
    500
}

fn default_role_queue_capacity() -> usize {
    64
}

fn default_true() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            basename: default_basename(),
            max_file_size_mb: default_max_file_size_mb(),
            max_log_size: default_max_log_size(),
            large_event_split_size: default_large_event_split_size(),
            split_large_events: true,
            checksum: true,
            fsync: true,
        }
    }
}

impl LogConfig {
    /// Rotation threshold in bytes
    pub fn max_file_size(&self) -> u64 {
        self.max_file_size_mb * 1024 * 1024
    }

    /// Validate the log section on its own
    pub fn validate(&self) -> crate::Result<()> {
        if self.basename.is_empty() || self.basename.contains('/') {
            return Err(crate::Error::Config(format!(
                "log.basename {:?} must be a non-empty file name",
                self.basename
            )));
        }

        if self.max_log_size == 0 {
            return Err(crate::Error::Config("log.max_log_size cannot be 0".into()));
        }

        if self.large_event_split_size == 0 {
            return Err(crate::Error::Config(
                "log.large_event_split_size cannot be 0".into(),
            ));
        }

        if self.large_event_split_size > self.max_log_size {
            return Err(crate::Error::Config(format!(
                "log.large_event_split_size ({}) cannot exceed log.max_log_size ({})",
                self.large_event_split_size, self.max_log_size
            )));
        }

        if self.max_file_size_mb == 0 {
            return Err(crate::Error::Config("log.max_file_size_mb cannot be 0".into()));
        }

        Ok(())
    }
}

impl Default for PrefetchConfig {
    fn default() -> Self {
        Self {
            window_size: default_window_size(),
            max_cache_entries: default_max_cache_entries(),
            max_cache_bytes: default_max_cache_bytes(),
            fast_fetch: true,
            full_wait_ms: default_full_wait_ms(),
        }
    }
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            members: String::new(),
            learners: String::new(),
            election_weight: default_election_weight(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            role_queue_capacity: default_role_queue_capacity(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl ConsensusLogConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Load configuration from a TOML string
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> crate::Result<Self> {
        let config: ConsensusLogConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.node.id.is_empty() {
            return Err(crate::Error::Config("node.id cannot be empty".into()));
        }

        if self.node.address.is_empty() {
            return Err(crate::Error::Config("node.address cannot be empty".into()));
        }

        self.log.validate()?;

        if self.cluster.election_weight > 9 {
            return Err(crate::Error::Config(format!(
                "cluster.election_weight must be 0-9, got {}",
                self.cluster.election_weight
            )));
        }

        if self.cluster.role_queue_capacity == 0 {
            return Err(crate::Error::Config(
                "cluster.role_queue_capacity cannot be 0".into(),
            ));
        }

        if self.prefetch.max_cache_entries == 0 {
            return Err(crate::Error::Config(
                "prefetch.max_cache_entries cannot be 0".into(),
            ));
        }

        Ok(())
    }

    /// Get the data directory path
    pub fn data_dir(&self) -> &PathBuf {
        &self.node.data_dir
    }

    /// Get the log directory path
    pub fn log_dir(&self) -> PathBuf {
        self.node.data_dir.join("log")
    }

    /// Get the metadata directory path
    pub fn state_dir(&self) -> PathBuf {
        self.node.data_dir.join("state")
    }

    /// Get heartbeat interval as Duration
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.cluster.heartbeat_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config() {
        let toml = r#"
[node]
id = "node-1"
address = "127.0.0.1:11001"
data_dir = "/var/lib/consensus-log"

[log]
max_log_size = 1048576
large_event_split_size = 65536

[cluster]
members = "127.0.0.1:11001#5;127.0.0.1:11002#5S;127.0.0.1:11003#9@1"
learners = "127.0.0.1:11004$0"
"#;

        let config = ConsensusLogConfig::from_str(toml).unwrap();
        assert_eq!(config.node.id, "node-1");
        assert_eq!(config.log.large_event_split_size, 65536);
        assert!(config.log.checksum);
        assert_eq!(config.prefetch.window_size, 10);
        assert_eq!(config.log_dir(), PathBuf::from("/var/lib/consensus-log/log"));
    }

    #[test]
    fn test_zero_split_size_rejected() {
        let toml = r#"
[node]
id = "node-1"
address = "127.0.0.1:11001"

[log]
large_event_split_size = 0
"#;
        let err = ConsensusLogConfig::from_str(toml).unwrap_err();
        assert!(matches!(err, crate::Error::Config(_)));
    }

    #[test]
    fn test_split_size_larger_than_max_rejected() {
        let log = LogConfig {
            max_log_size: 100,
            large_event_split_size: 200,
            ..LogConfig::default()
        };
        assert!(log.validate().is_err());
    }
}
