// src/config.rs

//! Manages server configuration: loading, defaulting, and validation.

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::fs;
use std::time::Duration;

/// A remote cluster this cluster may replicate to, with the addresses of its
/// replication masters.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct RemoteCluster {
    pub name: String,
    pub masters: Vec<String>,
}

/// Identity of this cluster plus the directory of known remote clusters.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ClusterConfig {
    /// 64-bit id stamped into every commit-log payload block, so
    /// cross-cluster replication can refuse its own output. 0 is reserved
    /// for "unknown origin, never replicate".
    pub id: u64,
    #[serde(default = "default_cluster_name")]
    pub name: String,
    #[serde(default)]
    pub remotes: Vec<RemoteCluster>,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            id: 1,
            name: default_cluster_name(),
            remotes: Vec::new(),
        }
    }
}

fn default_cluster_name() -> String {
    "primary".to_string()
}

/// Failover / recovery tuning.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct FailoverConfig {
    /// Recovery proceeds only while at least this percentage of the known
    /// range servers is connected.
    #[serde(default = "default_quorum_percentage")]
    pub quorum_percentage: u32,
    /// Per-phase timeout for recovery requests.
    #[serde(with = "humantime_serde", default = "default_failover_timeout")]
    pub timeout: Duration,
    /// Interval between scheduler ticks re-entering parked operations.
    #[serde(with = "humantime_serde", default = "default_scheduler_interval")]
    pub scheduler_interval: Duration,
    /// When a destination reports its ranges already live, re-route the
    /// withdrawn ranges to other servers instead of treating them as
    /// recovered.
    #[serde(default)]
    pub readd_withdrawn_destinations: bool,
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            quorum_percentage: default_quorum_percentage(),
            timeout: default_failover_timeout(),
            scheduler_interval: default_scheduler_interval(),
            readd_withdrawn_destinations: false,
        }
    }
}

fn default_quorum_percentage() -> u32 {
    40
}
fn default_failover_timeout() -> Duration {
    Duration::from_secs(300)
}
fn default_scheduler_interval() -> Duration {
    Duration::from_secs(2)
}

/// Cross-cluster replication tuning.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ReplicationConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Interval between replication-master control loop runs (DFS scan,
    /// receiver refresh, GC).
    #[serde(with = "humantime_serde", default = "default_scan_interval")]
    pub scan_interval: Duration,
    #[serde(default = "default_replication_master_port")]
    pub master_port: u16,
    #[serde(default = "default_replication_slave_port")]
    pub slave_port: u16,
    /// Transient-error retries when shipping a batch to a remote slave.
    #[serde(default = "default_update_retry_limit")]
    pub update_retry_limit: u32,
    #[serde(with = "humantime_serde", default = "default_request_timeout")]
    pub request_timeout: Duration,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            scan_interval: default_scan_interval(),
            master_port: default_replication_master_port(),
            slave_port: default_replication_slave_port(),
            update_retry_limit: default_update_retry_limit(),
            request_timeout: default_request_timeout(),
        }
    }
}

fn default_scan_interval() -> Duration {
    Duration::from_secs(10)
}
fn default_replication_master_port() -> u16 {
    38100
}
fn default_replication_slave_port() -> u16 {
    38101
}
fn default_update_retry_limit() -> u32 {
    3
}
fn default_request_timeout() -> Duration {
    Duration::from_secs(10)
}

/// Commit-log tuning.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct CommitLogConfig {
    /// Compress payload blocks with zstd when it shrinks them.
    #[serde(default = "default_true")]
    pub compress: bool,
}

impl Default for CommitLogConfig {
    fn default() -> Self {
        Self { compress: true }
    }
}

fn default_true() -> bool {
    true
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Config {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Coordinator address range servers and recovery callbacks connect to.
    #[serde(default = "default_master_addr")]
    pub master_addr: String,
    /// Root of the local data directory (run files; backing store of the
    /// bundled local DFS).
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    /// Root namespace inside the DFS.
    #[serde(default = "default_toplevel_dir")]
    pub toplevel_dir: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub cluster: ClusterConfig,
    #[serde(default)]
    pub failover: FailoverConfig,
    #[serde(default)]
    pub replication: ReplicationConfig,
    #[serde(default)]
    pub commitlog: CommitLogConfig,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    38060
}
fn default_master_addr() -> String {
    "127.0.0.1:38050".to_string()
}
fn default_data_dir() -> String {
    "tesseradb_data".to_string()
}
fn default_toplevel_dir() -> String {
    "/tessera".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        toml::from_str("").expect("empty config defaults")
    }
}

impl Config {
    /// Creates a new `Config` instance by reading and parsing a TOML file.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file at '{path}'"))?;
        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse TOML from '{path}'"))?;
        config.validate()?;
        Ok(config)
    }

    /// Validates the resolved configuration to ensure logical consistency.
    pub fn validate(&self) -> Result<()> {
        if self.port == 0 {
            return Err(anyhow!("port cannot be 0"));
        }
        if self.host.trim().is_empty() {
            return Err(anyhow!("host cannot be empty"));
        }
        if self.cluster.id == 0 {
            return Err(anyhow!(
                "cluster.id 0 is reserved for unknown-origin blocks"
            ));
        }
        if self.failover.quorum_percentage > 100 {
            return Err(anyhow!("failover.quorum_percentage cannot exceed 100"));
        }
        for remote in &self.cluster.remotes {
            if remote.masters.is_empty() {
                return Err(anyhow!(
                    "remote cluster '{}' has no master addresses",
                    remote.name
                ));
            }
        }
        Ok(())
    }
}
