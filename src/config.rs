//! Harness configuration
//!
//! All timing bounds used by the harness live here with explicit defaults.
//! A config can be built in code with the `with_*` methods or loaded from a
//! YAML file; durations in YAML are given in milliseconds.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Deserializer};

use crate::error::{HarnessError, Result};

/// Timing, retry and server settings for a cluster
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    /// How to launch node processes
    pub server: ServerConfig,
    /// How long a node may take to answer its first PING (default: 10s)
    #[serde(rename = "startup_timeout_ms", deserialize_with = "millis")]
    pub startup_timeout: Duration,
    /// Interval between reachability checks during startup (default: 50ms)
    #[serde(rename = "startup_poll_interval_ms", deserialize_with = "millis")]
    pub startup_poll_interval: Duration,
    /// How long cluster creation may take to elect a leader and gather voters (default: 30s)
    #[serde(rename = "bringup_timeout_ms", deserialize_with = "millis")]
    pub bringup_timeout: Duration,
    /// Deadline for a single request to a single node (default: 5s)
    #[serde(rename = "request_timeout_ms", deserialize_with = "millis")]
    pub request_timeout: Duration,
    /// Grace period before a stopping node is killed (default: 5s)
    #[serde(rename = "stop_timeout_ms", deserialize_with = "millis")]
    pub stop_timeout: Duration,
    /// How long the executor keeps retrying while no leader is elected (default: 20s)
    #[serde(rename = "leader_timeout_ms", deserialize_with = "millis")]
    pub leader_timeout: Duration,
    /// Maximum number of leader redirects followed for one command (default: 30)
    pub max_redirects: usize,
    /// First retry delay, doubled on every retry (default: 25ms)
    #[serde(rename = "retry_backoff_initial_ms", deserialize_with = "millis")]
    pub retry_backoff_initial: Duration,
    /// Upper bound for the retry delay (default: 500ms)
    #[serde(rename = "retry_backoff_max_ms", deserialize_with = "millis")]
    pub retry_backoff_max: Duration,
    /// Interval between applied-index samples while waiting for unanimity (default: 50ms)
    #[serde(rename = "unanimity_poll_interval_ms", deserialize_with = "millis")]
    pub unanimity_poll_interval: Duration,
    /// Default unanimity deadline (default: 10s)
    #[serde(rename = "unanimity_timeout_ms", deserialize_with = "millis")]
    pub unanimity_timeout: Duration,
    /// Default deadline for a new node to become a voting member (default: 20s)
    #[serde(rename = "voting_timeout_ms", deserialize_with = "millis")]
    pub voting_timeout: Duration,
    /// Seed for the cluster's own random choices; random when unset
    pub seed: Option<u64>,
    /// Wrapper command for replicated operations (e.g. `RAFT`); sent bare when unset
    pub command_prefix: Option<String>,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            startup_timeout: Duration::from_secs(10),
            startup_poll_interval: Duration::from_millis(50),
            bringup_timeout: Duration::from_secs(30),
            request_timeout: Duration::from_secs(5),
            stop_timeout: Duration::from_secs(5),
            leader_timeout: Duration::from_secs(20),
            max_redirects: 30,
            retry_backoff_initial: Duration::from_millis(25),
            retry_backoff_max: Duration::from_millis(500),
            unanimity_poll_interval: Duration::from_millis(50),
            unanimity_timeout: Duration::from_secs(10),
            voting_timeout: Duration::from_secs(20),
            seed: None,
            command_prefix: None,
        }
    }
}

impl HarnessConfig {
    /// Load a config from a YAML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml(&text)
    }

    /// Parse a config from YAML text
    pub fn from_yaml(text: &str) -> Result<Self> {
        let config: HarnessConfig = serde_yaml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings that would make polling loops spin or never retry
    pub fn validate(&self) -> Result<()> {
        if self.unanimity_poll_interval.is_zero() || self.startup_poll_interval.is_zero() {
            return Err(HarnessError::Config("poll intervals must be non-zero".to_string()));
        }
        if self.max_redirects == 0 {
            return Err(HarnessError::Config("max_redirects must be at least 1".to_string()));
        }
        if self.retry_backoff_initial > self.retry_backoff_max {
            return Err(HarnessError::Config(
                "retry_backoff_initial exceeds retry_backoff_max".to_string(),
            ));
        }
        Ok(())
    }

    pub fn with_server(mut self, server: ServerConfig) -> Self {
        self.server = server;
        self
    }

    pub fn with_startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = timeout;
        self
    }

    pub fn with_bringup_timeout(mut self, timeout: Duration) -> Self {
        self.bringup_timeout = timeout;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_leader_timeout(mut self, timeout: Duration) -> Self {
        self.leader_timeout = timeout;
        self
    }

    /// Set the retry backoff range
    pub fn with_retry_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.retry_backoff_initial = initial;
        self.retry_backoff_max = max;
        self
    }

    pub fn with_max_redirects(mut self, max_redirects: usize) -> Self {
        self.max_redirects = max_redirects;
        self
    }

    /// Set the unanimity polling interval and default deadline
    pub fn with_unanimity(mut self, poll_interval: Duration, timeout: Duration) -> Self {
        self.unanimity_poll_interval = poll_interval;
        self.unanimity_timeout = timeout;
        self
    }

    pub fn with_startup_poll_interval(mut self, interval: Duration) -> Self {
        self.startup_poll_interval = interval;
        self
    }

    pub fn with_voting_timeout(mut self, timeout: Duration) -> Self {
        self.voting_timeout = timeout;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn with_command_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.command_prefix = Some(prefix.into());
        self
    }
}

/// Node binary and network layout
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Server executable (default: `redis-server`)
    pub executable: PathBuf,
    /// Raft module loaded into the server (default: `redisraft.so`)
    pub module: PathBuf,
    /// Address nodes bind to (default: `127.0.0.1`)
    pub host: String,
    /// Node N listens on `base_port + N` (default: 5000)
    pub base_port: u16,
    /// Parent directory for node data; a temp dir per cluster when unset
    pub work_dir: Option<PathBuf>,
    /// Extra arguments appended to the server command line
    pub extra_args: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            executable: PathBuf::from("redis-server"),
            module: PathBuf::from("redisraft.so"),
            host: "127.0.0.1".to_string(),
            base_port: 5000,
            work_dir: None,
            extra_args: Vec::new(),
        }
    }
}

/// Per-node start configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Keep on-disk Raft state across restarts
    pub persist: bool,
    /// Additional module arguments, passed as `key=value`
    pub raft_args: BTreeMap<String, String>,
}

impl NodeConfig {
    /// Config with persistence enabled
    pub fn persistent() -> Self {
        Self {
            persist: true,
            ..Self::default()
        }
    }

    /// Add a module argument
    pub fn with_raft_arg(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.raft_args.insert(key.into(), value.into());
        self
    }
}

fn millis<'de, D>(deserializer: D) -> std::result::Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Duration::from_millis(u64::deserialize(deserializer)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = HarnessConfig::default();
        assert_eq!(config.unanimity_poll_interval, Duration::from_millis(50));
        assert_eq!(config.max_redirects, 30);
        assert_eq!(config.server.base_port, 5000);
        assert!(config.seed.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_from_yaml() {
        let yaml = r#"
server:
  executable: /opt/redis/bin/redis-server
  module: /opt/redisraft/redisraft.so
  base_port: 6100
unanimity_timeout_ms: 2500
max_redirects: 5
seed: 42
command_prefix: RAFT
"#;
        let config = HarnessConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.server.executable, PathBuf::from("/opt/redis/bin/redis-server"));
        assert_eq!(config.server.base_port, 6100);
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.unanimity_timeout, Duration::from_millis(2500));
        assert_eq!(config.max_redirects, 5);
        assert_eq!(config.seed, Some(42));
        assert_eq!(config.command_prefix.as_deref(), Some("RAFT"));
        // Untouched fields keep their defaults
        assert_eq!(config.voting_timeout, Duration::from_secs(20));
    }

    #[test]
    fn test_config_rejects_zero_poll_interval() {
        let err = HarnessConfig::from_yaml("unanimity_poll_interval_ms: 0").unwrap_err();
        assert!(matches!(err, HarnessError::Config(_)));
    }

    #[test]
    fn test_config_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("harness.yaml");
        std::fs::write(&path, "server:\n  work_dir: /var/tmp/sandbox\nleader_timeout_ms: 750\n").unwrap();

        let config = HarnessConfig::from_file(&path).unwrap();
        assert_eq!(config.server.work_dir, Some(PathBuf::from("/var/tmp/sandbox")));
        assert_eq!(config.leader_timeout, Duration::from_millis(750));

        let missing = HarnessConfig::from_file(dir.path().join("absent.yaml")).unwrap_err();
        assert!(matches!(missing, HarnessError::Io(_)));
    }

    #[test]
    fn test_node_config_builder() {
        let config = NodeConfig::persistent().with_raft_arg("election-timeout", "500");
        assert!(config.persist);
        assert_eq!(config.raft_args.get("election-timeout").map(String::as_str), Some("500"));
    }
}
