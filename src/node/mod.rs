//! A single store node and its lifecycle
//!
//! - `traits`: the `NodeBackend` seam between lifecycle logic and the process
//! - `process`: backend that runs a real server binary and speaks its wire protocol

pub mod process;
pub mod traits;

use std::path::Path;
use std::time::Duration;

use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info, warn};

use crate::command::{Command, Reply};
use crate::config::{HarnessConfig, NodeConfig};
use crate::error::{HarnessError, Result};
use crate::info::RaftInfo;

pub use traits::{BackendFactory, LaunchSpec, NodeBackend};

/// Cluster-assigned node identifier; never reused within a cluster
pub type NodeId = u64;

/// Lifecycle state of a node
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeState {
    Stopped,
    Running,
    /// Removed from the cluster; cannot be started again
    Removed,
}

/// One member of a cluster, wrapping its process
pub struct Node {
    spec: LaunchSpec,
    state: NodeState,
    backend: Box<dyn NodeBackend>,
    startup_timeout: Duration,
    poll_interval: Duration,
}

impl Node {
    pub(crate) fn new(spec: LaunchSpec, backend: Box<dyn NodeBackend>, config: &HarnessConfig) -> Self {
        Node {
            spec,
            state: NodeState::Stopped,
            backend,
            startup_timeout: config.startup_timeout,
            poll_interval: config.startup_poll_interval,
        }
    }

    pub fn id(&self) -> NodeId {
        self.spec.node_id
    }

    pub fn address(&self) -> String {
        self.spec.address()
    }

    pub fn port(&self) -> u16 {
        self.spec.port
    }

    pub fn data_dir(&self) -> &Path {
        &self.spec.data_dir
    }

    /// Configuration of the last start
    pub fn config(&self) -> &NodeConfig {
        &self.spec.config
    }

    pub fn state(&self) -> NodeState {
        self.state
    }

    pub fn is_running(&self) -> bool {
        self.state == NodeState::Running
    }

    /// Launch the process and wait until it answers PING
    ///
    /// On failure the process is shut down again and the node stays stopped.
    pub async fn start(&mut self, config: NodeConfig) -> Result<()> {
        match self.state {
            NodeState::Removed => {
                return Err(HarnessError::InvalidState(format!(
                    "node {} was removed and cannot be started",
                    self.id()
                )))
            }
            NodeState::Running => return Ok(()),
            NodeState::Stopped => {}
        }

        self.spec.config = config;
        info!(node_id = self.id(), address = %self.address(), persist = self.spec.config.persist, "Starting node");

        if let Err(e) = self.backend.launch(&self.spec).await {
            let _ = self.backend.shutdown().await;
            return Err(match e {
                HarnessError::Startup { .. } => e,
                other => HarnessError::Startup {
                    node_id: self.id(),
                    reason: other.to_string(),
                },
            });
        }

        if let Err(reason) = self.wait_reachable().await {
            warn!(node_id = self.id(), %reason, "Node did not come up");
            let _ = self.backend.shutdown().await;
            return Err(HarnessError::Startup {
                node_id: self.id(),
                reason,
            });
        }

        self.state = NodeState::Running;
        Ok(())
    }

    /// Send PING until the node answers or the startup deadline passes
    async fn wait_reachable(&mut self) -> std::result::Result<(), String> {
        let deadline = Instant::now() + self.startup_timeout;
        let ping = Command::ping();

        loop {
            if self.backend.has_exited() {
                return Err("process exited during startup".to_string());
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            let last_error = match timeout(remaining, self.backend.execute(&ping)).await {
                Ok(Ok(_)) => return Ok(()),
                Ok(Err(e)) => e.to_string(),
                Err(_) => "PING timed out".to_string(),
            };

            if Instant::now() + self.poll_interval >= deadline {
                return Err(format!(
                    "not reachable within {:?}: {}",
                    self.startup_timeout, last_error
                ));
            }
            sleep(self.poll_interval).await;
        }
    }

    /// Stop the process; a no-op when not running
    pub async fn stop(&mut self) -> Result<()> {
        if self.state != NodeState::Running {
            return Ok(());
        }
        info!(node_id = self.id(), "Stopping node");
        self.state = NodeState::Stopped;
        self.backend.shutdown().await
    }

    /// Stop and start again with the last configuration
    pub async fn restart(&mut self) -> Result<()> {
        self.stop().await?;
        let config = self.spec.config.clone();
        self.start(config).await
    }

    /// Block until the node reports itself as a voting member
    pub async fn wait_for_voting(&mut self, wait: Duration) -> Result<()> {
        let deadline = Instant::now() + wait;
        loop {
            match self.raft_info().await {
                Ok(info) if info.is_voting => {
                    info!(node_id = self.id(), "Node is a voting member");
                    return Ok(());
                }
                Ok(_) => {}
                Err(e) => debug!(node_id = self.id(), error = %e, "Voting check failed"),
            }
            if Instant::now() >= deadline {
                return Err(HarnessError::VotingTimeout {
                    node_id: self.id(),
                    timeout: wait,
                });
            }
            sleep(self.poll_interval).await;
        }
    }

    /// Send one command straight to this node
    pub async fn execute(&mut self, command: &Command) -> Result<Reply> {
        if self.state != NodeState::Running {
            return Err(HarnessError::NodeNotRunning(self.id()));
        }
        self.backend.execute(command).await
    }

    /// Fetch and parse this node's `INFO raft` section
    pub async fn raft_info(&mut self) -> Result<RaftInfo> {
        let reply = self.execute(&Command::info_raft()).await?;
        let text = reply
            .as_str()
            .ok_or_else(|| HarnessError::UnexpectedReply(format!("INFO raft returned {}", reply)))?;
        RaftInfo::parse(text)
    }

    /// Stop the process for good after the cluster dropped this member
    pub(crate) async fn retire(&mut self) -> Result<()> {
        let result = self.stop().await;
        self.state = NodeState::Removed;
        result
    }
}
