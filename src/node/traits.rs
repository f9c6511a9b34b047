//! Backend abstraction for node processes

use std::path::PathBuf;

use async_trait::async_trait;

use crate::command::{Command, Reply};
use crate::config::NodeConfig;
use crate::error::Result;

use super::NodeId;

/// Everything a backend needs to launch one node
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LaunchSpec {
    pub node_id: NodeId,
    pub host: String,
    pub port: u16,
    /// Where the node keeps its on-disk state
    pub data_dir: PathBuf,
    /// Last configuration the node was started with
    pub config: NodeConfig,
}

impl LaunchSpec {
    /// `host:port` the node listens on
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// One node's process and its command channel
///
/// A backend owns at most one running process. Dropping it must stop that
/// process.
#[async_trait]
pub trait NodeBackend: Send {
    /// Spawn the process described by `spec`
    ///
    /// Returns once the process is spawned; the caller checks reachability.
    async fn launch(&mut self, spec: &LaunchSpec) -> Result<()>;

    /// Stop the process; a no-op if nothing is running
    async fn shutdown(&mut self) -> Result<()>;

    /// Send one command and return the raw reply
    async fn execute(&mut self, command: &Command) -> Result<Reply>;

    /// Whether the launched process has already exited
    fn has_exited(&mut self) -> bool;
}

/// Creates a backend for each node a cluster allocates
pub trait BackendFactory: Send + Sync {
    fn create(&self, node_id: NodeId) -> Box<dyn NodeBackend>;
}
