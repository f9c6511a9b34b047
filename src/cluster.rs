//! Cluster management
//!
//! A `Cluster` owns every node it creates: their processes, data directories
//! and ids. All membership changes go through it, and it is the only place a
//! node process is started or stopped.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tempfile::TempDir;
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info, warn};

use crate::command::{Command, Reply};
use crate::config::{HarnessConfig, NodeConfig};
use crate::consistency::{ConsistencyCheckpoint, ConsistencyWaiter};
use crate::error::{ErrorKind, HarnessError, Result};
use crate::executor::CommandExecutor;
use crate::node::process::ProcessFactory;
use crate::node::{BackendFactory, LaunchSpec, Node, NodeId};

/// Lifecycle of a cluster
///
/// `Stable` means a leader exists and unanimity was the last thing observed.
/// Any fault or membership change moves to `Degraded` until the next
/// successful unanimity wait.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClusterState {
    Uninitialized,
    Bringup,
    Stable,
    Degraded,
    Destroyed,
}

/// A set of nodes forming one Raft group
pub struct Cluster {
    id: String,
    config: HarnessConfig,
    node_config: NodeConfig,
    factory: Arc<dyn BackendFactory>,
    nodes: BTreeMap<NodeId, Node>,
    removed: BTreeSet<NodeId>,
    next_id: NodeId,
    leader: Option<NodeId>,
    state: ClusterState,
    executor: CommandExecutor,
    waiter: ConsistencyWaiter,
    work_dir: PathBuf,
    temp_dir: Option<TempDir>,
    rng: StdRng,
    seed: u64,
}

impl Cluster {
    /// Create an empty cluster whose nodes come from `factory`
    pub fn new(config: HarnessConfig, factory: Arc<dyn BackendFactory>) -> Result<Self> {
        config.validate()?;

        let mut os_rng = rand::rng();
        let seed = config.seed.unwrap_or_else(|| os_rng.random());
        let id = format!("{:08x}", os_rng.random::<u32>());

        let (work_dir, temp_dir) = match &config.server.work_dir {
            Some(dir) => (dir.join(format!("cluster-{}", id)), None),
            None => {
                let temp = tempfile::Builder::new().prefix("raft-sandbox-").tempdir()?;
                (temp.path().to_path_buf(), Some(temp))
            }
        };

        info!(cluster_id = %id, seed, work_dir = %work_dir.display(), "Created cluster");

        Ok(Cluster {
            id,
            executor: CommandExecutor::new(&config),
            waiter: ConsistencyWaiter::new(&config),
            config,
            node_config: NodeConfig::default(),
            factory,
            nodes: BTreeMap::new(),
            removed: BTreeSet::new(),
            next_id: 1,
            leader: None,
            state: ClusterState::Uninitialized,
            work_dir,
            temp_dir,
            rng: StdRng::seed_from_u64(seed),
            seed,
        })
    }

    /// Create an empty cluster of real server processes
    pub fn with_processes(config: HarnessConfig) -> Result<Self> {
        let factory = Arc::new(ProcessFactory::new(&config));
        Self::new(config, factory)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> ClusterState {
        self.state
    }

    /// Seed of the cluster's random choices, for replaying a run
    pub fn seed(&self) -> u64 {
        self.seed
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    /// Leader that answered the most recent command, if known
    pub fn leader_id(&self) -> Option<NodeId> {
        self.leader
    }

    /// Ids of all current members, running or not
    pub fn node_ids(&self) -> Vec<NodeId> {
        self.nodes.keys().copied().collect()
    }

    /// Ids of members whose process is running
    pub fn live_node_ids(&self) -> Vec<NodeId> {
        self.nodes
            .values()
            .filter(|n| n.is_running())
            .map(Node::id)
            .collect()
    }

    /// Ids that were removed and will never be handed out again
    pub fn removed_node_ids(&self) -> Vec<NodeId> {
        self.removed.iter().copied().collect()
    }

    pub fn node(&self, id: NodeId) -> Result<&Node> {
        self.nodes.get(&id).ok_or(HarnessError::NodeNotFound(id))
    }

    pub fn node_mut(&mut self, id: NodeId) -> Result<&mut Node> {
        self.nodes.get_mut(&id).ok_or(HarnessError::NodeNotFound(id))
    }

    pub fn nodes_mut(&mut self) -> impl Iterator<Item = &mut Node> {
        self.nodes.values_mut()
    }

    fn ensure_usable(&self) -> Result<()> {
        match self.state {
            ClusterState::Destroyed => Err(HarnessError::Destroyed),
            _ => Ok(()),
        }
    }

    fn ensure_created(&self) -> Result<()> {
        self.ensure_usable()?;
        match self.state {
            ClusterState::Uninitialized => Err(HarnessError::InvalidState(
                "cluster has not been created".to_string(),
            )),
            _ => Ok(()),
        }
    }

    /// Start `node_count` fresh nodes and form a cluster from them
    ///
    /// Succeeds once a leader reports `node_count` voting members and every
    /// node has applied the same index. On failure all nodes are torn down.
    pub async fn create(&mut self, node_count: usize, node_config: NodeConfig) -> Result<()> {
        self.ensure_usable()?;
        if self.state != ClusterState::Uninitialized {
            return Err(HarnessError::InvalidState(format!(
                "cannot create a cluster in state {:?}",
                self.state
            )));
        }
        if node_count == 0 {
            return Err(HarnessError::Config("a cluster needs at least one node".to_string()));
        }

        info!(cluster_id = %self.id, node_count, persist = node_config.persist, "Creating cluster");
        self.node_config = node_config;
        self.state = ClusterState::Bringup;

        let deadline = Instant::now() + self.config.bringup_timeout;
        match self.bring_up(node_count, deadline).await {
            Ok(checkpoint) => {
                info!(cluster_id = %self.id, leader = ?self.leader, index = checkpoint.index(), "Cluster is up");
                self.state = ClusterState::Stable;
                Ok(())
            }
            Err(e) => {
                error!(cluster_id = %self.id, error = %e, "Cluster bring-up failed");
                self.destroy().await;
                Err(match e.kind() {
                    ErrorKind::Startup => e,
                    _ => HarnessError::ClusterBringup(e.to_string()),
                })
            }
        }
    }

    async fn bring_up(&mut self, node_count: usize, deadline: Instant) -> Result<ConsistencyCheckpoint> {
        let mut ids = Vec::with_capacity(node_count);
        for _ in 0..node_count {
            let config = self.node_config.clone();
            ids.push(self.spawn_node(config).await?);
        }

        let first = ids[0];
        self.node_mut(first)?.execute(&Command::cluster_init()).await?;
        let leader = self.wait_for_leader(deadline).await?;
        debug!(leader, "Bootstrap node elected");

        for &id in &ids[1..] {
            let address = self.node(id)?.address();
            self.execute(&Command::node_add(id, &address)).await?;
            let remaining = deadline.saturating_duration_since(Instant::now());
            self.node_mut(id)?.wait_for_voting(remaining).await?;
        }

        let leader = self.wait_for_leader(deadline).await?;
        let voters = self.node_mut(leader)?.raft_info().await?.num_voting_nodes;
        if voters < node_count as u64 {
            return Err(HarnessError::ClusterBringup(format!(
                "leader {} reports {} voting members, expected {}",
                leader, voters, node_count
            )));
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        self.waiter.wait_for_unanimity(&mut self.nodes, remaining).await
    }

    /// Poll running nodes until one reports itself leader
    async fn wait_for_leader(&mut self, deadline: Instant) -> Result<NodeId> {
        loop {
            if let Some(leader) = self.find_leader().await {
                return Ok(leader);
            }
            if Instant::now() >= deadline {
                return Err(HarnessError::ClusterBringup(format!(
                    "no leader elected within {:?}",
                    self.config.bringup_timeout
                )));
            }
            sleep(self.config.unanimity_poll_interval).await;
        }
    }

    /// Ask every running node for its role and return the first leader found
    pub async fn find_leader(&mut self) -> Option<NodeId> {
        for node in self.nodes.values_mut().filter(|n| n.is_running()) {
            if let Ok(info) = node.raft_info().await {
                if info.is_leader() {
                    self.leader = Some(node.id());
                    return self.leader;
                }
            }
        }
        None
    }

    /// Allocate the next id and start a node for it; the id is burned on failure
    async fn spawn_node(&mut self, config: NodeConfig) -> Result<NodeId> {
        let id = self.next_id;
        self.next_id += 1;

        let port = u16::try_from(id)
            .ok()
            .and_then(|offset| self.config.server.base_port.checked_add(offset))
            .ok_or_else(|| HarnessError::Config(format!("no port left for node {}", id)))?;
        let spec = LaunchSpec {
            node_id: id,
            host: self.config.server.host.clone(),
            port,
            data_dir: self.work_dir.join(format!("node-{}", id)),
            config: config.clone(),
        };

        let mut node = Node::new(spec, self.factory.create(id), &self.config);
        node.start(config).await?;
        self.nodes.insert(id, node);
        Ok(id)
    }

    /// Run a replicated command through the leader
    pub async fn execute(&mut self, command: &Command) -> Result<Reply> {
        self.ensure_usable()?;
        self.executor
            .execute(&mut self.nodes, &mut self.leader, command)
            .await
    }

    /// Alias of [`Cluster::execute`]
    pub async fn raft_exec(&mut self, command: &Command) -> Result<Reply> {
        self.execute(command).await
    }

    /// Start a fresh node and ask the leader to add it as a member
    ///
    /// Returns the new node; it is not yet voting, see [`Node::wait_for_voting`].
    /// If the leader rejects the addition the new node is stopped and
    /// discarded, and its id is not reused.
    pub async fn add_node(&mut self, config: Option<NodeConfig>) -> Result<&mut Node> {
        self.ensure_created()?;
        let config = config.unwrap_or_else(|| self.node_config.clone());

        self.state = ClusterState::Degraded;
        let id = self.spawn_node(config).await?;
        let address = self.node(id)?.address();

        if let Err(e) = self.execute(&Command::node_add(id, &address)).await {
            warn!(node_id = id, error = %e, "Node addition failed, discarding node");
            if let Some(mut node) = self.nodes.remove(&id) {
                let _ = node.retire().await;
            }
            self.removed.insert(id);
            return Err(membership_error(id, e));
        }

        info!(node_id = id, %address, "Added node");
        self.node_mut(id)
    }

    /// Ask the leader to remove `id`, then stop and discard that node
    ///
    /// A rejection leaves the node untouched and surfaces as
    /// [`HarnessError::MembershipRejected`].
    pub async fn remove_node(&mut self, id: NodeId) -> Result<()> {
        self.ensure_created()?;
        if !self.nodes.contains_key(&id) {
            return Err(HarnessError::NodeNotFound(id));
        }

        self.state = ClusterState::Degraded;
        self.execute(&Command::node_remove(id))
            .await
            .map_err(|e| membership_error(id, e))?;

        if self.leader == Some(id) {
            self.leader = None;
        }
        let mut node = self.nodes.remove(&id).ok_or(HarnessError::NodeNotFound(id))?;
        self.removed.insert(id);
        info!(node_id = id, "Removed node");
        node.retire().await
    }

    /// Restart one node with its last configuration
    pub async fn restart_node(&mut self, id: NodeId) -> Result<()> {
        self.ensure_created()?;
        self.node(id)?;
        self.state = ClusterState::Degraded;
        if self.leader == Some(id) {
            self.leader = None;
        }
        self.node_mut(id)?.restart().await
    }

    /// Block until node `id` is a voting member
    pub async fn wait_for_voting(&mut self, id: NodeId, timeout: Duration) -> Result<()> {
        self.ensure_usable()?;
        self.node_mut(id)?.wait_for_voting(timeout).await
    }

    /// Uniformly chosen id among running nodes
    pub fn random_node_id(&mut self) -> Result<NodeId> {
        let live = self.live_node_ids();
        if live.is_empty() {
            return Err(HarnessError::NoLiveNodes);
        }
        Ok(live[self.rng.random_range(0..live.len())])
    }

    /// Wait for unanimity with the configured default timeout
    pub async fn wait_for_unanimity(&mut self) -> Result<ConsistencyCheckpoint> {
        let timeout = self.config.unanimity_timeout;
        self.wait_for_unanimity_within(timeout).await
    }

    /// Block until all running nodes have applied the same index
    pub async fn wait_for_unanimity_within(&mut self, timeout: Duration) -> Result<ConsistencyCheckpoint> {
        self.ensure_usable()?;
        if !self.nodes.values().any(Node::is_running) {
            return Err(HarnessError::NoLiveNodes);
        }
        let checkpoint = self.waiter.wait_for_unanimity(&mut self.nodes, timeout).await?;
        if self.state == ClusterState::Degraded {
            self.state = ClusterState::Stable;
        }
        Ok(checkpoint)
    }

    /// Stop every node and release the work directory; safe to call twice
    pub async fn destroy(&mut self) {
        if self.state == ClusterState::Destroyed {
            return;
        }
        info!(cluster_id = %self.id, nodes = self.nodes.len(), "Destroying cluster");
        for node in self.nodes.values_mut() {
            if let Err(e) = node.stop().await {
                warn!(node_id = node.id(), error = %e, "Failed to stop node cleanly");
            }
        }
        self.nodes.clear();
        self.leader = None;
        self.temp_dir = None;
        self.state = ClusterState::Destroyed;
    }
}

impl Drop for Cluster {
    fn drop(&mut self) {
        if self.state != ClusterState::Destroyed && !self.nodes.is_empty() {
            // Backends kill their processes when dropped
            warn!(cluster_id = %self.id, "Cluster dropped without destroy(), killing nodes");
            self.nodes.clear();
        }
    }
}

/// Error replies to a membership change are rejections, not harness failures
fn membership_error(node_id: NodeId, err: HarnessError) -> HarnessError {
    match err {
        HarnessError::Response { code, message, .. } => HarnessError::MembershipRejected {
            node_id,
            reason: format!("{} {}", code, message).trim().to_string(),
        },
        other => other,
    }
}
