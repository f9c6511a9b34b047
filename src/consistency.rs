//! Waiting for all live nodes to agree on the applied log position

use std::collections::BTreeMap;
use std::time::Duration;

use tokio::time::{sleep, Instant};
use tracing::{debug, info};

use crate::config::HarnessConfig;
use crate::error::{HarnessError, Result};
use crate::node::{Node, NodeId};

/// Applied log position of every live node at the moment they agreed
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConsistencyCheckpoint {
    pub positions: BTreeMap<NodeId, u64>,
}

impl ConsistencyCheckpoint {
    /// The agreed index (0 for an empty cluster)
    pub fn index(&self) -> u64 {
        self.positions.values().next().copied().unwrap_or(0)
    }
}

/// Polls applied indexes until they match
#[derive(Clone, Debug)]
pub struct ConsistencyWaiter {
    poll_interval: Duration,
}

impl ConsistencyWaiter {
    pub fn new(config: &HarnessConfig) -> Self {
        ConsistencyWaiter {
            poll_interval: config.unanimity_poll_interval,
        }
    }

    /// Block until every running node reports the same last-applied index
    ///
    /// The first sample is taken immediately, so a quiescent cluster returns
    /// without sleeping. A node that fails to answer counts as disagreeing.
    pub async fn wait_for_unanimity(
        &self,
        nodes: &mut BTreeMap<NodeId, Node>,
        timeout: Duration,
    ) -> Result<ConsistencyCheckpoint> {
        let deadline = Instant::now() + timeout;
        let mut polls = 0u64;

        loop {
            polls += 1;
            let positions = sample(nodes).await;

            if let Some(checkpoint) = unanimous(&positions) {
                info!(index = checkpoint.index(), nodes = checkpoint.positions.len(), polls, "Cluster reached unanimity");
                return Ok(checkpoint);
            }
            debug!(?positions, "Waiting for unanimity");

            if Instant::now() + self.poll_interval > deadline {
                return Err(HarnessError::Divergence { timeout, positions });
            }
            sleep(self.poll_interval).await;
        }
    }
}

async fn sample(nodes: &mut BTreeMap<NodeId, Node>) -> BTreeMap<NodeId, Option<u64>> {
    let mut positions = BTreeMap::new();
    for (id, node) in nodes.iter_mut().filter(|(_, n)| n.is_running()) {
        let applied = node.raft_info().await.ok().map(|info| info.last_applied_index);
        positions.insert(*id, applied);
    }
    positions
}

fn unanimous(positions: &BTreeMap<NodeId, Option<u64>>) -> Option<ConsistencyCheckpoint> {
    let mut agreed: Option<u64> = None;
    let mut settled = BTreeMap::new();
    for (id, position) in positions {
        let position = (*position)?;
        match agreed {
            Some(index) if index != position => return None,
            _ => agreed = Some(position),
        }
        settled.insert(*id, position);
    }
    Some(ConsistencyCheckpoint { positions: settled })
}
