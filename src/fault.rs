//! Fault events, their generators, and the injector that applies them

use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use tracing::{error, info};

use crate::cluster::Cluster;
use crate::config::HarnessConfig;
use crate::error::{HarnessError, Result};
use crate::node::NodeId;

/// One disruption applied to a running cluster
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub enum FaultEvent {
    /// Stop and start a node with its last configuration
    Restart(NodeId),
    /// Remove a member and discard its node
    RemoveNode(NodeId),
    /// Start a fresh node and add it as a voting member
    AddNode,
}

impl fmt::Display for FaultEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FaultEvent::Restart(id) => write!(f, "restart({})", id),
            FaultEvent::RemoveNode(id) => write!(f, "remove({})", id),
            FaultEvent::AddNode => write!(f, "add()"),
        }
    }
}

/// Source of fault events
///
/// Each call yields the events of one fault cycle, applied in order. `live`
/// lists the ids of running nodes at that moment.
pub trait FaultGenerator: Send {
    fn generate(&mut self, live: &[NodeId]) -> Vec<FaultEvent>;
}

impl<F> FaultGenerator for F
where
    F: FnMut(&[NodeId]) -> Vec<FaultEvent> + Send,
{
    fn generate(&mut self, live: &[NodeId]) -> Vec<FaultEvent> {
        self(live)
    }
}

/// Which faults a [`RandomFaultGenerator`] produces
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FaultMode {
    /// Restart one random node
    Restarts,
    /// Remove one random node, then add a fresh one
    MembershipChurn,
    /// Either of the above with equal probability
    Mixed,
}

impl FromStr for FaultMode {
    type Err = HarnessError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "restart" | "restarts" => Ok(FaultMode::Restarts),
            "churn" | "membership" => Ok(FaultMode::MembershipChurn),
            "mixed" => Ok(FaultMode::Mixed),
            other => Err(HarnessError::Config(format!("unknown fault mode: {}", other))),
        }
    }
}

/// Seeded random faults; the same seed and cluster history give the same events
pub struct RandomFaultGenerator {
    rng: StdRng,
    mode: FaultMode,
}

impl RandomFaultGenerator {
    pub fn new(mode: FaultMode, seed: u64) -> Self {
        RandomFaultGenerator {
            rng: StdRng::seed_from_u64(seed),
            mode,
        }
    }

    fn pick(&mut self, live: &[NodeId]) -> NodeId {
        live[self.rng.random_range(0..live.len())]
    }
}

impl FaultGenerator for RandomFaultGenerator {
    fn generate(&mut self, live: &[NodeId]) -> Vec<FaultEvent> {
        if live.is_empty() {
            return Vec::new();
        }
        let churn = match self.mode {
            FaultMode::Restarts => false,
            FaultMode::MembershipChurn => true,
            FaultMode::Mixed => self.rng.random_bool(0.5),
        };
        let target = self.pick(live);
        if churn {
            vec![FaultEvent::RemoveNode(target), FaultEvent::AddNode]
        } else {
            vec![FaultEvent::Restart(target)]
        }
    }
}

/// Replays a fixed list of fault cycles, then produces nothing
pub struct ScriptedFaultGenerator {
    script: VecDeque<Vec<FaultEvent>>,
}

impl ScriptedFaultGenerator {
    pub fn new(script: impl IntoIterator<Item = Vec<FaultEvent>>) -> Self {
        ScriptedFaultGenerator {
            script: script.into_iter().collect(),
        }
    }
}

impl FaultGenerator for ScriptedFaultGenerator {
    fn generate(&mut self, _live: &[NodeId]) -> Vec<FaultEvent> {
        self.script.pop_front().unwrap_or_default()
    }
}

/// Applies fault events to a cluster
#[derive(Clone, Debug)]
pub struct FaultInjector {
    voting_timeout: Duration,
}

impl FaultInjector {
    pub fn new(config: &HarnessConfig) -> Self {
        FaultInjector {
            voting_timeout: config.voting_timeout,
        }
    }

    pub fn with_voting_timeout(mut self, timeout: Duration) -> Self {
        self.voting_timeout = timeout;
        self
    }

    /// Apply one event
    ///
    /// A rejected removal or addition comes back as
    /// [`HarnessError::MembershipRejected`] for the caller to skip. An added
    /// node that never becomes a voter is a convergence failure.
    pub async fn apply(&self, cluster: &mut Cluster, event: &FaultEvent) -> Result<()> {
        info!(%event, "Injecting fault");
        match event {
            FaultEvent::Restart(id) => cluster.restart_node(*id).await,
            FaultEvent::RemoveNode(id) => cluster.remove_node(*id).await,
            FaultEvent::AddNode => {
                let id = cluster.add_node(None).await?.id();
                cluster
                    .wait_for_voting(id, self.voting_timeout)
                    .await
                    .inspect_err(|e| error!(node_id = id, error = %e, "Added node never became a voter"))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_generator_is_reproducible() {
        let live = [1, 2, 3, 4, 5];
        let mut a = RandomFaultGenerator::new(FaultMode::Mixed, 42);
        let mut b = RandomFaultGenerator::new(FaultMode::Mixed, 42);
        let run_a: Vec<_> = (0..20).map(|_| a.generate(&live)).collect();
        let run_b: Vec<_> = (0..20).map(|_| b.generate(&live)).collect();
        assert_eq!(run_a, run_b);
    }

    #[test]
    fn test_restart_mode_targets_live_nodes() {
        let live = [2, 4, 7];
        let mut generator = RandomFaultGenerator::new(FaultMode::Restarts, 7);
        for _ in 0..50 {
            match generator.generate(&live).as_slice() {
                [FaultEvent::Restart(id)] => assert!(live.contains(id)),
                other => panic!("unexpected events: {:?}", other),
            }
        }
    }

    #[test]
    fn test_churn_mode_removes_then_adds() {
        let mut generator = RandomFaultGenerator::new(FaultMode::MembershipChurn, 1);
        let events = generator.generate(&[3]);
        assert_eq!(events, vec![FaultEvent::RemoveNode(3), FaultEvent::AddNode]);
    }

    #[test]
    fn test_no_live_nodes_no_faults() {
        let mut generator = RandomFaultGenerator::new(FaultMode::Restarts, 1);
        assert!(generator.generate(&[]).is_empty());
    }

    #[test]
    fn test_scripted_generator() {
        let mut generator = ScriptedFaultGenerator::new(vec![
            vec![FaultEvent::Restart(1)],
            vec![FaultEvent::RemoveNode(2), FaultEvent::AddNode],
        ]);
        assert_eq!(generator.generate(&[1, 2]), vec![FaultEvent::Restart(1)]);
        assert_eq!(generator.generate(&[1, 2]).len(), 2);
        assert!(generator.generate(&[1, 2]).is_empty());
    }

    #[test]
    fn test_closure_generator() {
        let mut calls = 0;
        let mut generator = |live: &[NodeId]| {
            calls += 1;
            vec![FaultEvent::Restart(live[0])]
        };
        assert_eq!(FaultGenerator::generate(&mut generator, &[9]), vec![FaultEvent::Restart(9)]);
        assert_eq!(calls, 1);
    }

    #[test]
    fn test_fault_mode_from_str() {
        assert_eq!("restart".parse::<FaultMode>().unwrap(), FaultMode::Restarts);
        assert_eq!("CHURN".parse::<FaultMode>().unwrap(), FaultMode::MembershipChurn);
        assert!("chaos".parse::<FaultMode>().is_err());
    }
}
