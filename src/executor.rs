//! Leader-resolving command execution
//!
//! Commands go to the node believed to be leader. Redirects are followed
//! (bounded by `max_redirects`), while "no leader" conditions are retried with
//! exponential backoff until `leader_timeout` elapses.

use std::collections::BTreeMap;
use std::time::Duration;

use tokio::time::{sleep, Instant};
use tracing::debug;

use crate::command::{leader_hint, Command, Reply};
use crate::config::HarnessConfig;
use crate::error::{classify, ErrorKind, HarnessError, Result};
use crate::node::{Node, NodeId};

/// Retry policy for leader resolution
#[derive(Clone, Debug)]
pub struct CommandExecutor {
    leader_timeout: Duration,
    max_redirects: usize,
    backoff_initial: Duration,
    backoff_max: Duration,
    command_prefix: Option<String>,
}

impl CommandExecutor {
    pub fn new(config: &HarnessConfig) -> Self {
        CommandExecutor {
            leader_timeout: config.leader_timeout,
            max_redirects: config.max_redirects,
            backoff_initial: config.retry_backoff_initial,
            backoff_max: config.retry_backoff_max,
            command_prefix: config.command_prefix.clone(),
        }
    }

    /// Run `command` on the leader and return its first successful reply
    ///
    /// `leader` is the caller's cached leader id; it is used as the first
    /// target and updated to whichever node answered.
    pub async fn execute(
        &self,
        nodes: &mut BTreeMap<NodeId, Node>,
        leader: &mut Option<NodeId>,
        command: &Command,
    ) -> Result<Reply> {
        let command = match &self.command_prefix {
            Some(prefix) if !command.is_control() => command.wrapped(prefix),
            _ => command.clone(),
        };

        let started = Instant::now();
        let deadline = started + self.leader_timeout;
        let mut backoff = self.backoff_initial;
        let mut redirects = 0;
        let mut attempts = 0;
        let mut target = *leader;

        loop {
            let node_id = match target
                .filter(|id| is_live(nodes, *id))
                .or_else(|| first_live(nodes))
            {
                Some(id) => id,
                None => return Err(HarnessError::NoLiveNodes),
            };
            let node = nodes
                .get_mut(&node_id)
                .ok_or(HarnessError::NodeNotFound(node_id))?;

            attempts += 1;
            let err = match node.execute(&command).await {
                Ok(reply) => {
                    *leader = Some(node_id);
                    return Ok(reply);
                }
                Err(e) if classify(&e) == ErrorKind::TransientElection => e,
                Err(e) => return Err(e),
            };

            debug!(node_id, attempt = attempts, error = %err, command = %command, "Retrying command");
            let last_error = err.to_string();
            *leader = None;

            // A hint naming a stopped or unknown node means no usable leader yet
            let redirect = match &err {
                HarnessError::Response { code, message, .. } => leader_hint(code, message)
                    .and_then(|addr| node_by_address(nodes, addr))
                    .filter(|hint| *hint != node_id && is_live(nodes, *hint)),
                _ => None,
            };

            match redirect {
                Some(hint) => {
                    redirects += 1;
                    if redirects > self.max_redirects {
                        return Err(no_leader(attempts, started, last_error));
                    }
                    target = Some(hint);
                    // Only the first hop of a call skips the backoff
                    if redirects == 1 && Instant::now() < deadline {
                        continue;
                    }
                }
                None => target = next_live(nodes, node_id),
            }

            if Instant::now() + backoff > deadline {
                return Err(no_leader(attempts, started, last_error));
            }
            sleep(backoff).await;
            backoff = (backoff * 2).min(self.backoff_max);
        }
    }
}

fn no_leader(attempts: usize, started: Instant, last_error: String) -> HarnessError {
    HarnessError::NoLeader {
        attempts,
        elapsed: started.elapsed(),
        last_error,
    }
}

fn is_live(nodes: &BTreeMap<NodeId, Node>, id: NodeId) -> bool {
    nodes.get(&id).is_some_and(Node::is_running)
}

fn first_live(nodes: &BTreeMap<NodeId, Node>) -> Option<NodeId> {
    nodes.values().find(|n| n.is_running()).map(Node::id)
}

/// Next running node after `after`, wrapping around
fn next_live(nodes: &BTreeMap<NodeId, Node>, after: NodeId) -> Option<NodeId> {
    nodes
        .range(after + 1..)
        .chain(nodes.range(..=after))
        .find(|(_, n)| n.is_running())
        .map(|(id, _)| *id)
}

/// Map a `host:port` hint to a node, falling back to a port-only match
/// since nodes may advertise a different host name than the one we dialed
fn node_by_address(nodes: &BTreeMap<NodeId, Node>, addr: &str) -> Option<NodeId> {
    if let Some(node) = nodes.values().find(|n| n.address() == addr) {
        return Some(node.id());
    }
    let port: u16 = addr.rsplit_once(':')?.1.parse().ok()?;
    nodes.values().find(|n| n.port() == port).map(Node::id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NodeConfig;
    use crate::node::{BackendFactory, LaunchSpec, NodeBackend};
    use crate::testing::{fast_config, SimStore};
    use std::path::PathBuf;

    /// Three running nodes formed into a cluster led by node 1
    async fn formed(store: &SimStore, config: &HarnessConfig) -> BTreeMap<NodeId, Node> {
        let mut nodes = BTreeMap::new();
        for id in 1..=3u64 {
            let spec = LaunchSpec {
                node_id: id,
                host: "127.0.0.1".to_string(),
                port: 5000 + id as u16,
                data_dir: PathBuf::from(format!("node-{}", id)),
                config: NodeConfig::default(),
            };
            let mut node = Node::new(spec, store.create(id), config);
            node.start(NodeConfig::default()).await.unwrap();
            nodes.insert(id, node);
        }

        let executor = CommandExecutor::new(config);
        let mut leader = None;
        nodes.get_mut(&1).unwrap().execute(&Command::cluster_init()).await.unwrap();
        for id in 2..=3 {
            let address = nodes[&id].address();
            executor
                .execute(&mut nodes, &mut leader, &Command::node_add(id, &address))
                .await
                .unwrap();
            nodes.get_mut(&id).unwrap().wait_for_voting(Duration::from_secs(1)).await.unwrap();
        }
        nodes
    }

    #[tokio::test]
    async fn test_follows_leader_redirect() {
        let store = SimStore::new();
        let config = fast_config();
        let mut nodes = formed(&store, &config).await;
        let executor = CommandExecutor::new(&config);

        let mut leader = Some(3);
        let reply = executor
            .execute(&mut nodes, &mut leader, &Command::set("k", "v"))
            .await
            .unwrap();
        assert_eq!(reply, Reply::ok());
        assert_eq!(leader, Some(1));
    }

    /// Answers PING and points every other request at node 1
    struct StaleLeaderHint;

    #[async_trait::async_trait]
    impl NodeBackend for StaleLeaderHint {
        async fn launch(&mut self, _spec: &LaunchSpec) -> Result<()> {
            Ok(())
        }

        async fn shutdown(&mut self) -> Result<()> {
            Ok(())
        }

        async fn execute(&mut self, command: &Command) -> Result<Reply> {
            if command.name() == "PING" {
                return Ok(Reply::Status("PONG".to_string()));
            }
            Err(HarnessError::Response {
                node_id: 0,
                code: "LEADERIS".to_string(),
                message: "127.0.0.1:5001".to_string(),
            })
        }

        fn has_exited(&mut self) -> bool {
            false
        }
    }

    #[tokio::test]
    async fn test_hint_to_stopped_node_waits_out_leader_timeout() {
        let config = fast_config().with_leader_timeout(Duration::from_millis(300));
        let mut nodes = BTreeMap::new();
        for id in 1..=3u64 {
            let spec = LaunchSpec {
                node_id: id,
                host: "127.0.0.1".to_string(),
                port: 5000 + id as u16,
                data_dir: PathBuf::from(format!("node-{}", id)),
                config: NodeConfig::default(),
            };
            let mut node = Node::new(spec, Box::new(StaleLeaderHint), &config);
            node.start(NodeConfig::default()).await.unwrap();
            nodes.insert(id, node);
        }
        nodes.get_mut(&1).unwrap().stop().await.unwrap();

        let started = Instant::now();
        let mut leader = None;
        let err = CommandExecutor::new(&config)
            .execute(&mut nodes, &mut leader, &Command::set("k", "v"))
            .await
            .unwrap_err();

        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(250), "gave up after {:?}", elapsed);
        assert!(elapsed < Duration::from_secs(2));
        match err {
            HarnessError::NoLeader { last_error, .. } => assert!(last_error.contains("LEADERIS")),
            other => panic!("unexpected error: {}", other),
        }
    }

    #[tokio::test]
    async fn test_stopped_cached_leader_is_skipped() {
        let store = SimStore::new();
        let config = fast_config();
        let mut nodes = formed(&store, &config).await;
        let executor = CommandExecutor::new(&config);

        nodes.get_mut(&1).unwrap().stop().await.unwrap();
        let mut leader = Some(1);
        let reply = executor
            .execute(&mut nodes, &mut leader, &Command::incrby("c", 2))
            .await
            .unwrap();
        assert_eq!(reply, Reply::Int(2));
        assert_eq!(leader, store.leader());
        assert_ne!(leader, Some(1));
    }

    #[tokio::test]
    async fn test_error_reply_is_not_retried() {
        let store = SimStore::new();
        let config = fast_config();
        let mut nodes = formed(&store, &config).await;
        let executor = CommandExecutor::new(&config);

        let mut leader = None;
        let err = executor
            .execute(&mut nodes, &mut leader, &Command::new("BOGUS").arg("x"))
            .await
            .unwrap_err();
        assert!(matches!(err, HarnessError::Response { ref code, .. } if code == "ERR"));
    }

    #[tokio::test]
    async fn test_lost_quorum_gives_up_after_leader_timeout() {
        let store = SimStore::new();
        let config = fast_config().with_leader_timeout(Duration::from_millis(200));
        let mut nodes = formed(&store, &config).await;
        let executor = CommandExecutor::new(&config);

        for id in [2, 3] {
            nodes.get_mut(&id).unwrap().stop().await.unwrap();
        }
        let started = Instant::now();
        let mut leader = Some(1);
        let err = executor
            .execute(&mut nodes, &mut leader, &Command::set("k", "v"))
            .await
            .unwrap_err();
        assert!(matches!(err, HarnessError::NoLeader { .. }));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_no_live_nodes() {
        let store = SimStore::new();
        let config = fast_config();
        let mut nodes = formed(&store, &config).await;
        for node in nodes.values_mut() {
            node.stop().await.unwrap();
        }
        let mut leader = None;
        let err = CommandExecutor::new(&config)
            .execute(&mut nodes, &mut leader, &Command::ping())
            .await
            .unwrap_err();
        assert!(matches!(err, HarnessError::NoLiveNodes));
    }

    #[tokio::test]
    async fn test_prefix_wraps_data_commands_only() {
        let store = SimStore::new();
        let config = fast_config().with_command_prefix("RAFT");
        let mut nodes = formed(&store, &config).await;
        let executor = CommandExecutor::new(&config);

        let mut leader = None;
        executor
            .execute(&mut nodes, &mut leader, &Command::set("k", "v"))
            .await
            .unwrap();
        let reply = executor
            .execute(&mut nodes, &mut leader, &Command::get("k"))
            .await
            .unwrap();
        assert_eq!(reply.as_str(), Some("v"));
    }

    #[tokio::test]
    async fn test_next_live_wraps_around() {
        let store = SimStore::new();
        let config = fast_config();
        let mut nodes = formed(&store, &config).await;
        nodes.get_mut(&2).unwrap().stop().await.unwrap();

        assert_eq!(next_live(&nodes, 1), Some(3));
        assert_eq!(next_live(&nodes, 3), Some(1));
        assert_eq!(node_by_address(&nodes, "localhost:5003"), Some(3));
        assert_eq!(next_live(&BTreeMap::new(), 1), None);
    }
}
