//! Cluster lifecycle tests against the in-process simulated store
//!
//! Cover bring-up, membership changes, restarts, expiration and the
//! unanimity check without needing server binaries.

use std::time::{Duration, Instant};

use raft_sandbox::testing::{fast_config, SimStore};
use raft_sandbox::{Cluster, ClusterState, Command, ErrorKind, HarnessConfig, HarnessError, NodeConfig};

async fn sim_cluster(nodes: usize, node_config: NodeConfig) -> (SimStore, Cluster) {
    sim_cluster_with(fast_config(), nodes, node_config).await
}

async fn sim_cluster_with(config: HarnessConfig, nodes: usize, node_config: NodeConfig) -> (SimStore, Cluster) {
    let store = SimStore::new();
    let mut cluster = Cluster::new(config, store.factory()).unwrap();
    cluster.create(nodes, node_config).await.unwrap();
    (store, cluster)
}

/// Read `key` from one node's local state, bypassing the leader
async fn local_get(cluster: &mut Cluster, id: u64, key: &str) -> Option<String> {
    let reply = cluster
        .node_mut(id)
        .unwrap()
        .execute(&Command::debug_exec(Command::get(key)))
        .await
        .unwrap();
    reply.as_str().map(str::to_string)
}

#[tokio::test]
async fn test_create_three_node_cluster() {
    let (store, mut cluster) = sim_cluster(3, NodeConfig::persistent()).await;

    assert_eq!(cluster.state(), ClusterState::Stable);
    assert_eq!(cluster.node_ids(), vec![1, 2, 3]);
    assert_eq!(store.members().len(), 3);
    assert!(store.members().values().all(|voting| *voting));
    assert_eq!(cluster.find_leader().await, Some(1));

    cluster.destroy().await;
}

#[tokio::test]
async fn test_execute_reads_own_writes() {
    let (_store, mut cluster) = sim_cluster(3, NodeConfig::default()).await;

    assert_eq!(cluster.execute(&Command::set("x", 41)).await.unwrap(), raft_sandbox::Reply::ok());
    assert_eq!(cluster.execute(&Command::incrby("x", 1)).await.unwrap().as_int(), Some(42));
    assert_eq!(cluster.raft_exec(&Command::get("x")).await.unwrap().as_int(), Some(42));
    assert!(cluster.execute(&Command::get("missing")).await.unwrap().is_nil());

    cluster.destroy().await;
}

#[tokio::test]
async fn test_unanimity_is_idempotent() {
    let (store, mut cluster) = sim_cluster(3, NodeConfig::default()).await;
    for i in 0..10 {
        cluster.execute(&Command::set("k", i)).await.unwrap();
    }

    let first = cluster.wait_for_unanimity().await.unwrap();
    let second = cluster.wait_for_unanimity().await.unwrap();
    assert_eq!(first, second);
    assert_eq!(first.index(), store.log_len());
    assert_eq!(first.positions.len(), 3);

    cluster.destroy().await;
}

#[tokio::test]
async fn test_frozen_follower_diverges() {
    let (store, mut cluster) = sim_cluster(3, NodeConfig::default()).await;
    store.freeze(3);
    for _ in 0..5 {
        cluster.execute(&Command::incrby("c", 1)).await.unwrap();
    }

    let err = cluster
        .wait_for_unanimity_within(Duration::from_millis(100))
        .await
        .unwrap_err();
    match &err {
        HarnessError::Divergence { positions, .. } => {
            assert_eq!(positions.len(), 3);
            assert!(positions[&3].unwrap() < positions[&1].unwrap());
        }
        other => panic!("expected divergence, got {}", other),
    }
    assert_eq!(err.kind(), ErrorKind::Convergence);

    store.thaw(3);
    cluster.wait_for_unanimity().await.unwrap();
    cluster.destroy().await;
}

#[tokio::test]
async fn test_startup_timeout_tears_down_cluster() {
    let store = SimStore::new();
    store.make_unresponsive(2);
    let config = fast_config().with_startup_timeout(Duration::from_millis(200));
    let mut cluster = Cluster::new(config, store.factory()).unwrap();

    let started = Instant::now();
    let err = cluster.create(3, NodeConfig::default()).await.unwrap_err();
    assert!(matches!(err, HarnessError::Startup { node_id: 2, .. }));
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(cluster.state(), ClusterState::Destroyed);
    assert!(cluster.live_node_ids().is_empty());
}

#[tokio::test]
async fn test_bringup_fails_when_a_node_never_votes() {
    let store = SimStore::new();
    store.freeze(2);
    let config = fast_config().with_bringup_timeout(Duration::from_millis(300));
    let mut cluster = Cluster::new(config, store.factory()).unwrap();

    let started = Instant::now();
    let err = cluster.create(3, NodeConfig::default()).await.unwrap_err();
    let elapsed = started.elapsed();

    assert!(matches!(err, HarnessError::ClusterBringup(_)), "unexpected error: {}", err);
    assert_eq!(err.kind(), ErrorKind::Startup);
    assert!(elapsed >= Duration::from_millis(250));
    assert!(elapsed < Duration::from_secs(2));
    assert_eq!(cluster.state(), ClusterState::Destroyed);
}

#[tokio::test]
async fn test_create_twice_is_rejected() {
    let (_store, mut cluster) = sim_cluster(1, NodeConfig::default()).await;
    assert!(matches!(
        cluster.create(1, NodeConfig::default()).await,
        Err(HarnessError::InvalidState(_))
    ));
    cluster.destroy().await;
}

#[tokio::test]
async fn test_add_and_remove_never_reuse_ids() {
    let (store, mut cluster) = sim_cluster(3, NodeConfig::default()).await;

    cluster.remove_node(3).await.unwrap();
    assert_eq!(cluster.node_ids(), vec![1, 2]);
    assert_eq!(cluster.removed_node_ids(), vec![3]);
    assert_eq!(cluster.state(), ClusterState::Degraded);

    let added = cluster.add_node(None).await.unwrap().id();
    assert_eq!(added, 4);
    cluster.wait_for_voting(added, Duration::from_secs(2)).await.unwrap();
    assert_eq!(store.members().get(&4), Some(&true));
    assert!(!store.members().contains_key(&3));

    cluster.wait_for_unanimity().await.unwrap();
    assert_eq!(cluster.state(), ClusterState::Stable);
    assert!(matches!(cluster.restart_node(3).await, Err(HarnessError::NodeNotFound(3))));

    cluster.destroy().await;
}

#[tokio::test]
async fn test_removing_leader_is_rejected() {
    let (_store, mut cluster) = sim_cluster(3, NodeConfig::default()).await;

    let err = cluster.remove_node(1).await.unwrap_err();
    assert!(matches!(err, HarnessError::MembershipRejected { node_id: 1, .. }));
    assert!(err.is_transient());
    assert_eq!(cluster.node_ids(), vec![1, 2, 3]);

    cluster.destroy().await;
}

#[tokio::test]
async fn test_failed_addition_burns_the_id() {
    let (store, mut cluster) = sim_cluster(3, NodeConfig::default()).await;
    store.make_unresponsive(4);

    let err = cluster.add_node(None).await.err().unwrap();
    assert!(matches!(err, HarnessError::Startup { node_id: 4, .. }));

    let id = cluster.add_node(None).await.unwrap().id();
    assert_eq!(id, 5);

    cluster.destroy().await;
}

#[tokio::test]
async fn test_restart_without_persistence_resyncs() {
    let (store, mut cluster) = sim_cluster(3, NodeConfig::default()).await;
    cluster.execute(&Command::set("x", "1")).await.unwrap();

    cluster.restart_node(2).await.unwrap();
    let checkpoint = cluster.wait_for_unanimity().await.unwrap();
    assert_eq!(checkpoint.index(), store.log_len());
    assert_eq!(local_get(&mut cluster, 2, "x").await.as_deref(), Some("1"));

    cluster.destroy().await;
}

#[tokio::test]
async fn test_leader_restart_forces_election() {
    let (store, mut cluster) = sim_cluster(3, NodeConfig::persistent()).await;
    cluster.execute(&Command::incrby("c", 1)).await.unwrap();

    cluster.restart_node(1).await.unwrap();
    assert_eq!(cluster.leader_id(), None);
    cluster.execute(&Command::incrby("c", 1)).await.unwrap();

    assert_eq!(store.term(), 2);
    assert_eq!(cluster.leader_id(), store.leader());
    assert_eq!(cluster.execute(&Command::get("c")).await.unwrap().as_int(), Some(2));

    cluster.destroy().await;
}

#[tokio::test]
async fn test_lost_majority_reports_no_leader() {
    let config = fast_config().with_leader_timeout(Duration::from_millis(300));
    let (_store, mut cluster) = sim_cluster_with(config, 3, NodeConfig::default()).await;

    cluster.node_mut(2).unwrap().stop().await.unwrap();
    cluster.node_mut(3).unwrap().stop().await.unwrap();
    assert_eq!(cluster.live_node_ids(), vec![1]);

    let err = cluster.execute(&Command::set("k", "v")).await.unwrap_err();
    assert!(matches!(err, HarnessError::NoLeader { .. }));

    cluster.restart_node(2).await.unwrap();
    cluster.execute(&Command::set("k", "v")).await.unwrap();

    cluster.destroy().await;
}

#[tokio::test]
async fn test_forced_expiration() {
    let (_store, mut cluster) = sim_cluster(3, NodeConfig::default()).await;
    for (key, value) in [("x", 1), ("y", 2)] {
        cluster.execute(&Command::set(key, value)).await.unwrap();
        assert_eq!(cluster.execute(&Command::expire(key, 1000)).await.unwrap().as_int(), Some(1));
    }

    cluster.execute(&Command::debug_expire(&["x", "y"], 1)).await.unwrap();
    cluster.wait_for_unanimity().await.unwrap();
    for id in cluster.node_ids() {
        assert_eq!(local_get(&mut cluster, id, "x").await.as_deref(), Some("1"));
        assert_eq!(local_get(&mut cluster, id, "y").await.as_deref(), Some("2"));
    }

    cluster.execute(&Command::debug_expire(&["x", "y"], 0)).await.unwrap();
    cluster.wait_for_unanimity().await.unwrap();
    for id in cluster.node_ids() {
        assert_eq!(local_get(&mut cluster, id, "x").await, None);
        assert_eq!(local_get(&mut cluster, id, "y").await, None);
    }

    cluster.destroy().await;
}

#[tokio::test]
async fn test_random_node_id_picks_live_nodes() {
    let (_store, mut cluster) = sim_cluster(3, NodeConfig::default()).await;
    for _ in 0..20 {
        assert!(cluster.live_node_ids().contains(&cluster.random_node_id().unwrap()));
    }

    cluster.node_mut(2).unwrap().stop().await.unwrap();
    cluster.node_mut(3).unwrap().stop().await.unwrap();
    for _ in 0..5 {
        assert_eq!(cluster.random_node_id().unwrap(), 1);
    }

    cluster.node_mut(1).unwrap().stop().await.unwrap();
    assert!(matches!(cluster.random_node_id(), Err(HarnessError::NoLiveNodes)));
    cluster.destroy().await;
}

#[tokio::test]
async fn test_same_seed_same_choices() {
    let pick = |seed| async move {
        let store = SimStore::new();
        let mut cluster = Cluster::new(fast_config().with_seed(seed), store.factory()).unwrap();
        cluster.create(5, NodeConfig::default()).await.unwrap();
        let picks: Vec<u64> = (0..10).map(|_| cluster.random_node_id().unwrap()).collect();
        cluster.destroy().await;
        picks
    };
    assert_eq!(pick(99).await, pick(99).await);
}

#[tokio::test]
async fn test_destroy_is_idempotent() {
    let (store, mut cluster) = sim_cluster(3, NodeConfig::default()).await;

    cluster.destroy().await;
    cluster.destroy().await;
    assert_eq!(cluster.state(), ClusterState::Destroyed);
    assert_eq!(store.leader(), None);
    assert!(matches!(
        cluster.execute(&Command::ping()).await,
        Err(HarnessError::Destroyed)
    ));
    assert!(matches!(cluster.add_node(None).await, Err(HarnessError::Destroyed)));
}
