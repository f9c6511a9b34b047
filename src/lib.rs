//! Cluster harness and fault-injecting fuzzer for a Raft-replicated key-value store
//!
//! The harness starts store nodes as processes, forms them into a cluster,
//! routes commands to whichever node currently leads, changes membership and
//! restarts nodes while a workload runs, and checks that every live node ends
//! up with the same applied log position.

pub mod cluster;
pub mod command;
pub mod config;
pub mod consistency;
pub mod error;
pub mod executor;
pub mod fault;
pub mod fuzz;
pub mod info;
pub mod node;

/// Testing utilities for integration tests.
pub mod testing;

pub use cluster::{Cluster, ClusterState};
pub use command::{Command, ErrorReply, Reply};
pub use config::{HarnessConfig, NodeConfig, ServerConfig};
pub use consistency::ConsistencyCheckpoint;
pub use error::{ErrorKind, HarnessError, Result};
pub use fault::{FaultEvent, FaultGenerator, FaultInjector, FaultMode, RandomFaultGenerator};
pub use fuzz::{FuzzConfig, FuzzReport};
pub use info::{RaftInfo, Role};
pub use node::{Node, NodeId, NodeState};
