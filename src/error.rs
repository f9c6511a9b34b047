//! Error types for harness operations.
//!
//! Every failure the harness can surface is a [`HarnessError`]. Call sites that
//! need to decide between retrying, skipping and aborting go through
//! [`classify`] instead of matching individual variants.

use std::collections::BTreeMap;
use std::time::Duration;

use thiserror::Error;

use crate::node::NodeId;

/// Result type for harness operations.
pub type Result<T> = std::result::Result<T, HarnessError>;

/// Error reply codes that mean "ask someone else" or "nobody is in charge yet".
const ELECTION_CODES: &[&str] = &[
    "MOVED",
    "ASK",
    "LEADERIS",
    "NOTLEADER",
    "NOLEADER",
    "CLUSTERDOWN",
    "TRYAGAIN",
    "TIMEOUT",
    "LOADING",
    "NOCLUSTER",
];

/// Errors that can occur while driving a cluster.
#[derive(Debug, Error)]
pub enum HarnessError {
    /// A node process did not become reachable in time.
    #[error("node {node_id} failed to start: {reason}")]
    Startup { node_id: NodeId, reason: String },

    /// The cluster never reached a leader with the requested voting membership.
    #[error("cluster bring-up failed: {0}")]
    ClusterBringup(String),

    /// No leader accepted the command before the retry window closed.
    #[error("no leader after {attempts} attempts in {elapsed:?}, last error: {last_error}")]
    NoLeader {
        attempts: usize,
        elapsed: Duration,
        last_error: String,
    },

    /// The node answered with an error reply.
    #[error("node {node_id} replied {code}: {message}")]
    Response {
        node_id: NodeId,
        code: String,
        message: String,
    },

    /// A membership change was refused because of concurrent cluster activity.
    #[error("membership change for node {node_id} rejected: {reason}")]
    MembershipRejected { node_id: NodeId, reason: String },

    /// Live nodes did not converge on the same applied index.
    #[error("no unanimity after {timeout:?}, positions: {positions:?}")]
    Divergence {
        timeout: Duration,
        positions: BTreeMap<NodeId, Option<u64>>,
    },

    /// A node never reported itself as a voting member.
    #[error("node {node_id} did not become a voting member within {timeout:?}")]
    VotingTimeout { node_id: NodeId, timeout: Duration },

    /// Node not known to the cluster.
    #[error("node {0} not found in cluster")]
    NodeNotFound(NodeId),

    /// Node exists but its process is not running.
    #[error("node {0} is not running")]
    NodeNotRunning(NodeId),

    /// No node is running.
    #[error("cluster has no live nodes")]
    NoLiveNodes,

    /// The cluster was torn down.
    #[error("cluster has been destroyed")]
    Destroyed,

    /// The connection to a node could not be established or was dropped.
    #[error("connection to node {node_id} failed: {reason}")]
    Connection { node_id: NodeId, reason: String },

    /// A single request exceeded its deadline.
    #[error("request to node {node_id} timed out after {timeout:?}")]
    Timeout { node_id: NodeId, timeout: Duration },

    /// The reply had a shape the harness did not expect.
    #[error("unexpected reply: {0}")]
    UnexpectedReply(String),

    /// The end-to-end correctness check failed.
    #[error("invariant violated: {0}")]
    InvariantViolation(String),

    /// Operation not allowed in the cluster's current state.
    #[error("invalid cluster state: {0}")]
    InvalidState(String),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// How a caller should treat a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Leader missing or elsewhere; retry against the cluster.
    TransientElection,
    /// Membership change refused; skip or retry, never a harness defect.
    TransientMembership,
    /// Unanimity or voting never resolved; fail the test.
    Convergence,
    /// A process or the cluster never became usable; fail the test.
    Startup,
    /// Anything else.
    Fatal,
}

impl ErrorKind {
    /// Whether this kind may be absorbed by a retry or a skipped cycle.
    pub fn is_transient(self) -> bool {
        matches!(self, ErrorKind::TransientElection | ErrorKind::TransientMembership)
    }
}

/// Classify an error for retry/skip/abort decisions.
pub fn classify(err: &HarnessError) -> ErrorKind {
    match err {
        HarnessError::Response { code, .. } => {
            if ELECTION_CODES.iter().any(|c| c.eq_ignore_ascii_case(code)) {
                ErrorKind::TransientElection
            } else {
                ErrorKind::Fatal
            }
        }
        HarnessError::Connection { .. } | HarnessError::Timeout { .. } => {
            ErrorKind::TransientElection
        }
        HarnessError::MembershipRejected { .. } => ErrorKind::TransientMembership,
        HarnessError::Divergence { .. }
        | HarnessError::VotingTimeout { .. }
        | HarnessError::NoLeader { .. } => ErrorKind::Convergence,
        HarnessError::Startup { .. } | HarnessError::ClusterBringup(_) => ErrorKind::Startup,
        _ => ErrorKind::Fatal,
    }
}

impl HarnessError {
    /// Shorthand for [`classify`].
    pub fn kind(&self) -> ErrorKind {
        classify(self)
    }

    /// Whether the error may be retried or skipped.
    pub fn is_transient(&self) -> bool {
        self.kind().is_transient()
    }
}

impl From<serde_yaml::Error> for HarnessError {
    fn from(e: serde_yaml::Error) -> Self {
        HarnessError::Config(e.to_string())
    }
}
