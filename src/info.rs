//! Raft status as reported by a node's `INFO raft` section

use std::collections::HashMap;

use crate::error::{HarnessError, Result};

/// Role a node reports for itself
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Leader,
    Follower,
    Candidate,
    PreCandidate,
    Unknown,
}

impl Role {
    fn parse(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "leader" => Role::Leader,
            "follower" => Role::Follower,
            "candidate" => Role::Candidate,
            "pre-candidate" | "precandidate" => Role::PreCandidate,
            _ => Role::Unknown,
        }
    }
}

/// Snapshot of a node's Raft state
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RaftInfo {
    pub node_id: u64,
    pub role: Role,
    pub is_voting: bool,
    pub leader_id: Option<u64>,
    pub current_term: u64,
    pub num_nodes: u64,
    pub num_voting_nodes: u64,
    pub current_index: u64,
    pub commit_index: u64,
    pub last_applied_index: u64,
}

impl RaftInfo {
    /// Parse the text body of an `INFO raft` reply
    ///
    /// Lines are `key:value`; section headers and blank lines are skipped and
    /// a `raft_` prefix on keys is optional. A negative leader id means none.
    pub fn parse(text: &str) -> Result<Self> {
        let fields: HashMap<&str, &str> = text
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .filter_map(|line| line.split_once(':'))
            .map(|(k, v)| (k.strip_prefix("raft_").unwrap_or(k), v.trim()))
            .collect();

        let number = |key: &str| -> Result<u64> {
            fields
                .get(key)
                .ok_or_else(|| HarnessError::UnexpectedReply(format!("INFO raft missing {}", key)))?
                .parse::<u64>()
                .map_err(|e| HarnessError::UnexpectedReply(format!("INFO raft {}: {}", key, e)))
        };
        let optional = |key: &str| -> u64 {
            fields.get(key).and_then(|v| v.parse().ok()).unwrap_or(0)
        };

        let leader_id = fields
            .get("leader_id")
            .and_then(|v| v.parse::<i64>().ok())
            .filter(|id| *id > 0)
            .map(|id| id as u64);

        Ok(RaftInfo {
            node_id: number("node_id")?,
            role: fields.get("role").map(|r| Role::parse(r)).unwrap_or(Role::Unknown),
            is_voting: fields
                .get("is_voting")
                .map(|v| v.eq_ignore_ascii_case("yes") || *v == "1")
                .unwrap_or(false),
            leader_id,
            current_term: optional("current_term"),
            num_nodes: optional("num_nodes"),
            num_voting_nodes: optional("num_voting_nodes"),
            current_index: optional("current_index"),
            commit_index: optional("commit_index"),
            last_applied_index: number("last_applied_index")?,
        })
    }

    pub fn is_leader(&self) -> bool {
        self.role == Role::Leader
    }
}
