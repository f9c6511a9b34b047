//! Testing utilities for harness integration tests
//!
//! Provides `SimStore`, an in-process stand-in for a cluster of store
//! processes. It keeps one committed log shared by all members and models
//! just enough of the real behaviour to exercise the harness:
//!
//! - writes are accepted only by the leader; followers answer `LEADERIS`
//! - losing the leader starts an election that completes after a few requests
//! - followers apply the log a few entries per request, so they lag
//! - added members start as non-voting learners and are promoted once caught up
//! - a restarted node keeps its applied state only if it runs with persistence
//!
//! Every request to any node advances the simulation by one tick.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::command::{Command, ErrorReply, Reply};
use crate::config::HarnessConfig;
use crate::error::{HarnessError, Result};
use crate::node::{BackendFactory, LaunchSpec, NodeBackend, NodeId};

/// Timing knobs of the simulation, in ticks
#[derive(Clone, Debug)]
pub struct SimOptions {
    /// Log entries a follower applies per tick
    pub catch_up_step: u64,
    /// Ticks between losing a leader and electing a new one
    pub election_ticks: u32,
}

impl Default for SimOptions {
    fn default() -> Self {
        SimOptions {
            catch_up_step: 2,
            election_ticks: 3,
        }
    }
}

/// Harness config with short timeouts suitable for `SimStore` clusters
pub fn fast_config() -> HarnessConfig {
    HarnessConfig::default()
        .with_startup_timeout(Duration::from_secs(1))
        .with_startup_poll_interval(Duration::from_millis(5))
        .with_bringup_timeout(Duration::from_secs(5))
        .with_request_timeout(Duration::from_secs(1))
        .with_leader_timeout(Duration::from_secs(5))
        .with_retry_backoff(Duration::from_millis(2), Duration::from_millis(20))
        .with_unanimity(Duration::from_millis(5), Duration::from_secs(5))
        .with_voting_timeout(Duration::from_secs(5))
        .with_seed(7)
}

/// A simulated replicated store shared by all nodes created from it
#[derive(Clone, Default)]
pub struct SimStore {
    state: Arc<Mutex<SimState>>,
}

impl SimStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_options(options: SimOptions) -> Self {
        SimStore {
            state: Arc::new(Mutex::new(SimState {
                options,
                ..SimState::default()
            })),
        }
    }

    /// This store as a backend factory for [`crate::Cluster::new`]
    pub fn factory(&self) -> Arc<dyn BackendFactory> {
        Arc::new(self.clone())
    }

    /// Node `id` will launch but never answer a request
    pub fn make_unresponsive(&self, id: NodeId) {
        self.state.lock().unresponsive.insert(id);
    }

    /// Node `id` stops applying log entries
    pub fn freeze(&self, id: NodeId) {
        self.state.lock().frozen.insert(id);
    }

    pub fn thaw(&self, id: NodeId) {
        self.state.lock().frozen.remove(&id);
    }

    /// Refuse the next `count` member removals as if an election were running
    pub fn reject_removals(&self, count: usize) {
        self.state.lock().removals_to_reject = count;
    }

    /// Number of committed log entries
    pub fn log_len(&self) -> u64 {
        self.state.lock().log.len() as u64
    }

    pub fn leader(&self) -> Option<NodeId> {
        self.state.lock().leader
    }

    pub fn term(&self) -> u64 {
        self.state.lock().term
    }

    /// Current members and whether each one votes
    pub fn members(&self) -> BTreeMap<NodeId, bool> {
        self.state
            .lock()
            .members
            .iter()
            .map(|(id, m)| (*id, m.voting))
            .collect()
    }
}

impl BackendFactory for SimStore {
    fn create(&self, node_id: NodeId) -> Box<dyn NodeBackend> {
        Box::new(SimNode {
            node_id,
            state: self.state.clone(),
        })
    }
}

/// One simulated node process
pub struct SimNode {
    node_id: NodeId,
    state: Arc<Mutex<SimState>>,
}

#[async_trait]
impl NodeBackend for SimNode {
    async fn launch(&mut self, spec: &LaunchSpec) -> Result<()> {
        self.state.lock().launch(self.node_id, spec);
        Ok(())
    }

    async fn shutdown(&mut self) -> Result<()> {
        self.state.lock().shutdown(self.node_id);
        Ok(())
    }

    async fn execute(&mut self, command: &Command) -> Result<Reply> {
        self.state.lock().request(self.node_id, command)
    }

    fn has_exited(&mut self) -> bool {
        !self.state.lock().is_running(self.node_id)
    }
}

#[derive(Clone, Debug)]
enum Entry {
    Init,
    AddNode,
    RemoveNode,
    Write(Vec<String>),
    Expire { keys: Vec<String>, ttl: u64 },
}

#[derive(Clone, Debug)]
struct Member {
    address: String,
    voting: bool,
}

#[derive(Clone, Debug)]
struct Stored {
    value: String,
    ttl: Option<u64>,
}

#[derive(Debug, Default)]
struct Process {
    running: bool,
    address: String,
    applied: u64,
    data: HashMap<String, Stored>,
}

#[derive(Default)]
struct SimState {
    options: SimOptions,
    log: Vec<Entry>,
    members: BTreeMap<NodeId, Member>,
    processes: BTreeMap<NodeId, Process>,
    leader: Option<NodeId>,
    term: u64,
    election_countdown: u32,
    unresponsive: BTreeSet<NodeId>,
    frozen: BTreeSet<NodeId>,
    removals_to_reject: usize,
}

impl SimState {
    fn launch(&mut self, id: NodeId, spec: &LaunchSpec) {
        let process = self.processes.entry(id).or_default();
        if !spec.config.persist {
            *process = Process::default();
        }
        process.running = true;
        process.address = spec.address();
    }

    fn shutdown(&mut self, id: NodeId) {
        if let Some(process) = self.processes.get_mut(&id) {
            process.running = false;
        }
        if self.leader == Some(id) {
            self.leader = None;
            self.election_countdown = self.options.election_ticks;
        }
    }

    fn is_running(&self, id: NodeId) -> bool {
        self.processes.get(&id).is_some_and(|p| p.running)
    }

    fn is_reachable(&self, id: NodeId) -> bool {
        self.is_running(id) && !self.unresponsive.contains(&id)
    }

    fn request(&mut self, id: NodeId, command: &Command) -> Result<Reply> {
        if !self.is_reachable(id) {
            return Err(HarnessError::Connection {
                node_id: id,
                reason: "connection refused".to_string(),
            });
        }
        self.tick();

        let name = command.name().to_ascii_uppercase();
        let args = command.arguments();
        match name.as_str() {
            "PING" => Ok(Reply::Status("PONG".to_string())),
            "INFO" => Ok(Reply::bulk(self.info(id))),
            "RAFT.CLUSTER" => self.cluster_init(id),
            "RAFT.NODE" => self.membership(id, args),
            "RAFT.DEBUG" => match args.first().map(|a| a.to_ascii_uppercase()).as_deref() {
                Some("EXEC") => self.local_exec(id, &args[1..]),
                Some("EXPIRE") if args.len() >= 3 => {
                    let ttl = parse_u64(id, &args[args.len() - 1])?;
                    let keys = args[1..args.len() - 1].to_vec();
                    self.replicate(id, Entry::Expire { keys, ttl })
                }
                _ => Err(error_reply(id, "ERR unknown RAFT.DEBUG subcommand")),
            },
            "RAFT" if !args.is_empty() => self.client_command(id, args.to_vec()),
            _ => {
                let mut parts = vec![name];
                parts.extend(args.iter().cloned());
                self.client_command(id, parts)
            }
        }
    }

    fn tick(&mut self) {
        if self.leader.is_none() && !self.members.is_empty() {
            self.election_countdown = self.election_countdown.saturating_sub(1);
            if self.election_countdown == 0 && !self.elect() {
                self.election_countdown = self.options.election_ticks;
            }
        }
        if self.leader.is_none() {
            return;
        }

        let target = self.log.len() as u64;
        let step = self.options.catch_up_step;
        let ids: Vec<NodeId> = self.members.keys().copied().collect();
        for id in ids {
            if !self.is_reachable(id) || self.frozen.contains(&id) {
                continue;
            }
            let upto = self.processes.get(&id).map_or(0, |p| (p.applied + step).min(target));
            self.catch_up(id, upto);
            if self.processes.get(&id).is_some_and(|p| p.applied == target) {
                if let Some(member) = self.members.get_mut(&id) {
                    member.voting = true;
                }
            }
        }
    }

    /// Elect the most up-to-date reachable voter if a quorum is reachable
    fn elect(&mut self) -> bool {
        if !self.has_quorum() {
            return false;
        }
        let candidate = self
            .members
            .iter()
            .filter(|(id, m)| m.voting && self.is_reachable(**id))
            .map(|(id, _)| (*id, self.processes.get(id).map_or(0, |p| p.applied)))
            .max_by(|a, b| a.1.cmp(&b.1).then(b.0.cmp(&a.0)))
            .map(|(id, _)| id);

        let Some(leader) = candidate else {
            return false;
        };
        self.term += 1;
        self.leader = Some(leader);
        self.catch_up(leader, self.log.len() as u64);
        true
    }

    fn has_quorum(&self) -> bool {
        let voters: Vec<NodeId> = self
            .members
            .iter()
            .filter(|(_, m)| m.voting)
            .map(|(id, _)| *id)
            .collect();
        let reachable = voters.iter().filter(|id| self.is_reachable(**id)).count();
        reachable * 2 > voters.len()
    }

    /// Apply entries to `id` up to index `upto`, returning the last entry's result
    fn catch_up(&mut self, id: NodeId, upto: u64) -> Option<std::result::Result<Reply, String>> {
        let process = self.processes.get_mut(&id)?;
        let mut last = None;
        while process.applied < upto {
            let entry = &self.log[process.applied as usize];
            last = Some(apply(&mut process.data, entry));
            process.applied += 1;
        }
        last
    }

    fn cluster_init(&mut self, id: NodeId) -> Result<Reply> {
        if !self.members.is_empty() {
            return Err(error_reply(id, "ERR cluster already initialized"));
        }
        let address = self.processes.get(&id).map(|p| p.address.clone()).unwrap_or_default();
        self.members.insert(id, Member { address, voting: true });
        self.leader = Some(id);
        self.term = 1;
        self.log.push(Entry::Init);
        self.catch_up(id, self.log.len() as u64);
        Ok(Reply::ok())
    }

    /// Fail unless `id` is the leader, pointing the caller at the leader
    fn check_leader(&self, id: NodeId) -> Result<()> {
        if !self.members.contains_key(&id) {
            return Err(error_reply(id, "NOCLUSTER No Raft Cluster"));
        }
        match self.leader {
            None => Err(error_reply(id, "NOLEADER")),
            Some(leader) if leader != id => {
                let address = self.members.get(&leader).map(|m| m.address.clone()).unwrap_or_default();
                Err(error_reply(id, &format!("LEADERIS {}", address)))
            }
            Some(_) => Ok(()),
        }
    }

    fn replicate(&mut self, id: NodeId, entry: Entry) -> Result<Reply> {
        self.check_leader(id)?;
        if !self.has_quorum() {
            return Err(error_reply(id, "TIMEOUT quorum unreachable"));
        }
        self.log.push(entry);
        match self.catch_up(id, self.log.len() as u64) {
            Some(Ok(reply)) => Ok(reply),
            Some(Err(msg)) => Err(error_reply(id, &msg)),
            None => Ok(Reply::ok()),
        }
    }

    fn client_command(&mut self, id: NodeId, mut parts: Vec<String>) -> Result<Reply> {
        parts[0] = parts[0].to_ascii_uppercase();
        if parts[0] == "GET" || parts[0] == "TTL" {
            self.check_leader(id)?;
            let process = self.processes.entry(id).or_default();
            return execute_local(&mut process.data, &parts).map_err(|msg| error_reply(id, &msg));
        }
        self.replicate(id, Entry::Write(parts))
    }

    fn local_exec(&mut self, id: NodeId, parts: &[String]) -> Result<Reply> {
        if parts.is_empty() {
            return Err(error_reply(id, "ERR RAFT.DEBUG EXEC needs a command"));
        }
        let mut parts = parts.to_vec();
        parts[0] = parts[0].to_ascii_uppercase();
        let process = self.processes.entry(id).or_default();
        execute_local(&mut process.data, &parts).map_err(|msg| error_reply(id, &msg))
    }

    fn membership(&mut self, id: NodeId, args: &[String]) -> Result<Reply> {
        let sub = args.first().map(|a| a.to_ascii_uppercase()).unwrap_or_default();
        let target = match args.get(1) {
            Some(raw) => parse_u64(id, raw)?,
            None => return Err(error_reply(id, "ERR wrong number of arguments")),
        };
        self.check_leader(id)?;

        let pending_learner = self.members.values().any(|m| !m.voting);
        match sub.as_str() {
            "ADD" => {
                let address = args
                    .get(2)
                    .cloned()
                    .ok_or_else(|| error_reply(id, "ERR wrong number of arguments"))?;
                if self.members.contains_key(&target) {
                    return Err(error_reply(id, "ERR node id exists"));
                }
                if pending_learner {
                    return Err(error_reply(id, "ERR configuration change in progress"));
                }
                let reply = self.replicate(id, Entry::AddNode)?;
                self.members.insert(target, Member { address, voting: false });
                Ok(reply)
            }
            "REMOVE" => {
                if self.removals_to_reject > 0 {
                    self.removals_to_reject -= 1;
                    return Err(error_reply(id, "ERR election in progress"));
                }
                if !self.members.contains_key(&target) {
                    return Err(error_reply(id, "ERR node id does not exist"));
                }
                if self.leader == Some(target) {
                    return Err(error_reply(id, "ERR cannot remove the current leader"));
                }
                if pending_learner {
                    return Err(error_reply(id, "ERR configuration change in progress"));
                }
                let reply = self.replicate(id, Entry::RemoveNode)?;
                self.members.remove(&target);
                Ok(reply)
            }
            _ => Err(error_reply(id, "ERR unknown RAFT.NODE subcommand")),
        }
    }

    fn info(&self, id: NodeId) -> String {
        let member = self.members.get(&id);
        let role = if self.leader == Some(id) { "leader" } else { "follower" };
        let applied = self.processes.get(&id).map_or(0, |p| p.applied);
        let leader_id = self.leader.map_or(-1, |l| l as i64);
        let voters = self.members.values().filter(|m| m.voting).count();
        format!(
            "# Raft\r\nraft_node_id:{}\r\nraft_role:{}\r\nraft_is_voting:{}\r\nraft_leader_id:{}\r\n\
             raft_current_term:{}\r\nraft_num_nodes:{}\r\nraft_num_voting_nodes:{}\r\n\
             raft_current_index:{}\r\nraft_commit_index:{}\r\nraft_last_applied_index:{}\r\n",
            id,
            role,
            if member.is_some_and(|m| m.voting) { "yes" } else { "no" },
            leader_id,
            self.term,
            self.members.len(),
            voters,
            self.log.len(),
            self.log.len(),
            applied,
        )
    }
}

fn apply(data: &mut HashMap<String, Stored>, entry: &Entry) -> std::result::Result<Reply, String> {
    match entry {
        Entry::Init | Entry::AddNode | Entry::RemoveNode => Ok(Reply::ok()),
        Entry::Write(parts) => execute_local(data, parts),
        Entry::Expire { keys, ttl } => {
            // The entry states how much lifetime is left; only keys with an
            // expiry and nothing left are dropped
            let mut expired = 0;
            if *ttl == 0 {
                for key in keys {
                    if data.get(key).is_some_and(|s| s.ttl.is_some()) {
                        data.remove(key);
                        expired += 1;
                    }
                }
            }
            Ok(Reply::Int(expired))
        }
    }
}

/// Run a key-value command against one node's data
fn execute_local(data: &mut HashMap<String, Stored>, parts: &[String]) -> std::result::Result<Reply, String> {
    let arity = |n: usize| {
        if parts.len() == n {
            Ok(())
        } else {
            Err(format!("ERR wrong number of arguments for '{}'", parts[0].to_ascii_lowercase()))
        }
    };
    match parts[0].as_str() {
        "GET" => {
            arity(2)?;
            Ok(data.get(&parts[1]).map_or(Reply::Nil, |s| Reply::bulk(s.value.clone())))
        }
        "SET" => {
            arity(3)?;
            data.insert(parts[1].clone(), Stored { value: parts[2].clone(), ttl: None });
            Ok(Reply::ok())
        }
        "INCR" | "INCRBY" => {
            let delta = if parts[0] == "INCR" {
                arity(2)?;
                1
            } else {
                arity(3)?;
                parts[2].parse::<i64>().map_err(|_| "ERR value is not an integer".to_string())?
            };
            let stored = data.entry(parts[1].clone()).or_insert(Stored {
                value: "0".to_string(),
                ttl: None,
            });
            let current: i64 = stored
                .value
                .parse()
                .map_err(|_| "ERR value is not an integer".to_string())?;
            let next = current + delta;
            stored.value = next.to_string();
            Ok(Reply::Int(next))
        }
        "DEL" => {
            let removed = parts[1..].iter().filter(|k| data.remove(*k).is_some()).count();
            Ok(Reply::Int(removed as i64))
        }
        "EXPIRE" => {
            arity(3)?;
            let ttl = parts[2].parse::<u64>().map_err(|_| "ERR value is not an integer".to_string())?;
            match data.get_mut(&parts[1]) {
                Some(stored) => {
                    stored.ttl = Some(ttl);
                    Ok(Reply::Int(1))
                }
                None => Ok(Reply::Int(0)),
            }
        }
        "TTL" => {
            arity(2)?;
            Ok(Reply::Int(match data.get(&parts[1]) {
                Some(Stored { ttl: Some(ttl), .. }) => *ttl as i64,
                Some(_) => -1,
                None => -2,
            }))
        }
        other => Err(format!("ERR unknown command '{}'", other.to_ascii_lowercase())),
    }
}

fn error_reply(node_id: NodeId, raw: &str) -> HarnessError {
    let ErrorReply { code, message } = ErrorReply::parse(raw);
    HarnessError::Response { node_id, code, message }
}

fn parse_u64(node_id: NodeId, raw: &str) -> Result<u64> {
    raw.parse()
        .map_err(|_| error_reply(node_id, "ERR value is not an integer"))
}
