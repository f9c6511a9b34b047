//! Fuzz driver
//!
//! Runs a fixed number of increment cycles against a cluster, injecting a
//! fault cycle every `fault_every` iterations, then checks that the counter
//! grew by exactly the number of acknowledged increments. Any lost or duplicated
//! update shows up as a mismatch in that final read.

use std::time::Instant;

use serde::Serialize;
use tracing::{info, warn};

use crate::cluster::Cluster;
use crate::command::Command;
use crate::error::{classify, ErrorKind, HarnessError, Result};
use crate::fault::{FaultEvent, FaultGenerator, FaultInjector};

/// Parameters of one fuzz run
#[derive(Clone, Debug)]
pub struct FuzzConfig {
    /// Number of increment cycles
    pub cycles: usize,
    /// Inject a fault cycle when `cycle % fault_every == 0`; 0 disables faults
    pub fault_every: usize,
    /// Counter key
    pub key: String,
    /// Wait for unanimity before the final read
    pub settle: bool,
}

impl Default for FuzzConfig {
    fn default() -> Self {
        FuzzConfig {
            cycles: 100,
            fault_every: 7,
            key: "counter".to_string(),
            settle: true,
        }
    }
}

impl FuzzConfig {
    pub fn with_cycles(mut self, cycles: usize) -> Self {
        self.cycles = cycles;
        self
    }

    pub fn with_fault_every(mut self, fault_every: usize) -> Self {
        self.fault_every = fault_every;
        self
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = key.into();
        self
    }

    pub fn with_settle(mut self, settle: bool) -> Self {
        self.settle = settle;
        self
    }

    fn is_fault_cycle(&self, cycle: usize) -> bool {
        self.fault_every > 0 && cycle % self.fault_every == 0
    }
}

/// What happened to one fault event
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub enum FaultOutcome {
    Applied,
    /// Refused by the cluster; the rest of that fault cycle was skipped
    Rejected(String),
}

#[derive(Clone, Debug, Serialize)]
pub struct FaultRecord {
    pub cycle: usize,
    pub event: FaultEvent,
    pub outcome: FaultOutcome,
}

/// Summary of a finished fuzz run
#[derive(Clone, Debug, Serialize)]
pub struct FuzzReport {
    pub cycles: usize,
    /// Counter value before the first cycle (0 when the key was missing)
    pub initial: i64,
    /// Value the counter must hold
    pub expected: i64,
    /// Value read back at the end
    pub final_value: i64,
    /// Acknowledged increments
    pub increments: usize,
    pub faults_applied: usize,
    pub faults_skipped: usize,
    pub faults: Vec<FaultRecord>,
    pub duration_ms: u64,
    /// Seed of the cluster's random choices
    pub seed: u64,
}

impl FuzzReport {
    pub fn is_consistent(&self) -> bool {
        self.expected == self.final_value
    }
}

/// Run the fuzz loop and check the counter at the end
///
/// Every increment must succeed. Fault events rejected as transient
/// membership conflicts are recorded and skipped; any other fault failure
/// aborts the run. Returns [`HarnessError::InvariantViolation`] when the
/// final value differs from the starting value plus the acknowledged
/// increments.
pub async fn run(
    cluster: &mut Cluster,
    config: &FuzzConfig,
    generator: &mut dyn FaultGenerator,
) -> Result<FuzzReport> {
    let injector = FaultInjector::new(cluster.config());
    let started = Instant::now();
    let initial = read_counter(cluster, &config.key).await?;
    let mut increments = 0usize;
    let mut faults = Vec::new();

    info!(cycles = config.cycles, fault_every = config.fault_every, key = %config.key, "Starting fuzz run");

    for cycle in 0..config.cycles {
        let reply = cluster.execute(&Command::incrby(&config.key, 1)).await?;
        if !reply.is_truthy() {
            return Err(HarnessError::UnexpectedReply(format!(
                "INCRBY at cycle {} returned {}",
                cycle, reply
            )));
        }
        increments += 1;

        if !config.is_fault_cycle(cycle) {
            continue;
        }

        let events = generator.generate(&cluster.live_node_ids());
        for event in events {
            match injector.apply(cluster, &event).await {
                Ok(()) => faults.push(FaultRecord {
                    cycle,
                    event,
                    outcome: FaultOutcome::Applied,
                }),
                Err(e) if classify(&e) == ErrorKind::TransientMembership => {
                    warn!(cycle, %event, error = %e, "Fault rejected, skipping rest of cycle");
                    faults.push(FaultRecord {
                        cycle,
                        event,
                        outcome: FaultOutcome::Rejected(e.to_string()),
                    });
                    break;
                }
                Err(e) => return Err(e),
            }
        }
    }

    if config.settle {
        cluster.wait_for_unanimity().await?;
    }

    let final_value = read_counter(cluster, &config.key).await?;

    let faults_applied = faults
        .iter()
        .filter(|f| f.outcome == FaultOutcome::Applied)
        .count();
    let report = FuzzReport {
        cycles: config.cycles,
        initial,
        expected: initial + increments as i64,
        final_value,
        increments,
        faults_applied,
        faults_skipped: faults.len() - faults_applied,
        faults,
        duration_ms: started.elapsed().as_millis() as u64,
        seed: cluster.seed(),
    };

    info!(
        final_value,
        expected = report.expected,
        faults_applied = report.faults_applied,
        faults_skipped = report.faults_skipped,
        duration_ms = report.duration_ms,
        "Fuzz run finished"
    );

    if !report.is_consistent() {
        return Err(HarnessError::InvariantViolation(format!(
            "{} = {} after {} acknowledged increments from {}, expected {}",
            config.key, report.final_value, report.increments, report.initial, report.expected
        )));
    }
    Ok(report)
}

/// Current counter value through the leader; a missing key reads as 0
async fn read_counter(cluster: &mut Cluster, key: &str) -> Result<i64> {
    let reply = cluster.execute(&Command::get(key)).await?;
    if reply.is_nil() {
        return Ok(0);
    }
    reply
        .as_int()
        .ok_or_else(|| HarnessError::UnexpectedReply(format!("GET {} returned {}", key, reply)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = FuzzConfig::default();
        assert_eq!(config.cycles, 100);
        assert_eq!(config.fault_every, 7);
        assert_eq!(config.key, "counter");
        assert!(config.settle);
    }

    #[test]
    fn test_fault_cycles() {
        let config = FuzzConfig::default().with_fault_every(7);
        let fault_cycles: Vec<usize> = (0..20).filter(|c| config.is_fault_cycle(*c)).collect();
        assert_eq!(fault_cycles, vec![0, 7, 14]);

        let quiet = FuzzConfig::default().with_fault_every(0);
        assert!((0..20).all(|c| !quiet.is_fault_cycle(c)));
    }
}
