//! Fuzz a cluster of real store processes
//!
//! Usage: raft-fuzz [--config harness.yaml] [--nodes 3] [--cycles 100]
//!                  [--fault-every 7] [--mode restarts|churn|mixed] [--seed N]
//!                  [--persist] [--json]
//!
//! Server binary, module path and ports come from the YAML config.

use clap::Parser;
use tracing::{error, info};

use raft_sandbox::fault::{FaultMode, RandomFaultGenerator};
use raft_sandbox::fuzz::{self, FuzzConfig};
use raft_sandbox::{Cluster, HarnessConfig, NodeConfig};

#[derive(Parser, Debug)]
#[command(
    name = "raft-fuzz",
    version,
    about = "Fault-injecting fuzzer for a Raft-replicated key-value store"
)]
struct Cli {
    /// Path to a YAML harness configuration file.
    #[arg(short, long)]
    config: Option<String>,

    /// Initial cluster size.
    #[arg(short, long, default_value_t = 3)]
    nodes: usize,

    /// Number of increment cycles.
    #[arg(long, default_value_t = 100)]
    cycles: usize,

    /// Inject faults every N cycles (0 disables faults).
    #[arg(long, default_value_t = 7)]
    fault_every: usize,

    /// Fault kind: restarts, churn or mixed.
    #[arg(short, long, default_value = "restarts")]
    mode: FaultMode,

    /// Seed for all random choices; overrides the config file.
    #[arg(long)]
    seed: Option<u64>,

    /// Run nodes with persistence enabled.
    #[arg(long)]
    persist: bool,

    /// Print the report as JSON.
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => {
            info!("Loading configuration from {}", path);
            HarnessConfig::from_file(path)?
        }
        None => HarnessConfig::default(),
    };
    if let Some(seed) = cli.seed {
        config = config.with_seed(seed);
    }

    let node_config = if cli.persist {
        NodeConfig::persistent()
    } else {
        NodeConfig::default()
    };
    let fuzz_config = FuzzConfig::default()
        .with_cycles(cli.cycles)
        .with_fault_every(cli.fault_every);

    let mut cluster = Cluster::with_processes(config)?;
    let mut generator = RandomFaultGenerator::new(cli.mode, cluster.seed());
    info!(seed = cluster.seed(), nodes = cli.nodes, mode = ?cli.mode, "Starting fuzzer");

    let result = match cluster.create(cli.nodes, node_config).await {
        Ok(()) => fuzz::run(&mut cluster, &fuzz_config, &mut generator).await,
        Err(e) => Err(e),
    };
    cluster.destroy().await;

    let report = result.inspect_err(|e| error!(seed = cluster.seed(), error = %e, "Fuzz run failed"))?;
    if cli.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!(
            "ok: {} = {} after {} cycles, {} faults applied, {} skipped, seed {}",
            fuzz_config.key,
            report.final_value,
            report.cycles,
            report.faults_applied,
            report.faults_skipped,
            report.seed
        );
    }
    Ok(())
}
