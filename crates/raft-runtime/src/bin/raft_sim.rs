//! # raft-sim
//!
//! why: watch a cluster elect, replicate and fail over from the command line
//! relations: wires raft-runtime nodes over LocalNetwork, storage from raft-storage
//! what: clap cli, tracing setup, scripted run, per-node status dump

use std::collections::BTreeMap;
use std::error::Error;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use raft_core::{ClusterConfig, KeyValueStore, NodeId, RaftConfig, StateMachine, Storage};
use raft_runtime::{LocalNetwork, Raft, TokioScheduler};
use raft_storage::{FileStorage, InMemoryStorage};
use tracing_subscriber::EnvFilter;

type SimNode = Raft<Box<dyn Storage>, KeyValueStore>;

#[derive(Parser, Debug)]
#[command(name = "raft-sim")]
#[command(version)]
#[command(about = "Run an in-process Raft cluster and replicate a few commands")]
struct Args {
    /// Number of nodes (ignored when --config lists members)
    #[arg(long, default_value_t = 3)]
    nodes: usize,

    /// Number of put commands to submit
    #[arg(long, default_value_t = 5)]
    commands: usize,

    /// Crash the leader after the commands commit and wait for a new one
    #[arg(long)]
    kill_leader: bool,

    /// Cluster config JSON; its timing and member list are used
    #[arg(long)]
    config: Option<PathBuf>,

    /// Persist each node under <DIR>/<node id> instead of in memory
    #[arg(long)]
    data_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let (members, raft_config) = match &args.config {
        Some(path) => {
            let loaded = ClusterConfig::load(path)?;
            (loaded.members, loaded.raft)
        }
        None => ((1..=args.nodes).map(|i| format!("n{}", i)).collect(), RaftConfig::default()),
    };
    if members.is_empty() {
        return Err("cluster needs at least one member".into());
    }

    let network = LocalNetwork::new();
    let mut nodes: BTreeMap<NodeId, SimNode> = BTreeMap::new();
    for id in &members {
        let storage: Box<dyn Storage> = match &args.data_dir {
            Some(dir) => Box::new(FileStorage::new(dir.join(id))?),
            None => Box::new(InMemoryStorage::new()),
        };
        let cluster = ClusterConfig::new(id.clone(), members.clone()).with_raft(raft_config.clone());
        let node = Raft::new(
            cluster,
            storage,
            KeyValueStore::new(),
            Arc::new(network.clone()),
            Arc::new(TokioScheduler),
        )?;
        network.register(id.clone(), Arc::new(node.clone()));
        nodes.insert(id.clone(), node);
    }
    for node in nodes.values() {
        node.start();
    }

    let leader = wait_for_leader(&nodes, None).await?;
    tracing::info!(leader = %leader, "Cluster has a leader");

    for i in 0..args.commands {
        let command = KeyValueStore::put_command(&format!("key{}", i), &format!("value{}", i));
        let response = nodes[&leader].submit(command).await;
        tracing::info!(
            index = i,
            success = response.success,
            error = response.error.as_deref().unwrap_or(""),
            "Submitted command"
        );
    }

    if args.kill_leader {
        if let Some(old) = nodes.remove(&leader) {
            old.shutdown();
            network.unregister(&leader);
            tracing::info!(node_id = %leader, "Killed leader");
        }
        let next = wait_for_leader(&nodes, Some(&leader)).await?;
        tracing::info!(leader = %next, "New leader elected");
        let response = nodes[&next]
            .submit(KeyValueStore::put_command("after_failover", "ok"))
            .await;
        tracing::info!(success = response.success, "Submitted command after failover");
    }

    // one more heartbeat round so followers learn the final commit index
    tokio::time::sleep(raft_config.heartbeat() * 3).await;

    for node in nodes.values() {
        let report = serde_json::json!({
            "status": node.status(),
            "last_applied": node.last_applied(),
            "state": node.with_state_machine(|kv| kv.get_state()),
        });
        println!("{}", serde_json::to_string_pretty(&report)?);
    }

    for node in nodes.values() {
        node.shutdown();
    }
    Ok(())
}

async fn wait_for_leader(
    nodes: &BTreeMap<NodeId, SimNode>,
    other_than: Option<&NodeId>,
) -> Result<NodeId, Box<dyn Error>> {
    for _ in 0..500 {
        let leader = nodes
            .values()
            .filter(|n| n.is_leader() && Some(n.id()) != other_than)
            .max_by_key(|n| n.current_term());
        if let Some(node) = leader {
            return Ok(node.id().clone());
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    Err("no leader elected within 5s".into())
}
