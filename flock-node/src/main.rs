//! flock-node, one peer of the flock cluster.
//!
//! Boots the transport dispatcher, the routing engine and the five core
//! protocol extensions, then runs until ctrl-c or a `CONTROL/SHUTDOWN`
//! message arrives.

use anyhow::{bail, Context};
use clap::Parser;
use flock_node::ext::{
    BankingExtension, ConsensusExtension, ConsensusKnobs, ControlExtension, DiscoveryExtension,
    RumorExtension,
};
use flock_node::{Engine, NodeContext};
use flock_topology::{ClusterConfig, CommGraph, Neighbourhood};
use flock_wire::{Dispatcher, Message, ShutdownSignal, TcpTransport};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Capacity of the transport-to-engine handoff queue.
const INBOUND_QUEUE: usize = 16;

#[derive(Parser)]
#[command(name = "flock-node")]
#[command(about = "A peer node of the flock distributed-algorithms toolkit", long_about = None)]
#[command(version)]
struct Cli {
    /// UID of this node, as listed in the config file
    #[arg(long)]
    uid: u32,

    /// Path to the cluster config file (`<uid> <host>:<port>` per line)
    #[arg(long, default_value = "./config")]
    config: String,

    /// Path to the communication graph (Graphviz DOT); full mesh if absent
    #[arg(long)]
    graph: Option<String>,

    /// Consensus: number of neighbours seeded with voteBegin
    #[arg(long = "consensus-s", default_value_t = 2)]
    consensus_s: usize,

    /// Consensus: upper bound of the initial discrete timestamp
    #[arg(long = "consensus-m", default_value_t = 10)]
    consensus_m: i64,

    /// Consensus: random fan-out of proposal cascades
    #[arg(long = "consensus-p", default_value_t = 2)]
    consensus_p: usize,

    /// Consensus: proposals a node accepts before going silent
    #[arg(long = "consensus-amax", default_value_t = 3)]
    consensus_amax: u32,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    let config = ClusterConfig::load(&cli.config)
        .with_context(|| format!("failed to load config from {}", cli.config))?;
    let connect = config
        .connect(cli.uid)
        .with_context(|| format!("UID {} not in config", cli.uid))?;

    // Bind on all interfaces at the configured port.
    let Some((_, port)) = connect.rsplit_once(':') else {
        bail!("connect string `{connect}` has to follow <host>:<port>");
    };
    let listen = format!("0.0.0.0:{port}");

    let neighbourhood = match &cli.graph {
        Some(graph_path) => {
            info!("loading node config from configuration file + communication graph");
            let graph = CommGraph::load(graph_path)
                .with_context(|| format!("failed to load graph from {graph_path}"))?;
            Neighbourhood::from_config_and_graph(cli.uid, &config, &graph)?
        }
        None => {
            info!("loading node config from configuration file");
            Neighbourhood::from_config(cli.uid, &config)?
        }
    };
    info!(
        uid = cli.uid,
        neighbours = neighbourhood.degree(),
        cluster = neighbourhood.cluster_size(),
        "loaded configuration"
    );

    let shutdown = ShutdownSignal::new();
    let (tx, rx) = mpsc::channel::<Message>(INBOUND_QUEUE);

    let dispatcher = Dispatcher::bind(&listen, tx)
        .await
        .with_context(|| format!("failed to bind listener on {listen}"))?;

    let ctx = Arc::new(NodeContext::new(
        cli.uid,
        Arc::new(neighbourhood),
        Arc::new(TcpTransport::new()),
        shutdown.clone(),
    ));

    let mut engine = Engine::new(Arc::clone(&ctx));
    engine.register(Arc::new(ControlExtension::new()));
    engine.register(Arc::new(DiscoveryExtension::new()));
    engine.register(Arc::new(RumorExtension::new()));
    engine.register(Arc::new(BankingExtension::new()));
    engine.register(Arc::new(ConsensusExtension::new(ConsensusKnobs {
        vote_initiators: cli.consensus_s,
        timestamp_range: cli.consensus_m,
        proposal_fanout: cli.consensus_p,
        max_accepted: cli.consensus_amax,
    })));

    engine.preflight().await.context("extension preflight failed")?;

    let dispatcher_shutdown = shutdown.clone();
    let dispatcher_task = tokio::spawn(async move {
        if let Err(err) = dispatcher.run(dispatcher_shutdown).await {
            error!(error = %err, "dispatcher failed");
        }
    });
    let engine_task = tokio::spawn(engine.run(rx));

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("received ctrl-c, shutting down");
            shutdown.trigger();
        }
        _ = shutdown.triggered() => {
            info!("control message triggered shutdown");
        }
    }

    let _ = dispatcher_task.await;
    let _ = engine_task.await;
    info!("bye bye");
    Ok(())
}
