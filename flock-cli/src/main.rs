//! flock, the operator CLI for a flock cluster.
//!
//! Usage:
//!   flock send --connect 127.0.0.1:4000 --payload STARTUP
//!   flock send --config ./config --payload SHUTDOWN
//!   flock graph generate --out graph.dot --nodes 6 --edges 10
//!   flock graph check graph.dot

use anyhow::Context;
use clap::{Parser, Subcommand};
use flock_topology::{ClusterConfig, CommGraph};
use flock_wire::{Message, MessageType, TcpTransport, Transport};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "flock")]
#[command(about = "Inject control messages into a flock cluster and manage graphs", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Send one message to a node, or to every node of a config
    Send {
        /// Cluster config; when given, the message goes to every node
        #[arg(long)]
        config: Option<String>,

        /// Target node when no config is given
        #[arg(long, default_value = "127.0.0.1:4000")]
        connect: String,

        /// Source UID to stamp on the message
        #[arg(long, default_value_t = 0)]
        uid: u32,

        /// Message type
        #[arg(long = "type", default_value = "CONTROL")]
        msg_type: MessageType,

        /// Message payload
        #[arg(long, default_value = "STARTUP")]
        payload: String,
    },

    /// Communication graph utilities
    Graph {
        #[command(subcommand)]
        action: GraphAction,
    },
}

#[derive(Subcommand)]
enum GraphAction {
    /// Generate a random communication graph in DOT form
    Generate {
        /// Output path
        #[arg(long, default_value = "./graph.dot")]
        out: String,

        /// Number of nodes
        #[arg(long, default_value_t = 6)]
        nodes: u32,

        /// Number of edges (n <= m <= n*(n-1)/2)
        #[arg(long, default_value_t = 10)]
        edges: u32,
    },

    /// Parse a graph file and report its shape
    Check {
        /// Graph path
        path: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    match Cli::parse().command {
        Commands::Send { config, connect, uid, msg_type, payload } => {
            send(config, connect, uid, msg_type, payload).await
        }
        Commands::Graph { action } => graph(action),
    }
}

async fn send(
    config: Option<String>,
    connect: String,
    uid: u32,
    msg_type: MessageType,
    payload: String,
) -> anyhow::Result<()> {
    let transport = TcpTransport::new();
    let msg = Message::new(uid, msg_type, payload);

    match config {
        Some(path) => {
            // Hit all nodes at roughly the same time.
            let cluster =
                ClusterConfig::load(&path).with_context(|| format!("failed loading config {path}"))?;
            let mut tasks = Vec::new();
            for (&node_uid, addr) in &cluster.nodes {
                let addr = addr.clone();
                let msg = msg.clone();
                tasks.push(tokio::spawn(async move {
                    let transport = TcpTransport::new();
                    if let Err(err) = transport.send(&addr, msg).await {
                        error!(uid = node_uid, %addr, error = %err, "request failed");
                    } else {
                        info!(uid = node_uid, %addr, "sent");
                    }
                }));
            }
            for task in tasks {
                let _ = task.await;
            }
        }
        None => {
            transport
                .send(&connect, msg)
                .await
                .with_context(|| format!("request to {connect} failed"))?;
            info!(%connect, "sent");
        }
    }
    Ok(())
}

fn graph(action: GraphAction) -> anyhow::Result<()> {
    match action {
        GraphAction::Generate { out, nodes, edges } => {
            info!(nodes, edges, "generating graph");
            let mut rng = StdRng::from_entropy();
            let graph = CommGraph::generate(nodes, edges, &mut rng)?;
            graph.save(&out).with_context(|| format!("failed writing {out}"))?;
            info!(path = %out, "stored generated graph");
        }
        GraphAction::Check { path } => {
            let graph = CommGraph::load(&path).with_context(|| format!("failed reading {path}"))?;
            info!(
                path = %path,
                nodes = graph.node_count(),
                edges = graph.edge_count(),
                "graph parsed"
            );
        }
    }
    Ok(())
}
