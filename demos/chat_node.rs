use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::anyhow;
use clap::Parser;
use clap_derive::Parser;
use ordercast::messaging::delivery_events::DeliveryEvent;
use ordercast::messaging::node_id::NodeId;
use ordercast::node::node::{Node, SendMode};
use ordercast::node::node_config::NodeConfig;
use ordercast::ordering::Delivery;
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};
use tokio::select;
use tracing::{info, warn, Level};

/// An interactive chat participant. All participants must be started with the same node list.
#[derive(Parser)]
struct Args {
    /// this node's position in the node list
    node_id: usize,

    /// participant addresses in NodeId order; defaults to three nodes on localhost
    #[clap(long)]
    node: Vec<String>,

    #[clap(short, long, default_value_t = false)]
    verbose: bool,

    #[clap(long, default_value_t = false)]
    very_verbose: bool,
}

const DEFAULT_NODES: [&str; 3] = ["127.0.0.1:5000", "127.0.0.1:5001", "127.0.0.1:5002"];

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level = match (args.verbose, args.very_verbose) {
        (_, true) => Level::TRACE,
        (true, _) => Level::DEBUG,
        (false, false) => Level::INFO,
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .try_init()
        .ok();

    let node_strings = if args.node.is_empty() {
        DEFAULT_NODES.iter().map(|s| s.to_string()).collect()
    }
    else {
        args.node
    };
    let mut participants = Vec::new();
    for s in node_strings {
        let addr: SocketAddr = s.parse()?;
        participants.push(addr);
    }

    if args.node_id >= participants.len() {
        return Err(anyhow!("invalid node id - must be between 0 and {}", participants.len() - 1));
    }

    let config = NodeConfig::new(NodeId(args.node_id), participants);
    let num_nodes = config.num_nodes();
    let node = Node::new(config, Arc::new(|delivery: Delivery| println!("\n{}\n", delivery))).await?;
    node.start().await?;
    info!("chat node {} started on {:?}", args.node_id, node.local_addr()?);

    let mut events = node.subscribe();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    const PROMPT: &str = "\nType 'b' for broadcast or enter ID for private message:";
    println!("{}", PROMPT);
    loop {
        select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => {
                match event {
                    Ok(DeliveryEvent::BroadcastCompleted(completion)) => info!("broadcast {} delivered to {}", completion.id, completion),
                    Ok(DeliveryEvent::NotAcknowledged(data)) => warn!("message {} to {:?} not acknowledged", data.id, data.recipient),
                    Ok(DeliveryEvent::DependencyUnresolved(stalled)) => warn!("message {} from node {} is still waiting for {:?}", stalled.id, stalled.sender, stalled.missing),
                    Err(e) => warn!("missed events: {}", e),
                }
            }
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                if let Err(e) = handle_command(&node, num_nodes, line.trim(), &mut lines).await {
                    println!("{}", e);
                }
                println!("{}", PROMPT);
            }
        }
    }

    node.stop().await;
    Ok(())
}

async fn handle_command(node: &Node, num_nodes: usize, command: &str, lines: &mut Lines<BufReader<Stdin>>) -> anyhow::Result<()> {
    let mode = if command == "b" {
        println!("Broadcast message:");
        SendMode::Broadcast
    }
    else if let Ok(target) = command.parse::<usize>() {
        if target >= num_nodes {
            return Err(anyhow!("Invalid node ID."));
        }
        println!("Private message to Node {}:", target);
        SendMode::Private(NodeId(target))
    }
    else {
        return Err(anyhow!("Invalid input."));
    };

    let content = lines.next_line().await?
        .ok_or_else(|| anyhow!("end of input"))?;
    node.send(content, mode).await?;
    Ok(())
}
