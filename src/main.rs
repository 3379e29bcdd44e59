use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt};

use topology_net::{Keypair, Node, NodeConfig};

#[derive(Parser, Debug)]
#[command(name = "topology-net")]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(short, long = "listen", default_value = "0.0.0.0:0")]
    listen: Vec<SocketAddr>,

    /// Bootstrap peer as IP:PORT, IP:PORT/<hex id> or a multiaddr.
    #[arg(short = 'B', long = "bootstrap", value_name = "PEER")]
    bootstrap: Vec<String>,

    /// Topics to join. Lines read from stdin are published to the first one.
    #[arg(short, long = "topic", default_value = "chat")]
    topic: Vec<String>,

    /// Relay to hold a reservation on, as IP:PORT/<hex id>.
    #[arg(short, long = "relay", value_name = "RELAY")]
    relay: Vec<String>,

    /// Serve relay circuits for other peers.
    #[arg(long)]
    relay_server: bool,

    #[arg(long, default_value = "1000")]
    heartbeat_ms: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .init();

    let mut config = NodeConfig {
        listen: args.listen,
        bootstrap: args.bootstrap,
        relays: args.relay,
        relay_server: args.relay_server,
        ..NodeConfig::default()
    };
    config.gossip.heartbeat_interval = Duration::from_millis(args.heartbeat_ms);

    let node = Node::new(Keypair::generate(), config);
    let mut messages = node.messages().await?;
    let addrs = node.start().await.context("failed to start node")?;

    info!("Node identity: {}", node.identity());
    for addr in &addrs {
        info!("Listening on {}", addr);
    }
    for topic in &args.topic {
        node.subscribe(topic).await?;
    }
    let publish_topic = args.topic.first().cloned();

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal, exiting gracefully");
                break;
            }
            Some(message) = messages.recv() => {
                println!(
                    "[{}] {}: {}",
                    message.topic,
                    message.from.short(),
                    String::from_utf8_lossy(&message.data)
                );
            }
            line = lines.next_line(), if stdin_open => {
                match line {
                    Ok(Some(line)) if !line.trim().is_empty() => {
                        let Some(topic) = &publish_topic else { continue };
                        if let Err(e) = node.publish(topic, line.into_bytes()).await {
                            warn!(error = %e, "publish failed");
                        }
                    }
                    Ok(Some(_)) => {}
                    Ok(None) => stdin_open = false,
                    Err(e) => {
                        warn!(error = %e, "stdin closed");
                        stdin_open = false;
                    }
                }
            }
        }
    }

    node.stop().await?;
    Ok(())
}
