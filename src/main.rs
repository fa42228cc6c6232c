//! `streamnet`: run a tracker or a gossip node over iroh.
//!
//! # Usage
//!
//! ```bash
//! # Start a tracker and note the endpoint address it prints.
//! streamnet tracker
//!
//! # Start nodes pointing at it.
//! streamnet node --tracker '<tracker addr json>' --subscribe sensors:0 --publish-every 5
//! ```
//!
//! Log verbosity follows `RUST_LOG` (default `info`).

use std::str::FromStr;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use iroh::protocol::Router;
use iroh::{Endpoint, RelayMode};
use tokio::time::{self, Duration};
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use iroh_streamnet::net::{local_contact, parse_addr};
use iroh_streamnet::{
    derive_node_id, Contact, DhtConfig, DhtNode, DhtProtocolHandler, GossipProtocolHandler,
    IrohDhtNetwork, IrohTransport, MessageChain, Node, NodeConfig, StreamPartId, Tracker,
    TrackerConfig, DHT_ALPN, GOSSIP_ALPN,
};

/// A bootstrap peer given as its JSON endpoint address.
#[derive(Clone, Debug)]
struct BootstrapPeer(Contact);

impl FromStr for BootstrapPeer {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let addr = parse_addr(s).context("bootstrap peer must be a JSON endpoint address")?;
        Ok(Self(Contact::new(derive_node_id(addr.id.as_bytes()), s)))
    }
}

fn parse_stream_part(s: &str) -> Result<StreamPartId> {
    let (stream, partition) = s
        .rsplit_once(':')
        .context("stream partition must look like STREAM:PARTITION")?;
    let partition = partition.parse().context("invalid partition number")?;
    Ok(StreamPartId::new(stream, partition))
}

#[derive(Parser, Debug)]
#[command(name = "streamnet")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a tracker brokering neighbor introductions.
    Tracker(TrackerArgs),
    /// Run a gossip node.
    Node(NodeArgs),
}

#[derive(Args, Debug)]
struct TrackerArgs {
    /// Most candidates returned per neighbor request
    #[arg(long, default_value_t = iroh_streamnet::config::DEFAULT_MAX_NEIGHBORS)]
    max_neighbors: usize,

    /// Seed for candidate sampling
    #[arg(long)]
    seed: Option<u64>,
}

#[derive(Args, Debug)]
struct NodeArgs {
    /// JSON endpoint address of the tracker
    #[arg(short, long)]
    tracker: Option<String>,

    /// DHT entry points (JSON endpoint addresses)
    #[arg(short = 'B', long = "bootstrap", value_name = "PEER")]
    bootstrap: Vec<BootstrapPeer>,

    /// Partitions to join, as STREAM:PARTITION
    #[arg(short, long = "subscribe", value_parser = parse_stream_part)]
    subscribe: Vec<StreamPartId>,

    #[arg(long, default_value_t = iroh_streamnet::config::DEFAULT_TARGET_NEIGHBORS)]
    target_neighbors: usize,

    #[arg(long, default_value_t = iroh_streamnet::config::DEFAULT_MAX_NEIGHBORS)]
    max_neighbors: usize,

    /// Count peers as neighbors without waiting for their acknowledgement
    #[arg(long)]
    optimistic: bool,

    /// Publish a heartbeat message on every subscribed partition this often (seconds)
    #[arg(long)]
    publish_every: Option<u64>,

    #[arg(long, default_value = "60")]
    telemetry_interval: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Command::Tracker(args) => run_tracker(args).await,
        Command::Node(args) => run_node(args).await,
    }
}

async fn run_tracker(args: TrackerArgs) -> Result<()> {
    let endpoint = Endpoint::builder()
        .alpns(vec![GOSSIP_ALPN.to_vec()])
        .relay_mode(RelayMode::Default)
        .bind()
        .await?;
    let contact = local_contact(&endpoint)?;
    println!("Tracker started");
    println!("  NodeId (hex): {}", hex::encode(contact.id));
    println!("  Endpoint addr JSON: {}", contact.addr);

    let (transport, events) = IrohTransport::new(endpoint.clone(), contact);
    let router = Router::builder(endpoint.clone())
        .accept(GOSSIP_ALPN, GossipProtocolHandler::new(transport.clone()))
        .spawn();
    let tracker = Tracker::start(
        transport,
        events,
        TrackerConfig {
            max_neighbors_returned: args.max_neighbors,
            rng_seed: args.seed,
        },
    );

    tokio::signal::ctrl_c().await?;
    info!(nodes = tracker.node_count().await, "shutting down tracker");
    tracker.shutdown().await;
    router.shutdown().await?;
    Ok(())
}

async fn run_node(args: NodeArgs) -> Result<()> {
    let endpoint = Endpoint::builder()
        .alpns(vec![DHT_ALPN.to_vec(), GOSSIP_ALPN.to_vec()])
        .relay_mode(RelayMode::Default)
        .bind()
        .await?;
    let contact = local_contact(&endpoint)?;
    println!("Node started");
    println!("  NodeId (hex): {}", hex::encode(contact.id));
    println!("  Endpoint addr JSON: {}", contact.addr);

    let dht = Arc::new(DhtNode::new(
        contact.clone(),
        IrohDhtNetwork {
            endpoint: endpoint.clone(),
            self_contact: contact.clone(),
        },
        DhtConfig::default(),
    ));
    let (transport, events) = IrohTransport::new(endpoint.clone(), contact.clone());
    let router = Router::builder(endpoint.clone())
        .accept(DHT_ALPN, DhtProtocolHandler::new(dht.clone()))
        .accept(GOSSIP_ALPN, GossipProtocolHandler::new(transport.clone()))
        .spawn();

    let join_limit = dht.config().rpc_timeout * dht.config().max_rounds as u32;
    for peer in args.bootstrap {
        info!(peer = %hex::encode(&peer.0.id[..4]), "joining dht");
        match dht.join_dht_with_timeout(peer.0, join_limit).await {
            Ok(outcome) => info!(
                rounds = outcome.rounds,
                active = outcome.active_contacts,
                termination = ?outcome.termination,
                "dht join complete"
            ),
            Err(err) => warn!(error = %err, "dht join failed"),
        }
    }

    let mut config = NodeConfig {
        tracker: args.tracker,
        target_neighbors: args.target_neighbors,
        max_neighbors: args.max_neighbors,
        require_subscribe_ack: !args.optimistic,
        ..NodeConfig::default()
    };
    config.target_neighbors = config.target_neighbors.min(config.max_neighbors);
    let node = Node::start(transport, events, config);
    node.add_message_listener(|message| {
        info!(
            id = %message.id,
            bytes = message.content.len(),
            "message delivered"
        );
    });

    let mut chains = Vec::new();
    for stream in args.subscribe {
        if let Err(err) = node.subscribe(stream.clone()).await {
            warn!(%stream, error = %err, "subscribe failed; will retry");
        }
        chains.push(MessageChain::new(stream, &node.id()));
    }

    let mut telemetry = time::interval(Duration::from_secs(args.telemetry_interval.max(1)));
    let mut publish = time::interval(Duration::from_secs(args.publish_every.unwrap_or(1).max(1)));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("received shutdown signal, exiting gracefully");
                break;
            }
            _ = telemetry.tick() => {
                let overlay = node.telemetry().await;
                let routing = dht.telemetry().await;
                info!(
                    streams = overlay.streams,
                    neighbors = overlay.neighbors,
                    connections = overlay.connections,
                    dedup_entries = overlay.dedup_entries,
                    tracker = overlay.tracker_connected,
                    bucket = routing.bucket_size,
                    rpcs_in = routing.rpcs.incoming,
                    rpcs_out = routing.rpcs.outgoing,
                    "telemetry snapshot"
                );
            }
            _ = publish.tick(), if args.publish_every.is_some() => {
                let now = unix_millis();
                for chain in &mut chains {
                    let message = chain.next(now, format!("heartbeat {now}").into_bytes());
                    if let Err(err) = node.publish(message).await {
                        warn!(error = %err, "publish failed");
                    }
                }
            }
        }
    }

    node.shutdown().await;
    router.shutdown().await?;
    Ok(())
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
