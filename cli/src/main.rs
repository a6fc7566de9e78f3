use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    path::PathBuf,
    process,
    time::Duration,
};

use clap::{Parser, Subcommand};
use golnet::{
    broker::{self, discovery::Discovery, BrokerClient},
    driver::{Command, Distributor, Event, Io, LiveView, Params},
    net::{ip_addr_to_socket_addr, tls, Endpoint, BROKER_PORT, NODE_PORT},
    node, Error,
};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    sync::mpsc,
};
use tracing::{debug, error, info, warn};

/// Conway's Game of Life across a cluster of compute nodes.
#[derive(Debug, Parser)]
#[command(name = "golnet", version)]
struct Args {
    #[command(subcommand)]
    role: Role,
}

#[derive(Debug, Subcommand)]
enum Role {
    /// Serve a compute node.
    Node {
        #[arg(long, env = "GOLNET_NODE_PORT", default_value_t = NODE_PORT)]
        port: u16,
    },
    /// Serve the broker over the compute nodes it can reach at start-up.
    Broker {
        #[arg(long, env = "GOLNET_BROKER_PORT", default_value_t = BROKER_PORT)]
        port: u16,
        /// Host probed for compute nodes.
        #[arg(long, default_value_t = IpAddr::V4(Ipv4Addr::LOCALHOST))]
        host: IpAddr,
        #[arg(long, default_value_t = NODE_PORT)]
        start_port: u16,
        #[arg(long, default_value_t = NODE_PORT + 10)]
        end_port: u16,
        /// A compute node to use whether or not the probe finds it.
        #[arg(long = "node")]
        nodes: Vec<SocketAddr>,
        #[arg(long, default_value_t = 500)]
        probe_timeout_ms: u64,
        /// PEM certificate chain. Without one a self-signed certificate is
        /// used.
        #[arg(long, requires = "key")]
        cert: Option<PathBuf>,
        #[arg(long, requires = "cert")]
        key: Option<PathBuf>,
    },
    /// Drive one run against a broker.
    Run {
        #[arg(long, env = "GOLNET_BROKER", default_value = "127.0.0.1:8030")]
        broker: SocketAddr,
        #[arg(short, long, default_value_t = 8)]
        threads: u32,
        #[arg(short = 'W', long, default_value_t = 512)]
        width: u32,
        #[arg(short = 'H', long, default_value_t = 512)]
        height: u32,
        #[arg(long, default_value_t = 10_000_000)]
        turns: u32,
        /// Log events instead of keeping a live view.
        #[arg(long)]
        no_vis: bool,
        /// Seed randomly instead of reading an image.
        #[arg(long)]
        random: bool,
        #[arg(long, default_value = "images")]
        images: PathBuf,
        #[arg(long, default_value = "out")]
        out: PathBuf,
        #[arg(long, default_value_t = 5)]
        live_view_ms: u64,
        #[arg(long, default_value_t = 2000)]
        alive_count_ms: u64,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let args = Args::parse();
    let result = match args.role {
        Role::Node { port } => {
            let any = IpAddr::V4(Ipv4Addr::UNSPECIFIED);
            node::run(ip_addr_to_socket_addr(any, port)).await
        }
        Role::Broker {
            port,
            host,
            start_port,
            end_port,
            nodes,
            probe_timeout_ms,
            cert,
            key,
        } => {
            let discovery = Discovery::builder()
                .host(host)
                .ports(start_port..=end_port)
                .nodes(nodes)
                .probe_timeout(Duration::from_millis(probe_timeout_ms))
                .build();
            serve_broker(port, discovery, cert.zip(key)).await
        }
        Role::Run {
            broker,
            threads,
            width,
            height,
            turns,
            no_vis,
            random,
            images,
            out,
            live_view_ms,
            alive_count_ms,
        } => {
            let params = Params::builder()
                .turns(turns)
                .threads(threads)
                .width(width)
                .height(height)
                .random(random)
                .live_view(Duration::from_millis(live_view_ms))
                .alive_count(Duration::from_millis(alive_count_ms))
                .build();
            drive(broker, params, images, out, no_vis).await
        }
    };

    // The stdin reader never returns on its own, so exit explicitly.
    match result {
        Ok(()) => process::exit(0),
        Err(e) => {
            error!("{e}");
            process::exit(1);
        }
    }
}

async fn serve_broker(
    port: u16,
    discovery: Discovery,
    pem: Option<(PathBuf, PathBuf)>,
) -> Result<(), Error> {
    let addr = ip_addr_to_socket_addr(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port);
    let endpoint = match pem {
        Some((cert, key)) => {
            let (chain, key) = tls::load_pem(&cert, &key)?;
            Endpoint::server_with_cert(addr, chain, key)?
        }
        None => Endpoint::server(addr)?,
    };
    let nodes = discovery.discover(&endpoint).await;
    broker::run(endpoint, nodes).await
}

async fn drive(
    broker_addr: SocketAddr,
    params: Params,
    images: PathBuf,
    out: PathBuf,
    no_vis: bool,
) -> Result<(), Error> {
    let endpoint = Endpoint::client_for(broker_addr)?;
    let broker = BrokerClient::connect(&endpoint, broker_addr).await?;
    let (io, _) = Io::spawn(images, out);

    let (events_tx, events_rx) = mpsc::channel(1024);
    let (commands_tx, commands_rx) = mpsc::channel(16);
    tokio::spawn(read_commands(commands_tx));
    let viewer = tokio::spawn(present(events_rx, no_vis));

    let outcome = Distributor::new(params, broker, io, events_tx)
        .run(commands_rx)
        .await?;
    viewer.await?;
    info!(?outcome, "run ended");
    Ok(())
}

/// Reads one command per line: `p` pause or resume, `r` resume, `s` save,
/// `q` quit, `k` kill.
async fn read_commands(commands: mpsc::Sender<Command>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let Some(key) = line.trim().chars().next() else {
            continue;
        };
        match Command::from_key(key) {
            Some(command) => {
                if commands.send(command).await.is_err() {
                    break;
                }
            }
            None => warn!(%key, "unknown command"),
        }
    }
}

async fn present(mut events: mpsc::Receiver<Event>, no_vis: bool) {
    let mut view = LiveView::new();
    while let Some(event) = events.recv().await {
        if !no_vis {
            view.apply(&event);
        }
        match &event {
            Event::CellFlipped { .. } => {}
            Event::TurnComplete { turn } => {
                debug!(turn, alive = view.alive_count(), "turn complete")
            }
            Event::AliveCellsCount { turn, count } => {
                info!(turn, count, "alive cells")
            }
            Event::StateChange { turn, state } => {
                info!(turn, %state, "state changed")
            }
            Event::ImageOutputComplete { filename, .. } => {
                info!(%filename, "image saved")
            }
            Event::FinalTurnComplete { turn, alive } => {
                info!(turn, alive = alive.len(), "final turn complete")
            }
        }
    }
}
