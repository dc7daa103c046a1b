//! E1.33 master node.
//!
//! Advertises this node as a master over DNS-SD, watches the cohort,
//! and pushes a status byte to every connected client once a second:
//! `'m'` while the local election says this node is the master, `'b'`
//! otherwise.

use std::collections::{HashMap, HashSet};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use clap::Parser;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use e133_discovery::{DiscoveryAgent, DiscoveryOptions, MasterEvent, MasterEventRx};
use e133_protocol::MasterEntry;
use e133_protocol::constants::{
    DEFAULT_MASTER_PRIORITY, DEFAULT_SCOPE, MASTER_ASSERTED, MASTER_RELEASED,
    MASTER_UPDATE_PERIOD,
};
use e133_responder::default_responder;
use e133_responder::mdns::local_ipv4_addrs;
use e133_tracker::MasterList;

const EXIT_USAGE: i32 = 64;
const EXIT_UNAVAILABLE: i32 = 69;

#[derive(Parser, Debug)]
#[command(name = "e133-master", about = "Advertise this node as an E1.33 master", version)]
struct Args {
    /// Master priority (0-127). Higher wins the election.
    #[arg(long, default_value_t = DEFAULT_MASTER_PRIORITY)]
    priority: u8,

    /// IPv4 address to listen on. Defaults to all interfaces.
    #[arg(long = "listen_ip", default_value = "")]
    listen_ip: String,

    /// TCP port to listen on (0 = assigned by the OS).
    #[arg(long = "listen_port", default_value_t = 0)]
    listen_port: u16,

    /// Discovery scope.
    #[arg(long, default_value = DEFAULT_SCOPE)]
    scope: String,

    /// Watch for other masters and run the local election.
    #[arg(long = "watch_masters", default_value_t = true, action = clap::ArgAction::Set)]
    watch_masters: bool,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    if args.priority > 127 {
        eprintln!("--priority must be in 0-127");
        std::process::exit(EXIT_USAGE);
    }
    let listen_ip = if args.listen_ip.is_empty() {
        Ipv4Addr::UNSPECIFIED
    } else {
        match args.listen_ip.parse() {
            Ok(ip) => ip,
            Err(_) => {
                eprintln!("--listen_ip must be an IPv4 address");
                std::process::exit(EXIT_USAGE);
            }
        }
    };

    if let Err(e) = run(args, listen_ip).await {
        tracing::error!("{e:#}");
        std::process::exit(EXIT_UNAVAILABLE);
    }
}

async fn run(args: Args, listen_ip: Ipv4Addr) -> anyhow::Result<()> {
    let listener = TcpListener::bind((listen_ip, args.listen_port)).await?;
    let listen_addr = match listener.local_addr()? {
        SocketAddr::V4(v4) => v4,
        other => anyhow::bail!("unexpected listen address family: {other}"),
    };
    info!(address = %listen_addr, "listening");

    let responder = default_responder();
    let mut agent = DiscoveryAgent::new(
        responder,
        DiscoveryOptions {
            scope: args.scope.clone(),
            watch_masters: args.watch_masters,
        },
    );
    let events = agent.take_events();
    agent.start().await?;

    let entry = MasterEntry {
        service_name: "Master".into(),
        address: listen_addr,
        priority: args.priority,
        scope: args.scope.clone(),
    };
    agent.register_master(&entry)?;

    let mut server = MasterServer::new(listen_addr);
    server.serve(listener, events).await;

    let _ = agent.deregister_master(listen_addr);
    agent.stop().await;
    info!("master shut down cleanly");
    Ok(())
}

struct MasterServer {
    listen_addr: SocketAddrV4,
    local_ips: HashSet<Ipv4Addr>,
    list: MasterList,
    is_master: bool,
    clients: HashMap<SocketAddr, OwnedWriteHalf>,
}

impl MasterServer {
    fn new(listen_addr: SocketAddrV4) -> Self {
        let mut local_ips: HashSet<Ipv4Addr> = local_ipv4_addrs().into_iter().collect();
        if *listen_addr.ip() != Ipv4Addr::UNSPECIFIED {
            local_ips.insert(*listen_addr.ip());
        }

        Self {
            listen_addr,
            local_ips,
            list: MasterList::new(),
            is_master: false,
            clients: HashMap::new(),
        }
    }

    /// Runs the accept/update loop until interrupted.
    async fn serve(&mut self, listener: TcpListener, events: Option<MasterEventRx>) {
        let mut events = events;
        let (closed_tx, mut closed_rx) = mpsc::unbounded_channel();
        let mut ticker = tokio::time::interval(MASTER_UPDATE_PERIOD);
        ticker.tick().await; // consume first immediate tick

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("interrupt received; shutting down");
                    return;
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => self.on_client_connect(stream, peer, &closed_tx),
                    Err(e) => warn!("accept failed: {e}"),
                },
                event = recv_event(&mut events) => {
                    let (event, entry) = event;
                    self.on_master_event(event, &entry);
                }
                Some(peer) = closed_rx.recv() => {
                    if self.clients.remove(&peer).is_some() {
                        info!(client = %peer, "client disconnected");
                    }
                }
                _ = ticker.tick() => self.update_clients().await,
            }
        }
    }

    fn on_client_connect(
        &mut self,
        stream: TcpStream,
        peer: SocketAddr,
        closed_tx: &mpsc::UnboundedSender<SocketAddr>,
    ) {
        info!(client = %peer, "new client connection");
        let (read_half, write_half) = stream.into_split();
        self.clients.insert(peer, write_half);
        tokio::spawn(client_read_loop(peer, read_half, closed_tx.clone()));
    }

    fn on_master_event(&mut self, event: MasterEvent, entry: &MasterEntry) {
        info!(
            event = match event {
                MasterEvent::Added => "add/update",
                MasterEvent::Removed => "remove",
            },
            master = %entry,
            "master change"
        );
        self.list.apply(event, entry);

        let am_master = self
            .list
            .elect()
            .is_some_and(|elected| elected.is_local(&self.local_ips, self.listen_addr.port()));
        if am_master != self.is_master {
            if am_master {
                info!("this node is now the master");
            } else {
                info!("this node is no longer the master");
            }
            self.is_master = am_master;
        }
    }

    /// Pushes the current status byte to every connected client.
    async fn update_clients(&mut self) {
        let status = if self.is_master {
            MASTER_ASSERTED
        } else {
            MASTER_RELEASED
        };

        let mut dead = Vec::new();
        for (peer, writer) in &mut self.clients {
            if let Err(e) = writer.write_all(&[status]).await {
                debug!(client = %peer, "write failed: {e}");
                dead.push(*peer);
            }
        }
        for peer in dead {
            self.clients.remove(&peer);
        }
    }
}

/// Waits for the next discovery event; pends forever when watching is
/// disabled so the select loop ignores this arm.
async fn recv_event(events: &mut Option<MasterEventRx>) -> (MasterEvent, MasterEntry) {
    match events {
        Some(rx) => match rx.recv().await {
            Some(event) => event,
            None => std::future::pending().await,
        },
        None => std::future::pending().await,
    }
}

/// Logs whatever clients send; the protocol assigns it no meaning.
async fn client_read_loop(
    peer: SocketAddr,
    mut read_half: tokio::net::tcp::OwnedReadHalf,
    closed_tx: mpsc::UnboundedSender<SocketAddr>,
) {
    let mut buf = [0u8; 1];
    loop {
        match read_half.read(&mut buf).await {
            Ok(0) | Err(_) => {
                let _ = closed_tx.send(peer);
                return;
            }
            Ok(_) => debug!(client = %peer, byte = format_args!("{:#04x}", buf[0]), "client data"),
        }
    }
}
