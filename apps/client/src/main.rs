//! Passive E1.33 master watcher.
//!
//! Discovers the masters in one scope, follows the local election, and
//! reports mastership assertions and divergences from the TCP status
//! stream each master pushes.

use std::time::Duration;

use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use e133_discovery::{DiscoveryAgent, DiscoveryOptions};
use e133_protocol::constants::DEFAULT_SCOPE;
use e133_responder::default_responder;
use e133_tracker::{MasterTracker, TrackerConfig, TrackerEvent};

const EXIT_UNAVAILABLE: i32 = 69;

#[derive(Parser, Debug)]
#[command(name = "e133-client", about = "Watch E1.33 masters in a scope", version)]
struct Args {
    /// Discovery scope.
    #[arg(long, default_value = DEFAULT_SCOPE)]
    scope: String,

    /// TCP connect timeout in seconds.
    #[arg(long = "tcp_connect_timeout", default_value_t = 5)]
    tcp_connect_timeout: u64,

    /// Interval between reconnection attempts in seconds.
    #[arg(long = "tcp_retry_interval", default_value_t = 5)]
    tcp_retry_interval: u64,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    if let Err(e) = run(args).await {
        tracing::error!("{e:#}");
        std::process::exit(EXIT_UNAVAILABLE);
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    let responder = default_responder();
    let mut agent = DiscoveryAgent::new(
        responder,
        DiscoveryOptions {
            scope: args.scope.clone(),
            watch_masters: true,
        },
    );
    let discovery_events = agent
        .take_events()
        .ok_or_else(|| anyhow::anyhow!("discovery event stream already taken"))?;
    agent.start().await?;
    info!(scope = %args.scope, "watching masters");

    let mut tracker = MasterTracker::new(TrackerConfig {
        connect_timeout: Duration::from_secs(args.tcp_connect_timeout),
        retry_interval: Duration::from_secs(args.tcp_retry_interval),
    });
    let mut events = tracker
        .take_events()
        .ok_or_else(|| anyhow::anyhow!("tracker event stream already taken"))?;
    tracker.start(discovery_events);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupt received; shutting down");
                break;
            }
            event = events.recv() => match event {
                Some(event) => report(event),
                None => break,
            },
        }
    }

    tracker.stop().await;
    agent.stop().await;
    info!("client shut down cleanly");
    Ok(())
}

fn report(event: TrackerEvent) {
    match event {
        TrackerEvent::ElectedChanged { master: Some(m) } => {
            info!(master = %m.service_name, address = %m.address, priority = m.priority, "elected master");
        }
        TrackerEvent::ElectedChanged { master: None } => {
            info!("no electable master");
        }
        TrackerEvent::MastershipAsserted { master, previous: Some(previous) } => {
            warn!(from = %previous, to = %master, "mastership stolen");
        }
        TrackerEvent::MastershipAsserted { master, previous: None } => {
            info!(master = %master, "mastership asserted");
        }
        TrackerEvent::MastershipReleased { master } => {
            info!(master = %master, "mastership released");
        }
        TrackerEvent::Divergence { elected, asserted } => {
            warn!(?elected, ?asserted, "elected and asserted masters diverge");
        }
    }
}
