//! The supervisor loop: peer table, election, and per-master sockets.

use std::collections::HashMap;
use std::net::SocketAddrV4;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use e133_discovery::{MasterEvent, MasterEventRx};
use e133_protocol::MasterEntry;
use e133_protocol::constants::{
    MASTER_ASSERTED, MASTER_RELEASED, TCP_CONNECT_TIMEOUT, TCP_RETRY_INTERVAL,
};

use crate::connector::{BackoffPolicy, Connector};
use crate::election::{Elected, MasterList};

/// Connection tuning for the tracker.
#[derive(Debug, Clone)]
pub struct TrackerConfig {
    pub connect_timeout: Duration,
    pub retry_interval: Duration,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            connect_timeout: TCP_CONNECT_TIMEOUT,
            retry_interval: TCP_RETRY_INTERVAL,
        }
    }
}

/// High-level state changes surfaced to the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackerEvent {
    /// The locally-computed election produced a different master.
    ElectedChanged { master: Option<Elected> },
    /// A connected peer declared itself master. `previous` is set when
    /// this stole mastership from another peer.
    MastershipAsserted {
        master: SocketAddrV4,
        previous: Option<SocketAddrV4>,
    },
    /// The asserting peer withdrew its claim.
    MastershipReleased { master: SocketAddrV4 },
    /// Elected and asserted masters disagree.
    Divergence {
        elected: Option<SocketAddrV4>,
        asserted: Option<SocketAddrV4>,
    },
}

/// Stream of tracker events, one receiver per tracker.
pub type TrackerEventRx = mpsc::UnboundedReceiver<TrackerEvent>;

enum SocketMsg {
    Data(u8),
    Closed,
}

/// Watches masters in one scope and supervises connections to them.
pub struct MasterTracker {
    config: TrackerConfig,
    events_tx: mpsc::UnboundedSender<TrackerEvent>,
    events_rx: Option<TrackerEventRx>,
    cancel: Option<CancellationToken>,
    task: Option<JoinHandle<()>>,
}

impl MasterTracker {
    pub fn new(config: TrackerConfig) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            config,
            events_tx,
            events_rx: Some(events_rx),
            cancel: None,
            task: None,
        }
    }

    /// Takes the event receiver. Can only be called once.
    pub fn take_events(&mut self) -> Option<TrackerEventRx> {
        self.events_rx.take()
    }

    /// Spawns the supervisor loop over the given discovery stream.
    ///
    /// # Panics
    ///
    /// Starting an already-started tracker is a programming error and
    /// panics.
    pub fn start(&mut self, mut discovery_rx: MasterEventRx) {
        assert!(self.task.is_none(), "MasterTracker started twice");

        let (connector, mut connects_rx) = Connector::new(
            BackoffPolicy::Constant(self.config.retry_interval),
            self.config.connect_timeout,
        );
        let (socket_tx, mut socket_rx) = mpsc::unbounded_channel();
        let mut state = TrackerState::new(connector, socket_tx, self.events_tx.clone());

        let cancel = CancellationToken::new();
        let loop_cancel = cancel.clone();
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = loop_cancel.cancelled() => break,
                    event = discovery_rx.recv() => match event {
                        Some((event, entry)) => state.on_discovery(event, &entry),
                        None => break,
                    },
                    connect = connects_rx.recv() => {
                        if let Some((addr, stream)) = connect {
                            state.on_connect(addr, stream);
                        }
                    }
                    msg = socket_rx.recv() => {
                        if let Some((addr, msg)) = msg {
                            state.on_socket(addr, msg);
                        }
                    }
                }
            }
            state.shutdown();
        });

        self.cancel = Some(cancel);
        self.task = Some(task);
    }

    /// Stops the loop, the connector, and every socket.
    pub async fn stop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel.cancel();
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

struct PeerSocket {
    cancel: CancellationToken,
    /// Held to keep the write direction open; the protocol only reads.
    _writer: OwnedWriteHalf,
}

/// Loop-owned tracker state.
struct TrackerState {
    list: MasterList,
    sockets: HashMap<SocketAddrV4, PeerSocket>,
    connector: Connector,
    socket_tx: mpsc::UnboundedSender<(SocketAddrV4, SocketMsg)>,
    events_tx: mpsc::UnboundedSender<TrackerEvent>,
    elected: Option<Elected>,
    asserted: Option<SocketAddrV4>,
}

impl TrackerState {
    fn new(
        connector: Connector,
        socket_tx: mpsc::UnboundedSender<(SocketAddrV4, SocketMsg)>,
        events_tx: mpsc::UnboundedSender<TrackerEvent>,
    ) -> Self {
        Self {
            list: MasterList::new(),
            sockets: HashMap::new(),
            connector,
            socket_tx,
            events_tx,
            elected: None,
            asserted: None,
        }
    }

    fn on_discovery(&mut self, event: MasterEvent, entry: &MasterEntry) {
        match event {
            MasterEvent::Added => {
                let previous = self.list.get(&entry.service_name).map(|m| m.address);
                self.list.apply(event, entry);

                if previous != Some(entry.address) {
                    if let Some(old) = previous {
                        self.drop_socket(old);
                        self.connector.disconnect(old, true);
                    }
                    if entry.has_concrete_address() {
                        self.connector.add_endpoint(entry.address);
                    }
                }
            }
            MasterEvent::Removed => {
                self.list.apply(event, entry);
                self.drop_socket(entry.address);
                self.connector.disconnect(entry.address, true);
            }
        }
        self.recompute_election();
    }

    fn on_connect(&mut self, addr: SocketAddrV4, stream: TcpStream) {
        let known = self.list.iter().any(|(_, m)| m.address == addr);
        if !known {
            debug!(peer = %addr, "socket for unknown master; closing");
            return;
        }

        if let Some(existing) = self.sockets.remove(&addr) {
            warn!(peer = %addr, "duplicate socket to master; closing both");
            existing.cancel.cancel();
            self.connector.disconnect(addr, false);
            return;
        }

        info!(peer = %addr, "connected to master");
        let (read_half, write_half) = stream.into_split();
        let cancel = CancellationToken::new();
        tokio::spawn(read_pump(
            addr,
            read_half,
            self.socket_tx.clone(),
            cancel.clone(),
        ));
        self.sockets.insert(
            addr,
            PeerSocket {
                cancel,
                _writer: write_half,
            },
        );
    }

    fn on_socket(&mut self, addr: SocketAddrV4, msg: SocketMsg) {
        match msg {
            SocketMsg::Data(MASTER_ASSERTED) => {
                if self.asserted == Some(addr) {
                    return;
                }
                let previous = self.asserted;
                if let Some(previous) = previous {
                    warn!(from = %previous, to = %addr, "mastership stolen");
                }
                self.asserted = Some(addr);
                let _ = self.events_tx.send(TrackerEvent::MastershipAsserted {
                    master: addr,
                    previous,
                });
                self.check_divergence();
            }
            SocketMsg::Data(MASTER_RELEASED) => {
                if self.asserted == Some(addr) {
                    info!(peer = %addr, "master released mastership");
                    self.asserted = None;
                    let _ = self
                        .events_tx
                        .send(TrackerEvent::MastershipReleased { master: addr });
                }
            }
            SocketMsg::Data(byte) => {
                debug!(peer = %addr, byte = format_args!("{byte:#04x}"), "ignoring status byte");
            }
            SocketMsg::Closed => {
                if self.sockets.remove(&addr).is_some() {
                    debug!(peer = %addr, "socket closed; scheduling reconnect");
                    self.connector.disconnect(addr, false);
                }
            }
        }
    }

    fn recompute_election(&mut self) {
        let elected = self.list.elect();
        if elected == self.elected {
            return;
        }
        match &elected {
            Some(m) => info!(master = %m.service_name, address = %m.address, "elected master"),
            None => info!("no electable master"),
        }
        self.elected = elected.clone();
        let _ = self
            .events_tx
            .send(TrackerEvent::ElectedChanged { master: elected });
        self.check_divergence();
    }

    fn check_divergence(&mut self) {
        let elected = self.elected.as_ref().map(|m| m.address);
        if elected == self.asserted || (elected.is_none() && self.asserted.is_none()) {
            return;
        }
        warn!(
            elected = ?elected,
            asserted = ?self.asserted,
            "elected and asserted masters diverge"
        );
        let _ = self.events_tx.send(TrackerEvent::Divergence {
            elected,
            asserted: self.asserted,
        });
    }

    fn drop_socket(&mut self, addr: SocketAddrV4) {
        if let Some(socket) = self.sockets.remove(&addr) {
            socket.cancel.cancel();
        }
    }

    fn shutdown(&mut self) {
        for (_, socket) in self.sockets.drain() {
            socket.cancel.cancel();
        }
        self.connector.shutdown();
    }
}

/// Reads status bytes one at a time and reports them to the loop.
///
/// A failed read contributes no byte; the socket is reported closed
/// instead.
async fn read_pump<R>(
    addr: SocketAddrV4,
    mut read: R,
    tx: mpsc::UnboundedSender<(SocketAddrV4, SocketMsg)>,
    cancel: CancellationToken,
) where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut buf = [0u8; 1];
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            result = read.read(&mut buf) => match result {
                Ok(0) => {
                    let _ = tx.send((addr, SocketMsg::Closed));
                    return;
                }
                Ok(_) => {
                    let _ = tx.send((addr, SocketMsg::Data(buf[0])));
                }
                Err(e) => {
                    debug!(peer = %addr, "read error: {e}");
                    let _ = tx.send((addr, SocketMsg::Closed));
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::time::Duration;

    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    use super::*;

    struct Harness {
        state: TrackerState,
        events: TrackerEventRx,
        sockets: mpsc::UnboundedReceiver<(SocketAddrV4, SocketMsg)>,
        connects: mpsc::UnboundedReceiver<(SocketAddrV4, TcpStream)>,
    }

    fn harness() -> Harness {
        let (connector, connects) = Connector::new(
            BackoffPolicy::Constant(Duration::from_millis(50)),
            Duration::from_secs(1),
        );
        let (socket_tx, sockets) = mpsc::unbounded_channel();
        let (events_tx, events) = mpsc::unbounded_channel();
        Harness {
            state: TrackerState::new(connector, socket_tx, events_tx),
            events,
            sockets,
            connects,
        }
    }

    impl Harness {
        /// Feeds socket messages back into the state until one matching
        /// event arrives.
        async fn pump_until_event(&mut self) -> TrackerEvent {
            loop {
                if let Ok(event) = self.events.try_recv() {
                    return event;
                }
                let (addr, msg) =
                    tokio::time::timeout(Duration::from_secs(1), self.sockets.recv())
                        .await
                        .expect("timed out waiting for socket traffic")
                        .expect("socket channel closed");
                self.state.on_socket(addr, msg);
            }
        }

        /// Installs the next `count` sockets the connector established.
        /// Dial completion order across peers is not deterministic, so
        /// this drains whatever arrives.
        async fn install_connections(&mut self, count: usize) {
            for _ in 0..count {
                let (peer, stream) =
                    tokio::time::timeout(Duration::from_secs(1), self.connects.recv())
                        .await
                        .expect("timed out waiting for connector dial")
                        .expect("connects channel closed");
                self.state.on_connect(peer, stream);
            }
        }
    }

    fn entry(name: &str, addr: SocketAddrV4, priority: u8) -> MasterEntry {
        MasterEntry {
            service_name: name.into(),
            address: addr,
            priority,
            scope: "default".into(),
        }
    }

    async fn listener() -> (TcpListener, SocketAddrV4) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = match listener.local_addr().unwrap() {
            SocketAddr::V4(v4) => v4,
            other => panic!("unexpected address family: {other}"),
        };
        (listener, addr)
    }

    /// Hands the tracker a socket that did not come from its connector,
    /// e.g. for masters it was never told about.
    async fn attach_manual(
        harness: &mut Harness,
        listener: &TcpListener,
        addr: SocketAddrV4,
    ) -> TcpStream {
        let client = TcpStream::connect(SocketAddr::V4(addr)).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        harness.state.on_connect(addr, client);
        server
    }

    #[tokio::test]
    async fn election_changes_once_per_preemption() {
        let mut h = harness();
        let a: SocketAddrV4 = "10.0.0.5:9000".parse().unwrap();
        let b: SocketAddrV4 = "10.0.0.6:9000".parse().unwrap();

        h.state.on_discovery(MasterEvent::Added, &entry("MasterA-50", a, 50));
        assert_eq!(
            h.events.try_recv().unwrap(),
            TrackerEvent::ElectedChanged {
                master: Some(Elected {
                    service_name: "MasterA-50".into(),
                    address: a,
                    priority: 50,
                })
            }
        );
        // With nothing asserted yet the election also reports divergence.
        while h.events.try_recv().is_ok() {}

        h.state.on_discovery(MasterEvent::Added, &entry("MasterB-80", b, 80));
        assert_eq!(
            h.events.try_recv().unwrap(),
            TrackerEvent::ElectedChanged {
                master: Some(Elected {
                    service_name: "MasterB-80".into(),
                    address: b,
                    priority: 80,
                })
            }
        );
        while h.events.try_recv().is_ok() {}

        // Re-announcing the loser changes nothing.
        h.state.on_discovery(MasterEvent::Added, &entry("MasterA-50", a, 50));
        assert!(h.events.try_recv().is_err());
    }

    #[tokio::test]
    async fn wildcard_peer_is_not_elected_or_dialed() {
        let mut h = harness();
        let wildcard: SocketAddrV4 = "0.0.0.0:9000".parse().unwrap();

        h.state
            .on_discovery(MasterEvent::Added, &entry("MasterC-90", wildcard, 90));
        assert!(h.events.try_recv().is_err());
        assert!(!h.state.connector.has_endpoint(wildcard));
    }

    #[tokio::test]
    async fn discovery_adds_and_removes_endpoints() {
        let mut h = harness();
        let a: SocketAddrV4 = "10.0.0.5:9000".parse().unwrap();

        h.state.on_discovery(MasterEvent::Added, &entry("MasterA-50", a, 50));
        assert!(h.state.connector.has_endpoint(a));

        h.state
            .on_discovery(MasterEvent::Removed, &entry("MasterA-50", a, 50));
        assert!(!h.state.connector.has_endpoint(a));
    }

    #[tokio::test]
    async fn address_change_redials_the_new_endpoint() {
        let mut h = harness();
        let old: SocketAddrV4 = "10.0.0.5:9000".parse().unwrap();
        let new: SocketAddrV4 = "10.0.0.7:9000".parse().unwrap();

        h.state.on_discovery(MasterEvent::Added, &entry("MasterA-50", old, 50));
        h.state.on_discovery(MasterEvent::Added, &entry("MasterA-50", new, 50));

        assert!(!h.state.connector.has_endpoint(old));
        assert!(h.state.connector.has_endpoint(new));
    }

    #[tokio::test]
    async fn stolen_mastership_transitions_asserted_master() {
        let mut h = harness();
        let (listener1, p1) = listener().await;
        let (listener2, p2) = listener().await;

        h.state.on_discovery(MasterEvent::Added, &entry("P1", p1, 50));
        h.state.on_discovery(MasterEvent::Added, &entry("P2", p2, 80));
        while h.events.try_recv().is_ok() {}

        h.install_connections(2).await;
        let (mut s1, _) = listener1.accept().await.unwrap();
        let (mut s2, _) = listener2.accept().await.unwrap();

        s2.write_all(&[MASTER_ASSERTED]).await.unwrap();
        let event = h.pump_until_event().await;
        assert_eq!(
            event,
            TrackerEvent::MastershipAsserted {
                master: p2,
                previous: None,
            }
        );

        s1.write_all(&[MASTER_ASSERTED]).await.unwrap();
        let event = h.pump_until_event().await;
        assert_eq!(
            event,
            TrackerEvent::MastershipAsserted {
                master: p1,
                previous: Some(p2),
            }
        );
    }

    #[tokio::test]
    async fn release_clears_only_the_asserting_master() {
        let mut h = harness();
        let (listener1, p1) = listener().await;
        let (listener2, p2) = listener().await;

        h.state.on_discovery(MasterEvent::Added, &entry("P1", p1, 50));
        h.state.on_discovery(MasterEvent::Added, &entry("P2", p2, 80));
        while h.events.try_recv().is_ok() {}

        h.install_connections(2).await;
        let (mut s1, _) = listener1.accept().await.unwrap();
        let (mut s2, _) = listener2.accept().await.unwrap();

        s2.write_all(&[MASTER_ASSERTED]).await.unwrap();
        h.pump_until_event().await;

        // A release from a non-asserting peer changes nothing.
        s1.write_all(&[MASTER_RELEASED]).await.unwrap();
        s2.write_all(&[MASTER_RELEASED]).await.unwrap();
        let event = h.pump_until_event().await;
        assert_eq!(event, TrackerEvent::MastershipReleased { master: p2 });
    }

    #[tokio::test]
    async fn unknown_status_bytes_keep_the_connection() {
        let mut h = harness();
        let (listener1, p1) = listener().await;

        h.state.on_discovery(MasterEvent::Added, &entry("P1", p1, 50));
        while h.events.try_recv().is_ok() {}
        h.install_connections(1).await;
        let (mut s1, _) = listener1.accept().await.unwrap();

        s1.write_all(b"x?m").await.unwrap();
        let event = h.pump_until_event().await;
        assert_eq!(
            event,
            TrackerEvent::MastershipAsserted {
                master: p1,
                previous: None,
            }
        );
        assert!(h.state.sockets.contains_key(&p1));
    }

    #[tokio::test]
    async fn socket_for_unknown_master_is_dropped() {
        let mut h = harness();
        let (listener1, p1) = listener().await;

        // No discovery entry for p1.
        let _server = attach_manual(&mut h, &listener1, p1).await;
        assert!(h.state.sockets.is_empty());
    }

    #[tokio::test]
    async fn duplicate_socket_closes_both() {
        let mut h = harness();
        let (listener1, p1) = listener().await;

        h.state.on_discovery(MasterEvent::Added, &entry("P1", p1, 50));
        while h.events.try_recv().is_ok() {}

        h.install_connections(1).await;
        let (_s1, _) = listener1.accept().await.unwrap();
        assert!(h.state.sockets.contains_key(&p1));

        // A second socket to the same master is a collision.
        let _s2 = attach_manual(&mut h, &listener1, p1).await;
        assert!(h.state.sockets.is_empty());
    }

    #[tokio::test]
    async fn closed_socket_is_cleared_for_retry() {
        let mut h = harness();
        let (listener1, p1) = listener().await;

        h.state.on_discovery(MasterEvent::Added, &entry("P1", p1, 50));
        while h.events.try_recv().is_ok() {}

        h.install_connections(1).await;
        let (server, _) = listener1.accept().await.unwrap();
        drop(server);

        let (addr, msg) = tokio::time::timeout(Duration::from_secs(1), h.sockets.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(msg, SocketMsg::Closed));
        h.state.on_socket(addr, msg);
        assert!(h.state.sockets.is_empty());
        // The master is still known, so the endpoint keeps retrying.
        assert!(h.state.connector.has_endpoint(p1));
    }

    #[tokio::test]
    async fn divergence_reported_when_assertion_disagrees() {
        let mut h = harness();
        let (listener1, p1) = listener().await;
        let b: SocketAddrV4 = "10.99.0.1:9000".parse().unwrap();

        h.state.on_discovery(MasterEvent::Added, &entry("P1", p1, 50));
        h.state.on_discovery(MasterEvent::Added, &entry("B", b, 90));
        while h.events.try_recv().is_ok() {}

        h.install_connections(1).await;
        let (mut s1, _) = listener1.accept().await.unwrap();
        s1.write_all(&[MASTER_ASSERTED]).await.unwrap();

        // First the assertion, then the divergence against elected B.
        let event = h.pump_until_event().await;
        assert_eq!(
            event,
            TrackerEvent::MastershipAsserted {
                master: p1,
                previous: None,
            }
        );
        let event = h.pump_until_event().await;
        assert_eq!(
            event,
            TrackerEvent::Divergence {
                elected: Some(b),
                asserted: Some(p1),
            }
        );
    }

    #[tokio::test]
    async fn tracker_runs_end_to_end_over_discovery_channel() {
        let (discovery_tx, discovery_rx) = mpsc::unbounded_channel();
        let mut tracker = MasterTracker::new(TrackerConfig {
            connect_timeout: Duration::from_secs(1),
            retry_interval: Duration::from_millis(50),
        });
        let mut events = tracker.take_events().unwrap();
        tracker.start(discovery_rx);

        let (listener1, p1) = listener().await;
        discovery_tx
            .send((MasterEvent::Added, entry("P1", p1, 50)))
            .unwrap();

        let event = tokio::time::timeout(Duration::from_secs(1), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(event, TrackerEvent::ElectedChanged { .. }));

        // The connector dials the discovered master on its own.
        let (mut server, _) = listener1.accept().await.unwrap();
        server.write_all(&[MASTER_ASSERTED]).await.unwrap();

        // Skip the interim divergence report (elected, nothing asserted).
        let event = loop {
            let event = tokio::time::timeout(Duration::from_secs(1), events.recv())
                .await
                .unwrap()
                .unwrap();
            if !matches!(event, TrackerEvent::Divergence { .. }) {
                break event;
            }
        };
        assert_eq!(
            event,
            TrackerEvent::MastershipAsserted {
                master: p1,
                previous: None,
            }
        );

        tracker.stop().await;
    }
}
