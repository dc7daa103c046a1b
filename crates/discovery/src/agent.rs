//! The discovery agent: one event loop owning browse, resolvers, and
//! registrations.
//!
//! Responder callbacks land on a channel and are forwarded onto the
//! agent's run loop, so every mutation happens on one task. External
//! entry points are likewise marshalled through [`LoopHandle::submit`]
//! and are safe to call from any task.

use std::collections::HashMap;
use std::net::SocketAddrV4;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use e133_protocol::constants::{MASTER_SERVICE, scope_subtype};
use e133_protocol::{MasterEntry, TxtRecord};
use e133_responder::{
    ClientState, OpHandle, Proto, Responder, ResponderEvent, ServiceKey,
};
use e133_runloop::{LoopHandle, RunLoop};

use crate::registration::MasterRegistration;
use crate::resolver::{MasterResolver, ResolveStep};
use crate::{DiscoveryError, DiscoveryOptions, MasterEvent, MasterEventRx, MasterEventTx};

/// Scope-bounded DNS-SD browser and registrar for E1.33 masters.
pub struct DiscoveryAgent {
    responder: Arc<dyn Responder>,
    options: DiscoveryOptions,
    events_tx: MasterEventTx,
    events_rx: Option<MasterEventRx>,
    handle: Option<LoopHandle<AgentState>>,
    task: Option<JoinHandle<()>>,
}

impl DiscoveryAgent {
    pub fn new(responder: Arc<dyn Responder>, options: DiscoveryOptions) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            responder,
            options,
            events_tx,
            events_rx: Some(events_rx),
            handle: None,
            task: None,
        }
    }

    /// Takes the master event receiver. Can only be called once.
    pub fn take_events(&mut self) -> Option<MasterEventRx> {
        self.events_rx.take()
    }

    /// Starts the agent loop and the initial browse.
    ///
    /// Fails when the responder is unreachable or the browse cannot be
    /// established.
    ///
    /// # Panics
    ///
    /// Starting an already-started agent is a programming error and
    /// panics.
    pub async fn start(&mut self) -> Result<(), DiscoveryError> {
        assert!(self.handle.is_none(), "DiscoveryAgent started twice");

        let (responder_tx, mut responder_rx) = mpsc::unbounded_channel();
        self.responder.subscribe(responder_tx);

        let mut run_loop = RunLoop::new();
        let handle = run_loop.handle();
        let mut state = AgentState::new(
            self.responder.clone(),
            self.options.clone(),
            self.events_tx.clone(),
        );

        let (ready_tx, ready_rx) = oneshot::channel();
        handle.submit(move |state: &mut AgentState| {
            let _ = ready_tx.send(state.initialize());
        });

        // Marshal responder callbacks onto the loop.
        let forward = handle.clone();
        let task = tokio::spawn(async move {
            let forwarder = tokio::spawn(async move {
                while let Some(event) = responder_rx.recv().await {
                    if forward.is_terminated() {
                        break;
                    }
                    forward.submit(move |state: &mut AgentState| state.on_responder_event(event));
                }
            });

            run_loop.run(&mut state).await;
            state.shutdown();
            forwarder.abort();
        });

        self.handle = Some(handle);
        self.task = Some(task);

        let result = ready_rx
            .await
            .map_err(|_| DiscoveryError::NotRunning)
            .and_then(|outcome| outcome);
        if result.is_err() {
            self.stop().await;
        }
        result
    }

    /// Stops the agent. No master events are delivered after this
    /// returns.
    pub async fn stop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.terminate();
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }

    /// Advertises (or updates) a master. Registrations are keyed by the
    /// socket address in `master`.
    pub fn register_master(&self, master: &MasterEntry) -> Result<(), DiscoveryError> {
        let handle = self.handle.as_ref().ok_or(DiscoveryError::NotRunning)?;
        let master = master.clone();
        handle.submit(move |state| state.register_master(master));
        Ok(())
    }

    /// Withdraws the master advertised at `address`.
    pub fn deregister_master(&self, address: SocketAddrV4) -> Result<(), DiscoveryError> {
        let handle = self.handle.as_ref().ok_or(DiscoveryError::NotRunning)?;
        handle.submit(move |state| state.deregister_master(address));
        Ok(())
    }
}

/// Loop-owned agent state. Only ever touched by the run loop.
struct AgentState {
    responder: Arc<dyn Responder>,
    options: DiscoveryOptions,
    events_tx: MasterEventTx,
    browse: Option<OpHandle>,
    resolvers: HashMap<ServiceKey, MasterResolver>,
    by_resolve: HashMap<OpHandle, ServiceKey>,
    registrations: HashMap<SocketAddrV4, MasterRegistration>,
    /// Last record delivered per instance name. Suppresses duplicate
    /// emissions across interfaces and re-resolves.
    emitted: HashMap<String, MasterEntry>,
}

impl AgentState {
    fn new(responder: Arc<dyn Responder>, options: DiscoveryOptions, events_tx: MasterEventTx) -> Self {
        Self {
            responder,
            options,
            events_tx,
            browse: None,
            resolvers: HashMap::new(),
            by_resolve: HashMap::new(),
            registrations: HashMap::new(),
            emitted: HashMap::new(),
        }
    }

    fn initialize(&mut self) -> Result<(), DiscoveryError> {
        match self.responder.state() {
            ClientState::Running => self.start_browse(),
            ClientState::Connecting => Ok(()),
            ClientState::Failed | ClientState::Collision => {
                Err(DiscoveryError::ResponderUnavailable)
            }
        }
    }

    fn start_browse(&mut self) -> Result<(), DiscoveryError> {
        if !self.options.watch_masters || self.browse.is_some() {
            return Ok(());
        }
        let subtype = (!self.options.scope.is_empty())
            .then(|| scope_subtype(&self.options.scope));
        let browse = self
            .responder
            .start_browse(MASTER_SERVICE, subtype.as_deref())
            .map_err(DiscoveryError::Browse)?;
        info!(
            scope = %self.options.scope,
            service = subtype.as_deref().unwrap_or(MASTER_SERVICE),
            "browsing for masters"
        );
        self.browse = Some(browse);
        Ok(())
    }

    fn on_responder_event(&mut self, event: ResponderEvent) {
        match event {
            ResponderEvent::StateChanged(ClientState::Running) => {
                info!("responder running; rebuilding browse and registrations");
                if let Err(e) = self.start_browse() {
                    warn!("failed to restart browse: {e}");
                }
                for registration in self.registrations.values_mut() {
                    registration.on_responder_running();
                }
            }
            ResponderEvent::StateChanged(state) => {
                // Known masters are deliberately not reported as removed;
                // consumers keep their view until positive removal.
                warn!(?state, "responder lost; tearing down discovery state");
                self.teardown_resolution();
                for registration in self.registrations.values_mut() {
                    registration.on_responder_lost();
                }
            }
            ResponderEvent::BrowseAdded { key, .. } => self.on_browse_added(key),
            ResponderEvent::BrowseRemoved { key, .. } => self.on_browse_removed(key),
            ResponderEvent::Resolved {
                resolve,
                host,
                port,
                txt,
            } => self.on_resolved(resolve, host, port, &txt),
            ResponderEvent::ResolveFailed { resolve } => {
                if let Some(key) = self.by_resolve.get(&resolve).cloned() {
                    if let Some(resolver) = self.resolvers.get_mut(&key) {
                        resolver.on_resolve_failed();
                    }
                }
            }
            ResponderEvent::AddressResolved { resolve, addr } => {
                let Some(key) = self.by_resolve.get(&resolve).cloned() else {
                    return;
                };
                let complete = self
                    .resolvers
                    .get_mut(&key)
                    .is_some_and(|resolver| resolver.on_address(addr));
                if complete {
                    self.emit_if_changed(&key);
                }
            }
            ResponderEvent::Registered { registration } => {
                if let Some(reg) = self.registration_by_handle(registration) {
                    reg.on_registered();
                }
            }
            ResponderEvent::NameCollision { registration } => {
                if let Some(reg) = self.registration_by_handle(registration) {
                    reg.on_collision();
                }
            }
            ResponderEvent::RegistrationFailed { registration } => {
                if let Some(reg) = self.registration_by_handle(registration) {
                    reg.on_registration_failed();
                }
            }
        }
    }

    fn on_browse_added(&mut self, key: ServiceKey) {
        if key.protocol != Proto::V4 {
            return;
        }
        if self.resolvers.contains_key(&key) {
            debug!(instance = %key.name, iface = key.interface_index, "duplicate announcement");
            return;
        }

        match MasterResolver::start(self.responder.clone(), key.clone()) {
            Ok(resolver) => {
                debug!(instance = %key.name, iface = key.interface_index, "resolving master");
                self.by_resolve.insert(resolver.handle(), key.clone());
                self.resolvers.insert(key, resolver);
            }
            Err(e) => warn!(instance = %key.name, "failed to start resolution: {e}"),
        }
    }

    fn on_browse_removed(&mut self, key: ServiceKey) {
        let Some(mut resolver) = self.resolvers.remove(&key) else {
            debug!(instance = %key.name, "removal for unknown instance");
            return;
        };
        self.by_resolve.remove(&resolver.handle());
        resolver.close();

        // Another interface may still carry this instance.
        let still_visible = self.resolvers.values().any(|r| r.key().name == key.name);
        if still_visible {
            return;
        }

        if let Some(entry) = self.emitted.remove(&key.name) {
            info!(master = %entry, "master removed");
            let _ = self.events_tx.send((MasterEvent::Removed, entry));
        }
    }

    fn on_resolved(&mut self, resolve: OpHandle, host: String, port: u16, txt: &TxtRecord) {
        let Some(key) = self.by_resolve.get(&resolve).cloned() else {
            return;
        };
        let Some(resolver) = self.resolvers.get_mut(&key) else {
            return;
        };
        match resolver.on_resolved(host, port, txt) {
            ResolveStep::LookupAddress(host) => {
                if let Err(e) = self.responder.start_address(resolve, &host) {
                    warn!(instance = %key.name, "address lookup failed to start: {e}");
                }
            }
            ResolveStep::CheckComplete => self.emit_if_changed(&key),
            ResolveStep::None => {}
        }
    }

    /// Emits `Added` for a completed record, once per distinct record
    /// per instance name.
    fn emit_if_changed(&mut self, key: &ServiceKey) {
        let Some(entry) = self.resolvers.get(key).and_then(|r| r.current_entry()) else {
            return;
        };

        if entry.scope != self.options.scope {
            warn!(master = %entry, expected = %self.options.scope, "scope mismatch; dropping");
            return;
        }
        if self.emitted.get(&entry.service_name) == Some(&entry) {
            return;
        }

        info!(master = %entry, "master discovered");
        self.emitted
            .insert(entry.service_name.clone(), entry.clone());
        let _ = self.events_tx.send((MasterEvent::Added, entry));
    }

    fn registration_by_handle(&mut self, handle: OpHandle) -> Option<&mut MasterRegistration> {
        self.registrations
            .values_mut()
            .find(|r| r.handle() == Some(handle))
    }

    fn register_master(&mut self, master: MasterEntry) {
        let registration = self
            .registrations
            .entry(master.address)
            .or_insert_with(|| MasterRegistration::new(self.responder.clone()));
        registration.register_or_update(master);
    }

    fn deregister_master(&mut self, address: SocketAddrV4) {
        if let Some(mut registration) = self.registrations.remove(&address) {
            registration.close();
        }
    }

    fn teardown_resolution(&mut self) {
        for (_, mut resolver) in self.resolvers.drain() {
            resolver.close();
        }
        self.by_resolve.clear();
        if let Some(browse) = self.browse.take() {
            self.responder.close(browse);
        }
    }

    fn shutdown(&mut self) {
        self.teardown_resolution();
        for (_, mut registration) in self.registrations.drain() {
            registration.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;
    use std::time::Duration;

    use e133_protocol::master_txt;
    use e133_responder::{MemoryResponder, PublishedService};

    use super::*;

    fn key(name: &str, iface: u32) -> ServiceKey {
        ServiceKey {
            interface_index: iface,
            protocol: Proto::V4,
            name: name.into(),
            service_type: MASTER_SERVICE.into(),
            domain: "local.".into(),
        }
    }

    fn service(name: &str, iface: u32, priority: u8, scope: &str, ip: [u8; 4]) -> PublishedService {
        let txt = master_txt(&MasterEntry {
            service_name: name.into(),
            address: "0.0.0.0:0".parse().unwrap(),
            priority,
            scope: scope.into(),
        });
        PublishedService {
            key: key(name, iface),
            subtype: Some(scope_subtype(scope)),
            host: format!("{name}.local."),
            port: 9000,
            txt,
            addr: Some(Ipv4Addr::from(ip)),
            resolve_fails: false,
        }
    }

    async fn started_agent(
        responder: &MemoryResponder,
    ) -> (DiscoveryAgent, MasterEventRx) {
        let mut agent =
            DiscoveryAgent::new(Arc::new(responder.clone()), DiscoveryOptions::default());
        let events = agent.take_events().unwrap();
        agent.start().await.unwrap();
        (agent, events)
    }

    async fn next_event(rx: &mut MasterEventRx) -> (MasterEvent, MasterEntry) {
        tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("timed out waiting for master event")
            .expect("event channel closed")
    }

    async fn assert_no_event(rx: &mut MasterEventRx) {
        // Give in-flight submissions a chance to land first.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err(), "unexpected master event");
    }

    #[tokio::test]
    async fn single_master_discovery() {
        let responder = MemoryResponder::new();
        let (mut agent, mut events) = started_agent(&responder).await;

        responder.publish(service("MasterA-50", 2, 50, "default", [10, 0, 0, 5]));

        let (event, entry) = next_event(&mut events).await;
        assert_eq!(event, MasterEvent::Added);
        assert_eq!(entry.service_name, "MasterA-50");
        assert_eq!(entry.address, "10.0.0.5:9000".parse().unwrap());
        assert_eq!(entry.priority, 50);
        assert_eq!(entry.scope, "default");

        assert_no_event(&mut events).await;
        agent.stop().await;
    }

    #[tokio::test]
    async fn republishing_identical_record_is_suppressed() {
        let responder = MemoryResponder::new();
        let (mut agent, mut events) = started_agent(&responder).await;

        responder.publish(service("MasterA-50", 2, 50, "default", [10, 0, 0, 5]));
        next_event(&mut events).await;

        responder.publish(service("MasterA-50", 2, 50, "default", [10, 0, 0, 5]));
        assert_no_event(&mut events).await;
        agent.stop().await;
    }

    #[tokio::test]
    async fn changed_record_is_emitted_again() {
        let responder = MemoryResponder::new();
        let (mut agent, mut events) = started_agent(&responder).await;

        responder.publish(service("MasterA-50", 2, 50, "default", [10, 0, 0, 5]));
        let (_, first) = next_event(&mut events).await;
        assert_eq!(first.priority, 50);

        responder.publish(service("MasterA-50", 2, 80, "default", [10, 0, 0, 5]));
        let (event, second) = next_event(&mut events).await;
        assert_eq!(event, MasterEvent::Added);
        assert_eq!(second.priority, 80);
        assert_ne!(first, second);
        agent.stop().await;
    }

    #[tokio::test]
    async fn multi_interface_announcements_deduplicate() {
        let responder = MemoryResponder::new();
        let (mut agent, mut events) = started_agent(&responder).await;

        responder.publish(service("MasterA-50", 2, 50, "default", [10, 0, 0, 5]));
        responder.publish(service("MasterA-50", 3, 50, "default", [10, 0, 0, 5]));

        let (event, entry) = next_event(&mut events).await;
        assert_eq!(event, MasterEvent::Added);
        assert_eq!(entry.service_name, "MasterA-50");
        assert_no_event(&mut events).await;

        // Both interfaces retract: exactly one removal.
        responder.retract(&key("MasterA-50", 2));
        assert_no_event(&mut events).await;
        responder.retract(&key("MasterA-50", 3));

        let (event, entry) = next_event(&mut events).await;
        assert_eq!(event, MasterEvent::Removed);
        assert_eq!(entry.service_name, "MasterA-50");
        agent.stop().await;
    }

    #[tokio::test]
    async fn removal_delivers_last_known_record() {
        let responder = MemoryResponder::new();
        let (mut agent, mut events) = started_agent(&responder).await;

        responder.publish(service("MasterA-50", 2, 50, "default", [10, 0, 0, 5]));
        next_event(&mut events).await;

        responder.retract(&key("MasterA-50", 2));
        let (event, entry) = next_event(&mut events).await;
        assert_eq!(event, MasterEvent::Removed);
        assert_eq!(entry.address, "10.0.0.5:9000".parse().unwrap());
        agent.stop().await;
    }

    #[tokio::test]
    async fn txt_version_mismatch_is_dropped() {
        let responder = MemoryResponder::new();
        let (mut agent, mut events) = started_agent(&responder).await;

        let mut svc = service("MasterA-50", 2, 50, "default", [10, 0, 0, 5]);
        svc.txt.set("txtvers", "3");
        responder.publish(svc);

        assert_no_event(&mut events).await;
        agent.stop().await;
    }

    #[tokio::test]
    async fn foreign_scope_txt_is_dropped() {
        let responder = MemoryResponder::new();
        let (mut agent, mut events) = started_agent(&responder).await;

        // Subtype matches but the TXT claims another scope.
        let mut svc = service("MasterA-50", 2, 50, "default", [10, 0, 0, 5]);
        svc.txt.set("confScope", "lab");
        responder.publish(svc);

        assert_no_event(&mut events).await;
        agent.stop().await;
    }

    #[tokio::test]
    async fn resolve_failure_emits_nothing() {
        let responder = MemoryResponder::new();
        let (mut agent, mut events) = started_agent(&responder).await;

        let mut svc = service("MasterA-50", 2, 50, "default", [10, 0, 0, 5]);
        svc.resolve_fails = true;
        responder.publish(svc);

        assert_no_event(&mut events).await;
        agent.stop().await;
    }

    #[tokio::test]
    async fn responder_loss_keeps_known_masters() {
        let responder = MemoryResponder::new();
        let (mut agent, mut events) = started_agent(&responder).await;

        responder.publish(service("MasterA-50", 2, 50, "default", [10, 0, 0, 5]));
        next_event(&mut events).await;

        // Going down must not synthesize removals.
        responder.set_state(ClientState::Failed);
        assert_no_event(&mut events).await;

        // Recovery rebuilds the browse; the unchanged record stays
        // suppressed, a changed one comes through.
        responder.set_state(ClientState::Running);
        responder.publish(service("MasterA-50", 2, 80, "default", [10, 0, 0, 5]));
        let (event, entry) = next_event(&mut events).await;
        assert_eq!(event, MasterEvent::Added);
        assert_eq!(entry.priority, 80);
        agent.stop().await;
    }

    #[tokio::test]
    async fn start_fails_without_responder() {
        let responder = MemoryResponder::new();
        responder.set_state(ClientState::Failed);

        let mut agent =
            DiscoveryAgent::new(Arc::new(responder.clone()), DiscoveryOptions::default());
        assert!(matches!(
            agent.start().await,
            Err(DiscoveryError::ResponderUnavailable)
        ));
    }

    #[tokio::test]
    async fn no_events_after_stop() {
        let responder = MemoryResponder::new();
        let (mut agent, mut events) = started_agent(&responder).await;

        agent.stop().await;
        responder.publish(service("MasterA-50", 2, 50, "default", [10, 0, 0, 5]));
        assert_no_event(&mut events).await;
    }

    #[tokio::test]
    async fn register_master_publishes_and_deregister_withdraws() {
        let responder = MemoryResponder::new();
        let (mut agent, _events) = started_agent(&responder).await;

        let master = MasterEntry {
            service_name: "Master".into(),
            address: "10.0.0.9:5568".parse().unwrap(),
            priority: 50,
            scope: "default".into(),
        };
        agent.register_master(&master).unwrap();

        // Marshalled onto the agent loop; wait for it to land.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let regs = responder.registrations();
        assert_eq!(regs.len(), 1);
        assert_eq!(regs[0].name, "Master-50");

        agent
            .deregister_master("10.0.0.9:5568".parse().unwrap())
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(responder.registrations().is_empty());

        agent.stop().await;
    }

    #[tokio::test]
    async fn stop_withdraws_registrations() {
        let responder = MemoryResponder::new();
        let (mut agent, _events) = started_agent(&responder).await;

        let master = MasterEntry {
            service_name: "Master".into(),
            address: "10.0.0.9:5568".parse().unwrap(),
            priority: 50,
            scope: "default".into(),
        };
        agent.register_master(&master).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(responder.registrations().len(), 1);

        agent.stop().await;
        assert!(responder.registrations().is_empty());
    }

    #[tokio::test]
    async fn watch_masters_false_never_browses() {
        let responder = MemoryResponder::new();
        let mut agent = DiscoveryAgent::new(
            Arc::new(responder.clone()),
            DiscoveryOptions {
                watch_masters: false,
                ..DiscoveryOptions::default()
            },
        );
        let mut events = agent.take_events().unwrap();
        agent.start().await.unwrap();

        assert_eq!(responder.browse_count(), 0);
        responder.publish(service("MasterA-50", 2, 50, "default", [10, 0, 0, 5]));
        assert_no_event(&mut events).await;
        agent.stop().await;
    }
}
