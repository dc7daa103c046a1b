//! In-process responder backend for deterministic tests.
//!
//! Tests script the network side (`publish`, `retract`, `set_state`,
//! `collide_name`) and the discovery layer drives the [`Responder`]
//! surface exactly as it would against a real daemon. Events are
//! delivered synchronously on the subscribed channel, so test outcomes
//! do not depend on timing.

use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use e133_protocol::TxtRecord;

use crate::{
    ClientState, EventSender, OpHandle, Responder, ResponderError, ResponderEvent, ServiceKey,
    ServiceRegistration,
};

/// A scripted service instance visible on the fake network.
#[derive(Debug, Clone)]
pub struct PublishedService {
    pub key: ServiceKey,
    /// Subtype the instance is advertised under, if any.
    pub subtype: Option<String>,
    pub host: String,
    pub port: u16,
    pub txt: TxtRecord,
    /// Address the host resolves to; `None` simulates a host with no
    /// IPv4 address.
    pub addr: Option<Ipv4Addr>,
    /// When set, resolve attempts for this instance fail.
    pub resolve_fails: bool,
}

#[derive(Clone)]
struct BrowseOp {
    service_type: String,
    subtype: Option<String>,
}

struct Inner {
    state: ClientState,
    tx: Option<EventSender>,
    browses: HashMap<OpHandle, BrowseOp>,
    resolves: HashMap<OpHandle, ServiceKey>,
    registrations: HashMap<OpHandle, ServiceRegistration>,
    services: Vec<PublishedService>,
    colliding_names: HashSet<String>,
}

/// Scriptable in-memory responder.
#[derive(Clone)]
pub struct MemoryResponder {
    inner: Arc<std::sync::Mutex<Inner>>,
    ids: Arc<AtomicU64>,
}

impl Default for MemoryResponder {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryResponder {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(Inner {
                state: ClientState::Running,
                tx: None,
                browses: HashMap::new(),
                resolves: HashMap::new(),
                registrations: HashMap::new(),
                services: Vec::new(),
                colliding_names: HashSet::new(),
            })),
            ids: Arc::new(AtomicU64::new(1)),
        }
    }

    fn next_handle(&self) -> OpHandle {
        OpHandle(self.ids.fetch_add(1, Ordering::Relaxed))
    }

    fn send(&self, event: ResponderEvent) {
        let tx = self.inner.lock().unwrap().tx.clone();
        if let Some(tx) = tx {
            let _ = tx.send(event);
        }
    }

    /// Drives a client state transition, notifying the subscriber.
    pub fn set_state(&self, state: ClientState) {
        self.inner.lock().unwrap().state = state;
        self.send(ResponderEvent::StateChanged(state));
    }

    /// Makes an instance visible; matching browses see `BrowseAdded`.
    ///
    /// Re-publishing an already-visible instance replaces its data and
    /// re-resolves it for any in-flight resolve, which is how tests model
    /// a TXT or address change.
    pub fn publish(&self, service: PublishedService) {
        let (added, resolved) = {
            let mut inner = self.inner.lock().unwrap();

            let existing = inner
                .services
                .iter()
                .position(|s| s.key == service.key);
            let replaced = existing.is_some();
            match existing {
                Some(i) => inner.services[i] = service.clone(),
                None => inner.services.push(service.clone()),
            }

            let added: Vec<ResponderEvent> = if replaced {
                Vec::new()
            } else {
                inner
                    .browses
                    .iter()
                    .filter(|(_, b)| browse_matches(b, &service))
                    .map(|(handle, _)| ResponderEvent::BrowseAdded {
                        browse: *handle,
                        key: service.key.clone(),
                    })
                    .collect()
            };

            let resolved = inner
                .resolves
                .iter()
                .filter(|(_, key)| key_matches(key, &service.key))
                .map(|(handle, _)| ResponderEvent::Resolved {
                    resolve: *handle,
                    host: service.host.clone(),
                    port: service.port,
                    txt: service.txt.clone(),
                })
                .collect::<Vec<_>>();
            (added, resolved)
        };

        for event in added.into_iter().chain(resolved) {
            self.send(event);
        }
    }

    /// Withdraws an instance; matching browses see `BrowseRemoved`.
    pub fn retract(&self, key: &ServiceKey) {
        let removals = {
            let mut inner = self.inner.lock().unwrap();
            let before = inner.services.len();
            inner.services.retain(|s| s.key != *key);
            if inner.services.len() == before {
                Vec::new()
            } else {
                inner
                    .browses
                    .iter()
                    .filter(|(_, b)| b.service_type == key.service_type)
                    .map(|(handle, _)| ResponderEvent::BrowseRemoved {
                        browse: *handle,
                        key: key.clone(),
                    })
                    .collect::<Vec<_>>()
            }
        };
        for event in removals {
            self.send(event);
        }
    }

    /// Marks an instance name as taken, so registering it collides.
    pub fn collide_name(&self, name: &str) {
        self.inner
            .lock()
            .unwrap()
            .colliding_names
            .insert(name.to_string());
    }

    /// Snapshot of currently-held registrations.
    pub fn registrations(&self) -> Vec<ServiceRegistration> {
        self.inner
            .lock()
            .unwrap()
            .registrations
            .values()
            .cloned()
            .collect()
    }

    pub fn browse_count(&self) -> usize {
        self.inner.lock().unwrap().browses.len()
    }

    pub fn resolve_count(&self) -> usize {
        self.inner.lock().unwrap().resolves.len()
    }
}

fn browse_matches(browse: &BrowseOp, service: &PublishedService) -> bool {
    browse.service_type == service.key.service_type
        && match &browse.subtype {
            Some(subtype) => service.subtype.as_deref() == Some(subtype.as_str()),
            None => true,
        }
}

/// Resolve keys match per instance identity; the interface index is the
/// resolver's own concern.
fn key_matches(resolve_key: &ServiceKey, service_key: &ServiceKey) -> bool {
    resolve_key.name == service_key.name
        && resolve_key.service_type == service_key.service_type
        && resolve_key.domain == service_key.domain
}

impl Responder for MemoryResponder {
    fn subscribe(&self, tx: EventSender) {
        self.inner.lock().unwrap().tx = Some(tx);
    }

    fn state(&self) -> ClientState {
        self.inner.lock().unwrap().state
    }

    fn start_browse(
        &self,
        service_type: &str,
        subtype: Option<&str>,
    ) -> Result<OpHandle, ResponderError> {
        let (handle, replays) = {
            let mut inner = self.inner.lock().unwrap();
            if inner.state != ClientState::Running {
                return Err(ResponderError::ResponderUnavailable);
            }
            let op = BrowseOp {
                service_type: service_type.to_string(),
                subtype: subtype.map(str::to_string),
            };
            let handle = self.next_handle();

            let replays: Vec<ResponderEvent> = inner
                .services
                .iter()
                .filter(|s| browse_matches(&op, s))
                .map(|s| ResponderEvent::BrowseAdded {
                    browse: handle,
                    key: s.key.clone(),
                })
                .collect();
            inner.browses.insert(handle, op);
            (handle, replays)
        };

        for event in replays {
            self.send(event);
        }
        Ok(handle)
    }

    fn start_resolve(&self, key: &ServiceKey) -> Result<OpHandle, ResponderError> {
        let (handle, outcome) = {
            let mut inner = self.inner.lock().unwrap();
            if inner.state != ClientState::Running {
                return Err(ResponderError::ResponderUnavailable);
            }
            let handle = self.next_handle();
            inner.resolves.insert(handle, key.clone());

            let outcome = inner
                .services
                .iter()
                .find(|s| key_matches(key, &s.key))
                .map(|s| {
                    if s.resolve_fails {
                        ResponderEvent::ResolveFailed { resolve: handle }
                    } else {
                        ResponderEvent::Resolved {
                            resolve: handle,
                            host: s.host.clone(),
                            port: s.port,
                            txt: s.txt.clone(),
                        }
                    }
                });
            (handle, outcome)
        };

        if let Some(event) = outcome {
            self.send(event);
        }
        Ok(handle)
    }

    fn start_address(&self, resolve: OpHandle, host: &str) -> Result<(), ResponderError> {
        let addr = {
            let inner = self.inner.lock().unwrap();
            let key = inner
                .resolves
                .get(&resolve)
                .ok_or(ResponderError::UnknownHandle(resolve))?;
            inner
                .services
                .iter()
                .find(|s| key_matches(key, &s.key) && s.host == host)
                .and_then(|s| s.addr)
        };
        self.send(ResponderEvent::AddressResolved { resolve, addr });
        Ok(())
    }

    fn start_register(&self, reg: &ServiceRegistration) -> Result<OpHandle, ResponderError> {
        let (handle, event) = {
            let mut inner = self.inner.lock().unwrap();
            if inner.state != ClientState::Running {
                return Err(ResponderError::ResponderUnavailable);
            }
            let handle = self.next_handle();
            if inner.colliding_names.contains(&reg.name) {
                (
                    handle,
                    ResponderEvent::NameCollision {
                        registration: handle,
                    },
                )
            } else {
                inner.registrations.insert(handle, reg.clone());
                (
                    handle,
                    ResponderEvent::Registered {
                        registration: handle,
                    },
                )
            }
        };
        self.send(event);
        Ok(handle)
    }

    fn update_txt(&self, registration: OpHandle, txt: &TxtRecord) -> Result<(), ResponderError> {
        let mut inner = self.inner.lock().unwrap();
        let reg = inner
            .registrations
            .get_mut(&registration)
            .ok_or(ResponderError::UnknownHandle(registration))?;
        reg.txt = txt.clone();
        Ok(())
    }

    fn close(&self, handle: OpHandle) {
        let mut inner = self.inner.lock().unwrap();
        if inner.browses.remove(&handle).is_some() {
            return;
        }
        if inner.resolves.remove(&handle).is_some() {
            return;
        }
        inner.registrations.remove(&handle);
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;

    use super::*;
    use crate::Proto;

    fn key(name: &str, iface: u32) -> ServiceKey {
        ServiceKey {
            interface_index: iface,
            protocol: Proto::V4,
            name: name.into(),
            service_type: "_draft-e133-master._tcp".into(),
            domain: "local.".into(),
        }
    }

    fn service(name: &str, iface: u32) -> PublishedService {
        let mut txt = TxtRecord::new();
        txt.set("txtvers", "1");
        PublishedService {
            key: key(name, iface),
            subtype: Some("_default._sub._draft-e133-master._tcp".into()),
            host: format!("{name}.local."),
            port: 9000,
            txt,
            addr: Some(Ipv4Addr::new(10, 0, 0, 5)),
            resolve_fails: false,
        }
    }

    #[tokio::test]
    async fn browse_sees_later_publishes() {
        let responder = MemoryResponder::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        responder.subscribe(tx);

        let browse = responder
            .start_browse("_draft-e133-master._tcp", None)
            .unwrap();
        responder.publish(service("MasterA-50", 2));

        match rx.recv().await.unwrap() {
            ResponderEvent::BrowseAdded { browse: b, key } => {
                assert_eq!(b, browse);
                assert_eq!(key.name, "MasterA-50");
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn browse_replays_existing_services() {
        let responder = MemoryResponder::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        responder.subscribe(tx);

        responder.publish(service("MasterA-50", 2));
        responder
            .start_browse("_draft-e133-master._tcp", None)
            .unwrap();

        assert!(matches!(
            rx.recv().await.unwrap(),
            ResponderEvent::BrowseAdded { .. }
        ));
    }

    #[tokio::test]
    async fn subtype_browse_filters_other_scopes() {
        let responder = MemoryResponder::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        responder.subscribe(tx);

        responder
            .start_browse(
                "_draft-e133-master._tcp",
                Some("_lab._sub._draft-e133-master._tcp"),
            )
            .unwrap();
        responder.publish(service("MasterA-50", 2));

        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn resolve_delivers_host_port_txt() {
        let responder = MemoryResponder::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        responder.subscribe(tx);

        responder.publish(service("MasterA-50", 2));
        let resolve = responder.start_resolve(&key("MasterA-50", 2)).unwrap();

        match rx.recv().await.unwrap() {
            ResponderEvent::Resolved {
                resolve: r,
                host,
                port,
                ..
            } => {
                assert_eq!(r, resolve);
                assert_eq!(host, "MasterA-50.local.");
                assert_eq!(port, 9000);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn registration_collision_is_reported() {
        let responder = MemoryResponder::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        responder.subscribe(tx);
        responder.collide_name("Master-50");

        responder
            .start_register(&ServiceRegistration {
                name: "Master-50".into(),
                service_type: "_draft-e133-master._tcp".into(),
                subtype: None,
                port: 9000,
                addresses: vec![],
                txt: TxtRecord::new(),
            })
            .unwrap();

        assert!(matches!(
            rx.recv().await.unwrap(),
            ResponderEvent::NameCollision { .. }
        ));
        assert!(responder.registrations().is_empty());
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let responder = MemoryResponder::new();
        let handle = responder
            .start_browse("_draft-e133-master._tcp", None)
            .unwrap();
        responder.close(handle);
        responder.close(handle);
        assert_eq!(responder.browse_count(), 0);
    }

    #[tokio::test]
    async fn browse_fails_when_not_running() {
        let responder = MemoryResponder::new();
        responder.set_state(ClientState::Failed);
        assert!(matches!(
            responder.start_browse("_draft-e133-master._tcp", None),
            Err(ResponderError::ResponderUnavailable)
        ));
    }
}
