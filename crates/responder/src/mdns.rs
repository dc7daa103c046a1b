//! `mdns-sd` backend for the responder port.
//!
//! Bridges the daemon's flume channels onto the port's event channel.
//! The daemon aggregates interfaces itself, so every key it produces
//! carries `interface_index` 0. Browse events deliver instance names;
//! resolution data arrives on the same browse stream and is cached here
//! so resolve and address lookups answer from the cache.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use mdns_sd::{DaemonEvent, Receiver, ServiceDaemon, ServiceEvent, ServiceInfo};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use e133_protocol::TxtRecord;

use crate::{
    ClientState, EventSender, OpHandle, Proto, Responder, ResponderError, ResponderEvent,
    ServiceKey, ServiceRegistration,
};

/// How long a failed daemon waits between reconnect attempts.
const RECONNECT_INTERVAL: Duration = Duration::from_secs(5);

/// Poll granularity for the blocking daemon channels.
const RECV_TIMEOUT: Duration = Duration::from_millis(500);

/// Responder backed by an in-process `mdns_sd::ServiceDaemon`.
pub struct MdnsResponder {
    shared: Arc<Shared>,
    cancel: CancellationToken,
}

struct Shared {
    inner: std::sync::Mutex<Inner>,
    ids: AtomicU64,
}

struct Inner {
    daemon: Option<ServiceDaemon>,
    state: ClientState,
    tx: Option<EventSender>,
    browses: HashMap<OpHandle, BrowseOp>,
    /// Resolve handle -> instance fullname.
    resolves: HashMap<OpHandle, String>,
    /// Instance fullname -> resolve handle.
    by_fullname: HashMap<String, OpHandle>,
    /// Latest resolution data per instance fullname.
    cache: HashMap<String, Resolution>,
    registrations: HashMap<OpHandle, RegOp>,
}

struct BrowseOp {
    browse_type: String,
    cancel: CancellationToken,
}

#[derive(Clone)]
struct Resolution {
    host: String,
    port: u16,
    txt: TxtRecord,
    addrs: Vec<Ipv4Addr>,
}

struct RegOp {
    reg: ServiceRegistration,
    fullname: String,
}

impl MdnsResponder {
    /// Creates the responder, connecting to the host daemon immediately.
    ///
    /// A daemon that cannot start leaves the responder in `Failed`;
    /// reconnection is attempted in the background once subscribed.
    pub fn new() -> Self {
        let (daemon, state) = match ServiceDaemon::new() {
            Ok(d) => (Some(d), ClientState::Running),
            Err(e) => {
                warn!("failed to start mDNS daemon: {e}");
                (None, ClientState::Failed)
            }
        };

        Self {
            shared: Arc::new(Shared {
                inner: std::sync::Mutex::new(Inner {
                    daemon,
                    state,
                    tx: None,
                    browses: HashMap::new(),
                    resolves: HashMap::new(),
                    by_fullname: HashMap::new(),
                    cache: HashMap::new(),
                    registrations: HashMap::new(),
                }),
                ids: AtomicU64::new(1),
            }),
            cancel: CancellationToken::new(),
        }
    }
}

impl Default for MdnsResponder {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for MdnsResponder {
    fn drop(&mut self) {
        self.cancel.cancel();
        let inner = self.shared.inner.lock().unwrap();
        for op in inner.browses.values() {
            op.cancel.cancel();
        }
        if let Some(daemon) = &inner.daemon {
            let _ = daemon.shutdown();
        }
    }
}

impl Shared {
    fn next_handle(&self) -> OpHandle {
        OpHandle(self.ids.fetch_add(1, Ordering::Relaxed))
    }

    fn send(&self, event: ResponderEvent) {
        let tx = self.inner.lock().unwrap().tx.clone();
        if let Some(tx) = tx {
            let _ = tx.send(event);
        }
    }
}

impl Responder for MdnsResponder {
    fn subscribe(&self, tx: EventSender) {
        let monitor = {
            let mut inner = self.shared.inner.lock().unwrap();
            inner.tx = Some(tx);
            inner.daemon.as_ref().and_then(|d| d.monitor().ok())
        };
        if let Some(rx) = monitor {
            tokio::spawn(monitor_pump(rx, self.shared.clone(), self.cancel.clone()));
        }
    }

    fn state(&self) -> ClientState {
        self.shared.inner.lock().unwrap().state
    }

    fn start_browse(
        &self,
        service_type: &str,
        subtype: Option<&str>,
    ) -> Result<OpHandle, ResponderError> {
        let browse_type = format!("{}.local.", subtype.unwrap_or(service_type));
        let base_type = format!("{service_type}.local.");

        let (receiver, handle, cancel) = {
            let mut inner = self.shared.inner.lock().unwrap();
            if inner.state != ClientState::Running {
                return Err(ResponderError::ResponderUnavailable);
            }
            let daemon = inner
                .daemon
                .as_ref()
                .ok_or(ResponderError::ResponderUnavailable)?;
            let receiver = daemon
                .browse(&browse_type)
                .map_err(|e| ResponderError::Backend(e.to_string()))?;

            let handle = self.shared.next_handle();
            let cancel = self.cancel.child_token();
            inner.browses.insert(
                handle,
                BrowseOp {
                    browse_type: browse_type.clone(),
                    cancel: cancel.clone(),
                },
            );
            (receiver, handle, cancel)
        };

        tokio::spawn(browse_pump(
            receiver,
            self.shared.clone(),
            handle,
            base_type,
            cancel,
        ));
        Ok(handle)
    }

    fn start_resolve(&self, key: &ServiceKey) -> Result<OpHandle, ResponderError> {
        let fullname = format!("{}.{}.local.", key.name, key.service_type);

        let (handle, cached) = {
            let mut inner = self.shared.inner.lock().unwrap();
            if inner.state != ClientState::Running {
                return Err(ResponderError::ResponderUnavailable);
            }
            let handle = self.shared.next_handle();
            inner.resolves.insert(handle, fullname.clone());
            inner.by_fullname.insert(fullname.clone(), handle);
            (handle, inner.cache.get(&fullname).cloned())
        };

        // The daemon resolves as part of browsing; replay any cached data.
        if let Some(res) = cached {
            self.shared.send(ResponderEvent::Resolved {
                resolve: handle,
                host: res.host,
                port: res.port,
                txt: res.txt,
            });
        }
        Ok(handle)
    }

    fn start_address(&self, resolve: OpHandle, host: &str) -> Result<(), ResponderError> {
        let addr = {
            let inner = self.shared.inner.lock().unwrap();
            let fullname = inner
                .resolves
                .get(&resolve)
                .ok_or(ResponderError::UnknownHandle(resolve))?;
            inner
                .cache
                .get(fullname)
                .filter(|res| res.host == host)
                .and_then(|res| res.addrs.first().copied())
        };
        self.shared
            .send(ResponderEvent::AddressResolved { resolve, addr });
        Ok(())
    }

    fn start_register(&self, reg: &ServiceRegistration) -> Result<OpHandle, ResponderError> {
        let (handle, outcome) = {
            let mut inner = self.shared.inner.lock().unwrap();
            if inner.state != ClientState::Running {
                return Err(ResponderError::ResponderUnavailable);
            }
            let daemon = inner
                .daemon
                .as_ref()
                .ok_or(ResponderError::ResponderUnavailable)?;

            let info = build_service_info(reg)?;
            let fullname = info.get_fullname().to_string();
            let handle = self.shared.next_handle();
            let outcome = match daemon.register(info) {
                Ok(()) => {
                    inner.registrations.insert(
                        handle,
                        RegOp {
                            reg: reg.clone(),
                            fullname,
                        },
                    );
                    ResponderEvent::Registered {
                        registration: handle,
                    }
                }
                Err(e) => {
                    warn!(name = %reg.name, "mDNS registration failed: {e}");
                    ResponderEvent::RegistrationFailed {
                        registration: handle,
                    }
                }
            };
            (handle, outcome)
        };
        self.shared.send(outcome);
        Ok(handle)
    }

    fn update_txt(&self, registration: OpHandle, txt: &TxtRecord) -> Result<(), ResponderError> {
        let mut inner = self.shared.inner.lock().unwrap();
        let daemon = inner
            .daemon
            .as_ref()
            .ok_or(ResponderError::ResponderUnavailable)?
            .clone();
        let op = inner
            .registrations
            .get_mut(&registration)
            .ok_or(ResponderError::UnknownHandle(registration))?;
        op.reg.txt = txt.clone();

        // Re-announcing under the same fullname replaces the TXT records.
        let info = build_service_info(&op.reg)?;
        daemon
            .register(info)
            .map_err(|e| ResponderError::Backend(e.to_string()))
    }

    fn close(&self, handle: OpHandle) {
        let mut inner = self.shared.inner.lock().unwrap();
        if let Some(op) = inner.browses.remove(&handle) {
            op.cancel.cancel();
            if let Some(daemon) = &inner.daemon {
                let _ = daemon.stop_browse(&op.browse_type);
            }
            return;
        }
        if let Some(fullname) = inner.resolves.remove(&handle) {
            inner.by_fullname.remove(&fullname);
            return;
        }
        if let Some(op) = inner.registrations.remove(&handle) {
            if let Some(daemon) = &inner.daemon {
                let _ = daemon.unregister(&op.fullname);
            }
        }
    }
}

fn build_service_info(reg: &ServiceRegistration) -> Result<ServiceInfo, ResponderError> {
    let ty_domain = match &reg.subtype {
        Some(subtype) => format!("{subtype}.local."),
        None => format!("{}.local.", reg.service_type),
    };
    let ips: Vec<IpAddr> = if reg.addresses.is_empty() {
        local_ipv4_addrs().into_iter().map(IpAddr::V4).collect()
    } else {
        reg.addresses.iter().copied().map(IpAddr::V4).collect()
    };
    let properties: Vec<(&str, &str)> = reg.txt.iter().collect();

    ServiceInfo::new(
        &ty_domain,
        &reg.name,
        &local_hostname(),
        &ips[..],
        reg.port,
        &properties[..],
    )
    .map_err(|e| ResponderError::Backend(e.to_string()))
}

/// Forwards browse-channel events onto the port channel.
async fn browse_pump(
    rx: Receiver<ServiceEvent>,
    shared: Arc<Shared>,
    browse: OpHandle,
    base_type: String,
    cancel: CancellationToken,
) {
    loop {
        let rx2 = rx.clone();
        tokio::select! {
            _ = cancel.cancelled() => return,
            result = tokio::task::spawn_blocking(move || rx2.recv_timeout(RECV_TIMEOUT)) => {
                if let Ok(Ok(event)) = result {
                    handle_service_event(&shared, browse, &base_type, event);
                } else {
                    // Timeout or a torn-down daemon channel; back off so a
                    // dead channel cannot spin.
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }
}

fn handle_service_event(
    shared: &Arc<Shared>,
    browse: OpHandle,
    base_type: &str,
    event: ServiceEvent,
) {
    match event {
        ServiceEvent::ServiceFound(_ty, fullname) => {
            if let Some(key) = key_from_fullname(&fullname, base_type) {
                shared.send(ResponderEvent::BrowseAdded { browse, key });
            }
        }
        ServiceEvent::ServiceRemoved(_ty, fullname) => {
            shared.inner.lock().unwrap().cache.remove(&fullname);
            if let Some(key) = key_from_fullname(&fullname, base_type) {
                shared.send(ResponderEvent::BrowseRemoved { browse, key });
            }
        }
        ServiceEvent::ServiceResolved(info) => {
            let fullname = info.get_fullname().to_string();
            let mut txt = TxtRecord::new();
            for property in info.get_properties().iter() {
                txt.set(property.key(), property.val_str());
            }
            let addrs: Vec<Ipv4Addr> = info
                .get_addresses()
                .iter()
                .filter_map(|ip| match ip {
                    IpAddr::V4(v4) => Some(*v4),
                    _ => None,
                })
                .collect();

            let resolution = Resolution {
                host: info.get_hostname().to_string(),
                port: info.get_port(),
                txt: txt.clone(),
                addrs,
            };

            let resolve = {
                let mut inner = shared.inner.lock().unwrap();
                inner.cache.insert(fullname.clone(), resolution.clone());
                inner.by_fullname.get(&fullname).copied()
            };
            if let Some(resolve) = resolve {
                shared.send(ResponderEvent::Resolved {
                    resolve,
                    host: resolution.host,
                    port: resolution.port,
                    txt,
                });
            }
        }
        other => debug!(?other, "ignoring mDNS event"),
    }
}

/// Watches daemon health; a daemon error fails the client and starts the
/// background reconnect loop.
fn monitor_pump(
    rx: Receiver<DaemonEvent>,
    shared: Arc<Shared>,
    cancel: CancellationToken,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>> {
    Box::pin(async move {
        loop {
            let rx2 = rx.clone();
            tokio::select! {
                _ = cancel.cancelled() => return,
                result = tokio::task::spawn_blocking(move || rx2.recv_timeout(RECV_TIMEOUT)) => {
                    match result {
                        Ok(Ok(DaemonEvent::Error(e))) => {
                            warn!("mDNS daemon failed: {e}");
                            {
                                let mut inner = shared.inner.lock().unwrap();
                                inner.state = ClientState::Failed;
                                inner.daemon = None;
                            }
                            shared.send(ResponderEvent::StateChanged(ClientState::Failed));
                            tokio::spawn(reconnect_loop(shared, cancel));
                            return;
                        }
                        Ok(Ok(_)) => {}
                        _ => tokio::time::sleep(Duration::from_millis(100)).await,
                    }
                }
            }
        }
    })
}

/// Re-creates the daemon after a failure. Consumers rebuild their
/// browses and registrations when they observe `Running` again.
fn reconnect_loop(
    shared: Arc<Shared>,
    cancel: CancellationToken,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>> {
    Box::pin(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(RECONNECT_INTERVAL) => {}
            }

            match ServiceDaemon::new() {
                Ok(daemon) => {
                    let monitor = daemon.monitor().ok();
                    {
                        let mut inner = shared.inner.lock().unwrap();
                        inner.daemon = Some(daemon);
                        inner.state = ClientState::Running;
                        inner.browses.clear();
                        inner.resolves.clear();
                        inner.by_fullname.clear();
                        inner.cache.clear();
                        inner.registrations.clear();
                    }
                    shared.send(ResponderEvent::StateChanged(ClientState::Running));
                    if let Some(rx) = monitor {
                        tokio::spawn(monitor_pump(rx, shared, cancel));
                    }
                    return;
                }
                Err(e) => debug!("mDNS daemon still unavailable: {e}"),
            }
        }
    })
}

fn key_from_fullname(fullname: &str, base_type: &str) -> Option<ServiceKey> {
    let name = fullname.strip_suffix(base_type)?.strip_suffix('.')?;
    let service_type = base_type.strip_suffix(".local.").unwrap_or(base_type);
    Some(ServiceKey {
        interface_index: 0,
        protocol: Proto::V4,
        name: name.to_string(),
        service_type: service_type.to_string(),
        domain: "local.".to_string(),
    })
}

/// Local non-loopback IPv4 addresses, excluding link-local.
pub fn local_ipv4_addrs() -> Vec<Ipv4Addr> {
    let mut ips = Vec::new();

    let Ok(interfaces) = if_addrs::get_if_addrs() else {
        return ips;
    };

    for iface in interfaces {
        if iface.is_loopback() {
            continue;
        }
        if let IpAddr::V4(ipv4) = iface.ip() {
            if ipv4.octets()[0] == 127 {
                continue;
            }
            if ipv4.octets()[0] == 169 && ipv4.octets()[1] == 254 {
                continue;
            }
            ips.push(ipv4);
        }
    }

    ips
}

/// The local hostname suffixed with `.local.` as mDNS requires.
pub fn local_hostname() -> String {
    let mut name = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".into());

    if !name.ends_with(".local.") {
        name = name.trim_end_matches('.').to_string();
        name.push_str(".local.");
    }
    name
}
