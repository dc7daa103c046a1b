//! Per-instance resolution state machine.
//!
//! One resolver exists per discovered service instance. It drives the
//! resolve → TXT check → address lookup chain and holds the most
//! recently assembled record. Emission (and duplicate suppression) is
//! the agent's job, keyed by instance name across interfaces.

use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;

use tracing::{debug, warn};

use e133_protocol::constants::DEFAULT_RESOLVED_PRIORITY;
use e133_protocol::entry::UNRESOLVED_ADDRESS;
use e133_protocol::{MasterEntry, TxtRecord, entry_from_txt};
use e133_responder::{OpHandle, Responder, ResponderError, ServiceKey};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ResolverState {
    Resolving,
    Addressing,
    Ready,
    Failed,
}

/// The agent's next move after feeding a resolve result in.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum ResolveStep {
    /// Host target changed; start an address lookup for it.
    LookupAddress(String),
    /// Record data changed but the host did not; re-check completeness.
    CheckComplete,
    /// Record rejected or incomplete; nothing to do.
    None,
}

pub(crate) struct MasterResolver {
    key: ServiceKey,
    responder: Arc<dyn Responder>,
    handle: OpHandle,
    state: ResolverState,
    host_target: Option<String>,
    port: u16,
    priority: u8,
    scope: Option<String>,
    address: Option<Ipv4Addr>,
}

impl MasterResolver {
    /// Starts resolution for one instance.
    pub(crate) fn start(
        responder: Arc<dyn Responder>,
        key: ServiceKey,
    ) -> Result<Self, ResponderError> {
        let handle = responder.start_resolve(&key)?;
        Ok(Self {
            key,
            responder,
            handle,
            state: ResolverState::Resolving,
            host_target: None,
            port: 0,
            priority: DEFAULT_RESOLVED_PRIORITY,
            scope: None,
            address: None,
        })
    }

    pub(crate) fn handle(&self) -> OpHandle {
        self.handle
    }

    pub(crate) fn key(&self) -> &ServiceKey {
        &self.key
    }

    /// Feeds in a resolve result: validates the TXT record, then decides
    /// whether an address lookup is needed.
    pub(crate) fn on_resolved(&mut self, host: String, port: u16, txt: &TxtRecord) -> ResolveStep {
        let parsed = match entry_from_txt(&self.key.name, UNRESOLVED_ADDRESS, txt) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!(instance = %self.key.name, "dropping TXT record: {e}");
                return ResolveStep::None;
            }
        };

        self.priority = parsed.priority;
        self.scope = Some(parsed.scope);
        self.port = port;

        if self.host_target.as_deref() == Some(host.as_str()) {
            return ResolveStep::CheckComplete;
        }

        self.host_target = Some(host.clone());
        self.state = ResolverState::Addressing;
        ResolveStep::LookupAddress(host)
    }

    /// Feeds in an address lookup result. Returns true when the record
    /// became complete and is worth an emission check.
    pub(crate) fn on_address(&mut self, addr: Option<Ipv4Addr>) -> bool {
        match addr {
            Some(ip) => {
                debug!(instance = %self.key.name, address = %ip, "resolved address");
                self.address = Some(ip);
                self.state = ResolverState::Ready;
                true
            }
            None => {
                warn!(
                    instance = %self.key.name,
                    host = ?self.host_target,
                    "no IPv4 address for host"
                );
                false
            }
        }
    }

    pub(crate) fn on_resolve_failed(&mut self) {
        warn!(instance = %self.key.name, "failed to resolve; waiting for re-announcement");
        self.state = ResolverState::Failed;
    }

    /// The assembled record, once host, address, and TXT data are all in.
    ///
    /// Nothing is produced mid-lookup: a host change parks the record in
    /// `Addressing` until the new address arrives.
    pub(crate) fn current_entry(&self) -> Option<MasterEntry> {
        if self.state != ResolverState::Ready {
            return None;
        }
        let address = self.address?;
        let scope = self.scope.clone()?;
        Some(MasterEntry {
            service_name: self.key.name.clone(),
            address: SocketAddrV4::new(address, self.port),
            priority: self.priority,
            scope,
        })
    }

    pub(crate) fn close(&mut self) {
        self.responder.close(self.handle);
    }
}
