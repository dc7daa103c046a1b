//! The responder client port: a narrow, mockable surface over a host
//! mDNS responder.
//!
//! The discovery layer only ever talks to the [`Responder`] trait, so the
//! backing implementation can be swapped without touching it. Two
//! backends exist: [`MdnsResponder`] bridging to the host responder via
//! the `mdns-sd` daemon, and [`MemoryResponder`] for deterministic tests.

use std::net::Ipv4Addr;

use tokio::sync::mpsc;

use e133_protocol::TxtRecord;

pub mod mdns;
pub mod memory;

pub use mdns::MdnsResponder;
pub use memory::{MemoryResponder, PublishedService};

/// Channel on which a responder delivers its asynchronous callbacks.
pub type EventSender = mpsc::UnboundedSender<ResponderEvent>;

/// Errors raised by responder operations.
#[derive(Debug, thiserror::Error)]
pub enum ResponderError {
    #[error("no mDNS responder available")]
    ResponderUnavailable,

    #[error("unknown operation handle {0:?}")]
    UnknownHandle(OpHandle),

    #[error("responder backend error: {0}")]
    Backend(String),
}

/// Lifecycle state of the connection to the host responder.
///
/// Registrations only commit while `Running`; any transition out of
/// `Running` invalidates every open handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Connecting,
    Running,
    Failed,
    Collision,
}

/// Network protocol family of a browse result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Proto {
    V4,
    V6,
}

/// Opaque handle for an in-flight browse, resolve, or registration.
///
/// Closing an unknown or already-closed handle is a no-op.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OpHandle(pub(crate) u64);

/// Identity of one discovered service instance.
///
/// Responders re-announce the same instance once per interface; equality
/// over this whole tuple is what deduplicates those announcements.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServiceKey {
    pub interface_index: u32,
    pub protocol: Proto,
    /// DNS-SD instance name, e.g. `MasterA-50`.
    pub name: String,
    /// Bare service type, e.g. `_draft-e133-master._tcp`.
    pub service_type: String,
    pub domain: String,
}

/// Parameters for publishing one service instance.
#[derive(Debug, Clone)]
pub struct ServiceRegistration {
    /// Instance name. Never auto-renamed on collision.
    pub name: String,
    /// Bare service type.
    pub service_type: String,
    /// Bare subtype chain, e.g. `_default._sub._draft-e133-master._tcp`.
    pub subtype: Option<String>,
    pub port: u16,
    /// Addresses to advertise; empty means "all local interfaces".
    pub addresses: Vec<Ipv4Addr>,
    pub txt: TxtRecord,
}

/// Asynchronous callbacks from the responder, delivered on the channel
/// installed with [`Responder::subscribe`].
#[derive(Debug, Clone)]
pub enum ResponderEvent {
    StateChanged(ClientState),

    BrowseAdded { browse: OpHandle, key: ServiceKey },
    BrowseRemoved { browse: OpHandle, key: ServiceKey },

    /// A resolve produced the instance's host target, port, and TXT data.
    Resolved {
        resolve: OpHandle,
        host: String,
        port: u16,
        txt: TxtRecord,
    },
    ResolveFailed { resolve: OpHandle },
    /// Host-to-address lookup completed. `None` means no IPv4 address
    /// was available.
    AddressResolved {
        resolve: OpHandle,
        addr: Option<Ipv4Addr>,
    },

    Registered { registration: OpHandle },
    /// The instance name is already taken on the network. The
    /// registration has been cancelled, not renamed.
    NameCollision { registration: OpHandle },
    RegistrationFailed { registration: OpHandle },
}

/// The narrow port onto a host mDNS responder.
///
/// All operations are non-blocking; outcomes arrive as
/// [`ResponderEvent`]s. Implementations must be safe to call from any
/// task.
pub trait Responder: Send + Sync {
    /// Installs the event channel. One subscriber at a time; a later
    /// call replaces the earlier channel.
    fn subscribe(&self, tx: EventSender);

    fn state(&self) -> ClientState;

    /// Starts browsing for `service_type`, narrowed to `subtype` when
    /// given. Fails immediately when the host responder is unreachable.
    fn start_browse(
        &self,
        service_type: &str,
        subtype: Option<&str>,
    ) -> Result<OpHandle, ResponderError>;

    /// Starts resolving one discovered instance to host/port/TXT.
    fn start_resolve(&self, key: &ServiceKey) -> Result<OpHandle, ResponderError>;

    /// Starts a host-to-IPv4 lookup for a resolved instance.
    fn start_address(&self, resolve: OpHandle, host: &str) -> Result<(), ResponderError>;

    /// Starts publishing a service instance. The outcome arrives as
    /// `Registered`, `NameCollision`, or `RegistrationFailed`.
    fn start_register(&self, reg: &ServiceRegistration) -> Result<OpHandle, ResponderError>;

    /// Replaces the TXT data of a committed registration in place. The
    /// instance name and type are unchanged.
    fn update_txt(&self, registration: OpHandle, txt: &TxtRecord) -> Result<(), ResponderError>;

    /// Releases a handle and cancels its operation. Idempotent.
    fn close(&self, handle: OpHandle);
}

/// Returns the responder appropriate for this host.
///
/// Must be called from within a tokio runtime; the backend spawns pump
/// tasks for its callback streams.
pub fn default_responder() -> std::sync::Arc<dyn Responder> {
    std::sync::Arc::new(MdnsResponder::new())
}
