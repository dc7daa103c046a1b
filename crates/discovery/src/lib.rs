//! DNS-SD discovery and registration of E1.33 masters.
//!
//! The [`DiscoveryAgent`] owns everything that talks to the responder:
//! the scope-bounded browse, one resolver per discovered instance, and
//! the local master registrations. All of its state is mutated on a
//! single event loop; responder callbacks and the thread-safe entry
//! points are marshalled onto that loop.

mod agent;
mod registration;
mod resolver;

pub use agent::DiscoveryAgent;

use e133_protocol::MasterEntry;
use e133_protocol::constants::DEFAULT_SCOPE;

/// Errors for discovery operations.
#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("no mDNS responder available")]
    ResponderUnavailable,

    #[error("failed to start browsing: {0}")]
    Browse(e133_responder::ResponderError),

    #[error("discovery agent is not running")]
    NotRunning,
}

/// Configuration for a [`DiscoveryAgent`].
///
/// The scope is fixed for the agent's lifetime; changing scope means
/// stopping this agent and starting a new one.
#[derive(Debug, Clone)]
pub struct DiscoveryOptions {
    pub scope: String,
    /// When false the agent only registers; it never browses.
    pub watch_masters: bool,
}

impl Default for DiscoveryOptions {
    fn default() -> Self {
        Self {
            scope: DEFAULT_SCOPE.to_string(),
            watch_masters: true,
        }
    }
}

/// Kind of change to the set of visible masters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MasterEvent {
    /// A master appeared, or an already-known master's record changed.
    Added,
    Removed,
}

/// Stream of master changes, one receiver per agent.
pub type MasterEventRx = tokio::sync::mpsc::UnboundedReceiver<(MasterEvent, MasterEntry)>;

pub(crate) type MasterEventTx = tokio::sync::mpsc::UnboundedSender<(MasterEvent, MasterEntry)>;
