//! The [`MasterEntry`] record describing one advertised master.

use std::fmt;
use std::net::{Ipv4Addr, SocketAddrV4};

use serde::{Deserialize, Serialize};

/// The address value used before a master has been resolved.
pub const UNRESOLVED_ADDRESS: SocketAddrV4 = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0);

/// A master as seen through DNS-SD.
///
/// On the discovery side `service_name` is the full DNS-SD instance name
/// as browsed (e.g. `MasterA-50`). On the registration side it is the
/// base name; [`MasterEntry::service_name`] derives the advertised
/// instance name by appending the priority.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MasterEntry {
    pub service_name: String,
    pub address: SocketAddrV4,
    /// Higher wins the election.
    pub priority: u8,
    /// Administrative cohort tag. Masters in different scopes never see
    /// each other.
    pub scope: String,
}

impl MasterEntry {
    /// Returns the DNS-SD instance name to advertise: `<base>-<priority>`.
    pub fn service_name(&self) -> String {
        format!("{}-{}", self.service_name, self.priority)
    }

    /// True when the address has been resolved to a real host.
    ///
    /// Entries with a wildcard host are never electable.
    pub fn has_concrete_address(&self) -> bool {
        *self.address.ip() != Ipv4Addr::UNSPECIFIED
    }

    /// Field-wise refresh from a newer record.
    pub fn update_from(&mut self, other: &MasterEntry) {
        self.service_name = other.service_name.clone();
        self.address = other.address;
        self.priority = other.priority;
        self.scope = other.scope.clone();
    }
}

impl fmt::Display for MasterEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Master: '{}' @ {}, priority {}, scope {}",
            self.service_name, self.address, self.priority, self.scope
        )
    }
}
