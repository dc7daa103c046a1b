//! Priority election over the known-master table.

use std::collections::{HashMap, HashSet};
use std::net::{Ipv4Addr, SocketAddrV4};

use e133_discovery::MasterEvent;
use e133_protocol::MasterEntry;

/// Table row for one known master, keyed externally by service name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KnownMaster {
    pub address: SocketAddrV4,
    pub priority: u8,
}

/// The outcome of an election.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Elected {
    pub service_name: String,
    pub address: SocketAddrV4,
    pub priority: u8,
}

impl Elected {
    /// True when this node itself is the elected master: the elected
    /// address is one of the local IPs at the local listen port.
    pub fn is_local(&self, local_ips: &HashSet<Ipv4Addr>, listen_port: u16) -> bool {
        self.address.port() == listen_port && local_ips.contains(self.address.ip())
    }
}

/// The set of masters currently visible, with priority election.
#[derive(Debug, Default)]
pub struct MasterList {
    masters: HashMap<String, KnownMaster>,
}

impl MasterList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies one discovery event: insert on first sight, update in
    /// place on re-announcement, drop on removal.
    pub fn apply(&mut self, event: MasterEvent, entry: &MasterEntry) {
        match event {
            MasterEvent::Added => {
                self.masters.insert(
                    entry.service_name.clone(),
                    KnownMaster {
                        address: entry.address,
                        priority: entry.priority,
                    },
                );
            }
            MasterEvent::Removed => {
                self.masters.remove(&entry.service_name);
            }
        }
    }

    pub fn get(&self, service_name: &str) -> Option<&KnownMaster> {
        self.masters.get(service_name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &KnownMaster)> {
        self.masters.iter().map(|(name, m)| (name.as_str(), m))
    }

    pub fn len(&self) -> usize {
        self.masters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.masters.is_empty()
    }

    /// Elects the preferred master: highest priority among entries with
    /// a concrete address; ties broken by lowest address, then name.
    pub fn elect(&self) -> Option<Elected> {
        self.masters
            .iter()
            .filter(|(_, m)| *m.address.ip() != Ipv4Addr::UNSPECIFIED)
            .max_by(|(name_a, a), (name_b, b)| {
                a.priority
                    .cmp(&b.priority)
                    .then_with(|| b.address.cmp(&a.address))
                    .then_with(|| name_b.cmp(name_a))
            })
            .map(|(name, m)| Elected {
                service_name: name.clone(),
                address: m.address,
                priority: m.priority,
            })
    }
}
