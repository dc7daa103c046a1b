//! Wire constants for E1.33 master discovery.
//!
//! The DNS-SD names and TXT keys here are bit-exact for interoperability
//! with other E1.33 implementations; do not change them casually.

use std::time::Duration;

/// DNS-SD service type under which masters advertise themselves.
pub const MASTER_SERVICE: &str = "_draft-e133-master._tcp";

/// Scope used when none is configured.
pub const DEFAULT_SCOPE: &str = "default";

/// TXT key carrying the TXT schema version.
pub const TXT_VERSION_KEY: &str = "txtvers";

/// TXT key carrying the master's priority (0-255, decimal ASCII).
pub const PRIORITY_KEY: &str = "priority";

/// TXT key carrying the master's configuration scope.
pub const SCOPE_KEY: &str = "confScope";

/// Current TXT schema version. Records with any other version are dropped.
pub const TXT_VERSION: u8 = 1;

/// Status byte sent by a node that considers itself the master.
pub const MASTER_ASSERTED: u8 = b'm';

/// Status byte sent by a node that no longer considers itself the master.
pub const MASTER_RELEASED: u8 = b'b';

/// Bound on a single TCP connect attempt.
pub const TCP_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Interval between reconnection attempts to a known master.
pub const TCP_RETRY_INTERVAL: Duration = Duration::from_secs(5);

/// How often a master pushes its status byte to each connected client.
pub const MASTER_UPDATE_PERIOD: Duration = Duration::from_secs(1);

/// Priority a master advertises when none is configured.
pub const DEFAULT_MASTER_PRIORITY: u8 = 50;

/// Priority assumed for a discovered master before its TXT record is parsed.
pub const DEFAULT_RESOLVED_PRIORITY: u8 = 100;

/// Returns the scope-qualified DNS-SD subtype, e.g.
/// `_default._sub._draft-e133-master._tcp`.
pub fn scope_subtype(scope: &str) -> String {
    format!("_{scope}._sub.{MASTER_SERVICE}")
}
