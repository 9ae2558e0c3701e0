//! Connection admission control
//!
//! Keeps a ban list and a live connection counter per peer IP. Listeners
//! consult the filter before a session exists for the peer.

use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use tracing::debug;

use crate::error::RefusedConnection;

/// Default ceiling of live connections per IP
pub const DEFAULT_MAX_CONNECTIONS_PER_IP: usize = 10;

/// Per-IP admission filter
///
/// The ban list and the counters are guarded independently, so editing the
/// ban list never touches live counts.
#[derive(Debug)]
pub struct ConnectionFilter {
    banned: RwLock<HashSet<IpAddr>>,
    connections: DashMap<IpAddr, usize>,
    max_connections_per_ip: AtomicUsize,
}

impl ConnectionFilter {
    /// Create a filter with the default per-IP ceiling
    pub fn new() -> Self {
        Self::with_max_connections(DEFAULT_MAX_CONNECTIONS_PER_IP)
    }

    /// Create a filter with a custom per-IP ceiling
    pub fn with_max_connections(max_connections_per_ip: usize) -> Self {
        Self {
            banned: RwLock::new(HashSet::new()),
            connections: DashMap::new(),
            max_connections_per_ip: AtomicUsize::new(max_connections_per_ip),
        }
    }

    pub fn max_connections_per_ip(&self) -> usize {
        self.max_connections_per_ip.load(Ordering::Relaxed)
    }

    pub fn set_max_connections_per_ip(&self, max: usize) {
        self.max_connections_per_ip.store(max, Ordering::Relaxed);
    }

    pub fn ban(&self, ip: IpAddr) {
        if self.banned.write().insert(ip) {
            debug!(address = %ip, "Address banned");
        }
    }

    pub fn unban(&self, ip: IpAddr) {
        if self.banned.write().remove(&ip) {
            debug!(address = %ip, "Address unbanned");
        }
    }

    pub fn is_banned(&self, ip: IpAddr) -> bool {
        self.banned.read().contains(&ip)
    }

    pub fn banned_addresses(&self) -> Vec<IpAddr> {
        self.banned.read().iter().copied().collect()
    }

    /// Admit a new connection from `ip`, incrementing its live count.
    ///
    /// Refuses banned addresses and addresses already at the ceiling.
    pub fn validate_and_add(&self, ip: IpAddr) -> Result<(), RefusedConnection> {
        if self.is_banned(ip) {
            return Err(RefusedConnection::Banned(ip));
        }

        let max = self.max_connections_per_ip();
        match self.connections.entry(ip) {
            Entry::Occupied(mut entry) => {
                if *entry.get() >= max {
                    return Err(RefusedConnection::TooManyConnections { ip, max });
                }
                *entry.get_mut() += 1;
            }
            Entry::Vacant(entry) => {
                if max == 0 {
                    return Err(RefusedConnection::TooManyConnections { ip, max });
                }
                entry.insert(1);
            }
        }
        Ok(())
    }

    /// Release one connection slot for `ip`. The counter is dropped at zero.
    pub fn remove(&self, ip: IpAddr) {
        if let Entry::Occupied(mut entry) = self.connections.entry(ip) {
            if *entry.get() <= 1 {
                entry.remove();
            } else {
                *entry.get_mut() -= 1;
            }
        }
    }

    /// Live connections currently admitted for `ip`
    pub fn connection_count(&self, ip: IpAddr) -> usize {
        self.connections.get(&ip).map(|count| *count).unwrap_or(0)
    }

    /// Number of distinct addresses with live connections
    pub fn tracked_addresses(&self) -> usize {
        self.connections.len()
    }
}

impl Default for ConnectionFilter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_err, assert_ok};

    fn test_ip() -> IpAddr {
        "192.168.1.20".parse().unwrap()
    }

    #[test]
    fn test_connection_ceiling() {
        let filter = ConnectionFilter::with_max_connections(2);
        let ip = test_ip();

        assert_ok!(filter.validate_and_add(ip));
        assert_ok!(filter.validate_and_add(ip));
        assert_eq!(
            filter.validate_and_add(ip),
            Err(RefusedConnection::TooManyConnections { ip, max: 2 })
        );

        filter.remove(ip);
        assert_ok!(filter.validate_and_add(ip));
        assert_eq!(filter.connection_count(ip), 2);
    }

    #[test]
    fn test_counter_removed_at_zero() {
        let filter = ConnectionFilter::new();
        let ip = test_ip();

        filter.validate_and_add(ip).unwrap();
        assert_eq!(filter.tracked_addresses(), 1);

        filter.remove(ip);
        assert_eq!(filter.connection_count(ip), 0);
        assert_eq!(filter.tracked_addresses(), 0);

        // Removing an unknown address is a no-op
        filter.remove(ip);
        assert_eq!(filter.tracked_addresses(), 0);
    }

    #[test]
    fn test_banned_address_refused() {
        let filter = ConnectionFilter::new();
        let ip = test_ip();

        filter.validate_and_add(ip).unwrap();
        filter.ban(ip);
        assert!(filter.is_banned(ip));
        assert_eq!(filter.validate_and_add(ip), Err(RefusedConnection::Banned(ip)));

        // Ban edits leave live counters alone
        assert_eq!(filter.connection_count(ip), 1);

        filter.unban(ip);
        assert!(filter.validate_and_add(ip).is_ok());
        assert_eq!(filter.connection_count(ip), 2);
    }

    #[test]
    fn test_zero_ceiling_refuses_everything() {
        let filter = ConnectionFilter::with_max_connections(0);
        assert_err!(filter.validate_and_add(test_ip()));
        assert_eq!(filter.tracked_addresses(), 0);
    }
}
