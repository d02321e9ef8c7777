// src/core/master/connection_manager.rs

//! Tracks the set of range servers known to the coordinator: their proxy
//! names, network addresses, connectedness and recovery status.

use crate::core::types::Location;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::info;

#[derive(Debug, Clone)]
pub struct RangeServerConnection {
    pub location: Location,
    pub hostname: String,
    pub addr: SocketAddr,
    pub connected: bool,
    pub recovering: bool,
}

#[derive(Default)]
pub struct RangeServerConnectionManager {
    servers: RwLock<BTreeMap<Location, RangeServerConnection>>,
    round_robin: AtomicUsize,
}

impl RangeServerConnectionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers (or re-registers) a server and marks it connected.
    pub fn connect_server(&self, location: Location, hostname: String, addr: SocketAddr) {
        let mut servers = self.servers.write();
        info!("RangeServer {} connected from {} ({})", location, hostname, addr);
        servers
            .entry(location.clone())
            .and_modify(|c| {
                c.connected = true;
                c.hostname = hostname.clone();
                c.addr = addr;
            })
            .or_insert(RangeServerConnection {
                location,
                hostname,
                addr,
                connected: true,
                recovering: false,
            });
    }

    /// Marks a server disconnected; the entry survives until recovery
    /// finalizes and erases it.
    pub fn disconnect_server(&self, location: &Location) -> bool {
        let mut servers = self.servers.write();
        match servers.get_mut(location) {
            Some(conn) => {
                info!("RangeServer {} disconnected", location);
                conn.connected = false;
                true
            }
            None => false,
        }
    }

    pub fn erase_server(&self, location: &Location) {
        self.servers.write().remove(location);
    }

    pub fn find(&self, location: &Location) -> Option<RangeServerConnection> {
        self.servers.read().get(location).cloned()
    }

    pub fn addr_of(&self, location: &Location) -> Option<SocketAddr> {
        self.servers.read().get(location).map(|c| c.addr)
    }

    pub fn set_recovering(&self, location: &Location, recovering: bool) {
        if let Some(conn) = self.servers.write().get_mut(location) {
            conn.recovering = recovering;
        }
    }

    pub fn is_recovering(&self, location: &Location) -> bool {
        self.servers
            .read()
            .get(location)
            .is_some_and(|c| c.recovering)
    }

    /// All currently connected servers, in location order.
    pub fn connected_servers(&self) -> Vec<Location> {
        self.servers
            .read()
            .values()
            .filter(|c| c.connected)
            .map(|c| c.location.clone())
            .collect()
    }

    /// Total number of known servers, connected or not.
    pub fn server_count(&self) -> usize {
        self.servers.read().len()
    }

    /// Round-robin pick over the currently connected servers.
    pub fn next_available_server(&self) -> Option<Location> {
        let connected = self.connected_servers();
        if connected.is_empty() {
            return None;
        }
        let idx = self.round_robin.fetch_add(1, Ordering::Relaxed) % connected.len();
        Some(connected[idx].clone())
    }

    /// True when at least `quorum_percent` of the known servers are connected.
    pub fn has_quorum(&self, quorum_percent: u32) -> bool {
        let servers = self.servers.read();
        let total = servers.len();
        let connected = servers.values().filter(|c| c.connected).count();
        let mut required = (total * quorum_percent as usize) / 100;
        if required == 0 {
            required = 1;
        }
        connected >= required
    }
}
