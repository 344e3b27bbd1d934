//! Connection registry.
//!
//! Tracks one [`StationConnection`] per live socket, keyed both by socket
//! id and by resolved station id. Enforces the single-writer invariant: at
//! most one authenticated connection per station, with the older socket
//! evicted before a newer login completes. Also owns the suspicious-packet
//! budget and the heartbeat sweep.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::session::StationConnection;
use crate::types::StationId;

#[derive(Default)]
struct Inner {
    by_socket: HashMap<u64, Arc<StationConnection>>,
    by_station: HashMap<StationId, u64>,
}

pub struct ConnectionRegistry {
    max_suspicious: u32,
    heartbeat_timeout: Duration,
    inner: Mutex<Inner>,
}

impl ConnectionRegistry {
    pub fn new(max_suspicious: u32, heartbeat_timeout: Duration) -> Self {
        Self {
            max_suspicious,
            heartbeat_timeout,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Register a freshly accepted connection.
    pub fn add(&self, conn: Arc<StationConnection>) {
        let mut inner = self.inner.lock();
        inner.by_socket.insert(conn.socket_id, conn);
    }

    /// Deregister a socket; clears the station mapping if it points at
    /// this socket.
    pub fn remove_by_socket(&self, socket_id: u64) -> Option<Arc<StationConnection>> {
        let mut inner = self.inner.lock();
        let conn = inner.by_socket.remove(&socket_id)?;
        if let Some(station_id) = conn.station_id() {
            if inner.by_station.get(&station_id) == Some(&socket_id) {
                inner.by_station.remove(&station_id);
            }
        }
        Some(conn)
    }

    pub fn get_by_station(&self, station_id: StationId) -> Option<Arc<StationConnection>> {
        let inner = self.inner.lock();
        let socket_id = inner.by_station.get(&station_id)?;
        inner.by_socket.get(socket_id).cloned()
    }

    pub fn connection_count(&self) -> usize {
        self.inner.lock().by_socket.len()
    }

    /// True when the station has a live authenticated connection.
    pub fn is_online(&self, station_id: StationId) -> bool {
        self.get_by_station(station_id)
            .map(|c| c.is_authenticated() && !c.is_closed())
            .unwrap_or(false)
    }

    /// Bind a station id to a connection as part of a successful login.
    ///
    /// Any existing connection for the same station on a different socket
    /// is closed and deregistered first, so the caller may only mark the
    /// new connection authenticated after this returns. The evicted
    /// connection, if any, is returned so the caller can cancel waiters
    /// tied to it.
    pub fn bind_station(
        &self,
        station_id: StationId,
        conn: &Arc<StationConnection>,
    ) -> Option<Arc<StationConnection>> {
        let mut inner = self.inner.lock();
        let evicted = match inner.by_station.get(&station_id) {
            Some(&old_socket) if old_socket != conn.socket_id => {
                inner.by_socket.remove(&old_socket)
            }
            _ => None,
        };
        inner.by_station.insert(station_id, conn.socket_id);
        drop(inner);

        if let Some(ref old) = evicted {
            info!(
                station_id,
                old_socket = old.socket_id,
                new_socket = conn.socket_id,
                "duplicate station login, evicting older connection"
            );
            // Best-effort: the old socket may already be gone.
            old.close();
        }
        evicted
    }

    /// Count a suspicious packet against a connection. Returns `true` when
    /// the budget is exceeded and the caller must terminate the socket;
    /// an over-budget connection gets no benefit of the doubt.
    pub fn record_suspicious(&self, conn: &StationConnection) -> bool {
        let count = conn.record_suspicious();
        if count > self.max_suspicious {
            warn!(
                socket_id = conn.socket_id,
                remote = %conn.remote_addr,
                count,
                "suspicious-packet budget exceeded"
            );
            true
        } else {
            debug!(
                socket_id = conn.socket_id,
                count,
                budget = self.max_suspicious,
                "suspicious packet"
            );
            false
        }
    }

    /// Close and deregister connections whose last heartbeat is older than
    /// the timeout, and collapse any stale station mappings discovered on
    /// the way. Returns the swept connections.
    pub fn sweep(&self) -> Vec<Arc<StationConnection>> {
        let now = Utc::now();
        let timeout = chrono::Duration::from_std(self.heartbeat_timeout)
            .unwrap_or_else(|_| chrono::Duration::seconds(300));

        let mut inner = self.inner.lock();
        let stale: Vec<u64> = inner
            .by_socket
            .values()
            .filter(|c| {
                c.is_closed()
                    || (c.is_authenticated() && now - c.last_heartbeat() > timeout)
            })
            .map(|c| c.socket_id)
            .collect();

        let mut swept = Vec::with_capacity(stale.len());
        for socket_id in stale {
            if let Some(conn) = inner.by_socket.remove(&socket_id) {
                swept.push(conn);
            }
        }
        // Collapse station mappings that no longer point at a live socket.
        let by_socket = &inner.by_socket;
        let dangling: Vec<StationId> = inner
            .by_station
            .iter()
            .filter(|(_, socket_id)| !by_socket.contains_key(socket_id))
            .map(|(&station_id, _)| station_id)
            .collect();
        for station_id in dangling {
            inner.by_station.remove(&station_id);
        }
        drop(inner);

        for conn in &swept {
            info!(
                socket_id = conn.socket_id,
                station_id = conn.station_id(),
                "sweeping stale connection"
            );
            conn.close();
        }
        swept
    }

    /// Close and remove every connection (server shutdown).
    pub fn drain(&self) -> Vec<Arc<StationConnection>> {
        let mut inner = self.inner.lock();
        inner.by_station.clear();
        let all: Vec<_> = inner.by_socket.drain().map(|(_, c)| c).collect();
        drop(inner);
        for conn in &all {
            conn.close();
        }
        all
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::{mpsc, watch};

    fn conn(socket_id: u64) -> Arc<StationConnection> {
        let (out_tx, _out_rx) = mpsc::channel(8);
        let (sd_tx, _sd_rx) = watch::channel(false);
        Arc::new(StationConnection::new(
            socket_id,
            "127.0.0.1:4000".parse().unwrap(),
            out_tx,
            sd_tx,
        ))
    }

    fn registry() -> ConnectionRegistry {
        ConnectionRegistry::new(5, Duration::from_secs(300))
    }

    #[test]
    fn test_duplicate_login_evicts_older_socket() {
        let reg = registry();
        let first = conn(1);
        let second = conn(2);
        reg.add(first.clone());
        reg.add(second.clone());

        assert!(reg.bind_station(9, &first).is_none());
        first.authenticate("STN001", 9, b"key".to_vec());
        assert_eq!(reg.get_by_station(9).unwrap().socket_id, 1);

        // Second login for the same station closes the first connection
        // before the new one is bound.
        let evicted = reg.bind_station(9, &second).expect("older evicted");
        assert_eq!(evicted.socket_id, 1);
        assert!(first.is_closed());
        second.authenticate("STN001", 9, b"key".to_vec());

        assert_eq!(reg.get_by_station(9).unwrap().socket_id, 2);
        assert!(!second.is_closed());
        assert!(reg.is_online(9));
    }

    #[test]
    fn test_rebind_same_socket_is_not_eviction() {
        let reg = registry();
        let c = conn(1);
        reg.add(c.clone());
        assert!(reg.bind_station(9, &c).is_none());
        assert!(reg.bind_station(9, &c).is_none());
        assert!(!c.is_closed());
    }

    #[test]
    fn test_suspicious_budget() {
        let reg = registry();
        let c = conn(1);
        reg.add(c.clone());

        // Exactly max_suspicious packets stay under budget.
        for _ in 0..5 {
            assert!(!reg.record_suspicious(&c));
        }
        // A valid frame resets the counter.
        c.record_valid();
        for _ in 0..5 {
            assert!(!reg.record_suspicious(&c));
        }
        // One more malformed frame goes over budget.
        assert!(reg.record_suspicious(&c));
    }

    #[test]
    fn test_remove_by_socket_clears_station_mapping() {
        let reg = registry();
        let c = conn(1);
        reg.add(c.clone());
        reg.bind_station(9, &c);
        c.authenticate("STN001", 9, b"key".to_vec());

        let removed = reg.remove_by_socket(1).unwrap();
        assert_eq!(removed.socket_id, 1);
        assert!(reg.get_by_station(9).is_none());
        assert_eq!(reg.connection_count(), 0);
    }

    #[test]
    fn test_sweep_closes_stale_heartbeats() {
        let reg = ConnectionRegistry::new(5, Duration::from_secs(0));
        let stale = conn(1);
        let fresh = conn(2);
        reg.add(stale.clone());
        reg.add(fresh.clone());
        reg.bind_station(9, &stale);
        stale.authenticate("STN001", 9, b"key".to_vec());
        // fresh never authenticated, so no heartbeat deadline applies yet

        let swept = reg.sweep();
        assert_eq!(swept.len(), 1);
        assert_eq!(swept[0].socket_id, 1);
        assert!(stale.is_closed());
        assert!(reg.get_by_station(9).is_none());
        assert_eq!(reg.connection_count(), 1);
    }
}
