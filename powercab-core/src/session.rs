//! Connection session state.
//!
//! A connection moves `Unauthenticated → Authenticated` on a completed
//! login, then `→ Heartbeating` on its first valid heartbeat, and ends in
//! `Closed`. The station-side lifecycle (`pending → active → inactive`)
//! lives in storage and is driven by the login handler and the sweep.

use std::net::SocketAddr;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tracing::debug;

use crate::types::StationId;

/// Connection sub-states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Socket open, no completed login yet. Only `Login` is accepted.
    Unauthenticated,
    /// Login completed, station identity resolved.
    Authenticated,
    /// At least one valid heartbeat received since login.
    Heartbeating,
    /// Evicted, swept, or the socket dropped.
    Closed,
}

#[derive(Debug)]
struct ConnInfo {
    state: ConnState,
    box_id: Option<String>,
    station_id: Option<StationId>,
    secret_key: Option<Vec<u8>>,
    last_heartbeat: DateTime<Utc>,
    suspicious: u32,
}

/// One live station socket.
///
/// The registry owns the canonical map of these; handlers and the engine
/// hold `Arc` clones. Outbound frames go through the writer channel so the
/// read loop is never blocked on the socket, and closing is signalled
/// through a watch channel the read loop selects on.
#[derive(Debug)]
pub struct StationConnection {
    pub socket_id: u64,
    pub remote_addr: SocketAddr,
    outbound: mpsc::Sender<Vec<u8>>,
    shutdown: watch::Sender<bool>,
    info: Mutex<ConnInfo>,
}

impl StationConnection {
    pub fn new(
        socket_id: u64,
        remote_addr: SocketAddr,
        outbound: mpsc::Sender<Vec<u8>>,
        shutdown: watch::Sender<bool>,
    ) -> Self {
        Self {
            socket_id,
            remote_addr,
            outbound,
            shutdown,
            info: Mutex::new(ConnInfo {
                state: ConnState::Unauthenticated,
                box_id: None,
                station_id: None,
                secret_key: None,
                last_heartbeat: Utc::now(),
                suspicious: 0,
            }),
        }
    }

    pub fn state(&self) -> ConnState {
        self.info.lock().state
    }

    pub fn is_authenticated(&self) -> bool {
        matches!(
            self.state(),
            ConnState::Authenticated | ConnState::Heartbeating
        )
    }

    pub fn station_id(&self) -> Option<StationId> {
        self.info.lock().station_id
    }

    pub fn box_id(&self) -> Option<String> {
        self.info.lock().box_id.clone()
    }

    pub fn secret_key(&self) -> Option<Vec<u8>> {
        self.info.lock().secret_key.clone()
    }

    pub fn last_heartbeat(&self) -> DateTime<Utc> {
        self.info.lock().last_heartbeat
    }

    /// Complete the login handshake: bind identity and enter
    /// `Authenticated`. The registry must have evicted any duplicate for
    /// the same station before this is called.
    pub fn authenticate(&self, box_id: &str, station_id: StationId, secret_key: Vec<u8>) {
        let mut info = self.info.lock();
        info.box_id = Some(box_id.to_string());
        info.station_id = Some(station_id);
        info.secret_key = Some(secret_key);
        info.state = ConnState::Authenticated;
        info.last_heartbeat = Utc::now();
    }

    /// Record a valid heartbeat; enters `Heartbeating` from
    /// `Authenticated`.
    pub fn mark_heartbeat(&self) {
        let mut info = self.info.lock();
        info.last_heartbeat = Utc::now();
        if info.state == ConnState::Authenticated {
            info.state = ConnState::Heartbeating;
        }
    }

    /// Count one suspicious packet; returns the new count.
    pub fn record_suspicious(&self) -> u32 {
        let mut info = self.info.lock();
        info.suspicious += 1;
        info.suspicious
    }

    /// A valid packet resets the suspicious counter to zero.
    pub fn record_valid(&self) {
        self.info.lock().suspicious = 0;
    }

    pub fn suspicious_count(&self) -> u32 {
        self.info.lock().suspicious
    }

    /// Queue a frame for the writer task. Fails once the connection is
    /// closing.
    pub async fn send(&self, frame: Vec<u8>) -> Result<(), mpsc::error::SendError<Vec<u8>>> {
        self.outbound.send(frame).await
    }

    /// Enter `Closed` and wake the read loop. Safe to call more than once.
    pub fn close(&self) {
        let mut info = self.info.lock();
        if info.state == ConnState::Closed {
            return;
        }
        info.state = ConnState::Closed;
        drop(info);
        debug!(socket_id = self.socket_id, "closing station connection");
        let _ = self.shutdown.send(true);
    }

    pub fn is_closed(&self) -> bool {
        self.state() == ConnState::Closed
    }

    /// Subscribe to the close signal; the read loop selects on this.
    pub fn closed_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }
}
