//! The engine facade.
//!
//! Owns the connection registry, the transaction coordinator and the
//! storage handle, and exposes the synchronous-looking operations the HTTP
//! layer calls: borrow, error-return, force-eject, inventory query and the
//! admin round trips. Each one registers a pending request, writes a
//! command frame, and awaits the station's asynchronous reply under a
//! deadline.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use powercab_proto::{BorrowCode, BorrowCommand, Command, EjectCommand, Frame};
use tracing::{info, warn};

use crate::config::EngineConfig;
use crate::coordinator::{PendingKey, StationReply, TransactionCoordinator};
use crate::error::EngineError;
use crate::reconciler::ReconcileOutcome;
use crate::registry::ConnectionRegistry;
use crate::session::StationConnection;
use crate::storage::Storage;
use crate::types::{OrderId, OrderStatus, PowerbankId, StationId, StationStatus, UserId};

/// VSN used for server-issued command frames. Replies to station frames
/// echo the station's VSN instead.
const SERVER_VSN: u8 = 0;

pub struct Engine {
    config: EngineConfig,
    storage: Arc<dyn Storage>,
    registry: ConnectionRegistry,
    coordinator: TransactionCoordinator,
    // Per-station critical sections for compound occupancy mutations, so a
    // login resync never races a return event on the same station.
    station_locks: Mutex<HashMap<StationId, Arc<tokio::sync::Mutex<()>>>>,
}

impl Engine {
    pub fn new(config: EngineConfig, storage: Arc<dyn Storage>) -> Arc<Self> {
        let registry = ConnectionRegistry::new(config.max_suspicious, config.heartbeat_timeout);
        Arc::new(Self {
            config,
            storage,
            registry,
            coordinator: TransactionCoordinator::new(),
            station_locks: Mutex::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn storage(&self) -> &dyn Storage {
        self.storage.as_ref()
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn coordinator(&self) -> &TransactionCoordinator {
        &self.coordinator
    }

    /// Whether the station has a live authenticated connection.
    pub fn is_station_online(&self, station_id: StationId) -> bool {
        self.registry.is_online(station_id)
    }

    pub(crate) fn station_lock(&self, station_id: StationId) -> Arc<tokio::sync::Mutex<()>> {
        self.station_locks
            .lock()
            .entry(station_id)
            .or_default()
            .clone()
    }

    fn connection_for(
        &self,
        station_id: StationId,
    ) -> Result<Arc<StationConnection>, EngineError> {
        self.registry
            .get_by_station(station_id)
            .filter(|c| c.is_authenticated() && !c.is_closed())
            .ok_or(EngineError::StationOffline(station_id))
    }

    /// Encode and queue a command frame on a connection.
    pub(crate) async fn send_frame(
        &self,
        conn: &StationConnection,
        command: Command,
        vsn: u8,
        payload: &[u8],
    ) -> Result<(), EngineError> {
        let secret = conn.secret_key().ok_or(EngineError::ConnectionClosed)?;
        let bytes = Frame::encode(command, vsn, payload, &secret);
        conn.send(bytes)
            .await
            .map_err(|_| EngineError::ConnectionClosed)
    }

    /// Borrow a specific power bank from a station on behalf of a user.
    ///
    /// Returns the order id once the station confirms the bank left its
    /// slot. A [`EngineError::Timeout`] means the outcome is unknown: the
    /// station may still act on the command, so no state is rolled back
    /// and the order stays `pending`.
    pub async fn request_borrow(
        &self,
        station_id: StationId,
        powerbank_id: PowerbankId,
        user_id: UserId,
    ) -> Result<OrderId, EngineError> {
        let conn = self.connection_for(station_id)?;
        let slot = self
            .storage
            .find_powerbank_slot(station_id, powerbank_id)
            .await?
            .ok_or(EngineError::PowerbankNotPresent(powerbank_id, station_id))?;

        // Reject a concurrent borrow on the same occupied slot before any
        // order row is created.
        if self.coordinator.slot_busy(station_id, slot).await {
            return Err(EngineError::SlotBusy(station_id, slot));
        }

        let order = self
            .storage
            .create_order(station_id, user_id, powerbank_id, OrderStatus::Pending)
            .await?;
        let key = PendingKey::Borrow { order_id: order.id };
        let rx = self
            .coordinator
            .register(key, station_id, Some(slot), None)
            .await?;

        let command = BorrowCommand {
            order_id: order.id as u32,
            slot,
        };
        if let Err(e) = self
            .send_frame(&conn, Command::BorrowPowerBank, SERVER_VSN, &command.to_payload())
            .await
        {
            self.coordinator.remove(&key).await;
            return Err(e);
        }
        info!(station_id, powerbank_id, order_id = order.id, slot, "borrow command sent");

        let reply = self
            .coordinator
            .await_reply(key, rx, self.config.borrow_timeout)
            .await?;
        let result = match reply {
            StationReply::Borrow(r) => r,
            _ => return Err(EngineError::UnexpectedReply),
        };
        if result.result != BorrowCode::Ok {
            info!(order_id = order.id, result = %result.result, "station rejected borrow");
            return Err(EngineError::BorrowRejected(result.result));
        }

        // Confirmed: the bank left its slot, which frees it.
        let lock = self.station_lock(station_id);
        let _guard = lock.lock().await;
        self.storage
            .delete_station_powerbank(station_id, slot)
            .await?;
        self.storage.adjust_station_remain(station_id, 1).await?;
        self.storage
            .update_order_status(order.id, OrderStatus::Borrow, None)
            .await?;
        info!(order_id = order.id, station_id, slot, "borrow confirmed");
        Ok(order.id)
    }

    /// Wait for the user to seat a unit they reported broken.
    ///
    /// Nothing goes over the wire: the station spontaneously emits a
    /// return request once the unit is seated, and the `0x66` handler
    /// completes this waiter instead of running the normal return flow.
    pub async fn request_error_return(
        &self,
        station_id: StationId,
        user_id: UserId,
        error_type_id: i64,
        deadline: Option<std::time::Duration>,
    ) -> Result<OrderId, EngineError> {
        let order = self
            .storage
            .find_open_loan_for_user(user_id)
            .await?
            .ok_or(EngineError::NoOpenLoan(user_id, station_id))?;

        let key = PendingKey::ErrorReturn {
            station_id,
            user_id,
            order_id: order.id,
        };
        let rx = self
            .coordinator
            .register(key, station_id, None, Some(error_type_id))
            .await?;
        info!(station_id, user_id, order_id = order.id, "error-return registered");

        let deadline = deadline.unwrap_or(self.config.error_return_timeout);
        match self.coordinator.await_reply(key, rx, deadline).await? {
            StationReply::Return(_) => Ok(order.id),
            _ => Err(EngineError::UnexpectedReply),
        }
    }

    /// Physically eject a slot's contents.
    pub async fn force_eject(&self, station_id: StationId, slot: u8) -> Result<(), EngineError> {
        let conn = self.connection_for(station_id)?;
        let key = PendingKey::Eject { station_id, slot };
        let rx = self
            .coordinator
            .register(key, station_id, Some(slot), None)
            .await?;

        let payload = EjectCommand { slot }.to_payload();
        if let Err(e) = self
            .send_frame(&conn, Command::ForceEject, SERVER_VSN, &payload)
            .await
        {
            self.coordinator.remove(&key).await;
            return Err(e);
        }

        match self
            .coordinator
            .await_reply(key, rx, self.config.command_timeout)
            .await?
        {
            StationReply::Eject(res) if res.ok => Ok(()),
            StationReply::Eject(res) => Err(EngineError::EjectRejected(res.slot)),
            _ => Err(EngineError::UnexpectedReply),
        }
    }

    /// Round-trip an inventory query and reconcile the report.
    pub async fn query_inventory(
        &self,
        station_id: StationId,
    ) -> Result<ReconcileOutcome, EngineError> {
        let conn = self.connection_for(station_id)?;
        let key = PendingKey::Inventory { station_id };
        let rx = self.coordinator.register(key, station_id, None, None).await?;

        if let Err(e) = self
            .send_frame(&conn, Command::QueryInventory, SERVER_VSN, &[])
            .await
        {
            self.coordinator.remove(&key).await;
            return Err(e);
        }

        match self
            .coordinator
            .await_reply(key, rx, self.config.command_timeout)
            .await?
        {
            StationReply::Inventory(outcome) => Ok(outcome),
            _ => Err(EngineError::UnexpectedReply),
        }
    }

    async fn admin_round_trip(
        &self,
        station_id: StationId,
        command: Command,
        payload: &[u8],
    ) -> Result<StationReply, EngineError> {
        let conn = self.connection_for(station_id)?;
        let key = PendingKey::Admin {
            station_id,
            command,
        };
        let rx = self.coordinator.register(key, station_id, None, None).await?;

        if let Err(e) = self.send_frame(&conn, command, SERVER_VSN, payload).await {
            self.coordinator.remove(&key).await;
            return Err(e);
        }
        self.coordinator
            .await_reply(key, rx, self.config.command_timeout)
            .await
    }

    pub async fn restart_cabinet(&self, station_id: StationId) -> Result<(), EngineError> {
        match self
            .admin_round_trip(station_id, Command::RestartCabinet, &[])
            .await?
        {
            StationReply::Ack(_) => Ok(()),
            _ => Err(EngineError::UnexpectedReply),
        }
    }

    pub async fn set_voice_volume(
        &self,
        station_id: StationId,
        volume: u8,
    ) -> Result<(), EngineError> {
        match self
            .admin_round_trip(station_id, Command::SetVoiceVolume, &[volume])
            .await?
        {
            StationReply::Ack(_) => Ok(()),
            _ => Err(EngineError::UnexpectedReply),
        }
    }

    pub async fn query_voice_volume(&self, station_id: StationId) -> Result<u8, EngineError> {
        match self
            .admin_round_trip(station_id, Command::QueryVoiceVolume, &[])
            .await?
        {
            StationReply::Volume(v) => Ok(v),
            _ => Err(EngineError::UnexpectedReply),
        }
    }

    pub async fn set_server_address(
        &self,
        station_id: StationId,
        address: &str,
    ) -> Result<(), EngineError> {
        match self
            .admin_round_trip(station_id, Command::SetServerAddress, address.as_bytes())
            .await?
        {
            StationReply::Ack(_) => Ok(()),
            _ => Err(EngineError::UnexpectedReply),
        }
    }

    pub async fn query_server_address(
        &self,
        station_id: StationId,
    ) -> Result<String, EngineError> {
        match self
            .admin_round_trip(station_id, Command::QueryServerAddress, &[])
            .await?
        {
            StationReply::Text(s) => Ok(s),
            _ => Err(EngineError::UnexpectedReply),
        }
    }

    /// Deregister a socket and release everything keyed to it.
    pub(crate) async fn drop_connection(&self, socket_id: u64) {
        if let Some(conn) = self.registry.remove_by_socket(socket_id) {
            conn.close();
            if let Some(station_id) = conn.station_id() {
                self.coordinator.cancel_for_station(station_id).await;
            }
        }
    }

    /// Periodic maintenance: evict heartbeat-lapsed connections, mark
    /// their stations inactive, and release their waiters.
    pub async fn sweep(&self) {
        for conn in self.registry.sweep() {
            if let Some(station_id) = conn.station_id() {
                self.coordinator.cancel_for_station(station_id).await;
                // last_seen stays at the final heartbeat timestamp.
                if let Err(e) = self
                    .storage
                    .update_station_status(station_id, StationStatus::Inactive)
                    .await
                {
                    warn!(station_id, error = %e, "failed to mark swept station inactive");
                }
            }
        }
    }

    /// Server shutdown: close every connection and bulk-deactivate their
    /// stations.
    pub async fn shutdown(&self) {
        info!("station engine shutting down");
        for conn in self.registry.drain() {
            if let Some(station_id) = conn.station_id() {
                self.coordinator.cancel_for_station(station_id).await;
                let _ = self
                    .storage
                    .update_station_status(station_id, StationStatus::Inactive)
                    .await;
            }
        }
    }
}
