//! Request/response correlation.
//!
//! Commands sent to a station are fire-and-forget at the wire level; the
//! station answers asynchronously on its own connection. The coordinator
//! turns that into awaitable transactions: callers register a pending
//! request keyed by order/station/slot, the opcode handlers complete it,
//! and a deadline guarantees the table never leaks a waiter.

use std::collections::HashMap;
use std::time::Duration;

use powercab_proto::{BorrowResult, Command, EjectResult, ReturnRequest};
use tokio::sync::{oneshot, RwLock};
use tracing::{debug, warn};

use crate::error::EngineError;
use crate::reconciler::ReconcileOutcome;
use crate::types::{OrderId, StationId, UserId};

/// Key of a pending request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PendingKey {
    /// Borrow command awaiting the station's `0x65` result.
    Borrow { order_id: OrderId },
    /// Error-return awaiting a spontaneous `0x66` from the station.
    ErrorReturn {
        station_id: StationId,
        user_id: UserId,
        order_id: OrderId,
    },
    /// Inventory query awaiting the station's `0x64` report.
    Inventory { station_id: StationId },
    /// Force-eject awaiting the station's `0x80` result.
    Eject { station_id: StationId, slot: u8 },
    /// Admin round trip (restart, volume, server address).
    Admin {
        station_id: StationId,
        command: Command,
    },
}

/// What a handler passes back to the waiting caller.
#[derive(Debug)]
pub enum StationReply {
    Borrow(BorrowResult),
    Return(ReturnRequest),
    Inventory(ReconcileOutcome),
    Eject(EjectResult),
    Ack(u8),
    Text(String),
    Volume(u8),
}

struct PendingEntry {
    station_id: StationId,
    slot: Option<u8>,
    error_type_id: Option<i64>,
    tx: oneshot::Sender<StationReply>,
}

/// Completion side of an error-return, handed to the `0x66` handler.
pub struct ErrorReturnTicket {
    pub order_id: OrderId,
    pub user_id: UserId,
    pub error_type_id: i64,
    pub tx: oneshot::Sender<StationReply>,
}

#[derive(Default)]
pub struct TransactionCoordinator {
    pending: RwLock<HashMap<PendingKey, PendingEntry>>,
}

impl TransactionCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// True when a borrow is already in flight for this station slot.
    pub async fn slot_busy(&self, station_id: StationId, slot: u8) -> bool {
        self.pending.read().await.values().any(|e| {
            e.station_id == station_id && e.slot == Some(slot)
        })
    }

    /// Register a pending request. Rejects a duplicate key, and rejects a
    /// slot-scoped request when another one is already pending for the
    /// same station slot.
    pub async fn register(
        &self,
        key: PendingKey,
        station_id: StationId,
        slot: Option<u8>,
        error_type_id: Option<i64>,
    ) -> Result<oneshot::Receiver<StationReply>, EngineError> {
        let mut pending = self.pending.write().await;
        if pending.contains_key(&key) {
            return Err(EngineError::DuplicateRequest);
        }
        if let Some(slot) = slot {
            if pending
                .values()
                .any(|e| e.station_id == station_id && e.slot == Some(slot))
            {
                return Err(EngineError::SlotBusy(station_id, slot));
            }
        }
        let (tx, rx) = oneshot::channel();
        pending.insert(
            key,
            PendingEntry {
                station_id,
                slot,
                error_type_id,
                tx,
            },
        );
        Ok(rx)
    }

    /// Complete a pending request. Returns `false` when nothing was
    /// waiting (late or unsolicited reply), or when the reply came from a
    /// station other than the one the request was issued to; the entry
    /// stays registered in that case so the real station can still answer.
    pub async fn complete(
        &self,
        key: &PendingKey,
        station_id: StationId,
        reply: StationReply,
    ) -> bool {
        let mut pending = self.pending.write().await;
        match pending.get(key) {
            None => {
                debug!(?key, "no pending request for station reply");
                false
            }
            Some(entry) if entry.station_id != station_id => {
                warn!(
                    ?key,
                    station_id,
                    expected = entry.station_id,
                    "station reply does not belong to this station, ignoring"
                );
                false
            }
            Some(_) => {
                if let Some(entry) = pending.remove(key) {
                    // The waiter may have timed out between removal and
                    // send; that is the same "unknown outcome" as a late
                    // reply.
                    let _ = entry.tx.send(reply);
                }
                true
            }
        }
    }

    /// Remove a pending entry without completing it (timeout path).
    pub async fn remove(&self, key: &PendingKey) {
        self.pending.write().await.remove(key);
    }

    /// Take the pending error-return for a station, if one exists. The
    /// `0x66` handler calls this before running the normal return flow.
    pub async fn take_error_return(&self, station_id: StationId) -> Option<ErrorReturnTicket> {
        let mut pending = self.pending.write().await;
        let key = pending.keys().copied().find(|k| {
            matches!(k, PendingKey::ErrorReturn { station_id: s, .. } if *s == station_id)
        })?;
        let entry = pending.remove(&key)?;
        match key {
            PendingKey::ErrorReturn {
                order_id, user_id, ..
            } => Some(ErrorReturnTicket {
                order_id,
                user_id,
                error_type_id: entry.error_type_id.unwrap_or(0),
                tx: entry.tx,
            }),
            _ => unreachable!("key matched ErrorReturn"),
        }
    }

    /// Drop every pending entry tied to a station; their waiters observe a
    /// closed channel. Called when the owning connection dies.
    pub async fn cancel_for_station(&self, station_id: StationId) -> usize {
        let mut pending = self.pending.write().await;
        let before = pending.len();
        pending.retain(|_, e| e.station_id != station_id);
        let dropped = before - pending.len();
        if dropped > 0 {
            warn!(station_id, dropped, "cancelled pending requests for dead connection");
        }
        dropped
    }

    pub async fn pending_count(&self) -> usize {
        self.pending.read().await.len()
    }

    /// Await a registered reply with a deadline. On timeout or a dead
    /// completion side the entry is removed, so the table never retains a
    /// waiter past its deadline.
    pub async fn await_reply(
        &self,
        key: PendingKey,
        rx: oneshot::Receiver<StationReply>,
        deadline: Duration,
    ) -> Result<StationReply, EngineError> {
        match tokio::time::timeout(deadline, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => {
                self.remove(&key).await;
                Err(EngineError::ConnectionClosed)
            }
            Err(_) => {
                self.remove(&key).await;
                Err(EngineError::Timeout)
            }
        }
    }
}
