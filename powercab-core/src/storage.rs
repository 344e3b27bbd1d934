//! Narrow storage interface consumed by the protocol engine.
//!
//! The engine only ever touches the station, powerbank, occupancy and
//! order tables, through this trait. Row presence in the occupancy map is
//! the "slot occupied" flag, which is why the interface offers
//! `upsert`/`delete`/`replace` rather than generic row CRUD.
//!
//! [`MemoryStorage`] is the in-process implementation; every trait call is
//! atomic under one lock, which gives the per-station conditional-update
//! discipline the engine relies on.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use thiserror::Error;

use crate::types::{
    Order, OrderId, OrderStatus, OrgUnitId, Powerbank, PowerbankId, PowerbankStatus, Station,
    StationId, StationPowerbank, StationStatus, UserId,
};

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("station {0} not found")]
    StationNotFound(StationId),

    #[error("power bank {0} not found")]
    PowerbankNotFound(PowerbankId),

    #[error("order {0} not found")]
    OrderNotFound(OrderId),

    #[error("storage backend unavailable: {0}")]
    Unavailable(String),
}

/// Storage operations required by the protocol engine.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Look a station up by its device-reported box id, creating it with
    /// status `pending` if unknown. Returns the station together with its
    /// provisioned secret key, if any.
    async fn get_or_create_station(
        &self,
        box_id: &str,
        slots_declared: u8,
    ) -> Result<(Station, Option<Vec<u8>>), StorageError>;

    async fn get_station(&self, id: StationId) -> Result<Station, StorageError>;

    async fn update_station_status(
        &self,
        id: StationId,
        status: StationStatus,
    ) -> Result<(), StorageError>;

    async fn update_station_last_seen(
        &self,
        id: StationId,
        when: DateTime<Utc>,
    ) -> Result<(), StorageError>;

    async fn set_station_remain(&self, id: StationId, remain: u8) -> Result<(), StorageError>;

    /// Atomically add `delta` to the free-slot counter, clamping at zero
    /// and the declared slot count. Returns the new value.
    async fn adjust_station_remain(&self, id: StationId, delta: i16) -> Result<u8, StorageError>;

    async fn set_station_iccid(&self, id: StationId, iccid: &str) -> Result<(), StorageError>;

    async fn get_powerbank_by_serial(
        &self,
        serial: &str,
    ) -> Result<Option<Powerbank>, StorageError>;

    async fn create_powerbank(
        &self,
        serial: &str,
        status: PowerbankStatus,
    ) -> Result<Powerbank, StorageError>;

    async fn update_powerbank_status(
        &self,
        id: PowerbankId,
        status: PowerbankStatus,
    ) -> Result<(), StorageError>;

    async fn get_station_powerbanks(
        &self,
        station_id: StationId,
    ) -> Result<Vec<StationPowerbank>, StorageError>;

    async fn get_station_powerbank(
        &self,
        station_id: StationId,
        slot: u8,
    ) -> Result<Option<StationPowerbank>, StorageError>;

    /// Which slot a bank currently occupies in a station, if any.
    async fn find_powerbank_slot(
        &self,
        station_id: StationId,
        powerbank_id: PowerbankId,
    ) -> Result<Option<u8>, StorageError>;

    async fn upsert_station_powerbank(&self, row: StationPowerbank) -> Result<(), StorageError>;

    /// Returns whether a row existed.
    async fn delete_station_powerbank(
        &self,
        station_id: StationId,
        slot: u8,
    ) -> Result<bool, StorageError>;

    /// Wholesale replacement of a station's occupancy rows (login resync).
    async fn replace_station_powerbanks(
        &self,
        station_id: StationId,
        rows: Vec<StationPowerbank>,
    ) -> Result<(), StorageError>;

    async fn create_order(
        &self,
        station_id: StationId,
        user_id: UserId,
        powerbank_id: PowerbankId,
        status: OrderStatus,
    ) -> Result<Order, StorageError>;

    async fn update_order_status(
        &self,
        id: OrderId,
        status: OrderStatus,
        completed_at: Option<DateTime<Utc>>,
    ) -> Result<(), StorageError>;

    async fn get_order(&self, id: OrderId) -> Result<Order, StorageError>;

    /// The outstanding loan holding this bank, if any.
    async fn find_open_loan_for_powerbank(
        &self,
        powerbank_id: PowerbankId,
    ) -> Result<Option<Order>, StorageError>;

    /// The user's outstanding loan, if any.
    async fn find_open_loan_for_user(&self, user_id: UserId)
        -> Result<Option<Order>, StorageError>;

    /// Whether a bank from org unit `a` may be vended by a station in org
    /// unit `b`.
    async fn is_org_unit_compatible(
        &self,
        a: Option<OrgUnitId>,
        b: Option<OrgUnitId>,
    ) -> Result<bool, StorageError>;
}

#[derive(Default)]
struct Tables {
    stations: HashMap<StationId, Station>,
    station_by_box: HashMap<String, StationId>,
    secrets: HashMap<StationId, Vec<u8>>,
    powerbanks: HashMap<PowerbankId, Powerbank>,
    powerbank_by_serial: HashMap<String, PowerbankId>,
    occupancy: HashMap<(StationId, u8), StationPowerbank>,
    orders: HashMap<OrderId, Order>,
    org_parents: HashMap<OrgUnitId, Option<OrgUnitId>>,
    next_station_id: StationId,
    next_powerbank_id: PowerbankId,
    next_order_id: OrderId,
}

impl Tables {
    fn station_mut(&mut self, id: StationId) -> Result<&mut Station, StorageError> {
        self.stations
            .get_mut(&id)
            .ok_or(StorageError::StationNotFound(id))
    }

    /// Walk the parent chain from `unit` looking for `ancestor`.
    fn is_ancestor(&self, ancestor: OrgUnitId, unit: OrgUnitId) -> bool {
        let mut cur = Some(unit);
        while let Some(u) = cur {
            if u == ancestor {
                return true;
            }
            cur = self.org_parents.get(&u).copied().flatten();
        }
        false
    }
}

/// In-memory storage, suitable for tests and single-process deployments.
#[derive(Default)]
pub struct MemoryStorage {
    inner: Mutex<Tables>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Provision a station out-of-band: assigns a secret key and org unit
    /// the way an operator would through the admin tables.
    pub fn provision_station(
        &self,
        box_id: &str,
        slots_declared: u8,
        secret_key: &[u8],
        org_unit_id: Option<OrgUnitId>,
    ) -> Station {
        let mut t = self.inner.lock();
        let id = match t.station_by_box.get(box_id) {
            Some(&id) => id,
            None => {
                t.next_station_id += 1;
                let id = t.next_station_id;
                t.station_by_box.insert(box_id.to_string(), id);
                t.stations.insert(
                    id,
                    Station {
                        id,
                        box_id: box_id.to_string(),
                        slots_declared,
                        remain_num: slots_declared,
                        status: StationStatus::Inactive,
                        org_unit_id: None,
                        iccid: None,
                        last_seen: None,
                    },
                );
                id
            }
        };
        t.secrets.insert(id, secret_key.to_vec());
        let station = t.stations.get_mut(&id).expect("just inserted");
        station.org_unit_id = org_unit_id;
        station.status = StationStatus::Inactive;
        station.clone()
    }

    /// Register an org unit under an optional parent.
    pub fn add_org_unit(&self, id: OrgUnitId, parent: Option<OrgUnitId>) {
        self.inner.lock().org_parents.insert(id, parent);
    }

    /// Assign a power bank to an org unit.
    pub fn set_powerbank_org(&self, id: PowerbankId, org_unit_id: Option<OrgUnitId>) {
        if let Some(bank) = self.inner.lock().powerbanks.get_mut(&id) {
            bank.org_unit_id = org_unit_id;
        }
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn get_or_create_station(
        &self,
        box_id: &str,
        slots_declared: u8,
    ) -> Result<(Station, Option<Vec<u8>>), StorageError> {
        let mut t = self.inner.lock();
        let id = match t.station_by_box.get(box_id) {
            Some(&id) => id,
            None => {
                t.next_station_id += 1;
                let id = t.next_station_id;
                t.station_by_box.insert(box_id.to_string(), id);
                t.stations.insert(
                    id,
                    Station {
                        id,
                        box_id: box_id.to_string(),
                        slots_declared,
                        remain_num: slots_declared,
                        status: StationStatus::Pending,
                        org_unit_id: None,
                        iccid: None,
                        last_seen: None,
                    },
                );
                id
            }
        };
        let station = t.stations[&id].clone();
        let secret = t.secrets.get(&id).cloned();
        Ok((station, secret))
    }

    async fn get_station(&self, id: StationId) -> Result<Station, StorageError> {
        self.inner
            .lock()
            .stations
            .get(&id)
            .cloned()
            .ok_or(StorageError::StationNotFound(id))
    }

    async fn update_station_status(
        &self,
        id: StationId,
        status: StationStatus,
    ) -> Result<(), StorageError> {
        self.inner.lock().station_mut(id)?.status = status;
        Ok(())
    }

    async fn update_station_last_seen(
        &self,
        id: StationId,
        when: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        self.inner.lock().station_mut(id)?.last_seen = Some(when);
        Ok(())
    }

    async fn set_station_remain(&self, id: StationId, remain: u8) -> Result<(), StorageError> {
        self.inner.lock().station_mut(id)?.remain_num = remain;
        Ok(())
    }

    async fn adjust_station_remain(&self, id: StationId, delta: i16) -> Result<u8, StorageError> {
        let mut t = self.inner.lock();
        let station = t.station_mut(id)?;
        let adjusted = (station.remain_num as i16 + delta)
            .clamp(0, station.slots_declared as i16) as u8;
        station.remain_num = adjusted;
        Ok(adjusted)
    }

    async fn set_station_iccid(&self, id: StationId, iccid: &str) -> Result<(), StorageError> {
        self.inner.lock().station_mut(id)?.iccid = Some(iccid.to_string());
        Ok(())
    }

    async fn get_powerbank_by_serial(
        &self,
        serial: &str,
    ) -> Result<Option<Powerbank>, StorageError> {
        let t = self.inner.lock();
        Ok(t.powerbank_by_serial
            .get(serial)
            .and_then(|id| t.powerbanks.get(id))
            .cloned())
    }

    async fn create_powerbank(
        &self,
        serial: &str,
        status: PowerbankStatus,
    ) -> Result<Powerbank, StorageError> {
        let mut t = self.inner.lock();
        if let Some(existing) = t
            .powerbank_by_serial
            .get(serial)
            .and_then(|id| t.powerbanks.get(id))
        {
            return Ok(existing.clone());
        }
        t.next_powerbank_id += 1;
        let bank = Powerbank {
            id: t.next_powerbank_id,
            serial_number: serial.to_string(),
            status,
            soh: 100,
            org_unit_id: None,
        };
        t.powerbank_by_serial.insert(serial.to_string(), bank.id);
        t.powerbanks.insert(bank.id, bank.clone());
        Ok(bank)
    }

    async fn update_powerbank_status(
        &self,
        id: PowerbankId,
        status: PowerbankStatus,
    ) -> Result<(), StorageError> {
        self.inner
            .lock()
            .powerbanks
            .get_mut(&id)
            .ok_or(StorageError::PowerbankNotFound(id))?
            .status = status;
        Ok(())
    }

    async fn get_station_powerbanks(
        &self,
        station_id: StationId,
    ) -> Result<Vec<StationPowerbank>, StorageError> {
        let t = self.inner.lock();
        let mut rows: Vec<_> = t
            .occupancy
            .values()
            .filter(|r| r.station_id == station_id)
            .cloned()
            .collect();
        rows.sort_by_key(|r| r.slot);
        Ok(rows)
    }

    async fn get_station_powerbank(
        &self,
        station_id: StationId,
        slot: u8,
    ) -> Result<Option<StationPowerbank>, StorageError> {
        Ok(self.inner.lock().occupancy.get(&(station_id, slot)).cloned())
    }

    async fn find_powerbank_slot(
        &self,
        station_id: StationId,
        powerbank_id: PowerbankId,
    ) -> Result<Option<u8>, StorageError> {
        Ok(self
            .inner
            .lock()
            .occupancy
            .values()
            .find(|r| r.station_id == station_id && r.powerbank_id == powerbank_id)
            .map(|r| r.slot))
    }

    async fn upsert_station_powerbank(&self, row: StationPowerbank) -> Result<(), StorageError> {
        let mut t = self.inner.lock();
        // A bank occupies at most one slot per station; drop any stale row
        // for the same bank elsewhere in this station.
        t.occupancy.retain(|_, r| {
            !(r.station_id == row.station_id
                && r.powerbank_id == row.powerbank_id
                && r.slot != row.slot)
        });
        t.occupancy.insert((row.station_id, row.slot), row);
        Ok(())
    }

    async fn delete_station_powerbank(
        &self,
        station_id: StationId,
        slot: u8,
    ) -> Result<bool, StorageError> {
        Ok(self
            .inner
            .lock()
            .occupancy
            .remove(&(station_id, slot))
            .is_some())
    }

    async fn replace_station_powerbanks(
        &self,
        station_id: StationId,
        rows: Vec<StationPowerbank>,
    ) -> Result<(), StorageError> {
        let mut t = self.inner.lock();
        t.occupancy.retain(|_, r| r.station_id != station_id);
        for row in rows {
            t.occupancy.insert((row.station_id, row.slot), row);
        }
        Ok(())
    }

    async fn create_order(
        &self,
        station_id: StationId,
        user_id: UserId,
        powerbank_id: PowerbankId,
        status: OrderStatus,
    ) -> Result<Order, StorageError> {
        let mut t = self.inner.lock();
        t.next_order_id += 1;
        let order = Order {
            id: t.next_order_id,
            station_id,
            user_id,
            powerbank_id,
            status,
            timestamp: Utc::now(),
            completed_at: None,
        };
        t.orders.insert(order.id, order.clone());
        Ok(order)
    }

    async fn update_order_status(
        &self,
        id: OrderId,
        status: OrderStatus,
        completed_at: Option<DateTime<Utc>>,
    ) -> Result<(), StorageError> {
        let mut t = self.inner.lock();
        let order = t.orders.get_mut(&id).ok_or(StorageError::OrderNotFound(id))?;
        order.status = status;
        order.completed_at = completed_at;
        Ok(())
    }

    async fn get_order(&self, id: OrderId) -> Result<Order, StorageError> {
        self.inner
            .lock()
            .orders
            .get(&id)
            .cloned()
            .ok_or(StorageError::OrderNotFound(id))
    }

    async fn find_open_loan_for_powerbank(
        &self,
        powerbank_id: PowerbankId,
    ) -> Result<Option<Order>, StorageError> {
        Ok(self
            .inner
            .lock()
            .orders
            .values()
            .find(|o| o.powerbank_id == powerbank_id && o.is_open_loan())
            .cloned())
    }

    async fn find_open_loan_for_user(
        &self,
        user_id: UserId,
    ) -> Result<Option<Order>, StorageError> {
        Ok(self
            .inner
            .lock()
            .orders
            .values()
            .find(|o| o.user_id == user_id && o.is_open_loan())
            .cloned())
    }

    async fn is_org_unit_compatible(
        &self,
        a: Option<OrgUnitId>,
        b: Option<OrgUnitId>,
    ) -> Result<bool, StorageError> {
        let (a, b) = match (a, b) {
            // An unassigned bank or station is compatible with anything.
            (None, _) | (_, None) => return Ok(true),
            (Some(a), Some(b)) => (a, b),
        };
        if a == b {
            return Ok(true);
        }
        let t = self.inner.lock();
        Ok(t.is_ancestor(a, b) || t.is_ancestor(b, a))
    }
}
