//! Inventory reconciliation.
//!
//! Diffs a station's self-reported slot contents against the stored
//! occupancy map: unseen serials become `unknown` power banks, banks from
//! an incompatible org unit are scheduled for a physical eject instead of
//! being written, changed readings are upserted, and stored rows absent
//! from the report are deleted.

use chrono::Utc;
use powercab_proto::SlotReading;
use tracing::{debug, info};

use crate::storage::{Storage, StorageError};
use crate::types::{PowerbankStatus, Station, StationPowerbank};

/// Summary of one reconciliation pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileOutcome {
    /// Power banks created as `unknown` for unseen serials.
    pub created: usize,
    /// Occupancy rows inserted or updated.
    pub updated: usize,
    /// Stored rows deleted because the station no longer reports them.
    pub removed: usize,
    /// Slots holding an org-incompatible bank; the caller must send a
    /// force-eject for each.
    pub eject_slots: Vec<u8>,
}

/// Reconcile a station's reported slots against storage.
///
/// `full` selects wholesale replacement (login resync); otherwise rows are
/// mutated incrementally (targeted resync after borrow/return/eject).
pub async fn reconcile_station(
    storage: &dyn Storage,
    station: &Station,
    readings: &[SlotReading],
    full: bool,
) -> Result<ReconcileOutcome, StorageError> {
    let mut outcome = ReconcileOutcome::default();
    let current = storage.get_station_powerbanks(station.id).await?;
    let now = Utc::now();

    let mut target_rows: Vec<StationPowerbank> = Vec::new();
    for reading in readings {
        if reading.is_empty() {
            continue;
        }

        let bank = match storage.get_powerbank_by_serial(&reading.terminal_id).await? {
            Some(bank) => bank,
            None => {
                let bank = storage
                    .create_powerbank(&reading.terminal_id, PowerbankStatus::Unknown)
                    .await?;
                info!(
                    station_id = station.id,
                    serial = %reading.terminal_id,
                    "created unknown power bank from station report"
                );
                outcome.created += 1;
                bank
            }
        };

        if !storage
            .is_org_unit_compatible(bank.org_unit_id, station.org_unit_id)
            .await?
        {
            // Never written into the occupancy map; the device ejects it.
            info!(
                station_id = station.id,
                powerbank_id = bank.id,
                slot = reading.slot,
                "org-incompatible power bank, scheduling eject"
            );
            outcome.eject_slots.push(reading.slot);
            continue;
        }

        target_rows.push(StationPowerbank {
            station_id: station.id,
            slot: reading.slot,
            powerbank_id: bank.id,
            level: reading.level,
            voltage: reading.voltage,
            temperature: reading.temperature,
            last_update: now,
        });
    }

    if full {
        outcome.updated = target_rows.len();
        outcome.removed = current
            .iter()
            .filter(|r| !target_rows.iter().any(|t| t.slot == r.slot))
            .count();
        storage
            .replace_station_powerbanks(station.id, target_rows)
            .await?;
        debug!(station_id = station.id, "full inventory resync complete");
        return Ok(outcome);
    }

    for row in &target_rows {
        let unchanged = current.iter().any(|c| {
            c.slot == row.slot
                && c.powerbank_id == row.powerbank_id
                && c.level == row.level
                && c.voltage == row.voltage
                && c.temperature == row.temperature
        });
        if !unchanged {
            storage.upsert_station_powerbank(row.clone()).await?;
            outcome.updated += 1;
        }
    }
    for stored in &current {
        if !target_rows.iter().any(|t| t.slot == stored.slot) {
            storage
                .delete_station_powerbank(station.id, stored.slot)
                .await?;
            outcome.removed += 1;
        }
    }

    debug!(
        station_id = station.id,
        updated = outcome.updated,
        removed = outcome.removed,
        "targeted inventory resync complete"
    );
    Ok(outcome)
}
