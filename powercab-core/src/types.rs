//! Model types shared by the protocol engine and its storage layer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type StationId = i64;
pub type PowerbankId = i64;
pub type OrderId = i64;
pub type UserId = i64;
pub type OrgUnitId = i64;

/// Station lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StationStatus {
    /// Known but not yet provisioned with a secret key; logins are dropped.
    Pending,
    /// Provisioned and has completed a login.
    Active,
    /// Heartbeats lapsed or the server shut down.
    Inactive,
    /// Administratively blocked; logins are dropped.
    Blocked,
    /// Under maintenance; stays connected but flagged for operators.
    Maintenance,
}

impl std::fmt::Display for StationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StationStatus::Pending => "pending",
            StationStatus::Active => "active",
            StationStatus::Inactive => "inactive",
            StationStatus::Blocked => "blocked",
            StationStatus::Maintenance => "maintenance",
        };
        f.write_str(s)
    }
}

/// Power bank condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PowerbankStatus {
    /// Serial observed in a station payload but never vetted.
    Unknown,
    Active,
    UserReportedBroken,
    SystemError,
    WrittenOff,
}

/// Rental order state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    /// Created, borrow command sent, no confirmed outcome yet.
    Pending,
    /// Station confirmed the bank left its slot; loan is outstanding.
    Borrow,
    /// Bank came back; `completed_at` is set.
    Return,
    /// Bank came back via the error-return path.
    ReturnDamage,
}

/// A physical kiosk cabinet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Station {
    pub id: StationId,
    /// Device-reported identity string from the login payload.
    pub box_id: String,
    pub slots_declared: u8,
    /// Free-slot count. Mutated only by the protocol engine on confirmed
    /// borrow/return/eject events or a login resync.
    pub remain_num: u8,
    pub status: StationStatus,
    pub org_unit_id: Option<OrgUnitId>,
    pub iccid: Option<String>,
    pub last_seen: Option<DateTime<Utc>>,
}

/// A rentable power bank, identified by its device serial (terminal id).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Powerbank {
    pub id: PowerbankId,
    pub serial_number: String,
    pub status: PowerbankStatus,
    /// State of health, percent.
    pub soh: u8,
    pub org_unit_id: Option<OrgUnitId>,
}

/// The occupancy map: row existence means "seated in this slot".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StationPowerbank {
    pub station_id: StationId,
    pub slot: u8,
    pub powerbank_id: PowerbankId,
    pub level: u8,
    pub voltage: u16,
    pub temperature: u8,
    pub last_update: DateTime<Utc>,
}

/// A rental order. A `Borrow` row with `completed_at = None` is an
/// outstanding loan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub id: OrderId,
    pub station_id: StationId,
    pub user_id: UserId,
    pub powerbank_id: PowerbankId,
    pub status: OrderStatus,
    pub timestamp: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Order {
    /// An outstanding loan that a return (normal or error path) can close.
    pub fn is_open_loan(&self) -> bool {
        self.status == OrderStatus::Borrow && self.completed_at.is_none()
    }
}
