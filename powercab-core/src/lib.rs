//! Station protocol engine for power-bank rental cabinets.
//!
//! Cabinets dial in over TCP and speak the length-prefixed binary framing
//! implemented in `powercab-proto`. This crate owns everything above the
//! codec: connection sessions and the one-connection-per-station registry,
//! the opcode handlers, the transaction coordinator that turns the
//! station's asynchronous replies into awaitable operations, and the
//! inventory reconciler that keeps the occupancy map honest.
//!
//! The [`Engine`] is the public surface: construct it over a [`Storage`]
//! implementation, hand it to a [`StationServer`], and call its operations
//! (borrow, error-return, force-eject, inventory and admin queries) from
//! the application layer.

pub mod config;
pub mod coordinator;
pub mod dispatcher;
pub mod engine;
pub mod error;
mod handlers;
pub mod reconciler;
pub mod registry;
pub mod server;
pub mod session;
pub mod storage;
pub mod types;

pub use config::EngineConfig;
pub use coordinator::{PendingKey, StationReply, TransactionCoordinator};
pub use engine::Engine;
pub use error::EngineError;
pub use reconciler::{reconcile_station, ReconcileOutcome};
pub use registry::ConnectionRegistry;
pub use server::StationServer;
pub use session::{ConnState, StationConnection};
pub use storage::{MemoryStorage, Storage, StorageError};
pub use types::{
    Order, OrderId, OrderStatus, OrgUnitId, Powerbank, PowerbankId, PowerbankStatus, Station,
    StationId, StationPowerbank, StationStatus, UserId,
};
