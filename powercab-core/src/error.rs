//! Engine error taxonomy.
//!
//! Codec failures are handled locally in the read loop (counted as
//! suspicious, never unwinding the connection task); everything here is
//! what propagates to the callers of engine operations.

use powercab_proto::{BorrowCode, CodecError};
use thiserror::Error;

use crate::storage::StorageError;
use crate::types::{PowerbankId, StationId, UserId};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("protocol error: {0}")]
    Protocol(#[from] CodecError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("station {0} is not connected")]
    StationOffline(StationId),

    #[error("power bank {0} is not seated in station {1}")]
    PowerbankNotPresent(PowerbankId, StationId),

    #[error("a request is already pending for station {0} slot {1}")]
    SlotBusy(StationId, u8),

    #[error("a request with the same key is already pending")]
    DuplicateRequest,

    /// The station never replied. The device may still act on the command
    /// later, so this is an unknown outcome, not a confirmed failure.
    #[error("no station reply before the deadline")]
    Timeout,

    #[error("connection closed")]
    ConnectionClosed,

    #[error("station reported borrow failure: {0}")]
    BorrowRejected(BorrowCode),

    #[error("station could not eject slot {0}")]
    EjectRejected(u8),

    #[error("user {0} has no open loan at station {1}")]
    NoOpenLoan(UserId, StationId),

    #[error("station reply did not match the pending request")]
    UnexpectedReply,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
