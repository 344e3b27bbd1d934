//! # Powercab wire protocol
//!
//! Binary framing and payload types for the power-bank cabinet TCP
//! protocol. The format is fixed by deployed station firmware and must not
//! change:
//!
//! ```text
//! length:u16 | command:u8 | vsn:u8 | checksum:u8 | token:u32 | payload
//! ```
//!
//! All integers are big-endian. `length` covers everything after itself,
//! `checksum` is the XOR of the payload bytes, and `token` is derived from
//! `MD5(payload ++ secret_key)` by picking digest bytes 15, 11, 7 and 3 in
//! that order. The reversed stride is a firmware quirk, reproduced
//! bit-exactly in both directions.
//!
//! This crate is pure and stateless:
//! - `frame`: encode/decode, checksum and token derivation
//! - `command`: the opcode table
//! - `packet`: typed per-opcode payloads

pub mod command;
pub mod frame;
pub mod packet;

pub use command::Command;
pub use frame::{checksum, derive_token, CodecError, Frame, MAX_FRAME_SIZE};
pub use packet::{
    BorrowCommand, BorrowCode, BorrowResult, EjectCommand, EjectResult, InventoryReport,
    LoginPacket, ReturnCode, ReturnReply, ReturnRequest, SlotAbnormalReport, SlotReading,
    StationPacket, EMPTY_TERMINAL_ID, TERMINAL_ID_LEN,
};
