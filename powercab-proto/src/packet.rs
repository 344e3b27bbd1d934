//! Typed per-opcode payloads.
//!
//! Each payload is a plain struct with `parse`/`to_payload`, decoded once
//! at the codec boundary instead of being passed around as loose bytes.
//! [`StationPacket`] is the sum type for everything a station can send.
//!
//! All multi-byte integers are big-endian. Terminal ids (power-bank
//! serials) are a fixed 8 ASCII bytes; `"00000000"` marks an empty slot in
//! inventory reports.

use crate::command::Command;
use crate::frame::CodecError;

/// Fixed width of a terminal id on the wire.
pub const TERMINAL_ID_LEN: usize = 8;

/// Sentinel terminal id reported for an empty slot.
pub const EMPTY_TERMINAL_ID: &str = "00000000";

fn read_terminal_id(buf: &[u8]) -> Result<String, CodecError> {
    if buf.len() < TERMINAL_ID_LEN {
        return Err(CodecError::BadPayload("truncated terminal id"));
    }
    let raw = &buf[..TERMINAL_ID_LEN];
    if !raw.iter().all(|b| b.is_ascii_graphic()) {
        return Err(CodecError::BadPayload("terminal id is not printable ASCII"));
    }
    Ok(String::from_utf8_lossy(raw).into_owned())
}

fn write_terminal_id(out: &mut Vec<u8>, terminal_id: &str) {
    let mut raw = [b'0'; TERMINAL_ID_LEN];
    let bytes = terminal_id.as_bytes();
    let n = bytes.len().min(TERMINAL_ID_LEN);
    raw[..n].copy_from_slice(&bytes[..n]);
    out.extend_from_slice(&raw);
}

/// One slot's self-reported contents: 13 bytes on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotReading {
    pub slot: u8,
    pub terminal_id: String,
    pub level: u8,
    pub voltage: u16,
    pub temperature: u8,
}

impl SlotReading {
    /// Wire width of a single reading.
    pub const WIDTH: usize = 1 + TERMINAL_ID_LEN + 1 + 2 + 1;

    /// True when this reading carries the empty-slot sentinel.
    pub fn is_empty(&self) -> bool {
        self.terminal_id == EMPTY_TERMINAL_ID
    }

    fn parse(buf: &[u8]) -> Result<SlotReading, CodecError> {
        if buf.len() < Self::WIDTH {
            return Err(CodecError::BadPayload("truncated slot reading"));
        }
        Ok(SlotReading {
            slot: buf[0],
            terminal_id: read_terminal_id(&buf[1..])?,
            level: buf[1 + TERMINAL_ID_LEN],
            voltage: u16::from_be_bytes([buf[2 + TERMINAL_ID_LEN], buf[3 + TERMINAL_ID_LEN]]),
            temperature: buf[4 + TERMINAL_ID_LEN],
        })
    }

    fn write(&self, out: &mut Vec<u8>) {
        out.push(self.slot);
        write_terminal_id(out, &self.terminal_id);
        out.push(self.level);
        out.extend_from_slice(&self.voltage.to_be_bytes());
        out.push(self.temperature);
    }
}

fn parse_readings(buf: &[u8]) -> Result<Vec<SlotReading>, CodecError> {
    let count = *buf.first().ok_or(CodecError::BadPayload("missing slot count"))? as usize;
    let body = &buf[1..];
    if body.len() != count * SlotReading::WIDTH {
        return Err(CodecError::BadPayload("slot list length mismatch"));
    }
    (0..count)
        .map(|i| SlotReading::parse(&body[i * SlotReading::WIDTH..]))
        .collect()
}

fn write_readings(out: &mut Vec<u8>, readings: &[SlotReading]) {
    out.push(readings.len() as u8);
    for r in readings {
        r.write(out);
    }
}

/// `0x60` Login payload, station → server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginPacket {
    pub box_id: String,
    pub slots_declared: u8,
    pub remain_num: u8,
    pub readings: Vec<SlotReading>,
}

impl LoginPacket {
    pub fn parse(buf: &[u8]) -> Result<LoginPacket, CodecError> {
        if buf.len() < 3 {
            return Err(CodecError::BadPayload("truncated login header"));
        }
        let slots_declared = buf[0];
        let remain_num = buf[1];
        let id_len = buf[2] as usize;
        if buf.len() < 3 + id_len {
            return Err(CodecError::BadPayload("truncated box id"));
        }
        let box_id = std::str::from_utf8(&buf[3..3 + id_len])
            .map_err(|_| CodecError::BadPayload("box id is not UTF-8"))?
            .to_string();
        if box_id.is_empty() {
            return Err(CodecError::BadPayload("empty box id"));
        }
        let readings = parse_readings(&buf[3 + id_len..])?;
        Ok(LoginPacket {
            box_id,
            slots_declared,
            remain_num,
            readings,
        })
    }

    pub fn to_payload(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.push(self.slots_declared);
        out.push(self.remain_num);
        out.push(self.box_id.len() as u8);
        out.extend_from_slice(self.box_id.as_bytes());
        write_readings(&mut out, &self.readings);
        out
    }
}

/// `0x64` inventory report payload, station → server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InventoryReport {
    pub readings: Vec<SlotReading>,
}

impl InventoryReport {
    pub fn parse(buf: &[u8]) -> Result<InventoryReport, CodecError> {
        Ok(InventoryReport {
            readings: parse_readings(buf)?,
        })
    }

    pub fn to_payload(&self) -> Vec<u8> {
        let mut out = Vec::new();
        write_readings(&mut out, &self.readings);
        out
    }
}

/// `0x65` borrow command payload, server → station.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BorrowCommand {
    pub order_id: u32,
    pub slot: u8,
}

impl BorrowCommand {
    pub fn parse(buf: &[u8]) -> Result<BorrowCommand, CodecError> {
        if buf.len() != 5 {
            return Err(CodecError::BadPayload("borrow command must be 5 bytes"));
        }
        Ok(BorrowCommand {
            order_id: u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]),
            slot: buf[4],
        })
    }

    pub fn to_payload(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(5);
        out.extend_from_slice(&self.order_id.to_be_bytes());
        out.push(self.slot);
        out
    }
}

/// Result code in a station's asynchronous borrow reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BorrowCode {
    Failed = 0,
    Ok = 1,
    SlotLocked = 2,
    SlotEmpty = 3,
}

impl BorrowCode {
    fn from_u8(v: u8) -> Result<BorrowCode, CodecError> {
        match v {
            0 => Ok(BorrowCode::Failed),
            1 => Ok(BorrowCode::Ok),
            2 => Ok(BorrowCode::SlotLocked),
            3 => Ok(BorrowCode::SlotEmpty),
            _ => Err(CodecError::BadPayload("unknown borrow result code")),
        }
    }
}

impl std::fmt::Display for BorrowCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            BorrowCode::Failed => "failed",
            BorrowCode::Ok => "ok",
            BorrowCode::SlotLocked => "slot locked",
            BorrowCode::SlotEmpty => "slot empty",
        };
        f.write_str(s)
    }
}

/// `0x65` asynchronous result payload, station → server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BorrowResult {
    pub order_id: u32,
    pub slot: u8,
    pub result: BorrowCode,
    pub terminal_id: String,
}

impl BorrowResult {
    pub fn parse(buf: &[u8]) -> Result<BorrowResult, CodecError> {
        if buf.len() != 6 + TERMINAL_ID_LEN {
            return Err(CodecError::BadPayload("borrow result must be 14 bytes"));
        }
        Ok(BorrowResult {
            order_id: u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]),
            slot: buf[4],
            result: BorrowCode::from_u8(buf[5])?,
            terminal_id: read_terminal_id(&buf[6..])?,
        })
    }

    pub fn to_payload(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(6 + TERMINAL_ID_LEN);
        out.extend_from_slice(&self.order_id.to_be_bytes());
        out.push(self.slot);
        out.push(self.result as u8);
        write_terminal_id(&mut out, &self.terminal_id);
        out
    }
}

/// Result codes for a `0x66` return reply, server → station.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ReturnCode {
    Rejected = 0,
    Ok = 1,
    SlotLocked = 2,
    SlotEmpty = 3,
    BankUnknown = 4,
    SlotOccupied = 5,
}

impl ReturnCode {
    fn from_u8(v: u8) -> Result<ReturnCode, CodecError> {
        match v {
            0 => Ok(ReturnCode::Rejected),
            1 => Ok(ReturnCode::Ok),
            2 => Ok(ReturnCode::SlotLocked),
            3 => Ok(ReturnCode::SlotEmpty),
            4 => Ok(ReturnCode::BankUnknown),
            5 => Ok(ReturnCode::SlotOccupied),
            _ => Err(CodecError::BadPayload("unknown return result code")),
        }
    }
}

/// `0x66` return request payload, station → server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReturnRequest {
    pub slot: u8,
    pub terminal_id: String,
}

impl ReturnRequest {
    pub fn parse(buf: &[u8]) -> Result<ReturnRequest, CodecError> {
        if buf.len() != 1 + TERMINAL_ID_LEN {
            return Err(CodecError::BadPayload("return request must be 9 bytes"));
        }
        Ok(ReturnRequest {
            slot: buf[0],
            terminal_id: read_terminal_id(&buf[1..])?,
        })
    }

    pub fn to_payload(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(1 + TERMINAL_ID_LEN);
        out.push(self.slot);
        write_terminal_id(&mut out, &self.terminal_id);
        out
    }
}

/// `0x66` reply payload, server → station.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReturnReply {
    pub slot: u8,
    pub result: ReturnCode,
}

impl ReturnReply {
    pub fn parse(buf: &[u8]) -> Result<ReturnReply, CodecError> {
        if buf.len() != 2 {
            return Err(CodecError::BadPayload("return reply must be 2 bytes"));
        }
        Ok(ReturnReply {
            slot: buf[0],
            result: ReturnCode::from_u8(buf[1])?,
        })
    }

    pub fn to_payload(&self) -> Vec<u8> {
        vec![self.slot, self.result as u8]
    }
}

/// `0x80` force-eject command payload, server → station.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EjectCommand {
    pub slot: u8,
}

impl EjectCommand {
    pub fn parse(buf: &[u8]) -> Result<EjectCommand, CodecError> {
        match buf {
            [slot] => Ok(EjectCommand { slot: *slot }),
            _ => Err(CodecError::BadPayload("eject command must be 1 byte")),
        }
    }

    pub fn to_payload(&self) -> Vec<u8> {
        vec![self.slot]
    }
}

/// `0x80` asynchronous result payload, station → server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EjectResult {
    pub slot: u8,
    pub ok: bool,
}

impl EjectResult {
    pub fn parse(buf: &[u8]) -> Result<EjectResult, CodecError> {
        match buf {
            [slot, result] => Ok(EjectResult {
                slot: *slot,
                ok: *result == 1,
            }),
            _ => Err(CodecError::BadPayload("eject result must be 2 bytes")),
        }
    }

    pub fn to_payload(&self) -> Vec<u8> {
        vec![self.slot, u8::from(self.ok)]
    }
}

/// `0x83` slot abnormal report payload, station → server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotAbnormalReport {
    pub slot: u8,
    pub error_code: u8,
    pub terminal_id: String,
}

impl SlotAbnormalReport {
    pub fn parse(buf: &[u8]) -> Result<SlotAbnormalReport, CodecError> {
        if buf.len() != 2 + TERMINAL_ID_LEN {
            return Err(CodecError::BadPayload("abnormal report must be 10 bytes"));
        }
        Ok(SlotAbnormalReport {
            slot: buf[0],
            error_code: buf[1],
            terminal_id: read_terminal_id(&buf[2..])?,
        })
    }

    pub fn to_payload(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(2 + TERMINAL_ID_LEN);
        out.push(self.slot);
        out.push(self.error_code);
        write_terminal_id(&mut out, &self.terminal_id);
        out
    }
}

fn parse_text(buf: &[u8], what: &'static str) -> Result<String, CodecError> {
    let s = std::str::from_utf8(buf).map_err(|_| CodecError::BadPayload(what))?;
    Ok(s.to_string())
}

fn parse_single_byte(buf: &[u8], what: &'static str) -> Result<u8, CodecError> {
    match buf {
        [b] => Ok(*b),
        _ => Err(CodecError::BadPayload(what)),
    }
}

/// Everything a station can send, decoded once by opcode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StationPacket {
    Login(LoginPacket),
    Heartbeat,
    InventoryReport(InventoryReport),
    BorrowResult(BorrowResult),
    ReturnRequest(ReturnRequest),
    RestartAck(u8),
    Iccid(String),
    ServerAddress(String),
    SetServerAddressAck(u8),
    SetVolumeAck(u8),
    VolumeReport(u8),
    EjectResult(EjectResult),
    SlotAbnormal(SlotAbnormalReport),
}

impl StationPacket {
    /// Decode an inbound payload for its opcode.
    pub fn decode(command: Command, payload: &[u8]) -> Result<StationPacket, CodecError> {
        match command {
            Command::Login => Ok(StationPacket::Login(LoginPacket::parse(payload)?)),
            Command::Heartbeat => {
                if payload.is_empty() {
                    Ok(StationPacket::Heartbeat)
                } else {
                    Err(CodecError::BadPayload("heartbeat payload must be empty"))
                }
            }
            Command::QueryInventory => Ok(StationPacket::InventoryReport(InventoryReport::parse(
                payload,
            )?)),
            Command::BorrowPowerBank => {
                Ok(StationPacket::BorrowResult(BorrowResult::parse(payload)?))
            }
            Command::ReturnPowerBank => {
                Ok(StationPacket::ReturnRequest(ReturnRequest::parse(payload)?))
            }
            Command::RestartCabinet => Ok(StationPacket::RestartAck(parse_single_byte(
                payload,
                "restart ack must be 1 byte",
            )?)),
            Command::QueryIccid => Ok(StationPacket::Iccid(parse_text(
                payload,
                "ICCID is not UTF-8",
            )?)),
            Command::QueryServerAddress => Ok(StationPacket::ServerAddress(parse_text(
                payload,
                "server address is not UTF-8",
            )?)),
            Command::SetServerAddress => Ok(StationPacket::SetServerAddressAck(
                parse_single_byte(payload, "set-address ack must be 1 byte")?,
            )),
            Command::SetVoiceVolume => Ok(StationPacket::SetVolumeAck(parse_single_byte(
                payload,
                "volume ack must be 1 byte",
            )?)),
            Command::QueryVoiceVolume => Ok(StationPacket::VolumeReport(parse_single_byte(
                payload,
                "volume report must be 1 byte",
            )?)),
            Command::ForceEject => Ok(StationPacket::EjectResult(EjectResult::parse(payload)?)),
            Command::SlotAbnormalReport => Ok(StationPacket::SlotAbnormal(
                SlotAbnormalReport::parse(payload)?,
            )),
        }
    }
}
