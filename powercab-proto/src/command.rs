//! Opcode table for the cabinet protocol.

use crate::frame::CodecError;

/// Protocol opcodes.
///
/// Direction is noted per variant; "result" means the station answers
/// asynchronously with the same opcode rather than inline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Command {
    /// Station → server, only opcode accepted before authentication.
    Login = 0x60,
    /// Station → server, server replies with an empty-payload beat.
    Heartbeat = 0x61,
    /// Server → station, station acks.
    SetServerAddress = 0x63,
    /// Server → station, station reports its slot contents.
    QueryInventory = 0x64,
    /// Server → station command + asynchronous station result.
    BorrowPowerBank = 0x65,
    /// Station → server, server replies with a result code 0-5.
    ReturnPowerBank = 0x66,
    /// Server → station, station acks.
    RestartCabinet = 0x67,
    /// Server → station, station reports its SIM ICCID.
    QueryIccid = 0x69,
    /// Server → station, station reports its configured server address.
    QueryServerAddress = 0x6A,
    /// Server → station, station acks.
    SetVoiceVolume = 0x70,
    /// Server → station, station reports the current volume.
    QueryVoiceVolume = 0x77,
    /// Server → station command + asynchronous station result.
    ForceEject = 0x80,
    /// Station → server, server acks.
    SlotAbnormalReport = 0x83,
}

impl Command {
    /// True for opcodes a station may send spontaneously (as opposed to
    /// results the server solicited).
    pub fn station_initiated(self) -> bool {
        matches!(
            self,
            Command::Login
                | Command::Heartbeat
                | Command::ReturnPowerBank
                | Command::SlotAbnormalReport
        )
    }
}

impl TryFrom<u8> for Command {
    type Error = CodecError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x60 => Ok(Command::Login),
            0x61 => Ok(Command::Heartbeat),
            0x63 => Ok(Command::SetServerAddress),
            0x64 => Ok(Command::QueryInventory),
            0x65 => Ok(Command::BorrowPowerBank),
            0x66 => Ok(Command::ReturnPowerBank),
            0x67 => Ok(Command::RestartCabinet),
            0x69 => Ok(Command::QueryIccid),
            0x6A => Ok(Command::QueryServerAddress),
            0x70 => Ok(Command::SetVoiceVolume),
            0x77 => Ok(Command::QueryVoiceVolume),
            0x80 => Ok(Command::ForceEject),
            0x83 => Ok(Command::SlotAbnormalReport),
            other => Err(CodecError::UnknownCommand(other)),
        }
    }
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}(0x{:02X})", self, *self as u8)
    }
}
