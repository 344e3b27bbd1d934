//! Frame encoding, XOR checksum and MD5-derived session tokens.

use md5::{Digest, Md5};
use thiserror::Error;

use crate::command::Command;

/// Bytes covered by the `length` field before the payload starts:
/// command, vsn, checksum and the 4-byte token.
pub const FRAME_OVERHEAD: usize = 7;

/// Maximum total frame size on the wire, length prefix included.
/// A frame claiming more than this is a protocol violation.
pub const MAX_FRAME_SIZE: usize = 1024;

/// Digest byte offsets used for the 4 token bytes, in order. The reversed
/// stride is a station firmware quirk and is load-bearing for interop.
const TOKEN_OFFSETS: [usize; 4] = [15, 11, 7, 3];

/// Errors produced while decoding a frame. Callers treat every variant as
/// a suspicious-packet event, never as fatal.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("frame too short or length field inconsistent")]
    TooShort,

    #[error("payload checksum mismatch")]
    BadChecksum,

    #[error("session token mismatch")]
    BadToken,

    #[error("unknown command 0x{0:02X}")]
    UnknownCommand(u8),

    #[error("malformed payload: {0}")]
    BadPayload(&'static str),
}

/// XOR checksum over the payload. Empty payload checksums to 0.
pub fn checksum(payload: &[u8]) -> u8 {
    payload.iter().fold(0, |acc, b| acc ^ b)
}

/// Derive the 4-byte session token for a payload and per-station secret.
///
/// `MD5(payload ++ secret_key)`, taking digest bytes 15, 11, 7, 3 in that
/// order as the big-endian token value.
pub fn derive_token(payload: &[u8], secret_key: &[u8]) -> u32 {
    let mut hasher = Md5::new();
    hasher.update(payload);
    hasher.update(secret_key);
    let digest = hasher.finalize();

    let mut bytes = [0u8; 4];
    for (i, &off) in TOKEN_OFFSETS.iter().enumerate() {
        bytes[i] = digest[off];
    }
    u32::from_be_bytes(bytes)
}

/// A decoded wire frame.
///
/// `decode` validates structure and checksum; the token can only be checked
/// once the per-station secret is known, via [`Frame::verify_token`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub command: Command,
    pub vsn: u8,
    pub token: u32,
    pub payload: Vec<u8>,
}

impl Frame {
    /// Encode a complete frame, deriving checksum and token.
    pub fn encode(command: Command, vsn: u8, payload: &[u8], secret_key: &[u8]) -> Vec<u8> {
        let length = (FRAME_OVERHEAD + payload.len()) as u16;
        let mut out = Vec::with_capacity(2 + length as usize);
        out.extend_from_slice(&length.to_be_bytes());
        out.push(command as u8);
        out.push(vsn);
        out.push(checksum(payload));
        out.extend_from_slice(&derive_token(payload, secret_key).to_be_bytes());
        out.extend_from_slice(payload);
        out
    }

    /// Decode a complete frame (length prefix included).
    pub fn decode(buf: &[u8]) -> Result<Frame, CodecError> {
        if buf.len() < 2 + FRAME_OVERHEAD {
            return Err(CodecError::TooShort);
        }

        let declared = u16::from_be_bytes([buf[0], buf[1]]) as usize;
        if declared < FRAME_OVERHEAD || buf.len() != 2 + declared {
            return Err(CodecError::TooShort);
        }

        let command = Command::try_from(buf[2])?;
        let vsn = buf[3];
        let wire_checksum = buf[4];
        let token = u32::from_be_bytes([buf[5], buf[6], buf[7], buf[8]]);
        let payload = buf[9..].to_vec();

        if checksum(&payload) != wire_checksum {
            return Err(CodecError::BadChecksum);
        }

        Ok(Frame {
            command,
            vsn,
            token,
            payload,
        })
    }

    /// Check the frame token against a secret key.
    pub fn verify_token(&self, secret_key: &[u8]) -> bool {
        derive_token(&self.payload, secret_key) == self.token
    }
}
