//! Wire envelope and protocol constants for CM connections.
//!
//! Every frame on a TCP connection is `length:u32-le | magic:u32-le | body`. The body is a
//! (possibly encrypted) message whose first four bytes are the message-type code; the top
//! bit of that code flags a protobuf-style header. WebSocket connections carry one body per
//! binary message and do not use the envelope.

use std::fmt;

use bytes::{Buf, BytesMut};
use serde::{Deserialize, Serialize};

use crate::error::{Result, TransportError};

/// Envelope header size in bytes (length:4 + magic:4)
pub const ENVELOPE_HEADER_SIZE: usize = 8;

/// Envelope magic ("VT01" read as little-endian u32)
pub const MAGIC: u32 = 0x3130_5456;

/// Largest frame body accepted from the wire.
pub const MAX_FRAME_SIZE: u32 = 32 * 1024 * 1024;

/// High bit of the message-type code marking a protobuf header.
pub const PROTO_MASK: u32 = 0x8000_0000;

/// Protocol version advertised in `ClientHello`.
pub const CLIENT_PROTOCOL_VERSION: u32 = 65580;

/// Channel encryption protocol version.
pub const CHANNEL_PROTOCOL_VERSION: u32 = 1;

/// Message-type code (the "EMsg"), without the proto flag.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MsgType(pub u32);

#[allow(missing_docs)]
impl MsgType {
    pub const INVALID: MsgType = MsgType(0);
    pub const MULTI: MsgType = MsgType(1);
    pub const SERVICE_METHOD: MsgType = MsgType(146);
    pub const SERVICE_METHOD_RESPONSE: MsgType = MsgType(147);
    pub const SERVICE_METHOD_CALL_FROM_CLIENT: MsgType = MsgType(151);
    pub const CLIENT_HEART_BEAT: MsgType = MsgType(703);
    pub const CLIENT_LOG_ON_RESPONSE: MsgType = MsgType(751);
    pub const CLIENT_LOGGED_OFF: MsgType = MsgType(757);
    pub const CLIENT_CM_LIST: MsgType = MsgType(783);
    pub const CLIENT_SESSION_TOKEN: MsgType = MsgType(850);
    pub const CHANNEL_ENCRYPT_REQUEST: MsgType = MsgType(1303);
    pub const CHANNEL_ENCRYPT_RESPONSE: MsgType = MsgType(1304);
    pub const CHANNEL_ENCRYPT_RESULT: MsgType = MsgType(1305);
    pub const CLIENT_LOGON: MsgType = MsgType(5514);
    pub const CLIENT_SERVER_UNAVAILABLE: MsgType = MsgType(5500);
    pub const CLIENT_HELLO: MsgType = MsgType(9805);
}

impl MsgType {
    /// Splits a raw wire code into the message type and the proto flag.
    pub fn from_raw(raw: u32) -> (MsgType, bool) {
        (MsgType(raw & !PROTO_MASK), raw & PROTO_MASK != 0)
    }

    /// Wire code for this type, with the proto flag set when `proto` is true.
    pub fn to_raw(self, proto: bool) -> u32 {
        if proto {
            self.0 | PROTO_MASK
        } else {
            self.0 & !PROTO_MASK
        }
    }

    /// Handshake messages always travel in the clear with a struct header.
    pub fn is_channel_encrypt(self) -> bool {
        matches!(
            self,
            MsgType::CHANNEL_ENCRYPT_REQUEST
                | MsgType::CHANNEL_ENCRYPT_RESPONSE
                | MsgType::CHANNEL_ENCRYPT_RESULT
        )
    }

    fn name(self) -> Option<&'static str> {
        Some(match self {
            MsgType::INVALID => "Invalid",
            MsgType::MULTI => "Multi",
            MsgType::SERVICE_METHOD => "ServiceMethod",
            MsgType::SERVICE_METHOD_RESPONSE => "ServiceMethodResponse",
            MsgType::SERVICE_METHOD_CALL_FROM_CLIENT => "ServiceMethodCallFromClient",
            MsgType::CLIENT_HEART_BEAT => "ClientHeartBeat",
            MsgType::CLIENT_LOG_ON_RESPONSE => "ClientLogOnResponse",
            MsgType::CLIENT_LOGGED_OFF => "ClientLoggedOff",
            MsgType::CLIENT_CM_LIST => "ClientCMList",
            MsgType::CLIENT_SESSION_TOKEN => "ClientSessionToken",
            MsgType::CHANNEL_ENCRYPT_REQUEST => "ChannelEncryptRequest",
            MsgType::CHANNEL_ENCRYPT_RESPONSE => "ChannelEncryptResponse",
            MsgType::CHANNEL_ENCRYPT_RESULT => "ChannelEncryptResult",
            MsgType::CLIENT_LOGON => "ClientLogon",
            MsgType::CLIENT_SERVER_UNAVAILABLE => "ClientServerUnavailable",
            MsgType::CLIENT_HELLO => "ClientHello",
            _ => return None,
        })
    }
}

impl fmt::Debug for MsgType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{}({})", name, self.0),
            None => write!(f, "MsgType({})", self.0),
        }
    }
}

impl fmt::Display for MsgType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => f.write_str(name),
            None => write!(f, "{}", self.0),
        }
    }
}

/// Result code carried by responses ("EResult").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EResult(pub i32);

#[allow(missing_docs)]
impl EResult {
    pub const INVALID: EResult = EResult(0);
    pub const OK: EResult = EResult(1);
    pub const FAIL: EResult = EResult(2);
    pub const NO_CONNECTION: EResult = EResult(3);
    pub const INVALID_PASSWORD: EResult = EResult(5);
    pub const LOGGED_IN_ELSEWHERE: EResult = EResult(6);
    pub const INVALID_PROTOCOL_VER: EResult = EResult(7);
    pub const SERVICE_UNAVAILABLE: EResult = EResult(20);
    pub const TIMEOUT: EResult = EResult(16);
    pub const TRY_ANOTHER_CM: EResult = EResult(48);
}

impl EResult {
    /// True for `OK`.
    pub fn is_ok(self) -> bool {
        self == EResult::OK
    }

    /// Results telling the client to move to a different CM server.
    pub fn is_server_rejection(self) -> bool {
        matches!(self, EResult::TRY_ANOTHER_CM | EResult::SERVICE_UNAVAILABLE)
    }
}

impl fmt::Display for EResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            EResult::OK => f.write_str("OK"),
            EResult::FAIL => f.write_str("Fail"),
            EResult::SERVICE_UNAVAILABLE => f.write_str("ServiceUnavailable"),
            EResult::TRY_ANOTHER_CM => f.write_str("TryAnotherCM"),
            EResult::INVALID_PROTOCOL_VER => f.write_str("InvalidProtocolVer"),
            other => write!(f, "EResult({})", other.0),
        }
    }
}

/// Deployment environment discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
#[allow(missing_docs)]
pub enum Universe {
    Invalid = 0,
    #[default]
    Public = 1,
    Beta = 2,
    Internal = 3,
    Dev = 4,
}

impl Universe {
    /// Unknown values map to `Invalid`.
    pub fn from_u8(raw: u8) -> Universe {
        match raw {
            1 => Universe::Public,
            2 => Universe::Beta,
            3 => Universe::Internal,
            4 => Universe::Dev,
            _ => Universe::Invalid,
        }
    }

    /// Wire byte for this universe.
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// Wraps a frame body in the TCP envelope.
pub fn encode_envelope(body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(ENVELOPE_HEADER_SIZE + body.len());
    out.extend_from_slice(&(body.len() as u32).to_le_bytes());
    out.extend_from_slice(&MAGIC.to_le_bytes());
    out.extend_from_slice(body);
    out
}

/// Decodes one complete envelope. The declared length must match the bytes given exactly.
pub fn decode_envelope(frame: &[u8]) -> Result<&[u8]> {
    if frame.len() < ENVELOPE_HEADER_SIZE {
        return Err(TransportError::InvalidFrame {
            reason: format!("envelope needs {} bytes, got {}", ENVELOPE_HEADER_SIZE, frame.len()),
        });
    }
    let (length, _) = read_envelope_header(frame)?;
    let available = frame.len() - ENVELOPE_HEADER_SIZE;
    if length as usize != available {
        return Err(TransportError::LengthMismatch {
            declared: length as usize,
            available,
        });
    }
    Ok(&frame[ENVELOPE_HEADER_SIZE..])
}

fn read_envelope_header(buf: &[u8]) -> Result<(u32, u32)> {
    let length = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
    let magic = u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]);
    if magic != MAGIC {
        return Err(TransportError::InvalidMagic {
            expected: MAGIC,
            got: magic,
        });
    }
    if length > MAX_FRAME_SIZE {
        return Err(TransportError::PayloadTooLarge {
            size: length,
            max_size: MAX_FRAME_SIZE,
        });
    }
    Ok((length, magic))
}

/// Incremental envelope decoder for a byte stream.
///
/// Bytes read from the socket are appended to the internal buffer; complete frames are
/// split off one at a time. Partial frames stay buffered across calls, which keeps socket
/// reads cancel-safe.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: BytesMut,
}

impl FrameDecoder {
    /// Creates an empty decoder.
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(8 * 1024),
        }
    }

    /// Buffer that socket reads should append into.
    pub fn buffer_mut(&mut self) -> &mut BytesMut {
        &mut self.buf
    }

    /// Number of buffered bytes not yet returned as a frame.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Returns the next complete frame body, or `None` if more bytes are needed.
    pub fn next_frame(&mut self) -> Result<Option<Vec<u8>>> {
        if self.buf.len() < ENVELOPE_HEADER_SIZE {
            return Ok(None);
        }
        let (length, _) = read_envelope_header(&self.buf[..ENVELOPE_HEADER_SIZE])?;
        let total = ENVELOPE_HEADER_SIZE + length as usize;
        if self.buf.len() < total {
            self.buf.reserve(total - self.buf.len());
            return Ok(None);
        }
        self.buf.advance(ENVELOPE_HEADER_SIZE);
        let body = self.buf.split_to(length as usize);
        Ok(Some(body.to_vec()))
    }
}
