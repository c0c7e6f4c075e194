//! CM message headers and the packet codec.
//!
//! A decrypted frame body starts with the raw message-type code. Without the proto flag
//! it is followed by a fixed 35-byte struct header; with the flag it is followed by a
//! length-prefixed protobuf [`ProtoHeader`], the body and an optional trailing payload.

use bytes::Bytes;

use crate::error::{Result, TransportError};
use crate::job::JobId;
use crate::protocol::{EResult, MsgType, Universe};

/// Size of the struct header including the four-byte message-type code.
pub const STRUCT_HEADER_SIZE: usize = 39;

/// Size of the label field in the struct header.
pub const LABEL_SIZE: usize = 16;

/// Current struct header version.
pub const STRUCT_HEADER_VERSION: u16 = 2;

/// Fixed-layout header used by handshake messages and legacy struct messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StructHeader {
    /// Header layout version.
    pub header_version: u16,
    /// Job this message answers.
    pub target_job: JobId,
    /// Job this message starts.
    pub source_job: JobId,
    /// Human-readable label, at most 16 bytes of UTF-8.
    pub label: String,
    /// Universe the sender belongs to.
    pub universe: Universe,
}

impl Default for StructHeader {
    fn default() -> Self {
        Self {
            header_version: STRUCT_HEADER_VERSION,
            target_job: JobId::NONE,
            source_job: JobId::NONE,
            label: String::new(),
            universe: Universe::Public,
        }
    }
}

impl StructHeader {
    fn encode_into(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.header_version.to_le_bytes());
        out.extend_from_slice(&self.target_job.0.to_le_bytes());
        out.extend_from_slice(&self.source_job.0.to_le_bytes());
        let mut label = [0u8; LABEL_SIZE];
        let text = truncate_utf8(&self.label, LABEL_SIZE);
        label[..text.len()].copy_from_slice(text.as_bytes());
        out.extend_from_slice(&label);
        out.push(self.universe.as_u8());
    }

    fn decode(buf: &[u8]) -> StructHeader {
        let header_version = u16::from_le_bytes([buf[0], buf[1]]);
        let target_job = JobId(read_u64(&buf[2..10]));
        let source_job = JobId(read_u64(&buf[10..18]));
        let raw_label = &buf[18..18 + LABEL_SIZE];
        let end = raw_label.iter().position(|b| *b == 0).unwrap_or(LABEL_SIZE);
        let label = String::from_utf8_lossy(&raw_label[..end]).into_owned();
        let universe = Universe::from_u8(buf[18 + LABEL_SIZE]);
        StructHeader {
            header_version,
            target_job,
            source_job,
            label,
            universe,
        }
    }
}

fn truncate_utf8(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

fn read_u64(buf: &[u8]) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&buf[..8]);
    u64::from_le_bytes(raw)
}

/// Protobuf header carried by proto-flagged messages.
#[derive(Clone, PartialEq, prost::Message)]
pub struct ProtoHeader {
    /// Account the session is logged on as.
    #[prost(fixed64, optional, tag = "1")]
    pub steamid: Option<u64>,
    /// Session id assigned at logon.
    #[prost(int32, optional, tag = "2")]
    pub client_sessionid: Option<i32>,
    /// App the message is routed to.
    #[prost(uint32, optional, tag = "3")]
    pub routing_appid: Option<u32>,
    /// Job this message starts.
    #[prost(fixed64, optional, tag = "10")]
    pub jobid_source: Option<u64>,
    /// Job this message answers.
    #[prost(fixed64, optional, tag = "11")]
    pub jobid_target: Option<u64>,
    /// Service method name for unified service calls.
    #[prost(string, optional, tag = "12")]
    pub target_job_name: Option<String>,
    /// Result code of a response.
    #[prost(int32, optional, tag = "13")]
    pub eresult: Option<i32>,
    /// Error detail accompanying a failed result.
    #[prost(string, optional, tag = "14")]
    pub error_message: Option<String>,
    /// Length of the trailing payload. Filled in by the codec.
    #[prost(uint32, optional, tag = "40")]
    pub trailing_length: Option<u32>,
}

/// Either header shape.
#[derive(Debug, Clone, PartialEq)]
pub enum MsgHeader {
    /// Fixed-layout struct header.
    Struct(StructHeader),
    /// Protobuf header.
    Proto(ProtoHeader),
}

impl MsgHeader {
    /// True for the protobuf header.
    pub fn is_proto(&self) -> bool {
        matches!(self, MsgHeader::Proto(_))
    }

    /// Job this message answers, [`JobId::NONE`] when absent.
    pub fn target_job(&self) -> JobId {
        match self {
            MsgHeader::Struct(h) => h.target_job,
            MsgHeader::Proto(h) => JobId(h.jobid_target.unwrap_or(0)),
        }
    }

    /// Job this message starts, [`JobId::NONE`] when absent.
    pub fn source_job(&self) -> JobId {
        match self {
            MsgHeader::Struct(h) => h.source_job,
            MsgHeader::Proto(h) => JobId(h.jobid_source.unwrap_or(0)),
        }
    }

    /// Sets the target job. `NONE` clears the proto field.
    pub fn set_target_job(&mut self, job: JobId) {
        match self {
            MsgHeader::Struct(h) => h.target_job = job,
            MsgHeader::Proto(h) => h.jobid_target = (!job.is_none()).then_some(job.0),
        }
    }

    /// Sets the source job. `NONE` clears the proto field.
    pub fn set_source_job(&mut self, job: JobId) {
        match self {
            MsgHeader::Struct(h) => h.source_job = job,
            MsgHeader::Proto(h) => h.jobid_source = (!job.is_none()).then_some(job.0),
        }
    }
}

/// A decoded (or ready-to-encode) CM message.
#[derive(Debug, Clone, PartialEq)]
pub struct PacketMsg {
    /// Message type without the proto flag.
    pub msg_type: MsgType,
    /// Header, which also decides the wire shape.
    pub header: MsgHeader,
    /// Body bytes. Opaque to the codec.
    pub body: Bytes,
    /// Trailing payload after the body. Always empty for decoded struct messages.
    pub payload: Bytes,
}

impl PacketMsg {
    /// Proto message with a default header.
    pub fn new_proto(msg_type: MsgType, body: impl Into<Bytes>) -> Self {
        Self {
            msg_type,
            header: MsgHeader::Proto(ProtoHeader::default()),
            body: body.into(),
            payload: Bytes::new(),
        }
    }

    /// Struct message with a default header.
    pub fn new_struct(msg_type: MsgType, body: impl Into<Bytes>) -> Self {
        Self {
            msg_type,
            header: MsgHeader::Struct(StructHeader::default()),
            body: body.into(),
            payload: Bytes::new(),
        }
    }

    /// Response to `self`: a new message of the same header shape targeting its source job.
    pub fn reply_to(&self, msg_type: MsgType, body: impl Into<Bytes>) -> Self {
        let mut reply = if self.is_proto() {
            PacketMsg::new_proto(msg_type, body)
        } else {
            PacketMsg::new_struct(msg_type, body)
        };
        reply.header.set_target_job(self.source_job());
        reply
    }

    /// Attaches a trailing payload.
    pub fn with_payload(mut self, payload: impl Into<Bytes>) -> Self {
        self.payload = payload.into();
        self
    }

    /// Sets the routing app id. No effect on struct messages.
    pub fn with_routing_app_id(mut self, app_id: u32) -> Self {
        if let MsgHeader::Proto(h) = &mut self.header {
            h.routing_appid = Some(app_id);
        }
        self
    }

    /// Sets the target job.
    pub fn with_target_job(mut self, job: JobId) -> Self {
        self.header.set_target_job(job);
        self
    }

    /// True when the message uses the protobuf header.
    pub fn is_proto(&self) -> bool {
        self.header.is_proto()
    }

    /// Job this message answers.
    pub fn target_job(&self) -> JobId {
        self.header.target_job()
    }

    /// Job this message starts.
    pub fn source_job(&self) -> JobId {
        self.header.source_job()
    }

    /// Proto header, if any.
    pub fn proto_header(&self) -> Option<&ProtoHeader> {
        match &self.header {
            MsgHeader::Proto(h) => Some(h),
            MsgHeader::Struct(_) => None,
        }
    }

    /// Mutable proto header, if any.
    pub fn proto_header_mut(&mut self) -> Option<&mut ProtoHeader> {
        match &mut self.header {
            MsgHeader::Proto(h) => Some(h),
            MsgHeader::Struct(_) => None,
        }
    }

    /// Result code from the proto header, `Invalid` when absent.
    pub fn eresult(&self) -> EResult {
        self.proto_header()
            .and_then(|h| h.eresult)
            .map(EResult)
            .unwrap_or(EResult::INVALID)
    }

    /// Moves everything after the first `body_len` body bytes into `payload`.
    ///
    /// Struct bodies have a fixed layout known only to the caller, so the codec cannot
    /// split body and payload by itself.
    pub fn split_payload(&mut self, body_len: usize) -> Result<()> {
        if body_len > self.body.len() {
            return Err(TransportError::LengthMismatch {
                declared: body_len,
                available: self.body.len(),
            });
        }
        let rest = self.body.split_off(body_len);
        if !rest.is_empty() {
            let mut payload = rest.to_vec();
            payload.extend_from_slice(&self.payload);
            self.payload = Bytes::from(payload);
        }
        Ok(())
    }

    /// Encodes this message into a frame body.
    pub fn encode(&self) -> Vec<u8> {
        encode_message(self.msg_type, &self.header, &self.body, &self.payload)
    }
}

/// Encodes a message into a frame body (before channel encryption).
pub fn encode_message(msg_type: MsgType, header: &MsgHeader, body: &[u8], payload: &[u8]) -> Vec<u8> {
    match header {
        MsgHeader::Struct(h) => {
            let mut out = Vec::with_capacity(STRUCT_HEADER_SIZE + body.len() + payload.len());
            out.extend_from_slice(&msg_type.to_raw(false).to_le_bytes());
            h.encode_into(&mut out);
            out.extend_from_slice(body);
            out.extend_from_slice(payload);
            out
        }
        MsgHeader::Proto(h) => {
            let mut header = h.clone();
            header.trailing_length = (!payload.is_empty()).then_some(payload.len() as u32);
            let header_bytes = prost::Message::encode_to_vec(&header);
            let mut out = Vec::with_capacity(8 + header_bytes.len() + body.len() + payload.len());
            out.extend_from_slice(&msg_type.to_raw(true).to_le_bytes());
            out.extend_from_slice(&(header_bytes.len() as u32).to_le_bytes());
            out.extend_from_slice(&header_bytes);
            out.extend_from_slice(body);
            out.extend_from_slice(payload);
            out
        }
    }
}

/// Reads only the message-type code and proto flag of a frame body.
pub fn peek_msg_type(frame: &[u8]) -> Result<(MsgType, bool)> {
    if frame.len() < 4 {
        return Err(TransportError::InvalidFrame {
            reason: format!("message needs at least 4 bytes, got {}", frame.len()),
        });
    }
    Ok(MsgType::from_raw(u32::from_le_bytes([
        frame[0], frame[1], frame[2], frame[3],
    ])))
}

/// Decodes a frame body into a [`PacketMsg`].
pub fn decode_message(frame: &[u8]) -> Result<PacketMsg> {
    let (msg_type, proto) = peek_msg_type(frame)?;
    if !proto {
        if frame.len() < STRUCT_HEADER_SIZE {
            return Err(TransportError::InvalidFrame {
                reason: format!(
                    "struct header needs {} bytes, got {}",
                    STRUCT_HEADER_SIZE,
                    frame.len()
                ),
            });
        }
        let header = StructHeader::decode(&frame[4..STRUCT_HEADER_SIZE]);
        return Ok(PacketMsg {
            msg_type,
            header: MsgHeader::Struct(header),
            body: Bytes::copy_from_slice(&frame[STRUCT_HEADER_SIZE..]),
            payload: Bytes::new(),
        });
    }

    if frame.len() < 8 {
        return Err(TransportError::InvalidFrame {
            reason: format!("proto header length missing, got {} bytes", frame.len()),
        });
    }
    let header_len = u32::from_le_bytes([frame[4], frame[5], frame[6], frame[7]]) as usize;
    let rest = &frame[8..];
    if header_len > rest.len() {
        return Err(TransportError::HeaderOverflow {
            claimed: header_len,
            available: rest.len(),
        });
    }
    let mut header: ProtoHeader = prost::Message::decode(&rest[..header_len])?;
    let trailing = header.trailing_length.take().unwrap_or(0) as usize;
    let rest = &rest[header_len..];
    if trailing > rest.len() {
        return Err(TransportError::LengthMismatch {
            declared: trailing,
            available: rest.len(),
        });
    }
    let split = rest.len() - trailing;
    Ok(PacketMsg {
        msg_type,
        header: MsgHeader::Proto(header),
        body: Bytes::copy_from_slice(&rest[..split]),
        payload: Bytes::copy_from_slice(&rest[split..]),
    })
}

/// `CMsgMulti` body: several messages batched into one frame.
#[derive(Clone, PartialEq, prost::Message)]
pub struct MultiMsg {
    /// Uncompressed size when `message_body` is gzipped, zero otherwise.
    #[prost(uint32, optional, tag = "1")]
    pub size_unzipped: Option<u32>,
    /// Concatenated `len u32 LE | message` records.
    #[prost(bytes = "vec", optional, tag = "2")]
    pub message_body: Option<Vec<u8>>,
}

/// Splits a `Multi` packet into the encoded messages it carries.
///
/// Compressed containers are rejected with [`TransportError::InvalidFrame`].
pub fn unpack_multi(packet: &PacketMsg) -> Result<Vec<Vec<u8>>> {
    if !packet.is_proto() {
        return Err(TransportError::InvalidFrame {
            reason: "multi message without proto header".into(),
        });
    }
    let multi: MultiMsg = prost::Message::decode(&packet.body[..])?;
    if multi.size_unzipped.unwrap_or(0) > 0 {
        return Err(TransportError::InvalidFrame {
            reason: "compressed multi messages are not supported".into(),
        });
    }
    let body = multi.message_body.unwrap_or_default();
    let mut out = Vec::new();
    let mut rest = &body[..];
    while !rest.is_empty() {
        if rest.len() < 4 {
            return Err(TransportError::InvalidFrame {
                reason: format!("truncated multi record length, {} bytes left", rest.len()),
            });
        }
        let len = u32::from_le_bytes([rest[0], rest[1], rest[2], rest[3]]) as usize;
        rest = &rest[4..];
        if len > rest.len() {
            return Err(TransportError::LengthMismatch {
                declared: len,
                available: rest.len(),
            });
        }
        out.push(rest[..len].to_vec());
        rest = &rest[len..];
    }
    Ok(out)
}

/// Batches already encoded messages into one uncompressed `Multi` packet.
pub fn pack_multi<I, B>(messages: I) -> PacketMsg
where
    I: IntoIterator<Item = B>,
    B: AsRef<[u8]>,
{
    let mut body = Vec::new();
    for message in messages {
        let message = message.as_ref();
        body.extend_from_slice(&(message.len() as u32).to_le_bytes());
        body.extend_from_slice(message);
    }
    let multi = MultiMsg {
        size_unzipped: Some(0),
        message_body: Some(body),
    };
    PacketMsg::new_proto(MsgType::MULTI, prost::Message::encode_to_vec(&multi))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn proto_header() -> ProtoHeader {
        ProtoHeader {
            steamid: Some(76561197960265728),
            client_sessionid: Some(-5),
            routing_appid: Some(440),
            jobid_source: Some(11),
            jobid_target: Some(22),
            target_job_name: Some("Player.GetGameBadgeLevels#1".into()),
            eresult: Some(1),
            error_message: None,
            trailing_length: None,
        }
    }

    #[test]
    fn test_struct_roundtrip() {
        let header = StructHeader {
            header_version: 2,
            target_job: JobId(0xDEAD_BEEF),
            source_job: JobId(u64::MAX),
            label: "hello".into(),
            universe: Universe::Beta,
        };
        let bytes = encode_message(
            MsgType::CHANNEL_ENCRYPT_REQUEST,
            &MsgHeader::Struct(header.clone()),
            b"body",
            b"",
        );
        assert_eq!(bytes.len(), STRUCT_HEADER_SIZE + 4);
        let msg = decode_message(&bytes).unwrap();
        assert_eq!(msg.msg_type, MsgType::CHANNEL_ENCRYPT_REQUEST);
        assert_eq!(msg.header, MsgHeader::Struct(header));
        assert_eq!(&msg.body[..], b"body");
        assert!(msg.payload.is_empty());
    }

    #[test]
    fn test_struct_payload_is_contiguous() {
        let bytes = encode_message(
            MsgType(5000),
            &MsgHeader::Struct(StructHeader::default()),
            b"abcd",
            b"xyz",
        );
        let mut msg = decode_message(&bytes).unwrap();
        assert_eq!(&msg.body[..], b"abcdxyz");
        msg.split_payload(4).unwrap();
        assert_eq!(&msg.body[..], b"abcd");
        assert_eq!(&msg.payload[..], b"xyz");
    }

    #[test]
    fn test_split_payload_too_long() {
        let mut msg = PacketMsg::new_struct(MsgType(5000), &b"ab"[..]);
        assert!(matches!(
            msg.split_payload(3),
            Err(TransportError::LengthMismatch { .. })
        ));
    }

    #[test]
    fn test_label_truncated_on_char_boundary() {
        let header = StructHeader {
            label: "ééééééééé".into(),
            ..Default::default()
        };
        let bytes = encode_message(MsgType(1), &MsgHeader::Struct(header), b"", b"");
        let msg = decode_message(&bytes).unwrap();
        match msg.header {
            MsgHeader::Struct(h) => assert_eq!(h.label, "éééééééé"),
            MsgHeader::Proto(_) => panic!("expected struct header"),
        }
    }

    #[test]
    fn test_proto_roundtrip_with_payload() {
        let header = proto_header();
        let bytes = encode_message(
            MsgType::SERVICE_METHOD,
            &MsgHeader::Proto(header.clone()),
            b"\x08\x01",
            b"trailing",
        );
        let msg = decode_message(&bytes).unwrap();
        assert!(msg.is_proto());
        assert_eq!(msg.msg_type, MsgType::SERVICE_METHOD);
        assert_eq!(msg.header, MsgHeader::Proto(header));
        assert_eq!(&msg.body[..], b"\x08\x01");
        assert_eq!(&msg.payload[..], b"trailing");
        assert_eq!(msg.target_job(), JobId(22));
        assert_eq!(msg.source_job(), JobId(11));
        assert_eq!(msg.eresult(), EResult::OK);
    }

    #[test]
    fn test_proto_header_overflow() {
        let mut bytes = encode_message(
            MsgType::CLIENT_HELLO,
            &MsgHeader::Proto(proto_header()),
            b"",
            b"",
        );
        bytes[4..8].copy_from_slice(&1000u32.to_le_bytes());
        assert!(matches!(
            decode_message(&bytes),
            Err(TransportError::HeaderOverflow { claimed: 1000, .. })
        ));
    }

    #[test]
    fn test_proto_trailing_length_overflow() {
        let header = ProtoHeader {
            trailing_length: Some(50),
            ..Default::default()
        };
        let header_bytes = prost::Message::encode_to_vec(&header);
        let mut bytes = MsgType::CLIENT_HELLO.to_raw(true).to_le_bytes().to_vec();
        bytes.extend_from_slice(&(header_bytes.len() as u32).to_le_bytes());
        bytes.extend_from_slice(&header_bytes);
        bytes.extend_from_slice(b"short");
        assert!(matches!(
            decode_message(&bytes),
            Err(TransportError::LengthMismatch { declared: 50, .. })
        ));
    }

    #[test]
    fn test_truncated_frames() {
        assert!(decode_message(&[1, 0]).unwrap_err().is_framing());
        assert!(decode_message(&[1, 0, 0, 0, 2]).unwrap_err().is_framing());
        let proto = MsgType::CLIENT_HELLO.to_raw(true).to_le_bytes();
        assert!(decode_message(&proto).unwrap_err().is_framing());
    }

    #[test]
    fn test_garbage_proto_header() {
        let mut bytes = MsgType::CLIENT_HELLO.to_raw(true).to_le_bytes().to_vec();
        bytes.extend_from_slice(&2u32.to_le_bytes());
        bytes.extend_from_slice(&[0xFF, 0xFF]);
        assert!(matches!(
            decode_message(&bytes),
            Err(TransportError::Decode(_))
        ));
    }

    #[test]
    fn test_reply_to_targets_source() {
        let mut request = PacketMsg::new_proto(MsgType::SERVICE_METHOD, &b"req"[..]);
        request.header.set_source_job(JobId(99));
        let reply = request.reply_to(MsgType::SERVICE_METHOD_RESPONSE, &b"resp"[..]);
        assert!(reply.is_proto());
        assert_eq!(reply.target_job(), JobId(99));
        assert_eq!(reply.source_job(), JobId::NONE);
    }

    #[test]
    fn test_routing_app_id_only_on_proto() {
        let proto = PacketMsg::new_proto(MsgType(1), Bytes::new()).with_routing_app_id(730);
        assert_eq!(proto.proto_header().unwrap().routing_appid, Some(730));
        let plain = PacketMsg::new_struct(MsgType(1), Bytes::new()).with_routing_app_id(730);
        assert!(plain.proto_header().is_none());
    }

    #[test]
    fn test_none_job_clears_proto_field() {
        let mut header = MsgHeader::Proto(ProtoHeader::default());
        header.set_target_job(JobId(5));
        header.set_target_job(JobId::NONE);
        assert_eq!(header, MsgHeader::Proto(ProtoHeader::default()));
    }

    #[test]
    fn test_multi_unpacks_in_order() {
        let first = PacketMsg::new_proto(MsgType::CLIENT_CM_LIST, Bytes::from_static(b"a")).encode();
        let second =
            PacketMsg::new_proto(MsgType::CLIENT_SESSION_TOKEN, Bytes::from_static(b"bc")).encode();
        let multi = decode_message(&pack_multi([&first, &second]).encode()).unwrap();
        assert_eq!(multi.msg_type, MsgType::MULTI);
        let parts = unpack_multi(&multi).unwrap();
        assert_eq!(parts, vec![first, second]);
    }

    #[test]
    fn test_multi_rejects_compressed_and_truncated() {
        let compressed = MultiMsg {
            size_unzipped: Some(10),
            message_body: Some(vec![1, 2, 3]),
        };
        let packet =
            PacketMsg::new_proto(MsgType::MULTI, prost::Message::encode_to_vec(&compressed));
        assert!(unpack_multi(&packet).is_err());

        let truncated = MultiMsg {
            size_unzipped: None,
            message_body: Some(vec![9, 0, 0, 0, 1]),
        };
        let packet =
            PacketMsg::new_proto(MsgType::MULTI, prost::Message::encode_to_vec(&truncated));
        assert!(matches!(
            unpack_multi(&packet),
            Err(TransportError::LengthMismatch { declared: 9, available: 1 })
        ));
    }
}
