//! Typed proto messages and the bodies of the session messages the client handles itself.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use bytes::Bytes;
use steamcm_transport::{EResult, JobId, MsgHeader, MsgType, PacketMsg, ProtoHeader};

use crate::error::{ClientError, Result};

/// A proto message with a decoded body.
#[derive(Debug, Clone, PartialEq)]
pub struct ProtoMsg<B> {
    /// Message type.
    pub msg_type: MsgType,
    /// Proto header.
    pub header: ProtoHeader,
    /// Decoded body.
    pub body: B,
    /// Trailing payload after the body.
    pub payload: Bytes,
}

impl<B: prost::Message + Default> ProtoMsg<B> {
    /// New outgoing message with an empty header.
    pub fn new(msg_type: MsgType, body: B) -> Self {
        Self {
            msg_type,
            header: ProtoHeader::default(),
            body,
            payload: Bytes::new(),
        }
    }

    /// Decodes the body of a proto packet.
    pub fn decode(packet: &PacketMsg) -> Result<Self> {
        let MsgHeader::Proto(header) = &packet.header else {
            return Err(ClientError::NotProto(packet.msg_type));
        };
        let body = B::decode(&packet.body[..]).map_err(|source| ClientError::BodyDecode {
            msg: packet.msg_type,
            source,
        })?;
        Ok(Self {
            msg_type: packet.msg_type,
            header: header.clone(),
            body,
            payload: packet.payload.clone(),
        })
    }

    /// Like [`ProtoMsg::decode`], but checks the message type first.
    pub fn decode_expected(packet: &PacketMsg, expected: MsgType) -> Result<Self> {
        if packet.msg_type != expected {
            return Err(ClientError::UnexpectedMessage {
                expected,
                got: packet.msg_type,
            });
        }
        Self::decode(packet)
    }

    /// Attaches a trailing payload.
    pub fn with_payload(mut self, payload: impl Into<Bytes>) -> Self {
        self.payload = payload.into();
        self
    }

    /// Routes the message to an app.
    pub fn with_routing_app_id(mut self, app_id: u32) -> Self {
        self.header.routing_appid = Some(app_id);
        self
    }

    /// Job this message starts.
    pub fn source_job(&self) -> JobId {
        JobId(self.header.jobid_source.unwrap_or(0))
    }

    /// Job this message answers.
    pub fn target_job(&self) -> JobId {
        JobId(self.header.jobid_target.unwrap_or(0))
    }

    /// Result code from the header.
    pub fn eresult(&self) -> EResult {
        self.header.eresult.map(EResult).unwrap_or(EResult::INVALID)
    }

    /// Builds a reply whose target job is this message's source job.
    pub fn reply<R: prost::Message + Default>(&self, msg_type: MsgType, body: R) -> ProtoMsg<R> {
        let mut reply = ProtoMsg::new(msg_type, body);
        reply.header.jobid_target = self.header.jobid_source;
        reply
    }

    /// Encodes the body into a packet ready to send.
    pub fn into_packet(self) -> PacketMsg {
        PacketMsg {
            msg_type: self.msg_type,
            header: MsgHeader::Proto(self.header),
            body: Bytes::from(self.body.encode_to_vec()),
            payload: self.payload,
        }
    }
}

/// `CMsgClientHello`.
#[derive(Clone, PartialEq, prost::Message)]
pub struct ClientHello {
    /// Client protocol version.
    #[prost(uint32, optional, tag = "1")]
    pub protocol_version: Option<u32>,
}

/// `CMsgIPAddress`.
#[derive(Clone, PartialEq, prost::Message)]
pub struct IpAddressMsg {
    /// IPv4 address in host order.
    #[prost(fixed32, optional, tag = "1")]
    pub v4: Option<u32>,
    /// IPv6 address bytes.
    #[prost(bytes = "vec", optional, tag = "2")]
    pub v6: Option<Vec<u8>>,
}

impl IpAddressMsg {
    /// Converts to a std address. Malformed IPv6 bytes read as `None`.
    pub fn to_ip(&self) -> Option<IpAddr> {
        if let Some(v6) = &self.v6 {
            let octets: [u8; 16] = v6.as_slice().try_into().ok()?;
            return Some(IpAddr::V6(Ipv6Addr::from(octets)));
        }
        self.v4.map(|v4| IpAddr::V4(Ipv4Addr::from(v4)))
    }

    /// Converts from a std address.
    pub fn from_ip(ip: IpAddr) -> Self {
        match ip {
            IpAddr::V4(v4) => Self {
                v4: Some(u32::from(v4)),
                v6: None,
            },
            IpAddr::V6(v6) => Self {
                v4: None,
                v6: Some(v6.octets().to_vec()),
            },
        }
    }
}

/// `CMsgClientLogonResponse`, the fields the client itself consumes.
#[derive(Clone, PartialEq, prost::Message)]
pub struct ClientLogonResponse {
    /// Logon result.
    #[prost(int32, optional, tag = "1")]
    pub eresult: Option<i32>,
    /// Heartbeat interval in seconds.
    #[prost(int32, optional, tag = "2")]
    pub legacy_out_of_game_heartbeat_seconds: Option<i32>,
    /// In-game heartbeat interval in seconds.
    #[prost(int32, optional, tag = "3")]
    pub heartbeat_seconds: Option<i32>,
    /// Recommended content cell.
    #[prost(uint32, optional, tag = "7")]
    pub cell_id: Option<u32>,
    /// Public IP as seen by the server.
    #[prost(message, optional, tag = "15")]
    pub public_ip: Option<IpAddressMsg>,
    /// Country of the public IP.
    #[prost(string, optional, tag = "21")]
    pub ip_country_code: Option<String>,
}

impl ClientLogonResponse {
    /// Logon result; a missing field means failure.
    pub fn result(&self) -> EResult {
        EResult(self.eresult.unwrap_or(EResult::FAIL.0))
    }

    /// Heartbeat interval requested by the server, if any.
    pub fn heartbeat_interval(&self) -> Option<std::time::Duration> {
        self.legacy_out_of_game_heartbeat_seconds
            .filter(|s| *s > 0)
            .or(self.heartbeat_seconds.filter(|s| *s > 0))
            .map(|s| std::time::Duration::from_secs(s as u64))
    }
}

/// `CMsgClientLoggedOff`.
#[derive(Clone, PartialEq, prost::Message)]
pub struct ClientLoggedOff {
    /// Reason for the logoff.
    #[prost(int32, optional, tag = "1")]
    pub eresult: Option<i32>,
}

impl ClientLoggedOff {
    /// Logoff reason; a missing field means failure.
    pub fn result(&self) -> EResult {
        EResult(self.eresult.unwrap_or(EResult::FAIL.0))
    }
}

/// `CMsgClientSessionToken`.
#[derive(Clone, PartialEq, prost::Message)]
pub struct ClientSessionToken {
    /// Token value.
    #[prost(uint64, optional, tag = "1")]
    pub token: Option<u64>,
}

/// `CMsgClientCMList`.
#[derive(Clone, PartialEq, prost::Message)]
pub struct ClientCmList {
    /// IPv4 addresses of TCP servers, host order.
    #[prost(uint32, repeated, packed = "false", tag = "1")]
    pub cm_addresses: Vec<u32>,
    /// Ports matching `cm_addresses` by index.
    #[prost(uint32, repeated, packed = "false", tag = "2")]
    pub cm_ports: Vec<u32>,
    /// `host:port` endpoints of WebSocket servers.
    #[prost(string, repeated, tag = "3")]
    pub cm_websocket_addresses: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use steamcm_transport::decode_message;

    #[test]
    fn test_typed_roundtrip_through_codec() {
        let msg = ProtoMsg::new(
            MsgType::CLIENT_HELLO,
            ClientHello {
                protocol_version: Some(65580),
            },
        )
        .with_routing_app_id(440)
        .with_payload(&b"extra"[..]);

        let packet = decode_message(&msg.clone().into_packet().encode()).unwrap();
        let decoded = ProtoMsg::<ClientHello>::decode_expected(&packet, MsgType::CLIENT_HELLO).unwrap();
        assert_eq!(decoded.body.protocol_version, Some(65580));
        assert_eq!(decoded.header.routing_appid, Some(440));
        assert_eq!(&decoded.payload[..], b"extra");
    }

    #[test]
    fn test_decode_rejects_wrong_shape() {
        let packet = PacketMsg::new_struct(MsgType::CLIENT_HELLO, Bytes::new());
        assert!(matches!(
            ProtoMsg::<ClientHello>::decode(&packet),
            Err(ClientError::NotProto(MsgType::CLIENT_HELLO))
        ));

        let packet = PacketMsg::new_proto(MsgType::CLIENT_CM_LIST, Bytes::new());
        assert!(matches!(
            ProtoMsg::<ClientHello>::decode_expected(&packet, MsgType::CLIENT_HELLO),
            Err(ClientError::UnexpectedMessage { .. })
        ));

        let garbage = PacketMsg::new_proto(MsgType::CLIENT_HELLO, Bytes::from_static(&[0xFF, 0xFF]));
        assert!(matches!(
            ProtoMsg::<ClientHello>::decode(&garbage),
            Err(ClientError::BodyDecode { .. })
        ));
    }

    #[test]
    fn test_reply_targets_source_job() {
        let mut request = ProtoMsg::new(MsgType::SERVICE_METHOD, ClientHello::default());
        request.header.jobid_source = Some(77);
        let reply = request.reply(MsgType::SERVICE_METHOD_RESPONSE, ClientSessionToken { token: Some(1) });
        assert_eq!(reply.target_job(), JobId(77));
        assert!(reply.source_job().is_none());
    }

    #[test]
    fn test_logon_response_helpers() {
        let resp = ClientLogonResponse {
            eresult: None,
            heartbeat_seconds: Some(9),
            ..Default::default()
        };
        assert_eq!(resp.result(), EResult::FAIL);
        assert_eq!(resp.heartbeat_interval(), Some(std::time::Duration::from_secs(9)));

        let ip: IpAddr = "203.0.113.7".parse().unwrap();
        assert_eq!(IpAddressMsg::from_ip(ip).to_ip(), Some(ip));
        let v6: IpAddr = "2001:db8::1".parse().unwrap();
        assert_eq!(IpAddressMsg::from_ip(v6).to_ip(), Some(v6));
    }
}
