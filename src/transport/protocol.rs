//! Binary websocket framing between transport clients and the relay.
//!
//! Every frame is `version (u8) | type (u8) | payload length (u24) | payload`,
//! with a bincode payload.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::io::{self, Cursor};

use super::{ChannelEvent, Notification};

/// Protocol version for compatibility checking
pub const PROTOCOL_VERSION: u8 = 1;

/// Maximum frame size (16MB)
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

const HEADER_LEN: usize = 5;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    // Connection
    Hello = 0x01,
    Welcome = 0x02,
    Error = 0x04,

    // Topics
    Subscribe = 0x20,
    Unsubscribe = 0x21,

    // Events
    Publish = 0x30,
    Deliver = 0x31,

    // Keepalive
    Ping = 0xF0,
    Pong = 0xF1,
}

impl TryFrom<u8> for MessageType {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, <Self as TryFrom<u8>>::Error> {
        match value {
            0x01 => Ok(MessageType::Hello),
            0x02 => Ok(MessageType::Welcome),
            0x04 => Ok(MessageType::Error),
            0x20 => Ok(MessageType::Subscribe),
            0x21 => Ok(MessageType::Unsubscribe),
            0x30 => Ok(MessageType::Publish),
            0x31 => Ok(MessageType::Deliver),
            0xF0 => Ok(MessageType::Ping),
            0xF1 => Ok(MessageType::Pong),
            _ => Err(ProtocolError::UnknownMessageType(value)),
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum ProtocolError {
    #[error("Unknown message type: 0x{0:02X}")]
    UnknownMessageType(u8),

    #[error("Invalid message format: {0}")]
    InvalidFormat(String),

    #[error("Message too large: {0} bytes (max: {1})")]
    MessageTooLarge(usize, usize),

    #[error("Version mismatch: expected {0}, got {1}")]
    VersionMismatch(u8, u8),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(String),
}

impl From<bincode::Error> for ProtocolError {
    fn from(err: bincode::Error) -> Self {
        ProtocolError::Serialization(err.to_string())
    }
}

impl From<io::Error> for ProtocolError {
    fn from(err: io::Error) -> Self {
        ProtocolError::Io(err.to_string())
    }
}

/// Frames sent from a transport client to the relay
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClientFrame {
    Hello {
        protocol_version: u8,
        client_id: String,
    },
    Subscribe {
        topic: String,
    },
    Unsubscribe {
        topic: String,
    },
    Publish {
        topic: String,
        event: ChannelEvent,
    },
    Ping {
        timestamp: u64,
    },
}

/// Frames sent from the relay to a transport client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerFrame {
    Welcome {
        protocol_version: u8,
        client_id: String,
        server_time: i64,
    },
    Deliver(Notification),
    Error {
        code: ErrorCode,
        message: String,
    },
    Pong {
        timestamp: u64,
        server_time: i64,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u16)]
pub enum ErrorCode {
    Unknown = 0,
    InvalidMessage = 1,
    VersionMismatch = 2,
    NotSubscribed = 3,
    ServerError = 4,
}

impl ClientFrame {
    fn message_type(&self) -> MessageType {
        match self {
            ClientFrame::Hello { .. } => MessageType::Hello,
            ClientFrame::Subscribe { .. } => MessageType::Subscribe,
            ClientFrame::Unsubscribe { .. } => MessageType::Unsubscribe,
            ClientFrame::Publish { .. } => MessageType::Publish,
            ClientFrame::Ping { .. } => MessageType::Ping,
        }
    }
}

impl ServerFrame {
    fn message_type(&self) -> MessageType {
        match self {
            ServerFrame::Welcome { .. } => MessageType::Welcome,
            ServerFrame::Deliver(_) => MessageType::Deliver,
            ServerFrame::Error { .. } => MessageType::Error,
            ServerFrame::Pong { .. } => MessageType::Pong,
        }
    }
}

/// Frame codec for encoding/decoding
pub struct FrameProtocol;

impl FrameProtocol {
    pub fn encode_client(frame: &ClientFrame) -> Result<Bytes, ProtocolError> {
        encode(frame.message_type(), frame)
    }

    pub fn encode_server(frame: &ServerFrame) -> Result<Bytes, ProtocolError> {
        encode(frame.message_type(), frame)
    }

    pub fn decode_client(data: &[u8]) -> Result<ClientFrame, ProtocolError> {
        let (msg_type, frame): (MessageType, ClientFrame) = decode(data)?;
        check_type(msg_type, frame.message_type())?;
        Ok(frame)
    }

    pub fn decode_server(data: &[u8]) -> Result<ServerFrame, ProtocolError> {
        let (msg_type, frame): (MessageType, ServerFrame) = decode(data)?;
        check_type(msg_type, frame.message_type())?;
        Ok(frame)
    }

    pub fn error_response(code: ErrorCode, message: impl Into<String>) -> ServerFrame {
        ServerFrame::Error {
            code,
            message: message.into(),
        }
    }
}

fn encode<T: Serialize>(msg_type: MessageType, msg: &T) -> Result<Bytes, ProtocolError> {
    let payload = bincode::serialize(msg)?;

    if payload.len() + HEADER_LEN > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::MessageTooLarge(
            payload.len() + HEADER_LEN,
            MAX_MESSAGE_SIZE,
        ));
    }

    let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
    buf.put_u8(PROTOCOL_VERSION);
    buf.put_u8(msg_type as u8);
    buf.put_u24(payload.len() as u32);
    buf.put_slice(&payload);

    Ok(buf.freeze())
}

fn decode<T: DeserializeOwned>(data: &[u8]) -> Result<(MessageType, T), ProtocolError> {
    if data.len() < HEADER_LEN {
        return Err(ProtocolError::InvalidFormat("Message too short".to_string()));
    }

    let mut cursor = Cursor::new(data);

    let version = cursor.get_u8();
    if version != PROTOCOL_VERSION {
        return Err(ProtocolError::VersionMismatch(PROTOCOL_VERSION, version));
    }

    let msg_type = MessageType::try_from(cursor.get_u8())?;
    let payload_len = cursor.get_uint(3) as usize;

    if data.len() < HEADER_LEN + payload_len {
        return Err(ProtocolError::InvalidFormat(format!(
            "Expected {} bytes, got {}",
            HEADER_LEN + payload_len,
            data.len()
        )));
    }

    let payload = &data[HEADER_LEN..HEADER_LEN + payload_len];
    Ok((msg_type, bincode::deserialize(payload)?))
}

fn check_type(header: MessageType, payload: MessageType) -> Result<(), ProtocolError> {
    if header != payload {
        return Err(ProtocolError::InvalidFormat(format!(
            "Header says {:?}, payload is {:?}",
            header, payload
        )));
    }
    Ok(())
}

/// Extension trait for writing u24 values
trait BufMutExt {
    fn put_u24(&mut self, n: u32);
}

impl BufMutExt for BytesMut {
    fn put_u24(&mut self, n: u32) {
        self.put_u8((n >> 16) as u8);
        self.put_u8((n >> 8) as u8);
        self.put_u8(n as u8);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::Operation;

    #[test]
    fn test_encode_decode_hello() {
        let frame = ClientFrame::Hello {
            protocol_version: PROTOCOL_VERSION,
            client_id: "client-123".to_string(),
        };

        let encoded = FrameProtocol::encode_client(&frame).unwrap();
        assert_eq!(encoded[0], PROTOCOL_VERSION);
        assert_eq!(encoded[1], MessageType::Hello as u8);
        assert_eq!(FrameProtocol::decode_client(&encoded).unwrap(), frame);
    }

    #[test]
    fn test_deliver_carries_edit() {
        let op = Operation::replace("alice", 3, 2, 1, "é");
        let frame = ServerFrame::Deliver(Notification {
            topic: "session:s:edits".to_string(),
            origin_id: "client-1".to_string(),
            event: ChannelEvent::Edit { op: op.clone(), base: 2 },
        });

        let encoded = FrameProtocol::encode_server(&frame).unwrap();
        match FrameProtocol::decode_server(&encoded).unwrap() {
            ServerFrame::Deliver(notification) => {
                assert_eq!(notification.event, ChannelEvent::Edit { op, base: 2 });
            }
            other => panic!("Wrong frame: {:?}", other),
        }
    }

    #[test]
    fn test_version_mismatch() {
        let data = FrameProtocol::encode_client(&ClientFrame::Ping { timestamp: 0 }).unwrap();
        let mut bytes = data.to_vec();
        bytes[0] = 0xFF;

        let result = FrameProtocol::decode_client(&bytes);
        assert!(matches!(result, Err(ProtocolError::VersionMismatch(_, _))));
    }

    #[test]
    fn test_mismatched_type_byte_rejected() {
        let data = FrameProtocol::encode_client(&ClientFrame::Ping { timestamp: 0 }).unwrap();
        let mut bytes = data.to_vec();
        bytes[1] = MessageType::Subscribe as u8;

        let result = FrameProtocol::decode_client(&bytes);
        assert!(matches!(result, Err(ProtocolError::InvalidFormat(_))));
    }

    #[test]
    fn test_truncated_frame() {
        let data = FrameProtocol::encode_client(&ClientFrame::Subscribe {
            topic: "session:s:presence".to_string(),
        })
        .unwrap();

        let result = FrameProtocol::decode_client(&data[..data.len() - 2]);
        assert!(matches!(result, Err(ProtocolError::InvalidFormat(_))));
        assert!(FrameProtocol::decode_client(&data[..3]).is_err());
    }

    #[test]
    fn test_message_type_conversion() {
        assert_eq!(MessageType::try_from(0x01).unwrap(), MessageType::Hello);
        assert_eq!(MessageType::try_from(0x31).unwrap(), MessageType::Deliver);
        assert!(MessageType::try_from(0xFF).is_err());
    }
}
