//! Bridge wire messages.
//!
//! Every bridge frame carries one serialized [`BridgeEnvelope`]. The frame's
//! message type id names the body kind, and the envelope names the sender's
//! public endpoint so replies can be addressed to it.

use std::net::SocketAddr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::serialization::Serializer;
use crate::core::Frame;
use crate::error::{BridgeError, ProtocolError, Result};

/// Frame type id of a request
pub const REQUEST_TYPE_ID: i32 = 1;

/// Frame type id of a response
pub const RESPONSE_TYPE_ID: i32 = 2;

/// Frame type id of a fire-and-forget message
pub const NOTIFY_TYPE_ID: i32 = 3;

/// Body of a bridge frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum BridgeMessage {
    Request {
        id: Uuid,
        handler_id: String,
        /// Serialized request argument
        context: Vec<u8>,
    },
    Response {
        id: Uuid,
        result: std::result::Result<Vec<u8>, BridgeError>,
    },
    Notify {
        payload: Vec<u8>,
    },
}

impl BridgeMessage {
    pub fn message_type_id(&self) -> i32 {
        match self {
            BridgeMessage::Request { .. } => REQUEST_TYPE_ID,
            BridgeMessage::Response { .. } => RESPONSE_TYPE_ID,
            BridgeMessage::Notify { .. } => NOTIFY_TYPE_ID,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            BridgeMessage::Request { .. } => "request",
            BridgeMessage::Response { .. } => "response",
            BridgeMessage::Notify { .. } => "notify",
        }
    }
}

/// A bridge message plus the public endpoint of the node that sent it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BridgeEnvelope {
    pub origin: SocketAddr,
    pub body: BridgeMessage,
}

impl BridgeEnvelope {
    pub fn new(origin: SocketAddr, body: BridgeMessage) -> Self {
        Self { origin, body }
    }

    pub fn to_frame<S: Serializer>(&self, serializer: &S) -> Result<Frame> {
        let payload = serializer.serialize(self)?;
        Ok(Frame::new(self.body.message_type_id(), payload))
    }

    /// Decode an envelope, checking it matches the frame's type id.
    pub fn from_frame<S: Serializer>(frame: &Frame, serializer: &S) -> Result<Self> {
        let envelope: Self = serializer.deserialize(frame.payload())?;
        if envelope.body.message_type_id() != frame.message_type_id() {
            return Err(ProtocolError::DeserializeError(format!(
                "Bridge frame type {} carries a {} body",
                frame.message_type_id(),
                envelope.body.kind()
            )));
        }
        Ok(envelope)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::SerializationFormat;

    #[test]
    fn test_type_ids_follow_body() {
        let origin: SocketAddr = "127.0.0.1:9100".parse().unwrap();
        let envelope = BridgeEnvelope::new(
            origin,
            BridgeMessage::Response {
                id: Uuid::new_v4(),
                result: Err(BridgeError::NoHandler("echo".into())),
            },
        );

        let frame = envelope.to_frame(&SerializationFormat::Bincode).unwrap();
        assert_eq!(frame.message_type_id(), RESPONSE_TYPE_ID);

        let back = BridgeEnvelope::from_frame(&frame, &SerializationFormat::Bincode).unwrap();
        assert_eq!(back, envelope);
    }

    #[test]
    fn test_mismatched_type_id_rejected() {
        let origin: SocketAddr = "127.0.0.1:9100".parse().unwrap();
        let envelope = BridgeEnvelope::new(origin, BridgeMessage::Notify { payload: vec![1] });
        let frame = envelope.to_frame(&SerializationFormat::Json).unwrap();
        let forged = Frame::new(REQUEST_TYPE_ID, frame.payload().clone());

        assert!(BridgeEnvelope::from_frame(&forged, &SerializationFormat::Json).is_err());
    }
}
