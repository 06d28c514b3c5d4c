//! Frame type and wire header layouts.
//!
//! A frame is one complete length-delimited message. Two header shapes exist,
//! and a given service uses exactly one of them:
//!
//! ```text
//! Minimal  (8 bytes):  [totalLength i32][messageTypeId i32][payload]
//! Extended (16 bytes): [totalLength i32][messageTypeId i32]
//!                      [typeNameLength i32][payloadLength i32][typeName][payload]
//! ```
//!
//! All integers are little-endian. `totalLength` counts the header itself.

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::error::{constants, ProtocolError, Result};

/// Size of the minimal header
pub const MINIMAL_HEADER_SIZE: usize = 8;

/// Size of the extended (type-name carrying) header
pub const EXTENDED_HEADER_SIZE: usize = 16;

/// Default cap on `totalLength` (16 MB)
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Header shape used by a service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HeaderLayout {
    /// `totalLength | messageTypeId`
    #[default]
    Minimal,
    /// `totalLength | messageTypeId | typeNameLength | payloadLength | typeName`
    Extended,
}

impl HeaderLayout {
    /// Number of fixed header bytes preceding the variable part
    pub const fn header_size(self) -> usize {
        match self {
            HeaderLayout::Minimal => MINIMAL_HEADER_SIZE,
            HeaderLayout::Extended => EXTENDED_HEADER_SIZE,
        }
    }
}

/// One complete message extracted from (or destined for) a byte stream.
///
/// Frames are immutable once built; the payload is a cheaply cloneable
/// [`Bytes`] handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    message_type_id: i32,
    type_name: Option<String>,
    payload: Bytes,
}

impl Frame {
    /// Create a frame without an embedded type name.
    pub fn new(message_type_id: i32, payload: impl Into<Bytes>) -> Self {
        Self {
            message_type_id,
            type_name: None,
            payload: payload.into(),
        }
    }

    /// Create a frame carrying a type name for receiver-side resolution.
    ///
    /// Only meaningful with [`HeaderLayout::Extended`].
    pub fn with_type_name(
        message_type_id: i32,
        type_name: impl Into<String>,
        payload: impl Into<Bytes>,
    ) -> Self {
        Self {
            message_type_id,
            type_name: Some(type_name.into()),
            payload: payload.into(),
        }
    }

    pub fn message_type_id(&self) -> i32 {
        self.message_type_id
    }

    pub fn type_name(&self) -> Option<&str> {
        self.type_name.as_deref()
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Total encoded size under `layout`, header included.
    pub fn total_length(&self, layout: HeaderLayout) -> usize {
        let name_len = match layout {
            HeaderLayout::Minimal => 0,
            HeaderLayout::Extended => self.type_name.as_ref().map_or(0, String::len),
        };
        layout.header_size() + name_len + self.payload.len()
    }

    /// Verify this frame can be encoded under `layout`, returning its total length.
    pub fn check(&self, layout: HeaderLayout, max_message_size: usize) -> Result<usize> {
        if layout == HeaderLayout::Minimal && self.type_name.is_some() {
            return Err(ProtocolError::Framing(
                "Type name requires the extended header layout".to_string(),
            ));
        }

        let total = self.total_length(layout);
        if total <= layout.header_size() {
            return Err(ProtocolError::Framing(constants::ERR_EMPTY_FRAME.to_string()));
        }
        if total > max_message_size || total > i32::MAX as usize {
            return Err(ProtocolError::OversizedFrame(total));
        }
        Ok(total)
    }

    /// Append the wire form of this frame to `dst`.
    ///
    /// Fails when the frame would be empty or longer than `max_message_size`,
    /// or when a type name is attached but `layout` cannot carry it.
    pub fn encode_into(
        &self,
        layout: HeaderLayout,
        max_message_size: usize,
        dst: &mut BytesMut,
    ) -> Result<()> {
        let total = self.check(layout, max_message_size)?;

        dst.reserve(total);
        dst.put_i32_le(total as i32);
        dst.put_i32_le(self.message_type_id);

        if layout == HeaderLayout::Extended {
            let name = self.type_name.as_deref().unwrap_or_default();
            dst.put_i32_le(name.len() as i32);
            dst.put_i32_le(self.payload.len() as i32);
            dst.put_slice(name.as_bytes());
        }

        dst.put_slice(&self.payload);
        Ok(())
    }

    /// Encode into a fresh buffer.
    pub fn to_bytes(&self, layout: HeaderLayout, max_message_size: usize) -> Result<Bytes> {
        let mut buf = BytesMut::with_capacity(self.total_length(layout));
        self.encode_into(layout, max_message_size, &mut buf)?;
        Ok(buf.freeze())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_wire_layout() {
        let frame = Frame::new(7, &b"abc"[..]);
        let bytes = frame
            .to_bytes(HeaderLayout::Minimal, DEFAULT_MAX_MESSAGE_SIZE)
            .unwrap();

        assert_eq!(bytes.len(), 11);
        assert_eq!(&bytes[0..4], &11i32.to_le_bytes());
        assert_eq!(&bytes[4..8], &7i32.to_le_bytes());
        assert_eq!(&bytes[8..], b"abc");
    }

    #[test]
    fn test_extended_wire_layout() {
        let frame = Frame::with_type_name(-3, "Chat", &b"hi"[..]);
        let bytes = frame
            .to_bytes(HeaderLayout::Extended, DEFAULT_MAX_MESSAGE_SIZE)
            .unwrap();

        assert_eq!(bytes.len(), 16 + 4 + 2);
        assert_eq!(&bytes[0..4], &22i32.to_le_bytes());
        assert_eq!(&bytes[4..8], &(-3i32).to_le_bytes());
        assert_eq!(&bytes[8..12], &4i32.to_le_bytes());
        assert_eq!(&bytes[12..16], &2i32.to_le_bytes());
        assert_eq!(&bytes[16..20], b"Chat");
        assert_eq!(&bytes[20..], b"hi");
    }

    #[test]
    fn test_empty_frame_rejected() {
        let frame = Frame::new(1, Bytes::new());
        assert!(matches!(
            frame.to_bytes(HeaderLayout::Minimal, DEFAULT_MAX_MESSAGE_SIZE),
            Err(ProtocolError::Framing(_))
        ));
    }

    #[test]
    fn test_oversized_frame_rejected_on_encode() {
        let frame = Frame::new(1, vec![0u8; 100]);
        assert!(matches!(
            frame.to_bytes(HeaderLayout::Minimal, 64),
            Err(ProtocolError::OversizedFrame(108))
        ));
    }

    #[test]
    fn test_type_name_needs_extended_layout() {
        let frame = Frame::with_type_name(1, "Name", &b"x"[..]);
        assert!(frame
            .to_bytes(HeaderLayout::Minimal, DEFAULT_MAX_MESSAGE_SIZE)
            .is_err());
    }
}
