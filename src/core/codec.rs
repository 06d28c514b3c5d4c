//! Streaming frame codec.
//!
//! [`FrameCodec`] turns an arbitrarily chunked byte stream back into the
//! sequence of frames the peer wrote. A single read may hold several frames or
//! end halfway through one; the codec keeps the unconsumed tail and the
//! already-validated length of the frame in progress until the next chunk
//! arrives.
//!
//! It can be driven two ways:
//! - directly, through [`FrameCodec::feed`] (or `extend` + `next_frame`), with
//!   the codec owning its buffer. This is what the worker pools use, since the
//!   codec travels with the connection's claim.
//! - as a `tokio_util` [`Decoder`]/[`Encoder`] pair inside `FramedRead` /
//!   `FramedWrite`, where tokio owns the buffer.
//!
//! Any length violation poisons the codec: the connection is expected to be
//! torn down, and every later call fails the same way.

use bytes::{Buf, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::{trace, warn};

use super::frame::{Frame, HeaderLayout, DEFAULT_MAX_MESSAGE_SIZE};
use crate::error::{constants, ProtocolError, Result};

/// Initial capacity of the internal buffer used by `feed`
const INITIAL_BUFFER_CAPACITY: usize = 8 * 1024;

/// Stateful per-connection encoder/decoder.
#[derive(Debug)]
pub struct FrameCodec {
    layout: HeaderLayout,
    max_message_size: usize,
    /// Bytes received through `feed`/`extend` and not yet consumed
    buffer: BytesMut,
    /// `totalLength` of the frame in progress, once its header has been validated
    pending_length: Option<usize>,
    failed: bool,
}

impl FrameCodec {
    pub fn new(layout: HeaderLayout, max_message_size: usize) -> Self {
        Self {
            layout,
            max_message_size,
            buffer: BytesMut::with_capacity(INITIAL_BUFFER_CAPACITY),
            pending_length: None,
            failed: false,
        }
    }

    pub fn layout(&self) -> HeaderLayout {
        self.layout
    }

    pub fn max_message_size(&self) -> usize {
        self.max_message_size
    }

    /// Append a chunk and return every frame it completes, in stream order.
    ///
    /// Bytes belonging to an unfinished frame are kept for the next call. On a
    /// framing violation no frames from this call are returned.
    pub fn feed(&mut self, chunk: &[u8]) -> Result<Vec<Frame>> {
        self.extend(chunk);

        let mut frames = Vec::new();
        while let Some(frame) = self.next_frame()? {
            frames.push(frame);
        }
        Ok(frames)
    }

    /// Append a chunk without extracting frames.
    pub fn extend(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    /// Extract the next complete frame from the internal buffer, if any.
    pub fn next_frame(&mut self) -> Result<Option<Frame>> {
        let mut buffer = std::mem::take(&mut self.buffer);
        let result = self.decode(&mut buffer);
        self.buffer = buffer;
        result
    }

    /// Number of buffered bytes not yet turned into a frame.
    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    /// Whether a framing violation has been seen.
    pub fn is_failed(&self) -> bool {
        self.failed
    }

    /// Drop all buffered state, including a previous failure.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.pending_length = None;
        self.failed = false;
    }

    /// Encode a frame with this codec's layout and size limit.
    pub fn encode_frame(&self, frame: &Frame) -> Result<Bytes> {
        frame.to_bytes(self.layout, self.max_message_size)
    }

    fn fail(&mut self, err: ProtocolError) -> ProtocolError {
        warn!(error = %err, "Framing violation");
        self.failed = true;
        self.pending_length = None;
        err
    }

    /// Validate the fixed header at the front of `src` and return `totalLength`.
    fn read_length(&mut self, src: &[u8]) -> Result<usize> {
        let header_size = self.layout.header_size();
        let declared = i32::from_le_bytes([src[0], src[1], src[2], src[3]]);

        if declared < 0 {
            return Err(self.fail(ProtocolError::Framing(
                constants::ERR_NEGATIVE_LENGTH.to_string(),
            )));
        }

        let total = declared as usize;
        if total <= header_size {
            return Err(self.fail(ProtocolError::Framing(format!(
                "{} ({total} <= {header_size})",
                constants::ERR_LENGTH_TOO_SMALL
            ))));
        }
        if total > self.max_message_size {
            return Err(self.fail(ProtocolError::OversizedFrame(total)));
        }

        Ok(total)
    }

    /// Split one complete frame of `total` bytes off the front of `src`.
    fn take_frame(&mut self, src: &mut BytesMut, total: usize) -> Result<Frame> {
        let mut raw = src.split_to(total);
        raw.advance(4);
        let message_type_id = raw.get_i32_le();

        match self.layout {
            HeaderLayout::Minimal => Ok(Frame::new(message_type_id, raw.freeze())),
            HeaderLayout::Extended => {
                let name_len = raw.get_i32_le();
                let payload_len = raw.get_i32_le();

                if name_len < 0 || payload_len < 0 {
                    return Err(self.fail(ProtocolError::Framing(
                        constants::ERR_NEGATIVE_LENGTH.to_string(),
                    )));
                }
                if name_len as usize + payload_len as usize != raw.len() {
                    return Err(self.fail(ProtocolError::Framing(format!(
                        "{}: name {name_len} + payload {payload_len} != body {}",
                        constants::ERR_LENGTH_MISMATCH,
                        raw.len()
                    ))));
                }

                let name = raw.split_to(name_len as usize);
                let type_name = match String::from_utf8(name.to_vec()) {
                    Ok(name) => name,
                    Err(_) => {
                        return Err(self.fail(ProtocolError::Framing(
                            constants::ERR_TYPE_NAME_UTF8.to_string(),
                        )))
                    }
                };

                Ok(Frame::with_type_name(message_type_id, type_name, raw.freeze()))
            }
        }
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(HeaderLayout::Minimal, DEFAULT_MAX_MESSAGE_SIZE)
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>> {
        if self.failed {
            return Err(ProtocolError::Framing(
                constants::ERR_DECODER_FAILED.to_string(),
            ));
        }

        let total = match self.pending_length {
            Some(total) => total,
            None => {
                if src.len() < self.layout.header_size() {
                    return Ok(None);
                }
                let total = self.read_length(src)?;
                self.pending_length = Some(total);
                total
            }
        };

        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        self.pending_length = None;
        let frame = self.take_frame(src, total)?;
        trace!(
            message_type_id = frame.message_type_id(),
            total,
            "Frame decoded"
        );
        Ok(Some(frame))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<()> {
        frame.encode_into(self.layout, self.max_message_size, dst)
    }
}

impl Encoder<&Frame> for FrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, frame: &Frame, dst: &mut BytesMut) -> Result<()> {
        frame.encode_into(self.layout, self.max_message_size, dst)
    }
}
