//! Datagram transport.
//!
//! Each datagram carries one or more whole frames. Encoded frames larger than
//! the configured datagram size are refused on send rather than fragmented.
//! On receive, a datagram ending in a partial frame is a framing error for
//! that datagram only; the socket keeps working.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::UdpSocket;
use tracing::{debug, instrument, trace};

use crate::config::{FramingConfig, MAX_UDP_PAYLOAD};
use crate::core::{Frame, FrameCodec, HeaderLayout};
use crate::error::{constants, ProtocolError, Result};
use crate::utils::Metrics;

/// Bound UDP socket speaking the frame format.
#[derive(Debug)]
pub struct DatagramEndpoint {
    socket: UdpSocket,
    local_addr: SocketAddr,
    layout: HeaderLayout,
    max_message_size: usize,
    max_datagram_size: usize,
    metrics: Arc<Metrics>,
}

impl DatagramEndpoint {
    #[instrument(skip(framing, metrics))]
    pub async fn bind(
        addr: SocketAddr,
        framing: &FramingConfig,
        max_datagram_size: usize,
        metrics: Arc<Metrics>,
    ) -> Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        let local_addr = socket.local_addr()?;
        debug!(address = %local_addr, "Datagram endpoint bound");

        Ok(Self {
            socket,
            local_addr,
            layout: framing.layout,
            max_message_size: framing.max_message_size,
            max_datagram_size: max_datagram_size.min(MAX_UDP_PAYLOAD),
            metrics,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn max_datagram_size(&self) -> usize {
        self.max_datagram_size
    }

    /// Send one frame as one datagram.
    pub async fn send_to(&self, frame: &Frame, target: SocketAddr) -> Result<()> {
        let bytes = frame.to_bytes(self.layout, self.max_message_size)?;
        if bytes.len() > self.max_datagram_size {
            return Err(ProtocolError::DatagramTooLarge {
                size: bytes.len(),
                max: self.max_datagram_size,
            });
        }

        let sent = self.socket.send_to(&bytes, target).await?;
        if sent != bytes.len() {
            return Err(ProtocolError::Transport(format!(
                "Short datagram write: {sent} of {} bytes",
                bytes.len()
            )));
        }
        trace!(peer = %target, bytes = sent, "Datagram sent");
        self.metrics.frame_sent(sent as u64);
        Ok(())
    }

    /// Receive one datagram and decode every frame in it.
    pub async fn recv_from(&self) -> Result<(Vec<Frame>, SocketAddr)> {
        // One byte of headroom so oversized datagrams are detected rather than truncated
        let mut buf = vec![0u8; self.max_datagram_size + 1];
        let (len, peer) = self.socket.recv_from(&mut buf).await?;
        self.metrics.bytes_read(len as u64);

        if len > self.max_datagram_size {
            return Err(ProtocolError::DatagramTooLarge {
                size: len,
                max: self.max_datagram_size,
            });
        }

        let frames = decode_datagram(&buf[..len], self.layout, self.max_message_size)?;
        for _ in &frames {
            self.metrics.frame_received();
        }
        trace!(peer = %peer, frames = frames.len(), "Datagram received");
        Ok((frames, peer))
    }
}

/// Decode a complete datagram. Leftover bytes are an error.
pub fn decode_datagram(
    datagram: &[u8],
    layout: HeaderLayout,
    max_message_size: usize,
) -> Result<Vec<Frame>> {
    let mut codec = FrameCodec::new(layout, max_message_size);
    let frames = codec.feed(datagram)?;
    if codec.buffered_len() > 0 {
        return Err(ProtocolError::Framing(
            constants::ERR_TRAILING_DATAGRAM_BYTES.to_string(),
        ));
    }
    Ok(frames)
}
