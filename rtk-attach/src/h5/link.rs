//! Sequenced frame exchange over one transport session.

use std::time::Duration;

use bytes::Bytes;
use futures::SinkExt;
use tokio::time;
use tokio_stream::StreamExt;
use tokio_util::codec::Framed;

use super::{Frame, FrameCodec, FramingError, PacketType, SEQ_MASK};
use crate::error::{Error, Result};
use crate::tracing::prelude::*;
use crate::transport::{Transport, TransportSession};

/// Sequence and acknowledgment state of the link.
///
/// Each counter is 3 bits wide and wraps modulo 8.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LinkCounters {
    /// Sequence number of the next frame we send
    pub tx_seq: u8,
    /// Acknowledgment carried by the next frame we send
    pub tx_ack: u8,
    /// Sequence number of the last frame received
    pub rx_seq: u8,
    /// Acknowledgment carried by the last frame received
    pub rx_ack: u8,
    rx_synced: bool,
}

impl LinkCounters {
    fn on_sent(&mut self) {
        self.tx_seq = (self.tx_seq + 1) & SEQ_MASK;
    }

    /// Whether `frame` carries the seq we expect next. The first frame from
    /// the peer establishes its numbering.
    fn in_sequence(&self, frame: &Frame) -> bool {
        !self.rx_synced || frame.seq() == (self.rx_seq + 1) & SEQ_MASK
    }

    fn on_received(&mut self, frame: &Frame) -> Result<()> {
        if !self.in_sequence(frame) {
            return Err(Error::SequenceMismatch {
                expected: (self.rx_seq + 1) & SEQ_MASK,
                received: frame.seq(),
            });
        }

        self.rx_seq = frame.seq();
        self.rx_ack = frame.ack();
        self.tx_ack = (frame.seq() + 1) & SEQ_MASK;
        self.rx_synced = true;
        Ok(())
    }
}

/// A transport session with framing and sequence tracking on top.
pub struct H5Link<T> {
    framed: Framed<TransportSession<T>, FrameCodec>,
    counters: LinkCounters,
    frame_timeout: Duration,
}

impl<T: Transport> H5Link<T> {
    /// Wrap `session`. Receiving one frame may take at most `frame_timeout`.
    pub fn new(session: TransportSession<T>, frame_timeout: Duration) -> Self {
        Self {
            framed: Framed::new(session, FrameCodec::new()),
            counters: LinkCounters::default(),
            frame_timeout,
        }
    }

    pub fn counters(&self) -> LinkCounters {
        self.counters
    }

    pub fn baud_rate(&self) -> u32 {
        self.framed.get_ref().baud_rate()
    }

    /// Send one frame and advance `tx_seq`.
    pub async fn send(&mut self, packet_type: PacketType, payload: Bytes) -> Result<()> {
        let frame = Frame::new(
            self.counters.tx_ack,
            self.counters.tx_seq,
            packet_type,
            payload,
        )?;

        self.framed.send(frame).await.map_err(Error::WriteFailed)?;
        self.counters.on_sent();
        Ok(())
    }

    /// Receive the next frame.
    ///
    /// Fails with [`Error::Timeout`] if no complete frame arrives within the
    /// frame timeout, and with [`Error::Framing`] if one arrives malformed.
    /// A checksum mismatch is not an error here; see [`Frame::checksum_valid`].
    /// A frame that fails its checksum and is also out of sequence is
    /// discarded as malformed rather than treated as a desync.
    pub async fn recv(&mut self) -> Result<Frame> {
        let next = time::timeout(self.frame_timeout, self.framed.next())
            .await
            .map_err(|_| Error::Timeout(self.frame_timeout))?;

        let frame = match next {
            Some(Ok(Ok(frame))) => frame,
            Some(Ok(Err(malformed))) => {
                debug!(error = %malformed, "Discarded malformed frame");
                return Err(malformed.into());
            }
            Some(Err(e)) => return Err(Error::ReadFailed(e)),
            None => return Err(Error::Disconnected),
        };

        if !frame.checksum_valid() {
            debug!(
                seq = frame.seq(),
                checksum = frame.checksum(),
                "Received frame with checksum mismatch"
            );
            // A damaged header says nothing about the peer's numbering
            if !self.counters.in_sequence(&frame) {
                return Err(FramingError::CorruptSequence { seq: frame.seq() }.into());
            }
        }

        self.counters.on_received(&frame)?;
        Ok(frame)
    }

    /// Change the local line rate.
    ///
    /// Anything queued for output is flushed at the old rate first; anything
    /// received but not yet decoded is dropped.
    pub async fn reconfigure(&mut self, baud_rate: u32) -> Result<()> {
        SinkExt::<Frame>::flush(&mut self.framed)
            .await
            .map_err(|source| Error::ConfigFailed { baud_rate, source })?;

        self.framed.get_mut().reconfigure(baud_rate).await?;
        self.framed.read_buffer_mut().clear();
        self.framed.codec_mut().reset();
        Ok(())
    }

    /// Give back the session, e.g. to keep the UART held open.
    pub fn into_session(self) -> TransportSession<T> {
        self.framed.into_inner()
    }
}
