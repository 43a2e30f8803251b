//! Frame encoding and decoding for the three-wire UART link.
//!
//! ```text
//! [0xc0] [link] [type] [len_lo] [len_hi] [payload...] [checksum] [0xc0]
//!
//! link:  bits 0-2 ack, bits 3-5 seq
//! type:  bits 0-3 packet type
//! ```
//!
//! The checksum is the XOR of the four header bytes and every payload byte.
//! There is no escaping: the decoder is driven by the declared length, so a
//! `0xc0` inside the payload does not end the frame here, but the chip side
//! may see it differently.
//!
//! Note that seq shares the first byte with ack. Other H5 stacks put seq in
//! the second byte next to the packet type; this link does not, and both
//! ends here must agree on the first-byte layout.

use bitvec::prelude::*;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::io;
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

use super::checksum::frame_checksum;
use super::{DELIMITER, HEADER_LEN, MAX_PAYLOAD, SEQ_MASK};
use crate::error::{Error, Result};
use crate::tracing::{prelude::*, HexBytes};

/// Packet type carried in the low nibble of the second header byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketType {
    Command,
    AclData,
    ScoData,
    Event,
    Vendor,
    Other(u8),
}

impl From<u8> for PacketType {
    fn from(value: u8) -> Self {
        match value & 0x0f {
            0x01 => Self::Command,
            0x02 => Self::AclData,
            0x03 => Self::ScoData,
            0x04 => Self::Event,
            0x0e => Self::Vendor,
            other => Self::Other(other),
        }
    }
}

impl From<PacketType> for u8 {
    fn from(packet_type: PacketType) -> Self {
        match packet_type {
            PacketType::Command => 0x01,
            PacketType::AclData => 0x02,
            PacketType::ScoData => 0x03,
            PacketType::Event => 0x04,
            PacketType::Vendor => 0x0e,
            PacketType::Other(value) => value & 0x0f,
        }
    }
}

/// One delimited message on the link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    ack: u8,
    seq: u8,
    packet_type: PacketType,
    payload: Bytes,
    checksum: u8,
}

impl Frame {
    /// Build an outgoing frame. `ack` and `seq` are taken modulo 8.
    pub fn new(ack: u8, seq: u8, packet_type: PacketType, payload: Bytes) -> Result<Self> {
        if payload.len() > MAX_PAYLOAD {
            return Err(Error::PayloadTooLarge {
                len: payload.len(),
                max: MAX_PAYLOAD,
            });
        }

        let mut frame = Self {
            ack: ack & SEQ_MASK,
            seq: seq & SEQ_MASK,
            packet_type,
            payload,
            checksum: 0,
        };
        frame.checksum = frame_checksum(&frame.header(), &frame.payload);
        Ok(frame)
    }

    /// Rebuild a frame from received parts, keeping the checksum as sent.
    fn from_wire(header: [u8; HEADER_LEN], payload: Bytes, checksum: u8) -> Self {
        let link = header[0].view_bits::<Lsb0>();
        Self {
            ack: link[0..3].load::<u8>(),
            seq: link[3..6].load::<u8>(),
            packet_type: PacketType::from(header[1]),
            payload,
            checksum,
        }
    }

    pub fn ack(&self) -> u8 {
        self.ack
    }

    pub fn seq(&self) -> u8 {
        self.seq
    }

    pub fn packet_type(&self) -> PacketType {
        self.packet_type
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn checksum(&self) -> u8 {
        self.checksum
    }

    /// Whether the carried checksum matches the header and payload.
    pub fn checksum_valid(&self) -> bool {
        self.checksum == frame_checksum(&self.header(), &self.payload)
    }

    fn header(&self) -> [u8; HEADER_LEN] {
        let mut link = 0u8;
        let bits = link.view_bits_mut::<Lsb0>();
        bits[0..3].store(self.ack);
        bits[3..6].store(self.seq);

        let [len_lo, len_hi] = (self.payload.len() as u16).to_le_bytes();
        [link, self.packet_type.into(), len_lo, len_hi]
    }
}

/// Why a received frame was thrown away.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FramingError {
    #[error("expected end delimiter, found 0x{found:02x}")]
    MissingEndDelimiter { found: u8 },

    #[error("declared payload length {declared} exceeds {max}")]
    PayloadTooLong { declared: usize, max: usize },

    #[error("frame with bad checksum carries out-of-order seq {seq}")]
    CorruptSequence { seq: u8 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScanState {
    WaitStart,
    ReadHeader,
    ReadPayload,
    ReadChecksum,
    WaitEnd,
}

/// Tokio codec for link frames.
///
/// Decoding is a byte-at-a-time scanner whose state survives between calls,
/// so a frame may arrive split across any number of reads.
#[derive(Debug)]
pub struct FrameCodec {
    state: ScanState,
    header: [u8; HEADER_LEN],
    header_filled: usize,
    declared_len: usize,
    payload: BytesMut,
    checksum: u8,
}

impl FrameCodec {
    pub fn new() -> Self {
        Self {
            state: ScanState::WaitStart,
            header: [0; HEADER_LEN],
            header_filled: 0,
            declared_len: 0,
            payload: BytesMut::with_capacity(MAX_PAYLOAD),
            checksum: 0,
        }
    }

    /// Whether a frame has been started but not yet completed.
    pub fn in_frame(&self) -> bool {
        self.state != ScanState::WaitStart
    }

    /// Drop any partially scanned frame and wait for the next start delimiter.
    pub fn reset(&mut self) {
        self.state = ScanState::WaitStart;
        self.header_filled = 0;
        self.declared_len = 0;
        self.payload.clear();
        self.checksum = 0;
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = io::Error;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> std::result::Result<(), Self::Error> {
        let start = dst.len();
        dst.reserve(HEADER_LEN + frame.payload.len() + 3);

        dst.put_u8(DELIMITER);
        dst.put_slice(&frame.header());
        dst.put_slice(&frame.payload);
        dst.put_u8(frame.checksum);
        dst.put_u8(DELIMITER);

        trace!(
            seq = frame.seq,
            ack = frame.ack,
            packet_type = ?frame.packet_type,
            bytes = dst.len() - start,
            frame = %HexBytes(&dst[start..]),
            "TX H5"
        );

        Ok(())
    }
}

impl Decoder for FrameCodec {
    type Item = std::result::Result<Frame, FramingError>;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> std::result::Result<Option<Self::Item>, Self::Error> {
        // Malformed frames are yielded as items rather than errors: an error would terminate
        // the stream, and the link must keep scanning after a bad frame.
        while src.has_remaining() {
            let byte = src.get_u8();

            match self.state {
                ScanState::WaitStart => {
                    if byte == DELIMITER {
                        self.reset();
                        self.state = ScanState::ReadHeader;
                    }
                }
                ScanState::ReadHeader => {
                    self.header[self.header_filled] = byte;
                    self.header_filled += 1;

                    if self.header_filled == HEADER_LEN {
                        let declared = u16::from_le_bytes([self.header[2], self.header[3]]) as usize;
                        if declared > MAX_PAYLOAD {
                            self.reset();
                            return Ok(Some(Err(FramingError::PayloadTooLong {
                                declared,
                                max: MAX_PAYLOAD,
                            })));
                        }

                        self.declared_len = declared;
                        self.state = if declared == 0 {
                            ScanState::ReadChecksum
                        } else {
                            ScanState::ReadPayload
                        };
                    }
                }
                ScanState::ReadPayload => {
                    self.payload.put_u8(byte);
                    if self.payload.len() == self.declared_len {
                        self.state = ScanState::ReadChecksum;
                    }
                }
                ScanState::ReadChecksum => {
                    self.checksum = byte;
                    self.state = ScanState::WaitEnd;
                }
                ScanState::WaitEnd => {
                    let header = self.header;
                    let payload = self.payload.split().freeze();
                    let checksum = self.checksum;
                    self.reset();

                    if byte != DELIMITER {
                        trace!(found = byte, "RX H5 frame discarded, no end delimiter");
                        return Ok(Some(Err(FramingError::MissingEndDelimiter { found: byte })));
                    }

                    let frame = Frame::from_wire(header, payload, checksum);
                    trace!(
                        seq = frame.seq,
                        ack = frame.ack,
                        packet_type = ?frame.packet_type,
                        checksum_valid = frame.checksum_valid(),
                        payload = %HexBytes(&frame.payload),
                        "RX H5"
                    );
                    return Ok(Some(Ok(frame)));
                }
            }
        }

        Ok(None)
    }
}
