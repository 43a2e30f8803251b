//! Three-wire UART framing.
//!
//! This module provides frame encoding/decoding and the link that tracks
//! sequence and acknowledgment numbers for one open transport.

pub mod checksum;
pub mod codec;
pub mod link;

pub use codec::{Frame, FrameCodec, FramingError, PacketType};
pub use link::{H5Link, LinkCounters};

/// Start and end delimiter of every frame.
pub const DELIMITER: u8 = 0xc0;

/// Bytes between the start delimiter and the payload.
pub const HEADER_LEN: usize = 4;

/// Largest payload a frame may carry.
pub const MAX_PAYLOAD: usize = 508;

/// Sequence and acknowledgment numbers are 3 bits wide.
pub const SEQ_MASK: u8 = 0x07;
