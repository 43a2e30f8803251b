//! HCI commands and events carried over the H5 link.
//!
//! Every command is answered by a command-complete event. Commands are
//! strictly one at a time: [`Hci::command`] sends and then waits, and nothing
//! else touches the link in between.

use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use strum::FromRepr;

use crate::error::{Error, Result};
use crate::h5::{Frame, H5Link, LinkCounters, PacketType};
use crate::tracing::{prelude::*, HexBytes};
use crate::transport::{Transport, TransportSession};

/// Command-complete event code.
pub const EVT_COMMAND_COMPLETE: u8 = 0x0e;

/// Largest parameter block one command can carry.
pub const MAX_PARAMS_LEN: usize = u8::MAX as usize;

/// Length of the code and parameter-length bytes in front of event parameters.
const EVENT_PREFIX_LEN: usize = 2;

#[derive(FromRepr, Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u16)]
pub enum Opcode {
    Reset = 0x0c03,
    ReadLocalVersion = 0x1001,
    VendorDownloadMode = 0xfc01,
    VendorBaudRate = 0xfc17,
    VendorScoRouting = 0xfc1b,
    VendorPatchDownload = 0xfc20,
    VendorConfigWrite = 0xfc61,
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Opcode::Reset => "Reset",
            Opcode::ReadLocalVersion => "Read Local Version",
            Opcode::VendorDownloadMode => "Vendor Download Mode",
            Opcode::VendorBaudRate => "Vendor Baud Rate",
            Opcode::VendorScoRouting => "Vendor SCO Routing",
            Opcode::VendorPatchDownload => "Vendor Patch Download",
            Opcode::VendorConfigWrite => "Vendor Config Write",
        };
        write!(f, "{name}")
    }
}

/// Human-readable name of `opcode`, or its hex value.
pub fn opcode_name(opcode: u16) -> String {
    match Opcode::from_repr(opcode) {
        Some(known) => known.to_string(),
        None => format!("0x{opcode:04x}"),
    }
}

/// An HCI command packet: `[opcode_lo, opcode_hi, param_len, params...]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandPacket {
    pub opcode: u16,
    pub params: Bytes,
}

impl CommandPacket {
    pub fn new(opcode: u16, params: &[u8]) -> Result<Self> {
        if params.len() > MAX_PARAMS_LEN {
            return Err(Error::PayloadTooLarge {
                len: params.len(),
                max: MAX_PARAMS_LEN,
            });
        }
        Ok(Self {
            opcode,
            params: Bytes::copy_from_slice(params),
        })
    }

    /// Parse a command frame payload. A parameter block shorter than
    /// declared yields `None`.
    pub fn parse(payload: &[u8]) -> Option<Self> {
        let mut buf = payload;
        if buf.remaining() < 3 {
            return None;
        }
        let opcode = buf.get_u16_le();
        let len = buf.get_u8() as usize;
        if buf.remaining() < len {
            return None;
        }
        Some(Self {
            opcode,
            params: Bytes::copy_from_slice(&buf[..len]),
        })
    }

    pub fn encode(&self) -> Bytes {
        let mut payload = BytesMut::with_capacity(3 + self.params.len());
        payload.put_u16_le(self.opcode);
        payload.put_u8(self.params.len() as u8);
        payload.put_slice(&self.params);
        payload.freeze()
    }
}

/// A decoded command-complete event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandComplete {
    pub num_packets: u8,
    pub opcode: u16,
    pub status: u8,
    pub return_params: Bytes,
    /// Whether the frame carrying the event passed checksum validation.
    pub checksum_valid: bool,
}

impl CommandComplete {
    /// Decode an event frame payload, including its code and length prefix.
    pub fn parse(payload: &Bytes, checksum_valid: bool) -> Option<Self> {
        if payload.len() < EVENT_PREFIX_LEN + 4 || payload[0] != EVT_COMMAND_COMPLETE {
            return None;
        }

        let mut params = payload.slice(EVENT_PREFIX_LEN..);
        let num_packets = params.get_u8();
        let opcode = params.get_u16_le();
        let status = params.get_u8();

        Some(Self {
            num_packets,
            opcode,
            status,
            return_params: params,
            checksum_valid,
        })
    }

    fn from_frame(frame: &Frame) -> Option<Self> {
        if frame.packet_type() != PacketType::Event {
            return None;
        }
        Self::parse(frame.payload(), frame.checksum_valid())
    }
}

/// Controller identification returned by Read Local Version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalVersion {
    pub hci_version: u8,
    pub hci_revision: u16,
    pub lmp_version: u8,
    pub manufacturer: u16,
    pub lmp_subversion: u16,
}

impl LocalVersion {
    const LEN: usize = 8;

    fn parse(mut params: &[u8]) -> Option<Self> {
        if params.len() < Self::LEN {
            return None;
        }
        Some(Self {
            hci_version: params.get_u8(),
            hci_revision: params.get_u16_le(),
            lmp_version: params.get_u8(),
            manufacturer: params.get_u16_le(),
            lmp_subversion: params.get_u16_le(),
        })
    }
}

/// Command/event exchange on top of an [`H5Link`].
pub struct Hci<T> {
    link: H5Link<T>,
    max_attempts: usize,
}

impl<T: Transport> Hci<T> {
    /// `max_attempts` bounds how many frames (or failed frame reads) one
    /// wait may consume.
    pub fn new(link: H5Link<T>, max_attempts: usize) -> Self {
        Self { link, max_attempts }
    }

    pub fn baud_rate(&self) -> u32 {
        self.link.baud_rate()
    }

    pub fn counters(&self) -> LinkCounters {
        self.link.counters()
    }

    pub async fn reconfigure(&mut self, baud_rate: u32) -> Result<()> {
        self.link.reconfigure(baud_rate).await
    }

    pub fn into_session(self) -> TransportSession<T> {
        self.link.into_session()
    }

    /// Send one command without waiting for its completion.
    pub async fn send_command(&mut self, opcode: u16, params: &[u8]) -> Result<()> {
        let packet = CommandPacket::new(opcode, params)?;

        trace!(
            opcode = %opcode_name(opcode),
            params = %HexBytes(params),
            "Sending HCI command"
        );

        self.link.send(PacketType::Command, packet.encode()).await
    }

    /// Wait for an event with code `event_code`.
    ///
    /// Returns the event parameters (without the code and length bytes)
    /// truncated to `max_len`.
    pub async fn wait_for_event(&mut self, event_code: u8, max_len: usize) -> Result<Bytes> {
        let frame = self
            .next_matching(event_code, |frame| {
                frame.packet_type() == PacketType::Event
                    && frame.payload().first() == Some(&event_code)
            })
            .await?;

        let payload = frame.payload();
        let start = EVENT_PREFIX_LEN.min(payload.len());
        let end = payload.len().min(start + max_len);
        Ok(payload.slice(start..end))
    }

    /// Send a command and wait for the command-complete event that answers it.
    pub async fn command(&mut self, opcode: u16, params: &[u8]) -> Result<CommandComplete> {
        self.send_command(opcode, params).await?;

        let frame = self
            .next_matching(EVT_COMMAND_COMPLETE, |frame| {
                CommandComplete::from_frame(frame).is_some_and(|cc| cc.opcode == opcode)
            })
            .await?;

        let complete = CommandComplete::from_frame(&frame).ok_or(Error::NoResponse {
            event_code: EVT_COMMAND_COMPLETE,
            attempts: self.max_attempts,
        })?;

        if complete.status != 0 {
            warn!(
                opcode = %opcode_name(opcode),
                status = complete.status,
                "Command completed with non-zero status"
            );
        }

        Ok(complete)
    }

    pub async fn reset(&mut self) -> Result<()> {
        self.command(Opcode::Reset as u16, &[]).await?;
        Ok(())
    }

    /// Read Local Version. The event must pass checksum validation.
    pub async fn read_local_version(&mut self) -> Result<LocalVersion> {
        let opcode = Opcode::ReadLocalVersion as u16;
        let complete = self.command(opcode, &[]).await?;

        if !complete.checksum_valid {
            return Err(Error::ChecksumMismatch { opcode });
        }

        let version =
            LocalVersion::parse(&complete.return_params).ok_or(Error::MalformedEvent {
                opcode,
                len: EVENT_PREFIX_LEN + 4 + complete.return_params.len(),
            })?;

        debug!(
            hci_version = version.hci_version,
            hci_revision = version.hci_revision,
            lmp_version = version.lmp_version,
            manufacturer = version.manufacturer,
            lmp_subversion = %format!("0x{:04x}", version.lmp_subversion),
            "Local version"
        );

        Ok(version)
    }

    /// Read frames until one satisfies `matches`.
    ///
    /// Each frame read, and each timed-out or malformed read, uses up one
    /// attempt. Errors that desynchronize the link end the wait at once.
    async fn next_matching<F>(&mut self, event_code: u8, mut matches: F) -> Result<Frame>
    where
        F: FnMut(&Frame) -> bool,
    {
        for attempt in 1..=self.max_attempts {
            match self.link.recv().await {
                Ok(frame) if matches(&frame) => return Ok(frame),
                Ok(frame) => {
                    trace!(
                        attempt,
                        seq = frame.seq(),
                        packet_type = ?frame.packet_type(),
                        "Skipping unrelated frame"
                    );
                }
                Err(e) if e.is_retryable() => {
                    debug!(attempt, error = %e, "No event this attempt");
                }
                Err(e) => return Err(e),
            }
        }

        Err(Error::NoResponse {
            event_code,
            attempts: self.max_attempts,
        })
    }
}
