//! Byte transport to the controller.
//!
//! A [`TransportSession`] is the exclusive owner of the byte stream to the
//! chip. It remembers the line rate and framing currently applied and is the
//! only place the rate is ever changed. Anything implementing [`Transport`]
//! can sit underneath it: a real UART (see [`serial`]) or an in-memory pipe
//! in tests.

pub mod serial;

use std::{
    io,
    pin::Pin,
    task::{Context, Poll},
};

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio_serial::{DataBits, FlowControl, Parity, StopBits};

use crate::error::{Error, Result};
use crate::tracing::prelude::*;

/// A bidirectional byte stream whose line rate can be changed in place.
pub trait Transport: AsyncRead + AsyncWrite + Unpin + Send {
    /// Apply a new line rate.
    fn set_baud_rate(&mut self, baud_rate: u32) -> io::Result<()>;

    /// Drop whatever the driver has buffered in either direction.
    fn discard_buffers(&mut self) -> io::Result<()>;
}

/// Character framing applied to the UART.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SerialFraming {
    pub data_bits: DataBits,
    pub parity: Parity,
    pub stop_bits: StopBits,
    pub flow_control: FlowControl,
}

impl SerialFraming {
    /// 8-N-1, optionally with RTS/CTS.
    pub fn eight_n_one(hardware_flow_control: bool) -> Self {
        Self {
            data_bits: DataBits::Eight,
            parity: Parity::None,
            stop_bits: StopBits::One,
            flow_control: if hardware_flow_control {
                FlowControl::Hardware
            } else {
                FlowControl::None
            },
        }
    }
}

impl Default for SerialFraming {
    fn default() -> Self {
        Self::eight_n_one(false)
    }
}

/// Exclusive owner of an open transport.
pub struct TransportSession<T> {
    io: T,
    baud_rate: u32,
    framing: SerialFraming,
}

impl<T: Transport> TransportSession<T> {
    /// Take ownership of an opened transport, discarding stale input.
    pub fn new(mut io: T, baud_rate: u32, framing: SerialFraming) -> Result<Self> {
        io.discard_buffers()
            .map_err(|source| Error::ConfigFailed { baud_rate, source })?;

        debug!(baud_rate, ?framing, "Transport session opened");

        Ok(Self {
            io,
            baud_rate,
            framing,
        })
    }

    /// Current line rate.
    pub fn baud_rate(&self) -> u32 {
        self.baud_rate
    }

    pub fn framing(&self) -> SerialFraming {
        self.framing
    }

    /// Switch the local side to `baud_rate`.
    ///
    /// Pending output is drained and buffered input discarded first, so no
    /// byte sent or received at the old rate is interpreted at the new one.
    pub async fn reconfigure(&mut self, baud_rate: u32) -> Result<()> {
        let config_failed = |source| Error::ConfigFailed { baud_rate, source };

        self.io.flush().await.map_err(config_failed)?;
        self.io.discard_buffers().map_err(config_failed)?;
        self.io.set_baud_rate(baud_rate).map_err(config_failed)?;

        debug!(from = self.baud_rate, to = baud_rate, "Transport reconfigured");
        self.baud_rate = baud_rate;
        Ok(())
    }

    pub fn into_inner(self) -> T {
        self.io
    }
}

impl<T: Transport> AsyncRead for TransportSession<T> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_read(cx, buf)
    }
}

impl<T: Transport> AsyncWrite for TransportSession<T> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.io).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_shutdown(cx)
    }
}
