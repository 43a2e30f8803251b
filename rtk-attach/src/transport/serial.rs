//! UART transport backed by `tokio-serial`.

use std::io;

use tokio_serial::{ClearBuffer, SerialPort, SerialPortBuilderExt, SerialStream};

use super::{SerialFraming, Transport, TransportSession};
use crate::error::{Error, Result};
use crate::tracing::prelude::*;

impl Transport for SerialStream {
    fn set_baud_rate(&mut self, baud_rate: u32) -> io::Result<()> {
        SerialPort::set_baud_rate(self, baud_rate).map_err(io::Error::from)
    }

    fn discard_buffers(&mut self) -> io::Result<()> {
        self.clear(ClearBuffer::All).map_err(io::Error::from)
    }
}

/// Open the UART at `path` in raw mode with the given rate and framing.
pub fn open(
    path: &str,
    baud_rate: u32,
    framing: SerialFraming,
) -> Result<TransportSession<SerialStream>> {
    let stream = tokio_serial::new(path, baud_rate)
        .data_bits(framing.data_bits)
        .parity(framing.parity)
        .stop_bits(framing.stop_bits)
        .flow_control(framing.flow_control)
        .open_native_async()
        .map_err(|e| Error::DeviceUnavailable {
            path: path.to_string(),
            source: e.into(),
        })?;

    info!(path, baud_rate, "Opened UART");
    TransportSession::new(stream, baud_rate, framing)
}
