//! Line rate negotiation.

use std::time::Duration;

use tokio::time;

use crate::error::{Error, Result};
use crate::hci::{Hci, Opcode};
use crate::tracing::prelude::*;
use crate::transport::Transport;

/// Ask the chip to move to `baud_rate`, then follow it.
///
/// The chip changes its rate after answering, so the local side waits
/// `settle` before reconfiguring. On failure the two ends may disagree on
/// the rate; the link is then unusable and must not be retried in place.
pub async fn switch_baud<T: Transport>(
    hci: &mut Hci<T>,
    baud_rate: u32,
    settle: Duration,
) -> Result<()> {
    let failed = |source| Error::BaudSwitchFailed {
        baud_rate,
        source: Box::new(source),
    };

    let from = hci.baud_rate();
    debug!(from, to = baud_rate, "Requesting baud change");

    hci.command(Opcode::VendorBaudRate as u16, &baud_rate.to_le_bytes())
        .await
        .map_err(failed)?;

    time::sleep(settle).await;
    hci.reconfigure(baud_rate).await.map_err(failed)?;

    info!(from, to = baud_rate, "Baud rate switched");
    Ok(())
}
