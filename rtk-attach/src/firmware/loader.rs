//! Firmware download sequence.
//!
//! 1. Enter download mode.
//! 2. Send every patch fragment, in order, each acknowledged before the next.
//! 3. Write the config blob, if there is one.
//! 4. Leave download mode, which starts the patch.
//!
//! Any step without its command-complete aborts the whole load. There is no
//! resuming from a fragment; the caller starts over from a reset.

use super::{ConfigBlob, FirmwareImage, LoadStep, Progress};
use crate::error::{Error, Result};
use crate::hci::{Hci, Opcode};
use crate::tracing::prelude::*;
use crate::transport::Transport;

const ENTER_DOWNLOAD: [u8; 1] = [0x01];
const LAUNCH: [u8; 1] = [0x00];

fn failed(step: LoadStep) -> impl FnOnce(Error) -> Error {
    move |source| Error::FirmwareLoadFailed {
        step,
        source: Box::new(source),
    }
}

/// Download `image` (and `config`, if any) into the chip.
///
/// `progress` is called after each acknowledged fragment.
pub async fn load<T: Transport>(
    hci: &mut Hci<T>,
    image: &FirmwareImage,
    config: Option<&ConfigBlob>,
    progress: &mut dyn FnMut(Progress),
) -> Result<()> {
    let total = image.patch().len();
    info!(
        version = image.version(),
        patch_count = image.patch_count(),
        bytes = total,
        config = config.map_or(0, ConfigBlob::len),
        "Starting firmware download"
    );

    hci.command(Opcode::VendorDownloadMode as u16, &ENTER_DOWNLOAD)
        .await
        .map_err(failed(LoadStep::EnterDownload))?;

    let mut sent = 0;
    for fragment in image.fragments() {
        let step = LoadStep::Patch {
            offset: fragment.offset,
        };
        hci.command(Opcode::VendorPatchDownload as u16, &fragment.params())
            .await
            .map_err(failed(step))?;

        sent += fragment.bytes.len();
        let report = Progress { sent, total };
        debug!(
            offset = fragment.offset,
            len = fragment.bytes.len(),
            percent = report.percent(),
            "Patch fragment acknowledged"
        );
        progress(report);
    }

    if let Some(config) = config.filter(|c| !c.is_empty()) {
        hci.command(Opcode::VendorConfigWrite as u16, &config.params())
            .await
            .map_err(failed(LoadStep::Config))?;
        debug!(len = config.len(), "Config blob written");
    }

    hci.command(Opcode::VendorDownloadMode as u16, &LAUNCH)
        .await
        .map_err(failed(LoadStep::Launch))?;

    info!("Firmware download complete");
    Ok(())
}
