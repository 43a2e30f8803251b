//! Attach orchestration.
//!
//! Takes a freshly powered controller from its boot rate to a patched chip
//! running at the target rate:
//!
//! ```text
//! Uninitialized -> LinkUp -> VersionKnown -> FirmwareLoaded -> BaudSwitched -> Ready
//!                     \            \               \                \
//!                      `------------`---------------`----------------`--> Failed
//! ```
//!
//! Only the SCO routing step may fail without failing the attach.

use std::fmt;

use tokio::time;
use tokio_serial::SerialStream;

use crate::baud::switch_baud;
use crate::config::AttachConfig;
use crate::error::{Error, Result};
use crate::firmware::{self, ConfigBlob, FirmwareImage, Progress};
use crate::h5::H5Link;
use crate::hci::{Hci, LocalVersion, Opcode};
use crate::tracing::prelude::*;
use crate::transport::{serial, Transport, TransportSession};

/// Parameters of the SCO routing command: route SCO over HCI.
const SCO_OVER_HCI: [u8; 2] = [0x00, 0x00];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachState {
    Uninitialized,
    LinkUp,
    VersionKnown,
    FirmwareLoaded,
    BaudSwitched,
    Ready,
    Failed,
}

impl fmt::Display for AttachState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AttachState::Uninitialized => "uninitialized",
            AttachState::LinkUp => "link-up",
            AttachState::VersionKnown => "version-known",
            AttachState::FirmwareLoaded => "firmware-loaded",
            AttachState::BaudSwitched => "baud-switched",
            AttachState::Ready => "ready",
            AttachState::Failed => "failed",
        };
        write!(f, "{name}")
    }
}

/// What a successful attach did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachReport {
    /// Subversion the chip reported before anything was loaded
    pub initial_subversion: u16,
    /// Subversion after loading, if it could be read
    pub final_subversion: Option<u16>,
    pub firmware_loaded: bool,
    pub baud_rate: u32,
    pub sco_routed: bool,
}

/// A ready controller. Dropping it closes the UART.
pub struct Attached<T> {
    pub hci: Hci<T>,
    pub report: AttachReport,
}

impl<T: Transport> Attached<T> {
    pub fn into_session(self) -> TransportSession<T> {
        self.hci.into_session()
    }
}

/// Runs one attach sequence and tracks where it got to.
pub struct Attacher {
    config: AttachConfig,
    state: AttachState,
}

impl Attacher {
    pub fn new(config: AttachConfig) -> Self {
        Self {
            config,
            state: AttachState::Uninitialized,
        }
    }

    pub fn state(&self) -> AttachState {
        self.state
    }

    pub fn config(&self) -> &AttachConfig {
        &self.config
    }

    /// Open the configured UART and attach the chip behind it.
    pub async fn run(&mut self) -> Result<Attached<SerialStream>> {
        let session = serial::open(
            &self.config.device,
            self.config.initial_baud,
            self.config.framing(),
        );

        match session {
            Ok(session) => self.attach(session).await,
            Err(e) => {
                self.fail(&e);
                Err(e)
            }
        }
    }

    /// Attach the chip behind an already open session.
    pub async fn attach<T: Transport>(
        &mut self,
        session: TransportSession<T>,
    ) -> Result<Attached<T>> {
        self.transition(AttachState::LinkUp);

        match self.bring_up(session).await {
            Ok(attached) => Ok(attached),
            Err(e) => {
                self.fail(&e);
                Err(e)
            }
        }
    }

    async fn bring_up<T: Transport>(&mut self, session: TransportSession<T>) -> Result<Attached<T>> {
        let link = H5Link::new(session, self.config.frame_timeout);
        let mut hci = Hci::new(link, self.config.event_attempts);

        let version = self.identify(&mut hci).await?;
        info!(
            lmp_subversion = %format!("0x{:04x}", version.lmp_subversion),
            hci_revision = %format!("0x{:04x}", version.hci_revision),
            "Controller identified"
        );
        self.transition(AttachState::VersionKnown);

        let firmware_loaded = version.lmp_subversion != self.config.patched_subversion;
        let final_subversion = if firmware_loaded {
            self.load_firmware(&mut hci).await?
        } else {
            info!("Firmware already running, skipping download");
            Some(version.lmp_subversion)
        };
        self.transition(AttachState::FirmwareLoaded);

        if self.config.target_baud != hci.baud_rate() {
            switch_baud(&mut hci, self.config.target_baud, self.config.baud_settle).await?;
        }
        self.transition(AttachState::BaudSwitched);

        let sco_routed = match hci
            .command(Opcode::VendorScoRouting as u16, &SCO_OVER_HCI)
            .await
        {
            Ok(_) => true,
            Err(e) => {
                warn!(error = %e, "SCO routing not applied");
                false
            }
        };
        self.transition(AttachState::Ready);

        let report = AttachReport {
            initial_subversion: version.lmp_subversion,
            final_subversion,
            firmware_loaded,
            baud_rate: hci.baud_rate(),
            sco_routed,
        };
        Ok(Attached { hci, report })
    }

    /// Reset and read the version, trying the pair a second time unless the
    /// first failure lost the link.
    async fn identify<T: Transport>(&self, hci: &mut Hci<T>) -> Result<LocalVersion> {
        match self.reset_and_read_version(hci).await {
            Ok(version) => Ok(version),
            Err(e) if !e.desynchronizes() => {
                warn!(error = %e, "Controller did not identify, resetting again");
                self.reset_and_read_version(hci).await
            }
            Err(e) => Err(e),
        }
    }

    async fn reset_and_read_version<T: Transport>(&self, hci: &mut Hci<T>) -> Result<LocalVersion> {
        self.reset(hci).await?;
        hci.read_local_version().await
    }

    async fn reset<T: Transport>(&self, hci: &mut Hci<T>) -> Result<()> {
        hci.reset().await?;
        time::sleep(self.config.reset_delay).await;
        Ok(())
    }

    /// Download the patch, reset into it and report the new subversion.
    async fn load_firmware<T: Transport>(&self, hci: &mut Hci<T>) -> Result<Option<u16>> {
        let image = FirmwareImage::load(&self.config.firmware_path())?;
        let config = ConfigBlob::load_optional(&self.config.config_path())?;

        let mut last_decile = 0;
        let mut report = |progress: Progress| {
            let decile = progress.percent() / 10;
            if decile > last_decile {
                last_decile = decile;
                info!(percent = progress.percent(), "Firmware download progress");
            }
        };

        firmware::load(hci, &image, config.as_ref(), &mut report).await?;
        self.reset(hci).await?;

        match hci.read_local_version().await {
            Ok(version) => {
                if version.lmp_subversion != self.config.patched_subversion {
                    warn!(
                        lmp_subversion = %format!("0x{:04x}", version.lmp_subversion),
                        expected = %format!("0x{:04x}", self.config.patched_subversion),
                        "Chip does not report the patched subversion"
                    );
                }
                Ok(Some(version.lmp_subversion))
            }
            Err(e) => {
                warn!(error = %e, "Could not read version after firmware download");
                Ok(None)
            }
        }
    }

    fn transition(&mut self, next: AttachState) {
        info!(from = %self.state, to = %next, "Attach state");
        self.state = next;
    }

    fn fail(&mut self, error: &Error) {
        error!(state = %self.state, error = %error, "Attach failed");
        self.state = AttachState::Failed;
    }
}
