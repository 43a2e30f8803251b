//! Bring-up of UART-attached Realtek Bluetooth controllers.
//!
//! The chip is reached through a [`transport::TransportSession`], spoken to
//! in three-wire frames by [`h5::H5Link`] and in HCI commands by
//! [`hci::Hci`]. [`attach::Attacher`] strings the steps together: identify
//! the chip, download its patch, move to the target rate, and hand the open
//! link back to the caller.

pub mod attach;
pub mod baud;
pub mod config;
pub mod error;
pub mod firmware;
pub mod h5;
pub mod hci;
pub mod tracing;
pub mod transport;

#[cfg(test)]
mod sim;

pub use attach::{AttachReport, AttachState, Attached, Attacher};
pub use config::AttachConfig;
pub use error::{Error, Result};
