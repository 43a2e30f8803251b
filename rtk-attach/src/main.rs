//! Attach a Realtek Bluetooth controller on a UART.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;

use rtk_attach::tracing::{init_stdout, prelude::*};
use rtk_attach::{AttachConfig, Attacher};

/// Load firmware into a UART-attached Realtek Bluetooth chip and switch it to
/// its operating baud rate
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// UART device, e.g. /dev/ttyS1
    device: String,

    /// Baud rate the chip listens at after power-up
    #[arg(short = 's', long = "speed")]
    speed: Option<u32>,

    /// Baud rate to switch to once the firmware is running
    #[arg(short = 't', long = "target-speed")]
    target_speed: Option<u32>,

    /// Use RTS/CTS hardware flow control
    #[arg(short = 'f', long = "flow-control")]
    flow_control: bool,

    /// Stay in the foreground and hold the UART open until interrupted
    #[arg(short = 'n', long)]
    foreground: bool,

    /// Directory holding the firmware image and config blob
    #[arg(long)]
    firmware_dir: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short = 'v', long)]
    verbose: bool,
}

impl Args {
    fn into_config(self) -> AttachConfig {
        let mut config = AttachConfig::from_env(self.device);
        if let Some(speed) = self.speed {
            config.initial_baud = speed;
        }
        if let Some(speed) = self.target_speed {
            config.target_baud = speed;
        }
        if let Some(dir) = self.firmware_dir {
            config.firmware_dir = dir;
        }
        config.hardware_flow_control = self.flow_control;
        config
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_stdout(args.verbose);

    let foreground = args.foreground;
    let config = args.into_config();
    let device = config.device.clone();

    let mut attacher = Attacher::new(config);
    let attached = attacher
        .run()
        .await
        .with_context(|| format!("Failed to attach controller on {device}"))?;

    let report = &attached.report;
    info!(
        device = %device,
        baud_rate = report.baud_rate,
        firmware_loaded = report.firmware_loaded,
        lmp_subversion = ?report.final_subversion,
        sco_routed = report.sco_routed,
        "Controller ready"
    );

    if foreground {
        info!("Holding UART open, press Ctrl-C to release");
        tokio::signal::ctrl_c()
            .await
            .context("Failed to wait for Ctrl-C")?;
        info!("Releasing UART");
    }

    drop(attached);
    Ok(())
}
