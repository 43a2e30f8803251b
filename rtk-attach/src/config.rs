//! Attach configuration.
//!
//! Defaults suit an RTL8723D on a 3-wire UART. Environment variables can
//! override the firmware location and timing; command-line flags are applied
//! on top by the binary.

use std::{path::PathBuf, time::Duration};

use crate::transport::SerialFraming;

/// Everything the attach sequence needs to know up front.
#[derive(Debug, Clone)]
pub struct AttachConfig {
    /// UART device node, e.g. `/dev/ttyS1`.
    pub device: String,

    /// Rate the chip listens at after power-up.
    pub initial_baud: u32,

    /// Rate to run at once the firmware is loaded.
    pub target_baud: u32,

    /// Use RTS/CTS.
    pub hardware_flow_control: bool,

    pub firmware_dir: PathBuf,
    pub firmware_file: String,
    pub config_file: String,

    /// LMP subversion reported by a chip that is already running the patch.
    pub patched_subversion: u16,

    /// Longest wait for one complete frame.
    pub frame_timeout: Duration,

    /// Frames (or failed reads) one event wait may consume.
    pub event_attempts: usize,

    /// Pause between the chip acknowledging a baud change and the local switch.
    pub baud_settle: Duration,

    /// Pause after every HCI reset.
    pub reset_delay: Duration,
}

impl AttachConfig {
    pub fn new(device: impl Into<String>) -> Self {
        Self {
            device: device.into(),
            initial_baud: 115_200,
            target_baud: 1_500_000,
            hardware_flow_control: false,
            firmware_dir: PathBuf::from("/lib/firmware/rtlbt"),
            firmware_file: "rtl8723d_fw.bin".into(),
            config_file: "rtl8723d_config.bin".into(),
            patched_subversion: 0x8723,
            frame_timeout: Duration::from_secs(1),
            event_attempts: 10,
            baud_settle: Duration::from_millis(50),
            reset_delay: Duration::from_secs(1),
        }
    }

    /// Defaults with environment overrides applied.
    ///
    /// # Environment Variables
    ///
    /// - `RTK_ATTACH_FIRMWARE_DIR`: directory holding firmware and config
    /// - `RTK_ATTACH_SETTLE_MS`: pause after a baud change request
    /// - `RTK_ATTACH_RESET_DELAY_MS`: pause after each HCI reset
    /// - `RTK_ATTACH_FRAME_TIMEOUT_MS`: per-frame receive timeout (at least 1)
    /// - `RTK_ATTACH_EVENT_ATTEMPTS`: event wait budget (at least 1)
    ///
    /// Values that do not parse are ignored.
    pub fn from_env(device: impl Into<String>) -> Self {
        let mut config = Self::new(device);

        if let Ok(dir) = std::env::var("RTK_ATTACH_FIRMWARE_DIR") {
            config.firmware_dir = PathBuf::from(dir);
        }
        if let Some(ms) = env_number("RTK_ATTACH_SETTLE_MS") {
            config.baud_settle = Duration::from_millis(ms);
        }
        if let Some(ms) = env_number("RTK_ATTACH_RESET_DELAY_MS") {
            config.reset_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = env_number("RTK_ATTACH_FRAME_TIMEOUT_MS") {
            config.frame_timeout = Duration::from_millis(ms.max(1));
        }
        if let Some(attempts) = env_number("RTK_ATTACH_EVENT_ATTEMPTS") {
            config.event_attempts = (attempts as usize).max(1);
        }

        config
    }

    pub fn framing(&self) -> SerialFraming {
        SerialFraming::eight_n_one(self.hardware_flow_control)
    }

    pub fn firmware_path(&self) -> PathBuf {
        self.firmware_dir.join(&self.firmware_file)
    }

    pub fn config_path(&self) -> PathBuf {
        self.firmware_dir.join(&self.config_file)
    }
}

fn env_number(name: &str) -> Option<u64> {
    std::env::var(name).ok().and_then(|s| s.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    const VARS: [&str; 5] = [
        "RTK_ATTACH_FIRMWARE_DIR",
        "RTK_ATTACH_SETTLE_MS",
        "RTK_ATTACH_RESET_DELAY_MS",
        "RTK_ATTACH_FRAME_TIMEOUT_MS",
        "RTK_ATTACH_EVENT_ATTEMPTS",
    ];

    fn clear_env() {
        for var in VARS {
            std::env::remove_var(var);
        }
    }

    #[test]
    #[serial]
    fn defaults_without_environment() {
        clear_env();

        let config = AttachConfig::from_env("/dev/ttyS1");

        assert_eq!(config.initial_baud, 115_200);
        assert_eq!(config.target_baud, 1_500_000);
        assert_eq!(
            config.firmware_path(),
            PathBuf::from("/lib/firmware/rtlbt/rtl8723d_fw.bin")
        );
        assert_eq!(
            config.config_path(),
            PathBuf::from("/lib/firmware/rtlbt/rtl8723d_config.bin")
        );
        assert_eq!(config.frame_timeout, Duration::from_secs(1));
        assert_eq!(config.event_attempts, 10);
        assert_eq!(config.baud_settle, Duration::from_millis(50));
        assert_eq!(config.reset_delay, Duration::from_secs(1));
    }

    #[test]
    #[serial]
    fn environment_overrides() {
        clear_env();
        std::env::set_var("RTK_ATTACH_FIRMWARE_DIR", "/tmp/rtlbt");
        std::env::set_var("RTK_ATTACH_SETTLE_MS", "200");
        std::env::set_var("RTK_ATTACH_RESET_DELAY_MS", "0");
        std::env::set_var("RTK_ATTACH_EVENT_ATTEMPTS", "3");

        let config = AttachConfig::from_env("/dev/ttyS1");
        clear_env();

        assert_eq!(
            config.firmware_path(),
            PathBuf::from("/tmp/rtlbt/rtl8723d_fw.bin")
        );
        assert_eq!(config.baud_settle, Duration::from_millis(200));
        assert_eq!(config.reset_delay, Duration::ZERO);
        assert_eq!(config.event_attempts, 3);
    }

    #[test]
    #[serial]
    fn unparsable_or_zero_budgets_are_ignored_or_clamped() {
        clear_env();
        std::env::set_var("RTK_ATTACH_FRAME_TIMEOUT_MS", "soon");
        std::env::set_var("RTK_ATTACH_EVENT_ATTEMPTS", "0");

        let config = AttachConfig::from_env("/dev/ttyS1");
        clear_env();

        assert_eq!(config.frame_timeout, Duration::from_secs(1));
        assert_eq!(config.event_attempts, 1);
    }
}
