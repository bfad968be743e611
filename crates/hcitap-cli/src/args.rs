use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use hcitap::session::parse_device;
use hcitap::{HciChannel, SessionConfig};

#[derive(Parser, Debug)]
#[command(name = "hcitap")]
#[command(bin_name = "hcitap")]
#[command(about = "print raw HCI traffic from a Bluetooth controller")]
pub struct Cli {
    /// Device index such as `0` or `hci0`. Defaults to $HCITAP_DEVICE, then the first device that is up
    #[arg(value_parser = device_index)]
    pub device: Option<u16>,

    /// Capture every controller passively on the monitor channel, like btmon
    #[arg(long, conflicts_with = "device")]
    pub monitor: bool,

    /// Exit on the first unknown packet type or malformed record instead of resynchronising
    #[arg(long)]
    pub fatal_framing: bool,

    /// Packets buffered for output before the capture fails
    #[arg(long, value_parser = clap::value_parser!(u32).range(1..))]
    pub queue_capacity: Option<u32>,

    /// Longest wait for data before checking for Ctrl-C
    #[arg(long, value_parser = clap::value_parser!(u64).range(1..))]
    pub read_timeout_ms: Option<u64>,

    /// Give up if the device cannot be opened within this time
    #[arg(long)]
    pub open_timeout_ms: Option<u64>,

    /// Replay hex chunks from a file, one per line, instead of opening a device
    #[arg(long, value_name = "FILE")]
    pub mock: Option<PathBuf>,
}

fn device_index(value: &str) -> Result<u16, String> {
    parse_device(value).ok_or_else(|| format!("invalid HCI device `{}`", value))
}

impl Cli {
    /// Session settings from the environment, overridden by the command line
    pub fn session_config(&self) -> SessionConfig {
        let mut config = SessionConfig::from_env();
        if let Some(device) = self.device {
            config = config.with_device(device);
        }
        if self.monitor {
            config = config.with_channel(HciChannel::Monitor);
        }
        if let Some(capacity) = self.queue_capacity {
            config = config.with_queue_capacity(capacity as usize);
        }
        if let Some(ms) = self.read_timeout_ms {
            config = config.with_read_timeout(Duration::from_millis(ms));
        }
        if let Some(ms) = self.open_timeout_ms {
            config = config.with_open_timeout(Duration::from_millis(ms));
        }
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_flags() {
        let cli = Cli::try_parse_from([
            "hcitap",
            "hci1",
            "--fatal-framing",
            "--queue-capacity",
            "16",
            "--read-timeout-ms",
            "25",
        ])
        .unwrap();

        assert_eq!(cli.device, Some(1));
        assert!(cli.fatal_framing);
        assert!(cli.mock.is_none());

        let config = cli.session_config();
        assert_eq!(config.device_id, Some(1));
        assert_eq!(config.queue_capacity, 16);
        assert_eq!(config.read_timeout, Duration::from_millis(25));
        assert_eq!(config.open_timeout, None);
        assert_eq!(config.channel, HciChannel::Raw);
    }

    #[test]
    fn test_monitor_flag() {
        let cli = Cli::try_parse_from(["hcitap", "--monitor", "--open-timeout-ms", "500"]).unwrap();
        let config = cli.session_config();
        assert_eq!(config.channel, HciChannel::Monitor);
        assert_eq!(config.open_timeout, Some(Duration::from_millis(500)));

        // The monitor sees every controller, so a device makes no sense
        assert!(Cli::try_parse_from(["hcitap", "--monitor", "hci0"]).is_err());
    }

    #[test]
    fn test_rejects_bad_device() {
        assert!(Cli::try_parse_from(["hcitap", "usb0"]).is_err());
        assert!(Cli::try_parse_from(["hcitap", "--queue-capacity", "0"]).is_err());
    }

    #[test]
    fn test_cli_definition() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}
