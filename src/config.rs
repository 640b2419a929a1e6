use std::env;
use std::path::PathBuf;

/// Where the mailbox tree lives when nothing else is configured.
pub const DEFAULT_MAILBOXES_ROOT: &str = "/var/opt/pr-holonet/mailboxes";

/// Core configuration.
///
/// Everything has a sensible default for a Raspberry Pi appliance; the
/// embedding process may override any field before handing the config to
/// [`QueueManager::start`](crate::QueueManager::start).
#[derive(Debug, Clone)]
pub struct Config {
    /// Serial device the modem is attached to, e.g. `/dev/ttyUSB0`.
    ///
    /// When `None`, the queue manager probes the candidate ports reported
    /// by [`candidate_ports`](crate::serial::candidate_ports) and uses the
    /// first one that opens.
    pub device: Option<String>,
    /// Root directory of the mailbox tree.
    pub mailboxes_root: PathBuf,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            device: None,
            mailboxes_root: PathBuf::from(DEFAULT_MAILBOXES_ROOT),
        }
    }
}

impl Config {
    /// Build a config from the environment.
    ///
    /// `ROCKBLOCK_DEVICE` names the modem device; `MAILBOXES_ROOT`
    /// overrides the mailbox tree location. Unset variables fall back to
    /// the defaults.
    pub fn from_env() -> Config {
        let mut config = Config::default();
        if let Ok(device) = env::var("ROCKBLOCK_DEVICE") {
            if !device.is_empty() {
                config.device = Some(device);
            }
        }
        if let Ok(root) = env::var("MAILBOXES_ROOT") {
            if !root.is_empty() {
                config.mailboxes_root = PathBuf::from(root);
            }
        }
        config
    }
}
