//! Host tunables for the node plugin.
//!
//! Environment variables:
//! - `RKCSI_DEVICE_BY_ID_DIR`: directory holding udev's by-id links.
//!   Defaults to `/dev/disk/by-id`.
//! - `RKCSI_DEVICE_RETRIES`: device lookups before staging gives up.
//!   Defaults to `5`.
//! - `RKCSI_DEVICE_RETRY_DELAY_MS`: pause between lookups. Defaults to `1000`.
//! - `RKCSI_COMMAND_TIMEOUT_SECS`: upper bound for each host tool run
//!   (`mkfs`, `cryptsetup`, `udevadm`, ...). Defaults to `300`.

use std::path::PathBuf;
use std::sync::LazyLock;
use std::time::Duration;

use libcsi::{MounterConfig, ResolverConfig};

/// Tunables read once from the environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeTunables {
    pub by_id_dir: PathBuf,
    pub device_attempts: u32,
    pub device_retry_delay: Duration,
    pub command_timeout: Duration,
}

/// Globally initialized tunables, read from environment variables at first access.
pub static NODE_TUNABLES: LazyLock<NodeTunables> =
    LazyLock::new(|| NodeTunables::from_lookup(|key| std::env::var(key).ok()));

impl NodeTunables {
    fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        let number = |key: &str, default: u64| -> u64 {
            get(key)
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(default)
        };
        Self {
            by_id_dir: get("RKCSI_DEVICE_BY_ID_DIR")
                .filter(|v| !v.is_empty())
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("/dev/disk/by-id")),
            device_attempts: u32::try_from(number("RKCSI_DEVICE_RETRIES", 5))
                .unwrap_or(u32::MAX)
                .max(1),
            device_retry_delay: Duration::from_millis(number("RKCSI_DEVICE_RETRY_DELAY_MS", 1000)),
            command_timeout: Duration::from_secs(number("RKCSI_COMMAND_TIMEOUT_SECS", 300)),
        }
    }

    pub fn resolver_config(&self) -> ResolverConfig {
        ResolverConfig {
            by_id_dir: self.by_id_dir.clone(),
            attempts: self.device_attempts,
            retry_delay: self.device_retry_delay,
            command_timeout: self.command_timeout,
            ..ResolverConfig::default()
        }
    }

    pub fn mounter_config(&self) -> MounterConfig {
        MounterConfig {
            command_timeout: self.command_timeout,
            ..MounterConfig::default()
        }
    }
}
