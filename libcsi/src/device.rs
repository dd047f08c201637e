//! Locating the block device of a freshly attached volume.
//!
//! The cloud attaches a virtio disk whose serial is the volume id, truncated
//! to the 20 bytes the virtio-blk identification field can hold. udev turns
//! that serial into a stable `/dev/disk/by-id/` link. Newly attached disks
//! are not always registered automatically, so a miss triggers a udev
//! re-scan before the lookup is retried.

use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::command::CommandRunner;
use crate::error::CsiError;
use crate::types::VolumeId;

/// `VIRTIO_BLK_ID_BYTES` in `include/uapi/linux/virtio_blk.h`.
pub const VIRTIO_SERIAL_MAX_BYTES: usize = 20;

/// Link-name prefixes udev uses for disks identified by serial.
const BY_ID_PREFIXES: &[&str] = &["virtio-", "scsi-0QEMU_QEMU_HARDDISK_"];

/// Kernel-visible serial for a volume: the id cut to at most 20 bytes.
///
/// The cut never splits a UTF-8 character.
pub fn linux_serial(volume_id: &VolumeId) -> &str {
    let id = volume_id.as_str();
    if id.len() <= VIRTIO_SERIAL_MAX_BYTES {
        return id;
    }
    let mut end = VIRTIO_SERIAL_MAX_BYTES;
    while !id.is_char_boundary(end) {
        end -= 1;
    }
    &id[..end]
}

/// Finds the local device node for an attached volume.
///
/// Implementations block the calling thread; callers run them on the
/// blocking pool.
pub trait DeviceResolver: Send + Sync {
    /// Return the device path (e.g. `/dev/vdb`) for `volume_id`, whose
    /// kernel serial is `serial`.
    fn find_device(&self, volume_id: &VolumeId, serial: &str) -> Result<String, CsiError>;
}

/// Tunables for [`UdevDeviceResolver`].
#[derive(Debug, Clone)]
pub struct ResolverConfig {
    /// Directory holding the by-id links.
    pub by_id_dir: PathBuf,
    /// Lookups to attempt before giving up.
    pub attempts: u32,
    /// Pause between attempts.
    pub retry_delay: Duration,
    /// `udevadm` binary used for re-scans.
    pub udevadm: String,
    /// Upper bound for each `udevadm` invocation.
    pub command_timeout: Duration,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            by_id_dir: PathBuf::from("/dev/disk/by-id"),
            attempts: 5,
            retry_delay: Duration::from_secs(1),
            udevadm: "udevadm".to_owned(),
            command_timeout: Duration::from_secs(30),
        }
    }
}

/// Resolver backed by udev's `/dev/disk/by-id` links.
#[derive(Debug, Clone)]
pub struct UdevDeviceResolver {
    config: ResolverConfig,
    runner: CommandRunner,
}

impl UdevDeviceResolver {
    pub fn new(config: ResolverConfig) -> Self {
        let runner = CommandRunner::new(config.command_timeout);
        Self { config, runner }
    }

    fn lookup(&self, serial: &str) -> Option<PathBuf> {
        BY_ID_PREFIXES.iter().find_map(|prefix| {
            let link = self.config.by_id_dir.join(format!("{prefix}{serial}"));
            canonical_device(&link)
        })
    }

    /// Ask udev to re-announce block devices and wait for the queue to drain.
    ///
    /// Failures are logged only: the next lookup decides the outcome.
    fn trigger_rescan(&self) {
        let udevadm = self.config.udevadm.as_str();
        match self
            .runner
            .run(udevadm, &["trigger", "--action=add", "--subsystem-match=block"], None)
        {
            Ok(out) if !out.success() => {
                warn!(diagnostic = %out.diagnostic(), "udevadm trigger failed")
            }
            Err(e) => warn!(error = %e, "udevadm trigger could not run"),
            Ok(_) => {}
        }
        if let Err(e) = self.runner.run(udevadm, &["settle"], None) {
            warn!(error = %e, "udevadm settle could not run");
        }
    }
}

impl DeviceResolver for UdevDeviceResolver {
    fn find_device(&self, volume_id: &VolumeId, serial: &str) -> Result<String, CsiError> {
        let attempts = self.config.attempts.max(1);
        for attempt in 1..=attempts {
            if let Some(device) = self.lookup(serial) {
                let device = device.to_string_lossy().into_owned();
                info!(%volume_id, serial, %device, attempt, "found volume device");
                return Ok(device);
            }
            if attempt < attempts {
                debug!(%volume_id, serial, attempt, "device not visible yet, triggering udev");
                self.trigger_rescan();
                thread::sleep(self.config.retry_delay);
            }
        }

        Err(CsiError::DeviceNotFound {
            volume_id: volume_id.to_string(),
            serial: serial.to_owned(),
            reason: format!(
                "no link under {} after {attempts} attempts",
                self.config.by_id_dir.display()
            ),
        })
    }
}

fn canonical_device(link: &Path) -> Option<PathBuf> {
    if !link.exists() {
        return None;
    }
    std::fs::canonicalize(link).ok()
}
