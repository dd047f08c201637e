//! Format & mount primitives.
//!
//! [`Mounter`] is the narrow interface through which the node backend
//! observes and changes kernel state: filesystem signatures, the mount
//! table, LUKS mappings and filesystem size. Every predicate is answered by
//! the kernel at call time, which keeps the RPC handlers idempotent under
//! retries. [`SystemMounter`] is the host implementation.

mod cryptsetup;
pub mod mount_table;
mod system;

use nix::mount::MsFlags;

use crate::error::CsiError;
use crate::luks::LuksContext;
use crate::types::VolumeId;

pub use mount_table::{MountEntry, MountTable};
pub use system::{MounterConfig, SystemMounter};

/// Blocking format/mount/resize primitives.
///
/// Calls block the current thread; the backend runs them on the blocking
/// pool. None of the operations rolls back on failure.
pub trait Mounter: Send + Sync {
    /// Whether `source` carries a filesystem. For an encrypted volume being
    /// staged this inspects the decrypted mapping, not the ciphertext.
    fn is_formatted(&self, source: &str, luks: &LuksContext) -> Result<bool, CsiError>;

    /// Create an `fs_type` filesystem on `source`, creating and opening the
    /// LUKS layer first when `luks` asks for it.
    fn format(&self, source: &str, fs_type: &str, luks: &LuksContext) -> Result<(), CsiError>;

    /// Whether anything is mounted at `target`.
    fn is_mounted(&self, target: &str) -> Result<bool, CsiError>;

    /// Mount `source` at `target`. `source` is a device, or a path when
    /// `options` contains `bind`.
    fn mount(
        &self,
        source: &str,
        target: &str,
        fs_type: &str,
        luks: &LuksContext,
        options: &[String],
    ) -> Result<(), CsiError>;

    /// Unmount `target`, closing the LUKS mapping underneath when this is
    /// the staging mount.
    fn unmount(&self, target: &str, luks: &LuksContext) -> Result<(), CsiError>;

    /// Close the LUKS mapping of `volume_id` if it is still open and nothing
    /// has it mounted. Covers an unstage whose unmount succeeded but whose
    /// close did not.
    fn close_mapping(&self, volume_id: &VolumeId) -> Result<(), CsiError>;

    /// Device backing the mount at `target`.
    fn device_for_mount(&self, target: &str) -> Result<String, CsiError>;

    /// Grow the filesystem on `device`, mounted at `target`, to the size of
    /// the device.
    fn resize(&self, device: &str, target: &str) -> Result<(), CsiError>;
}

/// Mount options split into kernel flags and filesystem data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountOptions {
    pub flags: MsFlags,
    /// Options the kernel passes to the filesystem, e.g. `discard`.
    pub data: Vec<String>,
}

impl MountOptions {
    pub fn parse(options: &[String]) -> Self {
        let mut flags = MsFlags::empty();
        let mut data = Vec::new();
        for option in options {
            match option.as_str() {
                "" | "defaults" => {}
                "ro" => flags.insert(MsFlags::MS_RDONLY),
                "rw" => flags.remove(MsFlags::MS_RDONLY),
                "bind" => flags.insert(MsFlags::MS_BIND),
                "rbind" => flags.insert(MsFlags::MS_BIND | MsFlags::MS_REC),
                "noatime" => flags.insert(MsFlags::MS_NOATIME),
                "nodiratime" => flags.insert(MsFlags::MS_NODIRATIME),
                "relatime" => flags.insert(MsFlags::MS_RELATIME),
                "strictatime" => flags.insert(MsFlags::MS_STRICTATIME),
                "nodev" => flags.insert(MsFlags::MS_NODEV),
                "nosuid" => flags.insert(MsFlags::MS_NOSUID),
                "noexec" => flags.insert(MsFlags::MS_NOEXEC),
                "sync" => flags.insert(MsFlags::MS_SYNCHRONOUS),
                "dirsync" => flags.insert(MsFlags::MS_DIRSYNC),
                "async" => flags.remove(MsFlags::MS_SYNCHRONOUS),
                "dev" => flags.remove(MsFlags::MS_NODEV),
                "suid" => flags.remove(MsFlags::MS_NOSUID),
                "exec" => flags.remove(MsFlags::MS_NOEXEC),
                other => data.push(other.to_owned()),
            }
        }
        Self { flags, data }
    }

    pub fn is_bind(&self) -> bool {
        self.flags.contains(MsFlags::MS_BIND)
    }

    pub fn is_read_only(&self) -> bool {
        self.flags.contains(MsFlags::MS_RDONLY)
    }

    /// Data string for `mount(2)`, `None` when empty.
    pub fn data(&self) -> Option<String> {
        (!self.data.is_empty()).then(|| self.data.join(","))
    }
}
