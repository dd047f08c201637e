//! Core CSI types: volumes, capabilities, node requests, and topology.
//!
//! These types form the data model shared by the CSI traits, transport layer,
//! and backend implementations.  They are all [`Serialize`]/[`Deserialize`] so
//! they can be transmitted over QUIC as JSON.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Filesystem created on a volume whose capability names none.
pub const DEFAULT_FS_TYPE: &str = "ext4";

/// Publish-context key carrying the volume name set by the attach step.
pub const PUBLISH_INFO_VOLUME_NAME: &str = "volume_name";

// ---------------------------------------------------------------------------
// Volume identity
// ---------------------------------------------------------------------------

/// Opaque, unique identifier for a volume.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct VolumeId(pub String);

impl VolumeId {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for VolumeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for VolumeId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for VolumeId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

// ---------------------------------------------------------------------------
// Secrets
// ---------------------------------------------------------------------------

/// Secrets delivered inline with a request.
///
/// The `Debug` implementation prints key names only, so requests can be
/// traced without leaking passphrases.
#[derive(Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct Secrets(pub HashMap<String, String>);

impl Secrets {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }
}

impl fmt::Debug for Secrets {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut keys: Vec<&String> = self.0.keys().collect();
        keys.sort();
        f.debug_map()
            .entries(keys.into_iter().map(|k| (k, "<redacted>")))
            .finish()
    }
}

impl<const N: usize> From<[(String, String); N]> for Secrets {
    fn from(entries: [(String, String); N]) -> Self {
        Self(HashMap::from(entries))
    }
}

// ---------------------------------------------------------------------------
// Access mode & capabilities
// ---------------------------------------------------------------------------

/// Describes how a volume may be accessed.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum AccessMode {
    /// Single-node read-write.
    ReadWriteOnce,
    /// Multi-node read-only.
    ReadOnlyMany,
    /// Multi-node read-write.
    ReadWriteMany,
}

/// Whether the workload sees a filesystem or the raw block device.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum AccessType {
    /// Filesystem volume.
    Mount {
        /// Filesystem type; empty selects [`DEFAULT_FS_TYPE`].
        #[serde(default)]
        fs_type: String,
        /// Additional mount flags (e.g. `"noatime"`).
        #[serde(default)]
        mount_flags: Vec<String>,
    },
    /// Raw block device, bind-mounted as a device node.
    Block,
}

/// Describes the capabilities required from a volume.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeCapability {
    /// Requested access mode.
    pub access_mode: AccessMode,
    /// Requested access type.
    pub access_type: AccessType,
}

impl VolumeCapability {
    /// Filesystem volume with the given type and flags.
    pub fn mount(fs_type: impl Into<String>, mount_flags: Vec<String>) -> Self {
        Self {
            access_mode: AccessMode::ReadWriteOnce,
            access_type: AccessType::Mount {
                fs_type: fs_type.into(),
                mount_flags,
            },
        }
    }

    /// Raw block volume.
    pub fn block() -> Self {
        Self {
            access_mode: AccessMode::ReadWriteOnce,
            access_type: AccessType::Block,
        }
    }

    pub fn is_block(&self) -> bool {
        matches!(self.access_type, AccessType::Block)
    }

    /// Requested filesystem type, falling back to [`DEFAULT_FS_TYPE`].
    pub fn fs_type(&self) -> &str {
        match &self.access_type {
            AccessType::Mount { fs_type, .. } if !fs_type.is_empty() => fs_type,
            _ => DEFAULT_FS_TYPE,
        }
    }

    /// Requested mount flags (empty for block volumes).
    pub fn mount_flags(&self) -> &[String] {
        match &self.access_type {
            AccessType::Mount { mount_flags, .. } => mount_flags,
            AccessType::Block => &[],
        }
    }
}

impl Default for VolumeCapability {
    fn default() -> Self {
        Self::mount("", Vec::new())
    }
}

/// Topology constraint expressed as key-value segments.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Topology {
    /// Topology segments, e.g. `{"region": "rma"}`.
    #[serde(default)]
    pub segments: HashMap<String, String>,
}

// ---------------------------------------------------------------------------
// Node requests
// ---------------------------------------------------------------------------

/// Request to stage (format and globally mount) a volume on a node.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeStageVolumeRequest {
    /// Volume to stage.
    pub volume_id: VolumeId,
    /// Node-private staging mount point.
    pub staging_target_path: String,
    /// Requested capability.
    pub volume_capability: Option<VolumeCapability>,
    /// Context populated by the attach step; must carry the volume name.
    #[serde(default)]
    pub publish_context: Option<HashMap<String, String>>,
    /// Opaque context carried from volume creation.
    #[serde(default)]
    pub volume_context: HashMap<String, String>,
    /// Stage secrets (LUKS passphrase).
    #[serde(default)]
    pub secrets: Secrets,
}

/// Request to unstage a previously staged volume.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeUnstageVolumeRequest {
    pub volume_id: VolumeId,
    pub staging_target_path: String,
}

/// Request to publish (bind-mount) a staged volume into a workload.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodePublishVolumeRequest {
    /// Volume to publish.
    pub volume_id: VolumeId,
    /// The staging mount point (source of the bind mount).
    pub staging_target_path: String,
    /// Workload-specific target path.
    pub target_path: String,
    /// Requested capability.
    pub volume_capability: Option<VolumeCapability>,
    /// Context populated by the attach step.
    #[serde(default)]
    pub publish_context: Option<HashMap<String, String>>,
    /// Opaque context carried from volume creation.
    #[serde(default)]
    pub volume_context: HashMap<String, String>,
    /// Publish secrets.
    #[serde(default)]
    pub secrets: Secrets,
    /// Whether the bind mount should be read-only.
    #[serde(default)]
    pub read_only: bool,
}

/// Request to unpublish a volume from a workload path.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeUnpublishVolumeRequest {
    pub volume_id: VolumeId,
    pub target_path: String,
}

/// Request to grow the filesystem of a mounted volume.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeExpandVolumeRequest {
    pub volume_id: VolumeId,
    /// Path the volume is currently mounted at.
    pub volume_path: String,
    /// New size requested by the controller, informational only.
    #[serde(default)]
    pub required_bytes: Option<u64>,
}

/// Request for usage statistics of a mounted volume.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeGetVolumeStatsRequest {
    pub volume_id: VolumeId,
    pub volume_path: String,
}

// ---------------------------------------------------------------------------
// Plugin & node info
// ---------------------------------------------------------------------------

/// Information about the CSI plugin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginInfo {
    /// Plugin name, e.g. `"rk8s.block.csi"`.
    pub name: String,
    /// Vendor-provided version string.
    pub vendor_version: String,
}

/// Capabilities advertised by the CSI plugin.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum PluginCapability {
    /// Plugin provides a Controller service.
    ControllerService,
    /// Plugin supports volume topology constraints.
    VolumeAccessibilityConstraints,
    /// Volumes can be grown while they are in use.
    OnlineVolumeExpansion,
}

/// RPCs the Node service supports beyond the mandatory set.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum NodeCapability {
    /// `StageVolume` / `UnstageVolume` are implemented.
    StageUnstageVolume,
    /// `ExpandVolume` is implemented.
    ExpandVolume,
    /// `GetVolumeStats` is implemented.
    GetVolumeStats,
}

/// Information about the node on which the CSI Node service runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeInfo {
    /// Unique node identifier.
    pub node_id: String,
    /// Maximum number of volumes the node can host.
    pub max_volumes: u64,
    /// Optional topology of this node.
    #[serde(default)]
    pub accessible_topology: Option<Topology>,
}

/// Usage statistics of a volume.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeStats {
    pub total_bytes: u64,
    pub available_bytes: u64,
    pub used_bytes: u64,
}
