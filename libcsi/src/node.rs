//! CSI Node service trait.
//!
//! The Node service runs on each worker node and makes an attached block
//! volume usable by workloads:
//!
//! 1. **Stage**: locate the device, format it if blank (optionally under a
//!    LUKS layer) and mount it at a node-private staging path.
//! 2. **Publish**: bind-mount the staging path into the workload.
//! 3. **Unpublish**: remove the bind mount.
//! 4. **Unstage**: unmount the staging path and close any LUKS mapping.
//!
//! Every call must be safe to repeat: the orchestrator retries on timeouts
//! and restarts.

use async_trait::async_trait;

use crate::error::CsiError;
use crate::types::{
    NodeCapability, NodeExpandVolumeRequest, NodeGetVolumeStatsRequest, NodeInfo,
    NodePublishVolumeRequest, NodeStageVolumeRequest, NodeUnpublishVolumeRequest,
    NodeUnstageVolumeRequest, VolumeStats,
};

/// Node service: local format, mount and resize operations.
#[async_trait]
pub trait CsiNode: Send + Sync {
    /// Stage a volume at its staging path.
    ///
    /// Succeeds without changes when the staging path is already mounted.
    async fn stage_volume(&self, req: NodeStageVolumeRequest) -> Result<(), CsiError>;

    /// Unstage a volume. Succeeds when nothing is mounted at the path.
    async fn unstage_volume(&self, req: NodeUnstageVolumeRequest) -> Result<(), CsiError>;

    /// Publish a staged volume at the workload target path.
    ///
    /// Succeeds without changes when the target is already mounted.
    async fn publish_volume(&self, req: NodePublishVolumeRequest) -> Result<(), CsiError>;

    /// Unpublish a volume. Succeeds when nothing is mounted at the target.
    async fn unpublish_volume(&self, req: NodeUnpublishVolumeRequest) -> Result<(), CsiError>;

    /// Optional RPCs this node service implements.
    async fn get_capabilities(&self) -> Result<Vec<NodeCapability>, CsiError>;

    /// Return information about the node on which this service is running.
    async fn get_info(&self) -> Result<NodeInfo, CsiError>;

    /// Usage statistics for a mounted volume.
    async fn get_volume_stats(
        &self,
        req: NodeGetVolumeStatsRequest,
    ) -> Result<VolumeStats, CsiError>;

    /// Grow the filesystem of a mounted volume after its device grew.
    async fn expand_volume(&self, req: NodeExpandVolumeRequest) -> Result<(), CsiError>;
}
