//! Block-volume node backend.
//!
//! [`BlockNodeBackend`] implements [`CsiIdentity`] and [`CsiNode`] for
//! volumes that arrive on the node as virtio disks. Every handler is a
//! reconciliation step: it validates the request, observes the kernel state
//! through the [`Mounter`] and only acts when the desired state is not yet
//! reached. Nothing about a volume is remembered between calls.
//!
//! Host primitives block, so each one runs on Tokio's blocking pool. A
//! caller that drops the request future stops the handler before its next
//! primitive; a primitive already running is not interrupted.
//!
//! # Volume states
//!
//! ```text
//! Unattached -> DeviceVisible -> Formatted -> Staged -> Published
//! ```
//!
//! None of these states is stored; they are read back from `blkid`,
//! `cryptsetup` and the mount table on every call.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, instrument};

use crate::device::{DeviceResolver, linux_serial};
use crate::error::CsiError;
use crate::identity::CsiIdentity;
use crate::lock::VolumeLocks;
use crate::luks::{LuksContext, VolumeLifecycle};
use crate::mounter::Mounter;
use crate::mounter::mount_table::PROC_MOUNTS;
use crate::node::CsiNode;
use crate::types::*;

/// Name reported by `GetPluginInfo` unless configured otherwise.
pub const DEFAULT_PLUGIN_NAME: &str = "rk8s.block.csi";

/// Volumes the scheduler may place on one node.
pub const MAX_VOLUMES_PER_NODE: u64 = 128;

/// Topology key pinning volumes to the node's region.
pub const TOPOLOGY_REGION_KEY: &str = "region";

/// CSI node backend for attached block volumes.
///
/// # Thread safety
///
/// Calls for different volumes run concurrently. Calls for the same volume
/// id are serialized by [`VolumeLocks`] so that two retries cannot both
/// observe "unformatted" and format twice.
pub struct BlockNodeBackend {
    node_id: String,
    region: String,
    plugin_name: String,
    /// Mount table read by the readiness probe.
    mount_table: PathBuf,
    resolver: Arc<dyn DeviceResolver>,
    mounter: Arc<dyn Mounter>,
    locks: VolumeLocks,
}

impl BlockNodeBackend {
    /// Create a backend for `node_id` in `region`.
    pub fn new(
        node_id: impl Into<String>,
        region: impl Into<String>,
        resolver: Arc<dyn DeviceResolver>,
        mounter: Arc<dyn Mounter>,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            region: region.into(),
            plugin_name: DEFAULT_PLUGIN_NAME.to_owned(),
            mount_table: PathBuf::from(PROC_MOUNTS),
            resolver,
            mounter,
            locks: VolumeLocks::new(),
        }
    }

    pub fn with_plugin_name(mut self, name: impl Into<String>) -> Self {
        self.plugin_name = name.into();
        self
    }

    pub fn with_mount_table(mut self, path: impl Into<PathBuf>) -> Self {
        self.mount_table = path.into();
        self
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Run a mounter primitive on the blocking pool.
    async fn with_mounter<F, R>(&self, f: F) -> Result<R, CsiError>
    where
        F: FnOnce(&dyn Mounter) -> Result<R, CsiError> + Send + 'static,
        R: Send + 'static,
    {
        let mounter = Arc::clone(&self.mounter);
        tokio::task::spawn_blocking(move || f(mounter.as_ref()))
            .await
            .map_err(|e| CsiError::Internal(format!("mounter task failed: {e}")))?
    }

    /// Resolve the local device of `volume_id` on the blocking pool.
    async fn find_device(&self, volume_id: &VolumeId) -> Result<String, CsiError> {
        let resolver = Arc::clone(&self.resolver);
        let volume_id = volume_id.clone();
        tokio::task::spawn_blocking(move || {
            let serial = linux_serial(&volume_id);
            resolver.find_device(&volume_id, serial)
        })
        .await
        .map_err(|e| CsiError::Internal(format!("device resolver task failed: {e}")))?
    }

    async fn is_mounted(&self, target: &str) -> Result<bool, CsiError> {
        let target = target.to_owned();
        self.with_mounter(move |m| m.is_mounted(&target)).await
    }

    /// Unmount `target` if something is mounted there.
    async fn ensure_unmounted(&self, target: &str, luks: LuksContext) -> Result<(), CsiError> {
        if !self.is_mounted(target).await? {
            info!(target, "target already unmounted");
            return Ok(());
        }
        info!(target, "unmounting");
        let target = target.to_owned();
        self.with_mounter(move |m| m.unmount(&target, &luks)).await
    }
}

fn require(condition: bool, rpc: &str, what: &str) -> Result<(), CsiError> {
    if condition {
        Ok(())
    } else {
        Err(CsiError::invalid(format!("{rpc} {what} must be provided")))
    }
}

/// Publish context of a request, which must be present.
fn require_publish_context(
    context: Option<HashMap<String, String>>,
) -> Result<HashMap<String, String>, CsiError> {
    context.ok_or_else(|| CsiError::invalid("PublishContext must be provided"))
}

/// Options for a publish bind mount: the requested flags, `bind`, and `ro`
/// when the request is read-only.
pub fn publish_mount_options(requested: &[String], read_only: bool) -> Vec<String> {
    let mut options = requested.to_vec();
    options.push("bind".to_owned());
    if read_only {
        options.push("ro".to_owned());
    }
    options
}

// ---------------------------------------------------------------------------
// CsiIdentity
// ---------------------------------------------------------------------------

#[async_trait]
impl CsiIdentity for BlockNodeBackend {
    async fn get_plugin_info(&self) -> Result<PluginInfo, CsiError> {
        Ok(PluginInfo {
            name: self.plugin_name.clone(),
            vendor_version: env!("CARGO_PKG_VERSION").to_owned(),
        })
    }

    async fn probe(&self) -> Result<bool, CsiError> {
        // Every handler consults the mount table, so an unreadable one means
        // no request can be served.
        let ready = tokio::fs::metadata(&self.mount_table).await.is_ok();
        debug!(ready, "probe");
        Ok(ready)
    }

    async fn get_plugin_capabilities(&self) -> Result<Vec<PluginCapability>, CsiError> {
        Ok(vec![
            PluginCapability::VolumeAccessibilityConstraints,
            PluginCapability::OnlineVolumeExpansion,
        ])
    }
}

// ---------------------------------------------------------------------------
// CsiNode
// ---------------------------------------------------------------------------

#[async_trait]
impl CsiNode for BlockNodeBackend {
    #[instrument(
        skip(self, req),
        fields(volume_id = %req.volume_id, staging_target_path = %req.staging_target_path)
    )]
    async fn stage_volume(&self, req: NodeStageVolumeRequest) -> Result<(), CsiError> {
        const RPC: &str = "NodeStageVolume";
        require(!req.volume_id.is_empty(), RPC, "Volume ID")?;
        require(!req.staging_target_path.is_empty(), RPC, "Staging Target Path")?;
        let capability = req
            .volume_capability
            .ok_or_else(|| CsiError::invalid(format!("{RPC} Volume Capability must be provided")))?;

        let _guard = self.locks.acquire(&req.volume_id).await;

        let source = self.find_device(&req.volume_id).await?;

        let publish_context = require_publish_context(req.publish_context)?;
        let volume_name = publish_context
            .get(PUBLISH_INFO_VOLUME_NAME)
            .cloned()
            .ok_or_else(|| CsiError::invalid("Could not find the volume by name"))?;

        let luks = LuksContext::build(
            &req.volume_id,
            &req.secrets,
            &publish_context,
            VolumeLifecycle::NodeStageVolume,
        )?;

        if capability.is_block() {
            info!(%source, %volume_name, "raw block volume, nothing to stage");
            return Ok(());
        }

        let fs_type = capability.fs_type().to_owned();
        let options = capability.mount_flags().to_vec();
        let target = req.staging_target_path;
        info!(
            %source,
            %volume_name,
            %fs_type,
            ?options,
            luks_encrypted = luks.encryption_enabled(),
            "staging volume"
        );

        let formatted = {
            let (source, luks) = (source.clone(), luks.clone());
            self.with_mounter(move |m| m.is_formatted(&source, &luks))
                .await?
        };
        if formatted {
            info!(%source, "device already formatted");
        } else {
            info!(%source, %fs_type, "formatting device");
            let (source, fs_type, luks) = (source.clone(), fs_type.clone(), luks.clone());
            self.with_mounter(move |m| m.format(&source, &fs_type, &luks))
                .await?;
        }

        if self.is_mounted(&target).await? {
            info!(%target, "staging path already mounted");
        } else {
            info!(%source, %target, "mounting staging path");
            let target = target.clone();
            self.with_mounter(move |m| m.mount(&source, &target, &fs_type, &luks, &options))
                .await?;
        }

        info!(%target, "volume staged");
        Ok(())
    }

    #[instrument(
        skip(self, req),
        fields(volume_id = %req.volume_id, staging_target_path = %req.staging_target_path)
    )]
    async fn unstage_volume(&self, req: NodeUnstageVolumeRequest) -> Result<(), CsiError> {
        const RPC: &str = "NodeUnstageVolume";
        require(!req.volume_id.is_empty(), RPC, "Volume ID")?;
        require(!req.staging_target_path.is_empty(), RPC, "Staging Target Path")?;

        let _guard = self.locks.acquire(&req.volume_id).await;
        let luks = LuksContext::teardown(VolumeLifecycle::NodeUnstageVolume);
        self.ensure_unmounted(&req.staging_target_path, luks).await?;

        // A retry after a failed close finds the path unmounted; the mapping
        // is reconciled on its own.
        let volume_id = req.volume_id.clone();
        self.with_mounter(move |m| m.close_mapping(&volume_id)).await?;

        info!("volume unstaged");
        Ok(())
    }

    #[instrument(
        skip(self, req),
        fields(volume_id = %req.volume_id, target_path = %req.target_path)
    )]
    async fn publish_volume(&self, req: NodePublishVolumeRequest) -> Result<(), CsiError> {
        const RPC: &str = "NodePublishVolume";
        require(!req.volume_id.is_empty(), RPC, "Volume ID")?;
        require(!req.staging_target_path.is_empty(), RPC, "Staging Target Path")?;
        require(!req.target_path.is_empty(), RPC, "Target Path")?;
        let capability = req
            .volume_capability
            .ok_or_else(|| CsiError::invalid(format!("{RPC} Volume Capability must be provided")))?;
        let publish_context = require_publish_context(req.publish_context)?;

        let _guard = self.locks.acquire(&req.volume_id).await;

        let luks = LuksContext::build(
            &req.volume_id,
            &req.secrets,
            &publish_context,
            VolumeLifecycle::NodePublishVolume,
        )?;

        // A filesystem volume is published from its staging mount; a raw
        // block volume from the device node itself.
        let source = if capability.is_block() {
            self.find_device(&req.volume_id).await?
        } else {
            req.staging_target_path
        };
        let target = req.target_path;
        let fs_type = capability.fs_type().to_owned();
        let options = publish_mount_options(capability.mount_flags(), req.read_only);

        if self.is_mounted(&target).await? {
            info!(%target, "target already mounted");
            return Ok(());
        }

        info!(
            %source,
            %target,
            ?options,
            luks_encrypted = luks.encryption_enabled(),
            "bind mounting volume"
        );
        {
            let target = target.clone();
            self.with_mounter(move |m| m.mount(&source, &target, &fs_type, &luks, &options))
                .await?;
        }

        info!(%target, read_only = req.read_only, "volume published");
        Ok(())
    }

    #[instrument(
        skip(self, req),
        fields(volume_id = %req.volume_id, target_path = %req.target_path)
    )]
    async fn unpublish_volume(&self, req: NodeUnpublishVolumeRequest) -> Result<(), CsiError> {
        const RPC: &str = "NodeUnpublishVolume";
        require(!req.volume_id.is_empty(), RPC, "Volume ID")?;
        require(!req.target_path.is_empty(), RPC, "Target Path")?;

        let _guard = self.locks.acquire(&req.volume_id).await;
        let luks = LuksContext::teardown(VolumeLifecycle::NodeUnpublishVolume);
        self.ensure_unmounted(&req.target_path, luks).await?;

        info!("volume unpublished");
        Ok(())
    }

    async fn get_capabilities(&self) -> Result<Vec<NodeCapability>, CsiError> {
        let caps = vec![
            NodeCapability::StageUnstageVolume,
            NodeCapability::ExpandVolume,
        ];
        debug!(?caps, "node capabilities");
        Ok(caps)
    }

    async fn get_info(&self) -> Result<NodeInfo, CsiError> {
        Ok(NodeInfo {
            node_id: self.node_id.clone(),
            max_volumes: MAX_VOLUMES_PER_NODE,
            // Volumes cannot be attached across regions.
            accessible_topology: Some(Topology {
                segments: HashMap::from([(
                    TOPOLOGY_REGION_KEY.to_owned(),
                    self.region.clone(),
                )]),
            }),
        })
    }

    async fn get_volume_stats(
        &self,
        req: NodeGetVolumeStatsRequest,
    ) -> Result<VolumeStats, CsiError> {
        debug!(volume_id = %req.volume_id, "volume stats requested");
        Err(CsiError::Unimplemented(
            "NodeGetVolumeStats is not supported".to_owned(),
        ))
    }

    #[instrument(
        skip(self, req),
        fields(volume_id = %req.volume_id, volume_path = %req.volume_path)
    )]
    async fn expand_volume(&self, req: NodeExpandVolumeRequest) -> Result<(), CsiError> {
        if req.volume_id.is_empty() {
            return Err(CsiError::invalid("NodeExpandVolume volume ID not provided"));
        }
        if req.volume_path.is_empty() {
            return Err(CsiError::invalid("NodeExpandVolume volume path not provided"));
        }

        let _guard = self.locks.acquire(&req.volume_id).await;

        let device = {
            let path = req.volume_path.clone();
            self.with_mounter(move |m| m.device_for_mount(&path))
                .await
                .map_err(|e| {
                    CsiError::Internal(format!(
                        "NodeExpandVolume unable to get device path for {:?}: {e}",
                        req.volume_path
                    ))
                })?
        };

        info!(%device, required_bytes = ?req.required_bytes, "resizing volume");
        {
            let (device, path) = (device.clone(), req.volume_path.clone());
            self.with_mounter(move |m| m.resize(&device, &path))
                .await
                .map_err(|e| {
                    CsiError::Internal(format!(
                        "NodeExpandVolume could not resize volume {} ({:?}): {e}",
                        req.volume_id, req.volume_path
                    ))
                })?;
        }

        info!(%device, "volume resized");
        Ok(())
    }
}
