//! CSI protocol messages transmitted over QUIC.
//!
//! [`CsiMessage`] is the top-level envelope for all request and response
//! variants exchanged between the orchestrator (client side) and the node
//! plugin (server side) via QUIC bi-directional streams.

use serde::{Deserialize, Serialize};

use crate::error::CsiError;
use crate::types::*;

/// Top-level message envelope for CSI over QUIC.
///
/// Each QUIC bi-stream carries exactly one request followed by one response.
/// The client sends a *request* variant and the server replies with the
/// corresponding *response* variant (or [`CsiMessage::Error`]).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum CsiMessage {
    // ----- Requests --------------------------------------------------------
    /// Format and mount a volume at its staging path (Node).
    StageVolume(NodeStageVolumeRequest),
    /// Unmount a staged volume (Node).
    UnstageVolume(NodeUnstageVolumeRequest),
    /// Bind-mount a staged volume into a workload (Node).
    PublishVolume(NodePublishVolumeRequest),
    /// Remove a workload bind mount (Node).
    UnpublishVolume(NodeUnpublishVolumeRequest),
    /// Query optional node RPCs (Node).
    GetNodeCapabilities,
    /// Query node info (Node).
    GetNodeInfo,
    /// Query volume usage (Node).
    GetVolumeStats(NodeGetVolumeStatsRequest),
    /// Grow a mounted filesystem (Node).
    ExpandVolume(NodeExpandVolumeRequest),

    /// Health probe (Identity).
    Probe,
    /// Query plugin info (Identity).
    GetPluginInfo,
    /// Query plugin capabilities (Identity).
    GetPluginCapabilities,

    // ----- Responses -------------------------------------------------------
    /// Node capabilities.
    NodeCapabilitiesResponse(Vec<NodeCapability>),
    /// Node information.
    NodeInfoResponse(NodeInfo),
    /// Volume usage.
    VolumeStatsResponse(VolumeStats),
    /// Plugin information.
    PluginInfoResponse(PluginInfo),
    /// Plugin capabilities.
    PluginCapabilitiesResponse(Vec<PluginCapability>),

    /// Generic success acknowledgement (no payload).
    Ok,
    /// Probe result.
    ProbeResult(bool),
    /// An error occurred.
    Error(CsiError),
}

impl CsiMessage {
    /// Whether this variant is sent by the client.
    pub fn is_request(&self) -> bool {
        matches!(
            self,
            Self::StageVolume(_)
                | Self::UnstageVolume(_)
                | Self::PublishVolume(_)
                | Self::UnpublishVolume(_)
                | Self::GetNodeCapabilities
                | Self::GetNodeInfo
                | Self::GetVolumeStats(_)
                | Self::ExpandVolume(_)
                | Self::Probe
                | Self::GetPluginInfo
                | Self::GetPluginCapabilities
        )
    }
}

impl std::fmt::Display for CsiMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::StageVolume(req) => write!(f, "StageVolume({})", req.volume_id),
            Self::UnstageVolume(req) => write!(f, "UnstageVolume({})", req.volume_id),
            Self::PublishVolume(req) => write!(f, "PublishVolume({})", req.volume_id),
            Self::UnpublishVolume(req) => write!(f, "UnpublishVolume({})", req.volume_id),
            Self::GetNodeCapabilities => f.write_str("GetNodeCapabilities"),
            Self::GetNodeInfo => f.write_str("GetNodeInfo"),
            Self::GetVolumeStats(req) => write!(f, "GetVolumeStats({})", req.volume_id),
            Self::ExpandVolume(req) => write!(f, "ExpandVolume({})", req.volume_id),
            Self::Probe => f.write_str("Probe"),
            Self::GetPluginInfo => f.write_str("GetPluginInfo"),
            Self::GetPluginCapabilities => f.write_str("GetPluginCapabilities"),
            Self::NodeCapabilitiesResponse(caps) => {
                write!(f, "NodeCapabilities(count={})", caps.len())
            }
            Self::NodeInfoResponse(info) => write!(f, "NodeInfo({})", info.node_id),
            Self::VolumeStatsResponse(stats) => {
                write!(f, "VolumeStats(used={})", stats.used_bytes)
            }
            Self::PluginInfoResponse(info) => {
                write!(f, "PluginInfo(name={})", info.name)
            }
            Self::PluginCapabilitiesResponse(caps) => {
                write!(f, "PluginCapabilities(count={})", caps.len())
            }
            Self::Ok => f.write_str("Ok"),
            Self::ProbeResult(ok) => write!(f, "ProbeResult({})", ok),
            Self::Error(e) => write!(f, "Error({})", e),
        }
    }
}
