//! # libcsi: CSI node plugin for attached block volumes
//!
//! `libcsi` implements the node half of a [Container Storage Interface][csi]
//! plugin for block volumes that a cloud controller attaches to the machine
//! as virtio disks. It finds the device, formats it once (optionally under
//! LUKS), mounts it at a staging path and bind-mounts it into workloads,
//! then reverses each step on teardown. Requests travel over QUIC (via
//! [`quinn`]) instead of gRPC and follow the RK8s conventions (Tokio async
//! runtime, `tracing` for observability, `thiserror` for structured errors).
//!
//! ## Module overview
//!
//! | Module | Purpose |
//! |---|---|
//! | [`types`] | Core data model: `VolumeId`, capabilities, node requests. |
//! | [`error`] | [`CsiError`] enum covering all failure modes. |
//! | [`device`] | [`DeviceResolver`]: locate an attached disk by serial. |
//! | [`luks`] | [`LuksContext`]: per-call encryption parameters. |
//! | [`mounter`] | [`Mounter`]: format, mount, unmount and resize primitives. |
//! | [`lock`] | [`VolumeLocks`]: per-volume serialization of calls. |
//! | [`message`] | [`CsiMessage`] protocol envelope for QUIC transport. |
//! | [`identity`] | [`CsiIdentity`] trait: plugin discovery & health. |
//! | [`node`] | [`CsiNode`] trait: stage, publish, expand and friends. |
//! | [`transport`] | QUIC client/server built on `quinn`. |
//! | [`backend`] | [`BlockNodeBackend`], the node service itself. |
//!
//! [csi]: https://github.com/container-storage-interface/spec

pub mod backend;
mod command;
pub mod device;
pub mod error;
pub mod identity;
pub mod lock;
pub mod luks;
pub mod message;
pub mod mounter;
pub mod node;
pub mod transport;
pub mod types;

// Re-export the most commonly used items at crate root for convenience.
pub use backend::BlockNodeBackend;
pub use device::{DeviceResolver, ResolverConfig, UdevDeviceResolver};
pub use error::{CsiError, ErrorCode};
pub use identity::CsiIdentity;
pub use lock::VolumeLocks;
pub use luks::{LuksContext, VolumeLifecycle};
pub use message::CsiMessage;
pub use mounter::{Mounter, MounterConfig, SystemMounter};
pub use node::CsiNode;
pub use types::*;
