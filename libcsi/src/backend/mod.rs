//! Node backend implementations.
//!
//! A backend is a concrete type that implements [`CsiIdentity`] and
//! [`CsiNode`] on top of a [`DeviceResolver`] and a [`Mounter`].
//!
//! [`CsiIdentity`]: crate::identity::CsiIdentity
//! [`CsiNode`]: crate::node::CsiNode
//! [`DeviceResolver`]: crate::device::DeviceResolver
//! [`Mounter`]: crate::mounter::Mounter

pub mod block;

#[cfg(test)]
pub(crate) mod testing;

pub use block::BlockNodeBackend;
