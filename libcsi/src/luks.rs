//! Encryption context for LUKS-backed volumes.
//!
//! A [`LuksContext`] is built fresh for every RPC from the request's secrets
//! and publish context. It never outlives the call. Teardown phases receive
//! no secrets, so their context carries only the [`VolumeLifecycle`] tag and
//! the mounter finds any open mapping from the mounted device or from
//! [`mapping_name`].

use std::collections::HashMap;
use std::fmt;

use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use crate::error::CsiError;
use crate::types::{Secrets, VolumeId};

/// Publish-context key; `"true"` marks the volume as LUKS encrypted.
pub const LUKS_ENCRYPTED_ATTRIBUTE: &str = "luks_encrypted";
/// Publish-context key for the `cryptsetup` cipher.
pub const LUKS_CIPHER_ATTRIBUTE: &str = "luks_cipher";
/// Publish-context key for the key size in bits.
pub const LUKS_KEY_SIZE_ATTRIBUTE: &str = "luks_key_size";
/// Secrets key holding the passphrase.
pub const LUKS_KEY_ATTRIBUTE: &str = "luks_key";

pub const DEFAULT_LUKS_CIPHER: &str = "aes-xts-plain64";
pub const DEFAULT_LUKS_KEY_SIZE: &str = "512";

/// Prefix of every mapping name this plugin creates.
pub const MAPPING_PREFIX: &str = "csi-luks-";

/// Longest name device-mapper accepts (`DM_NAME_LEN` minus the NUL).
const MAX_MAPPING_NAME_LEN: usize = 127;

/// Digest bytes appended to names that had to be rewritten.
const MAPPING_DIGEST_BYTES: usize = 8;

/// The RPC a context was built for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VolumeLifecycle {
    NodeStageVolume,
    NodePublishVolume,
    NodeUnstageVolume,
    NodeUnpublishVolume,
}

impl fmt::Display for VolumeLifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::NodeStageVolume => "node_stage_volume",
            Self::NodePublishVolume => "node_publish_volume",
            Self::NodeUnstageVolume => "node_unstage_volume",
            Self::NodeUnpublishVolume => "node_unpublish_volume",
        })
    }
}

/// Parameters needed to create and open a LUKS mapping.
#[derive(Clone)]
pub struct LuksParams {
    mapping_name: String,
    cipher: String,
    key_size: String,
    passphrase: Option<Zeroizing<String>>,
}

impl LuksParams {
    /// Device-mapper name of the decrypted view.
    pub fn mapping_name(&self) -> &str {
        &self.mapping_name
    }

    pub fn cipher(&self) -> &str {
        &self.cipher
    }

    pub fn key_size(&self) -> &str {
        &self.key_size
    }

    /// Passphrase bytes, if the request carried one.
    pub fn passphrase(&self) -> Option<&[u8]> {
        self.passphrase.as_ref().map(|p| p.as_bytes())
    }

    /// Passphrase or an error naming the mapping that needed it.
    pub fn require_passphrase(&self) -> Result<&[u8], CsiError> {
        self.passphrase().ok_or_else(|| {
            CsiError::encryption(format!(
                "no passphrase available to open mapping {}",
                self.mapping_name
            ))
        })
    }
}

impl fmt::Debug for LuksParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LuksParams")
            .field("mapping_name", &self.mapping_name)
            .field("cipher", &self.cipher)
            .field("key_size", &self.key_size)
            .field(
                "passphrase",
                &self.passphrase.as_ref().map(|_| "<redacted>"),
            )
            .finish()
    }
}

/// Per-call encryption context.
///
/// `params` is the single injection point for encryption: when it is `Some`
/// and the phase is staging, the mounter formats and mounts the decrypted
/// mapping instead of the raw device.
#[derive(Debug, Clone)]
pub struct LuksContext {
    lifecycle: VolumeLifecycle,
    params: Option<LuksParams>,
}

impl LuksContext {
    /// Build the context for a stage or publish call.
    ///
    /// Encryption is enabled when the publish context says so. Staging an
    /// encrypted volume without a passphrase fails here, before any device is
    /// touched, so the raw device is never formatted by mistake.
    pub fn build(
        volume_id: &VolumeId,
        secrets: &Secrets,
        publish_context: &HashMap<String, String>,
        lifecycle: VolumeLifecycle,
    ) -> Result<Self, CsiError> {
        let encrypted = publish_context
            .get(LUKS_ENCRYPTED_ATTRIBUTE)
            .is_some_and(|v| v == "true");
        if !encrypted {
            return Ok(Self {
                lifecycle,
                params: None,
            });
        }

        let passphrase = secrets
            .get(LUKS_KEY_ATTRIBUTE)
            .filter(|k| !k.is_empty())
            .map(|k| Zeroizing::new(k.to_owned()));
        if passphrase.is_none() && lifecycle == VolumeLifecycle::NodeStageVolume {
            return Err(CsiError::invalid(format!(
                "volume {volume_id} is marked {LUKS_ENCRYPTED_ATTRIBUTE}=true but secret \
                 {LUKS_KEY_ATTRIBUTE} is missing"
            )));
        }

        let attr = |key: &str, default: &str| {
            publish_context
                .get(key)
                .filter(|v| !v.is_empty())
                .cloned()
                .unwrap_or_else(|| default.to_owned())
        };

        Ok(Self {
            lifecycle,
            params: Some(LuksParams {
                mapping_name: mapping_name(volume_id),
                cipher: attr(LUKS_CIPHER_ATTRIBUTE, DEFAULT_LUKS_CIPHER),
                key_size: attr(LUKS_KEY_SIZE_ATTRIBUTE, DEFAULT_LUKS_KEY_SIZE),
                passphrase,
            }),
        })
    }

    /// Context for unstage/unpublish, which never see secrets.
    pub fn teardown(lifecycle: VolumeLifecycle) -> Self {
        Self {
            lifecycle,
            params: None,
        }
    }

    pub fn lifecycle(&self) -> VolumeLifecycle {
        self.lifecycle
    }

    pub fn encryption_enabled(&self) -> bool {
        self.params.is_some()
    }

    pub fn params(&self) -> Option<&LuksParams> {
        self.params.as_ref()
    }

    /// Parameters to apply to the device, present only while staging an
    /// encrypted volume. Publish is a bind mount of the staged filesystem
    /// and never touches the mapping.
    pub fn device_transform(&self) -> Option<&LuksParams> {
        match self.lifecycle {
            VolumeLifecycle::NodeStageVolume => self.params.as_ref(),
            _ => None,
        }
    }

    /// Whether an unmount in this phase releases the last user of a mapping.
    pub fn closes_mapping(&self) -> bool {
        self.lifecycle == VolumeLifecycle::NodeUnstageVolume
    }
}

/// Device-mapper name for a volume's decrypted view.
///
/// Derived from the volume id alone so every phase agrees on it. Ids made
/// of `[A-Za-z0-9._-]` that fit are used verbatim. Otherwise the rejected
/// characters become `_`, the name is cut to fit and a digest of the raw id
/// is appended, so two ids never share a mapping.
pub fn mapping_name(volume_id: &VolumeId) -> String {
    let raw = volume_id.as_str();
    let sanitized: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if sanitized == raw && MAPPING_PREFIX.len() + raw.len() <= MAX_MAPPING_NAME_LEN {
        return format!("{MAPPING_PREFIX}{raw}");
    }

    let digest = hex::encode(&Sha256::digest(raw.as_bytes())[..MAPPING_DIGEST_BYTES]);
    let room = MAX_MAPPING_NAME_LEN - MAPPING_PREFIX.len() - 1 - digest.len();
    // `sanitized` is ASCII, so any byte index is a char boundary.
    let stem = &sanitized[..sanitized.len().min(room)];
    format!("{MAPPING_PREFIX}{stem}-{digest}")
}
