//! `cryptsetup` wrapper for the LUKS layer under staged volumes.
//!
//! Passphrases are handed over on stdin (`--key-file -`). Mapping state is
//! always asked from the kernel; nothing here is cached.
//!
//! Mappings are opened with `--disable-keyring`: the volume key then lives in
//! the dm-crypt table instead of the kernel keyring, and `cryptsetup resize`
//! can grow an open LUKS2 mapping without a passphrase.

use std::path::Path;

use tracing::{debug, info};

use crate::command::{CommandRunner, Output};
use crate::error::CsiError;
use crate::luks::LuksParams;

const DEV_MAPPER: &str = "/dev/mapper";
const SYS_BLOCK: &str = "/sys/block";

/// Kernel view of a named mapping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum MappingStatus {
    Inactive,
    Active {
        /// Backing device as reported by `cryptsetup status`.
        device: Option<String>,
        /// Whether the mapping is a LUKS crypt target.
        luks: bool,
    },
}

#[derive(Debug, Clone)]
pub(crate) struct Cryptsetup {
    binary: String,
    runner: CommandRunner,
}

impl Cryptsetup {
    pub fn new(binary: impl Into<String>, runner: CommandRunner) -> Self {
        Self {
            binary: binary.into(),
            runner,
        }
    }

    /// Whether `device` carries a LUKS header.
    pub fn is_luks(&self, device: &str) -> Result<bool, CsiError> {
        let out = self.run(&["isLuks", device], None)?;
        match out.status {
            0 => Ok(true),
            1 => Ok(false),
            _ => Err(CsiError::encryption(format!(
                "cryptsetup isLuks {device}: {}",
                out.diagnostic()
            ))),
        }
    }

    pub fn status(&self, name: &str) -> Result<MappingStatus, CsiError> {
        let out = self.run(&["status", name], None)?;
        classify_status(name, &out)
    }

    /// Write a LUKS header to `device`.
    pub fn luks_format(&self, device: &str, params: &LuksParams) -> Result<(), CsiError> {
        let passphrase = params.require_passphrase()?;
        info!(
            device,
            cipher = params.cipher(),
            key_size = params.key_size(),
            "creating LUKS header"
        );
        let out = self.run(
            &[
                "luksFormat",
                "--batch-mode",
                "--cipher",
                params.cipher(),
                "--key-size",
                params.key_size(),
                "--key-file",
                "-",
                device,
            ],
            Some(passphrase),
        )?;
        if out.success() {
            Ok(())
        } else {
            Err(CsiError::encryption(format!(
                "cryptsetup luksFormat {device}: {}",
                out.diagnostic()
            )))
        }
    }

    /// Open `device` as the mapping named in `params` and return the mapped
    /// device path. An already-open mapping over the same device is reused;
    /// one over a different device is reported as stale.
    pub fn open(&self, device: &str, params: &LuksParams) -> Result<String, CsiError> {
        let name = params.mapping_name();
        let mapped = mapped_path(name);

        match self.status(name)? {
            MappingStatus::Active {
                device: Some(backing),
                ..
            } if !same_device(&backing, device) => {
                return Err(CsiError::encryption(format!(
                    "stale mapping {name} is backed by {backing}, expected {device}"
                )));
            }
            MappingStatus::Active { .. } => {
                debug!(name, device, "LUKS mapping already open");
                return Ok(mapped);
            }
            MappingStatus::Inactive => {}
        }

        let passphrase = params.require_passphrase()?;
        let out = self.run(
            &[
                "open",
                "--disable-keyring",
                "--type",
                "luks",
                "--key-file",
                "-",
                device,
                name,
            ],
            Some(passphrase),
        )?;
        if !out.success() {
            return Err(CsiError::encryption(format!(
                "cryptsetup open {device} as {name}: {}",
                out.diagnostic()
            )));
        }
        info!(name, device, "LUKS mapping opened");
        Ok(mapped)
    }

    /// Close a mapping; closing one that is already gone succeeds.
    pub fn close(&self, name: &str) -> Result<(), CsiError> {
        let out = self.run(&["close", name], None)?;
        if out.success() || reports_missing(&out) {
            info!(name, "LUKS mapping closed");
            return Ok(());
        }
        Err(CsiError::encryption(format!(
            "cryptsetup close {name}: {}",
            out.diagnostic()
        )))
    }

    /// Grow an open mapping to the size of its backing device. Needs no key
    /// for mappings opened by [`Self::open`].
    pub fn resize(&self, name: &str) -> Result<(), CsiError> {
        let out = self.run(&["resize", name], None)?;
        if out.success() {
            Ok(())
        } else {
            Err(CsiError::encryption(format!(
                "cryptsetup resize {name}: {}",
                out.diagnostic()
            )))
        }
    }

    /// If `device` is an active LUKS mapping named with `prefix`, return its
    /// name. Used on teardown, where only the mounted device is known.
    pub fn luks_mapping_of(&self, device: &str, prefix: &str) -> Result<Option<String>, CsiError> {
        let Some(name) = dm_name_of(device) else {
            return Ok(None);
        };
        if !name.starts_with(prefix) {
            return Ok(None);
        }
        match self.status(&name)? {
            MappingStatus::Active { luks: true, .. } => Ok(Some(name)),
            _ => Ok(None),
        }
    }

    fn run(&self, args: &[&str], input: Option<&[u8]>) -> Result<Output, CsiError> {
        self.runner.run(&self.binary, args, input)
    }
}

pub(crate) fn mapped_path(name: &str) -> String {
    format!("{DEV_MAPPER}/{name}")
}

/// Device-mapper name for `/dev/mapper/<name>` or `/dev/dm-N` paths.
fn dm_name_of(device: &str) -> Option<String> {
    if let Some(name) = device.strip_prefix(&format!("{DEV_MAPPER}/")) {
        return Some(name.to_owned());
    }
    let canonical = std::fs::canonicalize(device).ok()?;
    let node = canonical.file_name()?.to_str()?;
    if !node.starts_with("dm-") {
        return None;
    }
    let name = std::fs::read_to_string(Path::new(SYS_BLOCK).join(node).join("dm/name")).ok()?;
    Some(name.trim().to_owned())
}

fn same_device(a: &str, b: &str) -> bool {
    if a == b {
        return true;
    }
    match (std::fs::canonicalize(a), std::fs::canonicalize(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

fn reports_missing(out: &Output) -> bool {
    let text = out.diagnostic().to_ascii_lowercase();
    text.contains("does not exist") || text.contains("doesn't exist") || text.contains("not active")
}

/// Interpret `cryptsetup status` output.
///
/// Exit 0 lists `key: value` lines (`type:`, `device:`); exit 4 or a
/// "not active" message means the mapping is absent.
fn classify_status(name: &str, out: &Output) -> Result<MappingStatus, CsiError> {
    if out.success() {
        let mut device = None;
        let mut luks = false;
        for line in out.stdout.lines() {
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            match key.trim() {
                "type" => luks = value.trim().starts_with("LUKS"),
                "device" => device = Some(value.trim().to_owned()),
                _ => {}
            }
        }
        return Ok(MappingStatus::Active { device, luks });
    }
    let text = out.diagnostic().to_ascii_lowercase();
    if out.status == 4 || text.contains("is inactive") || reports_missing(out) {
        return Ok(MappingStatus::Inactive);
    }
    Err(CsiError::encryption(format!(
        "cryptsetup status {name}: {}",
        out.diagnostic()
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn output(status: i32, stdout: &str, stderr: &str) -> Output {
        Output {
            stdout: stdout.to_owned(),
            stderr: stderr.to_owned(),
            status,
        }
    }

    #[test]
    fn active_luks_status_is_parsed() {
        let out = output(
            0,
            "/dev/mapper/csi-luks-v1 is active and is in use.\n  type:    LUKS2\n  cipher:  aes-xts-plain64\n  device:  /dev/vdb\n  mode:    read/write\n",
            "",
        );
        assert_eq!(
            classify_status("csi-luks-v1", &out).unwrap(),
            MappingStatus::Active {
                device: Some("/dev/vdb".into()),
                luks: true
            }
        );
    }

    #[test]
    fn non_luks_mapping_is_not_luks() {
        let out = output(0, "/dev/mapper/vg-lv is active.\n  type:    n/a\n", "");
        assert_eq!(
            classify_status("vg-lv", &out).unwrap(),
            MappingStatus::Active {
                device: None,
                luks: false
            }
        );
    }

    #[test]
    fn inactive_status_by_exit_code_or_message() {
        let by_code = output(4, "/dev/mapper/x is inactive.\n", "");
        assert_eq!(classify_status("x", &by_code).unwrap(), MappingStatus::Inactive);
        let by_text = output(1, "", "Device x does not exist.");
        assert_eq!(classify_status("x", &by_text).unwrap(), MappingStatus::Inactive);
    }

    #[test]
    fn unexpected_status_failure_is_error() {
        let out = output(5, "", "Permission denied");
        let err = classify_status("x", &out).unwrap_err();
        assert!(err.to_string().contains("Permission denied"));
    }

    #[test]
    fn dev_mapper_paths_map_to_names() {
        assert_eq!(
            dm_name_of("/dev/mapper/csi-luks-v1").as_deref(),
            Some("csi-luks-v1")
        );
        assert_eq!(dm_name_of("/nonexistent/vdb"), None);
    }

    #[test]
    fn identical_paths_are_same_device() {
        assert!(same_device("/dev/vdb", "/dev/vdb"));
        assert!(!same_device("/nonexistent/a", "/nonexistent/b"));
    }
}
