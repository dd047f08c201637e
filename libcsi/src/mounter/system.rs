//! Host implementation of [`Mounter`]: `blkid`, `mkfs.*`, `mount(2)`,
//! `cryptsetup` and the filesystem grow tools.

use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use nix::mount::MsFlags;
use tracing::{debug, info, instrument};

use super::cryptsetup::{Cryptsetup, MappingStatus, mapped_path};
use super::mount_table::{MountTable, PROC_MOUNTS};
use super::{MountOptions, Mounter};
use crate::command::{CommandRunner, Output};
use crate::error::CsiError;
use crate::luks::{LuksContext, MAPPING_PREFIX, mapping_name};
use crate::types::VolumeId;

/// Tool locations and limits for [`SystemMounter`].
#[derive(Debug, Clone)]
pub struct MounterConfig {
    pub cryptsetup: String,
    pub blkid: String,
    /// `mkfs` program prefix; the filesystem type is appended.
    pub mkfs_prefix: String,
    /// Mount table consulted by the idempotency checks.
    pub mount_table: PathBuf,
    /// Upper bound for each tool invocation; `mkfs` on large disks is slow.
    pub command_timeout: Duration,
}

impl Default for MounterConfig {
    fn default() -> Self {
        Self {
            cryptsetup: "cryptsetup".to_owned(),
            blkid: "blkid".to_owned(),
            mkfs_prefix: "mkfs.".to_owned(),
            mount_table: PathBuf::from(PROC_MOUNTS),
            command_timeout: Duration::from_secs(300),
        }
    }
}

/// [`Mounter`] acting on the local host.
#[derive(Debug, Clone)]
pub struct SystemMounter {
    config: MounterConfig,
    runner: CommandRunner,
    cryptsetup: Cryptsetup,
}

impl SystemMounter {
    pub fn new(config: MounterConfig) -> Self {
        let runner = CommandRunner::new(config.command_timeout);
        let cryptsetup = Cryptsetup::new(config.cryptsetup.clone(), runner.clone());
        Self {
            config,
            runner,
            cryptsetup,
        }
    }

    fn mount_table(&self) -> Result<MountTable, CsiError> {
        MountTable::read_from(&self.config.mount_table)
    }

    /// Filesystem type recorded on `device`, `None` when there is none.
    fn probe_fs_type(&self, device: &str) -> Result<Option<String>, CsiError> {
        let out = self.runner.run(
            &self.config.blkid,
            &["-p", "-s", "TYPE", "-o", "value", device],
            None,
        )?;
        classify_blkid(device, &out)
    }

    /// Device to format or mount: the LUKS mapping while staging an
    /// encrypted volume, otherwise `source` itself.
    fn effective_source(&self, source: &str, luks: &LuksContext) -> Result<String, CsiError> {
        match luks.device_transform() {
            Some(params) => self.cryptsetup.open(source, params),
            None => Ok(source.to_owned()),
        }
    }

    /// Mapping to close after unmounting `target`. Only staging mounts own
    /// a mapping; publish mounts are binds of the staging path.
    fn mapping_to_close(
        &self,
        target: &str,
        luks: &LuksContext,
    ) -> Result<Option<String>, CsiError> {
        if !luks.closes_mapping() {
            return Ok(None);
        }
        let table = self.mount_table()?;
        let Some(source) = table.source_of(target) else {
            return Ok(None);
        };
        self.cryptsetup.luks_mapping_of(source, MAPPING_PREFIX)
    }
}

impl Mounter for SystemMounter {
    fn is_formatted(&self, source: &str, luks: &LuksContext) -> Result<bool, CsiError> {
        if luks.device_transform().is_some() && !self.cryptsetup.is_luks(source)? {
            return Ok(false);
        }
        let device = self.effective_source(source, luks)?;
        Ok(self.probe_fs_type(&device)?.is_some())
    }

    #[instrument(skip(self, luks), fields(luks_encrypted = luks.encryption_enabled()))]
    fn format(&self, source: &str, fs_type: &str, luks: &LuksContext) -> Result<(), CsiError> {
        if let Some(params) = luks.device_transform()
            && !self.cryptsetup.is_luks(source)?
        {
            self.cryptsetup.luks_format(source, params)?;
        }
        let device = self.effective_source(source, luks)?;

        let program = format!("{}{fs_type}", self.config.mkfs_prefix);
        let mut args: Vec<&str> = mkfs_args(fs_type);
        args.push(device.as_str());
        info!(%device, fs_type, "creating filesystem");
        self.runner
            .run_checked(&program, &args, None, |reason| CsiError::FormatFailed {
                device: device.clone(),
                fs_type: fs_type.to_owned(),
                reason,
            })?;
        Ok(())
    }

    fn is_mounted(&self, target: &str) -> Result<bool, CsiError> {
        Ok(self.mount_table()?.is_mounted(target))
    }

    #[instrument(skip(self, luks), fields(luks_encrypted = luks.encryption_enabled()))]
    fn mount(
        &self,
        source: &str,
        target: &str,
        fs_type: &str,
        luks: &LuksContext,
        options: &[String],
    ) -> Result<(), CsiError> {
        let source = self.effective_source(source, luks)?;
        let opts = MountOptions::parse(options);
        prepare_target(&source, target, opts.is_bind())?;

        let fs_type = (!opts.is_bind()).then_some(fs_type);
        let data = opts.data();
        nix::mount::mount(
            Some(source.as_str()),
            target,
            fs_type,
            opts.flags,
            data.as_deref(),
        )
        .map_err(|e| CsiError::MountFailed {
            path: target.to_owned(),
            reason: format!("mount {source}: {e}"),
        })?;

        // The kernel ignores MS_RDONLY on the initial bind; a remount is
        // needed to enforce read-only access.
        if opts.is_bind() && opts.is_read_only() {
            nix::mount::mount(
                None::<&str>,
                target,
                None::<&str>,
                MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY,
                None::<&str>,
            )
            .map_err(|e| CsiError::MountFailed {
                path: target.to_owned(),
                reason: format!("remount read-only: {e}"),
            })?;
        }

        info!(%source, target, ?options, "mounted");
        Ok(())
    }

    #[instrument(skip(self, luks), fields(lifecycle = %luks.lifecycle()))]
    fn unmount(&self, target: &str, luks: &LuksContext) -> Result<(), CsiError> {
        // Look up the mapping before it disappears from the mount table.
        let mapping = self.mapping_to_close(target, luks)?;

        nix::mount::umount(target).map_err(|e| CsiError::UnmountFailed {
            path: target.to_owned(),
            reason: e.to_string(),
        })?;
        info!(target, "unmounted");

        if let Some(name) = mapping {
            self.cryptsetup.close(&name)?;
        }
        Ok(())
    }

    fn close_mapping(&self, volume_id: &VolumeId) -> Result<(), CsiError> {
        let name = mapping_name(volume_id);
        if !matches!(
            self.cryptsetup.status(&name)?,
            MappingStatus::Active { luks: true, .. }
        ) {
            return Ok(());
        }
        if self.mount_table()?.has_source(&mapped_path(&name)) {
            debug!(%name, "LUKS mapping still mounted, leaving it open");
            return Ok(());
        }
        info!(%name, "closing leftover LUKS mapping");
        self.cryptsetup.close(&name)
    }

    fn device_for_mount(&self, target: &str) -> Result<String, CsiError> {
        self.mount_table()?
            .source_of(target)
            .map(str::to_owned)
            .ok_or_else(|| CsiError::Internal(format!("no mount found at {target}")))
    }

    #[instrument(skip(self))]
    fn resize(&self, device: &str, target: &str) -> Result<(), CsiError> {
        let resize_failed = |reason: String| CsiError::ResizeFailed {
            path: target.to_owned(),
            reason,
        };

        if let Some(name) = self.cryptsetup.luks_mapping_of(device, MAPPING_PREFIX)? {
            debug!(%name, "growing LUKS mapping");
            self.cryptsetup.resize(&name)?;
        }

        let fs_type = self
            .probe_fs_type(device)?
            .ok_or_else(|| resize_failed(format!("no filesystem found on {device}")))?;

        let (program, args): (&str, Vec<&str>) = match fs_type.as_str() {
            "ext2" | "ext3" | "ext4" => ("resize2fs", vec![device]),
            "xfs" => ("xfs_growfs", vec![target]),
            "btrfs" => ("btrfs", vec!["filesystem", "resize", "max", target]),
            other => {
                return Err(resize_failed(format!(
                    "filesystem {other} on {device} cannot be grown online"
                )));
            }
        };
        info!(device, target, %fs_type, program, "growing filesystem");
        self.runner.run_checked(program, &args, None, resize_failed)?;
        Ok(())
    }
}

/// Extra `mkfs.<fs>` arguments that keep it non-interactive.
fn mkfs_args(fs_type: &str) -> Vec<&'static str> {
    match fs_type {
        "ext2" | "ext3" | "ext4" => vec!["-F", "-m0"],
        "xfs" | "btrfs" => vec!["-f"],
        _ => Vec::new(),
    }
}

/// `blkid -p` exits 2 when it finds no signature at all.
fn classify_blkid(device: &str, out: &Output) -> Result<Option<String>, CsiError> {
    match out.status {
        0 => {
            let fs_type = out.stdout.trim();
            Ok((!fs_type.is_empty()).then(|| fs_type.to_owned()))
        }
        2 => Ok(None),
        _ => Err(CsiError::Internal(format!(
            "blkid {device}: {}",
            out.diagnostic()
        ))),
    }
}

/// Create the mount point. A bind mount of a device node needs a file to
/// land on; everything else mounts onto a directory.
fn prepare_target(source: &str, target: &str, bind: bool) -> Result<(), CsiError> {
    let mount_failed = |e: std::io::Error| CsiError::MountFailed {
        path: target.to_owned(),
        reason: e.to_string(),
    };

    let source_is_device = bind
        && std::fs::metadata(source)
            .map(|m| m.file_type().is_block_device())
            .unwrap_or(false);

    if source_is_device {
        if let Some(parent) = Path::new(target).parent() {
            std::fs::create_dir_all(parent).map_err(mount_failed)?;
        }
        std::fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(target)
            .map_err(mount_failed)?;
    } else {
        std::fs::create_dir_all(target).map_err(mount_failed)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::os::unix::fs::PermissionsExt;

    use super::*;
    use crate::luks::{LUKS_ENCRYPTED_ATTRIBUTE, LUKS_KEY_ATTRIBUTE, VolumeLifecycle};
    use crate::types::Secrets;

    fn output(status: i32, stdout: &str) -> Output {
        Output {
            stdout: stdout.to_owned(),
            stderr: String::new(),
            status,
        }
    }

    fn mounter_with_table(contents: &str) -> (tempfile::TempDir, SystemMounter) {
        let tmp = tempfile::tempdir().unwrap();
        let table = tmp.path().join("mounts");
        std::fs::write(&table, contents).unwrap();
        let mounter = SystemMounter::new(MounterConfig {
            mount_table: table,
            ..Default::default()
        });
        (tmp, mounter)
    }

    #[test]
    fn blkid_signature_detection() {
        assert_eq!(
            classify_blkid("/dev/vdb", &output(0, "ext4\n")).unwrap(),
            Some("ext4".to_owned())
        );
        assert_eq!(classify_blkid("/dev/vdb", &output(2, "")).unwrap(), None);
        assert!(classify_blkid("/dev/vdb", &output(4, "")).is_err());
    }

    #[test]
    fn mkfs_is_forced_for_known_filesystems() {
        assert_eq!(mkfs_args("ext4"), vec!["-F", "-m0"]);
        assert_eq!(mkfs_args("xfs"), vec!["-f"]);
        assert!(mkfs_args("vfat").is_empty());
    }

    #[test]
    fn mount_state_comes_from_the_mount_table() {
        let (_tmp, mounter) = mounter_with_table("/dev/vdb /staging/v1 ext4 rw 0 0\n");
        assert!(mounter.is_mounted("/staging/v1").unwrap());
        assert!(!mounter.is_mounted("/target/v1").unwrap());
        assert_eq!(mounter.device_for_mount("/staging/v1").unwrap(), "/dev/vdb");
    }

    #[test]
    fn device_for_unmounted_path_is_internal_error() {
        let (_tmp, mounter) = mounter_with_table("");
        let err = mounter.device_for_mount("/nowhere").unwrap_err();
        assert!(matches!(err, CsiError::Internal(_)));
        assert!(err.to_string().contains("/nowhere"));
    }

    #[test]
    fn unreadable_mount_table_is_error() {
        let mounter = SystemMounter::new(MounterConfig {
            mount_table: PathBuf::from("/nonexistent/mounts"),
            ..Default::default()
        });
        assert!(mounter.is_mounted("/x").is_err());
    }

    #[test]
    fn plain_context_uses_source_as_is() {
        let (_tmp, mounter) = mounter_with_table("");
        let ctx = LuksContext::teardown(VolumeLifecycle::NodeUnpublishVolume);
        assert_eq!(mounter.effective_source("/dev/vdb", &ctx).unwrap(), "/dev/vdb");
    }

    #[test]
    fn directory_target_is_created() {
        let tmp = tempfile::tempdir().unwrap();
        let target = tmp.path().join("a/b/staging");
        prepare_target("/dev/vdb", target.to_str().unwrap(), false).unwrap();
        assert!(target.is_dir());
    }

    #[test]
    fn bind_of_directory_creates_directory_target() {
        let tmp = tempfile::tempdir().unwrap();
        let target = tmp.path().join("pods/p1/volumes/v1");
        prepare_target(tmp.path().to_str().unwrap(), target.to_str().unwrap(), true).unwrap();
        assert!(target.is_dir());
    }

    /// Host whose `cryptsetup`, `blkid` and `mkfs.ext4` are shell scripts.
    /// Every invocation is appended to `log`; LUKS header, open mapping and
    /// filesystem are marker files, and passphrases land in `key`.
    struct ScriptedHost {
        dir: tempfile::TempDir,
        mounter: SystemMounter,
    }

    const CRYPTSETUP: &str = r#"#!/bin/sh
echo "cryptsetup $*" >> "$STATE/log"
case "$1" in
isLuks) test -e "$STATE/luks" ;;
luksFormat) cat > "$STATE/key"; touch "$STATE/luks" ;;
open) cat > "$STATE/key"; touch "$STATE/open" ;;
status)
    if test -e "$STATE/open"; then
        printf '  type:    LUKS2\n  device:  /dev/vdb\n'
    else
        echo "/dev/mapper/$2 is inactive."
        exit 4
    fi ;;
close) rm -f "$STATE/open" ;;
esac
"#;

    const BLKID: &str = r#"#!/bin/sh
echo "blkid $*" >> "$STATE/log"
test -e "$STATE/fs" || exit 2
echo ext4
"#;

    const MKFS: &str = r#"#!/bin/sh
echo "mkfs.ext4 $*" >> "$STATE/log"
touch "$STATE/fs"
"#;

    impl ScriptedHost {
        fn new(mounts: &str) -> Self {
            let dir = tempfile::tempdir().unwrap();
            let state = dir.path().display().to_string();
            let install = |name: &str, body: &str| {
                let path = dir.path().join(name);
                std::fs::write(&path, body.replace("$STATE", &state)).unwrap();
                std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
                path.display().to_string()
            };
            let cryptsetup = install("cryptsetup", CRYPTSETUP);
            let blkid = install("blkid", BLKID);
            install("mkfs.ext4", MKFS);
            let table = dir.path().join("mounts");
            std::fs::write(&table, mounts).unwrap();

            let mounter = SystemMounter::new(MounterConfig {
                cryptsetup,
                blkid,
                mkfs_prefix: format!("{state}/mkfs."),
                mount_table: table,
                command_timeout: Duration::from_secs(10),
            });
            Self { dir, mounter }
        }

        fn mark(&self, name: &str) {
            std::fs::write(self.dir.path().join(name), "").unwrap();
        }

        fn exists(&self, name: &str) -> bool {
            self.dir.path().join(name).exists()
        }

        fn log(&self) -> Vec<String> {
            std::fs::read_to_string(self.dir.path().join("log"))
                .unwrap_or_default()
                .lines()
                .map(str::to_owned)
                .collect()
        }

        fn clear_log(&self) {
            let _ = std::fs::remove_file(self.dir.path().join("log"));
        }

        fn key(&self) -> String {
            std::fs::read_to_string(self.dir.path().join("key")).unwrap()
        }
    }

    fn stage_context() -> LuksContext {
        LuksContext::build(
            &"v1".into(),
            &Secrets::from([(LUKS_KEY_ATTRIBUTE.to_owned(), "hunter2".to_owned())]),
            &HashMap::from([(LUKS_ENCRYPTED_ATTRIBUTE.to_owned(), "true".to_owned())]),
            VolumeLifecycle::NodeStageVolume,
        )
        .unwrap()
    }

    const OPEN_V1: &str =
        "cryptsetup open --disable-keyring --type luks --key-file - /dev/vdb csi-luks-v1";

    #[test]
    fn encrypted_volume_is_inspected_through_its_mapping() {
        let host = ScriptedHost::new("");
        host.mark("luks");
        host.mark("fs");

        assert!(host.mounter.is_formatted("/dev/vdb", &stage_context()).unwrap());
        assert_eq!(
            host.log(),
            vec![
                "cryptsetup isLuks /dev/vdb",
                "cryptsetup status csi-luks-v1",
                OPEN_V1,
                "blkid -p -s TYPE -o value /dev/mapper/csi-luks-v1",
            ]
        );
        assert_eq!(host.key(), "hunter2");
    }

    #[test]
    fn device_without_luks_header_is_unformatted_and_never_opened() {
        let host = ScriptedHost::new("");
        host.mark("fs");

        assert!(!host.mounter.is_formatted("/dev/vdb", &stage_context()).unwrap());
        assert_eq!(host.log(), vec!["cryptsetup isLuks /dev/vdb"]);
    }

    #[test]
    fn encrypted_format_writes_header_once_and_mkfs_targets_mapping() {
        let host = ScriptedHost::new("");
        host.mounter
            .format("/dev/vdb", "ext4", &stage_context())
            .unwrap();
        assert_eq!(
            host.log(),
            vec![
                "cryptsetup isLuks /dev/vdb",
                "cryptsetup luksFormat --batch-mode --cipher aes-xts-plain64 --key-size 512 \
                 --key-file - /dev/vdb",
                "cryptsetup status csi-luks-v1",
                OPEN_V1,
                "mkfs.ext4 -F -m0 /dev/mapper/csi-luks-v1",
            ]
        );
        assert_eq!(host.key(), "hunter2");

        // Header present and mapping open: only the filesystem is redone.
        host.clear_log();
        host.mounter
            .format("/dev/vdb", "ext4", &stage_context())
            .unwrap();
        assert_eq!(
            host.log(),
            vec![
                "cryptsetup isLuks /dev/vdb",
                "cryptsetup status csi-luks-v1",
                "mkfs.ext4 -F -m0 /dev/mapper/csi-luks-v1",
            ]
        );
    }

    #[test]
    fn plain_format_runs_mkfs_on_the_device() {
        let host = ScriptedHost::new("");
        let ctx = LuksContext::build(
            &"v1".into(),
            &Secrets::default(),
            &HashMap::new(),
            VolumeLifecycle::NodeStageVolume,
        )
        .unwrap();
        host.mounter.format("/dev/vdb", "ext4", &ctx).unwrap();
        assert_eq!(host.log(), vec!["mkfs.ext4 -F -m0 /dev/vdb"]);
    }

    #[test]
    fn only_unstage_releases_the_mapping_under_a_mount() {
        let host = ScriptedHost::new(
            "/dev/mapper/csi-luks-v1 /staging/v1 ext4 rw 0 0\n\
             /dev/mapper/csi-luks-v1 /target/v1 ext4 rw 0 0\n",
        );
        host.mark("open");

        let unpublish = LuksContext::teardown(VolumeLifecycle::NodeUnpublishVolume);
        assert_eq!(host.mounter.mapping_to_close("/target/v1", &unpublish).unwrap(), None);
        assert_eq!(host.mounter.mapping_to_close("/staging/v1", &unpublish).unwrap(), None);
        assert!(host.log().is_empty());

        let unstage = LuksContext::teardown(VolumeLifecycle::NodeUnstageVolume);
        assert_eq!(
            host.mounter
                .mapping_to_close("/staging/v1", &unstage)
                .unwrap()
                .as_deref(),
            Some("csi-luks-v1")
        );
        assert_eq!(host.log(), vec!["cryptsetup status csi-luks-v1"]);
    }

    #[test]
    fn leftover_mapping_is_closed() {
        let host = ScriptedHost::new("");
        host.mark("open");

        host.mounter.close_mapping(&"v1".into()).unwrap();
        assert!(!host.exists("open"));
        assert_eq!(
            host.log(),
            vec!["cryptsetup status csi-luks-v1", "cryptsetup close csi-luks-v1"]
        );

        // Closed already: only the status query runs.
        host.clear_log();
        host.mounter.close_mapping(&"v1".into()).unwrap();
        assert_eq!(host.log(), vec!["cryptsetup status csi-luks-v1"]);
    }

    #[test]
    fn mapping_still_mounted_is_left_open() {
        let host = ScriptedHost::new("/dev/mapper/csi-luks-v1 /elsewhere ext4 rw 0 0\n");
        host.mark("open");

        host.mounter.close_mapping(&"v1".into()).unwrap();
        assert!(host.exists("open"));
        assert_eq!(host.log(), vec!["cryptsetup status csi-luks-v1"]);
    }
}
