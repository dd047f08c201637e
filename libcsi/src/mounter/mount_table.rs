//! Parser for the kernel mount table (`/proc/self/mounts`).

use std::path::Path;

use crate::error::CsiError;

pub const PROC_MOUNTS: &str = "/proc/self/mounts";

/// One line of the mount table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEntry {
    pub source: String,
    pub target: String,
    pub fs_type: String,
    pub options: Vec<String>,
}

/// Snapshot of the mount table, read fresh whenever it is needed.
#[derive(Debug, Clone, Default)]
pub struct MountTable {
    entries: Vec<MountEntry>,
}

impl MountTable {
    /// Read and parse the mount table at `path`.
    pub fn read_from(path: &Path) -> Result<Self, CsiError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| CsiError::Internal(format!("read {}: {e}", path.display())))?;
        Ok(Self::parse(&contents))
    }

    /// Parse mount-table text. Malformed lines are skipped.
    ///
    /// Format: `<source> <target> <fstype> <options> <dump> <pass>`, with
    /// whitespace and backslashes octal-escaped (`\040` for a space).
    pub fn parse(contents: &str) -> Self {
        let entries = contents
            .lines()
            .filter_map(|line| {
                let mut fields = line.split_whitespace();
                let source = fields.next()?;
                let target = fields.next()?;
                let fs_type = fields.next()?;
                let options = fields.next().unwrap_or_default();
                Some(MountEntry {
                    source: unescape(source),
                    target: unescape(target),
                    fs_type: fs_type.to_owned(),
                    options: options.split(',').map(str::to_owned).collect(),
                })
            })
            .collect();
        Self { entries }
    }

    pub fn entries(&self) -> &[MountEntry] {
        &self.entries
    }

    /// The topmost mount at `target`, if any.
    pub fn find(&self, target: &str) -> Option<&MountEntry> {
        let target = Path::new(target);
        self.entries
            .iter()
            .rev()
            .find(|e| Path::new(&e.target) == target)
    }

    pub fn is_mounted(&self, target: &str) -> bool {
        self.find(target).is_some()
    }

    /// Device (or bind source) of the topmost mount at `target`.
    pub fn source_of(&self, target: &str) -> Option<&str> {
        self.find(target).map(|e| e.source.as_str())
    }

    /// Whether `source` is mounted anywhere.
    pub fn has_source(&self, source: &str) -> bool {
        self.entries.iter().any(|e| e.source == source)
    }
}

fn unescape(field: &str) -> String {
    if !field.contains('\\') {
        return field.to_owned();
    }
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\'
            && let Some(digits) = bytes.get(i + 1..i + 4)
            && digits.iter().all(|d| (b'0'..=b'7').contains(d))
        {
            let value = digits
                .iter()
                .fold(0u32, |acc, d| acc * 8 + u32::from(d - b'0'));
            if let Ok(value) = u8::try_from(value) {
                out.push(value);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
sysfs /sys sysfs rw,nosuid,nodev,noexec,relatime 0 0
/dev/vda1 / ext4 rw,relatime 0 0
/dev/vdb /var/lib/kubelet/plugins/staging/v1 ext4 rw,relatime 0 0
/dev/vdb /var/lib/kubelet/pods/p1/volumes/v1 ext4 ro,relatime 0 0
/dev/mapper/csi-luks-v2 /staging/with\\040space ext4 rw 0 0
";

    #[test]
    fn finds_mounted_targets() {
        let table = MountTable::parse(SAMPLE);
        assert_eq!(table.entries().len(), 5);
        assert!(table.is_mounted("/var/lib/kubelet/plugins/staging/v1"));
        assert!(table.is_mounted("/var/lib/kubelet/plugins/staging/v1/"));
        assert!(!table.is_mounted("/var/lib/kubelet/plugins/staging"));
    }

    #[test]
    fn resolves_source_device() {
        let table = MountTable::parse(SAMPLE);
        assert_eq!(
            table.source_of("/var/lib/kubelet/pods/p1/volumes/v1"),
            Some("/dev/vdb")
        );
        let entry = table.find("/var/lib/kubelet/pods/p1/volumes/v1").unwrap();
        assert_eq!(entry.options[0], "ro");
    }

    #[test]
    fn decodes_octal_escapes() {
        let table = MountTable::parse(SAMPLE);
        assert_eq!(
            table.source_of("/staging/with space"),
            Some("/dev/mapper/csi-luks-v2")
        );
    }

    #[test]
    fn mapping_is_found_by_source() {
        let table = MountTable::parse(SAMPLE);
        assert!(table.has_source("/dev/mapper/csi-luks-v2"));
        assert!(!table.has_source("/dev/mapper/csi-luks-v1"));
    }

    #[test]
    fn topmost_mount_wins() {
        let table = MountTable::parse("/dev/vdb /mnt ext4 rw 0 0\n/dev/vdc /mnt xfs rw 0 0\n");
        assert_eq!(table.source_of("/mnt"), Some("/dev/vdc"));
    }

    #[test]
    fn skips_malformed_lines() {
        let table = MountTable::parse("garbage\n\n/dev/vdb /mnt ext4 rw 0 0\n");
        assert_eq!(table.entries().len(), 1);
    }

    #[test]
    fn unescape_leaves_plain_and_invalid_sequences() {
        assert_eq!(unescape("/plain/path"), "/plain/path");
        assert_eq!(unescape("a\\134b"), "a\\b");
        assert_eq!(unescape("trailing\\04"), "trailing\\04");
        assert_eq!(unescape("bad\\9xy"), "bad\\9xy");
    }
}
