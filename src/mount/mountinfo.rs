//! Parser for `/proc/self/mountinfo`.

use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEntry {
    pub mount_point: PathBuf,
    /// `major:minor` of the backing device.
    pub device: String,
    pub fs_type: String,
    pub source: String,
}

impl MountEntry {
    /// Split the device into its numeric parts.
    pub fn device_numbers(&self) -> Option<(u64, u64)> {
        let (major, minor) = self.device.split_once(':')?;
        Some((major.parse().ok()?, minor.parse().ok()?))
    }
}

/// Parse the whole table, skipping lines that do not follow the format.
pub fn parse(content: &str) -> Vec<MountEntry> {
    content.lines().filter_map(parse_line).collect()
}

// 36 35 98:0 /mnt1 /mnt2 rw,noatime master:1 - ext3 /dev/root rw,errors=continue
fn parse_line(line: &str) -> Option<MountEntry> {
    let (left, right) = line.split_once(" - ")?;
    let fields: Vec<&str> = left.split_whitespace().collect();
    if fields.len() < 5 {
        return None;
    }
    let mut rest = right.split_whitespace();
    let fs_type = rest.next()?.to_string();
    let source = rest.next().unwrap_or("none").to_string();

    Some(MountEntry {
        mount_point: PathBuf::from(unescape(fields[4])),
        device: fields[2].to_string(),
        fs_type,
        source: unescape(&source),
    })
}

/// Undo the kernel's octal escaping of space, tab, newline and backslash.
fn unescape(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 4 <= bytes.len() {
            let digits = &bytes[i + 1..i + 4];
            if digits.iter().all(|b| (b'0'..=b'7').contains(b)) {
                let value = digits.iter().fold(0u32, |acc, b| acc * 8 + u32::from(b - b'0'));
                out.push(value as u8);
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
22 1 8:1 / / rw,relatime shared:1 - ext4 /dev/sda1 rw
98 22 0:52 / /var/lib/kubelet/pods/abc/volumes/kubernetes.io~empty-dir/gcsfuse-tmp/.volumes/v1/mount rw,nosuid,nodev shared:50 - fuse.gcsfuse b1 rw,user_id=0,group_id=0
99 22 0:52 / /var/lib/kubelet/pods/abc/volumes/kubernetes.io~csi/v1/mount rw,nosuid,nodev shared:50 - fuse.gcsfuse b1 rw
100 22 0:60 / /mnt/with\\040space rw - tmpfs tmpfs rw
garbage line
";

    #[test]
    fn test_parse_mountinfo() {
        let entries = parse(SAMPLE);
        assert_eq!(entries.len(), 4);

        assert_eq!(entries[0].mount_point, PathBuf::from("/"));
        assert_eq!(entries[0].fs_type, "ext4");

        assert_eq!(entries[1].fs_type, "fuse.gcsfuse");
        assert_eq!(entries[1].source, "b1");
        assert_eq!(entries[1].device_numbers(), Some((0, 52)));
    }

    #[test]
    fn test_parse_unescapes_spaces() {
        let entries = parse(SAMPLE);
        assert_eq!(entries[3].mount_point, PathBuf::from("/mnt/with space"));
    }

    #[test]
    fn test_parse_skips_short_lines() {
        assert!(parse("1 2 - ext4 /dev/sda rw").is_empty());
        assert!(parse("").is_empty());
    }
}
