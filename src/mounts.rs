//! Mount table reader
//!
//! Snapshot of /proc/self/mountinfo and /proc/swaps used by the block
//! facet predicates (mounted-as-filesystem, active-swap) and by the
//! state journal's reconciliation pass.

use crate::device::makedev;
use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone)]
pub struct MountEntry {
    pub device_number: u64,
    pub mount_point: String,
    pub fs_type: String,
}

/// Parsed snapshot of the mount and swap tables.
#[derive(Debug, Clone, Default)]
pub struct MountTable {
    by_dev: HashMap<u64, Vec<MountEntry>>,
    swap_devices: HashSet<String>,
}

impl MountTable {
    pub fn load() -> Self {
        let mountinfo = std::fs::read_to_string("/proc/self/mountinfo").unwrap_or_default();
        let swaps = std::fs::read_to_string("/proc/swaps").unwrap_or_default();
        Self::parse(&mountinfo, &swaps)
    }

    pub fn parse(mountinfo: &str, swaps: &str) -> Self {
        let mut by_dev: HashMap<u64, Vec<MountEntry>> = HashMap::new();
        for line in mountinfo.lines() {
            if let Some(entry) = parse_mountinfo_line(line) {
                by_dev.entry(entry.device_number).or_default().push(entry);
            }
        }

        // /proc/swaps: "Filename Type Size Used Priority", header first.
        let swap_devices = swaps
            .lines()
            .skip(1)
            .filter_map(|line| line.split_whitespace().next())
            .map(decode_octal_escapes)
            .collect();

        Self {
            by_dev,
            swap_devices,
        }
    }

    pub fn is_mounted(&self, device_number: u64) -> bool {
        self.by_dev.contains_key(&device_number)
    }

    pub fn mount_points(&self, device_number: u64) -> Vec<&str> {
        self.by_dev
            .get(&device_number)
            .map(|entries| entries.iter().map(|e| e.mount_point.as_str()).collect())
            .unwrap_or_default()
    }

    pub fn is_swap_active(&self, device_file: &str) -> bool {
        self.swap_devices.contains(device_file)
    }
}

/// mountinfo format: `id parent maj:min root mountpoint opts [optional...] - fstype source super`
fn parse_mountinfo_line(line: &str) -> Option<MountEntry> {
    let mut fields = line.split_whitespace();
    let _id = fields.next()?;
    let _parent = fields.next()?;
    let dev = fields.next()?;
    let _root = fields.next()?;
    let mount_point = fields.next()?;

    let (major, minor) = dev.split_once(':')?;
    let device_number = makedev(major.parse().ok()?, minor.parse().ok()?);

    // Skip optional fields up to the separator.
    let mut rest = fields.skip_while(|f| *f != "-");
    let _sep = rest.next()?;
    let fs_type = rest.next()?.to_string();

    Some(MountEntry {
        device_number,
        mount_point: decode_octal_escapes(mount_point),
        fs_type,
    })
}

/// The kernel escapes space, tab, newline and backslash as \0dd octal.
fn decode_octal_escapes(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut n = 0;
    while n < bytes.len() {
        if bytes[n] == b'\\' && n + 3 < bytes.len() {
            let digits = &bytes[n + 1..n + 4];
            if digits.iter().all(|d| (b'0'..=b'7').contains(d)) {
                let value = (digits[0] - b'0') * 64 + (digits[1] - b'0') * 8 + (digits[2] - b'0');
                out.push(value);
                n += 4;
                continue;
            }
        }
        out.push(bytes[n]);
        n += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    const MOUNTINFO: &str = "\
36 25 8:1 / /boot rw,relatime shared:12 - ext4 /dev/sda1 rw
37 25 8:2 / /mnt/data\\040disk rw,relatime - xfs /dev/sda2 rw
38 25 0:45 / /tmp rw - tmpfs tmpfs rw
";

    const SWAPS: &str = "\
Filename\t\t\t\tType\t\tSize\tUsed\tPriority
/dev/sda3                               partition\t8388604\t0\t-2
";

    #[test]
    fn test_parse_mountinfo() {
        let table = MountTable::parse(MOUNTINFO, SWAPS);
        assert!(table.is_mounted(makedev(8, 1)));
        assert!(!table.is_mounted(makedev(8, 9)));
        assert_eq!(table.mount_points(makedev(8, 1)), vec!["/boot"]);
    }

    #[test]
    fn test_octal_escape_decode() {
        let table = MountTable::parse(MOUNTINFO, SWAPS);
        assert_eq!(table.mount_points(makedev(8, 2)), vec!["/mnt/data disk"]);
    }

    #[test]
    fn test_swap_detection() {
        let table = MountTable::parse(MOUNTINFO, SWAPS);
        assert!(table.is_swap_active("/dev/sda3"));
        assert!(!table.is_swap_active("/dev/sda1"));
    }
}
