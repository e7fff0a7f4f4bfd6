//! Bus object path construction
//!
//! Object paths may only contain `[A-Za-z0-9_]` per path element; every
//! other byte is escaped as `_hh` (two lowercase hex digits). The mapping
//! is deterministic but not bijective.

/// Root of the exported object tree.
pub const ROOT: &str = "/barrow";

/// Append `s` to `out`, escaping bytes outside `[A-Za-z0-9_]` as `_hh`.
pub fn safe_append(out: &mut String, s: &str) {
    for b in s.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'_' => out.push(b as char),
            _ => out.push_str(&format!("_{:02x}", b)),
        }
    }
}

/// Escape a single path element.
pub fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    safe_append(&mut out, s);
    out
}

pub fn manager() -> String {
    format!("{}/Manager", ROOT)
}

/// Block object path derived from the kernel device name (e.g. `sda1`).
pub fn block_device(device_name: &str) -> String {
    format!("{}/block_devices/{}", ROOT, escape(device_name))
}

/// Drive object path derived from vendor/model/serial. Empty parts are
/// omitted and the separators collapse with them.
pub fn drive(vendor: &str, model: &str, serial: &str) -> String {
    let mut id = String::new();
    for part in [vendor, model, serial] {
        if part.is_empty() {
            continue;
        }
        if !id.is_empty() {
            id.push('_');
        }
        safe_append(&mut id, part);
    }
    if id.is_empty() {
        id.push_str("drive");
    }
    format!("{}/drives/{}", ROOT, id)
}

pub fn mdraid(uuid: &str) -> String {
    format!("{}/mdraid/{}", ROOT, escape(uuid))
}

pub fn job(id: &str) -> String {
    format!("{}/jobs/{}", ROOT, escape(id))
}

pub fn iscsi_session(session_id: &str) -> String {
    format!("{}/iscsi/{}", ROOT, escape(session_id))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_passthrough() {
        assert_eq!(escape("sda1"), "sda1");
        assert_eq!(escape("nvme0n1"), "nvme0n1");
        assert_eq!(escape("under_score"), "under_score");
    }

    #[test]
    fn test_escaped_bytes() {
        assert_eq!(escape("dm-0"), "dm_2d0");
        assert_eq!(escape("a b"), "a_20b");
        assert_eq!(escape("Ä"), "_c3_84");
    }

    #[test]
    fn test_determinism_and_distinctness() {
        // Two inputs differing in a non-passthrough byte encode differently.
        assert_eq!(escape("sr-0"), escape("sr-0"));
        assert_ne!(escape("sr-0"), escape("sr.0"));
    }

    #[test]
    fn test_drive_path_omits_empty_parts() {
        assert_eq!(drive("", "SP1604N", "XYZ"), "/barrow/drives/SP1604N_XYZ");
        assert_eq!(drive("", "", ""), "/barrow/drives/drive");
        assert_eq!(
            drive("ATA", "Samsung SSD", "S123"),
            "/barrow/drives/ATA_Samsung_20SSD_S123"
        );
    }
}
