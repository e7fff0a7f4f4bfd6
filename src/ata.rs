//! ATA drive support
//!
//! Parses IDENTIFY DEVICE data captured by the probe worker and backs the
//! ATA facet on drive objects: SMART refresh during housekeeping and
//! application of the persisted drive configuration.

use crate::config::DriveAtaConfig;
use crate::device::DeviceRecord;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::process::Command;
use tracing::{debug, info};

/// View over a 512-byte IDENTIFY DEVICE blob.
pub struct IdentifyData<'a> {
    data: &'a [u8],
}

impl<'a> IdentifyData<'a> {
    pub fn new(data: &'a [u8]) -> Option<Self> {
        if data.len() < 512 {
            return None;
        }
        Some(Self { data })
    }

    pub fn word(&self, n: usize) -> u16 {
        u16::from_le_bytes([self.data[n * 2], self.data[n * 2 + 1]])
    }

    /// ATA strings store characters byte-swapped within each word.
    fn string(&self, first_word: usize, last_word: usize) -> String {
        let mut out = Vec::with_capacity((last_word - first_word + 1) * 2);
        for w in first_word..=last_word {
            out.push(self.data[w * 2 + 1]);
            out.push(self.data[w * 2]);
        }
        String::from_utf8_lossy(&out).trim().to_string()
    }

    pub fn serial(&self) -> String {
        self.string(10, 19)
    }

    pub fn firmware(&self) -> String {
        self.string(23, 26)
    }

    pub fn model(&self) -> String {
        self.string(27, 46)
    }

    /// Word 217: 0x0001 means non-rotating media, 0x0401..=0xfffe is RPM.
    pub fn rotation_rate(&self) -> Option<u16> {
        match self.word(217) {
            0x0001 => Some(0),
            rate @ 0x0401..=0xfffe => Some(rate),
            _ => None,
        }
    }

    pub fn smart_supported(&self) -> bool {
        self.word(82) & 0x0001 != 0
    }

    pub fn smart_enabled(&self) -> bool {
        self.word(85) & 0x0001 != 0
    }

    pub fn apm_supported(&self) -> bool {
        self.word(83) & (1 << 3) != 0
    }

    pub fn aam_supported(&self) -> bool {
        self.word(83) & (1 << 9) != 0
    }

    pub fn write_cache_supported(&self) -> bool {
        self.word(82) & (1 << 5) != 0
    }

    pub fn read_lookahead_supported(&self) -> bool {
        self.word(82) & (1 << 6) != 0
    }

    pub fn security_frozen(&self) -> bool {
        self.word(128) & (1 << 3) != 0
    }
}

/// ATA facet published on drive objects backed by an ATA disk.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AtaFacet {
    pub smart_supported: bool,
    pub smart_enabled: bool,
    /// Seconds-since-epoch of the last successful SMART refresh.
    pub smart_updated: u64,
    pub smart_failing: bool,
    pub pm_supported: bool,
    pub apm_supported: bool,
    pub aam_supported: bool,
    pub write_cache_supported: bool,
    pub read_lookahead_supported: bool,
    pub security_frozen: bool,
    pub rotation_rate: Option<u16>,
}

impl AtaFacet {
    pub fn from_record(record: &DeviceRecord) -> Self {
        let mut facet = AtaFacet::default();
        facet.update(record);
        facet
    }

    pub fn update(&mut self, record: &DeviceRecord) {
        if let Some(blob) = record.ata_identify.as_deref() {
            if let Some(id) = IdentifyData::new(blob) {
                self.smart_supported = id.smart_supported();
                self.smart_enabled = id.smart_enabled();
                self.apm_supported = id.apm_supported();
                self.aam_supported = id.aam_supported();
                self.write_cache_supported = id.write_cache_supported();
                self.read_lookahead_supported = id.read_lookahead_supported();
                self.security_frozen = id.security_frozen();
                self.rotation_rate = id.rotation_rate();
                self.pm_supported = true;
            }
        } else {
            // PATA/ATAPI without identify data; fall back to udev hints.
            self.smart_supported = record.property_as_bool("ID_ATA_FEATURE_SET_SMART");
            self.smart_enabled = record.property_as_bool("ID_ATA_FEATURE_SET_SMART_ENABLED");
        }
    }

    pub fn properties(&self) -> serde_json::Value {
        json!({
            "smart_supported": self.smart_supported,
            "smart_enabled": self.smart_enabled,
            "smart_updated": self.smart_updated,
            "smart_failing": self.smart_failing,
            "pm_supported": self.pm_supported,
            "apm_supported": self.apm_supported,
            "aam_supported": self.aam_supported,
            "write_cache_supported": self.write_cache_supported,
            "read_lookahead_supported": self.read_lookahead_supported,
            "security_frozen": self.security_frozen,
            "rotation_rate": self.rotation_rate,
        })
    }

    /// Whether the predicate for carrying this facet holds.
    pub fn applies(record: &DeviceRecord) -> bool {
        record.has_property("ID_ATA") || record.property("ID_BUS") == Some("ata")
    }
}

/// Is the drive in a low-power state we should not disturb?
fn drive_is_asleep(record: &DeviceRecord) -> bool {
    let path = std::path::Path::new(&record.sysfs_path)
        .join("device")
        .join("power")
        .join("runtime_status");
    matches!(
        std::fs::read_to_string(path).as_deref().map(str::trim),
        Ok("suspended")
    )
}

/// Refresh SMART data. With `wakeup` unset the refresh declines to touch
/// a sleeping drive and returns `WouldWakeUp`.
pub fn refresh_smart(record: &DeviceRecord, facet: &mut AtaFacet, wakeup: bool) -> Result<()> {
    if !facet.smart_supported || !facet.smart_enabled {
        return Ok(());
    }
    let device_file = record
        .device_file
        .as_deref()
        .ok_or_else(|| Error::failed("no device node"))?;

    if !wakeup && drive_is_asleep(record) {
        return Err(Error::WouldWakeUp(device_file.to_string()));
    }

    let output = Command::new("smartctl")
        .args(["-H", "--nocheck", "standby", device_file])
        .output()
        .map_err(|e| Error::failed(format!("smartctl: {}", e)))?;

    // smartctl exit bit 1 = command line error, bit 3 = disk failing.
    let code = output.status.code().unwrap_or(-1);
    if code & 0x01 != 0 {
        return Err(Error::failed(format!(
            "smartctl failed for {}: {}",
            device_file,
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    facet.smart_failing = code & 0x08 != 0;
    facet.smart_updated = chrono::Utc::now().timestamp().max(0) as u64;
    debug!("SMART refreshed for {}", device_file);
    Ok(())
}

/// Apply the persisted ATA configuration to the drive hardware.
pub fn apply_configuration(record: &DeviceRecord, config: &DriveAtaConfig) -> Result<()> {
    let device_file = match record.device_file.as_deref() {
        Some(f) => f,
        None => return Ok(()),
    };

    let mut args: Vec<String> = Vec::new();
    if let Some(timeout) = config.standby_timeout {
        args.push("-S".into());
        args.push(timeout.to_string());
    }
    if let Some(level) = config.apm_level {
        args.push("-B".into());
        args.push(level.to_string());
    }
    if let Some(level) = config.aam_level {
        args.push("-M".into());
        args.push(level.to_string());
    }
    if let Some(enabled) = config.write_cache_enabled {
        args.push("-W".into());
        args.push(if enabled { "1" } else { "0" }.into());
    }
    if let Some(enabled) = config.read_lookahead_enabled {
        args.push("-A".into());
        args.push(if enabled { "1" } else { "0" }.into());
    }
    if args.is_empty() {
        return Ok(());
    }
    args.push(device_file.to_string());

    info!("applying ATA configuration to {}", device_file);
    let status = Command::new("hdparm")
        .args(&args)
        .status()
        .map_err(|e| Error::failed(format!("hdparm: {}", e)))?;
    if !status.success() {
        return Err(Error::failed(format!(
            "hdparm exited with {} for {}",
            status, device_file
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identify_with(words: &[(usize, u16)]) -> Vec<u8> {
        let mut blob = vec![0u8; 512];
        for &(word, value) in words {
            let bytes = value.to_le_bytes();
            blob[word * 2] = bytes[0];
            blob[word * 2 + 1] = bytes[1];
        }
        blob
    }

    fn put_string(blob: &mut [u8], first_word: usize, s: &str) {
        let bytes = s.as_bytes();
        for (i, pair) in bytes.chunks(2).enumerate() {
            let w = (first_word + i) * 2;
            blob[w + 1] = pair[0];
            blob[w] = *pair.get(1).unwrap_or(&b' ');
        }
    }

    #[test]
    fn test_identify_strings_are_byte_swapped() {
        let mut blob = identify_with(&[]);
        put_string(&mut blob, 27, "Samsung SSD 860");
        put_string(&mut blob, 10, "S3Z9NB0K");
        let id = IdentifyData::new(&blob).unwrap();
        assert_eq!(id.model(), "Samsung SSD 860");
        assert_eq!(id.serial(), "S3Z9NB0K");
    }

    #[test]
    fn test_rotation_rate() {
        let blob = identify_with(&[(217, 0x0001)]);
        assert_eq!(IdentifyData::new(&blob).unwrap().rotation_rate(), Some(0));
        let blob = identify_with(&[(217, 7200)]);
        assert_eq!(IdentifyData::new(&blob).unwrap().rotation_rate(), Some(7200));
        let blob = identify_with(&[(217, 0)]);
        assert_eq!(IdentifyData::new(&blob).unwrap().rotation_rate(), None);
    }

    #[test]
    fn test_smart_bits() {
        let blob = identify_with(&[(82, 0x0001), (85, 0x0001)]);
        let id = IdentifyData::new(&blob).unwrap();
        assert!(id.smart_supported());
        assert!(id.smart_enabled());
    }

    #[test]
    fn test_facet_from_synthetic_record() {
        use crate::device::{DeviceRecord, Subsystem};
        let mut record = DeviceRecord::synthetic(Subsystem::Block, "/sys/block/sda", "sda");
        let blob = identify_with(&[(82, 0x0021), (85, 0x0001), (217, 0x0001)]);
        record.ata_identify = Some(blob.into_boxed_slice());
        let facet = AtaFacet::from_record(&record);
        assert!(facet.smart_supported);
        assert!(facet.write_cache_supported);
        assert_eq!(facet.rotation_rate, Some(0));
    }
}
