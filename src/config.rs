//! Daemon and per-drive configuration
//!
//! Drives keep their persisted settings in `<config-dir>/<id>.conf`,
//! flat `key=value` lines grouped under `[ATA]`. Unknown keys and
//! foreign groups are preserved when the file is rewritten.

use crate::error::{Error, Result};
use std::path::{Path, PathBuf};
use tracing::debug;

pub const DEFAULT_CONFIG_DIR: &str = "/grimoire/system/barrow";
pub const DEFAULT_STATE_DIR: &str = "/var/lib/barrow";
pub const DEFAULT_SOCKET: &str = "/run/barrow/barrow.sock";

/// How modules are brought up at start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleLoadMode {
    /// Load when a client first asks for them.
    Lazy,
    /// Load everything during startup.
    Force,
    /// Never load.
    Disabled,
}

/// Resolved daemon settings from the command line.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub config_dir: PathBuf,
    pub state_dir: PathBuf,
    pub socket: PathBuf,
    pub module_mode: ModuleLoadMode,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            config_dir: PathBuf::from(DEFAULT_CONFIG_DIR),
            state_dir: PathBuf::from(DEFAULT_STATE_DIR),
            socket: PathBuf::from(DEFAULT_SOCKET),
            module_mode: ModuleLoadMode::Lazy,
        }
    }
}

/// Typed view of the `[ATA]` group of a drive's configuration file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DriveAtaConfig {
    pub standby_timeout: Option<i32>,
    pub apm_level: Option<i32>,
    pub aam_level: Option<i32>,
    pub write_cache_enabled: Option<bool>,
    pub read_lookahead_enabled: Option<bool>,
}

impl DriveAtaConfig {
    pub fn is_empty(&self) -> bool {
        *self == DriveAtaConfig::default()
    }
}

/// A drive configuration file, groups kept in file order so rewrites
/// preserve everything we do not understand.
#[derive(Debug, Clone, Default)]
pub struct DriveConfigFile {
    groups: Vec<(String, Vec<(String, String)>)>,
}

const ATA_GROUP: &str = "ATA";

impl DriveConfigFile {
    pub fn parse(text: &str) -> Self {
        let mut groups: Vec<(String, Vec<(String, String)>)> = Vec::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Some(name) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
                groups.push((name.trim().to_string(), Vec::new()));
            } else if let Some((key, value)) = line.split_once('=') {
                if groups.is_empty() {
                    groups.push((String::new(), Vec::new()));
                }
                groups
                    .last_mut()
                    .unwrap()
                    .1
                    .push((key.trim().to_string(), value.trim().to_string()));
            }
        }
        Self { groups }
    }

    pub fn serialize(&self) -> String {
        let mut out = String::new();
        for (name, entries) in &self.groups {
            if !name.is_empty() {
                out.push_str(&format!("[{}]\n", name));
            }
            for (key, value) in entries {
                out.push_str(&format!("{}={}\n", key, value));
            }
        }
        out
    }

    fn get(&self, group: &str, key: &str) -> Option<&str> {
        self.groups
            .iter()
            .find(|(name, _)| name == group)?
            .1
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    fn set(&mut self, group: &str, key: &str, value: Option<String>) {
        let entries = match self.groups.iter_mut().find(|(name, _)| name == group) {
            Some((_, entries)) => entries,
            None => {
                if value.is_none() {
                    return;
                }
                self.groups.push((group.to_string(), Vec::new()));
                &mut self.groups.last_mut().unwrap().1
            }
        };
        match value {
            Some(value) => match entries.iter_mut().find(|(k, _)| k == key) {
                Some((_, v)) => *v = value,
                None => entries.push((key.to_string(), value)),
            },
            None => entries.retain(|(k, _)| k != key),
        }
    }

    pub fn ata(&self) -> DriveAtaConfig {
        let int = |key| self.get(ATA_GROUP, key).and_then(|v| v.parse::<i32>().ok());
        let boolean = |key| {
            self.get(ATA_GROUP, key)
                .map(|v| v.eq_ignore_ascii_case("true") || v == "1")
        };
        DriveAtaConfig {
            standby_timeout: int("StandbyTimeout"),
            apm_level: int("APMLevel"),
            aam_level: int("AAMLevel"),
            write_cache_enabled: boolean("WriteCacheEnabled"),
            read_lookahead_enabled: boolean("ReadLookaheadEnabled"),
        }
    }

    pub fn set_ata(&mut self, config: &DriveAtaConfig) {
        let mut set_int = |key: &str, v: Option<i32>| {
            self.set(ATA_GROUP, key, v.map(|v| v.to_string()));
        };
        set_int("StandbyTimeout", config.standby_timeout);
        set_int("APMLevel", config.apm_level);
        set_int("AAMLevel", config.aam_level);
        let mut set_bool = |key: &str, v: Option<bool>| {
            self.set(ATA_GROUP, key, v.map(|v| v.to_string()));
        };
        set_bool("WriteCacheEnabled", config.write_cache_enabled);
        set_bool("ReadLookaheadEnabled", config.read_lookahead_enabled);
    }
}

/// File name for a drive's configuration, derived from its VPD id.
fn config_path(config_dir: &Path, drive_id: &str) -> PathBuf {
    config_dir.join(format!("{}.conf", crate::paths::escape(drive_id)))
}

pub fn load_drive_config(config_dir: &Path, drive_id: &str) -> DriveConfigFile {
    let path = config_path(config_dir, drive_id);
    match std::fs::read_to_string(&path) {
        Ok(text) => DriveConfigFile::parse(&text),
        Err(_) => DriveConfigFile::default(),
    }
}

pub fn store_drive_config(
    config_dir: &Path,
    drive_id: &str,
    file: &DriveConfigFile,
) -> Result<()> {
    std::fs::create_dir_all(config_dir)?;
    let path = config_path(config_dir, drive_id);
    let tmp = path.with_extension("conf.tmp");
    std::fs::write(&tmp, file.serialize())?;
    std::fs::rename(&tmp, &path)
        .map_err(|e| Error::failed(format!("rename {}: {}", path.display(), e)))?;
    debug!("stored drive configuration {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ata_group() {
        let file = DriveConfigFile::parse(
            "[ATA]\nStandbyTimeout=120\nAPMLevel=127\nWriteCacheEnabled=true\n",
        );
        let ata = file.ata();
        assert_eq!(ata.standby_timeout, Some(120));
        assert_eq!(ata.apm_level, Some(127));
        assert_eq!(ata.write_cache_enabled, Some(true));
        assert_eq!(ata.aam_level, None);
    }

    #[test]
    fn test_unknown_keys_preserved() {
        let mut file = DriveConfigFile::parse(
            "[ATA]\nStandbyTimeout=120\nVendorMagic=7\n[Custom]\nx=y\n",
        );
        let mut ata = file.ata();
        ata.standby_timeout = Some(60);
        ata.apm_level = Some(254);
        file.set_ata(&ata);
        let text = file.serialize();
        assert!(text.contains("VendorMagic=7"));
        assert!(text.contains("[Custom]"));
        assert!(text.contains("x=y"));
        assert!(text.contains("StandbyTimeout=60"));
        assert!(text.contains("APMLevel=254"));
    }

    #[test]
    fn test_removing_a_setting_drops_the_key() {
        let mut file = DriveConfigFile::parse("[ATA]\nAAMLevel=128\n");
        file.set_ata(&DriveAtaConfig::default());
        assert!(!file.serialize().contains("AAMLevel"));
    }

    #[test]
    fn test_roundtrip_is_stable() {
        let text = "[ATA]\nStandbyTimeout=120\n[Other]\nk=v\n";
        let file = DriveConfigFile::parse(text);
        assert_eq!(file.serialize(), text);
    }
}
