//! NVMe controller support
//!
//! Facets for NVMe controllers and fabrics connections on drive objects,
//! plus the NVMe manager surface (host NQN/ID, connect-to-fabric).

use crate::device::DeviceRecord;
use crate::error::{Error, Result};
use crate::jobs::CancelToken;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use tracing::{debug, info};

const NVME_CONFIG_DIR: &str = "/etc/nvme";

/// Controller type read from the `cntrltype` sysfs attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControllerType {
    Io,
    Admin,
    Discovery,
    Unknown,
}

impl ControllerType {
    pub fn parse(s: Option<&str>) -> Self {
        match s {
            Some("io") => ControllerType::Io,
            Some("admin") => ControllerType::Admin,
            Some("discovery") => ControllerType::Discovery,
            _ => ControllerType::Unknown,
        }
    }
}

/// NVMe controller facet on a drive object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NvmeControllerFacet {
    pub state: Option<String>,
    pub transport: Option<String>,
    pub subsysnqn: Option<String>,
    pub cntlid: Option<u16>,
    pub controller_type: ControllerType,
    pub fguid: Option<String>,
    /// Seconds-since-epoch of the last health-log refresh.
    pub smart_updated: u64,
    pub smart_critical_warning: Vec<String>,
}

impl NvmeControllerFacet {
    pub fn from_record(record: &DeviceRecord) -> Self {
        let info = record.nvme_controller_info.clone().unwrap_or_default();
        NvmeControllerFacet {
            state: info.state,
            transport: info.transport,
            subsysnqn: info.subsysnqn,
            cntlid: info.cntlid,
            controller_type: ControllerType::parse(record.sysfs_attr("cntrltype")),
            fguid: record.sysfs_attr("fguid").map(str::to_string),
            smart_updated: 0,
            smart_critical_warning: Vec::new(),
        }
    }

    pub fn update(&mut self, record: &DeviceRecord) {
        let refreshed = Self::from_record(record);
        let smart_updated = self.smart_updated;
        let warnings = std::mem::take(&mut self.smart_critical_warning);
        *self = refreshed;
        self.smart_updated = smart_updated;
        self.smart_critical_warning = warnings;
    }

    pub fn properties(&self) -> serde_json::Value {
        json!({
            "state": self.state,
            "transport": self.transport,
            "subsysnqn": self.subsysnqn,
            "cntlid": self.cntlid,
            "controller_type": self.controller_type,
            "fguid": self.fguid,
            "smart_updated": self.smart_updated,
            "smart_critical_warning": self.smart_critical_warning,
        })
    }

    pub fn applies(record: &DeviceRecord) -> bool {
        record.subsystem == crate::device::Subsystem::Nvme
    }

    /// Housekeeping refreshes the health log for I/O and unknown
    /// controller types only.
    pub fn wants_health_refresh(&self) -> bool {
        matches!(
            self.controller_type,
            ControllerType::Io | ControllerType::Unknown
        )
    }
}

/// NVMe-oF facet present on controllers connected over a fabric.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NvmeFabricsFacet {
    pub hostnqn: Option<String>,
    pub hostid: Option<String>,
    pub transport_address: Option<String>,
}

impl NvmeFabricsFacet {
    pub fn from_record(record: &DeviceRecord) -> Self {
        NvmeFabricsFacet {
            hostnqn: record.sysfs_attr("hostnqn").map(str::to_string),
            hostid: record.sysfs_attr("hostid").map(str::to_string),
            transport_address: record.sysfs_attr("address").map(str::to_string),
        }
    }

    pub fn update(&mut self, record: &DeviceRecord) {
        *self = Self::from_record(record);
    }

    pub fn properties(&self) -> serde_json::Value {
        json!({
            "hostnqn": self.hostnqn,
            "hostid": self.hostid,
            "transport_address": self.transport_address,
        })
    }

    /// Fabrics controllers have a transport other than pcie.
    pub fn applies(record: &DeviceRecord) -> bool {
        NvmeControllerFacet::applies(record)
            && matches!(record.sysfs_attr("transport"), Some(t) if t != "pcie")
    }
}

/// Refresh the controller health log via the NVMe administration helper.
pub fn refresh_health(record: &DeviceRecord, facet: &mut NvmeControllerFacet) -> Result<()> {
    let device_file = record
        .device_file
        .as_deref()
        .ok_or_else(|| Error::failed("no device node"))?;

    let output = Command::new("nvme")
        .args(["smart-log", device_file, "--output-format=json"])
        .output()
        .map_err(|e| Error::failed(format!("nvme: {}", e)))?;
    if !output.status.success() {
        return Err(Error::failed(format!(
            "nvme smart-log failed for {}: {}",
            device_file,
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }

    let log: serde_json::Value = serde_json::from_slice(&output.stdout)
        .map_err(|e| Error::failed(format!("nvme smart-log output: {}", e)))?;
    facet.smart_critical_warning = decode_critical_warning(
        log.get("critical_warning").and_then(|v| v.as_u64()).unwrap_or(0) as u8,
    );
    facet.smart_updated = chrono::Utc::now().timestamp().max(0) as u64;
    debug!("health log refreshed for {}", device_file);
    Ok(())
}

fn decode_critical_warning(bits: u8) -> Vec<String> {
    let names = [
        "spare",
        "temperature",
        "degraded",
        "readonly",
        "volatile_mem",
        "pmr_readonly",
    ];
    names
        .iter()
        .enumerate()
        .filter(|(n, _)| bits & (1 << n) != 0)
        .map(|(_, name)| name.to_string())
        .collect()
}

/// Manager-level NVMe host identity and fabric connection handling.
pub struct NvmeManager {
    config_dir: PathBuf,
}

impl NvmeManager {
    pub fn new() -> Self {
        Self {
            config_dir: PathBuf::from(NVME_CONFIG_DIR),
        }
    }

    pub fn with_config_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            config_dir: dir.into(),
        }
    }

    fn read_id_file(&self, name: &str) -> Option<String> {
        std::fs::read_to_string(self.config_dir.join(name))
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    }

    fn write_id_file(&self, name: &str, value: &str) -> Result<()> {
        std::fs::create_dir_all(&self.config_dir)?;
        let path = self.config_dir.join(name);
        std::fs::write(&path, format!("{}\n", value))?;
        info!("wrote {}", path.display());
        Ok(())
    }

    pub fn host_nqn(&self) -> Option<String> {
        self.read_id_file("hostnqn")
    }

    pub fn host_id(&self) -> Option<String> {
        self.read_id_file("hostid")
    }

    pub fn set_host_nqn(&self, nqn: &str) -> Result<()> {
        if !nqn.starts_with("nqn.") {
            return Err(Error::failed(format!("invalid host NQN: {}", nqn)));
        }
        self.write_id_file("hostnqn", nqn)
    }

    pub fn set_host_id(&self, id: &str) -> Result<()> {
        if id.is_empty() {
            return Err(Error::failed("empty host ID"));
        }
        self.write_id_file("hostid", id)
    }

    /// Connect to an NVMe-oF endpoint via the administration helper.
    /// Fabric connects can hang on unreachable targets, so the helper
    /// runs asynchronously and races the caller's cancel token.
    pub async fn connect(
        &self,
        subsysnqn: &str,
        transport: &str,
        address: Option<&str>,
        port: Option<u16>,
        cancel: &mut CancelToken,
    ) -> Result<()> {
        let mut cmd = tokio::process::Command::new("nvme");
        cmd.args(["connect", "--nqn", subsysnqn, "--transport", transport]);
        if let Some(address) = address {
            cmd.args(["--traddr", address]);
        }
        if let Some(port) = port {
            cmd.args(["--trsvcid", &port.to_string()]);
        }
        if let Some(hostnqn) = self.host_nqn() {
            cmd.args(["--hostnqn", &hostnqn]);
        }
        cmd.stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = cmd
            .spawn()
            .map_err(|e| Error::failed(format!("nvme connect: {}", e)))?;
        let output = tokio::select! {
            output = child.wait_with_output() => {
                output.map_err(|e| Error::failed(format!("nvme connect: {}", e)))?
            }
            _ = cancel.cancelled() => {
                return Err(Error::Cancelled);
            }
        };
        if !output.status.success() {
            return Err(Error::failed(format!(
                "nvme connect to {} failed: {}",
                subsysnqn,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        info!("connected NVMe fabric {} over {}", subsysnqn, transport);
        Ok(())
    }
}

impl Default for NvmeManager {
    fn default() -> Self {
        Self::new()
    }
}

/// NVMe VPD string: unlike SCSI there is no stable cross-transport
/// identifier at connect time, so host NQN + transport + sysfs path
/// stand in for one.
pub fn controller_vpd(record: &DeviceRecord) -> Option<String> {
    if record.subsystem != crate::device::Subsystem::Nvme {
        return None;
    }
    // The calls made against a controller need a device node.
    record.sysfs_attr("transport")?;
    record.device_file.as_ref()?;
    let hostnqn = record.sysfs_attr("hostnqn").unwrap_or("nohostnqn");
    let transport = record.sysfs_attr("transport").unwrap_or("notransport");
    Some(format!(
        "NVMe:hostnqn={}+transport={}+{}",
        hostnqn, transport, record.sysfs_path
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{DeviceRecord, Subsystem};

    fn controller_record() -> DeviceRecord {
        let mut r = DeviceRecord::synthetic(Subsystem::Nvme, "/sys/class/nvme/nvme0", "nvme0");
        r.device_file = Some("/dev/nvme0".into());
        r.sysfs_attrs.insert("transport".into(), "pcie".into());
        r.sysfs_attrs.insert("cntrltype".into(), "io".into());
        r
    }

    #[test]
    fn test_controller_vpd_format() {
        let record = controller_record();
        let vpd = controller_vpd(&record).unwrap();
        assert_eq!(
            vpd,
            "NVMe:hostnqn=nohostnqn+transport=pcie+/sys/class/nvme/nvme0"
        );
    }

    #[test]
    fn test_controller_vpd_requires_transport_and_node() {
        let mut record = controller_record();
        record.sysfs_attrs.remove("transport");
        assert!(controller_vpd(&record).is_none());

        let mut record = controller_record();
        record.device_file = None;
        assert!(controller_vpd(&record).is_none());
    }

    #[test]
    fn test_fabrics_facet_only_on_fabric_transports() {
        let record = controller_record();
        assert!(!NvmeFabricsFacet::applies(&record));
        let mut record = controller_record();
        record.sysfs_attrs.insert("transport".into(), "tcp".into());
        assert!(NvmeFabricsFacet::applies(&record));
    }

    #[test]
    fn test_critical_warning_decode() {
        assert!(decode_critical_warning(0).is_empty());
        let w = decode_critical_warning(0b0000_0011);
        assert_eq!(w, vec!["spare".to_string(), "temperature".to_string()]);
    }

    #[test]
    fn test_health_refresh_selection() {
        let facet = NvmeControllerFacet::from_record(&controller_record());
        assert!(facet.wants_health_refresh());
        let mut record = controller_record();
        record.sysfs_attrs.insert("cntrltype".into(), "discovery".into());
        let facet = NvmeControllerFacet::from_record(&record);
        assert!(!facet.wants_health_refresh());
    }
}
