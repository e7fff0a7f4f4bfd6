//! iSCSI module
//!
//! Exports one standalone object per open iSCSI session and a manager
//! facet for target discovery and login/logout through the iscsiadm
//! helper. Session objects claim every uevent whose sysfs path runs
//! through their session directory and retire when the session device
//! is removed.

use crate::bus::FacetMap;
use crate::device::{DeviceRecord, Subsystem};
use crate::error::{Error, Result};
use crate::modules::{ManagerOpFuture, Module, ModuleObject};
use crate::paths;
use crate::uevent::UeventAction;
use serde_json::{json, Value};
use std::path::Path;
use std::sync::Arc;
use tokio::process::Command;
use tracing::debug;

/// Extract `sessionN` from a sysfs path.
fn session_id_from_sysfs_path(sysfs_path: &str) -> Option<String> {
    for component in sysfs_path.split('/') {
        if let Some(rest) = component.strip_prefix("session") {
            if !rest.is_empty() && rest.bytes().all(|b| b.is_ascii_digit()) {
                return Some(component.to_string());
            }
        }
    }
    None
}

pub struct IscsiSessionObject {
    session_id: String,
    target_name: String,
    tpgt: i32,
    address: String,
    port: i32,
    persistent_address: String,
    persistent_port: i32,
}

impl IscsiSessionObject {
    fn new(session_id: String) -> Self {
        let mut object = Self {
            session_id,
            target_name: String::new(),
            tpgt: -1,
            address: String::new(),
            port: -1,
            persistent_address: String::new(),
            persistent_port: -1,
        };
        object.refresh();
        object
    }

    /// Session attributes live under /sys/class/iscsi_session and the
    /// matching connection directory.
    fn refresh(&mut self) {
        let session_dir = format!("/sys/class/iscsi_session/{}", self.session_id);
        self.target_name = read_attr(&session_dir, "targetname").unwrap_or_default();
        self.tpgt = read_attr(&session_dir, "tpgt")
            .and_then(|v| v.parse().ok())
            .unwrap_or(-1);

        let connection_id = self.session_id.replacen("session", "connection", 1);
        let conn_dir = format!("/sys/class/iscsi_connection/{}-0", connection_id);
        self.address = read_attr(&conn_dir, "address").unwrap_or_default();
        self.port = read_attr(&conn_dir, "port")
            .and_then(|v| v.parse().ok())
            .unwrap_or(-1);
        self.persistent_address = read_attr(&conn_dir, "persistent_address").unwrap_or_default();
        self.persistent_port = read_attr(&conn_dir, "persistent_port")
            .and_then(|v| v.parse().ok())
            .unwrap_or(-1);
    }

    fn properties(&self) -> Value {
        json!({
            "session_id": self.session_id,
            "target_name": self.target_name,
            "tpgt": self.tpgt,
            "address": self.address,
            "port": self.port,
            "persistent_address": self.persistent_address,
            "persistent_port": self.persistent_port,
        })
    }
}

fn read_attr(dir: &str, attr: &str) -> Option<String> {
    std::fs::read_to_string(Path::new(dir).join(attr))
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty() && s != "<empty>")
}

impl ModuleObject for IscsiSessionObject {
    fn object_path(&self) -> String {
        paths::iscsi_session(&self.session_id)
    }

    fn process_uevent(&mut self, action: UeventAction, record: &Arc<DeviceRecord>) -> (bool, bool) {
        let ours = session_id_from_sysfs_path(&record.sysfs_path)
            .map(|id| id == self.session_id)
            .unwrap_or(false);
        if !ours {
            return (false, true);
        }

        // The session dies with its own device node, not with the scsi
        // children reached through it.
        let is_session_device = record
            .sysfs_path
            .trim_end_matches('/')
            .ends_with(&self.session_id);
        if action == UeventAction::Remove && is_session_device {
            debug!("iscsi session {} closed", self.session_id);
            return (true, false);
        }

        self.refresh();
        (true, true)
    }

    fn facet_map(&self) -> FacetMap {
        let mut facets = FacetMap::new();
        facets.insert("iscsi.session".into(), self.properties());
        facets
    }
}

pub struct IscsiModule;

impl IscsiModule {
    pub fn create() -> Result<Arc<dyn Module>> {
        Ok(Arc::new(IscsiModule))
    }

    async fn iscsiadm(args: Vec<String>) -> Result<String> {
        let output = Command::new("iscsiadm")
            .args(&args)
            .output()
            .await
            .map_err(|e| Error::failed(format!("iscsiadm: {}", e)))?;
        if !output.status.success() {
            return Err(Error::failed(format!(
                "iscsiadm {:?} failed: {}",
                args,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

impl Module for IscsiModule {
    fn id(&self) -> &'static str {
        "iscsi"
    }

    fn manager_facet(&self) -> Option<Value> {
        Some(json!({ "initiator_name_file": "/etc/iscsi/initiatorname.iscsi" }))
    }

    fn handle_manager_op(&self, op: &str, args: &Value) -> Option<ManagerOpFuture> {
        match op {
            "iscsi.discover" => {
                let address = args
                    .get("address")
                    .and_then(|v| v.as_str())
                    .unwrap_or("")
                    .to_string();
                Some(Box::pin(async move {
                    if address.is_empty() {
                        return Err(Error::failed("missing address"));
                    }
                    let out = Self::iscsiadm(vec![
                        "-m".into(),
                        "discovery".into(),
                        "-t".into(),
                        "sendtargets".into(),
                        "-p".into(),
                        address,
                    ])
                    .await?;
                    Ok(json!({ "targets": out.lines().collect::<Vec<_>>() }))
                }))
            }
            "iscsi.login" => {
                let target = args
                    .get("target")
                    .and_then(|v| v.as_str())
                    .unwrap_or("")
                    .to_string();
                Some(Box::pin(async move {
                    if target.is_empty() {
                        return Err(Error::failed("missing target"));
                    }
                    Self::iscsiadm(vec![
                        "-m".into(),
                        "node".into(),
                        "-T".into(),
                        target,
                        "--login".into(),
                    ])
                    .await?;
                    Ok(json!({}))
                }))
            }
            "iscsi.logout" => {
                let target = args
                    .get("target")
                    .and_then(|v| v.as_str())
                    .unwrap_or("")
                    .to_string();
                Some(Box::pin(async move {
                    if target.is_empty() {
                        return Err(Error::failed("missing target"));
                    }
                    Self::iscsiadm(vec![
                        "-m".into(),
                        "node".into(),
                        "-T".into(),
                        target,
                        "--logout".into(),
                    ])
                    .await?;
                    Ok(json!({}))
                }))
            }
            _ => None,
        }
    }

    fn new_objects(&self, record: &Arc<DeviceRecord>) -> Vec<Box<dyn ModuleObject>> {
        if !matches!(record.subsystem, Subsystem::IscsiConnection | Subsystem::Scsi) {
            return Vec::new();
        }
        match session_id_from_sysfs_path(&record.sysfs_path) {
            Some(session_id) => {
                debug!("iscsi session {} appeared", session_id);
                vec![Box::new(IscsiSessionObject::new(session_id))]
            }
            None => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session_record(action_path: &str) -> Arc<DeviceRecord> {
        Arc::new(DeviceRecord::synthetic(
            Subsystem::IscsiConnection,
            action_path,
            action_path.rsplit('/').next().unwrap_or(""),
        ))
    }

    #[test]
    fn test_session_id_extraction() {
        assert_eq!(
            session_id_from_sysfs_path("/sys/devices/platform/host2/session1/iscsi_session/session1"),
            Some("session1".to_string())
        );
        assert_eq!(
            session_id_from_sysfs_path("/sys/devices/platform/host2/session12/target2:0:0"),
            Some("session12".to_string())
        );
        assert_eq!(session_id_from_sysfs_path("/sys/block/sda"), None);
        // "sessionX" with non-digits is not a session directory.
        assert_eq!(session_id_from_sysfs_path("/sys/foo/sessionable"), None);
    }

    #[test]
    fn test_session_object_claims_its_events() {
        let mut object = IscsiSessionObject::new("session3".into());
        let ours = session_record("/sys/devices/platform/host2/session3/target2:0:0");
        let theirs = session_record("/sys/devices/platform/host2/session4/target2:0:0");

        assert_eq!(object.process_uevent(UeventAction::Change, &ours), (true, true));
        assert_eq!(
            object.process_uevent(UeventAction::Change, &theirs),
            (false, true)
        );
    }

    #[test]
    fn test_session_retires_on_own_remove() {
        let mut object = IscsiSessionObject::new("session3".into());
        let session_dev = session_record("/sys/devices/platform/host2/session3");
        let child = session_record("/sys/devices/platform/host2/session3/target2:0:0");

        // Child removal is claimed but keeps the session alive.
        assert_eq!(
            object.process_uevent(UeventAction::Remove, &child),
            (true, true)
        );
        assert_eq!(
            object.process_uevent(UeventAction::Remove, &session_dev),
            (true, false)
        );
    }

    #[test]
    fn test_module_creates_objects_only_for_sessions() {
        let module = IscsiModule;
        let with_session = session_record("/sys/devices/platform/host2/session3");
        assert_eq!(module.new_objects(&with_session).len(), 1);

        let plain = Arc::new(DeviceRecord::synthetic(
            Subsystem::Block,
            "/sys/block/sda",
            "sda",
        ));
        assert!(module.new_objects(&plain).is_empty());
    }
}
