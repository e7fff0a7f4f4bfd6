//! Authorization gate
//!
//! Every external call passes through a blocking policy check before it
//! touches the registry. The caller's credentials come from the Unix
//! socket peer; the decision comes from the Guardian security agent
//! when its socket is reachable, with a root-only fallback otherwise.

use crate::device::DeviceRecord;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tracing::{debug, warn};
use uuid::Uuid;

const GUARDIAN_SOCKET: &str = "/run/guardian/guardian.sock";

/// Credentials of the IPC caller, resolved once per call from the
/// socket peer and cached for its duration.
#[derive(Debug, Clone, Copy)]
pub struct CallerCreds {
    pub uid: u32,
    pub gid: u32,
    pub pid: Option<i32>,
}

impl CallerCreds {
    pub fn root() -> Self {
        Self {
            uid: 0,
            gid: 0,
            pid: None,
        }
    }
}

/// Outcome taxonomy propagated to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthOutcome {
    Authorized,
    NotAuthorized,
    /// The user dismissed the authentication dialog.
    NotAuthorizedDismissed,
    /// A challenge is available; the caller may retry interactively.
    NotAuthorizedCanObtain,
}

/// Compose an action id following the `<base>[.system|.other-seat|.crypttab]`
/// discipline. The first applicable qualifier wins.
pub fn action_id(base: &str, system_device: bool, other_seat: bool, in_crypttab: bool) -> String {
    if in_crypttab {
        format!("{}.crypttab", base)
    } else if other_seat {
        format!("{}.other-seat", base)
    } else if system_device {
        format!("{}.system", base)
    } else {
        base.to_string()
    }
}

/// Detail dictionary shown by the policy authority's dialog.
pub fn details_for_record(record: &DeviceRecord) -> BTreeMap<String, String> {
    let mut details = BTreeMap::new();
    let mut put = |key: &str, value: Option<String>| {
        if let Some(value) = value.filter(|v| !v.is_empty()) {
            details.insert(key.to_string(), value);
        }
    };

    put("drive.vendor", record.property_decoded("ID_VENDOR"));
    put("drive.model", record.property_decoded("ID_MODEL"));
    put("drive.serial", record.property("ID_SERIAL").map(str::to_string));
    put("drive.wwn", record.property("ID_WWN_WITH_EXTENSION").map(str::to_string));
    put("drive.revision", record.property("ID_REVISION").map(str::to_string));
    put("id.type", record.property("ID_FS_TYPE").map(str::to_string));
    put("id.usage", record.property("ID_FS_USAGE").map(str::to_string));
    put("id.label", record.property_decoded("ID_FS_LABEL"));
    put("id.uuid", record.property("ID_FS_UUID").map(str::to_string));
    put(
        "partition.number",
        record.property("ID_PART_ENTRY_NUMBER").map(str::to_string),
    );
    put(
        "partition.type",
        record.property("ID_PART_ENTRY_TYPE").map(str::to_string),
    );
    put("device", record.device_file.clone());

    let drive_label = match (
        record.property_decoded("ID_VENDOR"),
        record.property_decoded("ID_MODEL"),
    ) {
        (Some(vendor), Some(model)) => Some(format!("{} {}", vendor, model)),
        (None, Some(model)) => Some(model),
        (Some(vendor), None) => Some(vendor),
        (None, None) => record.device_file.clone(),
    };
    put("drive", drive_label);
    details
}

/// Options flag suppressing the interactive authentication dialog.
pub fn allow_no_interaction(options: &serde_json::Value) -> bool {
    options
        .get("auth.no_user_interaction")
        .and_then(|v| v.as_bool())
        .unwrap_or(false)
}

#[derive(Debug, Serialize)]
#[serde(tag = "type")]
enum AuthorityRequest {
    CheckAction {
        request_id: Uuid,
        action_id: String,
        uid: u32,
        gid: u32,
        pid: Option<i32>,
        message: String,
        allow_interaction: bool,
        details: BTreeMap<String, String>,
    },
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum AuthorityResponse {
    Decision {
        #[allow(dead_code)]
        request_id: Uuid,
        decision: String,
    },
    Error {
        message: String,
    },
}

pub struct AuthGate {
    socket_path: PathBuf,
}

impl AuthGate {
    pub fn new() -> Self {
        Self {
            socket_path: PathBuf::from(GUARDIAN_SOCKET),
        }
    }

    pub fn with_socket(path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: path.into(),
        }
    }

    /// Check authorization for `action_id`, blocking the calling task
    /// for the duration (possibly a long time when a dialog is shown).
    pub async fn check(
        &self,
        creds: CallerCreds,
        action_id: &str,
        options: &serde_json::Value,
        message: &str,
        details: BTreeMap<String, String>,
    ) -> Result<()> {
        let outcome = self
            .resolve(creds, action_id, options, message, details)
            .await;
        match outcome {
            AuthOutcome::Authorized => Ok(()),
            AuthOutcome::NotAuthorized => Err(Error::NotAuthorized(format!(
                "not authorized for {}",
                action_id
            ))),
            AuthOutcome::NotAuthorizedDismissed => Err(Error::NotAuthorizedDismissed(format!(
                "authentication dismissed for {}",
                action_id
            ))),
            AuthOutcome::NotAuthorizedCanObtain => Err(Error::NotAuthorizedCanObtain(format!(
                "authentication required for {}",
                action_id
            ))),
        }
    }

    async fn resolve(
        &self,
        creds: CallerCreds,
        action_id: &str,
        options: &serde_json::Value,
        message: &str,
        details: BTreeMap<String, String>,
    ) -> AuthOutcome {
        match self
            .consult_authority(creds, action_id, options, message, details)
            .await
        {
            Ok(outcome) => outcome,
            Err(e) => {
                // No policy authority: only root may proceed.
                debug!("policy authority unavailable ({}), falling back to uid check", e);
                if creds.uid == 0 {
                    AuthOutcome::Authorized
                } else {
                    AuthOutcome::NotAuthorized
                }
            }
        }
    }

    async fn consult_authority(
        &self,
        creds: CallerCreds,
        action_id: &str,
        options: &serde_json::Value,
        message: &str,
        details: BTreeMap<String, String>,
    ) -> Result<AuthOutcome> {
        let stream = UnixStream::connect(&self.socket_path)
            .await
            .map_err(|e| Error::failed(format!("connect {}: {}", self.socket_path.display(), e)))?;

        let request = AuthorityRequest::CheckAction {
            request_id: Uuid::new_v4(),
            action_id: action_id.to_string(),
            uid: creds.uid,
            gid: creds.gid,
            pid: creds.pid,
            message: message.to_string(),
            allow_interaction: !allow_no_interaction(options),
            details,
        };

        let mut stream = stream;
        let json = serde_json::to_string(&request)?;
        stream.write_all(json.as_bytes()).await?;
        stream.write_all(b"\n").await?;
        stream.flush().await?;

        let mut reader = BufReader::new(stream);
        let mut line = String::new();
        reader.read_line(&mut line).await?;

        match serde_json::from_str::<AuthorityResponse>(&line)? {
            AuthorityResponse::Decision { decision, .. } => Ok(match decision.as_str() {
                "allow" => AuthOutcome::Authorized,
                "deny-dismissed" => AuthOutcome::NotAuthorizedDismissed,
                "challenge" => AuthOutcome::NotAuthorizedCanObtain,
                other => {
                    if other != "deny" {
                        warn!("unknown authority decision {:?}, treating as deny", other);
                    }
                    AuthOutcome::NotAuthorized
                }
            }),
            AuthorityResponse::Error { message } => {
                Err(Error::failed(format!("authority error: {}", message)))
            }
        }
    }
}

impl Default for AuthGate {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::Subsystem;
    use serde_json::json;

    #[test]
    fn test_action_id_discipline() {
        assert_eq!(action_id("mount", false, false, false), "mount");
        assert_eq!(action_id("mount", true, false, false), "mount.system");
        assert_eq!(action_id("mount", true, true, false), "mount.other-seat");
        assert_eq!(action_id("unlock", true, true, true), "unlock.crypttab");
    }

    #[test]
    fn test_no_interaction_flag() {
        assert!(allow_no_interaction(&json!({"auth.no_user_interaction": true})));
        assert!(!allow_no_interaction(&json!({})));
        assert!(!allow_no_interaction(&json!({"auth.no_user_interaction": false})));
    }

    #[test]
    fn test_details_for_record() {
        let mut record = DeviceRecord::synthetic(Subsystem::Block, "/sys/block/sda", "sda");
        record.properties.insert("ID_VENDOR".into(), "ATA".into());
        record
            .properties
            .insert("ID_MODEL".into(), "Samsung\\x20SSD".into());
        record.properties.insert("ID_SERIAL".into(), "S123".into());
        record.device_file = Some("/dev/sda".into());
        let details = details_for_record(&record);
        assert_eq!(details.get("drive.model").unwrap(), "Samsung SSD");
        assert_eq!(details.get("drive").unwrap(), "ATA Samsung SSD");
        assert_eq!(details.get("device").unwrap(), "/dev/sda");
    }

    #[tokio::test]
    async fn test_fallback_allows_root_only() {
        let gate = AuthGate::with_socket("/nonexistent/guardian.sock");
        let ok = gate
            .check(
                CallerCreds::root(),
                "format",
                &json!({}),
                "Format the device",
                BTreeMap::new(),
            )
            .await;
        assert!(ok.is_ok());

        let denied = gate
            .check(
                CallerCreds {
                    uid: 1000,
                    gid: 1000,
                    pid: None,
                },
                "format",
                &json!({}),
                "Format the device",
                BTreeMap::new(),
            )
            .await;
        assert!(matches!(denied, Err(Error::NotAuthorized(_))));
    }
}
