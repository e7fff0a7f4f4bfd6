//! Kernel uevent source
//!
//! Subscribes to kernel hot-plug notifications over a netlink
//! `NETLINK_KOBJECT_UEVENT` socket, filtered to the block, scsi, nvme and
//! iscsi_connection subsystems. Runs on its own thread with its own poll
//! loop so slow consumers never back-pressure the kernel socket.

use crate::device::Subsystem;
use anyhow::{anyhow, Result};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error};

/// Uevent action, including the synthetic `Reconfigure` injected when
/// configuration files change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UeventAction {
    Add,
    Change,
    Remove,
    Move,
    Online,
    Offline,
    Reconfigure,
    Other,
}

impl UeventAction {
    pub fn parse(s: &str) -> Self {
        match s {
            "add" => UeventAction::Add,
            "change" => UeventAction::Change,
            "remove" => UeventAction::Remove,
            "move" => UeventAction::Move,
            "online" => UeventAction::Online,
            "offline" => UeventAction::Offline,
            "reconfigure" => UeventAction::Reconfigure,
            _ => UeventAction::Other,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            UeventAction::Add => "add",
            UeventAction::Change => "change",
            UeventAction::Remove => "remove",
            UeventAction::Move => "move",
            UeventAction::Online => "online",
            UeventAction::Offline => "offline",
            UeventAction::Reconfigure => "reconfigure",
            UeventAction::Other => "other",
        }
    }
}

impl fmt::Display for UeventAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A raw kernel notification before probing.
#[derive(Debug, Clone)]
pub struct Uevent {
    pub action: UeventAction,
    pub subsystem: Subsystem,
    /// Full sysfs path (/sys prefixed).
    pub sysfs_path: String,
    /// Properties from the netlink message environment.
    pub properties: HashMap<String, String>,
}

/// Netlink socket monitor for kernel uevents.
pub struct UeventSource {
    socket: i32,
    buffer: Vec<u8>,
}

impl UeventSource {
    pub fn new() -> Result<Self> {
        let socket = unsafe {
            libc::socket(
                libc::AF_NETLINK,
                libc::SOCK_DGRAM | libc::SOCK_CLOEXEC,
                libc::NETLINK_KOBJECT_UEVENT,
            )
        };
        if socket < 0 {
            return Err(anyhow!("failed to create netlink socket"));
        }

        let mut addr: libc::sockaddr_nl = unsafe { std::mem::zeroed() };
        addr.nl_family = libc::AF_NETLINK as u16;
        addr.nl_groups = 1; // kernel uevent multicast group

        let result = unsafe {
            libc::bind(
                socket,
                &addr as *const _ as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_nl>() as libc::socklen_t,
            )
        };
        if result < 0 {
            unsafe { libc::close(socket) };
            return Err(anyhow!("failed to bind netlink socket"));
        }

        Ok(Self {
            socket,
            buffer: vec![0u8; 16384],
        })
    }

    /// Blocking receive with a poll timeout; `None` on timeout or on a
    /// message outside the subscribed subsystems.
    pub fn receive(&mut self, timeout_ms: i32) -> Result<Option<Uevent>> {
        let mut fds = libc::pollfd {
            fd: self.socket,
            events: libc::POLLIN,
            revents: 0,
        };
        let ready = unsafe { libc::poll(&mut fds, 1, timeout_ms) };
        if ready <= 0 || (fds.revents & libc::POLLIN) == 0 {
            return Ok(None);
        }

        let len = unsafe {
            libc::recv(
                self.socket,
                self.buffer.as_mut_ptr() as *mut libc::c_void,
                self.buffer.len(),
                0,
            )
        };
        if len <= 0 {
            return Ok(None);
        }

        parse_uevent(&self.buffer[..len as usize])
    }

    /// Run the receive loop until `stop` is set, forwarding events to `tx`.
    pub fn run(mut self, tx: std::sync::mpsc::Sender<Uevent>, stop: Arc<AtomicBool>) {
        debug!("uevent source started");
        while !stop.load(Ordering::Relaxed) {
            match self.receive(200) {
                Ok(Some(event)) => {
                    if tx.send(event).is_err() {
                        break;
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    error!("netlink receive error: {}", e);
                    std::thread::sleep(std::time::Duration::from_secs(1));
                }
            }
        }
        debug!("uevent source stopped");
    }
}

impl Drop for UeventSource {
    fn drop(&mut self) {
        unsafe { libc::close(self.socket) };
    }
}

/// Parse a kernel uevent message: `ACTION@DEVPATH\0KEY=VALUE\0...`.
/// Messages from subsystems we do not subscribe to yield `None`.
pub fn parse_uevent(data: &[u8]) -> Result<Option<Uevent>> {
    let mut parts = data.split(|&b| b == 0);

    let header = parts
        .next()
        .and_then(|h| std::str::from_utf8(h).ok())
        .ok_or_else(|| anyhow!("invalid uevent header"))?;

    // Skip libudev-format messages; we listen to the raw kernel group.
    if header.starts_with("libudev") {
        return Ok(None);
    }

    let (action, devpath) = header
        .split_once('@')
        .ok_or_else(|| anyhow!("invalid uevent format: {:?}", header))?;

    let mut properties = HashMap::new();
    let mut subsystem = None;
    for part in parts {
        if part.is_empty() {
            continue;
        }
        if let Ok(s) = std::str::from_utf8(part) {
            if let Some((key, value)) = s.split_once('=') {
                if key == "SUBSYSTEM" {
                    subsystem = Subsystem::parse(value);
                }
                properties.insert(key.to_string(), value.to_string());
            }
        }
    }

    let subsystem = match subsystem {
        Some(s) => s,
        None => return Ok(None),
    };

    Ok(Some(Uevent {
        action: UeventAction::parse(action),
        subsystem,
        sysfs_path: format!("/sys{}", devpath),
        properties,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(parts: &[&str]) -> Vec<u8> {
        let mut out = Vec::new();
        for p in parts {
            out.extend_from_slice(p.as_bytes());
            out.push(0);
        }
        out
    }

    #[test]
    fn test_parse_block_add() {
        let msg = raw(&[
            "add@/devices/pci0000:00/ata1/host0/target0:0:0/0:0:0:0/block/sda",
            "ACTION=add",
            "DEVPATH=/devices/pci0000:00/ata1/host0/target0:0:0/0:0:0:0/block/sda",
            "SUBSYSTEM=block",
            "DEVNAME=sda",
            "DEVTYPE=disk",
            "MAJOR=8",
            "MINOR=0",
        ]);
        let event = parse_uevent(&msg).unwrap().unwrap();
        assert_eq!(event.action, UeventAction::Add);
        assert_eq!(event.subsystem, Subsystem::Block);
        assert!(event.sysfs_path.ends_with("/block/sda"));
        assert_eq!(event.properties.get("DEVNAME").unwrap(), "sda");
    }

    #[test]
    fn test_parse_skips_foreign_subsystem() {
        let msg = raw(&["add@/devices/net/eth0", "SUBSYSTEM=net"]);
        assert!(parse_uevent(&msg).unwrap().is_none());
    }

    #[test]
    fn test_parse_skips_libudev() {
        let mut msg = b"libudev".to_vec();
        msg.push(0);
        msg.extend_from_slice(&[1, 2, 3, 4]);
        assert!(parse_uevent(&msg).unwrap().is_none());
    }

    #[test]
    fn test_action_parse() {
        assert_eq!(UeventAction::parse("add"), UeventAction::Add);
        assert_eq!(UeventAction::parse("reconfigure"), UeventAction::Reconfigure);
        assert_eq!(UeventAction::parse("bind"), UeventAction::Other);
    }
}
