//! Long operations
//!
//! Each external operation runs on its own task: authorization first,
//! then helper execution with the registry lock released, then journal
//! and publish. Cancellation is a distinct outcome from failure; every
//! journal write is reversed when the operation fails afterwards.

use crate::auth::{self, AuthGate, CallerCreds};
use crate::device::DeviceRecord;
use crate::error::{Error, Result};
use crate::jobs::{CancelToken, JobRegistry};
use crate::registry::Registry;
use crate::scsi;
use crate::state::StateJournal;
use serde_json::{json, Value};
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Everything an operation needs to run.
pub struct OpContext {
    pub registry: Arc<Registry>,
    pub jobs: Arc<JobRegistry>,
    pub auth: Arc<AuthGate>,
    pub state: Arc<StateJournal>,
}

/// Mount options a non-privileged caller may pass through.
const PERMITTED_MOUNT_OPTIONS: &[&str] = &[
    "ro", "rw", "sync", "dirsync", "noatime", "nodiratime", "relatime", "strictatime",
    "lazytime", "noexec", "nosuid", "nodev", "discard", "flush",
];
const PERMITTED_MOUNT_OPTION_PREFIXES: &[&str] = &["umask=", "uid=", "gid=", "iocharset=", "codepage="];

fn vet_mount_options(options: &str) -> Result<()> {
    for option in options.split(',').filter(|o| !o.is_empty()) {
        let ok = PERMITTED_MOUNT_OPTIONS.contains(&option)
            || PERMITTED_MOUNT_OPTION_PREFIXES
                .iter()
                .any(|p| option.starts_with(p));
        if !ok {
            return Err(Error::OptionNotPermitted(option.to_string()));
        }
    }
    Ok(())
}

/// Run an external helper, racing it against the cancel token. On
/// cancellation the child is killed and `Cancelled` is returned.
async fn run_helper(
    cancel: &mut CancelToken,
    program: &str,
    args: &[&str],
    stdin: Option<&str>,
) -> Result<String> {
    debug!("running helper {} {:?}", program, args);
    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if stdin.is_some() {
        cmd.stdin(Stdio::piped());
    }

    let mut child = cmd
        .spawn()
        .map_err(|e| Error::failed(format!("{}: {}", program, e)))?;

    if let Some(data) = stdin {
        if let Some(mut pipe) = child.stdin.take() {
            pipe.write_all(data.as_bytes()).await?;
            drop(pipe);
        }
    }

    let output = tokio::select! {
        output = child.wait_with_output() => {
            output.map_err(|e| Error::failed(format!("{}: {}", program, e)))?
        }
        _ = cancel.cancelled() => {
            return Err(Error::Cancelled);
        }
    };

    if !output.status.success() {
        return Err(Error::failed(format!(
            "{} exited with {}: {}",
            program,
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Best-effort sleep/shutdown inhibitor held across a critical
/// section, obtained from the power daemon. Failure to obtain one
/// never blocks the operation.
pub struct SleepInhibitor {
    acquired: bool,
}

const POWER_DAEMON_SOCKET: &str = "/run/slumber/slumber.sock";

impl SleepInhibitor {
    pub async fn acquire(reason: &str) -> Self {
        let acquired = Self::send(&json!({
            "type": "Inhibit",
            "who": "barrowd",
            "why": reason,
            "what": "sleep:shutdown",
        }))
        .await;
        if !acquired {
            debug!("no sleep inhibitor for {:?} (power daemon unavailable)", reason);
        }
        Self { acquired }
    }

    pub async fn release(self) {
        if self.acquired {
            let _ = Self::send(&json!({ "type": "Uninhibit", "who": "barrowd" })).await;
        }
    }

    async fn send(request: &Value) -> bool {
        let mut stream = match tokio::net::UnixStream::connect(POWER_DAEMON_SOCKET).await {
            Ok(stream) => stream,
            Err(_) => return false,
        };
        let text = format!("{}\n", request);
        if stream.write_all(text.as_bytes()).await.is_err() {
            return false;
        }
        let mut reader = tokio::io::BufReader::new(stream);
        let mut line = String::new();
        tokio::io::AsyncBufReadExt::read_line(&mut reader, &mut line)
            .await
            .map(|_| line.contains("Success"))
            .unwrap_or(false)
    }
}

/// Poll the object manager until `object_path` appears.
pub async fn wait_for_object(ctx: &OpContext, object_path: &str, timeout: Duration) -> Result<()> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if ctx.registry.hub.is_exported(object_path) {
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(Error::failed(format!(
                "timeout waiting for {}",
                object_path
            )));
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

fn block_record(ctx: &OpContext, object_path: &str) -> Result<Arc<DeviceRecord>> {
    ctx.registry
        .block_record_by_path(object_path)
        .ok_or_else(|| Error::failed(format!("no such block object {}", object_path)))
}

fn device_file(record: &DeviceRecord) -> Result<&str> {
    record
        .device_file
        .as_deref()
        .ok_or_else(|| Error::failed("device has no node"))
}

/// Authorization wrapper shared by the block operations.
async fn check_block_auth(
    ctx: &OpContext,
    caller: CallerCreds,
    record: &DeviceRecord,
    block_path: &str,
    base_action: &str,
    options: &Value,
    message: &str,
) -> Result<()> {
    let (system_device, other_seat) = match ctx.registry.drive_of_block(block_path) {
        Some((drive_record, seat)) => (
            drive_record.sysfs_attr("removable") != Some("1"),
            seat != "seat0",
        ),
        None => (true, false),
    };
    let action = auth::action_id(base_action, system_device, other_seat, false);
    ctx.auth
        .check(caller, &action, options, message, auth::details_for_record(record))
        .await
}

/* ----- mount / unmount ----- */

pub async fn mount(
    ctx: &OpContext,
    caller: CallerCreds,
    block_path: &str,
    options: &Value,
) -> Result<Value> {
    let record = block_record(ctx, block_path)?;
    let device = device_file(&record)?.to_string();

    if ctx.state.find_mounted_fs(record.device_number).is_some() {
        return Err(Error::DeviceBusy(format!("{} is already mounted", device)));
    }

    let mount_options = options
        .get("options")
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string();
    vet_mount_options(&mount_options)?;

    check_block_auth(
        ctx,
        caller,
        &record,
        block_path,
        "org.daemoniorum.barrow.filesystem-mount",
        options,
        "Authentication is required to mount the filesystem",
    )
    .await?;

    // Mount point from label, uuid or device name, under the caller's
    // media directory.
    let label = record
        .property_decoded("ID_FS_LABEL")
        .filter(|l| !l.is_empty() && !l.contains('/'))
        .or_else(|| record.property("ID_FS_UUID").map(str::to_string))
        .unwrap_or_else(|| record.device_name.clone());
    let mount_point = format!("/run/media/{}/{}", caller.uid, label);
    std::fs::create_dir_all(&mount_point)?;

    let handle = ctx
        .jobs
        .start("filesystem-mount", vec![block_path.to_string()], caller.uid, false);
    let mut cancel = handle.cancel.clone();

    let mut args = vec![device.as_str(), mount_point.as_str()];
    if !mount_options.is_empty() {
        args.push("-o");
        args.push(mount_options.as_str());
    }
    let result = run_helper(&mut cancel, "mount", &args, None).await;

    match result {
        Ok(_) => {
            ctx.state
                .add_mounted_fs(&mount_point, record.device_number, caller.uid, false)?;
            ctx.jobs.complete(handle.id, true, "mounted");
            info!("mounted {} at {}", device, mount_point);
            Ok(json!({ "mount_point": mount_point }))
        }
        Err(e) => {
            let _ = std::fs::remove_dir(&mount_point);
            ctx.jobs.complete(handle.id, false, &e.to_string());
            Err(e)
        }
    }
}

pub async fn unmount(
    ctx: &OpContext,
    caller: CallerCreds,
    block_path: &str,
    options: &Value,
) -> Result<Value> {
    let record = block_record(ctx, block_path)?;
    let device = device_file(&record)?.to_string();

    let entry = ctx.state.find_mounted_fs(record.device_number);

    // A mount made by another user needs elevated authorization.
    if entry.as_ref().map(|e| e.uid != caller.uid).unwrap_or(true) {
        check_block_auth(
            ctx,
            caller,
            &record,
            block_path,
            "org.daemoniorum.barrow.filesystem-unmount-others",
            options,
            "Authentication is required to unmount a filesystem mounted by another user",
        )
        .await?;
    }

    let force = options.get("force").and_then(|v| v.as_bool()).unwrap_or(false);
    let handle = ctx
        .jobs
        .start("filesystem-unmount", vec![block_path.to_string()], caller.uid, false);
    let mut cancel = handle.cancel.clone();

    let mut args = vec![device.as_str()];
    if force {
        args.push("--lazy");
    }
    let result = run_helper(&mut cancel, "umount", &args, None).await;

    match result {
        Ok(_) => {
            if let Some(entry) = entry {
                ctx.state.remove_mounted_fs(record.device_number)?;
                if !entry.fstab_mount {
                    let _ = std::fs::remove_dir(&entry.mount_point);
                }
            }
            ctx.jobs.complete(handle.id, true, "unmounted");
            Ok(json!({}))
        }
        Err(e) => {
            ctx.jobs.complete(handle.id, false, &e.to_string());
            Err(e)
        }
    }
}

/* ----- format ----- */

pub async fn format(
    ctx: &OpContext,
    caller: CallerCreds,
    block_path: &str,
    options: &Value,
) -> Result<Value> {
    let record = block_record(ctx, block_path)?;
    let device = device_file(&record)?.to_string();

    if ctx.state.find_mounted_fs(record.device_number).is_some() {
        return Err(Error::DeviceBusy(format!("{} is mounted", device)));
    }

    let fs_type = options
        .get("type")
        .and_then(|v| v.as_str())
        .unwrap_or("ext4")
        .to_string();
    if !fs_type.chars().all(|c| c.is_ascii_alphanumeric() || c == '.') {
        return Err(Error::NotSupported(format!("filesystem type {:?}", fs_type)));
    }

    check_block_auth(
        ctx,
        caller,
        &record,
        block_path,
        "org.daemoniorum.barrow.modify-device",
        options,
        "Authentication is required to format the device",
    )
    .await?;

    let handle = ctx
        .jobs
        .start("format-mkfs", vec![block_path.to_string()], caller.uid, true);
    let mut cancel = handle.cancel.clone();

    let result = async {
        run_helper(&mut cancel, "wipefs", &["--all", &device], None).await?;
        let mkfs = format!("mkfs.{}", fs_type);
        let mut args: Vec<String> = Vec::new();
        if let Some(label) = options.get("label").and_then(|v| v.as_str()) {
            match fs_type.as_str() {
                "vfat" => args.extend(["-n".to_string(), label.to_string()]),
                _ => args.extend(["-L".to_string(), label.to_string()]),
            }
        }
        args.push(device.clone());
        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        run_helper(&mut cancel, &mkfs, &arg_refs, None).await
    }
    .await;

    match result {
        Ok(_) => {
            ctx.jobs.complete(handle.id, true, "formatted");
            info!("formatted {} as {}", device, fs_type);
            Ok(json!({}))
        }
        Err(Error::Cancelled) => {
            ctx.jobs.complete(handle.id, false, "cancelled");
            Err(Error::Cancelled)
        }
        Err(e) => {
            ctx.jobs.complete(handle.id, false, &e.to_string());
            Err(e)
        }
    }
}

/* ----- encrypted devices ----- */

pub async fn unlock(
    ctx: &OpContext,
    caller: CallerCreds,
    block_path: &str,
    passphrase: &str,
    options: &Value,
) -> Result<Value> {
    let record = block_record(ctx, block_path)?;
    let device = device_file(&record)?.to_string();

    if record.property("ID_FS_USAGE") != Some("crypto") {
        return Err(Error::NotSupported(format!(
            "{} is not an encrypted device",
            device
        )));
    }
    if ctx
        .state
        .find_unlocked_crypto_dev(record.device_number)
        .is_some()
    {
        return Err(Error::DeviceBusy(format!("{} is already unlocked", device)));
    }

    check_block_auth(
        ctx,
        caller,
        &record,
        block_path,
        "org.daemoniorum.barrow.encrypted-unlock",
        options,
        "Authentication is required to unlock the encrypted device",
    )
    .await?;

    let name = format!("barrow-luks-{}", record.device_number);
    let handle = ctx
        .jobs
        .start("encrypted-unlock", vec![block_path.to_string()], caller.uid, false);
    let mut cancel = handle.cancel.clone();

    let result = run_helper(
        &mut cancel,
        "cryptsetup",
        &["open", "--type", "luks", &device, &name, "--key-file", "-"],
        Some(passphrase),
    )
    .await;

    match result {
        Ok(_) => {
            let cleartext = format!("/dev/mapper/{}", name);
            let cleartext_dev = std::fs::metadata(&cleartext)
                .ok()
                .map(|m| std::os::unix::fs::MetadataExt::rdev(&m))
                .unwrap_or(0);
            ctx.state.add_unlocked_crypto_dev(
                cleartext_dev,
                record.device_number,
                record.property("DM_UUID"),
                caller.uid,
            )?;
            ctx.jobs.complete(handle.id, true, "unlocked");
            Ok(json!({ "cleartext_device": cleartext }))
        }
        Err(e) => {
            ctx.jobs.complete(handle.id, false, &e.to_string());
            Err(e)
        }
    }
}

pub async fn lock(
    ctx: &OpContext,
    caller: CallerCreds,
    block_path: &str,
    options: &Value,
) -> Result<Value> {
    let record = block_record(ctx, block_path)?;
    let device = device_file(&record)?.to_string();

    let entry = ctx
        .state
        .find_unlocked_crypto_dev(record.device_number)
        .ok_or_else(|| Error::failed(format!("{} is not unlocked", device)))?;

    if entry.uid != caller.uid {
        check_block_auth(
            ctx,
            caller,
            &record,
            block_path,
            "org.daemoniorum.barrow.encrypted-lock-others",
            options,
            "Authentication is required to lock a device unlocked by another user",
        )
        .await?;
    }

    let name = format!("barrow-luks-{}", record.device_number);
    let handle = ctx
        .jobs
        .start("encrypted-lock", vec![block_path.to_string()], caller.uid, false);
    let mut cancel = handle.cancel.clone();

    let result = run_helper(&mut cancel, "cryptsetup", &["close", &name], None).await;
    match result {
        Ok(_) => {
            ctx.state.remove_unlocked_crypto_dev(record.device_number)?;
            ctx.jobs.complete(handle.id, true, "locked");
            Ok(json!({}))
        }
        Err(e) => {
            ctx.jobs.complete(handle.id, false, &e.to_string());
            Err(e)
        }
    }
}

/* ----- loop devices ----- */

pub async fn loop_setup(
    ctx: &OpContext,
    caller: CallerCreds,
    file: &str,
    options: &Value,
) -> Result<Value> {
    let backing = Path::new(file);
    if !backing.is_file() {
        return Err(Error::failed(format!("{} is not a regular file", file)));
    }

    ctx.auth
        .check(
            caller,
            "org.daemoniorum.barrow.loop-setup",
            options,
            "Authentication is required to set up a loop device",
            Default::default(),
        )
        .await?;

    let read_only = options
        .get("read_only")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);

    let handle = ctx.jobs.start("loop-setup", Vec::new(), caller.uid, false);
    let mut cancel = handle.cancel.clone();

    let mut args = vec!["--find", "--show"];
    if read_only {
        args.push("--read-only");
    }
    args.push(file);
    let result = run_helper(&mut cancel, "losetup", &args, None).await;

    match result {
        Ok(out) => {
            let loop_device = out.trim().to_string();
            let backing_dev = std::fs::metadata(backing)
                .map(|m| std::os::unix::fs::MetadataExt::dev(&m))
                .unwrap_or(0);
            ctx.state
                .add_loop(&loop_device, file, backing_dev, caller.uid)?;
            // Give the uevent pipeline a chance to surface the object
            // before the caller goes looking for it.
            let name = loop_device.rsplit('/').next().unwrap_or("").to_string();
            if let Err(e) = wait_for_object(
                ctx,
                &crate::paths::block_device(&name),
                Duration::from_secs(10),
            )
            .await
            {
                warn!("loop object did not appear: {}", e);
            }
            ctx.jobs.complete(handle.id, true, "loop set up");
            Ok(json!({ "device": loop_device }))
        }
        Err(e) => {
            ctx.jobs.complete(handle.id, false, &e.to_string());
            Err(e)
        }
    }
}

pub async fn loop_delete(
    ctx: &OpContext,
    caller: CallerCreds,
    block_path: &str,
    options: &Value,
) -> Result<Value> {
    let record = block_record(ctx, block_path)?;
    let device = device_file(&record)?.to_string();

    let entry = ctx.state.has_loop(&device);
    if entry.as_ref().map(|e| e.uid != caller.uid).unwrap_or(true) {
        ctx.auth
            .check(
                caller,
                "org.daemoniorum.barrow.loop-delete-others",
                options,
                "Authentication is required to delete a loop device set up by another user",
                auth::details_for_record(&record),
            )
            .await?;
    }

    let handle = ctx
        .jobs
        .start("loop-delete", vec![block_path.to_string()], caller.uid, false);
    let mut cancel = handle.cancel.clone();

    let result = run_helper(&mut cancel, "losetup", &["--detach", &device], None).await;
    match result {
        Ok(_) => {
            ctx.state.remove_loop(&device)?;
            ctx.jobs.complete(handle.id, true, "loop deleted");
            Ok(json!({}))
        }
        Err(e) => {
            ctx.jobs.complete(handle.id, false, &e.to_string());
            Err(e)
        }
    }
}

/* ----- mdraid ----- */

pub async fn mdraid_start(
    ctx: &OpContext,
    caller: CallerCreds,
    mdraid_path: &str,
    options: &Value,
) -> Result<Value> {
    let uuid = ctx
        .registry
        .mdraid_uuid_by_path(mdraid_path)
        .ok_or_else(|| Error::failed(format!("no such array {}", mdraid_path)))?;

    ctx.auth
        .check(
            caller,
            "org.daemoniorum.barrow.manage-md-raid",
            options,
            "Authentication is required to start the RAID array",
            Default::default(),
        )
        .await?;

    let handle = ctx
        .jobs
        .start("mdraid-start", vec![mdraid_path.to_string()], caller.uid, false);
    let mut cancel = handle.cancel.clone();

    let uuid_arg = format!("--uuid={}", uuid.replace(':', ""));
    let result = run_helper(
        &mut cancel,
        "mdadm",
        &["--assemble", "--scan", &uuid_arg],
        None,
    )
    .await;

    match result {
        Ok(_) => {
            if let Some(array) = ctx.registry.mdraid_array_device(&uuid) {
                ctx.state.add_mdraid(array.device_number, caller.uid)?;
            }
            ctx.jobs.complete(handle.id, true, "array started");
            Ok(json!({}))
        }
        Err(e) => {
            ctx.jobs.complete(handle.id, false, &e.to_string());
            Err(e)
        }
    }
}

pub async fn mdraid_stop(
    ctx: &OpContext,
    caller: CallerCreds,
    mdraid_path: &str,
    options: &Value,
) -> Result<Value> {
    let uuid = ctx
        .registry
        .mdraid_uuid_by_path(mdraid_path)
        .ok_or_else(|| Error::failed(format!("no such array {}", mdraid_path)))?;
    let array = ctx
        .registry
        .mdraid_array_device(&uuid)
        .ok_or_else(|| Error::failed("array is not running"))?;
    let device = device_file(&array)?.to_string();

    if ctx.state.find_mounted_fs(array.device_number).is_some() {
        return Err(Error::DeviceBusy(format!("{} is mounted", device)));
    }

    ctx.auth
        .check(
            caller,
            "org.daemoniorum.barrow.manage-md-raid",
            options,
            "Authentication is required to stop the RAID array",
            auth::details_for_record(&array),
        )
        .await?;

    let handle = ctx
        .jobs
        .start("mdraid-stop", vec![mdraid_path.to_string()], caller.uid, false);
    let mut cancel = handle.cancel.clone();

    let result = run_helper(&mut cancel, "mdadm", &["--stop", &device], None).await;
    match result {
        Ok(_) => {
            ctx.state.remove_mdraid(array.device_number)?;
            ctx.jobs.complete(handle.id, true, "array stopped");
            Ok(json!({}))
        }
        Err(e) => {
            ctx.jobs.complete(handle.id, false, &e.to_string());
            Err(e)
        }
    }
}

/* ----- eject and power-off ----- */

pub async fn eject(
    ctx: &OpContext,
    caller: CallerCreds,
    drive_path: &str,
    options: &Value,
) -> Result<Value> {
    let (record, seat) = ctx
        .registry
        .drive_by_path(drive_path)
        .ok_or_else(|| Error::failed(format!("no such drive {}", drive_path)))?;
    let device = device_file(&record)?.to_string();

    let action = auth::action_id(
        "org.daemoniorum.barrow.eject-media",
        record.sysfs_attr("removable") != Some("1"),
        seat != "seat0",
        false,
    );
    ctx.auth
        .check(
            caller,
            &action,
            options,
            "Authentication is required to eject the media",
            auth::details_for_record(&record),
        )
        .await?;

    let handle = ctx
        .jobs
        .start("drive-eject", vec![drive_path.to_string()], caller.uid, false);
    let mut cancel = handle.cancel.clone();

    let result = run_helper(&mut cancel, "eject", &[device.as_str()], None).await;
    match result {
        Ok(_) => {
            ctx.jobs.complete(handle.id, true, "ejected");
            Ok(json!({}))
        }
        Err(e) => {
            ctx.jobs.complete(handle.id, false, &e.to_string());
            Err(e)
        }
    }
}

/// Spin a drive down and cut power to its USB port: sync and flush each
/// sibling block device (failures are non-fatal), then write '1' to the
/// USB parent's `remove` attribute.
pub async fn power_off(
    ctx: &OpContext,
    caller: CallerCreds,
    drive_path: &str,
    options: &Value,
) -> Result<Value> {
    let (record, seat) = ctx
        .registry
        .drive_by_path(drive_path)
        .ok_or_else(|| Error::failed(format!("no such drive {}", drive_path)))?;

    let action = auth::action_id(
        "org.daemoniorum.barrow.power-off-drive",
        record.sysfs_attr("removable") != Some("1"),
        seat != "seat0",
        false,
    );
    ctx.auth
        .check(
            caller,
            &action,
            options,
            "Authentication is required to power off the drive",
            auth::details_for_record(&record),
        )
        .await?;

    let handle = ctx
        .jobs
        .start("drive-power-off", vec![drive_path.to_string()], caller.uid, false);

    // An untimely suspend mid-sequence would leave the disk half spun
    // down with dirty caches.
    let inhibitor = SleepInhibitor::acquire("powering off a drive").await;

    let sysfs_path = record.sysfs_path.clone();
    let device = record.device_file.clone();
    let result = tokio::task::spawn_blocking(move || power_off_blocking(&sysfs_path, device))
        .await
        .map_err(|e| Error::failed(format!("power-off worker: {}", e)));
    inhibitor.release().await;
    let result = result?;

    match result {
        Ok(()) => {
            ctx.jobs.complete(handle.id, true, "powered off");
            Ok(json!({}))
        }
        Err(e) => {
            ctx.jobs.complete(handle.id, false, &e.to_string());
            Err(e)
        }
    }
}

fn power_off_blocking(sysfs_path: &str, device: Option<String>) -> Result<()> {
    if let Some(device) = device {
        match std::fs::OpenOptions::new().read(true).open(&device) {
            Ok(file) => {
                // Flush caches and spin down; a drive that refuses is
                // still powered off.
                unsafe {
                    libc::syncfs(std::os::unix::io::AsRawFd::as_raw_fd(&file));
                }
                if let Err(e) = scsi::synchronize_cache(&file) {
                    warn!("SYNCHRONIZE CACHE failed for {}: {}", device, e);
                }
                if let Err(e) = scsi::start_stop_unit(&file, false) {
                    warn!("START STOP UNIT failed for {}: {}", device, e);
                }
            }
            Err(e) => warn!("cannot open {} for power-off: {}", device, e),
        }
    }

    let remove_attr = find_usb_remove_attr(sysfs_path)
        .ok_or_else(|| Error::NotSupported("drive has no powerable USB parent".into()))?;
    std::fs::write(&remove_attr, "1")
        .map_err(|e| Error::failed(format!("write {}: {}", remove_attr, e)))?;
    info!("powered off {}", sysfs_path);
    Ok(())
}

/// Walk up from the device to the USB device ancestor carrying a
/// `remove` attribute.
fn find_usb_remove_attr(sysfs_path: &str) -> Option<String> {
    let mut dir = Path::new(sysfs_path).to_path_buf();
    for _ in 0..12 {
        let candidate = dir.join("remove");
        if candidate.exists() {
            let subsystem = std::fs::read_link(dir.join("subsystem")).ok()?;
            if subsystem.to_string_lossy().ends_with("/usb") {
                return Some(candidate.to_string_lossy().into_owned());
            }
        }
        dir = dir.parent()?.to_path_buf();
    }
    None
}

/* ----- partition operations ----- */

pub async fn partition_create(
    ctx: &OpContext,
    caller: CallerCreds,
    table_path: &str,
    options: &Value,
) -> Result<Value> {
    let record = block_record(ctx, table_path)?;
    let device = device_file(&record)?.to_string();

    check_block_auth(
        ctx,
        caller,
        &record,
        table_path,
        "org.daemoniorum.barrow.modify-device",
        options,
        "Authentication is required to create a partition",
    )
    .await?;

    let offset = options.get("offset").and_then(|v| v.as_u64()).unwrap_or(0);
    let size = options
        .get("size")
        .and_then(|v| v.as_u64())
        .ok_or_else(|| Error::failed("missing size"))?;
    let part_type = options
        .get("type")
        .and_then(|v| v.as_str())
        .unwrap_or("primary")
        .to_string();

    let handle = ctx
        .jobs
        .start("partition-create", vec![table_path.to_string()], caller.uid, false);
    let mut cancel = handle.cancel.clone();

    // The shared advisory lock tells udev-aware tools a partition
    // operation is in flight and suppresses BLKRRPART storms.
    let lock = scsi::DiskLock::shared(&device)?;

    let start = format!("{}B", offset);
    let end = format!("{}B", offset + size);
    let result = run_helper(
        &mut cancel,
        "parted",
        &["--script", &device, "mkpart", &part_type, &start, &end],
        None,
    )
    .await;
    drop(lock);

    match result {
        Ok(_) => {
            let device_clone = device.clone();
            let reread =
                tokio::task::spawn_blocking(move || scsi::reread_partition_table(&device_clone))
                    .await
                    .map_err(|e| Error::failed(format!("reread worker: {}", e)))?;
            if let Err(e) = reread {
                warn!("partition table reread after create failed: {}", e);
            }
            ctx.jobs.complete(handle.id, true, "partition created");
            Ok(json!({}))
        }
        Err(e) => {
            ctx.jobs.complete(handle.id, false, &e.to_string());
            Err(e)
        }
    }
}

pub async fn partition_delete(
    ctx: &OpContext,
    caller: CallerCreds,
    block_path: &str,
    options: &Value,
) -> Result<Value> {
    let record = block_record(ctx, block_path)?;
    let number = record
        .property_as_int("ID_PART_ENTRY_NUMBER")
        .ok_or_else(|| Error::NotSupported("not a partition".into()))?;
    // Strip the partition suffix off the node to get the whole disk.
    let disk_device = record
        .device_file
        .clone()
        .unwrap_or_default()
        .trim_end_matches(|c: char| c.is_ascii_digit())
        .trim_end_matches('p')
        .to_string();
    if disk_device.is_empty() {
        return Err(Error::failed("cannot determine parent disk"));
    }

    check_block_auth(
        ctx,
        caller,
        &record,
        block_path,
        "org.daemoniorum.barrow.modify-device",
        options,
        "Authentication is required to delete a partition",
    )
    .await?;

    let handle = ctx
        .jobs
        .start("partition-delete", vec![block_path.to_string()], caller.uid, false);
    let mut cancel = handle.cancel.clone();

    let lock = scsi::DiskLock::shared(&disk_device)?;
    let number_arg = number.to_string();
    let result = run_helper(
        &mut cancel,
        "parted",
        &["--script", &disk_device, "rm", &number_arg],
        None,
    )
    .await;
    drop(lock);

    match result {
        Ok(_) => {
            let disk_clone = disk_device.clone();
            let _ = tokio::task::spawn_blocking(move || scsi::reread_partition_table(&disk_clone))
                .await;
            ctx.jobs.complete(handle.id, true, "partition deleted");
            Ok(json!({}))
        }
        Err(e) => {
            ctx.jobs.complete(handle.id, false, &e.to_string());
            Err(e)
        }
    }
}

pub async fn partition_resize(
    ctx: &OpContext,
    caller: CallerCreds,
    block_path: &str,
    options: &Value,
) -> Result<Value> {
    let record = block_record(ctx, block_path)?;
    let device = device_file(&record)?.to_string();
    let number = record
        .property_as_int("ID_PART_ENTRY_NUMBER")
        .ok_or_else(|| Error::NotSupported("not a partition".into()))?;
    let size = options
        .get("size")
        .and_then(|v| v.as_u64())
        .ok_or_else(|| Error::failed("missing size"))?;
    let offset = record
        .property_as_int("ID_PART_ENTRY_OFFSET")
        .unwrap_or(0)
        .max(0) as u64
        * 512;

    let disk_device = device
        .trim_end_matches(|c: char| c.is_ascii_digit())
        .trim_end_matches('p')
        .to_string();

    check_block_auth(
        ctx,
        caller,
        &record,
        block_path,
        "org.daemoniorum.barrow.modify-device",
        options,
        "Authentication is required to resize a partition",
    )
    .await?;

    let handle = ctx
        .jobs
        .start("partition-resize", vec![block_path.to_string()], caller.uid, false);
    let mut cancel = handle.cancel.clone();

    let lock = scsi::DiskLock::shared(&disk_device)?;
    let number_arg = number.to_string();
    let end = format!("{}B", offset + size);
    let result = run_helper(
        &mut cancel,
        "parted",
        &["--script", &disk_device, "resizepart", &number_arg, &end],
        None,
    )
    .await;
    drop(lock);

    match result {
        Ok(_) => {
            let disk_clone = disk_device.clone();
            let _ = tokio::task::spawn_blocking(move || scsi::reread_partition_table(&disk_clone))
                .await;
            // Read the size back so the caller sees what the kernel
            // actually granted.
            let new_size = scsi::device_size(&device).unwrap_or(0);
            ctx.jobs.complete(handle.id, true, "partition resized");
            Ok(json!({ "size": new_size }))
        }
        Err(e) => {
            ctx.jobs.complete(handle.id, false, &e.to_string());
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mount_option_vetting() {
        assert!(vet_mount_options("").is_ok());
        assert!(vet_mount_options("ro,noexec,nosuid").is_ok());
        assert!(vet_mount_options("uid=1000,gid=1000,umask=022").is_ok());
        assert!(matches!(
            vet_mount_options("ro,suid"),
            Err(Error::OptionNotPermitted(_))
        ));
        assert!(matches!(
            vet_mount_options("loop"),
            Err(Error::OptionNotPermitted(_))
        ));
    }

    #[test]
    fn test_usb_remove_attr_walk_gives_up() {
        assert!(find_usb_remove_attr("/nonexistent/sys/path").is_none());
    }
}
