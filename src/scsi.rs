//! Block-device ioctl plumbing
//!
//! Raw ioctl and flock access shared by the probe worker and the long
//! operations: ATA identify, SCSI generic pass-through (SG_IO v4 with a
//! v3 fallback), partition-table reread and BSD advisory disk locks.

use crate::error::{Error, Result};
use std::fs::{File, OpenOptions};
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::Duration;
use tracing::{debug, warn};

const HDIO_GET_IDENTITY: libc::c_ulong = 0x030d;
const SG_IO: libc::c_ulong = 0x2285;

// Request the kernel re-read the partition table: _IO(0x12, 95).
nix::ioctl_none!(blkrrpart, 0x12, 95);
// Device size in bytes: _IOR(0x12, 114, size_t).
nix::ioctl_read!(blkgetsize64, 0x12, 114, u64);

/// 'Q' guard marking a struct sg_io_v4.
const SG_IO_V4_GUARD: i32 = 'Q' as i32;
/// 'S' interface id marking a struct sg_io_hdr (v3).
const SG_IO_V3_INTERFACE_ID: i32 = 'S' as i32;
const SG_DXFER_NONE: i32 = -1;

const SCSI_TIMEOUT_MS: u32 = 30_000;

const GOOD: u8 = 0x00;

/// SYNCHRONIZE CACHE (10), opcode 0x35.
const CDB_SYNCHRONIZE_CACHE: [u8; 10] = [0x35, 0, 0, 0, 0, 0, 0, 0, 0, 0];
/// START STOP UNIT (6), opcode 0x1b; byte 4 carries the START bit.
fn cdb_start_stop_unit(start: bool) -> [u8; 6] {
    [0x1b, 0, 0, 0, if start { 0x01 } else { 0x00 }, 0]
}

#[repr(C)]
struct SgIoV4 {
    guard: i32,
    protocol: u32,
    subprotocol: u32,
    request_len: u32,
    request: u64,
    request_tag: u64,
    request_attr: u32,
    request_priority: u32,
    request_extra: u32,
    max_response_len: u32,
    response: u64,
    dout_iovec_count: u32,
    dout_xfer_len: u32,
    din_iovec_count: u32,
    din_xfer_len: u32,
    dout_xferp: u64,
    din_xferp: u64,
    timeout: u32,
    flags: u32,
    usr_ptr: u64,
    spare_in: u32,
    driver_status: u32,
    transport_status: u32,
    device_status: u32,
    retry_delay: u32,
    info: u32,
    duration: u32,
    response_len: u32,
    din_resid: i32,
    dout_resid: i32,
    generated_tag: u64,
    spare_out: u32,
    padding: u32,
}

#[repr(C)]
struct SgIoHdr {
    interface_id: i32,
    dxfer_direction: i32,
    cmd_len: u8,
    mx_sb_len: u8,
    iovec_count: u16,
    dxfer_len: u32,
    dxferp: u64,
    cmdp: u64,
    sbp: u64,
    timeout: u32,
    flags: u32,
    pack_id: i32,
    usr_ptr: u64,
    status: u8,
    masked_status: u8,
    msg_status: u8,
    sb_len_wr: u8,
    host_status: u16,
    driver_status: u16,
    resid: i32,
    duration: u32,
    info: u32,
}

fn last_errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

/// Read the 512-byte ATA IDENTIFY data for a device node.
pub fn ata_identify(device_file: &str) -> Result<Box<[u8]>> {
    let file = OpenOptions::new().read(true).open(device_file)?;
    let mut buf = vec![0u8; 512];
    let rc = unsafe {
        libc::ioctl(
            file.as_raw_fd(),
            HDIO_GET_IDENTITY,
            buf.as_mut_ptr() as *mut libc::c_void,
        )
    };
    if rc != 0 {
        return Err(Error::failed(format!(
            "HDIO_GET_IDENTITY failed for {}: errno {}",
            device_file,
            last_errno()
        )));
    }
    Ok(buf.into_boxed_slice())
}

/// Issue a data-less SCSI command; non-good status is returned as an error
/// so callers can decide whether it is fatal.
fn scsi_command_no_data(fd: RawFd, cdb: &[u8]) -> Result<()> {
    let mut sense = [0u8; 32];

    // v4 first, fall back to v3 where the device node only speaks the
    // older interface.
    let mut v4: SgIoV4 = unsafe { std::mem::zeroed() };
    v4.guard = SG_IO_V4_GUARD;
    v4.request_len = cdb.len() as u32;
    v4.request = cdb.as_ptr() as u64;
    v4.max_response_len = sense.len() as u32;
    v4.response = sense.as_mut_ptr() as u64;
    v4.timeout = SCSI_TIMEOUT_MS;

    let rc = unsafe { libc::ioctl(fd, SG_IO, &mut v4 as *mut SgIoV4) };
    if rc == 0 {
        if v4.device_status as u8 != GOOD {
            return Err(Error::failed(format!(
                "SCSI command 0x{:02x} failed with status 0x{:02x}",
                cdb[0], v4.device_status
            )));
        }
        return Ok(());
    }

    let mut v3: SgIoHdr = unsafe { std::mem::zeroed() };
    v3.interface_id = SG_IO_V3_INTERFACE_ID;
    v3.dxfer_direction = SG_DXFER_NONE;
    v3.cmd_len = cdb.len() as u8;
    v3.mx_sb_len = sense.len() as u8;
    v3.cmdp = cdb.as_ptr() as u64;
    v3.sbp = sense.as_mut_ptr() as u64;
    v3.timeout = SCSI_TIMEOUT_MS;

    let rc = unsafe { libc::ioctl(fd, SG_IO, &mut v3 as *mut SgIoHdr) };
    if rc != 0 {
        return Err(Error::failed(format!(
            "SG_IO failed for command 0x{:02x}: errno {}",
            cdb[0],
            last_errno()
        )));
    }
    if v3.status != GOOD {
        return Err(Error::failed(format!(
            "SCSI command 0x{:02x} failed with status 0x{:02x}",
            cdb[0], v3.status
        )));
    }
    Ok(())
}

/// SYNCHRONIZE CACHE on an open block device.
pub fn synchronize_cache(file: &File) -> Result<()> {
    scsi_command_no_data(file.as_raw_fd(), &CDB_SYNCHRONIZE_CACHE)
}

/// START STOP UNIT; `start = false` spins the unit down.
pub fn start_stop_unit(file: &File, start: bool) -> Result<()> {
    scsi_command_no_data(file.as_raw_fd(), &cdb_start_stop_unit(start))
}

/// Device size in bytes via BLKGETSIZE64.
pub fn device_size(device_file: &str) -> Result<u64> {
    let file = OpenOptions::new().read(true).open(device_file)?;
    let mut size: u64 = 0;
    unsafe { blkgetsize64(file.as_raw_fd(), &mut size) }.map_err(|e| {
        Error::failed(format!("BLKGETSIZE64 failed for {}: {}", device_file, e))
    })?;
    Ok(size)
}

/// Non-blocking BSD advisory lock held for the lifetime of the guard.
pub struct DiskLock {
    file: File,
}

impl DiskLock {
    /// Shared lock; udev-aware tools take this to suppress BLKRRPART
    /// storms while a partition operation is in flight.
    pub fn shared(device_file: &str) -> Result<Self> {
        let file = OpenOptions::new().read(true).open(device_file)?;
        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_SH | libc::LOCK_NB) };
        if rc != 0 {
            return Err(Error::DeviceBusy(format!(
                "cannot lock {}: errno {}",
                device_file,
                last_errno()
            )));
        }
        Ok(Self { file })
    }

    /// Exclusive lock with retries: up to `attempts` tries spaced
    /// `backoff` apart.
    pub fn exclusive(device_file: &str, attempts: u32, backoff: Duration) -> Result<Self> {
        let file = OpenOptions::new().read(true).open(device_file)?;
        for n in 0..attempts {
            let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
            if rc == 0 {
                return Ok(Self { file });
            }
            if n + 1 < attempts {
                std::thread::sleep(backoff);
            }
        }
        Err(Error::DeviceBusy(format!(
            "cannot get exclusive lock on {}",
            device_file
        )))
    }

    pub fn file(&self) -> &File {
        &self.file
    }
}

impl Drop for DiskLock {
    fn drop(&mut self) {
        unsafe { libc::flock(self.file.as_raw_fd(), libc::LOCK_UN) };
    }
}

/// Ask the kernel to re-read the partition table.
///
/// Takes an exclusive advisory lock first (up to 10 tries, 100 ms apart)
/// so udev tooling knows we are responsible for the churn, then retries
/// BLKRRPART up to 5 times against EBUSY with 200 ms back-off. The disk
/// is opened read-only.
pub fn reread_partition_table(device_file: &str) -> Result<()> {
    let lock = DiskLock::exclusive(device_file, 10, Duration::from_millis(100))?;
    let fd = lock.file().as_raw_fd();

    let mut last = nix::errno::Errno::UnknownErrno;
    for n in 0..5 {
        match unsafe { blkrrpart(fd) } {
            Ok(_) => {
                debug!("partition table reread on {}", device_file);
                return Ok(());
            }
            Err(e) => last = e,
        }
        if last != nix::errno::Errno::EBUSY {
            break;
        }
        if n + 1 < 5 {
            std::thread::sleep(Duration::from_millis(200));
        }
    }
    warn!(
        "BLKRRPART failed for {} after retries: {}",
        device_file, last
    );
    Err(Error::failed(format!(
        "partition table reread failed for {}: {}",
        device_file, last
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cdb_layout() {
        assert_eq!(CDB_SYNCHRONIZE_CACHE.len(), 10);
        assert_eq!(CDB_SYNCHRONIZE_CACHE[0], 0x35);
        let stop = cdb_start_stop_unit(false);
        assert_eq!(stop.len(), 6);
        assert_eq!(stop[0], 0x1b);
        assert_eq!(stop[4], 0x00);
        assert_eq!(cdb_start_stop_unit(true)[4], 0x01);
    }

    #[test]
    fn test_identify_on_missing_node() {
        assert!(ata_identify("/dev/does-not-exist").is_err());
    }
}
