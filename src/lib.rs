//! Barrow - Storage Management Library
//!
//! The object model and engine behind the barrowd daemon:
//! - **Device discovery**: netlink uevent source, probe worker, dispatch
//! - **Object model**: block devices, drives (VPD-keyed), RAID arrays
//! - **Facets**: partition, filesystem, encrypted, swap, loop, NVMe
//! - **Modules**: compiled-in extensions with their own objects and facets
//! - **Operations**: mount, format, unlock, partition, eject, power-off
//! - **Crash safety**: state journal with reconciliation

pub mod ata;
pub mod auth;
pub mod block;
pub mod bus;
pub mod config;
pub mod device;
pub mod drive;
pub mod error;
pub mod housekeeping;
pub mod ipc;
pub mod iscsi;
pub mod jobs;
pub mod mdraid;
pub mod modules;
pub mod mounts;
pub mod nvme;
pub mod ops;
pub mod paths;
pub mod probe;
pub mod registry;
pub mod scsi;
pub mod state;
pub mod uevent;
