//! Object registry and event dispatch
//!
//! The authoritative store of every exported object, guarded by one
//! coarse mutex. Probed uevents enter through `dispatch`, which mutates
//! the block/drive/mdraid/module registries in the canonical order and
//! publishes the resulting object-manager changes, all under the lock.
//!
//! Ordering matters: on add-like events parents are handled before
//! their blocks (modules, mdraid, drive, block) so a client never sees
//! a block whose drive does not exist yet; removal runs the same chain
//! in reverse.

use crate::block::{BlockContext, BlockObject, FacetChange};
use crate::bus::BusHub;
use crate::config::ModuleLoadMode;
use crate::device::{DeviceRecord, Subsystem};
use crate::drive::{self, DriveObject};
use crate::mdraid::{self, MdraidObject};
use crate::modules::{FacetOwner, ModuleCtor, ModuleManager};
use crate::mounts::MountTable;
use crate::probe::KnownPaths;
use crate::state::StateJournal;
use crate::uevent::UeventAction;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, error, info, warn};

/// Deferred per-drive work executed off the dispatch thread.
#[derive(Debug, Clone)]
pub enum DriveTask {
    /// First housekeeping pass for a newly appeared drive.
    InitialHousekeeping(String),
    /// Re-apply the persisted ATA configuration.
    ApplyConfiguration(String),
}

struct Inner {
    blocks: HashMap<String, BlockObject>,
    drives: HashMap<String, DriveObject>,
    sysfs_to_drive: HashMap<String, String>,
    mdraids: HashMap<String, MdraidObject>,
    sysfs_to_mdraid: HashMap<String, String>,
    sysfs_to_mdraid_member: HashMap<String, String>,
    modules: ModuleManager,
    /// Live sync-poll tasks per array UUID.
    mdraid_pollers: HashMap<String, tokio::task::JoinHandle<()>>,
}

pub struct Registry {
    inner: Mutex<Inner>,
    pub hub: Arc<BusHub>,
    pub state: Arc<StateJournal>,
    pub known: KnownPaths,
    pub config_dir: PathBuf,
    module_mode: ModuleLoadMode,
    coldplugging: AtomicBool,
    drive_tasks: Mutex<Option<UnboundedSender<DriveTask>>>,
}

impl Registry {
    pub fn new(
        hub: Arc<BusHub>,
        state: Arc<StateJournal>,
        known: KnownPaths,
        config_dir: PathBuf,
        module_mode: ModuleLoadMode,
        module_ctors: Vec<ModuleCtor>,
    ) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Inner {
                blocks: HashMap::new(),
                drives: HashMap::new(),
                sysfs_to_drive: HashMap::new(),
                mdraids: HashMap::new(),
                sysfs_to_mdraid: HashMap::new(),
                sysfs_to_mdraid_member: HashMap::new(),
                modules: ModuleManager::new(module_ctors),
                mdraid_pollers: HashMap::new(),
            }),
            hub,
            state,
            known,
            config_dir,
            module_mode,
            coldplugging: AtomicBool::new(false),
            drive_tasks: Mutex::new(None),
        })
    }

    /// Wire the channel draining deferred drive work.
    pub fn set_drive_task_sender(&self, tx: UnboundedSender<DriveTask>) {
        *self.drive_tasks.lock().unwrap() = Some(tx);
    }

    fn send_drive_task(&self, task: DriveTask) {
        if let Some(tx) = self.drive_tasks.lock().unwrap().as_ref() {
            let _ = tx.send(task);
        }
    }

    /// Main entry: one probed uevent, dispatched under the lock.
    pub fn dispatch(self: &Arc<Self>, action: UeventAction, record: Arc<DeviceRecord>) {
        {
            let mut inner = self.inner.lock().unwrap();
            debug!("uevent {} {}", action, record.sysfs_path);

            match record.subsystem {
                Subsystem::Block | Subsystem::Nvme => {
                    self.handle_block_uevent(&mut inner, action, &record);
                }
                Subsystem::Scsi | Subsystem::IscsiConnection => {
                    let Inner { modules, .. } = &mut *inner;
                    modules.route_objects(action, &record, &self.hub);
                }
            }
        }

        // Possibly need to clean up after anything but a plain add.
        if action != UeventAction::Add {
            self.state.check();
        }
    }

    fn handle_block_uevent(
        self: &Arc<Self>,
        inner: &mut Inner,
        action: UeventAction,
        record: &Arc<DeviceRecord>,
    ) {
        if action == UeventAction::Remove {
            self.handle_uevent_for_block(inner, action, record);
            self.handle_uevent_for_drive(inner, action, record);
            self.handle_uevent_for_mdraid(inner, action, record);
            let Inner { modules, .. } = &mut *inner;
            modules.route_objects(action, record, &self.hub);
        } else {
            // The device-mapper layer asks everyone to ignore events on
            // temporary cryptsetup nodes; obliging avoids a pile of
            // races around half-set-up cleartext devices.
            if record.property_as_bool("DM_UDEV_DISABLE_OTHER_RULES_FLAG") {
                debug!("ignoring uevent for {} (DM rules disabled)", record.sysfs_path);
                return;
            }
            {
                let Inner { modules, .. } = &mut *inner;
                modules.route_objects(action, record, &self.hub);
            }
            self.handle_uevent_for_mdraid(inner, action, record);
            self.handle_uevent_for_drive(inner, action, record);
            self.handle_uevent_for_block(inner, action, record);
        }
    }

    /* ----- block objects ----- */

    fn handle_uevent_for_block(
        self: &Arc<Self>,
        inner: &mut Inner,
        action: UeventAction,
        record: &Arc<DeviceRecord>,
    ) {
        if record.subsystem != Subsystem::Block {
            return;
        }
        let sysfs_path = record.sysfs_path.as_str();

        if action == UeventAction::Remove {
            if let Some(block) = inner.blocks.remove(sysfs_path) {
                self.block_pre_remove(inner, &block);
                let Inner { modules, .. } = &mut *inner;
                modules.drop_owner_facets(&FacetOwner::Block(sysfs_path.to_string()));
                self.hub.unexport(&block.object_path);
                self.known.remove(sysfs_path);
            }
            return;
        }

        let mounts = MountTable::load();
        let mut ctx = BlockContext::new(&mounts);

        let (drive_path, media_change_detected) = match Self::drive_for_block(inner, record) {
            Some(drive) => (drive.object_path.clone(), drive.drive.media_change_detected),
            None => (String::new(), true),
        };
        ctx.media_change_detected = media_change_detected;

        let is_new = !inner.blocks.contains_key(sysfs_path);
        if is_new {
            let mut block = BlockObject::new(Arc::clone(record));
            block.drive_path = drive_path;
            block.update(Arc::clone(record), &ctx);
            let object_path = block.object_path.clone();
            let facets = block.facet_map();
            inner.blocks.insert(sysfs_path.to_string(), block);
            self.hub.export(&object_path, facets);
            self.known.insert(sysfs_path);
        } else {
            let block = inner.blocks.get_mut(sysfs_path).unwrap();
            block.drive_path = drive_path;
            let changes = block.update(Arc::clone(record), &ctx);
            let object_path = block.object_path.clone();
            self.publish_changes(&object_path, changes);
        }

        // Module facets, existing instances first.
        {
            let Inner { blocks, modules, .. } = &mut *inner;
            let block = blocks.get_mut(sysfs_path).unwrap();
            let owner = FacetOwner::Block(sysfs_path.to_string());
            let changes = modules.route_facets(&owner, action, record);
            for change in changes {
                let facet_name = format!("{}.{}", change.module, change.facet_type);
                match change.properties {
                    Some(props) => {
                        block
                            .module_facets
                            .insert((change.module.to_string(), change.facet_type), props.clone());
                        self.hub.publish_facet(&block.object_path, &facet_name, props);
                    }
                    None => {
                        block
                            .module_facets
                            .remove(&(change.module.to_string(), change.facet_type));
                        self.hub.retract_facet(&block.object_path, &facet_name);
                    }
                }
            }
        }

        self.update_cleartext_backlink(inner, sysfs_path);
    }

    /// A cleartext device appeared for some encrypted block: point the
    /// backing block's encrypted facet at it.
    fn update_cleartext_backlink(&self, inner: &mut Inner, cleartext_sysfs: &str) {
        let (backing_sysfs, cleartext_path) = {
            let block = match inner.blocks.get(cleartext_sysfs) {
                Some(b) => b,
                None => return,
            };
            match block.crypto_backing_sysfs_path() {
                Some(backing) => (backing, block.object_path.clone()),
                None => return,
            }
        };
        if let Some(backing) = inner.blocks.get_mut(&backing_sysfs) {
            if let Some(encrypted) = backing.encrypted.as_mut() {
                if encrypted.cleartext_device != cleartext_path {
                    encrypted.cleartext_device = cleartext_path;
                    let props = serde_json::json!({
                        "type": encrypted.crypto_type,
                        "cleartext_device": encrypted.cleartext_device,
                    });
                    self.hub.publish_facet(&backing.object_path, "encrypted", props);
                }
            }
        }
    }

    /// Pre-removal hook: a vanishing cleartext block clears the
    /// cleartext pointer on its encrypted backing device.
    fn block_pre_remove(&self, inner: &mut Inner, block: &BlockObject) {
        let backing_sysfs = match block.crypto_backing_sysfs_path() {
            Some(b) => b,
            None => return,
        };
        if let Some(backing) = inner.blocks.get_mut(&backing_sysfs) {
            if let Some(encrypted) = backing.encrypted.as_mut() {
                if !encrypted.cleartext_device.is_empty() {
                    encrypted.cleartext_device = String::new();
                    let props = serde_json::json!({
                        "type": encrypted.crypto_type,
                        "cleartext_device": "",
                    });
                    self.hub.publish_facet(&backing.object_path, "encrypted", props);
                }
            }
        }
    }

    fn drive_for_block<'a>(inner: &'a Inner, record: &DeviceRecord) -> Option<&'a DriveObject> {
        // Whole disks are bound directly; partitions borrow the drive
        // of their parent disk directory.
        let vpd = inner.sysfs_to_drive.get(&record.sysfs_path).or_else(|| {
            let parent = std::path::Path::new(&record.sysfs_path).parent()?;
            inner.sysfs_to_drive.get(parent.to_str()?)
        })?;
        inner.drives.get(vpd)
    }

    /* ----- drive objects ----- */

    fn handle_uevent_for_drive(
        self: &Arc<Self>,
        inner: &mut Inner,
        action: UeventAction,
        record: &Arc<DeviceRecord>,
    ) {
        let sysfs_path = record.sysfs_path.as_str();

        if action == UeventAction::Remove {
            let vpd = match inner.sysfs_to_drive.remove(sysfs_path) {
                Some(vpd) => vpd,
                None => return,
            };
            let gone = match inner.drives.get_mut(&vpd) {
                Some(drive) => {
                    let gone = drive.remove_record(sysfs_path);
                    if !gone {
                        let changes = drive.refresh_facets();
                        let path = drive.object_path.clone();
                        self.publish_changes(&path, changes);
                    }
                    gone
                }
                None => {
                    crate::anomaly_if!(true, "drive map out of sync for VPD {}", vpd);
                    false
                }
            };
            if gone {
                if let Some(drive) = inner.drives.remove(&vpd) {
                    let Inner { modules, .. } = &mut *inner;
                    modules.drop_owner_facets(&FacetOwner::Drive(vpd.clone()));
                    self.hub.unexport(&drive.object_path);
                }
            }
            return;
        }

        let vpd = {
            let Inner { blocks, .. } = &*inner;
            let lookup = |path: &str| blocks.get(path).map(|b| Arc::clone(b.record()));
            match drive::should_include_device(record, &lookup) {
                Some(vpd) => vpd,
                None => return,
            }
        };

        // A VPD change on a live path tears the old association down
        // before the new one forms.
        if let Some(old_vpd) = inner.sysfs_to_drive.get(sysfs_path).cloned() {
            if old_vpd != vpd {
                debug!(
                    "VPD of {} changed from {} to {}",
                    sysfs_path, old_vpd, vpd
                );
                inner.sysfs_to_drive.remove(sysfs_path);
                let gone = inner
                    .drives
                    .get_mut(&old_vpd)
                    .map(|d| d.remove_record(sysfs_path))
                    .unwrap_or(false);
                if gone {
                    if let Some(old) = inner.drives.remove(&old_vpd) {
                        let Inner { modules, .. } = &mut *inner;
                        modules.drop_owner_facets(&FacetOwner::Drive(old_vpd.clone()));
                        self.hub.unexport(&old.object_path);
                    }
                }
            }
        }

        if let Some(existing) = inner.drives.get_mut(&vpd) {
            inner
                .sysfs_to_drive
                .entry(sysfs_path.to_string())
                .or_insert_with(|| vpd.clone());
            existing.upsert_record(Arc::clone(record));
            let changes = existing.refresh_facets();
            let path = existing.object_path.clone();
            self.publish_changes(&path, changes);
        } else if action == UeventAction::Add || self.coldplugging.load(Ordering::Relaxed) {
            let drive = DriveObject::new(vpd.clone(), Arc::clone(record));
            let path = drive.object_path.clone();
            let facets = drive.facet_map();
            inner.drives.insert(vpd.clone(), drive);
            inner
                .sysfs_to_drive
                .insert(sysfs_path.to_string(), vpd.clone());
            self.hub.export(&path, facets);

            // Initial housekeeping off-thread, except while coldplugging.
            if !self.coldplugging.load(Ordering::Relaxed) {
                self.send_drive_task(DriveTask::InitialHousekeeping(vpd.clone()));
            }
        } else {
            // Don't found drives on change events; this is the drive
            // analog of a spurious media-change.
            error!(
                "no drive object for {} (action {}, VPD {})",
                sysfs_path, action, vpd
            );
            return;
        }

        // Module drive facets.
        {
            let Inner { drives, modules, .. } = &mut *inner;
            if let Some(drive) = drives.get_mut(&vpd) {
                let owner = FacetOwner::Drive(vpd.clone());
                let changes = modules.route_facets(&owner, action, record);
                for change in changes {
                    let facet_name = format!("{}.{}", change.module, change.facet_type);
                    match change.properties {
                        Some(props) => {
                            drive.module_facets.insert(
                                (change.module.to_string(), change.facet_type),
                                props.clone(),
                            );
                            self.hub.publish_facet(&drive.object_path, &facet_name, props);
                        }
                        None => {
                            drive
                                .module_facets
                                .remove(&(change.module.to_string(), change.facet_type));
                            self.hub.retract_facet(&drive.object_path, &facet_name);
                        }
                    }
                }
            }
        }

        if action == UeventAction::Reconfigure {
            self.send_drive_task(DriveTask::ApplyConfiguration(vpd));
        }
    }

    /* ----- mdraid objects ----- */

    fn handle_uevent_for_mdraid(
        self: &Arc<Self>,
        inner: &mut Inner,
        action: UeventAction,
        record: &Arc<DeviceRecord>,
    ) {
        let uuid = record
            .property("UDISKS_MD_UUID")
            .or_else(|| record.property("MD_UUID"))
            .map(str::to_string);
        let member_uuid = record
            .property("UDISKS_MD_MEMBER_UUID")
            .or_else(|| record.property("MD_MEMBER_UUID"))
            .map(str::to_string);

        // A nested-RAID node can be an array and a member of another
        // array at once; both identities get the event. A node with
        // neither only matters for removal bookkeeping.
        if let Some(uuid) = &uuid {
            self.mdraid_with_uuid(inner, action, record, Some(uuid), false);
        }
        if let Some(member_uuid) = &member_uuid {
            self.mdraid_with_uuid(inner, action, record, Some(member_uuid), true);
        }
        if uuid.is_none() && member_uuid.is_none() {
            self.mdraid_with_uuid(inner, action, record, None, false);
        }
    }

    fn mdraid_with_uuid(
        self: &Arc<Self>,
        inner: &mut Inner,
        action: UeventAction,
        record: &Arc<DeviceRecord>,
        uuid: Option<&str>,
        is_member: bool,
    ) {
        let sysfs_path = record.sysfs_path.as_str();

        let mut treat_as_remove =
            action == UeventAction::Remove || uuid.map(mdraid::uuid_is_bogus).unwrap_or(true);

        // A legit-looking UUID that disagrees with the one indexed for
        // this path is still bogus; tear the old association down.
        if !treat_as_remove && !is_member {
            if let Some(current) = inner.sysfs_to_mdraid.get(sysfs_path) {
                if Some(current.as_str()) != uuid {
                    debug!(
                        "UUID of {} changed from {} to {:?}",
                        sysfs_path, current, uuid
                    );
                    treat_as_remove = true;
                }
            }
        }

        if treat_as_remove {
            if let Some(uuid) = inner.sysfs_to_mdraid_member.remove(sysfs_path) {
                if let Some(raid) = inner.mdraids.get_mut(&uuid) {
                    raid.remove_member(sysfs_path);
                    self.publish_mdraid(raid);
                }
                self.maybe_remove_mdraid(inner, &uuid);
            }
            if let Some(uuid) = inner.sysfs_to_mdraid.remove(sysfs_path) {
                if let Some(raid) = inner.mdraids.get_mut(&uuid) {
                    raid.clear_array(sysfs_path);
                    self.publish_mdraid(raid);
                }
                self.maybe_remove_mdraid(inner, &uuid);
            }
            return;
        }

        let uuid = match uuid {
            Some(uuid) => uuid.to_string(),
            None => return,
        };

        let is_new = !inner.mdraids.contains_key(&uuid);
        if is_new {
            let raid = MdraidObject::new(&uuid);
            self.hub.export(&raid.object_path, {
                let mut facets = crate::bus::FacetMap::new();
                facets.insert("mdraid".into(), raid.facet.properties());
                facets
            });
            inner.mdraids.insert(uuid.clone(), raid);
        }

        if is_member {
            inner
                .sysfs_to_mdraid_member
                .entry(sysfs_path.to_string())
                .or_insert_with(|| uuid.clone());
        } else {
            inner
                .sysfs_to_mdraid
                .entry(sysfs_path.to_string())
                .or_insert_with(|| uuid.clone());
        }

        let needs_polling = {
            let raid = inner.mdraids.get_mut(&uuid).unwrap();
            if is_member {
                raid.set_member(Arc::clone(record));
            } else {
                raid.set_array(Arc::clone(record));
            }
            self.publish_mdraid(raid);
            raid.needs_polling()
        };

        self.ensure_mdraid_polling(inner, &uuid, needs_polling);
    }

    fn publish_mdraid(&self, raid: &MdraidObject) {
        self.hub
            .publish_facet(&raid.object_path, "mdraid", raid.facet.properties());
    }

    fn maybe_remove_mdraid(&self, inner: &mut Inner, uuid: &str) {
        let gone = inner
            .mdraids
            .get(uuid)
            .map(|raid| !raid.has_devices())
            .unwrap_or(false);
        if gone {
            if let Some(raid) = inner.mdraids.remove(uuid) {
                self.hub.unexport(&raid.object_path);
            }
            if let Some(handle) = inner.mdraid_pollers.remove(uuid) {
                handle.abort();
            }
        }
    }

    /// Keep a 1 s sysfs poller alive exactly while a sync operation is
    /// in flight.
    fn ensure_mdraid_polling(self: &Arc<Self>, inner: &mut Inner, uuid: &str, wanted: bool) {
        let running = inner
            .mdraid_pollers
            .get(uuid)
            .map(|h| !h.is_finished())
            .unwrap_or(false);

        if wanted && !running {
            // Outside a runtime (unit tests) polling degrades to the
            // refresh done on each uevent.
            let handle = match tokio::runtime::Handle::try_current() {
                Ok(handle) => handle,
                Err(_) => return,
            };
            let registry = Arc::clone(self);
            let uuid_key = uuid.to_string();
            let uuid = uuid_key.clone();
            let task = handle.spawn(async move {
                let mut tick = tokio::time::interval(std::time::Duration::from_secs(1));
                tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    tick.tick().await;
                    let mut guard = registry.inner.lock().unwrap();
                    let Inner {
                        mdraids,
                        mdraid_pollers,
                        ..
                    } = &mut *guard;
                    let raid = match mdraids.get_mut(&uuid) {
                        Some(raid) => raid,
                        None => break,
                    };
                    if raid.poll_sysfs() {
                        registry.publish_mdraid(raid);
                    }
                    if !raid.needs_polling() {
                        mdraid_pollers.remove(&uuid);
                        break;
                    }
                }
            });
            inner.mdraid_pollers.insert(uuid_key, task);
        } else if !wanted && running {
            if let Some(handle) = inner.mdraid_pollers.remove(uuid) {
                handle.abort();
            }
        }
    }

    fn publish_changes(&self, object_path: &str, changes: Vec<FacetChange>) {
        for change in changes {
            match change {
                FacetChange::Added(facet, props) | FacetChange::Changed(facet, props) => {
                    self.hub.publish_facet(object_path, facet, props);
                }
                FacetChange::Removed(facet) => {
                    self.hub.retract_facet(object_path, facet);
                }
            }
        }
    }

    /* ----- modules and coldplug ----- */

    /// Load modules if allowed. On the first load the manager facets
    /// are attached and the whole device set is replayed twice so
    /// module-introduced dependencies can settle.
    pub fn enable_modules(self: &Arc<Self>) -> bool {
        if self.module_mode == ModuleLoadMode::Disabled {
            info!("modules are disabled");
            return false;
        }
        let newly_loaded = {
            let mut inner = self.inner.lock().unwrap();
            let newly = inner.modules.ensure_loaded();
            if newly {
                for (module, props) in inner.modules.manager_facets() {
                    self.hub
                        .publish_facet(&crate::paths::manager(), module, props);
                }
            }
            newly
        };
        if newly_loaded {
            debug!("modules loaded, performing synthetic coldplug");
            self.replay_known_records();
            self.replay_known_records();
        }
        newly_loaded
    }

    pub fn modules_loaded(&self) -> bool {
        self.inner.lock().unwrap().modules.is_loaded()
    }

    /// Ids of the loaded modules.
    pub fn module_ids(&self) -> Vec<&'static str> {
        self.inner.lock().unwrap().modules.module_ids()
    }

    pub fn module_mode(&self) -> ModuleLoadMode {
        self.module_mode
    }

    /// Look up a module manager operation. Only the future construction
    /// happens under the registry lock; the caller awaits the returned
    /// future after the lock is released.
    pub fn handle_module_manager_op(
        &self,
        op: &str,
        args: &serde_json::Value,
    ) -> Option<crate::modules::ManagerOpFuture> {
        self.inner.lock().unwrap().modules.handle_manager_op(op, args)
    }

    /// Synthetic coldplug of everything we already know.
    fn replay_known_records(self: &Arc<Self>) {
        let records = self.known_records();
        self.coldplugging.store(true, Ordering::Relaxed);
        for record in records {
            self.dispatch(UeventAction::Add, record);
        }
        self.coldplugging.store(false, Ordering::Relaxed);
    }

    pub fn known_records(&self) -> Vec<Arc<DeviceRecord>> {
        let inner = self.inner.lock().unwrap();
        let mut records: Vec<_> = inner
            .blocks
            .values()
            .map(|b| Arc::clone(b.record()))
            .collect();
        for drive in inner.drives.values() {
            for record in drive.records() {
                if record.subsystem != Subsystem::Block {
                    records.push(Arc::clone(record));
                }
            }
        }
        records
    }

    /// Walk sysfs and replay every existing block/nvme device as an
    /// add, in stable name order (sda before sdz before sdaa).
    pub fn coldplug(self: &Arc<Self>) {
        let mut paths: Vec<(String, Subsystem)> = Vec::new();
        for (class_dir, subsystem) in [
            ("/sys/class/block", Subsystem::Block),
            ("/sys/class/nvme", Subsystem::Nvme),
        ] {
            if let Ok(entries) = std::fs::read_dir(class_dir) {
                for entry in entries.flatten() {
                    if let Ok(target) = std::fs::canonicalize(entry.path()) {
                        paths.push((target.to_string_lossy().into_owned(), subsystem));
                    }
                }
            }
        }
        paths.sort_by(|(a, _), (b, _)| device_name_cmp(a, b));

        info!("coldplug: {} devices", paths.len());
        self.coldplugging.store(true, Ordering::Relaxed);
        for (sysfs_path, subsystem) in paths {
            let record = crate::probe::build_record(subsystem, &sysfs_path);
            self.dispatch(UeventAction::Add, Arc::new(record));
        }
        self.coldplugging.store(false, Ordering::Relaxed);
        info!("coldplug complete");
    }

    /* ----- lookups for IPC and operations ----- */

    pub fn block_record_by_path(&self, object_path: &str) -> Option<Arc<DeviceRecord>> {
        let inner = self.inner.lock().unwrap();
        inner
            .blocks
            .values()
            .find(|b| b.object_path == object_path)
            .map(|b| Arc::clone(b.record()))
    }

    /// Hardware record plus seat of the drive at `object_path`.
    pub fn drive_by_path(&self, object_path: &str) -> Option<(Arc<DeviceRecord>, String)> {
        let inner = self.inner.lock().unwrap();
        inner
            .drives
            .values()
            .find(|d| d.object_path == object_path)
            .and_then(|d| {
                d.hw_record()
                    .map(|r| (Arc::clone(r), d.seat().to_string()))
            })
    }

    /// Drive owning the given block object, if any.
    pub fn drive_of_block(&self, block_path: &str) -> Option<(Arc<DeviceRecord>, String)> {
        let inner = self.inner.lock().unwrap();
        let block = inner.blocks.values().find(|b| b.object_path == block_path)?;
        let vpd = inner.sysfs_to_drive.get(block.sysfs_path()).or_else(|| {
            let parent = std::path::Path::new(block.sysfs_path()).parent()?;
            inner.sysfs_to_drive.get(parent.to_str()?)
        })?;
        let drive = inner.drives.get(vpd)?;
        drive
            .hw_record()
            .map(|r| (Arc::clone(r), drive.seat().to_string()))
    }

    pub fn mdraid_uuid_by_path(&self, object_path: &str) -> Option<String> {
        let inner = self.inner.lock().unwrap();
        inner
            .mdraids
            .values()
            .find(|m| m.object_path == object_path)
            .map(|m| m.uuid.clone())
    }

    pub fn mdraid_array_device(&self, uuid: &str) -> Option<Arc<DeviceRecord>> {
        let inner = self.inner.lock().unwrap();
        inner
            .mdraids
            .get(uuid)
            .and_then(|m| m.array_record().cloned())
    }

    /// Device names of a drive's records, in insertion order.
    pub fn drive_device_names(&self, vpd: &str) -> Vec<String> {
        let inner = self.inner.lock().unwrap();
        inner
            .drives
            .get(vpd)
            .map(|d| d.records().iter().map(|r| r.device_name.clone()).collect())
            .unwrap_or_default()
    }

    pub fn block_count(&self) -> usize {
        self.inner.lock().unwrap().blocks.len()
    }

    pub fn drive_count(&self) -> usize {
        self.inner.lock().unwrap().drives.len()
    }

    pub fn module_object_count(&self) -> usize {
        self.inner.lock().unwrap().modules.object_count()
    }

    /* ----- housekeeping support ----- */

    pub fn drive_vpds(&self) -> Vec<String> {
        self.inner.lock().unwrap().drives.keys().cloned().collect()
    }

    /// Housekeep one drive: SMART for ATA facets, health log for NVMe
    /// I/O controllers. The lock is dropped while the refresh does
    /// device I/O.
    pub fn housekeep_drive(&self, vpd: &str, wakeup: bool) -> crate::error::Result<()> {
        // Clone what the refresh needs under the lock.
        let (record, mut ata, mut nvme_ctrl, object_path) = {
            let inner = self.inner.lock().unwrap();
            let drive = match inner.drives.get(vpd) {
                Some(drive) => drive,
                None => return Ok(()),
            };
            let record = match drive.hw_record() {
                Some(record) => Arc::clone(record),
                None => return Ok(()),
            };
            (
                record,
                drive.ata.clone(),
                drive.nvme_controller.clone(),
                drive.object_path.clone(),
            )
        };

        if let Some(facet) = ata.as_mut() {
            crate::ata::refresh_smart(&record, facet, wakeup)?;
        }
        if let Some(facet) = nvme_ctrl.as_mut() {
            if facet.wants_health_refresh() {
                crate::nvme::refresh_health(&record, facet)?;
            }
        }

        // Store the refreshed facets back, if the drive is still there.
        let mut inner = self.inner.lock().unwrap();
        if let Some(drive) = inner.drives.get_mut(vpd) {
            if let (Some(new), Some(_)) = (ata, drive.ata.as_ref()) {
                let props = new.properties();
                drive.ata = Some(new);
                self.hub.publish_facet(&object_path, "ata", props);
            }
            if let (Some(new), Some(_)) = (nvme_ctrl, drive.nvme_controller.as_ref()) {
                let props = new.properties();
                drive.nvme_controller = Some(new);
                self.hub.publish_facet(&object_path, "nvme_controller", props);
            }
        }
        Ok(())
    }

    pub fn housekeep_module_objects(&self, secs_since_last: u64) {
        let mut inner = self.inner.lock().unwrap();
        let cancel = crate::jobs::CancelToken::none();
        inner.modules.housekeep_objects(secs_since_last, &cancel);
    }

    /// Apply the persisted ATA configuration to a drive, off-loop.
    pub fn apply_drive_configuration(&self, vpd: &str) {
        let record = {
            let inner = self.inner.lock().unwrap();
            match inner.drives.get(vpd).and_then(|d| d.hw_record().cloned()) {
                Some(record) => record,
                None => return,
            }
        };
        let config = crate::config::load_drive_config(&self.config_dir, vpd).ata();
        if config.is_empty() {
            return;
        }
        if let Err(e) = crate::ata::apply_configuration(&record, &config) {
            warn!("applying configuration to drive {} failed: {}", vpd, e);
        }
    }

    /// Synthesize reconfigure events for every known block device;
    /// used when configuration files change.
    pub fn synthesize_reconfigure(self: &Arc<Self>) {
        let records = self.known_records();
        for record in records {
            self.dispatch(UeventAction::Reconfigure, record);
        }
    }

}

/// Process sda before sdz and sdz before sdaa: shorter names first,
/// then lexically.
fn device_name_cmp(a: &str, b: &str) -> std::cmp::Ordering {
    let name_a = a.rsplit('/').next().unwrap_or(a);
    let name_b = b.rsplit('/').next().unwrap_or(b);
    name_a
        .len()
        .cmp(&name_b.len())
        .then_with(|| name_a.cmp(name_b))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_name_ordering() {
        let mut names = vec![
            "/sys/block/sdaa".to_string(),
            "/sys/block/sdz".to_string(),
            "/sys/block/sda".to_string(),
        ];
        names.sort_by(|a, b| device_name_cmp(a, b));
        assert_eq!(
            names,
            vec!["/sys/block/sda", "/sys/block/sdz", "/sys/block/sdaa"]
        );
    }
}
