//! Module subsystem
//!
//! Modules extend the daemon with standalone exported objects, extra
//! facets on block and drive objects, and a manager facet on the root
//! manager object. Modules are compiled in and registered here; they
//! are instantiated on demand (lazily, at startup with
//! `--force-load-modules`, or never with `--disable-modules`).
//!
//! Uevent routing gives existing instances the first chance to claim an
//! event; a new instance is only constructed when no existing one did,
//! and never for remove events.

use crate::bus::{BusHub, FacetMap};
use crate::device::DeviceRecord;
use crate::error::Result;
use crate::jobs::CancelToken;
use crate::uevent::UeventAction;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Future returned by a module's manager operation. Construction
/// happens under the registry lock; the IPC layer awaits it after the
/// lock is released, so helpers may take their time.
pub type ManagerOpFuture = Pin<Box<dyn Future<Output = Result<Value>> + Send>>;

/// A standalone object exported by a module under the object-manager
/// root (e.g. an iSCSI session).
pub trait ModuleObject: Send {
    fn object_path(&self) -> String;
    /// Returns `(processed, keep)`: whether this instance claimed the
    /// event, and whether it stays alive afterwards.
    fn process_uevent(&mut self, action: UeventAction, record: &Arc<DeviceRecord>) -> (bool, bool);
    fn facet_map(&self) -> FacetMap;
    fn housekeeping(&mut self, _secs_since_last: u64, _cancel: &CancelToken) -> Result<()> {
        Ok(())
    }
}

/// A module-owned facet attached to a block or drive object.
pub trait ModuleFacet: Send {
    fn process_uevent(&mut self, action: UeventAction, record: &Arc<DeviceRecord>) -> (bool, bool);
    fn properties(&self) -> Value;
    fn housekeeping(&mut self, _secs_since_last: u64, _cancel: &CancelToken) -> Result<()> {
        Ok(())
    }
}

/// A compiled-in extension module.
pub trait Module: Send + Sync {
    /// Unique id; also the facet-name prefix on the bus.
    fn id(&self) -> &'static str;

    /// Properties of the manager facet attached to the root manager,
    /// if the module provides one.
    fn manager_facet(&self) -> Option<Value> {
        None
    }

    /// Manager operation dispatch; `None` when the op is not ours. The
    /// returned future must do its own I/O — it runs outside the
    /// registry lock.
    fn handle_manager_op(&self, _op: &str, _args: &Value) -> Option<ManagerOpFuture> {
        None
    }

    /// Construct standalone objects claiming `record`.
    fn new_objects(&self, _record: &Arc<DeviceRecord>) -> Vec<Box<dyn ModuleObject>> {
        Vec::new()
    }

    fn block_facet_types(&self) -> &'static [&'static str] {
        &[]
    }

    fn drive_facet_types(&self) -> &'static [&'static str] {
        &[]
    }

    fn new_block_facet(
        &self,
        _record: &Arc<DeviceRecord>,
        _facet_type: &str,
    ) -> Option<Box<dyn ModuleFacet>> {
        None
    }

    fn new_drive_facet(
        &self,
        _vpd: &str,
        _record: &Arc<DeviceRecord>,
        _facet_type: &str,
    ) -> Option<Box<dyn ModuleFacet>> {
        None
    }

    /// Coarse per-event hook, called last for every routed event.
    fn handle_uevent(&self, _record: &Arc<DeviceRecord>) {}
}

/// Failable module constructors; the registry of in-tree modules.
pub type ModuleCtor = fn() -> Result<Arc<dyn Module>>;

pub fn builtin_modules() -> Vec<ModuleCtor> {
    vec![crate::iscsi::IscsiModule::create]
}

/// The object a module facet is attached to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FacetOwner {
    Block(String),
    Drive(String),
}

#[derive(PartialEq, Eq, Hash, Clone)]
struct FacetKey {
    module: &'static str,
    owner: FacetOwner,
    facet_type: String,
}

/// A change to a module facet on a block or drive object, for the
/// registry to fold into the owner's published facet map.
pub struct ModuleFacetChange {
    pub module: &'static str,
    pub facet_type: String,
    /// `None` means the facet was removed.
    pub properties: Option<Value>,
}

pub struct ModuleManager {
    ctors: Vec<ModuleCtor>,
    modules: Vec<Arc<dyn Module>>,
    loaded: bool,
    /// Standalone instances per module id.
    objects: HashMap<&'static str, Vec<Box<dyn ModuleObject>>>,
    facets: HashMap<FacetKey, Box<dyn ModuleFacet>>,
}

impl ModuleManager {
    pub fn new(ctors: Vec<ModuleCtor>) -> Self {
        Self {
            ctors,
            modules: Vec::new(),
            loaded: false,
            objects: HashMap::new(),
            facets: HashMap::new(),
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    pub fn modules(&self) -> &[Arc<dyn Module>] {
        &self.modules
    }

    /// Instantiate every registered module. Returns true when this call
    /// transitioned the manager into the loaded state; the caller owes
    /// the object model a synthetic coldplug afterwards.
    pub fn ensure_loaded(&mut self) -> bool {
        if self.loaded {
            return false;
        }
        for ctor in &self.ctors {
            match ctor() {
                Ok(module) => {
                    info!("module {} loaded", module.id());
                    self.modules.push(module);
                }
                Err(e) => warn!("module failed to initialize: {}", e),
            }
        }
        self.loaded = true;
        true
    }

    /// Manager facets for the root manager object.
    pub fn manager_facets(&self) -> Vec<(&'static str, Value)> {
        self.modules
            .iter()
            .filter_map(|m| m.manager_facet().map(|v| (m.id(), v)))
            .collect()
    }

    pub fn handle_manager_op(&self, op: &str, args: &Value) -> Option<ManagerOpFuture> {
        self.modules
            .iter()
            .find_map(|m| m.handle_manager_op(op, args))
    }

    /// Route an event into the standalone objects of every module.
    /// Export/unexport happens through `hub`; the caller holds the
    /// registry lock.
    pub fn route_objects(
        &mut self,
        action: UeventAction,
        record: &Arc<DeviceRecord>,
        hub: &BusHub,
    ) {
        for module in &self.modules {
            let instances = self.objects.entry(module.id()).or_default();
            let mut handled = false;

            // Existing instances first.
            let mut n = 0;
            while n < instances.len() {
                let (processed, keep) = instances[n].process_uevent(action, record);
                if processed {
                    handled = true;
                    if !keep {
                        let instance = instances.remove(n);
                        hub.unexport(&instance.object_path());
                        continue;
                    }
                    // Re-publish the claimed instance's state.
                    let path = instances[n].object_path();
                    for (facet, props) in instances[n].facet_map() {
                        hub.publish_facet(&path, &facet, props);
                    }
                }
                n += 1;
            }

            // Only create a fresh instance when nobody claimed the event.
            if !handled && action != UeventAction::Remove {
                for mut instance in module.new_objects(record) {
                    // Coldplug the newborn so it sees the event that
                    // created it.
                    let _ = instance.process_uevent(action, record);
                    hub.export(&instance.object_path(), instance.facet_map());
                    debug!(
                        "module {} created object {}",
                        module.id(),
                        instance.object_path()
                    );
                    instances.push(instance);
                }
            }

            module.handle_uevent(record);
        }
    }

    /// Route an event into the module facets of one block or drive
    /// object. Returns the facet changes for the owner's facet map.
    pub fn route_facets(
        &mut self,
        owner: &FacetOwner,
        action: UeventAction,
        record: &Arc<DeviceRecord>,
    ) -> Vec<ModuleFacetChange> {
        let mut changes = Vec::new();

        for module in &self.modules {
            let types: &[&'static str] = match owner {
                FacetOwner::Block(_) => module.block_facet_types(),
                FacetOwner::Drive(_) => module.drive_facet_types(),
            };
            let mut handled = false;

            for facet_type in types {
                let key = FacetKey {
                    module: module.id(),
                    owner: owner.clone(),
                    facet_type: facet_type.to_string(),
                };
                if let Some(facet) = self.facets.get_mut(&key) {
                    let (processed, keep) = facet.process_uevent(action, record);
                    if processed {
                        handled = true;
                        if keep {
                            changes.push(ModuleFacetChange {
                                module: module.id(),
                                facet_type: facet_type.to_string(),
                                properties: Some(facet.properties()),
                            });
                        } else {
                            self.facets.remove(&key);
                            changes.push(ModuleFacetChange {
                                module: module.id(),
                                facet_type: facet_type.to_string(),
                                properties: None,
                            });
                        }
                    }
                }
            }

            if !handled && action != UeventAction::Remove {
                for facet_type in types {
                    let key = FacetKey {
                        module: module.id(),
                        owner: owner.clone(),
                        facet_type: facet_type.to_string(),
                    };
                    if self.facets.contains_key(&key) {
                        continue;
                    }
                    let constructed = match owner {
                        FacetOwner::Block(_) => module.new_block_facet(record, facet_type),
                        FacetOwner::Drive(vpd) => module.new_drive_facet(vpd, record, facet_type),
                    };
                    if let Some(mut facet) = constructed {
                        let _ = facet.process_uevent(action, record);
                        changes.push(ModuleFacetChange {
                            module: module.id(),
                            facet_type: facet_type.to_string(),
                            properties: Some(facet.properties()),
                        });
                        self.facets.insert(key, facet);
                    }
                }
            }
        }

        changes
    }

    /// Drop every module facet attached to an owner (the owner object
    /// is going away).
    pub fn drop_owner_facets(&mut self, owner: &FacetOwner) {
        self.facets.retain(|key, _| key.owner != *owner);
    }

    /// Run housekeeping over all standalone instances.
    pub fn housekeep_objects(&mut self, secs_since_last: u64, cancel: &CancelToken) {
        for (module, instances) in self.objects.iter_mut() {
            for instance in instances.iter_mut() {
                if let Err(e) = instance.housekeeping(secs_since_last, cancel) {
                    if e.is_recoverable() {
                        debug!(
                            "housekeeping for {} object {}: {}",
                            module,
                            instance.object_path(),
                            e
                        );
                    } else {
                        warn!(
                            "housekeeping failed for {} object {}: {}",
                            module,
                            instance.object_path(),
                            e
                        );
                    }
                }
            }
        }
    }

    /// Number of live standalone objects, all modules together.
    pub fn object_count(&self) -> usize {
        self.objects.values().map(Vec::len).sum()
    }

    pub fn module_ids(&self) -> Vec<&'static str> {
        self.modules.iter().map(|m| m.id()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::Subsystem;
    use crate::error::Error;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    static CREATED: AtomicUsize = AtomicUsize::new(0);

    struct ProbeFacet {
        claimed_path: String,
    }

    impl ModuleFacet for ProbeFacet {
        fn process_uevent(
            &mut self,
            action: UeventAction,
            record: &Arc<DeviceRecord>,
        ) -> (bool, bool) {
            if record.sysfs_path != self.claimed_path {
                return (false, true);
            }
            (true, action != UeventAction::Offline)
        }

        fn properties(&self) -> Value {
            json!({ "path": self.claimed_path })
        }
    }

    struct ProbeModule;

    impl Module for ProbeModule {
        fn id(&self) -> &'static str {
            "probe"
        }

        fn block_facet_types(&self) -> &'static [&'static str] {
            &["probe_block"]
        }

        fn new_block_facet(
            &self,
            record: &Arc<DeviceRecord>,
            _facet_type: &str,
        ) -> Option<Box<dyn ModuleFacet>> {
            if !record.device_name.starts_with("sd") {
                return None;
            }
            CREATED.fetch_add(1, Ordering::SeqCst);
            Some(Box::new(ProbeFacet {
                claimed_path: record.sysfs_path.clone(),
            }))
        }
    }

    fn make_ctor() -> Result<Arc<dyn Module>> {
        Ok(Arc::new(ProbeModule))
    }

    fn failing_ctor() -> Result<Arc<dyn Module>> {
        Err(Error::failed("init exploded"))
    }

    fn record(name: &str) -> Arc<DeviceRecord> {
        Arc::new(DeviceRecord::synthetic(
            Subsystem::Block,
            &format!("/sys/block/{}", name),
            name,
        ))
    }

    #[test]
    fn test_failed_module_init_is_skipped() {
        let mut manager = ModuleManager::new(vec![failing_ctor, make_ctor]);
        assert!(manager.ensure_loaded());
        assert_eq!(manager.modules().len(), 1);
        // Second call is a no-op.
        assert!(!manager.ensure_loaded());
    }

    #[test]
    fn test_facet_cardinality_is_one() {
        CREATED.store(0, Ordering::SeqCst);
        let mut manager = ModuleManager::new(vec![make_ctor]);
        manager.ensure_loaded();
        let owner = FacetOwner::Block("/sys/block/sda".into());
        let r = record("sda");

        let changes = manager.route_facets(&owner, UeventAction::Add, &r);
        assert_eq!(changes.len(), 1);
        assert!(changes[0].properties.is_some());

        // A second add is claimed by the existing facet; nothing new is
        // constructed.
        let changes = manager.route_facets(&owner, UeventAction::Add, &r);
        assert_eq!(changes.len(), 1);
        assert_eq!(CREATED.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_facet_removed_when_keep_is_false() {
        let mut manager = ModuleManager::new(vec![make_ctor]);
        manager.ensure_loaded();
        let owner = FacetOwner::Block("/sys/block/sdb".into());
        let r = record("sdb");

        manager.route_facets(&owner, UeventAction::Add, &r);
        // ProbeFacet drops itself on Offline.
        let changes = manager.route_facets(&owner, UeventAction::Offline, &r);
        assert_eq!(changes.len(), 1);
        assert!(changes[0].properties.is_none());

        // Gone: the next event constructs a fresh one.
        let changes = manager.route_facets(&owner, UeventAction::Change, &r);
        assert!(changes[0].properties.is_some());
    }

    #[test]
    fn test_no_facet_for_unclaimed_device() {
        let mut manager = ModuleManager::new(vec![make_ctor]);
        manager.ensure_loaded();
        let owner = FacetOwner::Block("/sys/block/vda".into());
        let changes = manager.route_facets(&owner, UeventAction::Add, &record("vda"));
        assert!(changes.is_empty());
    }
}
