//! Bus object manager
//!
//! Keeps the set of exported objects with their facet property
//! snapshots and broadcasts object-manager signals (export, unexport,
//! property changes) to subscribed monitor clients. Mutation happens
//! only under the registry lock; reads serve IPC queries from the
//! snapshot without touching the registry.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Mutex;
use tokio::sync::broadcast;
use tracing::trace;

/// Object-manager signal delivered to monitor subscribers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "signal", content = "data")]
pub enum BusSignal {
    ObjectAdded {
        path: String,
        facets: BTreeMap<String, serde_json::Value>,
    },
    ObjectRemoved {
        path: String,
    },
    FacetAdded {
        path: String,
        facet: String,
        properties: serde_json::Value,
    },
    FacetRemoved {
        path: String,
        facet: String,
    },
    PropertiesChanged {
        path: String,
        facet: String,
        properties: serde_json::Value,
    },
}

/// Property snapshot of one exported object, facet name → properties.
pub type FacetMap = BTreeMap<String, serde_json::Value>;

pub struct BusHub {
    exported: Mutex<BTreeMap<String, FacetMap>>,
    tx: broadcast::Sender<BusSignal>,
}

impl BusHub {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(1024);
        Self {
            exported: Mutex::new(BTreeMap::new()),
            tx,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BusSignal> {
        self.tx.subscribe()
    }

    fn emit(&self, signal: BusSignal) {
        trace!("bus signal: {:?}", signal);
        let _ = self.tx.send(signal);
    }

    /// Export an object with its initial facet set. Re-exporting an
    /// existing path replaces the snapshot.
    pub fn export(&self, path: &str, facets: FacetMap) {
        self.exported
            .lock()
            .unwrap()
            .insert(path.to_string(), facets.clone());
        self.emit(BusSignal::ObjectAdded {
            path: path.to_string(),
            facets,
        });
    }

    pub fn unexport(&self, path: &str) {
        if self.exported.lock().unwrap().remove(path).is_some() {
            self.emit(BusSignal::ObjectRemoved {
                path: path.to_string(),
            });
        }
    }

    pub fn is_exported(&self, path: &str) -> bool {
        self.exported.lock().unwrap().contains_key(path)
    }

    /// Add or replace one facet on an exported object. Emits FacetAdded
    /// the first time, PropertiesChanged afterwards.
    pub fn publish_facet(&self, path: &str, facet: &str, properties: serde_json::Value) {
        let mut exported = self.exported.lock().unwrap();
        let facets = exported.entry(path.to_string()).or_default();
        let added = !facets.contains_key(facet);
        facets.insert(facet.to_string(), properties.clone());
        drop(exported);

        if added {
            self.emit(BusSignal::FacetAdded {
                path: path.to_string(),
                facet: facet.to_string(),
                properties,
            });
        } else {
            self.emit(BusSignal::PropertiesChanged {
                path: path.to_string(),
                facet: facet.to_string(),
                properties,
            });
        }
    }

    pub fn retract_facet(&self, path: &str, facet: &str) {
        let mut exported = self.exported.lock().unwrap();
        let removed = exported
            .get_mut(path)
            .map(|facets| facets.remove(facet).is_some())
            .unwrap_or(false);
        drop(exported);

        if removed {
            self.emit(BusSignal::FacetRemoved {
                path: path.to_string(),
                facet: facet.to_string(),
            });
        }
    }

    /// Full snapshot for GetManagedObjects-style queries.
    pub fn snapshot(&self) -> BTreeMap<String, FacetMap> {
        self.exported.lock().unwrap().clone()
    }

    pub fn object(&self, path: &str) -> Option<FacetMap> {
        self.exported.lock().unwrap().get(path).cloned()
    }

    /// Paths under a prefix, sorted.
    pub fn paths_under(&self, prefix: &str) -> Vec<String> {
        self.exported
            .lock()
            .unwrap()
            .keys()
            .filter(|p| p.starts_with(prefix))
            .cloned()
            .collect()
    }
}

impl Default for BusHub {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_export_unexport_signals() {
        let hub = BusHub::new();
        let mut rx = hub.subscribe();

        let mut facets = FacetMap::new();
        facets.insert("block".into(), json!({"device": "/dev/sda"}));
        hub.export("/barrow/block_devices/sda", facets);
        hub.unexport("/barrow/block_devices/sda");

        assert!(matches!(
            rx.try_recv().unwrap(),
            BusSignal::ObjectAdded { .. }
        ));
        assert!(matches!(
            rx.try_recv().unwrap(),
            BusSignal::ObjectRemoved { .. }
        ));
    }

    #[test]
    fn test_facet_add_then_change() {
        let hub = BusHub::new();
        hub.export("/barrow/drives/x", FacetMap::new());
        let mut rx = hub.subscribe();

        hub.publish_facet("/barrow/drives/x", "ata", json!({"smart_enabled": true}));
        hub.publish_facet("/barrow/drives/x", "ata", json!({"smart_enabled": false}));

        assert!(matches!(rx.try_recv().unwrap(), BusSignal::FacetAdded { .. }));
        assert!(matches!(
            rx.try_recv().unwrap(),
            BusSignal::PropertiesChanged { .. }
        ));
    }

    #[test]
    fn test_unexport_unknown_is_silent() {
        let hub = BusHub::new();
        let mut rx = hub.subscribe();
        hub.unexport("/barrow/block_devices/nope");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_paths_under() {
        let hub = BusHub::new();
        hub.export("/barrow/block_devices/sda", FacetMap::new());
        hub.export("/barrow/block_devices/sdb", FacetMap::new());
        hub.export("/barrow/drives/d", FacetMap::new());
        let paths = hub.paths_under("/barrow/block_devices/");
        assert_eq!(paths.len(), 2);
    }
}
