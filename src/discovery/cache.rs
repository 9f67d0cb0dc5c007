use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use log::{debug, error, info};

use crate::config::io::PreferenceStore;
use crate::config::types::PREF_KNOWN_COMPATIBLE_DEVICES;

/// Compatibility of every peripheral seen in earlier scans, keyed by address.
///
/// Clones share the same map. Each `record` rewrites the whole map to the store before
/// returning, so the store never lags the map by more than the update in progress.
#[derive(Clone)]
pub struct KnownDeviceCache {
    store: Arc<dyn PreferenceStore>,
    known: Arc<Mutex<HashMap<String, bool>>>,
}

/// Malformed or absent input yields an empty mapping.
pub fn load(store: &dyn PreferenceStore) -> HashMap<String, bool> {
    let blob = match store.get_string(PREF_KNOWN_COMPATIBLE_DEVICES) {
        Some(blob) => blob,
        None => return HashMap::new(),
    };

    match serde_json::from_str::<HashMap<String, bool>>(&blob) {
        Ok(known) => {
            debug!("Read list of known devs:");
            for (address, compatible) in &known {
                debug!("{}:{}", address, compatible);
            }
            known
        },
        Err(err) => {
            error!("Ignoring malformed list of known devs: {}", err);
            HashMap::new()
        },
    }
}

impl KnownDeviceCache {
    pub fn load(store: Arc<dyn PreferenceStore>) -> Self {
        let known = load(store.as_ref());
        KnownDeviceCache {
            store,
            known: Arc::new(Mutex::new(known)),
        }
    }

    pub fn get(&self, identifier: &str) -> Option<bool> {
        self.known.lock().expect("Failed to lock KnownDeviceCache").get(identifier).copied()
    }

    pub fn len(&self) -> usize {
        self.known.lock().expect("Failed to lock KnownDeviceCache").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> HashMap<String, bool> {
        self.known.lock().expect("Failed to lock KnownDeviceCache").clone()
    }

    pub fn record(&self, identifier: &str, compatible: bool) {
        info!("cacheDevice: {}:{}", identifier, compatible);

        // hold the lock while writing so concurrent records reach the store in order
        let mut known = self.known.lock().expect("Failed to lock KnownDeviceCache");
        known.insert(identifier.to_string(), compatible);

        let blob = match serde_json::to_string(&*known) {
            Ok(blob) => blob,
            Err(err) => {
                error!("Failed to encode list of known devs: {}", err);
                return;
            },
        };
        debug!("Write list of known devs: {}", blob);

        if let Err(err) = self.store.set_string(PREF_KNOWN_COMPATIBLE_DEVICES, &blob) {
            error!("Failed to write list of known devs: {}", err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::io::MemoryStore;

    fn persisted(store: &MemoryStore) -> HashMap<String, bool> {
        let blob = store.get_string(PREF_KNOWN_COMPATIBLE_DEVICES).unwrap();
        serde_json::from_str(&blob).unwrap()
    }

    #[test]
    fn absent_blob_is_empty() {
        let store = Arc::new(MemoryStore::new());
        assert!(KnownDeviceCache::load(store).is_empty());
    }

    #[test]
    fn malformed_blob_is_empty() {
        let store = Arc::new(MemoryStore::new());
        store.set_string(PREF_KNOWN_COMPATIBLE_DEVICES, "{\"AA:BB\": \"yes\"").unwrap();
        assert!(KnownDeviceCache::load(store.clone()).is_empty());

        store.set_string(PREF_KNOWN_COMPATIBLE_DEVICES, "").unwrap();
        assert!(KnownDeviceCache::load(store).is_empty());
    }

    #[test]
    fn loads_prepopulated_blob() {
        let store = Arc::new(MemoryStore::new());
        store.set_string(PREF_KNOWN_COMPATIBLE_DEVICES, r#"{"AA:BB:CC:DD:EE:FF": true, "11:22:33:44:55:66": false}"#).unwrap();

        let cache = KnownDeviceCache::load(store);
        assert_eq!(cache.get("AA:BB:CC:DD:EE:FF"), Some(true));
        assert_eq!(cache.get("11:22:33:44:55:66"), Some(false));
        assert_eq!(cache.get("00:00:00:00:00:00"), None);
    }

    #[test]
    fn record_writes_through() {
        let store = Arc::new(MemoryStore::new());
        let cache = KnownDeviceCache::load(store.clone());

        cache.record("AA:BB:CC:DD:EE:FF", true);
        assert_eq!(persisted(&store), cache.snapshot());

        cache.record("AA:BB:CC:DD:EE:FF", false);
        assert_eq!(persisted(&store).get("AA:BB:CC:DD:EE:FF"), Some(&false));
    }

    #[test]
    fn recording_twice_is_idempotent() {
        let store = Arc::new(MemoryStore::new());
        let cache = KnownDeviceCache::load(store.clone());

        cache.record("AA:BB:CC:DD:EE:FF", true);
        cache.record("11:22:33:44:55:66", false);
        let first = persisted(&store);

        cache.record("11:22:33:44:55:66", false);
        assert_eq!(persisted(&store), first);
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn survives_reload() {
        let store = Arc::new(MemoryStore::new());
        KnownDeviceCache::load(store.clone()).record("AA:BB:CC:DD:EE:FF", true);

        let reloaded = KnownDeviceCache::load(store);
        assert_eq!(reloaded.get("AA:BB:CC:DD:EE:FF"), Some(true));
    }
}
