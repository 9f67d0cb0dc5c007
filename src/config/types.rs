use log::{info, warn};

use crate::config::io::PreferenceStore;
use crate::error::ConfigError;

pub const PREF_FILTER_INCOMPATIBLE: &str = "pref_filterincompatible";
pub const PREF_SCAN_CLASSIC: &str = "pref_scanBT";
pub const PREF_SCAN_LOW_ENERGY: &str = "pref_scanBLE";
pub const PREF_KNOWN_COMPATIBLE_DEVICES: &str = "pref_knowncompatibledevs";
pub const PREF_DEVICE_ADDR: &str = "device_addr";
pub const PREF_DEVICE_NAME: &str = "device_name";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Preferences {
    /// Hide peripherals that do not speak the robot protocol
    pub compatible_only: bool,
    pub scan_classic: bool,
    pub scan_low_energy: bool,
}

impl Default for Preferences {
    fn default() -> Self {
        Preferences {
            compatible_only: true,
            scan_classic: true,
            scan_low_energy: true,
        }
    }
}

impl Preferences {
    pub fn load(store: &dyn PreferenceStore) -> Self {
        let defaults = Preferences::default();
        Preferences {
            compatible_only: store.get_bool(PREF_FILTER_INCOMPATIBLE, defaults.compatible_only),
            scan_classic: store.get_bool(PREF_SCAN_CLASSIC, defaults.scan_classic),
            scan_low_energy: store.get_bool(PREF_SCAN_LOW_ENERGY, defaults.scan_low_energy),
        }
    }

    pub fn save(&self, store: &dyn PreferenceStore) -> Result<(), ConfigError> {
        store.set_all(vec![
            (PREF_FILTER_INCOMPATIBLE, self.compatible_only.into()),
            (PREF_SCAN_CLASSIC, self.scan_classic.into()),
            (PREF_SCAN_LOW_ENERGY, self.scan_low_energy.into()),
        ])
    }
}

/// The most recently successfully connected robot, used for auto-connect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DefaultDevice {
    pub identifier: String,
    pub name: String,
}

impl DefaultDevice {
    pub fn load(store: &dyn PreferenceStore) -> Option<Self> {
        let identifier = store.get_string(PREF_DEVICE_ADDR)?;
        if identifier.is_empty() {
            return None;
        }

        Some(DefaultDevice {
            identifier,
            name: store.get_string(PREF_DEVICE_NAME).unwrap_or_default(),
        })
    }

    // Only call this after a confirmed connection
    pub fn save(&self, store: &dyn PreferenceStore) {
        let result = store.set_all(vec![
            (PREF_DEVICE_ADDR, self.identifier.as_str().into()),
            (PREF_DEVICE_NAME, self.name.as_str().into()),
        ]);

        match result {
            Ok(_) => info!("saved {}:{} as autoconnect device", self.name, self.identifier),
            Err(err) => warn!("Failed to save autoconnect device: {}", err),
        }
    }
}
