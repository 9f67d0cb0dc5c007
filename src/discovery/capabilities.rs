use btleplug::api::Manager as _;
use btleplug::platform::Manager;
use log::{info, warn};

use crate::config::types::Preferences;

/// What the host radio stack allows this session to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RadioCapabilities {
    pub radio_present: bool,
    pub radio_enabled: bool,
    pub classic_supported: bool,
    pub low_energy_supported: bool,
    pub discovery_permitted: bool,
}

/// Which scan phases a session runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnabledPhases {
    pub classic: bool,
    pub low_energy: bool,
}

impl RadioCapabilities {
    pub async fn probe() -> Self {
        let mut capabilities = RadioCapabilities {
            radio_present: false,
            radio_enabled: false,
            classic_supported: false,
            low_energy_supported: false,
            discovery_permitted: true,
        };

        match Manager::new().await {
            Ok(manager) => match manager.adapters().await {
                Ok(adapters) => {
                    capabilities.low_energy_supported = !adapters.is_empty();
                },
                Err(btleplug::Error::PermissionDenied) => {
                    warn!("Not allowed to use bluetooth");
                    capabilities.discovery_permitted = false;
                    capabilities.radio_present = true;
                },
                Err(err) => warn!("Failed to list BLE adapters: {:?}", err),
            },
            Err(err) => warn!("No BLE stack: {:?}", err),
        }

        probe_classic(&mut capabilities).await;

        capabilities.radio_present |= capabilities.low_energy_supported || capabilities.classic_supported;
        // btleplug can not tell whether an adapter is powered, a listed adapter counts as enabled
        capabilities.radio_enabled |= capabilities.low_energy_supported || !capabilities.discovery_permitted;
        capabilities
    }

    pub fn enabled_phases(&self, prefs: &Preferences) -> EnabledPhases {
        let mut low_energy = prefs.scan_low_energy;
        if low_energy && !self.low_energy_supported {
            info!("BLE not supported");
            low_energy = false;
        }
        if low_energy && !self.discovery_permitted {
            info!("Discovery permission not granted");
            low_energy = false;
        }

        let mut classic = prefs.scan_classic;
        if classic && !self.classic_supported {
            info!("Classic bluetooth not supported");
            classic = false;
        }

        EnabledPhases { classic, low_energy }
    }
}

#[cfg(all(feature = "bluez", target_os = "linux"))]
async fn probe_classic(capabilities: &mut RadioCapabilities) {
    let adapter = match bluer::Session::new().await {
        Ok(session) => session.default_adapter().await,
        Err(err) => {
            warn!("No BlueZ session: {:?}", err);
            return;
        },
    };

    match adapter {
        Ok(adapter) => {
            capabilities.classic_supported = true;
            capabilities.radio_enabled |= adapter.is_powered().await.unwrap_or(false);
        },
        Err(err) => warn!("No BlueZ adapter: {:?}", err),
    }
}

#[cfg(not(all(feature = "bluez", target_os = "linux")))]
async fn probe_classic(_capabilities: &mut RadioCapabilities) {}

#[cfg(test)]
mod tests {
    use super::*;

    fn everything() -> RadioCapabilities {
        RadioCapabilities {
            radio_present: true,
            radio_enabled: true,
            classic_supported: true,
            low_energy_supported: true,
            discovery_permitted: true,
        }
    }

    #[test]
    fn preferences_disable_phases() {
        let prefs = Preferences { compatible_only: true, scan_classic: false, scan_low_energy: true };
        assert_eq!(everything().enabled_phases(&prefs), EnabledPhases { classic: false, low_energy: true });
    }

    #[test]
    fn missing_permission_disables_low_energy() {
        let capabilities = RadioCapabilities { discovery_permitted: false, ..everything() };
        assert_eq!(
            capabilities.enabled_phases(&Preferences::default()),
            EnabledPhases { classic: true, low_energy: false },
        );
    }

    #[test]
    fn unsupported_radios_disable_phases() {
        let capabilities = RadioCapabilities { low_energy_supported: false, classic_supported: false, ..everything() };
        assert_eq!(
            capabilities.enabled_phases(&Preferences::default()),
            EnabledPhases { classic: false, low_energy: false },
        );
    }
}
