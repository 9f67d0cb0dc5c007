use std::sync::Arc;
use futures::channel::mpsc::unbounded;
use log::{error, info, warn};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::io::PreferenceStore;
use crate::config::types::Preferences;
use crate::device::connection::ConnectionEstablisher;
use crate::device::types::{ConnectionOutcome, DeviceRecord};
use crate::discovery::cache::KnownDeviceCache;
use crate::discovery::capabilities::RadioCapabilities;
use crate::discovery::coordinator::DiscoveryCoordinator;
use crate::discovery::scan::{ScanContext, ScanSource};
use crate::discovery::ScanSourceFactory;
use crate::error::{ConnectError, DeviceError, DiscoveryError};

/// Whatever presents the result list to the user.
///
/// Called from background tasks, implementations marshal to their own thread when needed.
pub trait SelectionSurface: Send + Sync {
    fn set_title(&self, title: &str);

    fn set_progress_visible(&self, visible: bool);

    fn show_results(&self, results: &[DeviceRecord]);

    /// A transient message, like a toast
    fn notify(&self, message: &str);

    fn dismiss(&self);
}

pub struct Selection {
    pub outcome: ConnectionOutcome,
    /// Finishes once the robot has acknowledged the connection, or gave up trying
    pub settled: JoinHandle<()>,
}

/// Discovery and connection for a single "pick a robot" interaction.
pub struct DiscoverySelector {
    coordinator: DiscoveryCoordinator,
    establisher: ConnectionEstablisher,
    surface: Arc<dyn SelectionSurface>,
    capabilities: RadioCapabilities,
    dismissed: CancellationToken,
}

fn build_source<F>(enabled: bool, build: F) -> Option<Arc<dyn ScanSource>>
where
    F: FnOnce() -> Result<Arc<dyn ScanSource>, DeviceError>,
{
    if !enabled {
        return None;
    }

    match build() {
        Ok(source) => Some(source),
        Err(err) => {
            warn!("Scan source unavailable: {}", err);
            None
        },
    }
}

impl DiscoverySelector {
    pub fn new(
        store: Arc<dyn PreferenceStore>,
        capabilities: RadioCapabilities,
        scanners: &dyn ScanSourceFactory,
        establisher: ConnectionEstablisher,
        surface: Arc<dyn SelectionSurface>,
    ) -> Result<Self, DeviceError> {
        let runtime = Handle::try_current().map_err(|_| DeviceError::NoRuntime)?;
        let prefs = Preferences::load(store.as_ref());
        let phases = capabilities.enabled_phases(&prefs);

        // read list of known devices cached from previous scans
        let known = KnownDeviceCache::load(store);
        let (events, receiver) = unbounded();
        let ctx = ScanContext { events, known: known.clone() };

        let classic = build_source(phases.classic, || scanners.classic(ctx.clone()));
        let low_energy = build_source(phases.low_energy, || scanners.low_energy(ctx));

        let coordinator = DiscoveryCoordinator::new(classic, low_energy, known, prefs.compatible_only, surface.clone());
        let dismissed = CancellationToken::new();
        runtime.spawn(coordinator.clone().pump(receiver, dismissed.clone()));

        Ok(DiscoverySelector { coordinator, establisher, surface, capabilities, dismissed })
    }

    pub fn coordinator(&self) -> &DiscoveryCoordinator {
        &self.coordinator
    }

    /// Disconnects the current robot and starts discovery.
    pub fn open(&self) -> Result<(), DiscoveryError> {
        info!("open");
        self.establisher.session().disconnect();

        if !self.capabilities.radio_present {
            self.surface.notify("Bluetooth not supported");
            return Err(DiscoveryError::RadioMissing);
        }
        if !self.capabilities.radio_enabled {
            self.surface.notify("Bluetooth not enabled");
            return Err(DiscoveryError::RadioDisabled);
        }

        self.surface.set_title("Nearby: ");
        self.coordinator.start();
        Ok(())
    }

    /// Connects to the picked device. Scanning is stopped before the attempt begins.
    pub async fn select(&self, device: DeviceRecord) -> Selection {
        info!("Selected: {}", device);
        self.coordinator.stop();
        self.surface.set_progress_visible(true);
        self.surface.notify(&format!("Connecting to {}", device));

        let pending = self.establisher.connect(device, self.dismissed.child_token());
        let outcome = match pending.outcome.await {
            Ok(outcome) => outcome,
            Err(_) => {
                error!("Connection task ended without an outcome");
                ConnectionOutcome::Failed(ConnectError::Cancelled)
            },
        };

        if let ConnectionOutcome::Failed(err) = &outcome {
            self.surface.notify(&format!("Failed to connect: {}", err));
        }
        self.surface.set_progress_visible(false);
        self.surface.dismiss();
        Selection { outcome, settled: pending.task }
    }

    /// The user closed the surface: stop scanning and abort any pending attempt.
    pub fn dismiss(&self) {
        self.coordinator.stop();
        self.dismissed.cancel();
    }
}

impl Drop for DiscoverySelector {
    fn drop(&mut self) {
        self.coordinator.stop();
        self.dismissed.cancel();
    }
}
