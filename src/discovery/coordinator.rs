use std::sync::{Arc, Mutex};
use futures::channel::mpsc::UnboundedReceiver;
use futures::StreamExt;
use indexmap::IndexMap;
use log::{debug, error, info};
use tokio::task::spawn_blocking;
use tokio_util::sync::CancellationToken;

use crate::device::types::{DeviceRecord, TransportKind};
use crate::discovery::cache::KnownDeviceCache;
use crate::discovery::scan::{ScanEvent, ScanSource};
use crate::selector::SelectionSurface;

/**
 * The progress title grows by one dot per queried peripheral, up to this many.
 */
pub const MAX_DOTS: usize = 15;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    ScanningClassic,
    ScanningLowEnergy,
}

impl Phase {
    pub fn label(&self) -> &'static str {
        match self {
            Phase::Idle => "",
            Phase::ScanningClassic => "Bluetooth",
            Phase::ScanningLowEnergy => "Bluetooth LE",
        }
    }

    pub fn transport(&self) -> Option<TransportKind> {
        match self {
            Phase::Idle => None,
            Phase::ScanningClassic => Some(TransportKind::Classic),
            Phase::ScanningLowEnergy => Some(TransportKind::LowEnergy),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanSession {
    pub phase: Phase,
    /// peripherals queried so far in the current phase
    pub queried: usize,
    pub compatible_only: bool,
}

pub fn progress_title(phase: Phase, queried: usize) -> String {
    format!("Nearby: {}{}", phase.label(), ".".repeat(queried.min(MAX_DOTS)))
}

struct CoordinatorInner {
    session: ScanSession,
    results: IndexMap<String, DeviceRecord>,
}

impl CoordinatorInner {
    fn enter(&mut self, phase: Phase) {
        debug!("Scan phase {:?} -> {:?}", self.session.phase, phase);
        self.session.phase = phase;
        self.session.queried = 0;
    }

    fn title(&self) -> String {
        progress_title(self.session.phase, self.session.queried)
    }

    // compatible first, otherwise in order of discovery
    fn ranked(&self) -> Vec<DeviceRecord> {
        let mut results: Vec<DeviceRecord> = self.results.values().cloned().collect();
        results.sort_by_key(|device| device.compatible != Some(true));
        results
    }
}

// Surface calls are made after the lock is released.
enum SurfaceUpdate {
    Title(String),
    Progress(bool),
    Results(Vec<DeviceRecord>),
}

/// Runs the classic scan, then the low-energy scan, and merges what they find into one
/// de-duplicated result list.
#[derive(Clone)]
pub struct DiscoveryCoordinator {
    classic: Option<Arc<dyn ScanSource>>,
    low_energy: Option<Arc<dyn ScanSource>>,
    known: KnownDeviceCache,
    surface: Arc<dyn SelectionSurface>,
    inner: Arc<Mutex<CoordinatorInner>>,
}

impl DiscoveryCoordinator {
    pub fn new(
        classic: Option<Arc<dyn ScanSource>>,
        low_energy: Option<Arc<dyn ScanSource>>,
        known: KnownDeviceCache,
        compatible_only: bool,
        surface: Arc<dyn SelectionSurface>,
    ) -> Self {
        let inner = CoordinatorInner {
            session: ScanSession {
                phase: Phase::Idle,
                queried: 0,
                compatible_only,
            },
            results: IndexMap::new(),
        };

        DiscoveryCoordinator {
            classic,
            low_energy,
            known,
            surface,
            inner: Arc::new(Mutex::new(inner)),
        }
    }

    fn apply(&self, updates: Vec<SurfaceUpdate>) {
        for update in updates {
            match update {
                SurfaceUpdate::Title(title) => self.surface.set_title(&title),
                SurfaceUpdate::Progress(visible) => self.surface.set_progress_visible(visible),
                SurfaceUpdate::Results(results) => self.surface.show_results(&results),
            }
        }
    }

    pub fn session(&self) -> ScanSession {
        self.inner.lock().expect("Failed to lock DiscoveryCoordinator inner").session
    }

    pub fn phase(&self) -> Phase {
        self.session().phase
    }

    pub fn title(&self) -> String {
        self.inner.lock().expect("Failed to lock DiscoveryCoordinator inner").title()
    }

    pub fn results(&self) -> Vec<DeviceRecord> {
        self.inner.lock().expect("Failed to lock DiscoveryCoordinator inner").ranked()
    }

    pub fn find(&self, identifier: &str) -> Option<DeviceRecord> {
        let inner = self.inner.lock().expect("Failed to lock DiscoveryCoordinator inner");
        inner.results.get(identifier).cloned()
    }

    pub fn start(&self) {
        info!("start()");
        let updates = {
            let mut inner = self.inner.lock().expect("Failed to lock DiscoveryCoordinator inner");
            if inner.session.phase != Phase::Idle {
                debug!("Discovery already running");
                return;
            }

            // if classic is enabled, scan it first - low energy is started when it completes
            if let Some(classic) = &self.classic {
                inner.enter(Phase::ScanningClassic);
                classic.start();
            } else if let Some(low_energy) = &self.low_energy {
                inner.enter(Phase::ScanningLowEnergy);
                low_energy.start();
            } else {
                info!("No scan phase is enabled");
                return;
            }

            vec![SurfaceUpdate::Progress(true), SurfaceUpdate::Title(inner.title())]
        };

        self.apply(updates);
    }

    pub fn stop(&self) {
        info!("stop()");
        if let Some(low_energy) = &self.low_energy {
            low_energy.stop();
        }
        if let Some(classic) = &self.classic {
            classic.stop();
        }

        let title = {
            let mut inner = self.inner.lock().expect("Failed to lock DiscoveryCoordinator inner");
            inner.enter(Phase::Idle);
            inner.title()
        };

        self.apply(vec![SurfaceUpdate::Title(title), SurfaceUpdate::Progress(false)]);
    }

    /// Applies one scan event. Compatibility is written through to the store, so this blocks
    /// on file I/O when the store is file-backed.
    pub fn handle(&self, event: ScanEvent) {
        let mut record = None;
        let updates = {
            let mut inner = self.inner.lock().expect("Failed to lock DiscoveryCoordinator inner");

            // events of a phase that has ended, or was stopped, are dropped
            if inner.session.phase.transport() != Some(event.transport()) {
                debug!("Dropping stale scan event {:?}", event);
                return;
            }

            match event {
                ScanEvent::Query(device) => {
                    debug!("Queried {}", device);
                    inner.session.queried += 1;
                    vec![SurfaceUpdate::Title(inner.title())]
                },
                ScanEvent::Discover { mut device, compatible } => {
                    record = Some((device.identifier.clone(), compatible));

                    if inner.session.compatible_only && !compatible {
                        vec![]
                    } else {
                        // an existing entry keeps its position
                        device.compatible = Some(compatible);
                        inner.results.insert(device.identifier.clone(), device);
                        vec![SurfaceUpdate::Results(inner.ranked())]
                    }
                },
                ScanEvent::DiscoveryComplete(TransportKind::Classic) => {
                    info!("BT Discovery Complete");
                    match &self.low_energy {
                        Some(low_energy) => {
                            inner.enter(Phase::ScanningLowEnergy);
                            low_energy.start();
                            vec![SurfaceUpdate::Title(inner.title())]
                        },
                        None => {
                            inner.enter(Phase::Idle);
                            vec![SurfaceUpdate::Progress(false), SurfaceUpdate::Title(inner.title())]
                        },
                    }
                },
                ScanEvent::DiscoveryComplete(TransportKind::LowEnergy) => {
                    info!("BLE Discovery Complete");
                    inner.enter(Phase::Idle);
                    vec![SurfaceUpdate::Progress(false), SurfaceUpdate::Title(inner.title())]
                },
            }
        };

        if let Some((identifier, compatible)) = record {
            self.known.record(&identifier, compatible);
        }
        self.apply(updates);
    }

    /// Feeds events from the scan sources into `handle` until cancelled. Events are handled one
    /// at a time on the blocking pool.
    pub async fn pump(self, mut events: UnboundedReceiver<ScanEvent>, cancel: CancellationToken) {
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                event = events.next() => match event {
                    Some(event) => event,
                    None => break,
                },
            };

            let coordinator = self.clone();
            if let Err(err) = spawn_blocking(move || coordinator.handle(event)).await {
                error!("Handling a scan event failed: {}", err);
            }
        }
    }
}
