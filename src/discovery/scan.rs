use std::collections::HashSet;
use std::future::Future;
use std::sync::{Arc, Mutex};
use futures::channel::mpsc::UnboundedSender;
use log::{debug, warn};
use tokio::runtime::Handle;
use tokio::time::{sleep, Duration};
use tokio_util::sync::CancellationToken;

use crate::device::types::{DeviceRecord, TransportKind};
use crate::discovery::cache::KnownDeviceCache;
use crate::error::DeviceError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanEvent {
    /// A peripheral was seen, its compatibility is not known yet
    Query(DeviceRecord),
    /// Compatibility of a peripheral has been determined
    Discover {
        device: DeviceRecord,
        compatible: bool,
    },
    /// The search window of the given transport has ended
    DiscoveryComplete(TransportKind),
}

impl ScanEvent {
    pub fn transport(&self) -> TransportKind {
        match self {
            ScanEvent::Query(device) => device.transport,
            ScanEvent::Discover { device, .. } => device.transport,
            ScanEvent::DiscoveryComplete(transport) => *transport,
        }
    }
}

/// A time-bounded search for peripherals of one transport kind.
///
/// `start` while a search is running is ignored. `stop` is safe to call at any time; a stopped
/// search does not report `DiscoveryComplete`.
pub trait ScanSource: Send + Sync {
    fn transport(&self) -> TransportKind;

    fn start(&self);

    fn stop(&self);
}

/// What every scan source is constructed with.
#[derive(Clone)]
pub struct ScanContext {
    pub events: UnboundedSender<ScanEvent>,
    pub known: KnownDeviceCache,
}

/// Tracks whether a source has a search in flight.
#[derive(Default)]
pub struct ScanLifecycle {
    current: Mutex<Option<(u64, CancellationToken)>>,
    generation: Mutex<u64>,
}

impl ScanLifecycle {
    /// Returns None if a search is already running.
    pub fn begin(&self) -> Option<(u64, CancellationToken)> {
        let mut current = self.current.lock().expect("Failed to lock ScanLifecycle");
        if current.is_some() {
            return None;
        }

        let mut generation = self.generation.lock().expect("Failed to lock ScanLifecycle");
        *generation += 1;
        let cancel = CancellationToken::new();
        *current = Some((*generation, cancel.clone()));
        Some((*generation, cancel))
    }

    pub fn finish(&self, generation: u64) {
        let mut current = self.current.lock().expect("Failed to lock ScanLifecycle");
        if matches!(*current, Some((running, _)) if running == generation) {
            *current = None;
        }
    }

    pub fn stop(&self) {
        let current = self.current.lock().expect("Failed to lock ScanLifecycle").take();
        if let Some((_, cancel)) = current {
            cancel.cancel();
        }
    }

    pub fn is_running(&self) -> bool {
        self.current.lock().expect("Failed to lock ScanLifecycle").is_some()
    }

    /// Runs `search` on `runtime` until it returns, `window` elapses, or the search is stopped.
    /// `DiscoveryComplete` is reported once afterwards unless stopped. Returns false, and does
    /// nothing, when a search is already running.
    pub fn spawn_window<S, F>(
        self: &Arc<Self>,
        runtime: &Handle,
        ctx: ScanContext,
        transport: TransportKind,
        window: Duration,
        search: S,
    ) -> bool
    where
        S: FnOnce(ScanRun) -> F + Send + 'static,
        F: Future<Output = Result<(), DeviceError>> + Send + 'static,
    {
        let (generation, cancel) = match self.begin() {
            Some(v) => v,
            None => {
                debug!("{} scan already running", transport);
                return false;
            },
        };

        let lifecycle = self.clone();
        let run = ScanRun::new(ctx, transport, cancel.clone());
        let emitter = run.emitter.clone();
        runtime.spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {},
                _ = sleep(window) => {},
                result = search(run) => {
                    if let Err(err) = result {
                        warn!("{} scan failed: {:?}", transport, err);
                    }
                },
            }

            lifecycle.finish(generation);
            emitter.emit(ScanEvent::DiscoveryComplete(transport));
        });
        true
    }
}

#[derive(Clone)]
struct Emitter {
    events: UnboundedSender<ScanEvent>,
    cancel: CancellationToken,
}

impl Emitter {
    fn emit(&self, event: ScanEvent) {
        if self.cancel.is_cancelled() {
            return;
        }
        if let Err(err) = self.events.unbounded_send(event) {
            debug!("Scan event dropped, nobody is listening: {}", err);
        }
    }
}

/// One search window: reports each peripheral once and never after cancellation.
pub struct ScanRun {
    emitter: Emitter,
    known: KnownDeviceCache,
    transport: TransportKind,
    seen: HashSet<String>,
}

impl ScanRun {
    pub fn new(ctx: ScanContext, transport: TransportKind, cancel: CancellationToken) -> Self {
        ScanRun {
            emitter: Emitter { events: ctx.events, cancel },
            known: ctx.known,
            transport,
            seen: HashSet::new(),
        }
    }

    /// Emits `Query`, then `Discover` with the cached compatibility, falling back to `probe`
    /// for addresses that have never been classified.
    pub async fn report<P, F>(&mut self, device: DeviceRecord, probe: P)
    where
        P: FnOnce() -> F,
        F: Future<Output = bool>,
    {
        if self.emitter.cancel.is_cancelled() || !self.seen.insert(device.identifier.clone()) {
            return;
        }

        self.emitter.emit(ScanEvent::Query(device.clone()));

        let compatible = match self.known.get(&device.identifier) {
            Some(compatible) => {
                debug!("{} is known, compatible={}", device, compatible);
                compatible
            },
            None => probe().await,
        };

        self.emitter.emit(ScanEvent::Discover { device, compatible });
    }

    pub fn complete(&self) {
        self.emitter.emit(ScanEvent::DiscoveryComplete(self.transport));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use futures::channel::mpsc::{unbounded, UnboundedReceiver};
    use futures::StreamExt;
    use tokio::time::Instant;
    use crate::config::io::MemoryStore;
    use crate::config::types::PREF_KNOWN_COMPATIBLE_DEVICES;
    use crate::config::io::PreferenceStore;

    fn context(blob: Option<&str>) -> (ScanContext, UnboundedReceiver<ScanEvent>) {
        let store = Arc::new(MemoryStore::new());
        if let Some(blob) = blob {
            store.set_string(PREF_KNOWN_COMPATIBLE_DEVICES, blob).unwrap();
        }
        let (events, receiver) = unbounded();
        (ScanContext { events, known: KnownDeviceCache::load(store) }, receiver)
    }

    fn drain(receiver: &mut UnboundedReceiver<ScanEvent>) -> Vec<ScanEvent> {
        let mut events = Vec::new();
        while let Ok(Some(event)) = receiver.try_next() {
            events.push(event);
        }
        events
    }

    fn robot() -> DeviceRecord {
        DeviceRecord::new("AA:BB:CC:DD:EE:FF", "Bluno", TransportKind::LowEnergy)
    }

    #[tokio::test]
    async fn known_device_skips_probe() {
        let (ctx, mut receiver) = context(Some(r#"{"AA:BB:CC:DD:EE:FF": true}"#));
        let mut run = ScanRun::new(ctx, TransportKind::LowEnergy, CancellationToken::new());
        let probed = AtomicBool::new(false);

        run.report(robot(), || async {
            probed.store(true, Ordering::SeqCst);
            false
        }).await;

        assert!(!probed.load(Ordering::SeqCst));
        assert_eq!(drain(&mut receiver), vec![
            ScanEvent::Query(robot()),
            ScanEvent::Discover { device: robot(), compatible: true },
        ]);
    }

    #[tokio::test]
    async fn unknown_device_is_probed() {
        let (ctx, mut receiver) = context(None);
        let mut run = ScanRun::new(ctx, TransportKind::LowEnergy, CancellationToken::new());

        run.report(robot(), || async { false }).await;

        assert_eq!(drain(&mut receiver).last(), Some(&ScanEvent::Discover { device: robot(), compatible: false }));
    }

    #[tokio::test]
    async fn repeated_sighting_is_reported_once() {
        let (ctx, mut receiver) = context(None);
        let mut run = ScanRun::new(ctx, TransportKind::LowEnergy, CancellationToken::new());

        run.report(robot(), || async { true }).await;
        run.report(robot(), || async { true }).await;
        run.complete();

        let events = drain(&mut receiver);
        assert_eq!(events.len(), 3);
        assert_eq!(events[2], ScanEvent::DiscoveryComplete(TransportKind::LowEnergy));
    }

    #[tokio::test]
    async fn nothing_is_emitted_after_cancel() {
        let (ctx, mut receiver) = context(None);
        let cancel = CancellationToken::new();
        let mut run = ScanRun::new(ctx, TransportKind::Classic, cancel.clone());

        cancel.cancel();
        run.report(robot(), || async { true }).await;
        run.complete();

        assert!(drain(&mut receiver).is_empty());
    }

    const WINDOW: Duration = Duration::from_millis(10_000);

    async fn search_forever(_run: ScanRun) -> Result<(), DeviceError> {
        std::future::pending().await
    }

    #[tokio::test(start_paused = true)]
    async fn window_completes_once_without_devices() {
        let (ctx, mut receiver) = context(None);
        let lifecycle = Arc::new(ScanLifecycle::default());
        let started = Instant::now();

        assert!(lifecycle.spawn_window(&Handle::current(), ctx, TransportKind::LowEnergy, WINDOW, search_forever));

        let event = receiver.next().await;
        assert_eq!(event, Some(ScanEvent::DiscoveryComplete(TransportKind::LowEnergy)));
        assert!(started.elapsed() >= WINDOW);
        assert!(!lifecycle.is_running());

        // the sender went away with the finished search
        assert_eq!(receiver.next().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn stopped_window_does_not_complete() {
        let (ctx, mut receiver) = context(None);
        let lifecycle = Arc::new(ScanLifecycle::default());

        lifecycle.spawn_window(&Handle::current(), ctx, TransportKind::Classic, WINDOW, |mut run| async move {
            run.report(DeviceRecord::new("00:11:22:33:44:55", "HC-05", TransportKind::Classic), || async { true }).await;
            std::future::pending::<Result<(), DeviceError>>().await
        });

        tokio::time::sleep(Duration::from_millis(1000)).await;
        lifecycle.stop();

        let mut events = Vec::new();
        while let Some(event) = receiver.next().await {
            events.push(event);
        }
        assert_eq!(events.len(), 2);
        assert!(!events.iter().any(|event| matches!(event, ScanEvent::DiscoveryComplete(_))));
        assert!(!lifecycle.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_search_completes_early() {
        let (ctx, mut receiver) = context(None);
        let lifecycle = Arc::new(ScanLifecycle::default());
        let started = Instant::now();

        lifecycle.spawn_window(&Handle::current(), ctx, TransportKind::LowEnergy, WINDOW, |_run| async {
            Err::<(), DeviceError>(DeviceError::NoAdapter)
        });

        assert_eq!(receiver.next().await, Some(ScanEvent::DiscoveryComplete(TransportKind::LowEnergy)));
        assert!(started.elapsed() < WINDOW);
        assert_eq!(receiver.next().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn second_start_is_ignored() {
        let (ctx, mut receiver) = context(None);
        let lifecycle = Arc::new(ScanLifecycle::default());
        let runtime = Handle::current();

        assert!(lifecycle.spawn_window(&runtime, ctx.clone(), TransportKind::LowEnergy, WINDOW, search_forever));
        assert!(!lifecycle.spawn_window(&runtime, ctx, TransportKind::LowEnergy, WINDOW, search_forever));

        let mut events = Vec::new();
        while let Some(event) = receiver.next().await {
            events.push(event);
        }
        assert_eq!(events, vec![ScanEvent::DiscoveryComplete(TransportKind::LowEnergy)]);
    }

    #[test]
    fn lifecycle_ignores_start_while_running() {
        let lifecycle = ScanLifecycle::default();
        let (first, cancel) = lifecycle.begin().unwrap();
        assert!(lifecycle.begin().is_none());

        lifecycle.stop();
        assert!(cancel.is_cancelled());
        assert!(!lifecycle.is_running());

        // a stale finish must not end a newer search
        let (second, _) = lifecycle.begin().unwrap();
        lifecycle.finish(first);
        assert!(lifecycle.is_running());
        lifecycle.finish(second);
        assert!(!lifecycle.is_running());

        lifecycle.stop();
    }
}
