use std::sync::Arc;
use log::{debug, error, info, warn};
use tokio::spawn;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::config::io::PreferenceStore;
use crate::config::types::DefaultDevice;
use crate::device::constants::{COMMAND_ACKNOWLEDGE, CONNECT_DEADLINE, POLL_DELAY, SETTLE_DEADLINE};
use crate::device::transport::{RobotSession, TransportDriver, TransportFactory};
use crate::device::types::{AttemptState, ConnectionOutcome, DeviceRecord, LinkState, TransportKind};
use crate::error::ConnectError;

#[derive(Debug, Clone, Copy)]
pub struct ConnectTiming {
    pub poll: Duration,
    pub connect_deadline: Duration,
    pub settle_deadline: Duration,
}

impl Default for ConnectTiming {
    fn default() -> Self {
        ConnectTiming {
            poll: Duration::from_millis(POLL_DELAY),
            connect_deadline: Duration::from_millis(CONNECT_DEADLINE),
            settle_deadline: Duration::from_millis(SETTLE_DEADLINE),
        }
    }
}

#[derive(Debug)]
struct ConnectionAttempt {
    target: DeviceRecord,
    transport: TransportKind,
    state: AttemptState,
    started: Instant,
}

impl ConnectionAttempt {
    fn elapsed_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }
}

/// A connection attempt running in the background.
pub struct PendingConnection {
    /// Resolves as soon as the attempt is decided, before the post-connect handshake
    pub outcome: oneshot::Receiver<ConnectionOutcome>,
    /// Resolves once the attempt has fully settled
    pub task: JoinHandle<()>,
}

#[derive(Clone)]
pub struct ConnectionEstablisher {
    session: RobotSession,
    transports: Arc<dyn TransportFactory>,
    store: Arc<dyn PreferenceStore>,
    timing: ConnectTiming,
}

impl ConnectionEstablisher {
    pub fn new(session: RobotSession, transports: Arc<dyn TransportFactory>, store: Arc<dyn PreferenceStore>) -> Self {
        Self::with_timing(session, transports, store, ConnectTiming::default())
    }

    pub fn with_timing(
        session: RobotSession,
        transports: Arc<dyn TransportFactory>,
        store: Arc<dyn PreferenceStore>,
        timing: ConnectTiming,
    ) -> Self {
        ConnectionEstablisher { session, transports, store, timing }
    }

    pub fn session(&self) -> &RobotSession {
        &self.session
    }

    /// Starts an attempt on its own task. Cancelling `cancel` aborts a pending attempt, and so
    /// does starting another attempt on the same session.
    pub fn connect(&self, device: DeviceRecord, cancel: CancellationToken) -> PendingConnection {
        let (outcome_tx, outcome_rx) = oneshot::channel();
        let establisher = self.clone();
        let cancel = cancel.child_token();
        let generation = self.session.begin_attempt(cancel.clone());

        let task = spawn(async move {
            let (outcome, driver) = establisher.attempt(device, generation, &cancel).await;
            let _ = outcome_tx.send(outcome);

            if let Some(driver) = driver {
                establisher.settle(driver.as_ref(), &cancel).await;
            }
        });

        PendingConnection { outcome: outcome_rx, task }
    }

    // Tears down this attempt's own driver only, a newer attempt may own the session by now.
    fn abandon(&self, driver: &Arc<dyn TransportDriver>) {
        driver.disconnect();
        self.session.detach_if(driver);
    }

    async fn attempt(
        &self,
        device: DeviceRecord,
        generation: u64,
        cancel: &CancellationToken,
    ) -> (ConnectionOutcome, Option<Arc<dyn TransportDriver>>) {
        info!("connecting to {}", device);

        let mut attempt = ConnectionAttempt {
            transport: device.transport,
            target: device,
            state: AttemptState::Connecting,
            started: Instant::now(),
        };

        let driver = match self.transports.open(&attempt.target) {
            Ok(driver) => driver,
            Err(err) => {
                error!("Failed to open {} transport for {}: {}", attempt.transport, attempt.target, err);
                return (ConnectionOutcome::Failed(err.into()), None);
            },
        };
        if cancel.is_cancelled() || !self.session.attach_for(generation, driver.clone()) {
            warn!("Connecting to {} was superseded", attempt.target);
            driver.disconnect();
            return (ConnectionOutcome::Failed(ConnectError::Cancelled), None);
        }

        let mut ticker = interval(self.timing.poll);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        while attempt.state == AttemptState::Connecting {
            tokio::select! {
                _ = cancel.cancelled() => {
                    warn!("Connecting to {} was cancelled", attempt.target);
                    self.abandon(&driver);
                    return (ConnectionOutcome::Failed(ConnectError::Cancelled), None);
                },
                _ = ticker.tick() => {},
            }

            match driver.connection_state() {
                LinkState::Connected => attempt.state = AttemptState::Connected,
                _ if attempt.started.elapsed() >= self.timing.connect_deadline => attempt.state = AttemptState::Failed,
                _ => {},
            }
        }

        if attempt.state == AttemptState::Failed {
            let elapsed_ms = attempt.elapsed_ms();
            error!("Failed connecting to {} after {}ms", attempt.target, elapsed_ms);
            self.abandon(&driver);
            return (ConnectionOutcome::Failed(ConnectError::Timeout { elapsed_ms }), None);
        }

        info!("Connected to {} after {}ms", attempt.target, attempt.elapsed_ms());
        DefaultDevice {
            identifier: attempt.target.identifier.clone(),
            name: attempt.target.name.clone(),
        }.save(self.store.as_ref());

        (ConnectionOutcome::Connected(attempt.target), Some(driver))
    }

    // Best effort: the outcome has already been reported when this runs.
    async fn settle(&self, driver: &dyn TransportDriver, cancel: &CancellationToken) {
        if let Err(err) = driver.send_command(COMMAND_ACKNOWLEDGE) {
            warn!("Failed to send acknowledgment: {}", err);
            return;
        }

        let started = Instant::now();
        let mut ticker = interval(self.timing.poll);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {},
            }

            if !driver.is_busy() {
                debug!("Robot settled after {}ms", started.elapsed().as_millis());
                return;
            }
            if started.elapsed() >= self.timing.settle_deadline {
                warn!("Robot still busy after {}ms, giving up", started.elapsed().as_millis());
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;
    use crate::config::io::MemoryStore;
    use crate::device::transport::tests::{ScriptedDriver, ScriptedTransports};
    use crate::error::DeviceError;

    struct BrokenTransports;

    impl TransportFactory for BrokenTransports {
        fn open(&self, _device: &DeviceRecord) -> Result<Arc<dyn TransportDriver>, DeviceError> {
            Err(DeviceError::TransportUnsupported("test"))
        }
    }

    fn robot() -> DeviceRecord {
        DeviceRecord::new("AA:BB:CC:DD:EE:FF", "Mobbob", TransportKind::LowEnergy)
    }

    fn previous_default(store: &MemoryStore) {
        DefaultDevice { identifier: "11:22:33:44:55:66".into(), name: "Old".into() }.save(store);
    }

    #[tokio::test(start_paused = true)]
    async fn connects_on_the_next_poll() {
        let store = Arc::new(MemoryStore::new());
        let transports = ScriptedTransports::new(Some(Duration::from_millis(1200)), Some(Duration::from_millis(300)));
        let establisher = ConnectionEstablisher::new(RobotSession::new(), transports.clone(), store.clone());

        let started = Instant::now();
        let pending = establisher.connect(robot(), CancellationToken::new());
        let outcome = pending.outcome.await.unwrap();
        let elapsed = started.elapsed();

        assert!(outcome.is_connected());
        assert!(elapsed >= Duration::from_millis(1200), "{:?}", elapsed);
        assert!(elapsed <= Duration::from_millis(1300), "{:?}", elapsed);
        assert_eq!(
            DefaultDevice::load(store.as_ref()),
            Some(DefaultDevice { identifier: "AA:BB:CC:DD:EE:FF".into(), name: "Mobbob".into() }),
        );
        assert!(establisher.session().current().is_some());

        pending.task.await.unwrap();
        assert_eq!(transports.last().commands.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_after_deadline() {
        let store = Arc::new(MemoryStore::new());
        previous_default(&store);
        let transports = ScriptedTransports::new(None, None);
        let establisher = ConnectionEstablisher::new(RobotSession::new(), transports.clone(), store.clone());

        let started = Instant::now();
        let pending = establisher.connect(robot(), CancellationToken::new());
        let outcome = pending.outcome.await.unwrap();
        let elapsed = started.elapsed();

        assert!(matches!(outcome, ConnectionOutcome::Failed(ConnectError::Timeout { .. })));
        assert!(elapsed >= Duration::from_millis(5000), "{:?}", elapsed);
        assert!(elapsed <= Duration::from_millis(5150), "{:?}", elapsed);
        assert_eq!(DefaultDevice::load(store.as_ref()).unwrap().identifier, "11:22:33:44:55:66");
        assert!(establisher.session().current().is_none());
        assert!(transports.last().disconnected.load(Ordering::SeqCst));
        pending.task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn construction_failure_is_reported() {
        let store = Arc::new(MemoryStore::new());
        previous_default(&store);
        let establisher = ConnectionEstablisher::new(RobotSession::new(), Arc::new(BrokenTransports), store.clone());

        let outcome = establisher.connect(robot(), CancellationToken::new()).outcome.await.unwrap();

        assert!(matches!(outcome, ConnectionOutcome::Failed(ConnectError::Transport { .. })));
        assert_eq!(DefaultDevice::load(store.as_ref()).unwrap().name, "Old");
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_aborts_pending_attempt() {
        let store = Arc::new(MemoryStore::new());
        let transports = ScriptedTransports::new(None, None);
        let establisher = ConnectionEstablisher::new(RobotSession::new(), transports.clone(), store.clone());
        let cancel = CancellationToken::new();

        let started = Instant::now();
        let pending = establisher.connect(robot(), cancel.clone());
        tokio::time::sleep(Duration::from_millis(450)).await;
        cancel.cancel();

        let outcome = pending.outcome.await.unwrap();
        assert!(matches!(outcome, ConnectionOutcome::Failed(ConnectError::Cancelled)));
        assert!(started.elapsed() < Duration::from_millis(600));
        assert_eq!(DefaultDevice::load(store.as_ref()), None);
    }

    #[tokio::test(start_paused = true)]
    async fn previous_robot_is_disconnected_first() {
        let store = Arc::new(MemoryStore::new());
        let session = RobotSession::new();
        let previous = Arc::new(ScriptedDriver::new(Some(Duration::ZERO), None));
        session.attach(previous.clone());

        let transports = ScriptedTransports::new(Some(Duration::ZERO), Some(Duration::ZERO));
        let establisher = ConnectionEstablisher::new(session, transports, store);
        let pending = establisher.connect(robot(), CancellationToken::new());

        assert!(pending.outcome.await.unwrap().is_connected());
        assert!(previous.disconnected.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn newer_attempt_survives_older_one() {
        let store = Arc::new(MemoryStore::new());
        let session = RobotSession::new();
        let stalled = ScriptedTransports::new(None, None);
        let ready = ScriptedTransports::new(Some(Duration::from_millis(100)), Some(Duration::ZERO));
        let first = ConnectionEstablisher::new(session.clone(), stalled.clone(), store.clone());
        let second = ConnectionEstablisher::new(session.clone(), ready.clone(), store.clone());

        let older = first.connect(robot(), CancellationToken::new());
        tokio::time::sleep(Duration::from_millis(100)).await;
        let newer = second.connect(DeviceRecord::new("11:22:33:44:55:66", "Otto", TransportKind::LowEnergy), CancellationToken::new());

        assert!(newer.outcome.await.unwrap().is_connected());
        assert!(matches!(older.outcome.await.unwrap(), ConnectionOutcome::Failed(ConnectError::Cancelled)));
        assert!(stalled.last().disconnected.load(Ordering::SeqCst));

        // well past the deadline of the older attempt
        tokio::time::sleep(Duration::from_millis(CONNECT_DEADLINE + 1000)).await;
        older.task.await.unwrap();

        let current = session.current().unwrap();
        assert_eq!(current.connection_state(), LinkState::Connected);
        assert!(!ready.last().disconnected.load(Ordering::SeqCst));
        assert_eq!(DefaultDevice::load(store.as_ref()).unwrap().name, "Otto");
    }

    #[tokio::test(start_paused = true)]
    async fn busy_wait_is_bounded() {
        let store = Arc::new(MemoryStore::new());
        let transports = ScriptedTransports::new(Some(Duration::ZERO), None);
        let establisher = ConnectionEstablisher::new(RobotSession::new(), transports, store);

        let started = Instant::now();
        let pending = establisher.connect(robot(), CancellationToken::new());
        assert!(pending.outcome.await.unwrap().is_connected());
        pending.task.await.unwrap();

        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(SETTLE_DEADLINE), "{:?}", elapsed);
        assert!(elapsed <= Duration::from_millis(SETTLE_DEADLINE + 200), "{:?}", elapsed);
    }
}
