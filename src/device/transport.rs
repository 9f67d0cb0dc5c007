use std::sync::{Arc, Mutex};
use log::info;
use tokio_util::sync::CancellationToken;

use crate::device::types::{DeviceRecord, LinkState, TransportKind};
use crate::error::DeviceError;

/// A link to a robot. Drivers connect in the background once constructed, callers poll
/// `connection_state` until it settles.
pub trait TransportDriver: Send + Sync {
    fn connection_state(&self) -> LinkState;

    /// Safe to call more than once.
    fn disconnect(&self);

    /// True while the robot is still executing a previously sent command.
    fn is_busy(&self) -> bool;

    fn send_command(&self, command: &[u8]) -> Result<(), DeviceError>;
}

pub trait TransportFactory: Send + Sync {
    fn open(&self, device: &DeviceRecord) -> Result<Arc<dyn TransportDriver>, DeviceError>;
}

/// Dispatches on the transport kind of the selected device: low-energy devices get the Bluno
/// driver, everything else the RFCOMM driver.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemTransports;

impl TransportFactory for SystemTransports {
    fn open(&self, device: &DeviceRecord) -> Result<Arc<dyn TransportDriver>, DeviceError> {
        match device.transport {
            TransportKind::LowEnergy => {
                let driver = crate::device::bluno::BlunoDriver::new(&device.identifier)?;
                Ok(Arc::new(driver))
            },
            TransportKind::Classic => open_classic(device),
        }
    }
}

#[cfg(all(feature = "bluez", target_os = "linux"))]
fn open_classic(device: &DeviceRecord) -> Result<Arc<dyn TransportDriver>, DeviceError> {
    let driver = crate::device::rfcomm::RfcommDriver::new(&device.identifier)?;
    Ok(Arc::new(driver))
}

#[cfg(not(all(feature = "bluez", target_os = "linux")))]
fn open_classic(_device: &DeviceRecord) -> Result<Arc<dyn TransportDriver>, DeviceError> {
    Err(DeviceError::TransportUnsupported("classic bluetooth"))
}

struct SessionInner {
    current: Option<Arc<dyn TransportDriver>>,
    attempt: Option<CancellationToken>,
    generation: u64,
}

fn same_driver(a: &Arc<dyn TransportDriver>, b: &Arc<dyn TransportDriver>) -> bool {
    Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
}

/// The robot the application is currently talking to, if any, and the connection attempt in
/// flight. At most one attempt is live: starting a new one cancels the previous.
#[derive(Clone)]
pub struct RobotSession {
    inner: Arc<Mutex<SessionInner>>,
}

impl Default for RobotSession {
    fn default() -> Self {
        let inner = SessionInner { current: None, attempt: None, generation: 0 };
        RobotSession { inner: Arc::new(Mutex::new(inner)) }
    }
}

impl RobotSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> Option<Arc<dyn TransportDriver>> {
        self.inner.lock().expect("Failed to lock RobotSession").current.clone()
    }

    /// Replaces the active connection without disconnecting the previous one.
    pub fn attach(&self, driver: Arc<dyn TransportDriver>) {
        self.inner.lock().expect("Failed to lock RobotSession").current = Some(driver);
    }

    /// Registers a new attempt: the attempt in flight is cancelled and the current robot is
    /// disconnected. Returns the generation of the new attempt.
    pub fn begin_attempt(&self, cancel: CancellationToken) -> u64 {
        let (generation, previous_attempt, previous_robot) = {
            let mut inner = self.inner.lock().expect("Failed to lock RobotSession");
            inner.generation += 1;
            (inner.generation, inner.attempt.replace(cancel), inner.current.take())
        };

        if let Some(previous) = previous_attempt {
            previous.cancel();
        }
        if let Some(driver) = previous_robot {
            info!("Disconnecting current robot");
            driver.disconnect();
        }
        generation
    }

    /// Attaches `driver` only if `generation` is still the latest attempt.
    pub fn attach_for(&self, generation: u64, driver: Arc<dyn TransportDriver>) -> bool {
        let mut inner = self.inner.lock().expect("Failed to lock RobotSession");
        if inner.generation != generation {
            return false;
        }
        inner.current = Some(driver);
        true
    }

    /// Clears the active connection if it is `driver`. Does not disconnect it.
    pub fn detach_if(&self, driver: &Arc<dyn TransportDriver>) -> bool {
        let mut inner = self.inner.lock().expect("Failed to lock RobotSession");
        match &inner.current {
            Some(current) if same_driver(current, driver) => {
                inner.current = None;
                true
            },
            _ => false,
        }
    }

    pub fn disconnect(&self) {
        let previous = self.inner.lock().expect("Failed to lock RobotSession").current.take();
        if let Some(driver) = previous {
            info!("Disconnecting current robot");
            driver.disconnect();
        }
    }
}
