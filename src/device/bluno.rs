use std::future::Future;
use std::sync::{Arc, Mutex};
use btleplug::api::{Central, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::future::{BoxFuture, FutureExt};
use log::{debug, info, warn};
use tokio::runtime::Handle;
use tokio::time::{sleep, Duration};
use tokio_util::sync::CancellationToken;

use crate::device::constants::{make_bluno_service_uuid, make_bluno_serial_uuid, IS_CONNECTED_DEADLINE, LINK_CHECK_DELAY, POLL_DELAY, WRITE_DEADLINE};
use crate::device::transport::TransportDriver;
use crate::device::types::LinkState;
use crate::error::DeviceError;

struct Link {
    peripheral: Peripheral,
    serial_char: Characteristic,
}

struct BlunoInner {
    state: LinkState,
    link: Option<Arc<Link>>,
    busy: bool,
}

/// Serial-over-GATT link to a Bluno based robot.
pub struct BlunoDriver {
    runtime: Handle,
    cancel: CancellationToken,
    inner: Arc<Mutex<BlunoInner>>,
}

pub fn same_address(a: &str, b: &str) -> bool {
    a.eq_ignore_ascii_case(b)
}

/// Spawns `cleanup` on the runtime when dropped, so it also runs when the owning future is
/// dropped mid-await.
pub struct CleanupOnDrop {
    runtime: Handle,
    cleanup: Option<BoxFuture<'static, ()>>,
}

impl CleanupOnDrop {
    pub fn new<F>(runtime: Handle, cleanup: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        CleanupOnDrop { runtime, cleanup: Some(cleanup.boxed()) }
    }

    pub fn stop_scanning(runtime: Handle, adapters: Vec<Adapter>) -> Self {
        Self::new(runtime, async move {
            for adapter in adapters {
                if let Err(err) = adapter.stop_scan().await {
                    debug!("Failed to stop scanning: {:?}", err);
                }
            }
        })
    }
}

impl Drop for CleanupOnDrop {
    fn drop(&mut self) {
        if let Some(cleanup) = self.cleanup.take() {
            self.runtime.spawn(cleanup);
        }
    }
}

async fn start_scanning(adapters: &[Adapter]) -> Result<(), DeviceError> {
    for adapter in adapters {
        debug!("Scanning using adapter {}...", adapter.adapter_info().await.unwrap_or("UNKNOWN".to_string()));
        adapter.start_scan(ScanFilter::default()).await?;
    }

    Ok(())
}

async fn find_peripheral(adapters: &[Adapter], identifier: &str) -> Result<Option<Peripheral>, DeviceError> {
    for adapter in adapters {
        let peripherals = match adapter.peripherals().await {
            Ok(v) => v,
            Err(err) => {
                warn!("Failed to query BLE adapter for peripherals: {}", err);
                continue;
            },
        };

        for peripheral in peripherals {
            if same_address(&peripheral.address().to_string(), identifier) {
                return Ok(Some(peripheral));
            }
        }
    }

    Ok(None)
}

async fn connect_peripheral(peripheral: &Peripheral) -> Result<Characteristic, DeviceError> {
    let bluno_service_uuid = make_bluno_service_uuid();
    let bluno_serial_uuid = make_bluno_serial_uuid();

    info!("Connecting to peripheral...");
    peripheral.connect().await?;

    info!("Connected; Discovering services...");
    peripheral.discover_services().await?;

    for service in peripheral.services() {
        if !service.uuid.eq(&bluno_service_uuid) {
            continue;
        }

        for characteristic in &service.characteristics {
            if characteristic.uuid.eq(&bluno_serial_uuid) {
                return Ok(characteristic.clone());
            }
        }
    }

    Err(DeviceError::MissingCharacteristic)
}

// Keeps scanning until the peripheral shows up; the caller bounds this through cancellation.
// Scanning stops once the peripheral is found, or when this future is dropped.
async fn establish(identifier: &str, runtime: Handle) -> Result<Link, DeviceError> {
    let manager = Manager::new().await?;
    let adapters = manager.adapters().await?;
    let scanning = CleanupOnDrop::stop_scanning(runtime, adapters.clone());
    start_scanning(&adapters).await?;

    let peripheral = loop {
        if let Some(peripheral) = find_peripheral(&adapters, identifier).await? {
            break peripheral;
        }
        sleep(Duration::from_millis(POLL_DELAY)).await;
    };
    drop(scanning);

    let serial_char = connect_peripheral(&peripheral).await?;
    Ok(Link { peripheral, serial_char })
}

async fn watch_link(link: &Link) {
    loop {
        sleep(Duration::from_millis(LINK_CHECK_DELAY)).await;

        tokio::select! {
            _ = sleep(Duration::from_millis(IS_CONNECTED_DEADLINE)) => {
                warn!("Checking for connection status took too long");
                return;
            }
            result = link.peripheral.is_connected() => match result {
                Err(err) => {
                    warn!("Error checking for connection state: {:?}", err);
                    return;
                },
                Ok(false) => {
                    warn!("Connection lost");
                    return;
                },
                Ok(true) => {},
            }
        }
    }
}

impl BlunoDriver {
    pub fn new(identifier: &str) -> Result<Self, DeviceError> {
        let runtime = Handle::try_current().map_err(|_| DeviceError::NoRuntime)?;
        let cancel = CancellationToken::new();
        let inner = Arc::new(Mutex::new(BlunoInner {
            state: LinkState::Connecting,
            link: None,
            busy: false,
        }));

        let task_cancel = cancel.clone();
        let task_inner = inner.clone();
        let identifier = identifier.to_string();
        let task_runtime = runtime.clone();
        runtime.spawn(async move {
            let link = tokio::select! {
                _ = task_cancel.cancelled() => return,
                result = establish(&identifier, task_runtime) => match result {
                    Ok(link) => Arc::new(link),
                    Err(err) => {
                        warn!("Connecting to {} failed: {:?}", identifier, err);
                        task_inner.lock().expect("Failed to lock BlunoDriver inner").state = LinkState::Disconnected;
                        return;
                    },
                },
            };

            info!("Peripheral ready");
            {
                let mut inner = task_inner.lock().expect("Failed to lock BlunoDriver inner");
                inner.link = Some(link.clone());
                inner.state = LinkState::Connected;
            }

            tokio::select! {
                _ = task_cancel.cancelled() => {},
                _ = watch_link(&link) => {
                    let mut inner = task_inner.lock().expect("Failed to lock BlunoDriver inner");
                    inner.link = None;
                    inner.state = LinkState::Disconnected;
                },
            }
        });

        Ok(BlunoDriver { runtime, cancel, inner })
    }
}

impl TransportDriver for BlunoDriver {
    fn connection_state(&self) -> LinkState {
        self.inner.lock().expect("Failed to lock BlunoDriver inner").state
    }

    fn disconnect(&self) {
        self.cancel.cancel();

        let link = {
            let mut inner = self.inner.lock().expect("Failed to lock BlunoDriver inner");
            inner.state = LinkState::Disconnected;
            inner.link.take()
        };

        if let Some(link) = link {
            self.runtime.spawn(async move {
                if let Err(err) = link.peripheral.disconnect().await {
                    warn!("Failed to disconnect peripheral: {:?}", err);
                }
            });
        }
    }

    fn is_busy(&self) -> bool {
        self.inner.lock().expect("Failed to lock BlunoDriver inner").busy
    }

    fn send_command(&self, command: &[u8]) -> Result<(), DeviceError> {
        let link = {
            let mut inner = self.inner.lock().expect("Failed to lock BlunoDriver inner");
            let link = inner.link.clone().ok_or(DeviceError::NotConnected)?;
            inner.busy = true;
            link
        };

        let inner = self.inner.clone();
        let command = command.to_vec();
        self.runtime.spawn(async move {
            let fut = link.peripheral.write(&link.serial_char, &command, WriteType::WithoutResponse);

            tokio::select! {
                _ = sleep(Duration::from_millis(WRITE_DEADLINE)) => {
                    warn!("Sending to serial characteristic took too long");
                }
                result = fut => {
                    if let Err(err) = result {
                        warn!("Failed to send to serial characteristic: {:?}", err);
                    }
                }
            };

            inner.lock().expect("Failed to lock BlunoDriver inner").busy = false;
        });

        Ok(())
    }
}

impl Drop for BlunoDriver {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn addresses_compare_case_insensitively() {
        assert!(same_address("aa:bb:cc:dd:ee:ff", "AA:BB:CC:DD:EE:FF"));
        assert!(!same_address("AA:BB:CC:DD:EE:FF", "AA:BB:CC:DD:EE:00"));
    }

    #[test]
    fn construction_requires_runtime() {
        assert!(matches!(BlunoDriver::new("AA:BB:CC:DD:EE:FF"), Err(DeviceError::NoRuntime)));
    }

    #[tokio::test]
    async fn cleanup_runs_when_raced_future_is_dropped() {
        let cleaned = Arc::new(AtomicBool::new(false));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let flag = cleaned.clone();
        let work = async move {
            let _scanning = CleanupOnDrop::new(Handle::current(), async move {
                flag.store(true, Ordering::SeqCst);
            });
            std::future::pending::<()>().await
        };

        tokio::select! {
            biased;
            _ = work => unreachable!(),
            _ = cancel.cancelled() => {},
        }

        for _ in 0..3 {
            tokio::task::yield_now().await;
        }
        assert!(cleaned.load(Ordering::SeqCst));
    }
}
