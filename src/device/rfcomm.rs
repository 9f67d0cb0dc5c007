use std::sync::{Arc, Mutex};
use bluer::rfcomm::{SocketAddr, Stream};
use bluer::Address;
use log::{info, warn};
use tokio::io::AsyncWriteExt;
use tokio::runtime::Handle;
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::{sleep, Duration};
use tokio_util::sync::CancellationToken;

use crate::device::constants::{RFCOMM_CHANNEL, WRITE_DEADLINE};
use crate::device::transport::TransportDriver;
use crate::device::types::LinkState;
use crate::error::DeviceError;

struct RfcommInner {
    state: LinkState,
    stream: Option<Arc<AsyncMutex<Stream>>>,
    busy: bool,
}

/// Serial Port Profile link to a classic bluetooth robot, through BlueZ.
pub struct RfcommDriver {
    runtime: Handle,
    cancel: CancellationToken,
    inner: Arc<Mutex<RfcommInner>>,
}

impl RfcommDriver {
    pub fn new(identifier: &str) -> Result<Self, DeviceError> {
        let address: Address = identifier.parse()
            .map_err(|_| DeviceError::InvalidAddress(identifier.to_string()))?;
        let runtime = Handle::try_current().map_err(|_| DeviceError::NoRuntime)?;
        let cancel = CancellationToken::new();
        let inner = Arc::new(Mutex::new(RfcommInner {
            state: LinkState::Connecting,
            stream: None,
            busy: false,
        }));

        let task_cancel = cancel.clone();
        let task_inner = inner.clone();
        runtime.spawn(async move {
            let target = SocketAddr::new(address, RFCOMM_CHANNEL);
            tokio::select! {
                _ = task_cancel.cancelled() => {},
                result = Stream::connect(target) => {
                    let mut inner = task_inner.lock().expect("Failed to lock RfcommDriver inner");
                    match result {
                        Ok(stream) => {
                            info!("RFCOMM link to {} ready", address);
                            inner.stream = Some(Arc::new(AsyncMutex::new(stream)));
                            inner.state = LinkState::Connected;
                        },
                        Err(err) => {
                            warn!("RFCOMM connect to {} failed: {:?}", address, err);
                            inner.state = LinkState::Disconnected;
                        },
                    }
                },
            }
        });

        Ok(RfcommDriver { runtime, cancel, inner })
    }
}

impl TransportDriver for RfcommDriver {
    fn connection_state(&self) -> LinkState {
        self.inner.lock().expect("Failed to lock RfcommDriver inner").state
    }

    fn disconnect(&self) {
        self.cancel.cancel();

        let stream = {
            let mut inner = self.inner.lock().expect("Failed to lock RfcommDriver inner");
            inner.state = LinkState::Disconnected;
            inner.stream.take()
        };

        if let Some(stream) = stream {
            self.runtime.spawn(async move {
                if let Err(err) = stream.lock().await.shutdown().await {
                    warn!("Failed to shut down RFCOMM stream: {:?}", err);
                }
            });
        }
    }

    fn is_busy(&self) -> bool {
        self.inner.lock().expect("Failed to lock RfcommDriver inner").busy
    }

    fn send_command(&self, command: &[u8]) -> Result<(), DeviceError> {
        let stream = {
            let mut inner = self.inner.lock().expect("Failed to lock RfcommDriver inner");
            let stream = inner.stream.clone().ok_or(DeviceError::NotConnected)?;
            inner.busy = true;
            stream
        };

        let inner = self.inner.clone();
        let command = command.to_vec();
        self.runtime.spawn(async move {
            let mut stream = stream.lock().await;

            tokio::select! {
                _ = sleep(Duration::from_millis(WRITE_DEADLINE)) => {
                    warn!("Sending to RFCOMM stream took too long");
                }
                result = stream.write_all(&command) => {
                    if let Err(err) = result {
                        warn!("Failed to send to RFCOMM stream: {:?}", err);
                    }
                }
            };

            inner.lock().expect("Failed to lock RfcommDriver inner").busy = false;
        });

        Ok(())
    }
}

impl Drop for RfcommDriver {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
