use std::sync::Arc;
use btleplug::api::{Central, CentralEvent, Manager as _, Peripheral as _, ScanFilter};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::StreamExt;
use log::{debug, info, warn};
use tokio::runtime::Handle;
use tokio::time::{sleep, Duration};
use uuid::Uuid;

use crate::device::bluno::CleanupOnDrop;
use crate::device::constants::{make_bluno_service_uuid, LOW_ENERGY_SCAN_WINDOW, PROBE_DEADLINE};
use crate::device::types::{DeviceRecord, TransportKind};
use crate::discovery::scan::{ScanContext, ScanLifecycle, ScanRun, ScanSource};
use crate::error::DeviceError;

/// Low-energy search through the first btleplug adapter.
pub struct LowEnergyScan {
    runtime: Handle,
    ctx: ScanContext,
    lifecycle: Arc<ScanLifecycle>,
}

impl LowEnergyScan {
    pub fn new(ctx: ScanContext) -> Result<Self, DeviceError> {
        let runtime = Handle::try_current().map_err(|_| DeviceError::NoRuntime)?;
        Ok(LowEnergyScan {
            runtime,
            ctx,
            lifecycle: Arc::new(ScanLifecycle::default()),
        })
    }
}

async fn open_adapter() -> Result<Adapter, DeviceError> {
    let manager = Manager::new().await?;
    let adapters = manager.adapters().await?;
    adapters.into_iter().next().ok_or(DeviceError::NoAdapter)
}

// Some environments do not advertise services, in that case connect and look at the GATT table.
async fn probe(peripheral: &Peripheral, advertised: &[Uuid]) -> bool {
    let bluno_service_uuid = make_bluno_service_uuid();
    if advertised.contains(&bluno_service_uuid) {
        return true;
    }

    let inspect = async {
        peripheral.connect().await?;
        peripheral.discover_services().await?;
        let found = peripheral.services().iter().any(|service| service.uuid == bluno_service_uuid);
        Ok::<bool, DeviceError>(found)
    };

    let compatible = tokio::select! {
        _ = sleep(Duration::from_millis(PROBE_DEADLINE)) => {
            debug!("Probing {} took too long", peripheral.address());
            false
        }
        result = inspect => match result {
            Ok(found) => found,
            Err(err) => {
                debug!("Probing {} failed: {:?}", peripheral.address(), err);
                false
            },
        }
    };

    if let Err(err) = peripheral.disconnect().await {
        debug!("Failed to disconnect after probe: {:?}", err);
    }
    compatible
}

async fn search(adapter: &Adapter, run: &mut ScanRun) -> Result<(), DeviceError> {
    let mut events = adapter.events().await?;
    info!("Scanning using adapter {}...", adapter.adapter_info().await.unwrap_or("UNKNOWN".to_string()));
    adapter.start_scan(ScanFilter::default()).await?;

    while let Some(event) = events.next().await {
        let id = match event {
            CentralEvent::DeviceDiscovered(id) => id,
            _ => continue,
        };

        let peripheral = match adapter.peripheral(&id).await {
            Ok(peripheral) => peripheral,
            Err(err) => {
                warn!("Discovered peripheral vanished: {:?}", err);
                continue;
            },
        };

        let properties = match peripheral.properties().await {
            Ok(Some(properties)) => properties,
            Ok(None) => {
                debug!("Peripheral has no properties");
                continue;
            },
            Err(err) => {
                warn!("Could not query peripheral for properties: {:?}", err);
                continue;
            },
        };

        let device = DeviceRecord::new(
            properties.address.to_string(),
            properties.local_name.unwrap_or(String::from("Unknown")),
            TransportKind::LowEnergy,
        );
        run.report(device, || probe(&peripheral, &properties.services)).await;
    }

    Ok(())
}

impl ScanSource for LowEnergyScan {
    fn transport(&self) -> TransportKind {
        TransportKind::LowEnergy
    }

    fn start(&self) {
        let runtime = self.runtime.clone();
        let window = Duration::from_millis(LOW_ENERGY_SCAN_WINDOW);

        self.lifecycle.spawn_window(&self.runtime, self.ctx.clone(), TransportKind::LowEnergy, window, |mut run| async move {
            let adapter = open_adapter().await?;
            let _scanning = CleanupOnDrop::stop_scanning(runtime, vec![adapter.clone()]);
            search(&adapter, &mut run).await
        });
    }

    fn stop(&self) {
        self.lifecycle.stop();
    }
}
