use std::sync::Arc;
use bluer::{AdapterEvent, DiscoveryFilter, DiscoveryTransport, Session};
use futures::StreamExt;
use log::{debug, info, warn};
use tokio::runtime::Handle;
use tokio::time::Duration;

use crate::device::constants::{make_serial_port_profile_uuid, CLASSIC_SCAN_WINDOW};
use crate::device::types::{DeviceRecord, TransportKind};
use crate::discovery::scan::{ScanContext, ScanLifecycle, ScanRun, ScanSource};
use crate::error::DeviceError;

/// BR/EDR inquiry through the BlueZ default adapter.
pub struct ClassicScan {
    runtime: Handle,
    ctx: ScanContext,
    lifecycle: Arc<ScanLifecycle>,
}

impl ClassicScan {
    pub fn new(ctx: ScanContext) -> Result<Self, DeviceError> {
        let runtime = Handle::try_current().map_err(|_| DeviceError::NoRuntime)?;
        Ok(ClassicScan {
            runtime,
            ctx,
            lifecycle: Arc::new(ScanLifecycle::default()),
        })
    }
}

async fn probe(device: &bluer::Device) -> bool {
    let serial_port_profile = make_serial_port_profile_uuid();
    match device.uuids().await {
        Ok(Some(uuids)) => uuids.contains(&serial_port_profile),
        Ok(None) => false,
        Err(err) => {
            debug!("Probing {} failed: {:?}", device.address(), err);
            false
        },
    }
}

// Discovery runs for as long as the event stream is alive.
async fn search(run: &mut ScanRun) -> Result<(), DeviceError> {
    let session = Session::new().await?;
    let adapter = session.default_adapter().await?;
    info!("Scanning using adapter {}...", adapter.name());

    let mut filter = DiscoveryFilter::default();
    filter.transport = DiscoveryTransport::BrEdr;
    adapter.set_discovery_filter(filter).await?;

    let mut events = adapter.discover_devices().await?;
    while let Some(event) = events.next().await {
        let address = match event {
            AdapterEvent::DeviceAdded(address) => address,
            _ => continue,
        };

        let device = match adapter.device(address) {
            Ok(device) => device,
            Err(err) => {
                warn!("Discovered device vanished: {:?}", err);
                continue;
            },
        };
        let name = device.name().await.ok().flatten().unwrap_or(String::from("Unknown"));

        let record = DeviceRecord::new(address.to_string(), name, TransportKind::Classic);
        run.report(record, || probe(&device)).await;
    }

    Ok(())
}

impl ScanSource for ClassicScan {
    fn transport(&self) -> TransportKind {
        TransportKind::Classic
    }

    fn start(&self) {
        let window = Duration::from_millis(CLASSIC_SCAN_WINDOW);
        self.lifecycle.spawn_window(&self.runtime, self.ctx.clone(), TransportKind::Classic, window, |mut run| async move {
            search(&mut run).await
        });
    }

    fn stop(&self) {
        self.lifecycle.stop();
    }
}
