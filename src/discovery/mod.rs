use std::sync::Arc;

use crate::discovery::scan::{ScanContext, ScanSource};
use crate::error::DeviceError;

pub mod cache;
pub mod capabilities;
pub mod coordinator;
pub mod low_energy;
pub mod scan;

#[cfg(all(feature = "bluez", target_os = "linux"))]
pub mod classic;

pub trait ScanSourceFactory {
    fn classic(&self, ctx: ScanContext) -> Result<Arc<dyn ScanSource>, DeviceError>;

    fn low_energy(&self, ctx: ScanContext) -> Result<Arc<dyn ScanSource>, DeviceError>;
}

/// Scans through the radio stacks of the host.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemScanners;

impl ScanSourceFactory for SystemScanners {
    #[cfg(all(feature = "bluez", target_os = "linux"))]
    fn classic(&self, ctx: ScanContext) -> Result<Arc<dyn ScanSource>, DeviceError> {
        Ok(Arc::new(classic::ClassicScan::new(ctx)?))
    }

    #[cfg(not(all(feature = "bluez", target_os = "linux")))]
    fn classic(&self, _ctx: ScanContext) -> Result<Arc<dyn ScanSource>, DeviceError> {
        Err(DeviceError::TransportUnsupported("classic bluetooth"))
    }

    fn low_energy(&self, ctx: ScanContext) -> Result<Arc<dyn ScanSource>, DeviceError> {
        Ok(Arc::new(low_energy::LowEnergyScan::new(ctx)?))
    }
}
