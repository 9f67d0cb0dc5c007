use std::sync::Arc;
use log::{info, warn};
use tokio::io::{stdin, AsyncBufReadExt, BufReader, Lines, Stdin};
use tokio::runtime::Runtime;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::cli::args::{Args, Command};
use crate::cli::terminal::{parse_choice, TerminalSurface};
use crate::config::io::{ConfigIO, PreferenceStore};
use crate::config::types::{DefaultDevice, Preferences};
use crate::device::connection::ConnectionEstablisher;
use crate::device::transport::{RobotSession, SystemTransports};
use crate::device::types::{ConnectionOutcome, DeviceRecord, TransportKind};
use crate::discovery::cache;
use crate::discovery::capabilities::RadioCapabilities;
use crate::discovery::SystemScanners;
use crate::error::{AppRunError, ConfigError, ConnectError};
use crate::selector::DiscoverySelector;

type TerminalLines = Lines<BufReader<Stdin>>;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PreferenceChanges {
    pub filter_incompatible: Option<bool>,
    pub scan_classic: Option<bool>,
    pub scan_low_energy: Option<bool>,
}

/// Applies the given changes on top of the stored preferences. Nothing is written when there are
/// no changes.
pub fn update_preferences(store: &dyn PreferenceStore, changes: PreferenceChanges) -> Result<Preferences, ConfigError> {
    let current = Preferences::load(store);
    let updated = Preferences {
        compatible_only: changes.filter_incompatible.unwrap_or(current.compatible_only),
        scan_classic: changes.scan_classic.unwrap_or(current.scan_classic),
        scan_low_energy: changes.scan_low_energy.unwrap_or(current.scan_low_energy),
    };

    if updated != current {
        updated.save(store)?;
        info!("Saved preferences {:?}", updated);
    }
    Ok(updated)
}

/// The robot the `connect` command targets.
pub fn connect_target(
    store: &dyn PreferenceStore,
    address: Option<String>,
    name: Option<String>,
    classic: bool,
) -> Result<DeviceRecord, AppRunError> {
    let transport = if classic { TransportKind::Classic } else { TransportKind::LowEnergy };

    match address {
        Some(address) => {
            let name = name.unwrap_or_else(|| address.clone());
            Ok(DeviceRecord::new(address, name, transport))
        },
        None => match DefaultDevice::load(store) {
            Some(default) => Ok(DeviceRecord::new(default.identifier, name.unwrap_or(default.name), transport)),
            None => Err(AppRunError::NoDefaultDevice),
        },
    }
}

fn make_runtime() -> Result<Runtime, AppRunError> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    Ok(runtime)
}

fn make_establisher(store: Arc<dyn PreferenceStore>) -> ConnectionEstablisher {
    ConnectionEstablisher::new(RobotSession::new(), Arc::new(SystemTransports), store)
}

async fn hold_connection(
    session: &RobotSession,
    outcome: ConnectionOutcome,
    settled: JoinHandle<()>,
    lines: &mut TerminalLines,
) -> Result<(), AppRunError> {
    let device = match outcome {
        ConnectionOutcome::Connected(device) => device,
        ConnectionOutcome::Failed(err) => return Err(err.into()),
    };

    if let Err(err) = settled.await {
        warn!("Post-connect handshake did not finish: {}", err);
    }

    println!("Connected to {}, press enter to disconnect", device);
    lines.next_line().await?;
    session.disconnect();
    Ok(())
}

async fn scan(store: Arc<dyn PreferenceStore>) -> Result<(), AppRunError> {
    let capabilities = RadioCapabilities::probe().await;
    info!("Radio capabilities: {:?}", capabilities);

    let establisher = make_establisher(store.clone());
    let surface = Arc::new(TerminalSurface::default());
    let selector = DiscoverySelector::new(store, capabilities, &SystemScanners, establisher.clone(), surface)?;
    selector.open()?;
    println!("Type the number of a robot and press enter to connect. An empty line quits.");

    let mut lines = BufReader::new(stdin()).lines();
    let device = loop {
        let line = match lines.next_line().await? {
            Some(line) if !line.trim().is_empty() => line,
            _ => break None,
        };

        let results = selector.coordinator().results();
        match parse_choice(&line, &results) {
            Some(index) => break Some(results[index].clone()),
            None => println!("No robot numbered {}", line.trim()),
        }
    };

    let device = match device {
        Some(device) => device,
        None => {
            selector.dismiss();
            return Err(AppRunError::NothingSelected);
        },
    };

    let selection = selector.select(device).await;
    hold_connection(establisher.session(), selection.outcome, selection.settled, &mut lines).await
}

async fn connect(store: Arc<dyn PreferenceStore>, device: DeviceRecord) -> Result<(), AppRunError> {
    let establisher = make_establisher(store);
    let pending = establisher.connect(device, CancellationToken::new());
    let outcome = pending.outcome.await
        .unwrap_or(ConnectionOutcome::Failed(ConnectError::Cancelled));

    let mut lines = BufReader::new(stdin()).lines();
    hold_connection(establisher.session(), outcome, pending.task, &mut lines).await
}

fn print_preferences(store: &dyn PreferenceStore, prefs: &Preferences) {
    println!("filter incompatible devices: {}", prefs.compatible_only);
    println!("scan bluetooth: {}", prefs.scan_classic);
    println!("scan bluetooth LE: {}", prefs.scan_low_energy);
    println!("known devices: {}", cache::load(store).len());

    match DefaultDevice::load(store) {
        Some(default) => println!("autoconnect device: {} {}", default.name, default.identifier),
        None => println!("autoconnect device: none"),
    }
}

pub fn run_application(args: Args) -> Result<(), AppRunError> {
    let config_io = ConfigIO::new_sync()?;
    let mut config_locker = config_io.locker()?;
    let _lock_guard = config_locker.lock()?;
    let store: Arc<dyn PreferenceStore> = Arc::new(config_io);

    match args.command {
        Command::Scan => make_runtime()?.block_on(scan(store)),
        Command::Connect { address, name, classic } => {
            let device = connect_target(store.as_ref(), address, name, classic)?;
            make_runtime()?.block_on(connect(store, device))
        },
        Command::Prefs { filter_incompatible, scan_classic, scan_le } => {
            let changes = PreferenceChanges { filter_incompatible, scan_classic, scan_low_energy: scan_le };
            let prefs = update_preferences(store.as_ref(), changes)?;
            print_preferences(store.as_ref(), &prefs);
            Ok(())
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::io::MemoryStore;
    use crate::config::types::{PREF_FILTER_INCOMPATIBLE, PREF_SCAN_LOW_ENERGY};

    #[test]
    fn preference_changes_are_saved() {
        let store = MemoryStore::new();
        let changes = PreferenceChanges { scan_low_energy: Some(false), ..Default::default() };

        let prefs = update_preferences(&store, changes).unwrap();

        assert_eq!(prefs, Preferences { compatible_only: true, scan_classic: true, scan_low_energy: false });
        assert_eq!(store.get_bool(PREF_SCAN_LOW_ENERGY, true), false);
        assert_eq!(Preferences::load(&store), prefs);
    }

    #[test]
    fn no_changes_writes_nothing() {
        let store = MemoryStore::new();
        let prefs = update_preferences(&store, PreferenceChanges::default()).unwrap();

        assert_eq!(prefs, Preferences::default());
        assert!(store.get(PREF_FILTER_INCOMPATIBLE).is_none());
    }

    #[test]
    fn connect_target_uses_address() {
        let store = MemoryStore::new();
        let device = connect_target(&store, Some("00:11:22:33:44:55".into()), None, true).unwrap();

        assert_eq!(device, DeviceRecord::new("00:11:22:33:44:55", "00:11:22:33:44:55", TransportKind::Classic));
    }

    #[test]
    fn connect_target_falls_back_to_default_device() {
        let store = MemoryStore::new();
        assert!(matches!(connect_target(&store, None, None, false), Err(AppRunError::NoDefaultDevice)));

        DefaultDevice { identifier: "AA:BB:CC:DD:EE:FF".into(), name: "Mobbob".into() }.save(&store);
        let device = connect_target(&store, None, None, false).unwrap();
        assert_eq!(device, DeviceRecord::new("AA:BB:CC:DD:EE:FF", "Mobbob", TransportKind::LowEnergy));
    }
}
