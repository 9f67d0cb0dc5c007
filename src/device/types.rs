use std::fmt;

use crate::error::ConnectError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    Classic,
    LowEnergy,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let result = match self {
            TransportKind::Classic => "Bluetooth",
            TransportKind::LowEnergy => "Bluetooth LE",
        };

        write!(f, "{}", result)
    }
}

/// A peripheral seen during discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceRecord {
    /// transport address, unique within a session
    pub identifier: String,
    pub name: String,
    pub transport: TransportKind,
    pub compatible: Option<bool>,
}

impl DeviceRecord {
    pub fn new(identifier: impl Into<String>, name: impl Into<String>, transport: TransportKind) -> Self {
        DeviceRecord {
            identifier: identifier.into(),
            name: name.into(),
            transport,
            compatible: None,
        }
    }
}

impl fmt::Display for DeviceRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.name, self.identifier)
    }
}

/// What a transport driver reports while it is polled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Connecting,
    Connected,
    Disconnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptState {
    Connecting,
    Connected,
    Failed,
}

#[derive(Debug)]
pub enum ConnectionOutcome {
    Connected(DeviceRecord),
    Failed(ConnectError),
}

impl ConnectionOutcome {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionOutcome::Connected(_))
    }
}
