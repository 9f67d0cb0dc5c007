use std::io;
use thiserror::Error;
use std::str::Utf8Error;
use btleplug;
use serde_json;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to determine path to config file")]
    NoConfigPath,

    #[error("Failed to acquire file lock on config file: {source}")]
    CanNotLock { source: io::Error },

    #[error("Failed to encode/decode config as utf-8: {source}")]
    Utf8Error { #[from] source: Utf8Error },

    #[error("Failed to read/write config file: {source}")]
    IOError { #[from] source: io::Error },

    #[error("Failed to parse/build config file: {source}")]
    JsonError { #[from] source: serde_json::Error },
}

impl ConfigError {
    pub fn is_file_not_found_error(&self) -> bool {
        match self {
            ConfigError::IOError { source } => source.kind() == io::ErrorKind::NotFound,
            _ => false,
        }
    }
}

#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("Error communicating with device (btleplug): {source}")]
    Btle { #[from] source: btleplug::Error },

    #[cfg(all(feature = "bluez", target_os = "linux"))]
    #[error("Error communicating with device (bluez): {source}")]
    Bluez { #[from] source: bluer::Error },

    #[error("Error communicating with device: {source}")]
    IOError { #[from] source: io::Error },

    #[error("No bluetooth adapter is available")]
    NoAdapter,

    #[error("A required bluetooth characteristic is not available")]
    MissingCharacteristic,

    #[error("Invalid device address {0}")]
    InvalidAddress(String),

    #[error("No {0} transport is available in this build")]
    TransportUnsupported(&'static str),

    #[error("The device is not connected")]
    NotConnected,

    #[error("Device operations require a running tokio runtime")]
    NoRuntime,
}

#[derive(Error, Debug)]
pub enum ConnectError {
    #[error("Failed to open transport: {source}")]
    Transport { #[from] source: DeviceError },

    #[error("Device did not connect within {elapsed_ms}ms")]
    Timeout { elapsed_ms: u64 },

    #[error("Connection attempt was cancelled")]
    Cancelled,
}

#[derive(Error, Debug)]
pub enum DiscoveryError {
    #[error("Bluetooth not supported")]
    RadioMissing,

    #[error("Bluetooth not enabled")]
    RadioDisabled,
}

#[derive(Error, Debug)]
pub enum AppRunError {
    #[error("Failed to start application (config): {source}")]
    ConfigError { #[from] source: ConfigError },

    #[error("Failed to start discovery: {source}")]
    DiscoveryError { #[from] source: DiscoveryError },

    #[error("Failed to connect: {source}")]
    ConnectError { #[from] source: ConnectError },

    #[error("Failed to start the bluetooth stack: {source}")]
    DeviceError { #[from] source: DeviceError },

    #[error("Failed to read from terminal: {source}")]
    IOError { #[from] source: io::Error },

    #[error("No device was selected")]
    NothingSelected,

    #[error("No address given and no robot has been connected before")]
    NoDefaultDevice,
}
