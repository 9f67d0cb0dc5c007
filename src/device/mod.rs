pub mod bluno;
pub mod connection;
pub mod constants;
pub mod transport;
pub mod types;

#[cfg(all(feature = "bluez", target_os = "linux"))]
pub mod rfcomm;
