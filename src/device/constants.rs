use uuid::Uuid;

/**
 * How often (milliseconds) to poll the transport for its connection state, and the robot for
 * its busy flag after connecting.
 */
pub const POLL_DELAY: u64 = 100;

/**
 * How long (milliseconds) a transport may take to report "connected" before the attempt fails.
 */
pub const CONNECT_DEADLINE: u64 = 5000;

/**
 * How long (milliseconds) to wait for the robot to finish the acknowledgment command.
 */
pub const SETTLE_DEADLINE: u64 = 10000;

/**
 * How long (milliseconds) a write to a characteristic or socket may take.
 */
pub const WRITE_DEADLINE: u64 = 2000;

/**
 * How often (milliseconds) to check that a connected peripheral is still there.
 */
pub const LINK_CHECK_DELAY: u64 = 1000;

/**
 * How long (milliseconds) checking if the peripheral is still connected may take
 */
pub const IS_CONNECTED_DEADLINE: u64 = 2000;

/**
 * How long (milliseconds) a low-energy search window lasts.
 */
pub const LOW_ENERGY_SCAN_WINDOW: u64 = 10000;

/**
 * How long (milliseconds) a classic inquiry lasts.
 */
pub const CLASSIC_SCAN_WINDOW: u64 = 12000;

/**
 * How long (milliseconds) a GATT probe of a single peripheral may take.
 */
pub const PROBE_DEADLINE: u64 = 3000;

/**
 * The UUID of the Bluetooth BLE serial service exposed by Bluno boards
 */
pub const BLUNO_SERVICE: &str = "0000dfb0-0000-1000-8000-00805f9b34fb";

/**
 * The UUID of the Bluetooth BLE characteristic carrying serial data on Bluno boards.
 */
pub const BLUNO_SERIAL_CHARACTERISTIC: &str = "0000dfb1-0000-1000-8000-00805f9b34fb";

/**
 * The UUID of the classic Serial Port Profile.
 */
pub const SERIAL_PORT_PROFILE: &str = "00001101-0000-1000-8000-00805f9b34fb";

/**
 * The RFCOMM channel robots listen on.
 */
pub const RFCOMM_CHANNEL: u8 = 1;

/**
 * Sent once a robot is connected so it can confirm with a short movement.
 */
pub const COMMAND_ACKNOWLEDGE: &[u8] = b"bounce\n";

pub fn make_bluno_service_uuid() -> Uuid {
    Uuid::parse_str(BLUNO_SERVICE).expect("BLUNO_SERVICE is a valid uuid")
}

pub fn make_bluno_serial_uuid() -> Uuid {
    Uuid::parse_str(BLUNO_SERIAL_CHARACTERISTIC).expect("BLUNO_SERIAL_CHARACTERISTIC is a valid uuid")
}

pub fn make_serial_port_profile_uuid() -> Uuid {
    Uuid::parse_str(SERIAL_PORT_PROFILE).expect("SERIAL_PORT_PROFILE is a valid uuid")
}
