//! BLE GATT constants for the bulb's API service
//!
//! Every command and notification travels over a single characteristic.

/// Primary service UUID advertised by the bulbs
pub const SERVICE_UUID: u128 = 0xf000f0c0_0451_4000_b000_000000000000;

/// API characteristic UUID (write, write-without-response, notify)
pub const API_CHAR_UUID: u128 = 0xf000f0c1_0451_4000_b000_000000000000;

/// Whether an advertised local name looks like one of our bulbs
pub fn is_bulb_name(name: &str) -> bool {
    name.to_lowercase().contains("ilumi") || name.starts_with("L0")
}
