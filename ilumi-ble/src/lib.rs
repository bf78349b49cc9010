//! ilumi BLE transport
//!
//! [`BleTransport`] implements the engine's transport over `btleplug`.
//!
//! # Example
//!
//! ```ignore
//! use ilumi_ble::BleTransport;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let transport = BleTransport::new().await?;
//!     for bulb in transport.scan(std::time::Duration::from_secs(5)).await? {
//!         println!("{} {} ({:?} dBm)", bulb.address, bulb.name, bulb.rssi);
//!     }
//!     Ok(())
//! }
//! ```

pub mod ble;

pub use ble::{BleLink, BleTransport, DiscoveredBulb};
