//! BLE link to ilumi bulbs over btleplug
//!
//! Bulbs are found by scanning, connected by address, and spoken to through
//! the single API characteristic (writes plus notifications).

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use btleplug::api::{
    BDAddr, Central, Characteristic, Manager as _, Peripheral as _, ScanFilter, ValueNotification,
    WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::{Stream, StreamExt};
use serde::Serialize;
use tokio::time::{Instant, sleep};
use tracing::{debug, info};
use uuid::Uuid;

use ilumi_engine::{Link, Transport, TransportError, WriteMode};
use ilumi_proto::MacAddress;
use ilumi_proto::ble::{API_CHAR_UUID, is_bulb_name};

const SCAN_POLL: Duration = Duration::from_millis(250);

/// A bulb seen while scanning
#[derive(Debug, Clone, Serialize)]
pub struct DiscoveredBulb {
    pub name: String,
    pub address: MacAddress,
    pub rssi: Option<i16>,
}

fn to_mac(addr: BDAddr) -> MacAddress {
    MacAddress(addr.into_inner())
}

fn api_char_uuid() -> Uuid {
    Uuid::from_u128(API_CHAR_UUID)
}

/// Get the first Bluetooth adapter
pub async fn get_adapter() -> Result<Adapter, TransportError> {
    let manager = Manager::new().await.map_err(|e| TransportError::Connect(e.to_string()))?;
    let adapters = manager.adapters().await.map_err(|e| TransportError::Connect(e.to_string()))?;
    adapters.into_iter().next().ok_or(TransportError::NoAdapter)
}

pub struct BleTransport {
    adapter: Adapter,
    /// How long to scan for a bulb the adapter has not seen yet
    scan_time: Duration,
}

impl BleTransport {
    pub async fn new() -> Result<Self, TransportError> {
        Ok(Self { adapter: get_adapter().await?, scan_time: Duration::from_secs(5) })
    }

    pub fn with_scan_time(mut self, scan_time: Duration) -> Self {
        self.scan_time = scan_time;
        self
    }

    /// Scan for `duration` and return every bulb heard, strongest first
    pub async fn scan(&self, duration: Duration) -> Result<Vec<DiscoveredBulb>, TransportError> {
        let scan_err = |e: btleplug::Error| TransportError::Connect(e.to_string());

        self.adapter.start_scan(ScanFilter::default()).await.map_err(scan_err)?;
        sleep(duration).await;
        let peripherals = self.adapter.peripherals().await.map_err(scan_err)?;

        let mut found = Vec::new();
        for peripheral in peripherals {
            let Ok(Some(props)) = peripheral.properties().await else { continue };
            let name = props.local_name.unwrap_or_default();
            if is_bulb_name(&name) {
                let address = to_mac(peripheral.address());
                found.push(DiscoveredBulb { name, address, rssi: props.rssi });
            }
        }

        self.adapter.stop_scan().await.map_err(scan_err)?;
        found.sort_by_key(|b| std::cmp::Reverse(b.rssi.unwrap_or(i16::MIN)));
        info!(count = found.len(), "scan finished");
        Ok(found)
    }

    async fn known(&self, address: MacAddress) -> Result<Option<Peripheral>, TransportError> {
        let peripherals =
            self.adapter.peripherals().await.map_err(|e| TransportError::Connect(e.to_string()))?;
        Ok(peripherals.into_iter().find(|p| to_mac(p.address()) == address))
    }

    /// The adapter only hands out peripherals it has seen advertise
    async fn find(&self, address: MacAddress) -> Result<Peripheral, TransportError> {
        if let Some(peripheral) = self.known(address).await? {
            return Ok(peripheral);
        }

        debug!(%address, "scanning for bulb");
        self.adapter
            .start_scan(ScanFilter::default())
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;

        let deadline = Instant::now() + self.scan_time;
        let found = loop {
            if let Some(peripheral) = self.known(address).await? {
                break Some(peripheral);
            }
            if Instant::now() >= deadline {
                break None;
            }
            sleep(SCAN_POLL).await;
        };

        let _ = self.adapter.stop_scan().await;
        found.ok_or(TransportError::NotFound(address))
    }
}

#[async_trait]
impl Transport for BleTransport {
    type Link = BleLink;

    async fn connect(&self, address: MacAddress) -> Result<BleLink, TransportError> {
        let connect_err = |e: btleplug::Error| TransportError::Connect(e.to_string());
        let peripheral = self.find(address).await?;

        if !peripheral.is_connected().await.map_err(connect_err)? {
            peripheral.connect().await.map_err(connect_err)?;
        }
        peripheral.discover_services().await.map_err(connect_err)?;

        let uuid = api_char_uuid();
        let characteristic = peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == uuid)
            .ok_or(TransportError::MissingCharacteristic(address))?;

        peripheral
            .subscribe(&characteristic)
            .await
            .map_err(|e| TransportError::Notify(e.to_string()))?;
        let notifications = peripheral
            .notifications()
            .await
            .map_err(|e| TransportError::Notify(e.to_string()))?;

        debug!(%address, "API characteristic ready");
        Ok(BleLink { address, peripheral, characteristic, notifications })
    }
}

pub struct BleLink {
    address: MacAddress,
    peripheral: Peripheral,
    characteristic: Characteristic,
    notifications: Pin<Box<dyn Stream<Item = ValueNotification> + Send>>,
}

#[async_trait]
impl Link for BleLink {
    async fn write(&mut self, bytes: &[u8], mode: WriteMode) -> Result<(), TransportError> {
        let write_type = match mode {
            WriteMode::WithResponse => WriteType::WithResponse,
            WriteMode::WithoutResponse => WriteType::WithoutResponse,
        };
        self.peripheral
            .write(&self.characteristic, bytes, write_type)
            .await
            .map_err(|e| TransportError::Write(e.to_string()))
    }

    async fn notification(&mut self) -> Result<Option<Vec<u8>>, TransportError> {
        let uuid = self.characteristic.uuid;
        while let Some(n) = self.notifications.next().await {
            if n.uuid == uuid {
                return Ok(Some(n.value));
            }
        }
        Ok(None)
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        let _ = self.peripheral.unsubscribe(&self.characteristic).await;
        self.peripheral
            .disconnect()
            .await
            .map_err(|e| TransportError::Disconnect(e.to_string()))?;
        debug!(address = %self.address, "disconnected");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn addresses_keep_display_order() {
        let addr = BDAddr::from([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]);
        assert_eq!(to_mac(addr).to_string(), "AA:BB:CC:DD:EE:FF");
        assert_eq!(to_mac(addr).to_string(), addr.to_string());
    }

    #[test]
    fn api_uuid_matches_protocol_constant() {
        assert_eq!(api_char_uuid().to_string(), "f000f0c1-0451-4000-b000-000000000000");
    }
}
