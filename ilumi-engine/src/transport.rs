//! The seam between the engine and a BLE stack
//!
//! The engine only needs three things from a link: write bytes to the API
//! characteristic (with or without a link-level acknowledgment), receive
//! notification bytes one at a time, and disconnect.

use async_trait::async_trait;
use ilumi_proto::MacAddress;

use crate::error::TransportError;
use crate::lease::LeaseSlot;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    WithResponse,
    WithoutResponse,
}

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    type Link: Link;

    /// Connect to one peripheral. Timeouts are applied by the caller.
    async fn connect(&self, address: MacAddress) -> Result<Self::Link, TransportError>;

    /// The slot every lease over this transport competes for. Radios share
    /// the process-wide slot unless they say otherwise.
    fn slot(&self) -> LeaseSlot {
        LeaseSlot::process()
    }
}

#[async_trait]
pub trait Link: Send + 'static {
    async fn write(&mut self, bytes: &[u8], mode: WriteMode) -> Result<(), TransportError>;

    /// Next notification from the peripheral. `Ok(None)` once the stream has ended.
    async fn notification(&mut self) -> Result<Option<Vec<u8>>, TransportError>;

    async fn disconnect(&mut self) -> Result<(), TransportError>;
}
