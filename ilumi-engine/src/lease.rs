//! The single live BLE connection
//!
//! The bulbs' radios (and most host adapters) cope badly with more than one
//! connection at a time, so every connect/operate/disconnect cycle goes
//! through a [`ConnectionLease`]. Every lease draws on one [`LeaseSlot`]
//! per process, and holding a [`ScopedConnection`] means holding its only
//! permit.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore, watch};
use tracing::{debug, warn};

use ilumi_proto::DialectError;

use crate::error::{Error, Phase, TransportError};
use crate::topology::DeviceIdentity;
use crate::transport::{Link, Transport, WriteMode};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseState {
    Idle,
    Connecting,
    Ready,
    InUse,
    Disconnecting,
    Failed,
}

#[derive(Debug)]
struct Shared {
    permits: Arc<Semaphore>,
    state: watch::Sender<LeaseState>,
}

impl Shared {
    fn set(&self, state: LeaseState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!(?previous, ?state, "lease");
        }
    }
}

/// The right to hold one live connection. Clones share it.
#[derive(Debug, Clone)]
pub struct LeaseSlot(Arc<Shared>);

impl LeaseSlot {
    /// A slot of its own, independent of every other
    pub fn new() -> Self {
        let (state, _) = watch::channel(LeaseState::Idle);
        Self(Arc::new(Shared { permits: Arc::new(Semaphore::new(1)), state }))
    }

    /// The slot shared by every lease in this process
    pub fn process() -> Self {
        static PROCESS: OnceLock<LeaseSlot> = OnceLock::new();
        PROCESS.get_or_init(LeaseSlot::new).clone()
    }

    pub fn state(&self) -> LeaseState {
        *self.0.state.borrow()
    }
}

impl Default for LeaseSlot {
    fn default() -> Self {
        Self::new()
    }
}

pub struct ConnectionLease<T: Transport> {
    transport: T,
    shared: Arc<Shared>,
    connect_timeout: Duration,
}

impl<T: Transport> ConnectionLease<T> {
    /// A lease over `transport`, sharing the transport's slot
    pub fn new(transport: T, connect_timeout: Duration) -> Self {
        let LeaseSlot(shared) = transport.slot();
        Self { transport, shared, connect_timeout }
    }

    pub fn state(&self) -> LeaseState {
        *self.shared.state.borrow()
    }

    /// Observe state transitions
    pub fn subscribe(&self) -> watch::Receiver<LeaseState> {
        self.shared.state.subscribe()
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Wait for the lease, then connect to `device`.
    ///
    /// The connect attempt is bounded by the connect timeout; on failure the
    /// lease is handed back before returning.
    pub async fn acquire(
        &self,
        device: &DeviceIdentity,
    ) -> Result<ScopedConnection<T::Link>, Error> {
        let permit = self
            .shared
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| TransportError::Closed)?;

        let pending = Pending { shared: self.shared.clone(), permit: Some(permit) };
        self.shared.set(LeaseState::Connecting);

        let connect = self.transport.connect(device.address);
        let connected = tokio::time::timeout(self.connect_timeout, connect).await;
        match connected {
            Ok(Ok(link)) => {
                debug!(address = %device.address, "connected");
                Ok(pending.into_scoped(link, device.clone()))
            }
            Ok(Err(e)) => {
                warn!(address = %device.address, error = %e, "connect failed");
                Err(e.into())
            }
            Err(_) => {
                let after = self.connect_timeout;
                warn!(address = %device.address, ?after, "connect timed out");
                Err(Error::LeaseTimeout {
                    address: device.address,
                    phase: Phase::Connect,
                    after: self.connect_timeout,
                })
            }
        }
    }
}

/// Permit held while connecting. Dropping it (failure or cancellation)
/// marks the lease failed and returns it to idle.
struct Pending {
    shared: Arc<Shared>,
    permit: Option<OwnedSemaphorePermit>,
}

impl Pending {
    fn into_scoped<L: Link>(mut self, link: L, device: DeviceIdentity) -> ScopedConnection<L> {
        self.shared.set(LeaseState::Ready);
        ScopedConnection {
            device,
            link: Some(link),
            permit: self.permit.take(),
            shared: self.shared.clone(),
        }
    }
}

impl Drop for Pending {
    fn drop(&mut self) {
        if let Some(permit) = self.permit.take() {
            self.shared.set(LeaseState::Failed);
            self.shared.set(LeaseState::Idle);
            drop(permit);
        }
    }
}

/// A live connection to one bulb. Only one exists at a time.
///
/// Call [`ScopedConnection::release`] to disconnect. If the connection is
/// dropped instead, the disconnect runs on the runtime and the lease stays
/// taken until it finishes.
pub struct ScopedConnection<L: Link> {
    device: DeviceIdentity,
    link: Option<L>,
    permit: Option<OwnedSemaphorePermit>,
    shared: Arc<Shared>,
}

impl<L: Link> std::fmt::Debug for ScopedConnection<L> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScopedConnection")
            .field("device", &self.device.address)
            .finish()
    }
}

impl<L: Link> ScopedConnection<L> {
    pub fn device(&self) -> &DeviceIdentity {
        &self.device
    }

    fn link(&mut self) -> Result<&mut L, TransportError> {
        self.link.as_mut().ok_or(TransportError::Closed)
    }

    /// Write one packet encoded for `generation`
    pub async fn write(
        &mut self,
        bytes: &[u8],
        generation: ilumi_proto::Generation,
        mode: WriteMode,
    ) -> Result<(), Error> {
        if generation != self.device.generation {
            let device = self.device.generation;
            return Err(DialectError::Mismatch { encoded: generation, device }.into());
        }

        self.shared.set(LeaseState::InUse);
        let result = self.link()?.write(bytes, mode).await;
        self.shared.set(match result {
            Ok(()) => LeaseState::Ready,
            Err(_) => LeaseState::Failed,
        });
        Ok(result?)
    }

    pub async fn notification(&mut self) -> Result<Option<Vec<u8>>, TransportError> {
        self.link()?.notification().await
    }

    /// Disconnect and hand the lease back. The lease is free again even
    /// when the disconnect fails.
    pub async fn release(mut self) -> Result<(), TransportError> {
        let result = match self.link.take() {
            Some(mut link) => {
                self.shared.set(LeaseState::Disconnecting);
                link.disconnect().await
            }
            None => Ok(()),
        };
        self.shared.set(LeaseState::Idle);
        self.permit.take();
        result
    }
}

impl<L: Link> Drop for ScopedConnection<L> {
    fn drop(&mut self) {
        let Some(mut link) = self.link.take() else { return };
        let permit = self.permit.take();
        let shared = self.shared.clone();
        let address = self.device.address;

        shared.set(LeaseState::Disconnecting);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = link.disconnect().await {
                        warn!(%address, error = %e, "disconnect after drop failed");
                    }
                    shared.set(LeaseState::Idle);
                    drop(permit);
                });
            }
            Err(_) => {
                warn!(%address, "connection dropped outside a runtime; not disconnected");
                shared.set(LeaseState::Idle);
                drop(permit);
            }
        }
    }
}
