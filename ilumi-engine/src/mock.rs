//! In-memory transport for tests. Records every write and counts live links.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use ilumi_proto::{Generation, MacAddress, Notification, Status};

use crate::error::TransportError;
use crate::lease::LeaseSlot;
use crate::transport::{Link, Transport, WriteMode};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Written {
    pub address: MacAddress,
    pub bytes: Vec<u8>,
    pub mode: WriteMode,
}

type Responder = Arc<dyn Fn(&Written) -> Vec<Vec<u8>> + Send + Sync>;

#[derive(Default)]
struct State {
    live: usize,
    max_live: usize,
    connects: Vec<MacAddress>,
    writes: Vec<Written>,
    fail_connect: HashSet<MacAddress>,
    hang_connect: HashSet<MacAddress>,
    hang_writes: HashSet<MacAddress>,
    fail_writes: HashMap<MacAddress, usize>,
    fail_disconnect: HashSet<MacAddress>,
}

#[derive(Clone, Default)]
pub struct MockTransport {
    state: Arc<Mutex<State>>,
    connect_delay: Duration,
    responder: Option<Responder>,
    /// Clones share it, so parallel tests never contend with each other
    slot: LeaseSlot,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_connect_delay(mut self, delay: Duration) -> Self {
        self.connect_delay = delay;
        self
    }

    pub fn fail_connect(self, address: MacAddress) -> Self {
        self.state.lock().unwrap().fail_connect.insert(address);
        self
    }

    pub fn hang_connect(self, address: MacAddress) -> Self {
        self.state.lock().unwrap().hang_connect.insert(address);
        self
    }

    pub fn hang_writes(self, address: MacAddress) -> Self {
        self.state.lock().unwrap().hang_writes.insert(address);
        self
    }

    /// The next `count` writes to `address` fail
    pub fn fail_writes(self, address: MacAddress, count: usize) -> Self {
        self.state.lock().unwrap().fail_writes.insert(address, count);
        self
    }

    /// Disconnects from `address` drop the link but report an error
    pub fn fail_disconnect(self, address: MacAddress) -> Self {
        self.state.lock().unwrap().fail_disconnect.insert(address);
        self
    }

    pub fn respond(mut self, f: impl Fn(&Written) -> Vec<Vec<u8>> + Send + Sync + 'static) -> Self {
        self.responder = Some(Arc::new(f));
        self
    }

    /// Acknowledge every acknowledged write with `status`
    pub fn ack_with(self, status: Status, generation: Generation) -> Self {
        self.respond(move |w| {
            if w.mode == WriteMode::WithoutResponse || w.bytes.len() < 6 {
                return vec![];
            }
            let opcode = generation.opcode(w.bytes[5]).unwrap();
            vec![Notification::ack(opcode, status).to_bytes(generation).unwrap()]
        })
    }

    pub fn live(&self) -> usize {
        self.state.lock().unwrap().live
    }

    pub fn max_live(&self) -> usize {
        self.state.lock().unwrap().max_live
    }

    pub fn connects(&self) -> Vec<MacAddress> {
        self.state.lock().unwrap().connects.clone()
    }

    pub fn writes(&self) -> Vec<Written> {
        self.state.lock().unwrap().writes.clone()
    }

    pub fn writes_to(&self, address: MacAddress) -> Vec<Vec<u8>> {
        self.writes().into_iter().filter(|w| w.address == address).map(|w| w.bytes).collect()
    }
}

#[async_trait]
impl Transport for MockTransport {
    type Link = MockLink;

    async fn connect(&self, address: MacAddress) -> Result<MockLink, TransportError> {
        tokio::time::sleep(self.connect_delay).await;
        let hang = {
            let mut state = self.state.lock().unwrap();
            state.connects.push(address);
            if state.fail_connect.contains(&address) {
                return Err(TransportError::NotFound(address));
            }
            state.hang_connect.contains(&address)
        };
        if hang {
            std::future::pending::<()>().await;
        }

        let mut state = self.state.lock().unwrap();
        state.live += 1;
        state.max_live = state.max_live.max(state.live);
        Ok(MockLink {
            address,
            state: self.state.clone(),
            responder: self.responder.clone(),
            inbox: VecDeque::new(),
            connected: true,
        })
    }

    fn slot(&self) -> LeaseSlot {
        self.slot.clone()
    }
}

pub struct MockLink {
    address: MacAddress,
    state: Arc<Mutex<State>>,
    responder: Option<Responder>,
    inbox: VecDeque<Vec<u8>>,
    connected: bool,
}

#[async_trait]
impl Link for MockLink {
    async fn write(&mut self, bytes: &[u8], mode: WriteMode) -> Result<(), TransportError> {
        let hang = {
            let mut state = self.state.lock().unwrap();
            if let Some(left) = state.fail_writes.get_mut(&self.address) {
                if *left > 0 {
                    *left -= 1;
                    return Err(TransportError::Write("injected failure".into()));
                }
            }
            state.hang_writes.contains(&self.address)
        };
        if hang {
            std::future::pending::<()>().await;
        }

        let written = Written { address: self.address, bytes: bytes.to_vec(), mode };
        if let Some(responder) = &self.responder {
            self.inbox.extend(responder(&written));
        }
        self.state.lock().unwrap().writes.push(written);
        Ok(())
    }

    async fn notification(&mut self) -> Result<Option<Vec<u8>>, TransportError> {
        match self.inbox.pop_front() {
            Some(bytes) => Ok(Some(bytes)),
            None => std::future::pending().await,
        }
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        let mut state = self.state.lock().unwrap();
        if self.connected {
            self.connected = false;
            state.live -= 1;
        }
        if state.fail_disconnect.contains(&self.address) {
            return Err(TransportError::Disconnect("injected failure".into()));
        }
        Ok(())
    }
}

impl Drop for MockLink {
    fn drop(&mut self) {
        if self.connected {
            if let Ok(mut state) = self.state.lock() {
                state.live -= 1;
            }
        }
    }
}
