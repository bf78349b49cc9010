//! Per-bulb session state: network key and anti-replay counter
//!
//! The counter is persisted before every transmission, so a crash between
//! persisting and sending only ever skips a value, never repeats one.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use ilumi_proto::{Header, MacAddress, NetworkKey, Opcode};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::StoreError;

pub const SESSIONS_FILE: &str = "sessions.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionState {
    pub network_key: NetworkKey,
    /// Next counter value to put on the wire
    pub sequence: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_ack_opcode: Option<Opcode>,
}

impl SessionState {
    pub fn new(network_key: NetworkKey) -> Self {
        Self { network_key, sequence: 0, last_ack_opcode: None }
    }
}

/// Durable per-device storage for [`SessionState`]
///
/// `save` must not return before the state is durable.
pub trait SessionStore: Send + Sync {
    fn load(&self, address: &MacAddress) -> Result<Option<SessionState>, StoreError>;
    fn save(&self, address: &MacAddress, state: &SessionState) -> Result<(), StoreError>;
}

/// Volatile store, for tests and dry runs
#[derive(Debug, Default)]
pub struct MemoryStore {
    sessions: Mutex<BTreeMap<MacAddress, SessionState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionStore for MemoryStore {
    fn load(&self, address: &MacAddress) -> Result<Option<SessionState>, StoreError> {
        let sessions = self.sessions.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(sessions.get(address).cloned())
    }

    fn save(&self, address: &MacAddress, state: &SessionState) -> Result<(), StoreError> {
        let mut sessions = self.sessions.lock().map_err(|_| StoreError::Poisoned)?;
        sessions.insert(*address, state.clone());
        Ok(())
    }
}

/// All sessions in one JSON file, rewritten atomically on every save
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    sessions: Mutex<BTreeMap<MacAddress, SessionState>>,
}

impl JsonFileStore {
    /// Open the store at `path`, starting empty if the file does not exist
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let sessions = match fs::read_to_string(&path) {
            Ok(data) => serde_json::from_str(&data)
                .map_err(|source| StoreError::Parse { path: path.clone(), source })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(source) => return Err(StoreError::Io { path, source }),
        };
        Ok(Self { path, sessions: Mutex::new(sessions) })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self, sessions: &BTreeMap<MacAddress, SessionState>) -> Result<(), StoreError> {
        let io = |source| StoreError::Io { path: self.path.clone(), source };
        let data = serde_json::to_vec_pretty(sessions).map_err(StoreError::Serialize)?;

        let tmp = self.path.with_extension("json.tmp");
        let mut file = fs::File::create(&tmp).map_err(io)?;
        file.write_all(&data).map_err(io)?;
        file.sync_all().map_err(io)?;
        fs::rename(&tmp, &self.path).map_err(io)?;
        Ok(())
    }
}

impl SessionStore for JsonFileStore {
    fn load(&self, address: &MacAddress) -> Result<Option<SessionState>, StoreError> {
        let sessions = self.sessions.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(sessions.get(address).cloned())
    }

    fn save(&self, address: &MacAddress, state: &SessionState) -> Result<(), StoreError> {
        let mut sessions = self.sessions.lock().map_err(|_| StoreError::Poisoned)?;
        let previous = sessions.insert(*address, state.clone());
        if let Err(e) = self.persist(&sessions) {
            // keep memory in line with what is on disk
            match previous {
                Some(previous) => sessions.insert(*address, previous),
                None => sessions.remove(address),
            };
            return Err(e);
        }
        Ok(())
    }
}

/// Session bookkeeping on top of a [`SessionStore`]
#[derive(Clone)]
pub struct Sessions {
    store: Arc<dyn SessionStore>,
    default_key: NetworkKey,
    /// Serializes read-increment-write cycles
    guard: Arc<Mutex<()>>,
}

impl Sessions {
    /// `default_key` seeds bulbs that have no stored session yet
    pub fn new(store: Arc<dyn SessionStore>, default_key: NetworkKey) -> Self {
        Self { store, default_key, guard: Arc::new(Mutex::new(())) }
    }

    pub fn in_memory(default_key: NetworkKey) -> Self {
        Self::new(Arc::new(MemoryStore::new()), default_key)
    }

    pub fn state(&self, address: &MacAddress) -> Result<SessionState, StoreError> {
        Ok(self.store.load(address)?.unwrap_or_else(|| SessionState::new(self.default_key)))
    }

    fn update<T>(
        &self,
        address: &MacAddress,
        f: impl FnOnce(&mut SessionState) -> T,
    ) -> Result<T, StoreError> {
        let _guard = self.guard.lock().map_err(|_| StoreError::Poisoned)?;
        let mut state = self.state(address)?;
        let out = f(&mut state);
        self.store.save(address, &state)?;
        Ok(out)
    }

    /// Reserve the next counter value and persist the increment.
    pub fn next_sequence(&self, address: &MacAddress) -> Result<u64, StoreError> {
        self.next_header(address).map(|(_, counter)| counter)
    }

    /// Like [`Sessions::next_sequence`], also returning the header to send with it
    pub fn next_header(&self, address: &MacAddress) -> Result<(Header, u64), StoreError> {
        let (key, counter) = self.update(address, |state| {
            let counter = state.sequence;
            state.sequence += 1;
            (state.network_key, counter)
        })?;
        debug!(%address, counter, "reserved sequence");
        Ok((Header::new(key, counter), counter))
    }

    /// Reserve one counter for a packet that `first` and every bulb in
    /// `others` will see, such as a relayed broadcast.
    ///
    /// The value is at least every listed bulb's next counter, and every
    /// bulb's counter moves past it before this returns. The header carries
    /// `first`'s key.
    pub fn next_shared_header(
        &self,
        first: &MacAddress,
        others: &[MacAddress],
    ) -> Result<(Header, u64), StoreError> {
        let _guard = self.guard.lock().map_err(|_| StoreError::Poisoned)?;
        let addresses: Vec<&MacAddress> = std::iter::once(first).chain(others).collect();

        let mut states = Vec::with_capacity(addresses.len());
        for address in &addresses {
            states.push(self.state(address)?);
        }
        let counter = states.iter().map(|s| s.sequence).max().unwrap_or_default();
        let key = states[0].network_key;

        for (address, mut state) in addresses.iter().zip(states) {
            state.sequence = counter + 1;
            self.store.save(address, &state)?;
        }
        debug!(address = %first, devices = addresses.len(), counter, "reserved shared sequence");
        Ok((Header::new(key, counter), counter))
    }

    /// Install a new network key after re-enrollment; the counter restarts.
    pub fn rotate_key(
        &self,
        address: &MacAddress,
        network_key: NetworkKey,
    ) -> Result<(), StoreError> {
        self.update(address, |state| *state = SessionState::new(network_key))
    }

    pub fn record_ack(&self, address: &MacAddress, opcode: Opcode) -> Result<(), StoreError> {
        self.update(address, |state| state.last_ack_opcode = Some(opcode))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ilumi_proto::wire_sequence;

    fn addr(last: u8) -> MacAddress {
        MacAddress([0xAA, 0, 0, 0, 0, last])
    }

    #[test]
    fn sequence_increases_per_device() {
        let sessions = Sessions::in_memory(NetworkKey(7));
        let a = addr(1);
        let b = addr(2);

        assert_eq!(sessions.next_sequence(&a).unwrap(), 0);
        assert_eq!(sessions.next_sequence(&a).unwrap(), 1);
        assert_eq!(sessions.next_sequence(&b).unwrap(), 0);
        assert_eq!(sessions.next_sequence(&a).unwrap(), 2);
        assert_eq!(sessions.next_sequence(&b).unwrap(), 1);
        assert_eq!(sessions.state(&a).unwrap().sequence, 3);
    }

    #[test]
    fn header_carries_key_and_wire_sequence() {
        let sessions = Sessions::in_memory(NetworkKey(0xDEAD_BEEF));
        let a = addr(1);
        for _ in 0..130 {
            sessions.next_sequence(&a).unwrap();
        }
        let (header, counter) = sessions.next_header(&a).unwrap();
        assert_eq!(counter, 130);
        assert_eq!(header.network_key, NetworkKey(0xDEAD_BEEF));
        assert_eq!(header.sequence, wire_sequence(130));
    }

    #[test]
    fn rotate_key_resets_counter() {
        let sessions = Sessions::in_memory(NetworkKey(1));
        let a = addr(1);
        sessions.next_sequence(&a).unwrap();
        sessions.record_ack(&a, Opcode::TurnOn).unwrap();

        sessions.rotate_key(&a, NetworkKey(2)).unwrap();
        let state = sessions.state(&a).unwrap();
        assert_eq!(state, SessionState::new(NetworkKey(2)));
        assert_eq!(sessions.next_header(&a).unwrap().0.network_key, NetworkKey(2));
    }

    #[test]
    fn shared_counter_clears_every_device() {
        let sessions = Sessions::in_memory(NetworkKey(9));
        let (proxy, behind, fresh) = (addr(1), addr(2), addr(3));
        for _ in 0..5 {
            sessions.next_sequence(&behind).unwrap();
        }
        sessions.next_sequence(&proxy).unwrap();

        let (header, counter) =
            sessions.next_shared_header(&proxy, &[proxy, behind, fresh]).unwrap();
        assert_eq!(counter, 5);
        assert_eq!(header.sequence, wire_sequence(5));
        for address in [proxy, behind, fresh] {
            assert_eq!(sessions.next_sequence(&address).unwrap(), 6, "{address}");
        }
    }

    #[test]
    fn file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(SESSIONS_FILE);
        let a = addr(1);

        {
            let store = JsonFileStore::open(&path).unwrap();
            let sessions = Sessions::new(Arc::new(store), NetworkKey(5));
            for expected in 0..4 {
                assert_eq!(sessions.next_sequence(&a).unwrap(), expected);
            }
            sessions.record_ack(&a, Opcode::SetColorAcked).unwrap();
        }

        let sessions = Sessions::new(Arc::new(JsonFileStore::open(&path).unwrap()), NetworkKey(5));
        assert_eq!(sessions.next_sequence(&a).unwrap(), 4);
        assert_eq!(sessions.state(&a).unwrap().last_ack_opcode, Some(Opcode::SetColorAcked));

        let raw: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(raw["AA:00:00:00:00:01"]["sequence"], 5);
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn unwritable_store_fails_the_reservation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing").join(SESSIONS_FILE);
        let sessions = Sessions::new(Arc::new(JsonFileStore::open(&path).unwrap()), NetworkKey(5));
        let a = addr(1);

        assert!(matches!(sessions.next_sequence(&a), Err(StoreError::Io { .. })));
        // nothing was reserved, so nothing was skipped either
        assert_eq!(sessions.state(&a).unwrap().sequence, 0);
    }

    #[test]
    fn corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(SESSIONS_FILE);
        fs::write(&path, "{ not json").unwrap();
        assert!(matches!(JsonFileStore::open(&path), Err(StoreError::Parse { .. })));
    }
}
