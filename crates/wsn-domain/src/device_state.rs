use crate::error::{DomainError, DomainResult};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Last payload digest, used for dedup.
pub const KEY_DATA: &str = "data";
/// Unix time of the last RSSI poll.
pub const KEY_RSSI_TST: &str = "rssi_tst";
/// Unix time of the last time sync.
pub const KEY_CMD_TIME: &str = "cmd_time";
pub const KEY_SERIAL: &str = "serial";
pub const KEY_NAME: &str = "name";

/// Fields stored for one device. Unknown keys are kept as they are.
pub type DeviceRecord = Map<String, Value>;

/// Whole store content, keyed by integer device address.
pub type StateMap = BTreeMap<u64, DeviceRecord>;

/// Durable backend of a [`DeviceStateStore`].
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
pub trait StateStorage: Send + Sync {
    /// `None` when nothing has been saved yet.
    fn load(&self) -> DomainResult<Option<StateMap>>;

    fn save(&self, state: &StateMap) -> DomainResult<()>;
}

/// Per-device records kept across restarts.
///
/// Writes go through [`DeviceStateStore::set`], which only persists when the merged
/// content differs from what is already stored. There must be a single writer per
/// backing file.
pub struct DeviceStateStore {
    storage: Box<dyn StateStorage>,
    state: StateMap,
}

impl DeviceStateStore {
    pub fn open(storage: Box<dyn StateStorage>) -> DomainResult<Self> {
        let state = storage.load()?.unwrap_or_default();
        debug!(devices = state.len(), "Loaded device state");
        Ok(Self { storage, state })
    }

    pub fn get(&self, address: u64, key: &str) -> Option<&Value> {
        self.state.get(&address).and_then(|record| record.get(key))
    }

    /// Integer view of a field. Fractional timestamps are truncated.
    pub fn get_i64(&self, address: u64, key: &str) -> Option<i64> {
        let value = self.get(address, key)?;
        value.as_i64().or_else(|| value.as_f64().map(|v| v as i64))
    }

    pub fn get_str(&self, address: u64, key: &str) -> Option<&str> {
        self.get(address, key).and_then(Value::as_str)
    }

    pub fn record(&self, address: u64) -> Option<&DeviceRecord> {
        self.state.get(&address)
    }

    pub fn len(&self) -> usize {
        self.state.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.is_empty()
    }

    /// Merge `fields` into the record for `address` and persist if anything changed.
    ///
    /// Returns whether a write happened.
    pub fn set<I, K>(&mut self, address: u64, fields: I) -> DomainResult<bool>
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
    {
        let current = self.state.get(&address);
        let mut merged = current.cloned().unwrap_or_default();
        for (key, value) in fields {
            merge_value(merged.entry(key.into()).or_insert(Value::Null), value);
        }

        if current == Some(&merged) {
            return Ok(false);
        }

        let previous = self.state.insert(address, merged);
        if let Err(e) = self.storage.save(&self.state) {
            match previous {
                Some(record) => self.state.insert(address, record),
                None => self.state.remove(&address),
            };
            return Err(e);
        }

        debug!(address, "Device state saved");
        Ok(true)
    }
}

/// Objects merge key by key at every depth; anything else replaces the target.
fn merge_value(target: &mut Value, value: Value) {
    match (target, value) {
        (Value::Object(target), Value::Object(fields)) => {
            for (key, value) in fields {
                merge_value(target.entry(key).or_insert(Value::Null), value);
            }
        }
        (target, value) => *target = value,
    }
}

/// Stores the state as one pretty-printed JSON object whose keys are the decimal
/// form of the device addresses.
#[derive(Debug, Clone)]
pub struct JsonFileStorage {
    path: PathBuf,
}

impl JsonFileStorage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn storage_error(path: &Path, err: impl std::fmt::Display) -> DomainError {
    DomainError::Storage(format!("{}: {}", path.display(), err))
}

impl StateStorage for JsonFileStorage {
    fn load(&self) -> DomainResult<Option<StateMap>> {
        let text = match std::fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                info!(path = %self.path.display(), "No device state file, starting empty");
                return Ok(None);
            }
            Err(e) => return Err(storage_error(&self.path, e)),
        };

        let raw: BTreeMap<String, DeviceRecord> =
            serde_json::from_str(&text).map_err(|e| storage_error(&self.path, e))?;

        raw.into_iter()
            .map(|(key, record)| {
                key.parse::<u64>()
                    .map(|address| (address, record))
                    .map_err(|_| storage_error(&self.path, format!("invalid address key '{key}'")))
            })
            .collect::<DomainResult<StateMap>>()
            .map(Some)
    }

    fn save(&self, state: &StateMap) -> DomainResult<()> {
        let raw: BTreeMap<String, &DeviceRecord> = state
            .iter()
            .map(|(address, record)| (address.to_string(), record))
            .collect();
        let text = serde_json::to_string_pretty(&raw).map_err(|e| storage_error(&self.path, e))?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| storage_error(parent, e))?;
        }

        // Write next to the target and rename so a crash never leaves half a file.
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, text).map_err(|e| storage_error(&tmp, e))?;
        std::fs::rename(&tmp, &self.path).map_err(|e| storage_error(&self.path, e))?;
        Ok(())
    }
}

/// Volatile backend, for stages that run without a state directory and for tests.
#[derive(Debug, Default)]
pub struct MemoryStorage;

impl StateStorage for MemoryStorage {
    fn load(&self) -> DomainResult<Option<StateMap>> {
        Ok(None)
    }

    fn save(&self, _state: &StateMap) -> DomainResult<()> {
        Ok(())
    }
}
