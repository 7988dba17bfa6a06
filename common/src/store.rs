use std::collections::HashMap;
use std::sync::Mutex;

use log::{info, warn};

use crate::error::{Error, Result};

/// Reserved keys in the durable store.
pub mod keys {
    pub const WIFI_CREDS: &str = "wifi_creds";
    pub const SCHEDULE: &str = "schedule_cfg";
    pub const OTA_VERSION: &str = "ota_version";
    pub const BLE_PEER_COUNTER: &str = "ble_peer_counter";
    pub const BLE_PEER_WINDOW: &str = "ble_peer_window";
    pub const LAST_SEEN_UTC: &str = "last_seen_utc";
}

/// Maximum key length accepted by the store, including room for the `_bak`
/// suffix in the backing namespace.
pub const MAX_KEY_LEN: usize = 24;

/// Raw key-value medium underneath the store. The backend persists opaque
/// blobs; all framing and integrity checking happens above it.
pub trait StoreBackend: Send {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
    fn set(&mut self, key: &str, value: &[u8]) -> Result<()>;
    /// Makes prior `set` calls durable.
    fn commit(&mut self) -> Result<()>;
}

/// Integrity-checked key→blob persistence with a hot spare.
///
/// Every logical value is materialized as `payload ‖ CRC32(payload)` and kept
/// twice: under the user key and under `<key>_bak`. Writes go spare first,
/// then primary, then commit, so a torn write can corrupt at most one copy.
/// Loads prefer the primary and silently repair it from the spare.
pub struct Store {
    backend: Mutex<Box<dyn StoreBackend>>,
}

impl Store {
    pub fn new(backend: Box<dyn StoreBackend>) -> Self {
        Self {
            backend: Mutex::new(backend),
        }
    }

    pub fn save(&self, key: &str, payload: &[u8]) -> Result<()> {
        let framed = frame(key, payload)?;
        let backup = backup_key(key);

        let mut backend = self.backend.lock().unwrap();
        backend.set(&backup, &framed)?;
        backend.set(key, &framed)?;
        backend.commit()?;
        Ok(())
    }

    pub fn load(&self, key: &str) -> Result<Vec<u8>> {
        validate_key(key)?;
        let backup = backup_key(key);

        let mut backend = self.backend.lock().unwrap();
        let primary = backend.get(key)?;
        if let Some(payload) = primary.as_deref().and_then(unframe) {
            return Ok(payload);
        }

        let Some(payload) = backend.get(&backup)?.as_deref().and_then(unframe) else {
            // Distinguish "never written" from "both copies corrupt".
            return if primary.is_none() {
                Err(Error::NotFound)
            } else {
                Err(Error::Integrity)
            };
        };

        warn!("store: primary copy of '{key}' invalid, repaired from spare");
        let framed = frame(key, &payload)?;
        backend.set(key, &framed)?;
        backend.commit()?;
        Ok(payload)
    }

    pub fn save_u32(&self, key: &str, value: u32) -> Result<()> {
        self.save(key, &value.to_le_bytes())
    }

    pub fn load_u32(&self, key: &str) -> Result<u32> {
        let raw = self.load(key)?;
        let bytes: [u8; 4] = raw
            .as_slice()
            .try_into()
            .map_err(|_| Error::Integrity)?;
        Ok(u32::from_le_bytes(bytes))
    }

    pub fn save_u64(&self, key: &str, value: u64) -> Result<()> {
        self.save(key, &value.to_le_bytes())
    }

    pub fn load_u64(&self, key: &str) -> Result<u64> {
        let raw = self.load(key)?;
        let bytes: [u8; 8] = raw
            .as_slice()
            .try_into()
            .map_err(|_| Error::Integrity)?;
        Ok(u64::from_le_bytes(bytes))
    }

    pub fn load_json<T: serde::de::DeserializeOwned>(&self, key: &str) -> Result<T> {
        let raw = self.load(key)?;
        serde_json::from_slice(&raw).map_err(|_| Error::Integrity)
    }

    /// Loads a JSON-encoded value, falling back to (and persisting) the
    /// default when the key has never been written.
    pub fn load_json_or_default<T>(&self, key: &str) -> Result<T>
    where
        T: serde::de::DeserializeOwned + serde::Serialize + Default,
    {
        match self.load(key) {
            Ok(raw) => {
                serde_json::from_slice(&raw).map_err(|_| Error::Integrity)
            }
            Err(Error::NotFound) => {
                info!("store: no '{key}' present, materializing defaults");
                let value = T::default();
                self.save_json(key, &value)?;
                Ok(value)
            }
            Err(err) => Err(err),
        }
    }

    pub fn save_json<T: serde::Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let raw = serde_json::to_vec(value).map_err(|_| Error::InvalidArgument("json"))?;
        self.save(key, &raw)
    }
}

fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() || key.len() > MAX_KEY_LEN {
        return Err(Error::InvalidArgument("key length"));
    }
    Ok(())
}

/// Maps a logical key onto a backend with a shorter key limit. Keys that fit
/// pass through; longer ones keep a readable prefix plus a CRC32 suffix so
/// `<key>` and `<key>_bak` can never collapse onto the same slot.
pub fn backend_key(key: &str, max_len: usize) -> String {
    if key.len() <= max_len {
        return key.to_string();
    }
    let crc = crc32fast::hash(key.as_bytes());
    let prefix = max_len.saturating_sub(8);
    format!("{}{crc:08x}", &key[..prefix])
}

fn backup_key(key: &str) -> String {
    format!("{key}_bak")
}

fn frame(key: &str, payload: &[u8]) -> Result<Vec<u8>> {
    validate_key(key)?;
    if payload.is_empty() {
        return Err(Error::InvalidArgument("empty payload"));
    }
    let mut framed = Vec::with_capacity(payload.len() + 4);
    framed.extend_from_slice(payload);
    framed.extend_from_slice(&crc32fast::hash(payload).to_le_bytes());
    Ok(framed)
}

fn unframe(framed: &[u8]) -> Option<Vec<u8>> {
    if framed.len() <= 4 {
        return None;
    }
    let (payload, crc_bytes) = framed.split_at(framed.len() - 4);
    let stored = u32::from_le_bytes(crc_bytes.try_into().ok()?);
    if crc32fast::hash(payload) != stored {
        return None;
    }
    Some(payload.to_vec())
}

/// Volatile backend for tests and the host harness.
#[derive(Default)]
pub struct MemoryBackend {
    map: HashMap<String, Vec<u8>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Test hook: flips bits of a stored entry in place.
    pub fn corrupt(&mut self, key: &str) {
        if let Some(value) = self.map.get_mut(key) {
            for byte in value.iter_mut() {
                *byte ^= 0x5a;
            }
        }
    }

    pub fn remove(&mut self, key: &str) {
        self.map.remove(key);
    }

    pub fn snapshot(&self) -> HashMap<String, Vec<u8>> {
        self.map.clone()
    }

    pub fn restore(&mut self, snapshot: HashMap<String, Vec<u8>>) {
        self.map = snapshot;
    }
}

impl StoreBackend for MemoryBackend {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.map.get(key).cloned())
    }

    fn set(&mut self, key: &str, value: &[u8]) -> Result<()> {
        self.map.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn commit(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Shared handle to a backend so tests can reach in and corrupt entries while
/// a `Store` owns the write path.
pub struct SharedBackend<B>(pub std::sync::Arc<Mutex<B>>);

impl<B: StoreBackend> StoreBackend for SharedBackend<B> {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.0.lock().unwrap().get(key)
    }

    fn set(&mut self, key: &str, value: &[u8]) -> Result<()> {
        self.0.lock().unwrap().set(key, value)
    }

    fn commit(&mut self) -> Result<()> {
        self.0.lock().unwrap().commit()
    }
}
