//! On-disk key-value store and per-stage worker state.
//!
//! File layout: an 8-byte magic, a little-endian `u32` format version, then
//! a sequence of entries. Each entry is a `u32` length followed by an
//! independently bincode-encoded `(key, value)` pair, so one damaged entry
//! only loses itself.
//!
//! Saving is debounced: a mutation marks the store dirty and
//! [`KvStore::process_messages`] writes it once [`STORE_SAVE_DELAY_MS`] has
//! passed since the first pump that saw it dirty.

use crate::error::{ControlError, ControlResult};
use facelink_common::consts::STORE_SAVE_DELAY_MS;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const STORE_MAGIC: &[u8; 8] = b"FLSTORE\0";
const STORE_VERSION: u32 = 1;
const HEADER_SIZE: usize = 12;

/// Private key-value record of one stage, persisted between runs.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct WorkerState {
    values: BTreeMap<String, Vec<u8>>,
}

impl WorkerState {
    /// Decode the value under `key`; undecodable values read as absent
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let bytes = self.values.get(key)?;
        match bincode::deserialize(bytes) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(key, error = %e, "Ignoring undecodable worker state value");
                None
            }
        }
    }

    /// Encode and store `value` under `key`
    pub fn set<T: Serialize>(&mut self, key: &str, value: &T) -> ControlResult<()> {
        self.values.insert(key.to_string(), bincode::serialize(value)?);
        Ok(())
    }

    /// Remove `key`. Returns true if it was present.
    pub fn remove(&mut self, key: &str) -> bool {
        self.values.remove(key).is_some()
    }

    /// Number of keys
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// True when nothing is stored
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Debounced persistent key-value store
#[derive(Debug)]
pub struct KvStore {
    path: Option<PathBuf>,
    entries: BTreeMap<String, Vec<u8>>,
    dirty: bool,
    save_due: Option<Instant>,
}

impl KvStore {
    /// Store that never touches disk
    pub fn in_memory() -> Self {
        Self {
            path: None,
            entries: BTreeMap::new(),
            dirty: false,
            save_due: None,
        }
    }

    /// Load the store at `path`. A missing file gives an empty store.
    pub fn open<P: AsRef<Path>>(path: P) -> ControlResult<Self> {
        let path = path.as_ref().to_path_buf();
        let mut store = Self {
            path: Some(path.clone()),
            ..Self::in_memory()
        };

        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("Store file {:?} does not exist, starting empty", path);
                return Ok(store);
            }
            Err(e) => return Err(e.into()),
        };

        store.entries = decode_entries(&bytes).map_err(|reason| ControlError::Store {
            path: path.display().to_string(),
            reason,
        })?;
        info!("Loaded {} store entries from {:?}", store.entries.len(), path);
        Ok(store)
    }

    /// Store file path, if any
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Decode the value under `key`; undecodable values read as absent
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let bytes = self.entries.get(key)?;
        match bincode::deserialize(bytes) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(key, error = %e, "Ignoring undecodable store value");
                None
            }
        }
    }

    /// Encode and store `value` under `key`
    pub fn set<T: Serialize>(&mut self, key: &str, value: &T) -> ControlResult<()> {
        let bytes = bincode::serialize(value)?;
        if self.entries.get(key) != Some(&bytes) {
            self.entries.insert(key.to_string(), bytes);
            self.dirty = true;
        }
        Ok(())
    }

    /// Remove `key`. Returns true if it was present.
    pub fn remove(&mut self, key: &str) -> bool {
        let removed = self.entries.remove(key).is_some();
        self.dirty |= removed;
        removed
    }

    /// True if `key` is present
    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// True when there are unsaved changes
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Drive the debounced save. Returns true when the store was written.
    pub fn process_messages(&mut self, now: Instant) -> ControlResult<bool> {
        if !self.dirty {
            return Ok(false);
        }
        let due = *self
            .save_due
            .get_or_insert(now + Duration::from_millis(STORE_SAVE_DELAY_MS));
        if now < due {
            return Ok(false);
        }
        self.save()?;
        Ok(true)
    }

    /// Write pending changes now
    pub fn finish_pending_jobs(&mut self) -> ControlResult<()> {
        if self.dirty {
            self.save()?;
        }
        Ok(())
    }

    fn save(&mut self) -> ControlResult<()> {
        self.save_due = None;
        let Some(path) = &self.path else {
            self.dirty = false;
            return Ok(());
        };

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let bytes = encode_entries(&self.entries)?;
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, &bytes)?;
        fs::rename(&tmp, path)?;

        self.dirty = false;
        debug!("Saved {} store entries to {:?}", self.entries.len(), path);
        Ok(())
    }
}

fn encode_entries(entries: &BTreeMap<String, Vec<u8>>) -> ControlResult<Vec<u8>> {
    let mut out = Vec::with_capacity(HEADER_SIZE);
    out.extend_from_slice(STORE_MAGIC);
    out.extend_from_slice(&STORE_VERSION.to_le_bytes());
    for entry in entries {
        let blob = bincode::serialize(&entry)?;
        out.extend_from_slice(&(blob.len() as u32).to_le_bytes());
        out.extend_from_slice(&blob);
    }
    Ok(out)
}

/// Decode a store file. Damaged entries are skipped; an unknown header is an error.
fn decode_entries(bytes: &[u8]) -> Result<BTreeMap<String, Vec<u8>>, String> {
    if bytes.len() < HEADER_SIZE || &bytes[..8] != STORE_MAGIC {
        return Err("not a store file".to_string());
    }
    let mut version = [0u8; 4];
    version.copy_from_slice(&bytes[8..HEADER_SIZE]);
    let version = u32::from_le_bytes(version);
    if version != STORE_VERSION {
        return Err(format!("unsupported format version {}", version));
    }

    let mut entries = BTreeMap::new();
    let mut rest = &bytes[HEADER_SIZE..];
    while !rest.is_empty() {
        if rest.len() < 4 {
            warn!("Store file ends with a partial entry header");
            break;
        }
        let mut len = [0u8; 4];
        len.copy_from_slice(&rest[..4]);
        let len = u32::from_le_bytes(len) as usize;
        rest = &rest[4..];
        if len > rest.len() {
            warn!("Store file ends with a truncated entry");
            break;
        }
        let (blob, tail) = rest.split_at(len);
        rest = tail;
        match bincode::deserialize::<(String, Vec<u8>)>(blob) {
            Ok((key, value)) => {
                entries.insert(key, value);
            }
            Err(e) => warn!(error = %e, "Skipping corrupt store entry"),
        }
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_worker_state_typed_values() {
        let mut state = WorkerState::default();
        state.set("fps", &30u32).unwrap();
        state.set("device", &"cpu".to_string()).unwrap();
        assert_eq!(state.get::<u32>("fps"), Some(30));
        assert_eq!(state.get::<String>("device"), Some("cpu".to_string()));
        assert_eq!(state.get::<u32>("missing"), None);
        // u64 needs eight bytes, the stored u32 has four
        assert_eq!(state.get::<u64>("fps"), None);
        assert!(state.remove("fps"));
        assert_eq!(state.len(), 1);
    }

    #[test]
    fn test_save_is_debounced() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("states.dat");
        let mut store = KvStore::open(&path).unwrap();
        store.set("source.enabled", &true).unwrap();

        let t0 = Instant::now();
        assert!(!store.process_messages(t0).unwrap());
        assert!(!store.process_messages(t0 + Duration::from_millis(500)).unwrap());
        assert!(!path.exists());

        assert!(store.process_messages(t0 + Duration::from_millis(STORE_SAVE_DELAY_MS)).unwrap());
        assert!(path.exists());
        assert!(!store.is_dirty());
        assert!(!store.process_messages(t0 + Duration::from_secs(5)).unwrap());
    }

    #[test]
    fn test_unchanged_value_does_not_dirty() {
        let mut store = KvStore::in_memory();
        store.set("k", &1u8).unwrap();
        store.finish_pending_jobs().unwrap();
        store.set("k", &1u8).unwrap();
        assert!(!store.is_dirty());
        assert!(!store.remove("other"));
        assert!(!store.is_dirty());
    }

    #[test]
    fn test_reload_after_flush() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("states.dat");
        let mut store = KvStore::open(&path).unwrap();
        let mut state = WorkerState::default();
        state.set("threshold", &0.5f64).unwrap();
        store.set("detector.worker_state", &state).unwrap();
        store.set("detector.enabled", &true).unwrap();
        store.finish_pending_jobs().unwrap();

        let reloaded = KvStore::open(&path).unwrap();
        assert_eq!(reloaded.get::<WorkerState>("detector.worker_state"), Some(state));
        assert_eq!(reloaded.get::<bool>("detector.enabled"), Some(true));
    }

    #[test]
    fn test_corrupt_entry_is_skipped() {
        let mut entries = BTreeMap::new();
        entries.insert("a".to_string(), vec![1u8]);
        entries.insert("b".to_string(), vec![2u8]);
        let mut bytes = encode_entries(&entries).unwrap();

        // First entry: declare a tiny length so its blob cannot decode,
        // then keep the remaining bytes framed as a separate garbage entry.
        let first_len = u32::from_le_bytes(bytes[12..16].try_into().unwrap()) as usize;
        let mut damaged = bytes[..12].to_vec();
        damaged.extend_from_slice(&2u32.to_le_bytes());
        damaged.extend_from_slice(&[0xFF, 0xFF]);
        damaged.extend_from_slice(&bytes[16 + first_len..]);
        bytes = damaged;

        let decoded = decode_entries(&bytes).unwrap();
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded.get("b"), Some(&vec![2u8]));
    }

    #[test]
    fn test_truncated_tail_keeps_earlier_entries() {
        let mut entries = BTreeMap::new();
        entries.insert("a".to_string(), vec![1u8, 2, 3]);
        let mut bytes = encode_entries(&entries).unwrap();
        bytes.extend_from_slice(&100u32.to_le_bytes());
        bytes.extend_from_slice(&[0u8; 10]);

        let decoded = decode_entries(&bytes).unwrap();
        assert_eq!(decoded.get("a"), Some(&vec![1u8, 2, 3]));
    }

    #[test]
    fn test_foreign_file_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("states.dat");
        fs::write(&path, b"not a store at all").unwrap();
        assert!(matches!(KvStore::open(&path), Err(ControlError::Store { .. })));
    }
}
