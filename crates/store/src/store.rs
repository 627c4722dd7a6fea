use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use claimsrv_claims::peek_envelope;
use path_clean::PathClean;
use tracing::warn;

use crate::hash::{sha256_of, StoreHash};
use crate::pack;
use crate::watcher::DirectoryWatcher;
use crate::StoreError;

pub type Result<T> = std::result::Result<T, StoreError>;

/// Where a store persists its entries.
#[derive(Debug, Clone)]
pub enum Backend {
    Memory,
    Directory { root: PathBuf, sharded: bool },
}

/// Sweep interval and capacity for an `ExpiringDirectory` store. Constructing
/// a store without this makes it a plain `Directory`/`InMemory` store with no
/// eviction.
#[derive(Debug, Clone, Copy)]
pub struct ExpiryPolicy {
    pub sweep_interval: Duration,
    pub max_entries: usize,
}

struct State {
    hash: StoreHash,
    memory: HashMap<String, String>,
    entry_hash: HashMap<String, [u8; 32]>,
    /// key -> expires (0 means never); tracked for every entry once an
    /// `ExpiryPolicy` is configured, so LRU touches work uniformly.
    expirations: HashMap<String, u64>,
    /// Lazily-deleted min-heap of (expires, seq, key); an entry is stale if
    /// `expirations[key] != expires` or `lru` no longer contains `key` at
    /// that seq. Only populated for entries with `expires > 0`.
    heap: BinaryHeap<Reverse<(u64, u64, String)>>,
    lru: VecDeque<String>,
    seq: u64,
}

impl State {
    fn new() -> Self {
        State {
            hash: StoreHash::zero(),
            memory: HashMap::new(),
            entry_hash: HashMap::new(),
            expirations: HashMap::new(),
            heap: BinaryHeap::new(),
            lru: VecDeque::new(),
            seq: 0,
        }
    }
}

/// Durable mapping of key to encoded claim, with a content-hash
/// accumulator, optional expiration/LRU eviction, and pack-based sync.
///
/// All mutation paths — save, saveIfNewer, sweep, LRU eviction — acquire a
/// single lock covering the on-disk file set, the hash accumulator, and the
/// expiration index as one compound invariant.
pub struct Store {
    backend: Backend,
    read_only: bool,
    expiry: Option<ExpiryPolicy>,
    state: Mutex<State>,
    watcher: Mutex<Option<DirectoryWatcher>>,
}

impl Store {
    #[must_use]
    pub fn open_in_memory(read_only: bool) -> Self {
        Store {
            backend: Backend::Memory,
            read_only,
            expiry: None,
            state: Mutex::new(State::new()),
            watcher: Mutex::new(None),
        }
    }

    pub fn open_directory(root: impl Into<PathBuf>, sharded: bool, read_only: bool) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        let mut state = State::new();
        scan_directory(&root, sharded, &mut state, None)?;
        Ok(Store {
            backend: Backend::Directory { root, sharded },
            read_only,
            expiry: None,
            state: Mutex::new(state),
            watcher: Mutex::new(None),
        })
    }

    pub fn open_expiring_directory(
        root: impl Into<PathBuf>,
        sharded: bool,
        read_only: bool,
        policy: ExpiryPolicy,
    ) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        let mut state = State::new();
        scan_directory(&root, sharded, &mut state, Some(policy))?;
        Ok(Store {
            backend: Backend::Directory { root, sharded },
            read_only,
            expiry: Some(policy),
            state: Mutex::new(state),
            watcher: Mutex::new(None),
        })
    }

    #[must_use]
    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    #[must_use]
    pub fn hash(&self) -> [u8; 32] {
        self.state.lock().expect("store lock poisoned").hash.bytes()
    }

    pub fn load(&self, key: &str) -> Result<String> {
        match &self.backend {
            Backend::Memory => {
                let state = self.state.lock().expect("store lock poisoned");
                state.memory.get(key).cloned().ok_or(StoreError::NotFound)
            }
            Backend::Directory { .. } => {
                let path = self.path_for(key)?;
                std::fs::read_to_string(path).map_err(|err| {
                    if err.kind() == std::io::ErrorKind::NotFound {
                        StoreError::NotFound
                    } else {
                        StoreError::Io(err)
                    }
                })
            }
        }
    }

    /// Writes `key -> encoded`, unconditionally overwriting any existing
    /// value. Rejects read-only stores and keys shorter than two characters.
    pub fn save(&self, key: &str, encoded: &str) -> Result<()> {
        if self.read_only {
            return Err(StoreError::ReadOnly);
        }
        validate_key(key)?;
        let mut state = self.state.lock().expect("store lock poisoned");
        self.write_locked(&mut state, key, encoded)
    }

    /// Loads any existing value for `key`; writes `encoded` only if it has
    /// no existing entry or a strictly newer `issuedAt`. Bypasses the
    /// read-only gate, since replicas must still absorb reconciliation and
    /// notifier traffic while rejecting direct writes.
    pub fn save_if_newer(&self, key: &str, encoded: &str) -> Result<()> {
        validate_key(key)?;
        let new_envelope = claimsrv_claims::peek_envelope(encoded)
            .map_err(|err| StoreError::Format(err.to_string()))?;

        let existing = self.load(key);
        let should_write = match existing {
            Err(StoreError::NotFound) => true,
            Err(err) => return Err(err),
            Ok(existing_encoded) => {
                let existing_envelope = claimsrv_claims::peek_envelope(&existing_encoded)
                    .map_err(|err| StoreError::Format(err.to_string()))?;
                new_envelope.issued_at > existing_envelope.issued_at
            }
        };

        if !should_write {
            return Ok(());
        }
        let mut state = self.state.lock().expect("store lock poisoned");
        self.write_locked(&mut state, key, encoded)
    }

    /// Serializes up to `max` entries (unlimited if `max < 0`) in the pack
    /// format. Which entries are included when truncating is unspecified.
    #[must_use]
    pub fn pack(&self, max: i64) -> String {
        let state = self.state.lock().expect("store lock poisoned");
        let entries = self.snapshot(&state);
        pack::encode(&entries, max)
    }

    /// Parses `body` as a pack and `saveIfNewer`s every entry. Aborts with
    /// `Format` on the first malformed line, leaving entries processed so
    /// far applied (merge is not transactional across lines).
    pub fn merge(&self, body: &str) -> Result<()> {
        let entries = pack::decode(body)?;
        for entry in entries {
            if let Err(err) = self.save_if_newer(&entry.key, &entry.encoded) {
                warn!(key = %entry.key, %err, "skipping pack entry");
            }
        }
        Ok(())
    }

    /// Attaches a directory watcher; `on_change` is invoked with the key
    /// derived from each created/modified `.jwt` file. No-op for an
    /// in-memory store.
    pub fn watch(&self, on_change: Arc<dyn Fn(String) + Send + Sync>) -> Result<()> {
        let Backend::Directory { root, .. } = &self.backend else {
            return Ok(());
        };
        let watcher = DirectoryWatcher::spawn(root, on_change)
            .map_err(|err| StoreError::Io(std::io::Error::other(err)))?;
        *self.watcher.lock().expect("watcher lock poisoned") = Some(watcher);
        Ok(())
    }

    /// Removes every entry whose expiry has passed. Returns the number of
    /// entries removed. Intended to be called on `expiry.sweep_interval` by
    /// the caller's own ticker; a no-op when no `ExpiryPolicy` is set.
    pub fn sweep_expired(&self) -> usize {
        if self.expiry.is_none() {
            return 0;
        }
        let now = since_the_epoch();
        let mut removed = 0;
        let mut state = self.state.lock().expect("store lock poisoned");
        loop {
            let Some(Reverse((expires, seq, key))) = state.heap.peek().cloned() else {
                break;
            };
            let current = state.expirations.get(&key).copied();
            if current != Some(expires) || !state.lru.contains(&key) {
                // Stale heap entry from a touch/overwrite; discard.
                state.heap.pop();
                continue;
            }
            if expires == 0 || expires >= now {
                break;
            }
            state.heap.pop();
            if self.remove_locked(&mut state, &key).is_ok() {
                removed += 1;
            } else {
                // Retry on the next sweep.
                state.heap.push(Reverse((expires, seq, key)));
                break;
            }
        }
        removed
    }

    /// Stops the directory watcher, if any. Safe to call multiple times.
    pub fn close(&self) {
        if let Some(mut watcher) = self.watcher.lock().expect("watcher lock poisoned").take() {
            watcher.stop();
        }
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        let Backend::Directory { root, sharded } = &self.backend else {
            return Err(StoreError::InvalidKey(
                "in-memory store has no path".to_string(),
            ));
        };
        validate_key(key)?;
        let file_name = format!("{key}.jwt");
        let path = if *sharded {
            root.join(shard_for(key)).join(file_name)
        } else {
            root.join(file_name)
        };
        let cleaned = path.clean();
        if !cleaned.starts_with(root.clean()) {
            return Err(StoreError::InvalidKey(format!(
                "key escapes store root: {key:?}"
            )));
        }
        Ok(cleaned)
    }

    fn write_locked(&self, state: &mut State, key: &str, encoded: &str) -> Result<()> {
        let envelope = claimsrv_claims::peek_envelope(encoded)
            .map_err(|err| StoreError::Format(err.to_string()))?;
        let is_new = !state.entry_hash.contains_key(key);

        if let Some(policy) = self.expiry {
            if is_new && state.lru.len() >= policy.max_entries {
                if let Some(evicted) = state.lru.pop_front() {
                    self.remove_locked(state, &evicted)?;
                }
            }
        }

        if let Some(old_hash) = state.entry_hash.get(key).copied() {
            state.hash.toggle_digest(&old_hash);
        }

        match &self.backend {
            Backend::Memory => {
                state.memory.insert(key.to_string(), encoded.to_string());
            }
            Backend::Directory { .. } => {
                let path = self.path_for(key)?;
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::write(&path, encoded.as_bytes())?;
            }
        }

        let new_hash = sha256_of(encoded.as_bytes());
        state.hash.toggle_digest(&new_hash);
        state.entry_hash.insert(key.to_string(), new_hash);

        if self.expiry.is_some() {
            state.expirations.insert(key.to_string(), envelope.expires.unwrap_or(0));
            if let Some(pos) = state.lru.iter().position(|k| k == key) {
                state.lru.remove(pos);
            }
            state.lru.push_back(key.to_string());
            if let Some(expires) = envelope.expires.filter(|e| *e > 0) {
                state.seq += 1;
                state.heap.push(Reverse((expires, state.seq, key.to_string())));
            }
        }

        Ok(())
    }

    fn remove_locked(&self, state: &mut State, key: &str) -> Result<()> {
        if let Some(old_hash) = state.entry_hash.remove(key) {
            state.hash.toggle_digest(&old_hash);
        }
        match &self.backend {
            Backend::Memory => {
                state.memory.remove(key);
            }
            Backend::Directory { .. } => {
                let path = self.path_for(key)?;
                match std::fs::remove_file(path) {
                    Ok(()) => {}
                    Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                    Err(err) => return Err(StoreError::Io(err)),
                }
            }
        }
        state.expirations.remove(key);
        if let Some(pos) = state.lru.iter().position(|k| k == key) {
            state.lru.remove(pos);
        }
        Ok(())
    }

    fn snapshot(&self, state: &State) -> Vec<(String, String)> {
        match &self.backend {
            Backend::Memory => state
                .memory
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            Backend::Directory { .. } => state
                .entry_hash
                .keys()
                .filter_map(|key| self.load(key).ok().map(|encoded| (key.clone(), encoded)))
                .collect(),
        }
    }
}

fn validate_key(key: &str) -> Result<()> {
    if key.len() < 2 {
        return Err(StoreError::InvalidKey(
            "key must be at least 2 characters".to_string(),
        ));
    }
    if key.contains('/') || key.contains('\\') || key == ".." {
        return Err(StoreError::InvalidKey(format!(
            "key must not contain path separators: {key:?}"
        )));
    }
    Ok(())
}

fn shard_for(key: &str) -> String {
    let len = key.len();
    key[len.saturating_sub(2)..].to_string()
}

fn scan_directory(
    root: &Path,
    sharded: bool,
    state: &mut State,
    expiry: Option<ExpiryPolicy>,
) -> Result<()> {
    let dirs_to_scan: Vec<PathBuf> = if sharded {
        let mut dirs = vec![root.to_path_buf()];
        for entry in std::fs::read_dir(root)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                dirs.push(entry.path());
            }
        }
        dirs
    } else {
        vec![root.to_path_buf()]
    };

    for dir in dirs_to_scan {
        let read_dir = match std::fs::read_dir(&dir) {
            Ok(rd) => rd,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
            Err(err) => return Err(err.into()),
        };
        for entry in read_dir {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let file_name = entry.file_name();
            let Some(name) = file_name.to_str() else {
                continue;
            };
            let Some(key) = name.strip_suffix(".jwt") else {
                continue;
            };
            let content = std::fs::read_to_string(entry.path())?;
            let digest = sha256_of(content.as_bytes());
            state.hash.toggle_digest(&digest);
            state.entry_hash.insert(key.to_string(), digest);

            if expiry.is_some() {
                let expires = peek_envelope(&content).map(|e| e.expires.unwrap_or(0)).unwrap_or(0);
                state.expirations.insert(key.to_string(), expires);
                state.lru.push_back(key.to_string());
                if expires > 0 {
                    state.seq += 1;
                    state.heap.push(Reverse((expires, state.seq, key.to_string())));
                }
            }
        }
    }
    Ok(())
}

fn since_the_epoch() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock is before the unix epoch")
        .as_secs()
}

#[cfg(test)]
mod test {
    use super::*;
    use claimsrv_claims::{Account, Claims};
    use nkeys::KeyPair;

    fn claim_expiring_in(secs_from_now: i64) -> String {
        let operator = KeyPair::new_operator();
        let account = KeyPair::new_account();
        let mut claims = Claims::<Account>::new(account.public_key(), operator.public_key());
        if secs_from_now >= 0 {
            let expires = since_the_epoch() + secs_from_now as u64;
            claims = claims.expires_at(expires);
        }
        claims.encode(&operator).unwrap()
    }

    fn claim() -> String {
        claim_expiring_in(-1)
    }

    #[test]
    fn in_memory_round_trips_save_and_load() {
        let store = Store::open_in_memory(false);
        let encoded = claim();
        store.save("ACCTKEY01", &encoded).unwrap();
        assert_eq!(store.load("ACCTKEY01").unwrap(), encoded);
    }

    #[test]
    fn directory_round_trips_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open_directory(dir.path(), false, false).unwrap();
        let encoded = claim();
        store.save("ACCTKEY01", &encoded).unwrap();
        assert_eq!(store.load("ACCTKEY01").unwrap(), encoded);
        assert!(dir.path().join("ACCTKEY01.jwt").exists());
    }

    #[test]
    fn sharded_directory_nests_by_key_suffix() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open_directory(dir.path(), true, false).unwrap();
        let encoded = claim();
        store.save("ACCTKEY01", &encoded).unwrap();
        assert!(dir.path().join("01").join("ACCTKEY01.jwt").exists());
    }

    #[test]
    fn read_only_store_rejects_save_but_accepts_save_if_newer() {
        let store = Store::open_in_memory(true);
        assert!(matches!(
            store.save("ACCTKEY01", &claim()),
            Err(StoreError::ReadOnly)
        ));
        store.save_if_newer("ACCTKEY01", &claim()).unwrap();
        assert!(store.load("ACCTKEY01").is_ok());
    }

    #[test]
    fn save_if_newer_keeps_the_later_issued_at() {
        let store = Store::open_in_memory(false);
        let older = claim();
        std::thread::sleep(Duration::from_millis(1100));
        let newer = claim();

        store.save_if_newer("ACCTKEY01", &newer).unwrap();
        store.save_if_newer("ACCTKEY01", &older).unwrap();
        assert_eq!(store.load("ACCTKEY01").unwrap(), newer);
    }

    #[test]
    fn short_keys_are_rejected() {
        let store = Store::open_in_memory(false);
        assert!(matches!(
            store.save("a", &claim()),
            Err(StoreError::InvalidKey(_))
        ));
    }

    #[test]
    fn keys_with_path_separators_are_rejected() {
        let store = Store::open_in_memory(false);
        assert!(matches!(
            store.save("../escape", &claim()),
            Err(StoreError::InvalidKey(_))
        ));
    }

    #[test]
    fn hash_is_self_inverse_across_save_and_remove() {
        let store = Store::open_in_memory(false);
        let zero = store.hash();
        store.save("ACCTKEY01", &claim()).unwrap();
        assert_ne!(store.hash(), zero);

        let mut state = store.state.lock().unwrap();
        store.remove_locked(&mut state, "ACCTKEY01").unwrap();
        drop(state);
        assert_eq!(store.hash(), zero);
    }

    #[test]
    fn hash_matches_regardless_of_save_order() {
        let a = Store::open_in_memory(false);
        a.save("ACCTKEY01", &claim_expiring_in(100)).unwrap();
        a.save("ACCTKEY02", &claim_expiring_in(200)).unwrap();

        let b = Store::open_in_memory(false);
        // Reuse the exact same encoded values so the digests line up.
        let x = claim_expiring_in(100);
        let y = claim_expiring_in(200);
        b.save("ACCTKEY02", &y).unwrap();
        b.save("ACCTKEY01", &x).unwrap();

        let c = Store::open_in_memory(false);
        c.save("ACCTKEY01", &x).unwrap();
        c.save("ACCTKEY02", &y).unwrap();
        assert_eq!(c.hash(), b.hash());
    }

    #[test]
    fn pack_and_merge_round_trip() {
        let source = Store::open_in_memory(false);
        source.save("ACCTKEY01", &claim()).unwrap();
        source.save("ACCTKEY02", &claim()).unwrap();
        let packed = source.pack(-1);

        let dest = Store::open_in_memory(false);
        dest.merge(&packed).unwrap();
        assert!(dest.load("ACCTKEY01").is_ok());
        assert!(dest.load("ACCTKEY02").is_ok());
    }

    #[test]
    fn merge_rejects_malformed_lines() {
        let store = Store::open_in_memory(false);
        assert!(matches!(
            store.merge("no-pipe-here"),
            Err(StoreError::Format(_))
        ));
    }

    #[test]
    fn lru_evicts_oldest_key_once_over_capacity() {
        let policy = ExpiryPolicy {
            sweep_interval: Duration::from_secs(60),
            max_entries: 2,
        };
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open_expiring_directory(dir.path(), false, false, policy).unwrap();

        store.save("KEYAAAAA1", &claim()).unwrap();
        store.save("KEYBBBBB2", &claim()).unwrap();
        store.save("KEYCCCCC3", &claim()).unwrap();

        assert!(matches!(store.load("KEYAAAAA1"), Err(StoreError::NotFound)));
        assert!(store.load("KEYBBBBB2").is_ok());
        assert!(store.load("KEYCCCCC3").is_ok());
    }

    #[test]
    fn sweep_expired_removes_past_due_entries() {
        let policy = ExpiryPolicy {
            sweep_interval: Duration::from_secs(60),
            max_entries: 100,
        };
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open_expiring_directory(dir.path(), false, false, policy).unwrap();

        let expired = claim_expiring_in(0);
        std::thread::sleep(Duration::from_millis(1100));
        store.save("EXPIREDKEY", &expired).unwrap();
        store.save("FRESHKEYXX", &claim_expiring_in(3600)).unwrap();

        let removed = store.sweep_expired();
        assert_eq!(removed, 1);
        assert!(matches!(
            store.load("EXPIREDKEY"),
            Err(StoreError::NotFound)
        ));
        assert!(store.load("FRESHKEYXX").is_ok());
    }

    #[test]
    fn reopening_a_directory_recovers_hash_and_expiry_state() {
        let policy = ExpiryPolicy {
            sweep_interval: Duration::from_secs(60),
            max_entries: 100,
        };
        let dir = tempfile::tempdir().unwrap();
        let encoded = claim_expiring_in(3600);
        {
            let store = Store::open_expiring_directory(dir.path(), false, false, policy).unwrap();
            store.save("ACCTKEY01", &encoded).unwrap();
        }
        let reopened = Store::open_expiring_directory(dir.path(), false, false, policy).unwrap();
        assert_eq!(reopened.load("ACCTKEY01").unwrap(), encoded);
        assert_ne!(reopened.hash(), StoreHash::zero().bytes());
    }
}
