//! Persistent record cache on top of a journaled store.
//!
//! Every public operation holds the cache lock for its whole duration, so disk
//! operations are serialized. They perform blocking file I/O and belong on a
//! blocking thread, never on an async executor thread.
//!
//! Store and decode failures are recovered here: a failed read is treated as a
//! miss and the offending slot is removed, a failed write leaves no partial
//! data. Only [`Error::NotInitialized`] reaches the caller.

use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use super::codec;
use super::hash::slot_key;
use super::record::CacheRecord;
use crate::store::{DiskLruStore, JournaledStore, StoreEditor, StoreSnapshot};
use crate::{AppConfig, Error};

/// Values per slot: each slot holds exactly one encoded record.
const VALUE_COUNT: usize = 1;

/// Disk cache with an explicit `initialize`/`close` lifecycle.
#[derive(Debug)]
pub struct DiskCache<S: JournaledStore = DiskLruStore> {
    directory: PathBuf,
    max_bytes: u64,
    app_version: u32,
    store: Mutex<Option<S>>,
}

impl DiskCache<DiskLruStore> {
    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(config.cache_dir.clone(), config.max_disk_bytes, config.app_version)
    }
}

impl<S: JournaledStore> DiskCache<S> {
    /// Create an unopened cache. Call [`DiskCache::initialize`] before use.
    pub fn new(directory: impl Into<PathBuf>, max_bytes: u64, app_version: u32) -> Self {
        Self { directory: directory.into(), max_bytes, app_version, store: Mutex::new(None) }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn app_version(&self) -> u32 {
        self.app_version
    }

    pub fn max_bytes(&self) -> u64 {
        self.max_bytes
    }

    /// Create the directory and open the store. A no-op if already open.
    ///
    /// On failure the cache stays unusable until `initialize` is retried.
    pub fn initialize(&self) -> Result<(), Error> {
        let mut guard = self.store.lock();
        if guard.as_ref().is_some_and(|store| !store.is_closed()) {
            return Ok(());
        }

        if let Err(e) = std::fs::create_dir_all(&self.directory) {
            tracing::error!(directory = %self.directory.display(), error = %e, "failed to create cache directory");
            return Err(e.into());
        }

        match S::open(&self.directory, self.app_version, VALUE_COUNT, self.max_bytes) {
            Ok(store) => {
                tracing::info!(
                    directory = %self.directory.display(),
                    app_version = self.app_version,
                    bytes = store.size(),
                    max_bytes = self.max_bytes,
                    "disk cache initialized"
                );
                *guard = Some(store);
                Ok(())
            }
            Err(e) => {
                tracing::error!(directory = %self.directory.display(), error = %e, "failed to open disk store");
                Err(e)
            }
        }
    }

    fn open_store(guard: &Option<S>) -> Result<&S, Error> {
        guard.as_ref().filter(|store| !store.is_closed()).ok_or(Error::NotInitialized)
    }

    /// Look up the record for `key`.
    ///
    /// Returns `None` on a miss and also when the stored record cannot be
    /// read or decoded; such a slot is removed.
    pub fn get(&self, key: &str) -> Result<Option<CacheRecord>, Error> {
        let guard = self.store.lock();
        let store = Self::open_store(&guard)?;
        Ok(read_slot(store, key, &slot_key(key)))
    }

    /// Store `record` under `key`, replacing any previous record.
    ///
    /// The persisted record carries `key` as its original identifier.
    pub fn put(&self, key: &str, record: &CacheRecord) -> Result<(), Error> {
        let guard = self.store.lock();
        let store = Self::open_store(&guard)?;
        write_slot(store, key, &slot_key(key), record);
        Ok(())
    }

    /// Force a refresh of `key` without dropping its bytes.
    ///
    /// Zeroes the soft TTL, and the hard TTL too when `full_expire` is set.
    /// A no-op when `key` is absent.
    pub fn invalidate(&self, key: &str, full_expire: bool) -> Result<(), Error> {
        let guard = self.store.lock();
        let store = Self::open_store(&guard)?;
        let slot = slot_key(key);

        if let Some(mut record) = read_slot(store, key, &slot) {
            record.soft_ttl = 0;
            if full_expire {
                record.ttl = 0;
            }
            write_slot(store, key, &slot, &record);
        }
        Ok(())
    }

    pub fn remove(&self, key: &str) -> Result<(), Error> {
        let guard = self.store.lock();
        let store = Self::open_store(&guard)?;
        let slot = slot_key(key);

        match store.remove(&slot) {
            Ok(true) => tracing::debug!(key, slot = %slot, "removed disk cache entry"),
            Ok(false) => tracing::debug!(key, slot = %slot, "disk cache entry to remove was not found"),
            Err(e) => tracing::warn!(key, slot = %slot, error = %e, "failed to remove disk cache entry"),
        }
        Ok(())
    }

    /// True if a slot exists for `key`. Does not decode the record.
    pub fn contains(&self, key: &str) -> Result<bool, Error> {
        let guard = self.store.lock();
        let store = Self::open_store(&guard)?;
        Ok(matches!(store.get(&slot_key(key)), Ok(Some(_))))
    }

    /// Delete every entry and reopen the store empty.
    pub fn clear(&self) -> Result<(), Error> {
        let mut guard = self.store.lock();
        let store = guard.take().filter(|store| !store.is_closed()).ok_or(Error::NotInitialized)?;

        if let Err(e) = store.delete() {
            tracing::warn!(directory = %self.directory.display(), error = %e, "failed to delete disk store");
        }
        drop(store);

        match S::open(&self.directory, self.app_version, VALUE_COUNT, self.max_bytes) {
            Ok(store) => {
                tracing::info!(directory = %self.directory.display(), "disk cache cleared");
                *guard = Some(store);
                Ok(())
            }
            Err(e) => {
                tracing::error!(directory = %self.directory.display(), error = %e, "failed to reopen disk store after clear");
                Err(e)
            }
        }
    }

    /// Bytes currently used by stored records.
    pub fn size(&self) -> Result<u64, Error> {
        let guard = self.store.lock();
        Self::open_store(&guard).map(|store| store.size())
    }

    pub fn flush(&self) -> Result<(), Error> {
        let guard = self.store.lock();
        let store = Self::open_store(&guard)?;
        if let Err(e) = store.flush() {
            tracing::warn!(directory = %self.directory.display(), error = %e, "failed to flush disk store");
        }
        Ok(())
    }

    /// Close the store. Closing a closed cache is a no-op.
    pub fn close(&self) -> Result<(), Error> {
        let mut guard = self.store.lock();
        if let Some(store) = guard.take()
            && let Err(e) = store.close()
        {
            tracing::warn!(directory = %self.directory.display(), error = %e, "failed to close disk store");
        }
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        Self::open_store(&self.store.lock()).is_ok()
    }
}

/// Read and decode the record in `slot`, removing the slot if that fails.
fn read_slot<S: JournaledStore>(store: &S, key: &str, slot: &str) -> Option<CacheRecord> {
    let result = match store.get(slot) {
        Ok(None) => {
            tracing::debug!(key, slot, "disk cache miss");
            return None;
        }
        Ok(Some(snapshot)) => decode_snapshot::<S>(snapshot),
        Err(e) => Err(e),
    };

    match result {
        Ok(record) => {
            tracing::debug!(key, slot, bytes = record.payload.len(), "disk cache hit");
            Some(record)
        }
        Err(e) => {
            tracing::warn!(key, slot, error = %e, "discarding unreadable disk cache entry");
            if let Err(e) = store.remove(slot) {
                tracing::warn!(key, slot, error = %e, "failed to remove unreadable disk cache entry");
            }
            None
        }
    }
}

fn decode_snapshot<S: JournaledStore>(mut snapshot: S::Snapshot) -> Result<CacheRecord, Error> {
    let mut reader = snapshot.input_stream(0)?;
    let record = codec::read_record(&mut reader)?;

    let mut trailing = [0u8; 1];
    if reader.read(&mut trailing)? != 0 {
        return Err(Error::CorruptRecord("bytes after payload".into()));
    }
    Ok(record)
}

fn write_slot<S: JournaledStore>(store: &S, key: &str, slot: &str, record: &CacheRecord) {
    let renamed;
    let record = if record.key == key {
        record
    } else {
        renamed = CacheRecord { key: key.to_string(), ..record.clone() };
        &renamed
    };

    let mut editor = match store.edit(slot) {
        Ok(Some(editor)) => editor,
        Ok(None) => {
            tracing::debug!(key, slot, "disk cache entry is being written elsewhere, skipping put");
            return;
        }
        Err(e) => {
            tracing::warn!(key, slot, error = %e, "failed to start disk cache write");
            return;
        }
    };

    let result = write_into::<S>(&mut editor, record);
    editor.abort_unless_committed();

    match result {
        Ok(()) => tracing::debug!(key, slot, bytes = record.payload.len(), "stored disk cache entry"),
        Err(e) => tracing::warn!(key, slot, error = %e, "failed to store disk cache entry"),
    }
}

fn write_into<S: JournaledStore>(editor: &mut S::Editor, record: &CacheRecord) -> Result<(), Error> {
    let mut out = editor.new_output_stream(0)?;
    codec::write_header(&mut out, record)?;
    out.write_all(&record.payload)?;
    out.flush()?;
    drop(out);
    editor.commit()
}
