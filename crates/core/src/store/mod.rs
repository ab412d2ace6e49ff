//! Journaled key/value byte store.
//!
//! The disk cache only depends on the [`JournaledStore`] contract: per-slot
//! atomic commit/abort, LRU trimming to a byte budget, and a version tag that
//! invalidates everything when it changes. [`DiskLruStore`] is the bundled
//! file-backed implementation.

use std::io::{Read, Write};
use std::path::Path;

use crate::Error;

mod disk_lru;
mod journal;

pub use disk_lru::{DiskLruEditor, DiskLruSnapshot, DiskLruStore};

/// An append-only, versioned, LRU-bounded key/value store.
///
/// Slots are addressed by names restricted to `[a-z0-9_-]{1,120}`. Each slot
/// holds `value_count` independent byte streams.
pub trait JournaledStore: Sized + Send {
    type Snapshot: StoreSnapshot;
    type Editor: StoreEditor;

    /// Open (or create) the store in `directory`.
    ///
    /// Existing contents written with a different `app_version` or
    /// `value_count` are discarded.
    fn open(directory: &Path, app_version: u32, value_count: usize, max_bytes: u64) -> Result<Self, Error>;

    /// Snapshot of the committed values of `slot`, or `None` if absent.
    fn get(&self, slot: &str) -> Result<Option<Self::Snapshot>, Error>;

    /// Begin an edit of `slot`, or `None` if another edit is in progress.
    fn edit(&self, slot: &str) -> Result<Option<Self::Editor>, Error>;

    /// Drop `slot`. Returns false if it was absent or is being edited.
    fn remove(&self, slot: &str) -> Result<bool, Error>;

    /// Close the store and delete everything in its directory.
    fn delete(&self) -> Result<(), Error>;

    /// Bytes currently used by committed values.
    fn size(&self) -> u64;

    fn max_size(&self) -> u64;

    fn flush(&self) -> Result<(), Error>;

    fn close(&self) -> Result<(), Error>;

    fn is_closed(&self) -> bool;
}

/// Read access to the committed values of one slot.
pub trait StoreSnapshot {
    type Reader: Read;

    /// Take the stream for value `index`. Each index can be taken once.
    fn input_stream(&mut self, index: usize) -> Result<Self::Reader, Error>;

    /// Committed length of value `index`.
    fn length(&self, index: usize) -> Option<u64>;
}

/// An in-progress edit of one slot.
///
/// Nothing written becomes visible until [`StoreEditor::commit`]. Dropping an
/// editor without committing aborts it.
pub trait StoreEditor {
    type Writer: Write;

    /// Open a fresh stream for value `index`, replacing its contents on commit.
    fn new_output_stream(&mut self, index: usize) -> Result<Self::Writer, Error>;

    fn commit(&mut self) -> Result<(), Error>;

    /// Abort the edit unless it was committed. Safe to call more than once.
    fn abort_unless_committed(&mut self);
}
