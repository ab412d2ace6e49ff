//! File-backed [`JournaledStore`] with LRU trimming to a byte budget.
//!
//! Directory layout:
//! - `journal`: JSON-lines operation log (see `journal.rs`)
//! - `<slot>.<index>`: committed value files
//! - `<slot>.<index>.tmp`: values of an edit in progress
//!
//! A commit renames the temp files over the committed ones, so readers never
//! observe a partially written value.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;

use super::journal::{self, JOURNAL_FILE, JournalHeader, JournalRecord};
use super::{JournaledStore, StoreEditor, StoreSnapshot};
use crate::Error;

/// Redundant journal operations tolerated before the journal is compacted.
const REDUNDANT_OP_COMPACT_THRESHOLD: usize = 2000;

const MAX_SLOT_LEN: usize = 120;

/// Journaled store keeping one file per slot value.
#[derive(Debug)]
pub struct DiskLruStore {
    state: Arc<Mutex<StoreState>>,
}

#[derive(Debug)]
struct Entry {
    lengths: Vec<u64>,
    /// True once the entry has been committed at least once.
    readable: bool,
    current_edit: Option<u64>,
}

#[derive(Debug)]
struct StoreState {
    directory: PathBuf,
    header: JournalHeader,
    value_count: usize,
    max_bytes: u64,
    /// Most recently used first.
    entries: LruCache<String, Entry>,
    size: u64,
    /// `None` once the store is closed.
    journal: Option<BufWriter<File>>,
    redundant_ops: usize,
    next_edit_id: u64,
}

fn validate_slot(slot: &str) -> Result<(), Error> {
    let valid = !slot.is_empty()
        && slot.len() <= MAX_SLOT_LEN
        && slot
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'_' || b == b'-');
    if valid { Ok(()) } else { Err(Error::InvalidInput(format!("invalid slot name {slot:?}"))) }
}

fn open_append(path: &Path) -> io::Result<BufWriter<File>> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map(BufWriter::new)
}

fn remove_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

fn delete_contents(directory: &Path) -> io::Result<()> {
    match fs::remove_dir_all(directory) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

impl StoreState {
    fn clean_path(&self, slot: &str, index: usize) -> PathBuf {
        self.directory.join(format!("{slot}.{index}"))
    }

    fn dirty_path(&self, slot: &str, index: usize) -> PathBuf {
        self.directory.join(format!("{slot}.{index}.tmp"))
    }

    fn check_open(&self) -> Result<(), Error> {
        if self.journal.is_some() { Ok(()) } else { Err(Error::NotInitialized) }
    }

    fn is_current_edit(&self, slot: &str, edit_id: u64) -> bool {
        self.entries
            .peek(slot)
            .is_some_and(|entry| entry.current_edit == Some(edit_id))
    }

    fn append(&mut self, record: &JournalRecord) -> Result<(), Error> {
        let journal = self.journal.as_mut().ok_or(Error::NotInitialized)?;
        journal::write_line(journal, record)?;
        Ok(())
    }

    fn flush_journal(&mut self) -> Result<(), Error> {
        if let Some(journal) = self.journal.as_mut() {
            journal.flush()?;
        }
        Ok(())
    }

    fn journal_rebuild_required(&self) -> bool {
        self.redundant_ops >= REDUNDANT_OP_COMPACT_THRESHOLD && self.redundant_ops >= self.entries.len()
    }

    /// Rewrite the journal with one line per live entry, least recently used first.
    fn rebuild_journal(&mut self) -> Result<(), Error> {
        if let Some(mut journal) = self.journal.take() {
            journal.flush()?;
        }

        let mut records = Vec::with_capacity(self.entries.len());
        for (slot, entry) in self.entries.iter().rev() {
            if entry.readable {
                records.push(JournalRecord::Clean { slot: slot.clone(), lengths: entry.lengths.clone() });
            }
            if entry.current_edit.is_some() {
                records.push(JournalRecord::Dirty { slot: slot.clone() });
            }
        }

        journal::rewrite(&self.directory, &self.header, records)?;
        self.journal = Some(open_append(&self.directory.join(JOURNAL_FILE))?);
        self.redundant_ops = 0;
        Ok(())
    }

    fn compact_if_needed(&mut self) -> Result<(), Error> {
        if self.journal_rebuild_required() {
            tracing::debug!(redundant_ops = self.redundant_ops, "compacting store journal");
            self.rebuild_journal()?;
        }
        Ok(())
    }

    fn replay(&mut self, records: Vec<JournalRecord>) {
        let total = records.len();
        for record in records {
            match record {
                JournalRecord::Clean { slot, lengths } if lengths.len() == self.value_count => {
                    self.entries.put(slot, Entry { lengths, readable: true, current_edit: None });
                }
                JournalRecord::Clean { slot, .. } | JournalRecord::Remove { slot } => {
                    self.entries.pop(&slot);
                }
                JournalRecord::Dirty { slot } => {
                    if let Some(entry) = self.entries.get_mut(&slot) {
                        entry.current_edit = Some(0);
                    } else {
                        let lengths = vec![0; self.value_count];
                        self.entries.put(slot, Entry { lengths, readable: false, current_edit: Some(0) });
                    }
                }
                JournalRecord::Read { slot } => {
                    self.entries.get(&slot);
                }
            }
        }
        self.redundant_ops = total.saturating_sub(self.entries.len());
    }

    /// Discard edits that were in progress when the journal was last written.
    fn process_journal(&mut self) {
        let pending: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.current_edit.is_some())
            .map(|(slot, _)| slot.clone())
            .collect();

        for slot in pending {
            for index in 0..self.value_count {
                let _ = remove_if_exists(&self.dirty_path(&slot, index));
            }
            let readable = self.entries.peek(&slot).is_some_and(|entry| entry.readable);
            if readable {
                if let Some(entry) = self.entries.peek_mut(&slot) {
                    entry.current_edit = None;
                }
            } else {
                self.entries.pop(&slot);
                for index in 0..self.value_count {
                    let _ = remove_if_exists(&self.clean_path(&slot, index));
                }
            }
        }

        self.size = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.readable)
            .map(|(_, entry)| entry.lengths.iter().sum::<u64>())
            .sum();
    }

    fn remove_entry(&mut self, slot: &str) -> Result<bool, Error> {
        let lengths = match self.entries.peek(slot) {
            Some(entry) if entry.readable && entry.current_edit.is_none() => entry.lengths.clone(),
            _ => return Ok(false),
        };

        for index in 0..self.value_count {
            remove_if_exists(&self.clean_path(slot, index))?;
        }
        self.size = self.size.saturating_sub(lengths.iter().sum());
        self.redundant_ops += 1;
        self.entries.pop(slot);
        self.append(&JournalRecord::Remove { slot: slot.to_string() })?;
        Ok(true)
    }

    /// Evict least recently used entries until the byte budget is respected.
    fn trim_to_size(&mut self) -> Result<(), Error> {
        if self.size <= self.max_bytes {
            return Ok(());
        }

        let candidates: Vec<String> = self
            .entries
            .iter()
            .rev()
            .filter(|(_, entry)| entry.readable && entry.current_edit.is_none())
            .map(|(slot, _)| slot.clone())
            .collect();

        for slot in candidates {
            if self.size <= self.max_bytes {
                break;
            }
            if self.remove_entry(&slot)? {
                tracing::debug!(slot = %slot, size = self.size, max_bytes = self.max_bytes, "evicted store entry");
            }
        }
        Ok(())
    }

    fn complete_edit(&mut self, slot: &str, edit_id: u64, written: &[bool], success: bool) -> Result<(), Error> {
        let (was_readable, mut lengths) = match self.entries.peek(slot) {
            Some(entry) if entry.current_edit == Some(edit_id) => (entry.readable, entry.lengths.clone()),
            _ => return Err(Error::InvalidInput(format!("edit of {slot} is no longer active"))),
        };

        let mut success = success;
        let mut failure: Option<Error> = None;

        if success && !was_readable {
            let missing = (0..self.value_count)
                .find(|&index| !written.get(index).copied().unwrap_or(false) || !self.dirty_path(slot, index).exists());
            if let Some(index) = missing {
                success = false;
                failure = Some(Error::InvalidInput(format!("new entry {slot} has no value for index {index}")));
            }
        }

        for index in 0..self.value_count {
            let dirty = self.dirty_path(slot, index);
            if !success {
                let _ = remove_if_exists(&dirty);
                continue;
            }
            if !dirty.exists() {
                continue;
            }
            let clean = self.clean_path(slot, index);
            match fs::rename(&dirty, &clean).and_then(|()| fs::metadata(&clean)) {
                Ok(meta) => {
                    let new_len = meta.len();
                    self.size = self.size.saturating_sub(lengths[index]).saturating_add(new_len);
                    lengths[index] = new_len;
                }
                Err(e) => {
                    let _ = remove_if_exists(&dirty);
                    failure.get_or_insert(e.into());
                }
            }
        }

        self.redundant_ops += 1;
        if was_readable || (success && failure.is_none()) {
            if let Some(entry) = self.entries.peek_mut(slot) {
                entry.lengths = lengths.clone();
                entry.readable = true;
                entry.current_edit = None;
            }
            self.append(&JournalRecord::Clean { slot: slot.to_string(), lengths })?;
        } else {
            self.entries.pop(slot);
            for index in 0..self.value_count {
                let _ = remove_if_exists(&self.clean_path(slot, index));
            }
            self.append(&JournalRecord::Remove { slot: slot.to_string() })?;
        }

        self.flush_journal()?;
        self.trim_to_size()?;
        self.compact_if_needed()?;

        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Abort every edit in progress; their editors will find the edit inactive.
    fn abort_pending_edits(&mut self) -> Result<(), Error> {
        let pending: Vec<(String, u64)> = self
            .entries
            .iter()
            .filter_map(|(slot, entry)| entry.current_edit.map(|id| (slot.clone(), id)))
            .collect();
        for (slot, edit_id) in pending {
            self.complete_edit(&slot, edit_id, &[], false)?;
        }
        Ok(())
    }
}

impl JournaledStore for DiskLruStore {
    type Snapshot = DiskLruSnapshot;
    type Editor = DiskLruEditor;

    fn open(directory: &Path, app_version: u32, value_count: usize, max_bytes: u64) -> Result<Self, Error> {
        if value_count == 0 {
            return Err(Error::InvalidInput("value_count must be greater than 0".into()));
        }
        if max_bytes == 0 {
            return Err(Error::InvalidInput("max_bytes must be greater than 0".into()));
        }

        fs::create_dir_all(directory)?;
        let header = JournalHeader::new(app_version, value_count);
        let mut state = StoreState {
            directory: directory.to_path_buf(),
            header,
            value_count,
            max_bytes,
            entries: LruCache::unbounded(),
            size: 0,
            journal: None,
            redundant_ops: 0,
            next_edit_id: 1,
        };

        let journal_path = directory.join(JOURNAL_FILE);
        if journal_path.exists() {
            match journal::read(&journal_path, &state.header) {
                Ok(replay) => {
                    state.replay(replay.records);
                    state.process_journal();
                    if replay.truncated {
                        state.rebuild_journal()?;
                    } else {
                        state.journal = Some(open_append(&journal_path)?);
                    }
                    state.trim_to_size()?;
                    state.compact_if_needed()?;
                    tracing::debug!(
                        directory = %directory.display(),
                        entries = state.entries.len(),
                        size = state.size,
                        "opened disk store"
                    );
                    return Ok(Self { state: Arc::new(Mutex::new(state)) });
                }
                Err(e) if e.kind() != io::ErrorKind::InvalidData => return Err(e.into()),
                Err(e) => {
                    tracing::warn!(
                        directory = %directory.display(),
                        error = %e,
                        "discarding unreadable or outdated store journal"
                    );
                    delete_contents(directory)?;
                    fs::create_dir_all(directory)?;
                }
            }
        }

        state.rebuild_journal()?;
        Ok(Self { state: Arc::new(Mutex::new(state)) })
    }

    fn get(&self, slot: &str) -> Result<Option<DiskLruSnapshot>, Error> {
        validate_slot(slot)?;
        let mut guard = self.state.lock();
        let state = &mut *guard;
        state.check_open()?;

        let lengths = match state.entries.get(slot) {
            Some(entry) if entry.readable => entry.lengths.clone(),
            _ => return Ok(None),
        };

        let mut files = Vec::with_capacity(state.value_count);
        for index in 0..state.value_count {
            match File::open(state.clean_path(slot, index)) {
                Ok(file) => files.push(Some(file)),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    tracing::warn!(slot, index, "committed value file is missing");
                    return Ok(None);
                }
                Err(e) => return Err(e.into()),
            }
        }

        state.redundant_ops += 1;
        state.append(&JournalRecord::Read { slot: slot.to_string() })?;
        state.compact_if_needed()?;

        Ok(Some(DiskLruSnapshot { slot: slot.to_string(), lengths, files }))
    }

    fn edit(&self, slot: &str) -> Result<Option<DiskLruEditor>, Error> {
        validate_slot(slot)?;
        let mut guard = self.state.lock();
        let state = &mut *guard;
        state.check_open()?;

        if state.entries.peek(slot).is_some_and(|entry| entry.current_edit.is_some()) {
            return Ok(None);
        }

        state.append(&JournalRecord::Dirty { slot: slot.to_string() })?;
        state.flush_journal()?;

        let edit_id = state.next_edit_id;
        state.next_edit_id += 1;
        if let Some(entry) = state.entries.get_mut(slot) {
            entry.current_edit = Some(edit_id);
        } else {
            let lengths = vec![0; state.value_count];
            state
                .entries
                .put(slot.to_string(), Entry { lengths, readable: false, current_edit: Some(edit_id) });
        }

        Ok(Some(DiskLruEditor {
            state: Arc::clone(&self.state),
            slot: slot.to_string(),
            edit_id,
            written: vec![false; state.value_count],
            done: false,
        }))
    }

    fn remove(&self, slot: &str) -> Result<bool, Error> {
        validate_slot(slot)?;
        let mut state = self.state.lock();
        state.check_open()?;
        let removed = state.remove_entry(slot)?;
        if removed {
            state.compact_if_needed()?;
        }
        Ok(removed)
    }

    fn delete(&self) -> Result<(), Error> {
        self.close()?;
        let mut state = self.state.lock();
        state.entries.clear();
        state.size = 0;
        delete_contents(&state.directory)?;
        Ok(())
    }

    fn size(&self) -> u64 {
        self.state.lock().size
    }

    fn max_size(&self) -> u64 {
        self.state.lock().max_bytes
    }

    fn flush(&self) -> Result<(), Error> {
        let mut state = self.state.lock();
        state.check_open()?;
        state.trim_to_size()?;
        state.flush_journal()
    }

    fn close(&self) -> Result<(), Error> {
        let mut state = self.state.lock();
        if state.journal.is_none() {
            return Ok(());
        }
        state.abort_pending_edits()?;
        state.trim_to_size()?;
        if let Some(mut journal) = state.journal.take() {
            journal.flush()?;
        }
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.state.lock().journal.is_none()
    }
}

/// Committed values of one slot, opened at the time of the lookup.
#[derive(Debug)]
pub struct DiskLruSnapshot {
    slot: String,
    lengths: Vec<u64>,
    files: Vec<Option<File>>,
}

impl StoreSnapshot for DiskLruSnapshot {
    type Reader = BufReader<File>;

    fn input_stream(&mut self, index: usize) -> Result<BufReader<File>, Error> {
        self.files
            .get_mut(index)
            .and_then(Option::take)
            .map(BufReader::new)
            .ok_or_else(|| Error::InvalidInput(format!("value {index} of {} is unavailable", self.slot)))
    }

    fn length(&self, index: usize) -> Option<u64> {
        self.lengths.get(index).copied()
    }
}

/// Edit of one slot. Values written through its streams become visible on commit.
#[derive(Debug)]
pub struct DiskLruEditor {
    state: Arc<Mutex<StoreState>>,
    slot: String,
    edit_id: u64,
    written: Vec<bool>,
    done: bool,
}

impl StoreEditor for DiskLruEditor {
    type Writer = BufWriter<File>;

    fn new_output_stream(&mut self, index: usize) -> Result<BufWriter<File>, Error> {
        if self.done {
            return Err(Error::InvalidInput(format!("edit of {} already completed", self.slot)));
        }
        let state = self.state.lock();
        if index >= state.value_count {
            return Err(Error::InvalidInput(format!("value index {index} out of range")));
        }
        if !state.is_current_edit(&self.slot, self.edit_id) {
            return Err(Error::InvalidInput(format!("edit of {} is no longer active", self.slot)));
        }
        let file = File::create(state.dirty_path(&self.slot, index))?;
        self.written[index] = true;
        Ok(BufWriter::new(file))
    }

    fn commit(&mut self) -> Result<(), Error> {
        if self.done {
            return Err(Error::InvalidInput(format!("edit of {} already completed", self.slot)));
        }
        self.done = true;
        self.state
            .lock()
            .complete_edit(&self.slot, self.edit_id, &self.written, true)
    }

    fn abort_unless_committed(&mut self) {
        if self.done {
            return;
        }
        self.done = true;
        if let Err(e) = self
            .state
            .lock()
            .complete_edit(&self.slot, self.edit_id, &self.written, false)
        {
            tracing::debug!(slot = %self.slot, error = %e, "abort of inactive edit ignored");
        }
    }
}

impl Drop for DiskLruEditor {
    fn drop(&mut self) {
        self.abort_unless_committed();
    }
}
