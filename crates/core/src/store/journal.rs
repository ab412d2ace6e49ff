// Append-only journal for the disk store. The first line identifies the format and the
// application version; every later line records one operation. Replaying the lines in order
// rebuilds the index and the LRU order without scanning the slot files.
use std::fs::{self, File};
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};

pub(super) const JOURNAL_FILE: &str = "journal";
const JOURNAL_TMP_FILE: &str = "journal.tmp";
const MAGIC: &str = "lumen.store";
const STORE_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(super) struct JournalHeader {
    magic: String,
    store_version: u32,
    app_version: u32,
    value_count: usize,
}

impl JournalHeader {
    pub(super) fn new(app_version: u32, value_count: usize) -> Self {
        Self { magic: MAGIC.to_string(), store_version: STORE_VERSION, app_version, value_count }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub(super) enum JournalRecord {
    /// An edit started; must be followed by `Clean` or `Remove`.
    Dirty { slot: String },
    /// An edit committed (or aborted on a readable entry) with these value lengths.
    Clean { slot: String, lengths: Vec<u64> },
    Remove { slot: String },
    /// Access that refreshes recency.
    Read { slot: String },
}

#[derive(Debug)]
pub(super) struct Replay {
    pub(super) records: Vec<JournalRecord>,
    /// A partially written trailing line was found; the journal needs rewriting.
    pub(super) truncated: bool,
}

fn invalid(msg: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.into())
}

/// Read the journal, failing if its header does not match `expected`.
pub(super) fn read(path: &Path, expected: &JournalHeader) -> io::Result<Replay> {
    let mut lines = BufReader::new(File::open(path)?).lines();

    let header_line = lines.next().ok_or_else(|| invalid("empty journal"))??;
    let header: JournalHeader =
        serde_json::from_str(&header_line).map_err(|e| invalid(format!("invalid journal header: {e}")))?;
    if &header != expected {
        return Err(invalid(format!("journal header mismatch: found {header:?}, expected {expected:?}")));
    }

    let mut records = Vec::new();
    let mut truncated = false;
    for line in lines {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str(&line) {
            Ok(record) => records.push(record),
            Err(_) => {
                truncated = true;
                break;
            }
        }
    }

    Ok(Replay { records, truncated })
}

/// Write `records` to a fresh journal and atomically swap it into place.
pub(super) fn rewrite(
    directory: &Path, header: &JournalHeader, records: impl IntoIterator<Item = JournalRecord>,
) -> io::Result<()> {
    let tmp_path = directory.join(JOURNAL_TMP_FILE);
    {
        let mut writer = BufWriter::new(File::create(&tmp_path)?);
        write_line(&mut writer, header)?;
        for record in records {
            write_line(&mut writer, &record)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()?;
    }
    fs::rename(&tmp_path, directory.join(JOURNAL_FILE))
}

pub(super) fn write_line<W: Write, T: Serialize>(writer: &mut W, value: &T) -> io::Result<()> {
    serde_json::to_writer(&mut *writer, value)?;
    writer.write_all(b"\n")
}
