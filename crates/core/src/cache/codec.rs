//! Binary codec for a single cache record.
//!
//! Layout (little-endian throughout):
//!
//! ```text
//! u32   magic (0x20150306)
//! u64   payload length
//! str   key
//! str   etag ("" means absent)
//! i64   server_date, last_modified, ttl, soft_ttl
//! u32   header count, then count x (str name, str value)
//! [u8]  payload
//! ```
//!
//! `str` is a u64 byte length followed by UTF-8 bytes. Any short read is a
//! [`Error::CorruptRecord`]; nothing is ever returned truncated.

use std::io::{self, Read, Write};

use bytes::Bytes;

use super::record::{CacheRecord, RecordHeader};
use crate::Error;

/// Magic number identifying the current record format.
pub const RECORD_MAGIC: u32 = 0x2015_0306;

/// Upper bound on the buffer reserved up front for a length-prefixed field.
///
/// Declared lengths come from disk and may be garbage, so larger fields grow
/// the buffer as bytes actually arrive.
const MAX_PREALLOC: u64 = 64 * 1024;

/// Write the record header (everything but the payload).
pub fn write_header<W: Write + ?Sized>(w: &mut W, record: &CacheRecord) -> Result<(), Error> {
    w.write_all(&RECORD_MAGIC.to_le_bytes())?;
    w.write_all(&(record.payload.len() as u64).to_le_bytes())?;
    write_string(w, &record.key)?;
    write_string(w, record.etag.as_deref().unwrap_or(""))?;
    for value in [record.server_date, record.last_modified, record.ttl, record.soft_ttl] {
        w.write_all(&value.to_le_bytes())?;
    }

    let count = u32::try_from(record.response_headers.len())
        .map_err(|_| Error::InvalidInput("too many response headers".into()))?;
    w.write_all(&count.to_le_bytes())?;
    for (name, value) in &record.response_headers {
        write_string(w, name)?;
        write_string(w, value)?;
    }
    Ok(())
}

/// Write the header followed by the payload.
pub fn write_record<W: Write + ?Sized>(w: &mut W, record: &CacheRecord) -> Result<(), Error> {
    write_header(w, record)?;
    w.write_all(&record.payload)?;
    Ok(())
}

/// Read a record header, validating the magic number first.
pub fn read_header<R: Read + ?Sized>(r: &mut R) -> Result<RecordHeader, Error> {
    let magic = read_u32(r, "magic")?;
    if magic != RECORD_MAGIC {
        return Err(Error::CorruptRecord(format!("bad magic {magic:#010x}")));
    }

    let payload_len = read_u64(r, "payload length")?;
    let key = read_string(r, "key")?;
    let etag = Some(read_string(r, "etag")?).filter(|etag| !etag.is_empty());
    let server_date = read_i64(r, "server date")?;
    let last_modified = read_i64(r, "last modified")?;
    let ttl = read_i64(r, "ttl")?;
    let soft_ttl = read_i64(r, "soft ttl")?;

    let count = read_u32(r, "header count")?;
    let mut response_headers = std::collections::HashMap::with_capacity(count.min(64) as usize);
    for _ in 0..count {
        let name = read_string(r, "header name")?;
        let value = read_string(r, "header value")?;
        response_headers.insert(name, value);
    }

    Ok(RecordHeader { payload_len, key, etag, server_date, last_modified, ttl, soft_ttl, response_headers })
}

/// Read exactly `len` payload bytes.
pub fn read_payload<R: Read + ?Sized>(r: &mut R, len: u64) -> Result<Bytes, Error> {
    read_exact_len(r, len, "payload").map(Bytes::from)
}

/// Read a full record from a stream. Bytes after the payload are left unread.
pub fn read_record<R: Read + ?Sized>(r: &mut R) -> Result<CacheRecord, Error> {
    let header = read_header(r)?;
    let payload = read_payload(r, header.payload_len)?;
    Ok(header.into_record(payload))
}

/// Encode a record into a fresh buffer.
pub fn encode(record: &CacheRecord) -> Result<Vec<u8>, Error> {
    let mut buf = Vec::with_capacity(record.payload.len() + 128);
    write_record(&mut buf, record)?;
    Ok(buf)
}

/// Decode a record occupying the whole of `bytes`.
pub fn decode(mut bytes: &[u8]) -> Result<CacheRecord, Error> {
    let record = read_record(&mut bytes)?;
    if !bytes.is_empty() {
        return Err(Error::CorruptRecord(format!("{} trailing bytes after payload", bytes.len())));
    }
    Ok(record)
}

fn write_string<W: Write + ?Sized>(w: &mut W, s: &str) -> io::Result<()> {
    w.write_all(&(s.len() as u64).to_le_bytes())?;
    w.write_all(s.as_bytes())
}

fn eof_is_corruption(field: &'static str) -> impl FnOnce(io::Error) -> Error {
    move |e| {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            Error::CorruptRecord(format!("stream ended before {field}"))
        } else {
            e.into()
        }
    }
}

fn read_array<const N: usize, R: Read + ?Sized>(r: &mut R, field: &'static str) -> Result<[u8; N], Error> {
    let mut buf = [0u8; N];
    r.read_exact(&mut buf).map_err(eof_is_corruption(field))?;
    Ok(buf)
}

fn read_u32<R: Read + ?Sized>(r: &mut R, field: &'static str) -> Result<u32, Error> {
    read_array(r, field).map(u32::from_le_bytes)
}

fn read_u64<R: Read + ?Sized>(r: &mut R, field: &'static str) -> Result<u64, Error> {
    read_array(r, field).map(u64::from_le_bytes)
}

fn read_i64<R: Read + ?Sized>(r: &mut R, field: &'static str) -> Result<i64, Error> {
    read_array(r, field).map(i64::from_le_bytes)
}

fn read_exact_len<R: Read + ?Sized>(r: &mut R, len: u64, field: &'static str) -> Result<Vec<u8>, Error> {
    let mut buf = Vec::with_capacity(len.min(MAX_PREALLOC) as usize);
    r.take(len).read_to_end(&mut buf)?;
    if buf.len() as u64 != len {
        return Err(Error::CorruptRecord(format!("{field}: expected {len} bytes, read {}", buf.len())));
    }
    Ok(buf)
}

fn read_string<R: Read + ?Sized>(r: &mut R, field: &'static str) -> Result<String, Error> {
    let len = read_u64(r, field)?;
    let bytes = read_exact_len(r, len, field)?;
    String::from_utf8(bytes).map_err(|_| Error::CorruptRecord(format!("{field} is not valid UTF-8")))
}
