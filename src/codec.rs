//! Haystack record codec.
//!
//! Frames object records in the AVS file as header ∥ key ∥ body ∥ padding,
//! with every record aligned to [`RECORD_ALIGN`] bytes. The header is a
//! fixed BigEndian layout; the checksum is a crc64 over key and body.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::time::{SystemTime, UNIX_EPOCH};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::error::{Error, Result};
use crate::handle::Backend;
use crate::metadb::MetaDb;
use crate::object::{decode_metadata, encode_key, encode_metadata, Metadata, Object};

/// checksum u64 + addr_id u64 + ksize u32 + dsize u32 + offset u64 +
/// clock u64 + del u8.
pub const RECORD_HEADER_SIZE: usize = 41;

/// Records are padded so the next one starts on an 8-byte boundary.
pub const RECORD_ALIGN: u64 = 8;

/// On-disk record header.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RecordHeader {
    pub checksum: u64,
    pub addr_id: u64,
    pub ksize: u32,
    pub dsize: u32,
    pub offset: u64,
    pub clock: u64,
    pub del: u8,
}

impl RecordHeader {
    fn encode<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_u64::<BigEndian>(self.checksum)?;
        writer.write_u64::<BigEndian>(self.addr_id)?;
        writer.write_u32::<BigEndian>(self.ksize)?;
        writer.write_u32::<BigEndian>(self.dsize)?;
        writer.write_u64::<BigEndian>(self.offset)?;
        writer.write_u64::<BigEndian>(self.clock)?;
        writer.write_u8(self.del)?;
        Ok(())
    }

    /// Decodes a header from the reader. An EOF on the very first field is
    /// the end of the record stream; an EOF on any later field is a
    /// truncated record.
    fn decode<R: Read>(reader: &mut R) -> Result<Self> {
        let checksum = match reader.read_u64::<BigEndian>() {
            Ok(v) => v,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Err(Error::Eof),
            Err(e) => return Err(e.into()),
        };
        let field = |name: &str, r: std::io::Result<u64>| -> Result<u64> {
            r.map_err(|e| {
                if e.kind() == std::io::ErrorKind::UnexpectedEof {
                    Error::InvalidData(format!("truncated record header at {name}"))
                } else {
                    e.into()
                }
            })
        };
        let addr_id = field("addr_id", reader.read_u64::<BigEndian>())?;
        let ksize = field("ksize", reader.read_u32::<BigEndian>().map(u64::from))? as u32;
        let dsize = field("dsize", reader.read_u32::<BigEndian>().map(u64::from))? as u32;
        let offset = field("offset", reader.read_u64::<BigEndian>())?;
        let clock = field("clock", reader.read_u64::<BigEndian>())?;
        let del = field("del", reader.read_u8().map(u64::from))? as u8;
        Ok(Self {
            checksum,
            addr_id,
            ksize,
            dsize,
            offset,
            clock,
            del,
        })
    }

    fn to_metadata(self, key: Vec<u8>) -> Metadata {
        Metadata {
            addr_id: self.addr_id,
            key,
            ksize: self.ksize,
            dsize: self.dsize,
            offset: self.offset,
            clock: self.clock,
            checksum: self.checksum,
            del: self.del,
        }
    }
}

/// Padding that brings a record of the given key/body sizes up to the
/// alignment boundary.
fn padding_for(ksize: u32, dsize: u32) -> u64 {
    let unpadded = RECORD_HEADER_SIZE as u64 + ksize as u64 + dsize as u64;
    (RECORD_ALIGN - unpadded % RECORD_ALIGN) % RECORD_ALIGN
}

/// Total on-disk size of a record with the given key/body sizes.
pub fn calc_obj_size(ksize: u32, dsize: u32) -> u64 {
    RECORD_HEADER_SIZE as u64 + ksize as u64 + dsize as u64 + padding_for(ksize, dsize)
}

fn checksum_of(key: &[u8], body: &[u8]) -> u64 {
    let mut digest = crc64fast::Digest::new();
    digest.write(key);
    digest.write(body);
    digest.sum64()
}

fn now_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros() as u64
}

/// Appends one framed record at the end of the file and returns its offset.
/// The header's offset field is filled in from the append position.
fn append_record(
    file: &mut File,
    mut header: RecordHeader,
    key: &[u8],
    body: &[u8],
) -> Result<RecordHeader> {
    let offset = file.seek(SeekFrom::End(0))?;
    header.offset = offset;

    let total = calc_obj_size(header.ksize, header.dsize) as usize;
    let mut buf = Vec::with_capacity(total);
    header.encode(&mut buf)?;
    buf.extend_from_slice(key);
    buf.extend_from_slice(body);
    buf.resize(total, 0);

    file.write_all(&buf)?;
    Ok(header)
}

/// Reads the framed record at the given offset: header, key and body bytes.
fn read_record(file: &mut File, offset: u64) -> Result<(RecordHeader, Vec<u8>, Vec<u8>)> {
    file.seek(SeekFrom::Start(offset))?;
    let header = RecordHeader::decode(file)?;

    let mut key = vec![0u8; header.ksize as usize];
    file.read_exact(&mut key)
        .map_err(|e| truncated(e, "record key"))?;

    let mut body = vec![0u8; header.dsize as usize];
    file.read_exact(&mut body)
        .map_err(|e| truncated(e, "record body"))?;

    Ok((header, key, body))
}

fn truncated(e: std::io::Error, what: &str) -> Error {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        Error::InvalidData(format!("truncated {what}"))
    } else {
        e.into()
    }
}

/// Appends an object record and points the metadata index at it.
pub fn put(db: &mut MetaDb, backend: &mut Backend, obj: &Object) -> Result<Metadata> {
    let handles = backend.handles.as_mut().ok_or(Error::HandleClosed)?;
    let header = RecordHeader {
        checksum: checksum_of(&obj.key, &obj.body),
        addr_id: obj.addr_id,
        ksize: obj.key.len() as u32,
        dsize: obj.body.len() as u32,
        offset: 0,
        clock: now_micros(),
        del: 0,
    };
    let header = append_record(&mut handles.writer, header, &obj.key, &obj.body)?;
    let meta = header.to_metadata(obj.key.clone());
    db.put(encode_key(obj.addr_id, &obj.key), encode_metadata(&meta));
    Ok(meta)
}

/// Reads the object pointed at by the index. `start`/`end` select a byte
/// range of the body; `start == 0` with a negative `end` selects the whole
/// body. A tombstoned or missing entry is `NotFound`.
pub fn get(
    db: &MetaDb,
    backend: &mut Backend,
    addr_id: u64,
    key: &[u8],
    start: i64,
    end: i64,
) -> Result<(Metadata, Vec<u8>)> {
    let meta = head(db, addr_id, key)?;
    if meta.is_deleted() {
        return Err(Error::NotFound);
    }

    let handles = backend.handles.as_mut().ok_or(Error::HandleClosed)?;
    let (header, rec_key, body) = read_record(&mut handles.reader, meta.offset)?;
    if header.addr_id != meta.addr_id || rec_key != key {
        return Err(Error::InvalidData(format!(
            "record at offset {} does not match its index entry",
            meta.offset
        )));
    }
    if header.del != 0 {
        return Err(Error::NotFound);
    }

    let body = slice_body(body, start, end)?;
    Ok((meta, body))
}

fn slice_body(body: Vec<u8>, start: i64, end: i64) -> Result<Vec<u8>> {
    if start == 0 && end < 0 {
        return Ok(body);
    }
    if start < 0 || start as usize > body.len() {
        return Err(Error::InvalidData(format!("invalid byte range start {start}")));
    }
    let from = start as usize;
    let to = if end < 0 || end as usize >= body.len() {
        body.len()
    } else {
        end as usize + 1
    };
    if from > to {
        return Err(Error::InvalidData(format!("invalid byte range {start}..{end}")));
    }
    Ok(body[from..to].to_vec())
}

/// Appends a tombstone record for the object and marks its index entry
/// deleted. The entry stays in the index pointing at the tombstone so a
/// `head` can still report the deletion.
pub fn delete(db: &mut MetaDb, backend: &mut Backend, obj: &Object) -> Result<Metadata> {
    let handles = backend.handles.as_mut().ok_or(Error::HandleClosed)?;
    let header = RecordHeader {
        checksum: checksum_of(&obj.key, &[]),
        addr_id: obj.addr_id,
        ksize: obj.key.len() as u32,
        dsize: 0,
        offset: 0,
        clock: now_micros(),
        del: 1,
    };
    let header = append_record(&mut handles.writer, header, &obj.key, &[])?;
    let meta = header.to_metadata(obj.key.clone());
    db.put(encode_key(obj.addr_id, &obj.key), encode_metadata(&meta));
    Ok(meta)
}

/// Looks up the metadata entry for a key without touching the AVS file.
pub fn head(db: &MetaDb, addr_id: u64, key: &[u8]) -> Result<Metadata> {
    match db.get(&encode_key(addr_id, key)) {
        Some(bytes) => decode_metadata(&bytes),
        None => Err(Error::NotFound),
    }
}

/// Outcome of visiting one metadata entry during a fetch scan.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Decision {
    /// Keep this entry and continue scanning.
    Continue,
    /// Discard this entry and end the scan.
    Stop,
}

/// Callback driving a `fetch` scan.
pub trait Visitor: Send {
    fn visit(&mut self, meta: &Metadata) -> Decision;
}

impl<F> Visitor for F
where
    F: FnMut(&Metadata) -> Decision + Send,
{
    fn visit(&mut self, meta: &Metadata) -> Decision {
        self(meta)
    }
}

/// Scans metadata entries under `addr_id` whose key starts with
/// `key_prefix`, in key order, accumulating entries until the visitor stops
/// the scan.
pub fn fetch(
    db: &MetaDb,
    addr_id: u64,
    key_prefix: &[u8],
    visitor: &mut dyn Visitor,
) -> Result<Vec<Metadata>> {
    let prefix = encode_key(addr_id, key_prefix);
    let mut acc = Vec::new();
    for (_, value) in db.scan_prefix(&prefix) {
        let meta = decode_metadata(value)?;
        match visitor.visit(&meta) {
            Decision::Continue => acc.push(meta),
            Decision::Stop => break,
        }
    }
    Ok(acc)
}

/// Appends a record from caller-supplied metadata and raw body, then points
/// the index at it. Used when an already-built metadata travels with the
/// body, so clock and delete flag are taken from the caller.
pub fn store(db: &mut MetaDb, backend: &mut Backend, meta: &Metadata, body: &[u8]) -> Result<Metadata> {
    let handles = backend.handles.as_mut().ok_or(Error::HandleClosed)?;
    let header = RecordHeader {
        checksum: checksum_of(&meta.key, body),
        addr_id: meta.addr_id,
        ksize: meta.key.len() as u32,
        dsize: body.len() as u32,
        offset: 0,
        clock: meta.clock,
        del: meta.del,
    };
    let header = append_record(&mut handles.writer, header, &meta.key, body)?;
    let stored = header.to_metadata(meta.key.clone());
    db.put(encode_key(meta.addr_id, &meta.key), encode_metadata(&stored));
    Ok(stored)
}

/// One record surfaced by the compaction scan.
#[derive(Debug, Clone)]
pub struct CompactRecord {
    pub meta: Metadata,
    pub key: Vec<u8>,
    pub body: Vec<u8>,
    /// Offset of the record that follows this one.
    pub next_offset: u64,
}

/// Reads the record at `offset` for the compaction scan. Returns
/// `Error::Eof` at the end of the file; a checksum mismatch is surfaced as
/// invalid data so the compaction aborts rather than copying corruption.
pub fn compact_get(reader: &mut File, offset: u64) -> Result<CompactRecord> {
    let (header, key, body) = read_record(reader, offset)?;
    if checksum_of(&key, &body) != header.checksum {
        return Err(Error::InvalidData(format!(
            "checksum mismatch in record at offset {offset}"
        )));
    }
    let next_offset = offset + calc_obj_size(header.ksize, header.dsize);
    Ok(CompactRecord {
        meta: header.to_metadata(key.clone()),
        key,
        body,
        next_offset,
    })
}

/// Copies one live record into the compaction target file and returns the
/// offset it was written at.
pub fn compact_put(writer: &mut File, meta: &Metadata, key: &[u8], body: &[u8]) -> Result<u64> {
    let header = RecordHeader {
        checksum: meta.checksum,
        addr_id: meta.addr_id,
        ksize: meta.ksize,
        dsize: meta.dsize,
        offset: 0,
        clock: meta.clock,
        del: meta.del,
    };
    let header = append_record(writer, header, key, body)?;
    Ok(header.offset)
}
