//! Online compaction: copy the live records of a container into a fresh
//! raw AVS file, swap the stable symlink over to it, and drop tombstones,
//! superseded records and orphaned keys on the way.
//!
//! The swap is the atomicity boundary. Everything before it rolls back to
//! the original file; once the symlink points at the new file, the worker
//! commits the new index stream even if the final reopen fails.

use std::fs;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::codec;
use crate::diskspace;
use crate::error::{Error, Result};
use crate::handle;
use crate::metadb::MetaDb;
use crate::object::{decode_metadata, encode_key, encode_metadata, Metadata};
use crate::paths;
use crate::worker::Worker;

/// Ownership predicate for compaction: keys outside this node's charge are
/// orphans and are dropped from the container.
pub trait Ownership: Send {
    fn has_charge(&self, key: &[u8]) -> bool;
}

impl<F> Ownership for F
where
    F: Fn(&[u8]) -> bool + Send,
{
    fn has_charge(&self, key: &[u8]) -> bool {
        self(key)
    }
}

/// Free space must cover 1.5 times the current AVS plus index footprint
/// before a compaction may start.
fn check_disk_remain(free: u64, avs_size: u64, meta_size: u64) -> Result<()> {
    let need = avs_size.saturating_add(meta_size).saturating_mul(3) / 2;
    if free <= need {
        return Err(Error::SystemLimit);
    }
    Ok(())
}

fn unix_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// A record is dead when it is a tombstone, its key no longer has an index
/// entry, the entry is tombstoned, or the entry points at a newer record.
fn is_deleted(metadb: &MetaDb, meta: &Metadata) -> bool {
    if meta.del != 0 {
        return true;
    }
    match metadb.get(&encode_key(meta.addr_id, &meta.key)) {
        None => true,
        Some(bytes) => match decode_metadata(&bytes) {
            Ok(auth) => auth.del != 0 || auth.offset != meta.offset,
            Err(_) => true,
        },
    }
}

enum Outcome {
    Committed {
        num_active: i64,
        size_active: i64,
    },
    PreSwapFailed(Error),
    /// The symlink already points at the new file; only the reopen failed.
    PostSwapFailed {
        error: Error,
        num_active: i64,
        size_active: i64,
    },
}

/// Runs a full compaction against the worker's container. Never panics:
/// every failure lands the worker back in a serviceable (or explicitly
/// degraded) state with `has_error` set.
pub(crate) fn compact(worker: &mut Worker, ownership: &dyn Ownership) -> Result<()> {
    // Prepare: disk precheck first, with nothing mutated on refusal.
    let stable = worker.backend.file_path.clone();
    let avs_size = fs::metadata(&stable).map(|m| m.len()).unwrap_or(0);
    let meta_size = fs::metadata(worker.metadb.raw_filepath())
        .map(|m| m.len())
        .unwrap_or(0);
    let parent = stable.parent().unwrap_or_else(|| Path::new("/"));
    let free = diskspace::free_bytes(parent)?;
    check_disk_remain(free, avs_size, meta_size)?;

    let tmp_raw = paths::mint_raw_avoiding(&stable, &worker.backend.file_path_raw);
    // Start from an empty target even when a stale leftover file exists.
    fs::File::create(&tmp_raw)?;
    let tmp_handles = match handle::open(&tmp_raw) {
        Ok(handles) => handles,
        Err(e) => {
            let _ = fs::remove_file(&tmp_raw);
            return Err(e);
        }
    };
    worker.backend.tmp_file_path_raw = Some(tmp_raw.clone());
    worker.backend.tmp_handles = Some(tmp_handles);
    worker.stats.begin_compaction(unix_seconds());

    tracing::info!(
        id = %worker.config.id,
        avs_size = avs_size,
        tmp = %tmp_raw.display(),
        "Starting container compaction"
    );

    let outcome = match scan_and_copy(worker, ownership) {
        Ok((num_active, size_active)) => commit(worker, num_active, size_active),
        Err(e) => Outcome::PreSwapFailed(e),
    };

    let finished = unix_seconds();
    match outcome {
        Outcome::Committed {
            num_active,
            size_active,
        } => {
            worker.metadb.compact_end(true);
            worker.stats.apply_compaction(num_active, size_active);
            worker.stats.finish_compaction(finished);
            tracing::info!(
                id = %worker.config.id,
                num_active = num_active,
                size_active = size_active,
                raw = %worker.backend.file_path_raw.display(),
                "Completed container compaction"
            );
            Ok(())
        }
        Outcome::PreSwapFailed(error) => {
            rollback(worker);
            worker.stats.has_error = true;
            worker.stats.finish_compaction(finished);
            tracing::warn!(
                id = %worker.config.id,
                error = %error,
                "Compaction rolled back"
            );
            Err(error)
        }
        Outcome::PostSwapFailed {
            error,
            num_active,
            size_active,
        } => {
            // The compacted file is live, so the index stream and counters
            // must follow it even though the caller sees the error.
            worker.backend.tmp_file_path_raw = None;
            worker.metadb.compact_end(true);
            worker.stats.apply_compaction(num_active, size_active);
            worker.stats.has_error = true;
            worker.stats.finish_compaction(finished);
            tracing::error!(
                id = %worker.config.id,
                error = %error,
                "Compaction swapped but reopen failed, container degraded"
            );
            Err(error)
        }
    }
}

/// Scan phase: walk the live file record by record and copy everything
/// still alive and owned into the temporary file, feeding the index's
/// compact-mode write stream.
fn scan_and_copy(worker: &mut Worker, ownership: &dyn Ownership) -> Result<(i64, i64)> {
    let backend = &mut worker.backend;
    let metadb = &mut worker.metadb;

    metadb.compact_start()?;

    let handles = backend.handles.as_mut().ok_or(Error::HandleClosed)?;
    let tmp = backend.tmp_handles.as_mut().ok_or(Error::HandleClosed)?;
    let reader = &mut handles.reader;
    let writer = &mut tmp.writer;

    let mut offset = 0u64;
    let mut num_active = 0i64;
    let mut size_active = 0i64;

    loop {
        let rec = match codec::compact_get(reader, offset) {
            Ok(rec) => rec,
            Err(Error::Eof) => break,
            Err(e) => return Err(e),
        };

        let drop = is_deleted(metadb, &rec.meta) || !ownership.has_charge(&rec.key);
        if !drop {
            let new_offset = codec::compact_put(writer, &rec.meta, &rec.key, &rec.body)?;
            let mut meta = rec.meta.clone();
            meta.offset = new_offset;
            metadb.compact_put(encode_key(meta.addr_id, &meta.key), encode_metadata(&meta))?;
            num_active += 1;
            size_active += codec::calc_obj_size(meta.ksize, meta.dsize) as i64;
        }
        offset = rec.next_offset;
    }

    Ok((num_active, size_active))
}

/// Commit phase: close both handle pairs, swap the symlink, drop the old
/// raw file and reopen on the stable path. The symlink swap strictly
/// precedes the old-file deletion.
fn commit(worker: &mut Worker, num_active: i64, size_active: i64) -> Outcome {
    let backend = &mut worker.backend;

    if let Some(handles) = backend.handles.take() {
        if let Err(e) = handle::close(handles) {
            tracing::warn!(error = %e, "Failed to close pre-compaction handles");
        }
    }
    if let Some(tmp) = backend.tmp_handles.take() {
        // The new file must be durable before it becomes the live target.
        if let Err(e) = handle::close(tmp) {
            return Outcome::PreSwapFailed(e);
        }
    }

    let tmp_raw = match backend.tmp_file_path_raw.clone() {
        Some(path) => path,
        None => {
            return Outcome::PreSwapFailed(Error::InvalidData(
                "compaction target file missing".to_string(),
            ))
        }
    };

    if let Err(e) = paths::swap_symlink(&backend.file_path, &tmp_raw) {
        return Outcome::PreSwapFailed(e);
    }

    let old_raw = std::mem::replace(&mut backend.file_path_raw, tmp_raw);
    backend.tmp_file_path_raw = None;
    if old_raw != backend.file_path_raw {
        let _ = fs::remove_file(&old_raw);
    }

    match handle::open(&backend.file_path) {
        Ok(handles) => {
            backend.handles = Some(handles);
            Outcome::Committed {
                num_active,
                size_active,
            }
        }
        Err(error) => Outcome::PostSwapFailed {
            error,
            num_active,
            size_active,
        },
    }
}

/// Rollback for failures before the swap: drop the temporary file, get the
/// live handles back if they were closed, and discard the index stream.
fn rollback(worker: &mut Worker) {
    let backend = &mut worker.backend;

    if let Some(tmp) = backend.tmp_handles.take() {
        let _ = handle::close(tmp);
    }
    if let Some(tmp_raw) = backend.tmp_file_path_raw.take() {
        let _ = fs::remove_file(&tmp_raw);
    }
    if backend.handles.is_none() {
        if let Err(e) = backend.reopen() {
            tracing::warn!(
                path = %backend.file_path.display(),
                error = %e,
                "Could not restore handles after compaction rollback"
            );
        }
    }
    worker.metadb.compact_end(false);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::object::Object;
    use std::io::{Seek, SeekFrom, Write};
    use tempfile::tempdir;

    fn test_worker(root: &std::path::Path) -> Worker {
        Worker::init(Config::new(root).id("w0").seq_no(0).meta_db_id("m0")).unwrap()
    }

    fn keep_all(_key: &[u8]) -> bool {
        true
    }

    #[test]
    fn test_check_disk_remain_boundary() {
        // remain = free - 1.5 * (avs + meta) must be strictly positive.
        assert_eq!(check_disk_remain(100, 40, 40), Err(Error::SystemLimit));
        assert_eq!(check_disk_remain(120, 40, 40), Err(Error::SystemLimit));
        assert!(check_disk_remain(121, 40, 40).is_ok());
        assert!(check_disk_remain(1, 0, 0).is_ok());
    }

    #[test]
    fn test_compact_drops_tombstones_and_superseded() {
        let dir = tempdir().unwrap();
        let mut worker = test_worker(dir.path());

        worker.put(&Object::new(1, &b"a"[..], &b"alpha"[..])).unwrap();
        worker.put(&Object::new(1, &b"b"[..], &b"beta"[..])).unwrap();
        worker.put(&Object::new(1, &b"c"[..], &b"gamma"[..])).unwrap();
        worker.put(&Object::new(1, &b"b"[..], &b"beta2"[..])).unwrap();
        worker.delete(&Object::new(1, &b"c"[..], &b""[..])).unwrap();

        let old_raw = worker.backend.file_path_raw.clone();
        let old_len = fs::metadata(&old_raw).unwrap().len();

        compact(&mut worker, &keep_all).unwrap();

        let stats = worker.stats();
        assert_eq!(stats.active_num, 2);
        assert_eq!(stats.total_num, 2);
        assert_eq!(stats.total_sizes, stats.active_sizes);

        let new_raw = worker.backend.file_path_raw.clone();
        assert_ne!(new_raw, old_raw);
        assert!(!old_raw.exists(), "old raw file must be deleted");
        assert!(new_raw.exists());
        assert!(fs::metadata(&new_raw).unwrap().len() < old_len);

        let stable = worker.backend.file_path.clone();
        assert_eq!(fs::read_link(&stable).unwrap(), new_raw);

        // The live set survives with identical bodies.
        let (_, body) = worker.get(1, b"a", 0, -1).unwrap();
        assert_eq!(body, b"alpha");
        let (_, body) = worker.get(1, b"b", 0, -1).unwrap();
        assert_eq!(body, b"beta2");
        // Tombstoned keys are gone from the index entirely.
        assert_eq!(worker.head(1, b"c"), Err(Error::NotFound));
    }

    #[test]
    fn test_compact_drops_orphans() {
        let dir = tempdir().unwrap();
        let mut worker = test_worker(dir.path());

        worker.put(&Object::new(1, &b"a"[..], &b"mine"[..])).unwrap();
        worker.put(&Object::new(1, &b"b"[..], &b"theirs"[..])).unwrap();

        compact(&mut worker, &|key: &[u8]| key == b"a").unwrap();

        let stats = worker.stats();
        assert_eq!(stats.active_num, 1);
        assert_eq!(stats.total_num, 1);

        let (_, body) = worker.get(1, b"a", 0, -1).unwrap();
        assert_eq!(body, b"mine");
        assert_eq!(worker.head(1, b"b"), Err(Error::NotFound));
    }

    #[test]
    fn test_compact_is_writable_afterwards() {
        let dir = tempdir().unwrap();
        let mut worker = test_worker(dir.path());

        worker.put(&Object::new(1, &b"a"[..], &b"v1"[..])).unwrap();
        compact(&mut worker, &keep_all).unwrap();

        worker.put(&Object::new(1, &b"b"[..], &b"v2"[..])).unwrap();
        let (_, body) = worker.get(1, b"b", 0, -1).unwrap();
        assert_eq!(body, b"v2");

        let stats = worker.stats();
        assert_eq!(stats.active_num, 2);
    }

    #[test]
    fn test_empty_container_compacts_to_zero() {
        let dir = tempdir().unwrap();
        let mut worker = test_worker(dir.path());

        compact(&mut worker, &keep_all).unwrap();

        let stats = worker.stats();
        assert_eq!(stats.active_num, 0);
        assert_eq!(stats.total_num, 0);
        assert!(!stats.has_error);
    }

    #[test]
    fn test_history_ring_tracks_runs() {
        let dir = tempdir().unwrap();
        let mut worker = test_worker(dir.path());

        for _ in 0..9 {
            compact(&mut worker, &keep_all).unwrap();
        }

        let stats = worker.stats();
        assert_eq!(
            stats.compaction_histories.len(),
            crate::stats::MAX_COMPACTION_HISTORIES
        );
        for entry in &stats.compaction_histories {
            assert_ne!(entry.end, 0, "all runs must be closed");
        }
    }

    #[test]
    fn test_corrupt_record_rolls_back() {
        let dir = tempdir().unwrap();
        let mut worker = test_worker(dir.path());

        worker.put(&Object::new(1, &b"a"[..], &b"payload"[..])).unwrap();
        let raw = worker.backend.file_path_raw.clone();
        let stats_before = worker.stats();

        // Corrupt the record body so the compaction scan fails its checksum.
        let mut file = fs::OpenOptions::new().write(true).open(&raw).unwrap();
        file.seek(SeekFrom::Start(codec::RECORD_HEADER_SIZE as u64 + 1))
            .unwrap();
        file.write_all(b"XX").unwrap();
        file.sync_all().unwrap();

        let err = compact(&mut worker, &keep_all).unwrap_err();
        assert!(matches!(err, Error::InvalidData(_)));

        // Rolled back: same raw file, sticky error flag, no tmp leftovers.
        assert_eq!(worker.backend.file_path_raw, raw);
        assert_eq!(fs::read_link(&worker.backend.file_path).unwrap(), raw);
        let stats = worker.stats();
        assert!(stats.has_error);
        assert_eq!(stats.total_num, stats_before.total_num);
        assert!(worker.backend.tmp_file_path_raw.is_none());
        assert!(worker.backend.tmp_handles.is_none());

        let leftovers: Vec<_> = fs::read_dir(raw.parent().unwrap())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.path() != raw && e.path() != worker.backend.file_path)
            .collect();
        assert!(leftovers.is_empty(), "tmp raw file must be removed");

        // The worker stays serviceable.
        worker.put(&Object::new(1, &b"b"[..], &b"ok"[..])).unwrap();
        let (_, body) = worker.get(1, b"b", 0, -1).unwrap();
        assert_eq!(body, b"ok");
    }

    #[test]
    fn test_failed_compaction_closes_history_entry() {
        let dir = tempdir().unwrap();
        let mut worker = test_worker(dir.path());

        worker.put(&Object::new(1, &b"a"[..], &b"payload"[..])).unwrap();
        let raw = worker.backend.file_path_raw.clone();
        let mut file = fs::OpenOptions::new().write(true).open(&raw).unwrap();
        file.seek(SeekFrom::Start(codec::RECORD_HEADER_SIZE as u64))
            .unwrap();
        file.write_all(b"Z").unwrap();
        file.sync_all().unwrap();

        compact(&mut worker, &keep_all).unwrap_err();

        let stats = worker.stats();
        assert_eq!(stats.compaction_histories.len(), 1);
        assert_ne!(stats.compaction_histories[0].end, 0);
    }

    #[test]
    fn test_is_deleted_covers_supersession() {
        let dir = tempdir().unwrap();
        let mut worker = test_worker(dir.path());

        let first = worker.put(&Object::new(1, &b"k"[..], &b"old"[..])).unwrap();
        let second = worker.put(&Object::new(1, &b"k"[..], &b"new"[..])).unwrap();

        assert!(is_deleted(&worker.metadb, &first));
        assert!(!is_deleted(&worker.metadb, &second));

        let mut missing = second.clone();
        missing.key = b"never-written".to_vec();
        assert!(is_deleted(&worker.metadb, &missing));
    }
}
