//! Metadata index: an ordered binary key-value store with prefix scans and
//! a two-phase compact mode. Entries live in a `BTreeMap` owned by the
//! worker thread; a bincode snapshot is persisted on close and on
//! compaction commit.

use std::collections::BTreeMap;
use std::fs;
use std::io::{BufReader, BufWriter, Write};
use std::ops::Bound;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

type Entries = BTreeMap<Vec<u8>, Vec<u8>>;

#[derive(Debug)]
pub struct MetaDb {
    path: PathBuf,
    live: Entries,
    /// Present while compact mode is active; receives the parallel write
    /// stream and replaces `live` on a committed `compact_end`.
    shadow: Option<Entries>,
}

impl MetaDb {
    /// Opens the index, loading the snapshot at `path` when one is present.
    /// An unreadable snapshot starts the index empty rather than failing.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let live = match fs::File::open(&path) {
            Ok(file) => match bincode::deserialize_from(BufReader::new(file)) {
                Ok(entries) => entries,
                Err(e) => {
                    tracing::warn!(
                        path = %path.display(),
                        error = %e,
                        "Unreadable metadata snapshot, starting empty"
                    );
                    Entries::new()
                }
            },
            Err(_) => Entries::new(),
        };

        Ok(Self {
            path,
            live,
            shadow: None,
        })
    }

    pub fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.live.get(key).cloned()
    }

    pub fn put(&mut self, key: Vec<u8>, value: Vec<u8>) {
        self.live.insert(key, value);
    }

    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }

    /// Iterates entries whose key starts with the given prefix, in order.
    pub fn scan_prefix(&self, prefix: &[u8]) -> impl Iterator<Item = (&Vec<u8>, &Vec<u8>)> {
        let start = Bound::Included(prefix.to_vec());
        let end = match prefix.iter().rposition(|b| *b != 0xff) {
            Some(i) => Bound::Excluded(
                prefix[..i]
                    .iter()
                    .chain(std::iter::once(&(prefix[i] + 1)))
                    .copied()
                    .collect::<Vec<u8>>(),
            ),
            None => Bound::Unbounded,
        };
        self.live.range((start, end))
    }

    /// Path of the snapshot file backing this index.
    pub fn raw_filepath(&self) -> &Path {
        &self.path
    }

    /// Enters compact mode. Writes via `compact_put` accumulate separately
    /// until `compact_end` commits or discards them.
    pub fn compact_start(&mut self) -> Result<()> {
        if self.shadow.is_some() {
            return Err(Error::InvalidData(
                "metadata compaction already in progress".to_string(),
            ));
        }
        self.shadow = Some(Entries::new());
        Ok(())
    }

    pub fn compact_put(&mut self, key: Vec<u8>, value: Vec<u8>) -> Result<()> {
        match self.shadow.as_mut() {
            Some(shadow) => {
                shadow.insert(key, value);
                Ok(())
            }
            None => Err(Error::InvalidData(
                "compact_put outside compact mode".to_string(),
            )),
        }
    }

    /// Leaves compact mode. A committed end swaps the accumulated entries
    /// in as the live set and persists them; an aborted end discards them.
    /// Always succeeds so rollback paths cannot wedge on it.
    pub fn compact_end(&mut self, committed: bool) {
        match self.shadow.take() {
            Some(shadow) if committed => {
                self.live = shadow;
                if let Err(e) = self.persist() {
                    tracing::warn!(
                        path = %self.path.display(),
                        error = %e,
                        "Failed to persist metadata snapshot after compaction"
                    );
                }
            }
            _ => {}
        }
    }

    /// Persists the live entries.
    pub fn close(&mut self) -> Result<()> {
        self.persist()
    }

    fn persist(&self) -> Result<()> {
        let tmp = self.path.with_extension("tmp");
        let file = fs::File::create(&tmp)?;
        let mut writer = BufWriter::new(file);
        bincode::serialize_into(&mut writer, &self.live)?;
        writer.flush()?;
        writer.get_ref().sync_all()?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_put_get_scan() {
        let dir = tempdir().unwrap();
        let mut db = MetaDb::open(dir.path().join("meta")).unwrap();

        db.put(b"p/b".to_vec(), b"2".to_vec());
        db.put(b"p/a".to_vec(), b"1".to_vec());
        db.put(b"q/c".to_vec(), b"3".to_vec());

        assert_eq!(db.get(b"p/a"), Some(b"1".to_vec()));
        assert_eq!(db.get(b"missing"), None);

        let keys: Vec<_> = db.scan_prefix(b"p/").map(|(k, _)| k.clone()).collect();
        assert_eq!(keys, vec![b"p/a".to_vec(), b"p/b".to_vec()]);
    }

    #[test]
    fn test_scan_prefix_all_ff() {
        let dir = tempdir().unwrap();
        let mut db = MetaDb::open(dir.path().join("meta")).unwrap();
        db.put(vec![0xff, 0xff, 0x01], b"x".to_vec());
        let found: Vec<_> = db.scan_prefix(&[0xff, 0xff]).collect();
        assert_eq!(found.len(), 1);
    }

    #[test]
    fn test_snapshot_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("meta");

        let mut db = MetaDb::open(&path).unwrap();
        db.put(b"k".to_vec(), b"v".to_vec());
        db.close().unwrap();

        let db = MetaDb::open(&path).unwrap();
        assert_eq!(db.get(b"k"), Some(b"v".to_vec()));
    }

    #[test]
    fn test_corrupt_snapshot_starts_empty() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("meta");
        fs::write(&path, b"\xff\xff\xff\xffgarbage").unwrap();

        let db = MetaDb::open(&path).unwrap();
        assert!(db.is_empty());
    }

    #[test]
    fn test_compact_commit_replaces_live_set() {
        let dir = tempdir().unwrap();
        let mut db = MetaDb::open(dir.path().join("meta")).unwrap();
        db.put(b"old".to_vec(), b"1".to_vec());

        db.compact_start().unwrap();
        db.compact_put(b"new".to_vec(), b"2".to_vec()).unwrap();

        // Reads keep seeing the live set while compact mode is active.
        assert_eq!(db.get(b"old"), Some(b"1".to_vec()));
        assert_eq!(db.get(b"new"), None);

        db.compact_end(true);
        assert_eq!(db.get(b"old"), None);
        assert_eq!(db.get(b"new"), Some(b"2".to_vec()));
    }

    #[test]
    fn test_compact_abort_discards_shadow() {
        let dir = tempdir().unwrap();
        let mut db = MetaDb::open(dir.path().join("meta")).unwrap();
        db.put(b"old".to_vec(), b"1".to_vec());

        db.compact_start().unwrap();
        db.compact_put(b"new".to_vec(), b"2".to_vec()).unwrap();
        db.compact_end(false);

        assert_eq!(db.get(b"old"), Some(b"1".to_vec()));
        assert_eq!(db.get(b"new"), None);
    }

    #[test]
    fn test_compact_mode_is_not_reentrant() {
        let dir = tempdir().unwrap();
        let mut db = MetaDb::open(dir.path().join("meta")).unwrap();
        db.compact_start().unwrap();
        assert!(db.compact_start().is_err());
        assert!(db.compact_put(b"k".to_vec(), b"v".to_vec()).is_ok());
        db.compact_end(false);
        assert!(db.compact_put(b"k".to_vec(), b"v".to_vec()).is_err());
    }
}
