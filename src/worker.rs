//! Per-container worker state and the object operations it serializes.
//!
//! One worker owns one AVS file, one metadata index partition and one stats
//! accumulator. It runs on a dedicated thread behind the container mailbox,
//! so nothing here needs interior locking.

use crate::codec::{self, Visitor};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::flock::ContainerLock;
use crate::handle::{self, Backend};
use crate::metadb::MetaDb;
use crate::object::{Metadata, Object};
use crate::stats::StorageStats;

pub(crate) struct Worker {
    pub(crate) config: Config,
    pub(crate) backend: Backend,
    pub(crate) metadb: MetaDb,
    pub(crate) stats: StorageStats,
    _lock: ContainerLock,
}

impl Worker {
    /// Init → Ready: lock the container, resolve the stable path (creating
    /// the raw file and symlink on first boot), open the handle pair, the
    /// index and the stats. Any failure here refuses the start.
    pub fn init(config: Config) -> Result<Self> {
        let lock = ContainerLock::lock(config.lock_path())?;

        let stable = config.stable_path();
        let backend = Backend::open(&stable)?;
        let metadb = MetaDb::open(config.metadb_path())?;
        let stats = StorageStats::load(
            &config.id,
            stable.display().to_string(),
            &config.stats_path(),
        );

        tracing::info!(
            id = %config.id,
            seq_no = config.seq_no,
            raw = %backend.file_path_raw.display(),
            "Container worker ready"
        );

        Ok(Self {
            config,
            backend,
            metadb,
            stats,
            _lock: lock,
        })
    }

    /// Probe for put: whether the key is new and how many bytes its current
    /// record occupies. Probe failures count the write as a fresh record.
    fn probe_put(&self, addr_id: u64, key: &[u8]) -> (i64, i64) {
        match codec::head(&self.metadb, addr_id, key) {
            Ok(meta) => (0, codec::calc_obj_size(meta.ksize, meta.dsize) as i64),
            Err(Error::NotFound) => (1, 0),
            Err(_) => (1, 0),
        }
    }

    /// Probe for delete: only an existing entry changes the active count.
    fn probe_delete(&self, addr_id: u64, key: &[u8]) -> (i64, i64) {
        match codec::head(&self.metadb, addr_id, key) {
            Ok(meta) => (-1, codec::calc_obj_size(meta.ksize, meta.dsize) as i64),
            Err(_) => (0, 0),
        }
    }

    pub fn put(&mut self, obj: &Object) -> Result<Metadata> {
        let (diff_rec, old_size) = self.probe_put(obj.addr_id, &obj.key);
        let new_size = codec::calc_obj_size(obj.key.len() as u32, obj.body.len() as u32) as i64;

        let reply = codec::put(&mut self.metadb, &mut self.backend, obj);
        handle::reopen_if_closed(&mut self.backend, &reply);

        if reply.is_ok() {
            self.stats.total_sizes += new_size;
            self.stats.active_sizes += new_size - old_size;
            self.stats.total_num += 1;
            self.stats.active_num += diff_rec;
        }
        reply
    }

    pub fn get(
        &mut self,
        addr_id: u64,
        key: &[u8],
        start: i64,
        end: i64,
    ) -> Result<(Metadata, Vec<u8>)> {
        let reply = codec::get(&self.metadb, &mut self.backend, addr_id, key, start, end);
        handle::reopen_if_closed(&mut self.backend, &reply);
        reply
    }

    pub fn delete(&mut self, obj: &Object) -> Result<Metadata> {
        let (diff_rec, old_size) = self.probe_delete(obj.addr_id, &obj.key);
        let new_size = codec::calc_obj_size(obj.key.len() as u32, 0) as i64;

        let reply = codec::delete(&mut self.metadb, &mut self.backend, obj);
        handle::reopen_if_closed(&mut self.backend, &reply);

        if reply.is_ok() {
            self.stats.total_sizes += new_size;
            self.stats.active_sizes += -new_size - old_size;
            self.stats.total_num += 1;
            self.stats.active_num += diff_rec;
        }
        reply
    }

    pub fn head(&self, addr_id: u64, key: &[u8]) -> Result<Metadata> {
        codec::head(&self.metadb, addr_id, key)
    }

    pub fn fetch(
        &self,
        addr_id: u64,
        key_prefix: &[u8],
        visitor: &mut dyn Visitor,
    ) -> Result<Vec<Metadata>> {
        codec::fetch(&self.metadb, addr_id, key_prefix, visitor)
    }

    pub fn store(&mut self, meta: &Metadata, body: &[u8]) -> Result<Metadata> {
        let (diff_rec, old_size) = self.probe_put(meta.addr_id, &meta.key);
        let new_size = codec::calc_obj_size(meta.key.len() as u32, body.len() as u32) as i64;

        let reply = codec::store(&mut self.metadb, &mut self.backend, meta, body);

        if reply.is_ok() {
            self.stats.total_sizes += new_size;
            self.stats.active_sizes += new_size - old_size;
            self.stats.total_num += 1;
            self.stats.active_num += diff_rec;
        }
        reply
    }

    pub fn stats(&self) -> StorageStats {
        self.stats.clone()
    }

    /// Ready → Terminating: close the handles and the index, then persist
    /// stats. Every step is best-effort so a failed close cannot lose the
    /// counters.
    pub fn terminate(&mut self) {
        if let Some(handles) = self.backend.handles.take() {
            if let Err(e) = handle::close(handles) {
                tracing::warn!(id = %self.config.id, error = %e, "Failed to close AVS handles");
            }
        }
        if let Err(e) = self.metadb.close() {
            tracing::warn!(id = %self.config.id, error = %e, "Failed to persist metadata snapshot");
        }
        if let Err(e) = self.stats.save(&self.config.stats_path()) {
            tracing::warn!(id = %self.config.id, error = %e, "Failed to persist storage stats");
        }
        tracing::info!(id = %self.config.id, "Container worker stopped");
    }
}
