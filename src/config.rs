use std::path::PathBuf;
use std::time::Duration;

/// Directory under the root that holds AVS files and their symlinks.
pub const OBJECT_DIR: &str = "object";
/// Directory under the root that holds per-container stats files.
pub const STATE_DIR: &str = "state";
/// Directory under the root that holds metadata index snapshots.
pub const METADATA_DIR: &str = "metadata";

/// Configuration for one container worker.
#[derive(Debug, Clone)]
pub struct Config {
    /// Root directory for the node's storage tree.
    pub root: PathBuf,

    /// Container identifier, used for the stats file and the lock file.
    pub id: String,

    /// Sequence number of this container on the node; names the AVS file.
    pub seq_no: u64,

    /// Identifier of the metadata index partition backing this container.
    pub meta_db_id: String,

    /// Reply deadline for every operation except compaction (default: 30s).
    pub request_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            root: PathBuf::from("./avstore"),
            id: "0".to_string(),
            seq_no: 0,
            meta_db_id: "0".to_string(),
            request_timeout: Duration::from_secs(30),
        }
    }
}

impl Config {
    /// Create a new config rooted at the given directory.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ..Default::default()
        }
    }

    /// Set the container identifier.
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Set the container sequence number.
    pub fn seq_no(mut self, seq_no: u64) -> Self {
        self.seq_no = seq_no;
        self
    }

    /// Set the metadata index partition identifier.
    pub fn meta_db_id(mut self, meta_db_id: impl Into<String>) -> Self {
        self.meta_db_id = meta_db_id.into();
        self
    }

    /// Set the request reply deadline.
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Stable public path of the AVS file: a symlink whose target is the
    /// currently live raw file.
    pub fn stable_path(&self) -> PathBuf {
        self.root
            .join(OBJECT_DIR)
            .join(format!("{}.avs", self.seq_no))
    }

    /// Path of the stats property file for this container.
    pub fn stats_path(&self) -> PathBuf {
        self.root.join(STATE_DIR).join(&self.id)
    }

    /// Path of the metadata index snapshot for this container.
    pub fn metadb_path(&self) -> PathBuf {
        self.root.join(METADATA_DIR).join(&self.meta_db_id)
    }

    /// Path of the container lock file.
    pub fn lock_path(&self) -> PathBuf {
        self.root.join(format!("{}.lock", self.id))
    }
}
