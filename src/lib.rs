pub mod codec;
pub mod compaction;
pub mod config;
pub mod container;
pub mod diskspace;
pub mod error;
pub mod flock;
pub mod handle;
pub mod metadb;
pub mod object;
pub mod paths;
pub mod stats;

mod worker;

pub use codec::{Decision, Visitor};
pub use compaction::Ownership;
pub use config::Config;
pub use container::Container;
pub use error::{Error, Result};
pub use object::{Metadata, Object};
pub use stats::{CompactionHistory, StorageStats};
