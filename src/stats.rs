use std::collections::VecDeque;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// The history ring keeps this many entries, newest first.
pub const MAX_COMPACTION_HISTORIES: usize = 7;

/// One compaction run. `end == 0` marks a run still in flight.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CompactionHistory {
    pub start: u64,
    pub end: u64,
}

/// Per-container counters, persisted across restarts as a property file.
///
/// `total_*` count every write ever performed; `active_*` count live
/// records and their bytes. The counters are signed: the delete accounting
/// subtracts both the tombstone and the old record from `active_sizes`,
/// which can take it below zero.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageStats {
    pub id: String,
    /// Stable AVS path, for operator-facing reporting. Not persisted: it is
    /// derived from the container config at init.
    pub file_path: String,
    pub total_sizes: i64,
    pub active_sizes: i64,
    pub total_num: i64,
    pub active_num: i64,
    pub compaction_histories: VecDeque<CompactionHistory>,
    /// Sticky degraded flag, cleared only by restart.
    pub has_error: bool,
}

impl StorageStats {
    pub fn new(id: impl Into<String>, file_path: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            file_path: file_path.into(),
            total_sizes: 0,
            active_sizes: 0,
            total_num: 0,
            active_num: 0,
            compaction_histories: VecDeque::new(),
            has_error: false,
        }
    }

    /// Opens a history entry for a compaction starting now. The oldest
    /// entry falls off the back when the ring is full.
    pub fn begin_compaction(&mut self, start: u64) {
        while self.compaction_histories.len() >= MAX_COMPACTION_HISTORIES {
            self.compaction_histories.pop_back();
        }
        self.compaction_histories
            .push_front(CompactionHistory { start, end: 0 });
    }

    /// Closes the in-flight history entry, if one is open.
    pub fn finish_compaction(&mut self, end: u64) {
        if let Some(front) = self.compaction_histories.front_mut() {
            if front.end == 0 {
                front.end = end;
            }
        }
    }

    /// A committed compaction leaves only the copied live set, so totals
    /// collapse onto the active figures.
    pub fn apply_compaction(&mut self, num_active: i64, size_active: i64) {
        self.total_num = num_active;
        self.active_num = num_active;
        self.total_sizes = size_active;
        self.active_sizes = size_active;
    }

    /// Loads stats from the property file at `path`. Missing file, missing
    /// keys and malformed values all fall back to zeroes: init never fails
    /// on stats.
    pub fn load(id: impl Into<String>, file_path: impl Into<String>, path: &Path) -> Self {
        let mut stats = Self::new(id, file_path);
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(_) => return stats,
        };

        for line in content.lines() {
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            match key.trim() {
                "total_sizes" => stats.total_sizes = value.trim().parse().unwrap_or(0),
                "active_sizes" => stats.active_sizes = value.trim().parse().unwrap_or(0),
                "total_num" => stats.total_num = value.trim().parse().unwrap_or(0),
                "active_num" => stats.active_num = value.trim().parse().unwrap_or(0),
                "has_error" => stats.has_error = value.trim() == "true",
                "compaction_histories" => {
                    stats.compaction_histories = parse_histories(value.trim());
                }
                _ => {}
            }
        }
        stats
    }

    /// Writes the property file atomically (temp + rename), creating the
    /// parent directory when needed.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let histories = self
            .compaction_histories
            .iter()
            .map(|h| format!("{}:{}", h.start, h.end))
            .collect::<Vec<_>>()
            .join(",");

        let content = format!(
            "id={}\ntotal_sizes={}\nactive_sizes={}\ntotal_num={}\nactive_num={}\ncompaction_histories={}\nhas_error={}\n",
            self.id,
            self.total_sizes,
            self.active_sizes,
            self.total_num,
            self.active_num,
            histories,
            self.has_error,
        );

        let tmp = path.with_extension("tmp");
        fs::write(&tmp, content)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }
}

fn parse_histories(value: &str) -> VecDeque<CompactionHistory> {
    value
        .split(',')
        .filter(|part| !part.is_empty())
        .filter_map(|part| {
            let (start, end) = part.split_once(':')?;
            Some(CompactionHistory {
                start: start.parse().ok()?,
                end: end.parse().ok()?,
            })
        })
        .take(MAX_COMPACTION_HISTORIES)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_save_load_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state").join("w0");

        let mut stats = StorageStats::new("w0", "/d/object/0.avs");
        stats.total_sizes = 1024;
        stats.active_sizes = -56;
        stats.total_num = 10;
        stats.active_num = 7;
        stats.has_error = true;
        stats.begin_compaction(100);
        stats.finish_compaction(110);
        stats.save(&path).unwrap();

        let loaded = StorageStats::load("w0", "/d/object/0.avs", &path);
        assert_eq!(loaded, stats);
    }

    #[test]
    fn test_load_missing_file_is_zeroed() {
        let dir = tempdir().unwrap();
        let stats = StorageStats::load("w0", "/d/0.avs", &dir.path().join("absent"));
        assert_eq!(stats.total_num, 0);
        assert_eq!(stats.active_sizes, 0);
        assert!(!stats.has_error);
        assert!(stats.compaction_histories.is_empty());
    }

    #[test]
    fn test_load_tolerates_missing_and_garbage_keys() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("w0");
        fs::write(
            &path,
            "total_num=5\nbogus_key=1\nactive_sizes=not-a-number\nno equals here\n",
        )
        .unwrap();

        let stats = StorageStats::load("w0", "/d/0.avs", &path);
        assert_eq!(stats.total_num, 5);
        assert_eq!(stats.active_sizes, 0);
    }

    #[test]
    fn test_history_ring_is_bounded_newest_first() {
        let mut stats = StorageStats::new("w0", "/d/0.avs");
        for i in 0..10u64 {
            stats.begin_compaction(i);
            stats.finish_compaction(i + 100);
        }

        assert_eq!(stats.compaction_histories.len(), MAX_COMPACTION_HISTORIES);
        // Newest run at index 0, oldest runs evicted from the back.
        assert_eq!(stats.compaction_histories[0].start, 9);
        assert_eq!(stats.compaction_histories[6].start, 3);
    }

    #[test]
    fn test_finish_only_closes_in_flight_entry() {
        let mut stats = StorageStats::new("w0", "/d/0.avs");
        stats.begin_compaction(1);
        stats.finish_compaction(2);
        stats.finish_compaction(99);
        assert_eq!(stats.compaction_histories[0].end, 2);
    }

    #[test]
    fn test_apply_compaction_collapses_totals() {
        let mut stats = StorageStats::new("w0", "/d/0.avs");
        stats.total_num = 10;
        stats.total_sizes = 1000;
        stats.active_num = 4;
        stats.active_sizes = 400;

        stats.apply_compaction(4, 400);
        assert_eq!(stats.total_num, 4);
        assert_eq!(stats.total_sizes, 400);
    }
}
