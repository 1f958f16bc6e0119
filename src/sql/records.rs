// SPDX-License-Identifier: Apache-2.0

//! Done-records: the persisted set of `(database, table)` pairs already
//! fully consumed. Restored on start so finished tables are skipped; new
//! completions are appended on every meta sync.

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::sync::RwLock;

use tracing::{debug, warn};

use crate::error::Result;
use crate::meta::Meta;

pub const SQL_OFFSET_CONNECTOR: &str = "##";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TableInfo {
    pub size: i64,
    pub offset: i64,
}

/// Concurrent map of database -> table -> consumption info.
#[derive(Default)]
pub struct DbRecords {
    inner: RwLock<HashMap<String, HashMap<String, TableInfo>>>,
}

impl DbRecords {
    pub fn set(&self, database: &str, table: &str, info: TableInfo) {
        let mut map = self.inner.write().expect("db records poisoned");
        map.entry(database.to_string())
            .or_default()
            .insert(table.to_string(), info);
    }

    pub fn get(&self, database: &str, table: &str) -> Option<TableInfo> {
        let map = self.inner.read().expect("db records poisoned");
        map.get(database).and_then(|t| t.get(table)).copied()
    }

    pub fn contains(&self, database: &str, table: &str) -> bool {
        self.get(database, table).is_some()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().expect("db records poisoned").is_empty()
    }

    pub fn reset(&self) {
        self.inner.write().expect("db records poisoned").clear();
    }

    /// Sum of recorded table sizes. Entries with an unknown size (-1) do
    /// not contribute.
    pub fn total_size(&self) -> i64 {
        let map = self.inner.read().expect("db records poisoned");
        map.values()
            .flat_map(|tables| tables.values())
            .filter(|info| info.size > 0)
            .map(|info| info.size)
            .sum()
    }

    /// Render every record as persistable lines:
    /// `db##table,size,offset,timestamp@`.
    pub fn snapshot_lines(&self, timestamp: &str) -> String {
        let map = self.inner.read().expect("db records poisoned");
        let mut out = String::new();
        for (database, tables) in map.iter() {
            for (table, info) in tables.iter() {
                out.push_str(&format!(
                    "{}{}{},{},{},{}@\n",
                    database, SQL_OFFSET_CONNECTOR, table, info.size, info.offset, timestamp
                ));
            }
        }
        out
    }
}

/// Result of restoring the done-records file.
pub struct RestoredRecords {
    pub records: DbRecords,
    pub last_database: Option<String>,
    pub last_table: Option<String>,
    /// True when there was nothing (or nothing usable) to restore.
    pub omitted: bool,
}

/// Load the done-records file from the meta directory. Unparseable lines
/// are skipped; a missing file simply means a fresh start.
pub fn restore_records(meta: &Meta) -> RestoredRecords {
    let records = DbRecords::default();
    let path = meta.done_file_path();
    let raw = match std::fs::read_to_string(&path) {
        Ok(s) => s,
        Err(e) => {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("cannot read done records {}: {}", path.display(), e);
            }
            return RestoredRecords {
                records,
                last_database: None,
                last_table: None,
                omitted: true,
            };
        }
    };

    let mut last_database = None;
    let mut last_table = None;
    let mut restored = 0usize;
    for line in raw.lines() {
        let Some((database, rest)) = line.split_once(SQL_OFFSET_CONNECTOR) else {
            debug!("skipping malformed done record {:?}", line);
            continue;
        };
        let mut fields = rest.split(',');
        let Some(table) = fields.next() else { continue };
        let size = fields
            .next()
            .and_then(|s| s.parse::<i64>().ok())
            .unwrap_or(-1);
        let offset = fields
            .next()
            .and_then(|s| s.parse::<i64>().ok())
            .unwrap_or(-1);
        records.set(database, table, TableInfo { size, offset });
        last_database = Some(database.to_string());
        last_table = Some(table.to_string());
        restored += 1;
    }

    RestoredRecords {
        omitted: restored == 0,
        records,
        last_database,
        last_table,
    }
}

/// Append rendered record lines to the done file and fsync it.
pub fn append_records_file(path: &Path, content: &str) -> Result<()> {
    let mut f = OpenOptions::new().create(true).append(true).open(path)?;
    f.write_all(content.as_bytes())?;
    f.sync_all()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn records_round_trip_through_done_file() {
        let dir = TempDir::new().unwrap();
        let meta = Meta::new(dir.path().join("m"), "r", "sql").unwrap();

        let records = DbRecords::default();
        records.set("db1", "t_202401", TableInfo { size: 10, offset: -1 });
        records.set("db1", "t_202402", TableInfo { size: 20, offset: -1 });

        let lines = records.snapshot_lines("2024-03-07 00:00:00");
        append_records_file(&meta.done_file_path(), &lines).unwrap();

        let restored = restore_records(&meta);
        assert!(!restored.omitted);
        assert_eq!(
            restored.records.get("db1", "t_202401"),
            Some(TableInfo { size: 10, offset: -1 })
        );
        assert!(restored.records.contains("db1", "t_202402"));
        assert_eq!(restored.last_database.as_deref(), Some("db1"));
    }

    #[test]
    fn total_size_skips_unknown_entries() {
        let records = DbRecords::default();
        records.set("db1", "t1", TableInfo { size: 10, offset: -1 });
        records.set("db1", "t2", TableInfo { size: 5, offset: -1 });
        records.set("db2", "t3", TableInfo { size: -1, offset: -1 });
        assert_eq!(records.total_size(), 15);

        // overwriting an entry replaces its contribution
        records.set("db1", "t1", TableInfo { size: 12, offset: -1 });
        assert_eq!(records.total_size(), 17);
    }

    #[test]
    fn missing_file_is_omitted() {
        let dir = TempDir::new().unwrap();
        let meta = Meta::new(dir.path().join("m"), "r", "sql").unwrap();
        let restored = restore_records(&meta);
        assert!(restored.omitted);
        assert!(restored.records.is_empty());
    }

    #[test]
    fn malformed_lines_are_skipped() {
        let dir = TempDir::new().unwrap();
        let meta = Meta::new(dir.path().join("m"), "r", "sql").unwrap();
        append_records_file(
            &meta.done_file_path(),
            "garbage line\ndb##t,5,-1,2024@\n",
        )
        .unwrap();
        let restored = restore_records(&meta);
        assert!(!restored.omitted);
        assert!(restored.records.contains("db", "t"));
    }
}
