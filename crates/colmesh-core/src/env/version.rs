//! Versions of query-local temporary columns.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use colmesh_proto::ColumnType;
use parking_lot::{Condvar, Mutex};

use crate::error::Error;
use crate::storage::ColumnShard;

#[derive(Default)]
struct TemporaryColumn {
    /// Oldest to newest.
    versions: Vec<Arc<ColumnShard>>,
    /// Index of the newest published version.
    published: Option<usize>,
}

/// Tracks every version of each temporary column and which one is published.
///
/// Drafts are partially computed and never handed to readers. Publishing a
/// version makes it the one every later read sees and wakes waiters.
/// Versions are kept until [`clear`](Self::clear), so a handle obtained
/// earlier stays valid.
#[derive(Default)]
pub struct ColumnVersionManager {
    columns: Mutex<HashMap<String, TemporaryColumn>>,
    published: Condvar,
}

impl ColumnVersionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a draft version. Returns its version number.
    pub fn store_draft(&self, shard: ColumnShard) -> Result<usize, Error> {
        let mut columns = self.columns.lock();
        append(&mut columns, shard)
    }

    /// Append a version and publish it. Returns its version number.
    pub fn publish(&self, shard: ColumnShard) -> Result<usize, Error> {
        let name = shard.name().to_string();
        let mut columns = self.columns.lock();
        let version = append(&mut columns, shard)?;
        if let Some(column) = columns.get_mut(&name) {
            column.published = Some(version);
        }
        drop(columns);
        self.published.notify_all();
        Ok(version)
    }

    /// Newest published version of a column.
    pub fn published(&self, name: &str) -> Option<Arc<ColumnShard>> {
        let columns = self.columns.lock();
        let column = columns.get(name)?;
        column.published.map(|v| column.versions[v].clone())
    }

    /// Version number of the newest published version.
    pub fn published_version(&self, name: &str) -> Option<usize> {
        self.columns.lock().get(name).and_then(|c| c.published)
    }

    /// Number of versions (drafts included) of a column.
    pub fn version_count(&self, name: &str) -> usize {
        self.columns.lock().get(name).map_or(0, |c| c.versions.len())
    }

    /// Whether any version of the column exists.
    pub fn contains(&self, name: &str) -> bool {
        self.columns.lock().contains_key(name)
    }

    pub fn column_type(&self, name: &str) -> Option<ColumnType> {
        self.columns
            .lock()
            .get(name)
            .and_then(|c| c.versions.first())
            .map(|s| s.column_type())
    }

    /// Block until the column has a published version.
    pub fn wait_for_published(&self, name: &str, timeout: Duration) -> Option<Arc<ColumnShard>> {
        let deadline = Instant::now() + timeout;
        let mut columns = self.columns.lock();
        loop {
            if let Some(column) = columns.get(name) {
                if let Some(v) = column.published {
                    return Some(column.versions[v].clone());
                }
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            self.published.wait_for(&mut columns, deadline - now);
        }
    }

    /// Drop every version of every column. Returns the number of versions dropped.
    pub fn clear(&self) -> usize {
        let mut columns = self.columns.lock();
        let dropped = columns.values().map(|c| c.versions.len()).sum();
        columns.clear();
        dropped
    }
}

fn append(columns: &mut HashMap<String, TemporaryColumn>, shard: ColumnShard) -> Result<usize, Error> {
    let column = columns.entry(shard.name().to_string()).or_default();
    if let Some(first) = column.versions.first() {
        if first.column_type() != shard.column_type() {
            return Err(Error::TypeMismatch {
                column: shard.name().to_string(),
                expected: first.column_type().to_string(),
                actual: shard.column_type().to_string(),
            });
        }
    }
    column.versions.push(Arc::new(shard));
    Ok(column.versions.len() - 1)
}
