//! sled-backed shard storage.
//!
//! Two trees are used:
//!
//! - `shards`: shard key -> rkyv-encoded [`TableShard`]
//! - `columns`: shard key + column name -> rkyv-encoded column record
//!
//! Shard keys are `[table_len:2][table][first_row_id:8]`, big-endian, so a
//! prefix scan over `[table_len][table]` yields a table's shards in row order.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use colmesh_proto::{ColumnType, ShardId, Value};
use rkyv::{Archive, Deserialize, Serialize};
use sled::{Db, Tree};
use tracing::debug;

use super::column::{
    ColumnShard, ConstantColumnShard, FlattenProvenance, FlattenedColumnShard, StandardColumnShard,
};
use super::dictionary::Dictionary;
use super::page::ColumnPage;
use super::shard_storage::{admit_column, ShardStorage};
use super::table::TableShard;
use crate::error::Error;

const SHARDS_TREE: &str = "shards";
const COLUMNS_TREE: &str = "columns";

/// Configuration for the sled shard store.
#[derive(Debug, Clone)]
pub struct SledStorageConfig {
    /// Path to the database directory.
    pub path: PathBuf,
    /// Page cache capacity in bytes.
    pub cache_capacity: u64,
    /// Enable zstd compression.
    pub compression: bool,
    /// Temporary database (deleted on drop).
    pub temporary: bool,
}

impl Default for SledStorageConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./colmesh_data"),
            cache_capacity: 256 * 1024 * 1024,
            compression: true,
            temporary: false,
        }
    }
}

impl SledStorageConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }

    /// A throwaway database for tests.
    pub fn temporary() -> Self {
        Self {
            path: PathBuf::from(""),
            temporary: true,
            ..Default::default()
        }
    }

    fn to_sled_config(&self) -> sled::Config {
        let config = sled::Config::new()
            .cache_capacity(self.cache_capacity)
            .use_compression(self.compression);
        if self.temporary {
            config.temporary(true)
        } else {
            config.path(&self.path)
        }
    }
}

/// Shard storage persisted in sled.
pub struct SledShardStorage {
    db: Db,
    shards: Tree,
    columns: Tree,
}

impl SledShardStorage {
    /// Open or create the store.
    pub fn open(config: &SledStorageConfig) -> Result<Self, Error> {
        let db = config.to_sled_config().open()?;
        let shards = db.open_tree(SHARDS_TREE)?;
        let columns = db.open_tree(COLUMNS_TREE)?;
        Ok(Self { db, shards, columns })
    }

    /// Flush pending writes to disk.
    pub fn flush(&self) -> Result<(), Error> {
        self.db.flush()?;
        Ok(())
    }

    fn read_shard(&self, key: &[u8]) -> Result<Option<TableShard>, Error> {
        match self.shards.get(key)? {
            Some(bytes) => Ok(Some(decode_shard(&bytes)?)),
            None => Ok(None),
        }
    }
}

impl ShardStorage for SledShardStorage {
    fn shards_of(&self, table: &str) -> Result<Vec<TableShard>, Error> {
        let prefix = table_prefix(table);
        self.shards
            .scan_prefix(&prefix)
            .map(|item| {
                let (_, bytes) = item?;
                decode_shard(&bytes)
            })
            .collect()
    }

    fn table_shard(&self, id: &ShardId) -> Result<Option<TableShard>, Error> {
        self.read_shard(&shard_key(id))
    }

    fn load_column(&self, id: &ShardId, column: &str) -> Result<Option<ColumnShard>, Error> {
        match self.columns.get(column_key(id, column))? {
            Some(bytes) => {
                let record = decode_column(&bytes)?;
                debug!(shard = %id, column, bytes = bytes.len(), "Loaded column from storage");
                Ok(Some(record.into_column()?))
            }
            None => Ok(None),
        }
    }

    fn store_column(&self, id: &ShardId, column: &ColumnShard) -> Result<(), Error> {
        let key = shard_key(id);
        let meta = admit_column(id, self.read_shard(&key)?, column)?;

        self.columns
            .insert(column_key(id, column.name()), encode_column(&StoredColumn::from_column(column))?)?;
        self.shards.insert(key, encode_shard(&meta)?)?;
        Ok(())
    }

    fn remove_shard(&self, id: &ShardId) -> Result<bool, Error> {
        let key = shard_key(id);
        let existed = self.shards.remove(&key)?.is_some();
        for item in self.columns.scan_prefix(&key) {
            let (column_key, _) = item?;
            self.columns.remove(column_key)?;
        }
        Ok(existed)
    }
}

fn table_prefix(table: &str) -> Vec<u8> {
    let bytes = table.as_bytes();
    let mut prefix = Vec::with_capacity(2 + bytes.len());
    prefix.extend_from_slice(&(bytes.len() as u16).to_be_bytes());
    prefix.extend_from_slice(bytes);
    prefix
}

fn shard_key(id: &ShardId) -> Vec<u8> {
    let mut key = table_prefix(&id.table);
    key.extend_from_slice(&id.first_row_id.to_be_bytes());
    key
}

fn column_key(id: &ShardId, column: &str) -> Vec<u8> {
    let mut key = shard_key(id);
    key.extend_from_slice(column.as_bytes());
    key
}

fn aligned(bytes: &[u8]) -> rkyv::util::AlignedVec<16> {
    let mut aligned: rkyv::util::AlignedVec<16> = rkyv::util::AlignedVec::new();
    aligned.extend_from_slice(bytes);
    aligned
}

fn encode_shard(shard: &TableShard) -> Result<Vec<u8>, Error> {
    rkyv::to_bytes::<rkyv::rancor::Error>(shard)
        .map(|v| v.to_vec())
        .map_err(|e| Error::Serialization(e.to_string()))
}

fn decode_shard(bytes: &[u8]) -> Result<TableShard, Error> {
    rkyv::from_bytes::<TableShard, rkyv::rancor::Error>(&aligned(bytes))
        .map_err(|e| Error::Deserialization(e.to_string()))
}

fn encode_column(column: &StoredColumn) -> Result<Vec<u8>, Error> {
    rkyv::to_bytes::<rkyv::rancor::Error>(column)
        .map(|v| v.to_vec())
        .map_err(|e| Error::Serialization(e.to_string()))
}

fn decode_column(bytes: &[u8]) -> Result<StoredColumn, Error> {
    rkyv::from_bytes::<StoredColumn, rkyv::rancor::Error>(&aligned(bytes))
        .map_err(|e| Error::Deserialization(e.to_string()))
}

#[derive(Debug, Archive, Serialize, Deserialize)]
struct StoredPage {
    first_row_id: u64,
    len: u32,
    bits: u8,
    data: Vec<u8>,
    adjustable: bool,
}

#[derive(Debug, Archive, Serialize, Deserialize)]
struct StoredStandard {
    name: String,
    column_type: ColumnType,
    first_row_id: u64,
    len: u64,
    dictionary: Vec<Value>,
    pages: Vec<StoredPage>,
}

#[derive(Debug, Archive, Serialize, Deserialize)]
enum StoredColumn {
    Standard(StoredStandard),
    Constant {
        name: String,
        first_row_id: u64,
        len: u64,
        value: Value,
    },
    Flattened {
        inner: StoredStandard,
        source_column: String,
        flatten_id: u64,
    },
}

impl StoredStandard {
    fn from_shard(shard: &StandardColumnShard) -> Self {
        Self {
            name: shard.name().to_string(),
            column_type: shard.column_type(),
            first_row_id: shard.first_row_id(),
            len: shard.len(),
            dictionary: shard.dictionary().values().to_vec(),
            pages: shard
                .pages()
                .values()
                .map(|p| StoredPage {
                    first_row_id: p.first_row_id(),
                    len: p.len() as u32,
                    bits: p.bits(),
                    data: p.data().to_vec(),
                    adjustable: p.is_adjustable(),
                })
                .collect(),
        }
    }

    fn into_shard(self) -> Result<StandardColumnShard, Error> {
        let dictionary = Dictionary::from_values(self.column_type, self.dictionary)?;
        let mut pages = BTreeMap::new();
        for p in self.pages {
            let page = ColumnPage::from_parts(
                self.name.as_str(),
                p.first_row_id,
                p.len,
                p.bits,
                Bytes::from(p.data),
                p.adjustable,
            )?;
            pages.insert(page.first_row_id(), page);
        }
        StandardColumnShard::new(self.name, self.first_row_id, self.len, pages, Arc::new(dictionary))
    }
}

impl StoredColumn {
    fn from_column(column: &ColumnShard) -> Self {
        match column {
            ColumnShard::Standard(s) => StoredColumn::Standard(StoredStandard::from_shard(s)),
            ColumnShard::Constant(c) => StoredColumn::Constant {
                name: column.name().to_string(),
                first_row_id: column.first_row_id(),
                len: column.len(),
                value: c.value().clone(),
            },
            ColumnShard::Flattened(f) => StoredColumn::Flattened {
                inner: StoredStandard::from_shard(f.inner()),
                source_column: f.provenance().source_column.clone(),
                flatten_id: f.provenance().flatten_id,
            },
        }
    }

    fn into_column(self) -> Result<ColumnShard, Error> {
        Ok(match self {
            StoredColumn::Standard(s) => ColumnShard::Standard(s.into_shard()?),
            StoredColumn::Constant {
                name,
                first_row_id,
                len,
                value,
            } => ColumnShard::Constant(ConstantColumnShard::new(name, first_row_id, len, value)?),
            StoredColumn::Flattened {
                inner,
                source_column,
                flatten_id,
            } => ColumnShard::Flattened(FlattenedColumnShard::new(
                inner.into_shard()?,
                FlattenProvenance {
                    source_column,
                    flatten_id,
                },
            )),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{concat_shards, ColumnShardBuilder};

    #[test]
    fn test_shard_keys_order_by_row() {
        assert!(shard_key(&ShardId::new("t", 2)) < shard_key(&ShardId::new("t", 256)));
        assert!(column_key(&ShardId::new("t", 0), "a").starts_with(&shard_key(&ShardId::new("t", 0))));
        assert_ne!(table_prefix("ab"), table_prefix("a"));
    }

    #[test]
    fn test_roundtrip_every_variant() {
        let storage = SledShardStorage::open(&SledStorageConfig::temporary()).unwrap();
        let id = ShardId::new("t", 10);

        let mut builder = ColumnShardBuilder::new("s", ColumnType::String, 10).with_page_size(2);
        builder
            .extend(["a", "b", "a", "c", "d"].into_iter().map(Value::from))
            .unwrap();
        let standard = builder.build().unwrap();
        let flat = concat_shards("f", &[&standard], 10, 3).unwrap();

        storage.store_column(&id, &ColumnShard::Standard(standard)).unwrap();
        storage
            .store_column(
                &id,
                &ColumnShard::Constant(ConstantColumnShard::new("k", 10, 5, Value::Double(2.5)).unwrap()),
            )
            .unwrap();
        storage.store_column(&id, &ColumnShard::Flattened(flat)).unwrap();

        let s = storage.load_column(&id, "s").unwrap().unwrap();
        assert_eq!(s.resolve_range(10, 15).unwrap()[3], Value::from("c"));
        let k = storage.load_column(&id, "k").unwrap().unwrap();
        assert_eq!(k.resolve(14).unwrap(), Value::Double(2.5));
        match storage.load_column(&id, "f").unwrap().unwrap() {
            ColumnShard::Flattened(f) => {
                assert_eq!(f.provenance().flatten_id, 3);
                assert!(f.inner().pages().values().all(|p| p.is_adjustable()));
            }
            other => panic!("unexpected shard {:?}", other),
        }

        let meta = storage.table_shard(&id).unwrap().unwrap();
        assert_eq!(meta.row_count(), 5);
        assert_eq!(meta.column_type("k"), Some(ColumnType::Double));
    }

    #[test]
    fn test_remove_shard_drops_columns() {
        let storage = SledShardStorage::open(&SledStorageConfig::temporary()).unwrap();
        let id = ShardId::new("t", 0);
        let column = ColumnShard::Constant(ConstantColumnShard::new("x", 0, 3, Value::Long(1)).unwrap());
        storage.store_column(&id, &column).unwrap();
        storage
            .store_column(&ShardId::new("t", 3), &ColumnShard::Constant(
                ConstantColumnShard::new("x", 3, 3, Value::Long(1)).unwrap(),
            ))
            .unwrap();

        assert!(storage.remove_shard(&id).unwrap());
        assert!(storage.load_column(&id, "x").unwrap().is_none());
        assert_eq!(storage.shards_of("t").unwrap().len(), 1);
    }
}
