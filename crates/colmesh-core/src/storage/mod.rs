//! Column storage model.
//!
//! Columns are stored per table shard as [`ColumnShard`]s. A standard shard
//! keeps bit-packed dictionary ids in fixed-size [`ColumnPage`]s and decodes
//! them through a shared, sealed [`Dictionary`].

mod builder;
mod catalog;
mod column;
mod dictionary;
mod flatten;
mod page;
mod shard_storage;
mod sled_storage;
mod table;

pub use builder::ColumnShardBuilder;
pub use catalog::{ShardCatalog, ShardEventListener};
pub use column::{
    ColumnShard, ConstantColumnShard, FlattenProvenance, FlattenedColumnShard, StandardColumnShard,
};
pub use dictionary::Dictionary;
pub(crate) use dictionary::describe_type;
pub use flatten::concat_shards;
pub use page::{ColumnPage, DEFAULT_PAGE_SIZE};
pub use shard_storage::{MemoryShardStorage, ShardStorage};
pub use sled_storage::{SledShardStorage, SledStorageConfig};
pub use table::TableShard;
