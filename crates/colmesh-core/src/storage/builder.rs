//! Building standard column shards from decoded values.

use std::collections::BTreeMap;
use std::sync::Arc;

use colmesh_proto::{ColumnType, Value};

use super::column::{ColumnShard, StandardColumnShard};
use super::dictionary::{describe_type, Dictionary};
use super::page::{ColumnPage, DEFAULT_PAGE_SIZE};
use crate::error::Error;

/// Accumulates values of one column and encodes them into pages.
///
/// ```ignore
/// let mut builder = ColumnShardBuilder::new("age", ColumnType::Long, 0).with_page_size(256);
/// builder.extend(ages)?;
/// let shard = builder.build_shard()?;
/// ```
#[derive(Debug)]
pub struct ColumnShardBuilder {
    name: String,
    column_type: ColumnType,
    first_row_id: u64,
    page_size: usize,
    adjustable: bool,
    dictionary: Dictionary,
    ids: Vec<u32>,
}

impl ColumnShardBuilder {
    /// Start a shard whose first row is `first_row_id`.
    pub fn new(name: impl Into<String>, column_type: ColumnType, first_row_id: u64) -> Self {
        Self {
            name: name.into(),
            column_type,
            first_row_id,
            page_size: DEFAULT_PAGE_SIZE,
            adjustable: false,
            dictionary: Dictionary::new(column_type),
            ids: Vec::new(),
        }
    }

    /// Rows per page. Zero is treated as one.
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Whether the built pages may later be repositioned.
    pub fn adjustable_pages(mut self, adjustable: bool) -> Self {
        self.adjustable = adjustable;
        self
    }

    /// Append the value of the next row.
    pub fn push(&mut self, value: Value) -> Result<(), Error> {
        if value.column_type() != Some(self.column_type) {
            return Err(Error::TypeMismatch {
                column: self.name.clone(),
                expected: self.column_type.to_string(),
                actual: describe_type(&value),
            });
        }
        let id = self.dictionary.get_or_insert(value)?;
        self.ids.push(id);
        Ok(())
    }

    /// Append several rows.
    pub fn extend(&mut self, values: impl IntoIterator<Item = Value>) -> Result<(), Error> {
        for value in values {
            self.push(value)?;
        }
        Ok(())
    }

    /// Rows pushed so far.
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Encode pages, seal the dictionary and validate the result.
    pub fn build(self) -> Result<StandardColumnShard, Error> {
        let Self {
            name,
            first_row_id,
            page_size,
            adjustable,
            mut dictionary,
            ids,
            ..
        } = self;

        let mut pages = BTreeMap::new();
        let mut start = first_row_id;
        for chunk in ids.chunks(page_size) {
            pages.insert(start, ColumnPage::encode(name.as_str(), start, chunk, adjustable));
            start += chunk.len() as u64;
        }
        dictionary.seal();

        StandardColumnShard::new(name, first_row_id, ids.len() as u64, pages, Arc::new(dictionary))
    }

    /// Build and wrap as a [`ColumnShard`].
    pub fn build_shard(self) -> Result<ColumnShard, Error> {
        Ok(ColumnShard::Standard(self.build()?))
    }
}
