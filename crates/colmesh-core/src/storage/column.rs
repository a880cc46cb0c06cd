//! Column shards: one column's data for the row range of a table shard.

use std::collections::BTreeMap;
use std::sync::Arc;

use colmesh_proto::{ColumnType, Value};

use super::dictionary::{describe_type, Dictionary};
use super::page::ColumnPage;
use crate::cache::CacheSize;
use crate::error::Error;

/// A column's data for the contiguous row range `[first_row_id, first_row_id + len)`.
#[derive(Debug, Clone)]
pub enum ColumnShard {
    /// Dictionary-encoded pages.
    Standard(StandardColumnShard),
    /// One value for every row.
    Constant(ConstantColumnShard),
    /// Standard layout produced by concatenating other shards.
    Flattened(FlattenedColumnShard),
}

impl ColumnShard {
    pub fn name(&self) -> &str {
        match self {
            ColumnShard::Standard(s) => s.name(),
            ColumnShard::Constant(c) => &c.name,
            ColumnShard::Flattened(f) => f.inner.name(),
        }
    }

    pub fn column_type(&self) -> ColumnType {
        match self {
            ColumnShard::Standard(s) => s.column_type(),
            ColumnShard::Constant(c) => c.column_type,
            ColumnShard::Flattened(f) => f.inner.column_type(),
        }
    }

    pub fn first_row_id(&self) -> u64 {
        match self {
            ColumnShard::Standard(s) => s.first_row_id(),
            ColumnShard::Constant(c) => c.first_row_id,
            ColumnShard::Flattened(f) => f.inner.first_row_id(),
        }
    }

    /// Number of rows.
    pub fn len(&self) -> u64 {
        match self {
            ColumnShard::Standard(s) => s.len(),
            ColumnShard::Constant(c) => c.len,
            ColumnShard::Flattened(f) => f.inner.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// One past the last row id.
    pub fn end_row_id(&self) -> u64 {
        self.first_row_id().saturating_add(self.len())
    }

    /// Decoded value of one row.
    pub fn resolve(&self, row_id: u64) -> Result<Value, Error> {
        match self {
            ColumnShard::Standard(s) => s.resolve(row_id),
            ColumnShard::Constant(c) => {
                check_range(row_id, c.first_row_id, c.len)?;
                Ok(c.value.clone())
            }
            ColumnShard::Flattened(f) => f.inner.resolve(row_id),
        }
    }

    /// Decoded values of the rows `[from, to)`, in row order.
    pub fn resolve_range(&self, from: u64, to: u64) -> Result<Vec<Value>, Error> {
        if to < from {
            return Err(Error::InvalidShard(format!("empty range [{}, {})", from, to)));
        }
        if from == to {
            return Ok(Vec::new());
        }
        match self {
            ColumnShard::Standard(s) => s.resolve_range(from, to),
            ColumnShard::Constant(c) => {
                check_range(from, c.first_row_id, c.len)?;
                check_range(to - 1, c.first_row_id, c.len)?;
                Ok(vec![c.value.clone(); (to - from) as usize])
            }
            ColumnShard::Flattened(f) => f.inner.resolve_range(from, to),
        }
    }

    /// The standard layout, if this shard has one.
    pub fn as_standard(&self) -> Option<&StandardColumnShard> {
        match self {
            ColumnShard::Standard(s) => Some(s),
            ColumnShard::Flattened(f) => Some(&f.inner),
            ColumnShard::Constant(_) => None,
        }
    }

    /// Approximate heap footprint, used by the column cache budget.
    pub fn approximate_size_in_bytes(&self) -> usize {
        match self {
            ColumnShard::Standard(s) => s.approximate_size_in_bytes(),
            ColumnShard::Constant(c) => {
                let payload = match &c.value {
                    Value::String(s) => s.len(),
                    _ => 0,
                };
                std::mem::size_of::<ConstantColumnShard>() + c.name.len() + payload
            }
            ColumnShard::Flattened(f) => {
                f.inner.approximate_size_in_bytes() + f.provenance.source_column.len() + 8
            }
        }
    }
}

impl CacheSize for ColumnShard {
    fn approximate_size_in_bytes(&self) -> usize {
        ColumnShard::approximate_size_in_bytes(self)
    }
}

fn check_range(row_id: u64, first: u64, len: u64) -> Result<(), Error> {
    match first.checked_add(len) {
        Some(end) if row_id >= first && row_id < end => Ok(()),
        end => Err(Error::RowIdOutOfRange {
            row_id,
            first,
            end: end.unwrap_or(u64::MAX),
        }),
    }
}

/// End of `[first, first + len)`, or an error when it does not fit in a row id.
fn range_end(column: &str, first: u64, len: u64) -> Result<u64, Error> {
    first.checked_add(len).ok_or_else(|| {
        Error::InvalidShard(format!(
            "column '{}': {} rows from row {} overflow the row id space",
            column, len, first
        ))
    })
}

/// Dictionary-encoded column shard.
#[derive(Debug, Clone)]
pub struct StandardColumnShard {
    name: String,
    column_type: ColumnType,
    first_row_id: u64,
    len: u64,
    pages: BTreeMap<u64, ColumnPage>,
    dictionary: Arc<Dictionary>,
}

impl StandardColumnShard {
    /// Assemble a shard, checking its page layout.
    ///
    /// Pages must be keyed by their first row id, be non-empty, and tile the
    /// shard's row range exactly. Every id must exist in the dictionary.
    pub fn new(
        name: impl Into<String>,
        first_row_id: u64,
        len: u64,
        pages: BTreeMap<u64, ColumnPage>,
        dictionary: Arc<Dictionary>,
    ) -> Result<Self, Error> {
        let shard = Self {
            name: name.into(),
            column_type: dictionary.column_type(),
            first_row_id,
            len,
            pages,
            dictionary,
        };
        shard.validate()?;
        Ok(shard)
    }

    fn validate(&self) -> Result<(), Error> {
        let end = range_end(&self.name, self.first_row_id, self.len)?;
        let mut expected = self.first_row_id;
        for (key, page) in &self.pages {
            if *key != page.first_row_id() {
                return Err(Error::InvalidShard(format!(
                    "page keyed at {} starts at {}",
                    key,
                    page.first_row_id()
                )));
            }
            if page.is_empty() {
                return Err(Error::InvalidShard(format!("empty page at row {}", key)));
            }
            if page.first_row_id() != expected {
                return Err(Error::InvalidShard(format!(
                    "column '{}': page at row {} but expected row {}",
                    self.name,
                    page.first_row_id(),
                    expected
                )));
            }
            if page.decode_ids().iter().any(|id| *id as usize >= self.dictionary.len()) {
                return Err(Error::InvalidShard(format!(
                    "column '{}': page at row {} references an unknown dictionary id",
                    self.name, key
                )));
            }
            expected = range_end(&self.name, page.first_row_id(), page.len() as u64)?;
        }
        if expected != end {
            return Err(Error::InvalidShard(format!(
                "column '{}': pages cover [{}, {}) but shard is [{}, {})",
                self.name,
                self.first_row_id,
                expected,
                self.first_row_id,
                end
            )));
        }
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn column_type(&self) -> ColumnType {
        self.column_type
    }

    pub fn first_row_id(&self) -> u64 {
        self.first_row_id
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn pages(&self) -> &BTreeMap<u64, ColumnPage> {
        &self.pages
    }

    pub fn dictionary(&self) -> &Arc<Dictionary> {
        &self.dictionary
    }

    /// Page holding a row id (floor lookup on page starts).
    pub fn page_for(&self, row_id: u64) -> Result<&ColumnPage, Error> {
        check_range(row_id, self.first_row_id, self.len)?;
        self.pages
            .range(..=row_id)
            .next_back()
            .map(|(_, page)| page)
            .filter(|page| page.contains(row_id))
            .ok_or_else(|| Error::InvalidShard(format!("no page holds row {}", row_id)))
    }

    /// Decoded value of one row.
    pub fn resolve(&self, row_id: u64) -> Result<Value, Error> {
        let page = self.page_for(row_id)?;
        let id = page
            .decode_id((row_id - page.first_row_id()) as usize)
            .ok_or_else(|| Error::InvalidShard(format!("no id for row {}", row_id)))?;
        self.lookup(id)
    }

    /// Decoded values of `[from, to)`, walking pages in order.
    pub fn resolve_range(&self, from: u64, to: u64) -> Result<Vec<Value>, Error> {
        if from >= to {
            return Ok(Vec::new());
        }
        check_range(from, self.first_row_id, self.len)?;
        check_range(to - 1, self.first_row_id, self.len)?;

        let mut out = Vec::with_capacity((to - from) as usize);
        let start = self.page_for(from)?.first_row_id();
        for page in self.pages.range(start..to).map(|(_, p)| p) {
            let lo = from.max(page.first_row_id());
            let hi = to.min(page.end_row_id());
            for row_id in lo..hi {
                let id = page
                    .decode_id((row_id - page.first_row_id()) as usize)
                    .ok_or_else(|| Error::InvalidShard(format!("no id for row {}", row_id)))?;
                out.push(self.lookup(id)?);
            }
        }
        Ok(out)
    }

    fn lookup(&self, id: u32) -> Result<Value, Error> {
        self.dictionary
            .value(id)
            .cloned()
            .ok_or_else(|| Error::InvalidShard(format!("unknown dictionary id {}", id)))
    }

    /// Shift every page so the shard starts at `new_first_row_id`.
    ///
    /// Either every page moves or none does.
    pub fn adjust_first_row_id_on_pages(&mut self, new_first_row_id: u64) -> Result<(), Error> {
        shift_pages(&mut self.pages, self.first_row_id, new_first_row_id)?;
        self.first_row_id = new_first_row_id;
        Ok(())
    }

    /// Rename the shard and every page. Either every page is renamed or none is.
    pub fn rename(&mut self, name: impl Into<String>) -> Result<(), Error> {
        let name = name.into();
        rename_pages(&mut self.pages, &name)?;
        self.name = name;
        Ok(())
    }

    /// Approximate heap footprint.
    pub fn approximate_size_in_bytes(&self) -> usize {
        let pages: usize = self
            .pages
            .values()
            .map(|p| p.approximate_size_in_bytes() + std::mem::size_of::<u64>())
            .sum();
        std::mem::size_of::<Self>() + self.name.len() + pages + self.dictionary.approximate_size_in_bytes()
    }
}

/// Move a set of pages starting at `from_first` so they start at `to_first`.
pub(crate) fn shift_pages(
    pages: &mut BTreeMap<u64, ColumnPage>,
    from_first: u64,
    to_first: u64,
) -> Result<(), Error> {
    let mut starts = Vec::with_capacity(pages.len());
    for page in pages.values() {
        page.ensure_adjustable()?;
        let start = page
            .first_row_id()
            .checked_sub(from_first)
            .and_then(|offset| to_first.checked_add(offset))
            .filter(|start| start.checked_add(page.len() as u64).is_some())
            .ok_or(Error::RowIdOutOfRange {
                row_id: page.first_row_id(),
                first: to_first,
                end: u64::MAX,
            })?;
        starts.push(start);
    }
    if from_first == to_first {
        return Ok(());
    }

    let mut shifted = BTreeMap::new();
    for ((_, mut page), start) in std::mem::take(pages).into_iter().zip(starts) {
        page.set_first_row_id(start)?;
        shifted.insert(start, page);
    }
    *pages = shifted;
    Ok(())
}

pub(crate) fn rename_pages(pages: &mut BTreeMap<u64, ColumnPage>, name: &str) -> Result<(), Error> {
    for page in pages.values() {
        page.ensure_adjustable()?;
    }
    for page in pages.values_mut() {
        page.set_column_name(name)?;
    }
    Ok(())
}

/// Column shard whose every row holds the same value.
#[derive(Debug, Clone)]
pub struct ConstantColumnShard {
    name: String,
    column_type: ColumnType,
    first_row_id: u64,
    len: u64,
    value: Value,
}

impl ConstantColumnShard {
    /// Create a constant shard. The value must be a column value.
    pub fn new(name: impl Into<String>, first_row_id: u64, len: u64, value: Value) -> Result<Self, Error> {
        let name = name.into();
        let column_type = value.column_type().ok_or_else(|| {
            Error::InvalidShard(format!(
                "constant column '{}' cannot hold a {} value",
                name,
                describe_type(&value)
            ))
        })?;
        range_end(&name, first_row_id, len)?;
        Ok(Self {
            name,
            column_type,
            first_row_id,
            len,
            value,
        })
    }

    pub fn value(&self) -> &Value {
        &self.value
    }
}

/// Where a flattened shard came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlattenProvenance {
    /// Column the concatenated shards were built from.
    pub source_column: String,
    /// Identifier of the flatten operation.
    pub flatten_id: u64,
}

/// Standard shard built by concatenation, tagged with its provenance.
#[derive(Debug, Clone)]
pub struct FlattenedColumnShard {
    pub(crate) inner: StandardColumnShard,
    pub(crate) provenance: FlattenProvenance,
}

impl FlattenedColumnShard {
    pub fn new(inner: StandardColumnShard, provenance: FlattenProvenance) -> Self {
        Self { inner, provenance }
    }

    pub fn provenance(&self) -> &FlattenProvenance {
        &self.provenance
    }

    pub fn inner(&self) -> &StandardColumnShard {
        &self.inner
    }
}
