//! Concatenating standard shards into one flattened shard.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::debug;

use super::column::{
    rename_pages, shift_pages, FlattenProvenance, FlattenedColumnShard, StandardColumnShard,
};
use super::dictionary::Dictionary;
use super::page::ColumnPage;
use crate::error::Error;

/// Concatenate shards of one column, in the given order, into one shard
/// named `name` starting at `first_row_id`.
///
/// The source dictionaries are merged; every page is re-encoded against the
/// merged dictionary as an adjustable page and then moved behind the pages of
/// the previous source.
pub fn concat_shards(
    name: &str,
    shards: &[&StandardColumnShard],
    first_row_id: u64,
    flatten_id: u64,
) -> Result<FlattenedColumnShard, Error> {
    let first = shards
        .first()
        .ok_or_else(|| Error::InvalidShard("nothing to concatenate".to_string()))?;

    let mut dictionary = Dictionary::new(first.column_type());
    let mut pages = BTreeMap::new();
    let mut cursor = first_row_id;

    for shard in shards {
        let remap = dictionary.merge(shard.dictionary())?;

        let mut reencoded = BTreeMap::new();
        for page in shard.pages().values() {
            let ids: Vec<u32> = page
                .decode_ids()
                .into_iter()
                .map(|id| remap[id as usize])
                .collect();
            let page = ColumnPage::encode(page.column(), page.first_row_id(), &ids, true);
            reencoded.insert(page.first_row_id(), page);
        }

        shift_pages(&mut reencoded, shard.first_row_id(), cursor)?;
        rename_pages(&mut reencoded, name)?;
        pages.extend(reencoded);
        cursor += shard.len();
    }
    dictionary.seal();

    debug!(
        column = name,
        sources = shards.len(),
        rows = cursor - first_row_id,
        dictionary_size = dictionary.len(),
        "Flattened column shards"
    );

    let inner = StandardColumnShard::new(
        name,
        first_row_id,
        cursor - first_row_id,
        pages,
        Arc::new(dictionary),
    )?;
    Ok(FlattenedColumnShard::new(
        inner,
        FlattenProvenance {
            source_column: first.name().to_string(),
            flatten_id,
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{ColumnShard, ColumnShardBuilder};
    use colmesh_proto::{ColumnType, Value};

    fn strings(first: u64, values: &[&str]) -> StandardColumnShard {
        let mut builder = ColumnShardBuilder::new("tags", ColumnType::String, first).with_page_size(2);
        builder.extend(values.iter().map(|v| Value::from(*v))).unwrap();
        builder.build().unwrap()
    }

    #[test]
    fn test_concat_remaps_and_repositions() {
        let a = strings(100, &["x", "y", "x"]);
        let b = strings(500, &["z", "x"]);

        let flat = concat_shards("tags_flat", &[&a, &b], 0, 9).unwrap();
        let shard = ColumnShard::Flattened(flat.clone());

        assert_eq!(shard.first_row_id(), 0);
        assert_eq!(shard.len(), 5);
        assert_eq!(shard.name(), "tags_flat");
        let values = shard.resolve_range(0, 5).unwrap();
        let expected: Vec<Value> = ["x", "y", "x", "z", "x"].into_iter().map(Value::from).collect();
        assert_eq!(values, expected);

        assert_eq!(flat.inner().dictionary().len(), 3);
        assert!(flat.inner().pages().values().all(|p| p.column() == "tags_flat"));
        assert_eq!(flat.provenance().source_column, "tags");
        assert_eq!(flat.provenance().flatten_id, 9);
    }

    #[test]
    fn test_concat_rejects_mixed_types() {
        let a = strings(0, &["x"]);
        let mut builder = ColumnShardBuilder::new("tags", ColumnType::Long, 1);
        builder.push(Value::Long(1)).unwrap();
        let b = builder.build().unwrap();

        assert!(matches!(
            concat_shards("f", &[&a, &b], 0, 1),
            Err(Error::TypeMismatch { .. })
        ));
        assert!(concat_shards("f", &[], 0, 1).is_err());
    }
}
