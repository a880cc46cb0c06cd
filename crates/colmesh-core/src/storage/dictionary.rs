//! Value dictionaries for dictionary-encoded columns.

use std::collections::HashMap;

use colmesh_proto::{ColumnType, Value, ValueKey};

use crate::error::Error;

/// Bidirectional mapping between decoded values and dense integer ids.
///
/// Ids are assigned monotonically starting at zero, one per distinct value.
/// Once sealed the dictionary is immutable and can be shared between readers
/// without locking.
#[derive(Debug, Clone)]
pub struct Dictionary {
    column_type: ColumnType,
    values: Vec<Value>,
    ids: HashMap<ValueKey, u32>,
    sealed: bool,
}

impl Dictionary {
    /// Create an empty dictionary for one column type.
    pub fn new(column_type: ColumnType) -> Self {
        Self {
            column_type,
            values: Vec::new(),
            ids: HashMap::new(),
            sealed: false,
        }
    }

    /// Rebuild a sealed dictionary from its values in id order.
    pub fn from_values(column_type: ColumnType, values: Vec<Value>) -> Result<Self, Error> {
        let mut dictionary = Self::new(column_type);
        for value in values {
            let expected = dictionary.values.len() as u32;
            let id = dictionary.get_or_insert(value)?;
            if id != expected {
                return Err(Error::InvalidShard(format!(
                    "duplicate dictionary value at id {}",
                    expected
                )));
            }
        }
        dictionary.seal();
        Ok(dictionary)
    }

    /// Return the id of a value, assigning the next id if it is new.
    pub fn get_or_insert(&mut self, value: Value) -> Result<u32, Error> {
        if value.column_type() != Some(self.column_type) {
            return Err(Error::TypeMismatch {
                column: "<dictionary>".to_string(),
                expected: self.column_type.to_string(),
                actual: describe_type(&value),
            });
        }

        let key = ValueKey(value);
        if let Some(id) = self.ids.get(&key) {
            return Ok(*id);
        }
        if self.sealed {
            return Err(Error::DictionarySealed);
        }

        let id = self.values.len() as u32;
        self.values.push(key.value().clone());
        self.ids.insert(key, id);
        Ok(id)
    }

    /// Id of a value, if present.
    pub fn id_of(&self, value: &Value) -> Option<u32> {
        self.ids.get(&ValueKey(value.clone())).copied()
    }

    /// Value for an id.
    pub fn value(&self, id: u32) -> Option<&Value> {
        self.values.get(id as usize)
    }

    /// All values in id order.
    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn column_type(&self) -> ColumnType {
        self.column_type
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Largest assigned id, or zero for an empty dictionary.
    pub fn max_id(&self) -> u32 {
        self.values.len().saturating_sub(1) as u32
    }

    /// Freeze the dictionary.
    pub fn seal(&mut self) {
        self.sealed = true;
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    /// Add every value of `other` to this dictionary.
    ///
    /// Returns the id remapping for `other`: entry `i` is the id in `self` of
    /// the value `other` stores under id `i`.
    pub fn merge(&mut self, other: &Dictionary) -> Result<Vec<u32>, Error> {
        if other.column_type != self.column_type {
            return Err(Error::TypeMismatch {
                column: "<dictionary>".to_string(),
                expected: self.column_type.to_string(),
                actual: other.column_type.to_string(),
            });
        }
        if self.sealed && other.values.iter().any(|value| self.id_of(value).is_none()) {
            return Err(Error::DictionarySealed);
        }

        other
            .values
            .iter()
            .map(|value| self.get_or_insert(value.clone()))
            .collect()
    }

    /// Approximate heap footprint.
    pub fn approximate_size_in_bytes(&self) -> usize {
        let payload: usize = self
            .values
            .iter()
            .map(|v| match v {
                Value::String(s) => s.len(),
                Value::Bytes(b) => b.len(),
                _ => 0,
            })
            .sum();
        // each value is held twice: once in the id table and once as a map key
        let per_entry = 2 * std::mem::size_of::<Value>() + std::mem::size_of::<u32>();
        std::mem::size_of::<Self>() + payload * 2 + self.values.len() * per_entry
    }
}

pub(crate) fn describe_type(value: &Value) -> String {
    match value.column_type() {
        Some(t) => t.to_string(),
        None if value.is_null() => "null".to_string(),
        None => "bytes".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_monotonic_and_unique() {
        let mut dict = Dictionary::new(ColumnType::String);
        assert_eq!(dict.get_or_insert("b".into()).unwrap(), 0);
        assert_eq!(dict.get_or_insert("a".into()).unwrap(), 1);
        assert_eq!(dict.get_or_insert("b".into()).unwrap(), 0);
        assert_eq!(dict.len(), 2);
        assert_eq!(dict.value(1), Some(&Value::from("a")));
        assert_eq!(dict.id_of(&Value::from("b")), Some(0));
        assert_eq!(dict.max_id(), 1);
    }

    #[test]
    fn test_sealed_dictionary_rejects_new_values() {
        let mut dict = Dictionary::new(ColumnType::Long);
        dict.get_or_insert(Value::Long(4)).unwrap();
        dict.seal();

        assert_eq!(dict.get_or_insert(Value::Long(4)).unwrap(), 0);
        assert!(matches!(
            dict.get_or_insert(Value::Long(5)),
            Err(Error::DictionarySealed)
        ));
    }

    #[test]
    fn test_type_is_enforced() {
        let mut dict = Dictionary::new(ColumnType::Long);
        assert!(matches!(
            dict.get_or_insert(Value::Double(1.0)),
            Err(Error::TypeMismatch { .. })
        ));
        assert!(dict.get_or_insert(Value::Null).is_err());
    }

    #[test]
    fn test_merge_returns_remapping() {
        let mut left = Dictionary::new(ColumnType::String);
        left.get_or_insert("x".into()).unwrap();
        left.get_or_insert("y".into()).unwrap();

        let mut right = Dictionary::new(ColumnType::String);
        right.get_or_insert("z".into()).unwrap();
        right.get_or_insert("x".into()).unwrap();

        let remap = left.merge(&right).unwrap();
        assert_eq!(remap, vec![2, 0]);
        assert_eq!(left.value(2), Some(&Value::from("z")));
        assert_eq!(left.len(), 3);
    }

    #[test]
    fn test_merge_into_sealed_dictionary_is_all_or_nothing() {
        let mut left = Dictionary::new(ColumnType::String);
        left.get_or_insert("x".into()).unwrap();
        left.seal();

        let mut known = Dictionary::new(ColumnType::String);
        known.get_or_insert("x".into()).unwrap();
        assert_eq!(left.merge(&known).unwrap(), vec![0]);

        let mut mixed = Dictionary::new(ColumnType::String);
        mixed.get_or_insert("new".into()).unwrap();
        mixed.get_or_insert("x".into()).unwrap();
        mixed.get_or_insert("other".into()).unwrap();
        assert!(matches!(left.merge(&mixed), Err(Error::DictionarySealed)));
        assert_eq!(left.len(), 1);
        assert_eq!(left.id_of(&Value::from("new")), None);
    }

    #[test]
    fn test_from_values_rejects_duplicates() {
        let dict = Dictionary::from_values(ColumnType::Long, vec![Value::Long(1), Value::Long(2)]).unwrap();
        assert!(dict.is_sealed());
        assert!(Dictionary::from_values(ColumnType::Long, vec![Value::Long(1), Value::Long(1)]).is_err());
    }
}
