use std::collections::BTreeMap;

use serde_json::Value;

use crate::error::{Error, Result};
use crate::record::Record;
use crate::value::IndexValue;

/// Describes one secondary index. The primary index always exists with
/// `field_name = "_id"`, `unique = true`, `sparse = false`, and is carried
/// as an ordinary [`Index::Unique`] like any other — `IndexSet` just never
/// lets it be removed.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct IndexDescriptor {
    pub field_name: String,
    #[serde(default)]
    pub unique: bool,
    #[serde(default)]
    pub sparse: bool,
}

impl IndexDescriptor {
    pub fn new(field_name: impl Into<String>) -> Self {
        Self {
            field_name: field_name.into(),
            unique: false,
            sparse: false,
        }
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn sparse(mut self) -> Self {
        self.sparse = true;
        self
    }
}

/// One secondary (or primary) index. A closed sum type — the set of
/// variants (unique vs. multi-valued) is fixed, so a plain enum plays
/// better than dynamic dispatch here.
#[derive(Debug)]
pub enum Index {
    Unique(UniqueIndex),
    Multi(MultiIndex),
}

impl Index {
    pub fn new(descriptor: IndexDescriptor) -> Self {
        if descriptor.unique {
            Index::Unique(UniqueIndex::new(descriptor))
        } else {
            Index::Multi(MultiIndex::new(descriptor))
        }
    }

    pub fn descriptor(&self) -> &IndexDescriptor {
        match self {
            Index::Unique(i) => &i.descriptor,
            Index::Multi(i) => &i.descriptor,
        }
    }

    pub fn field_name(&self) -> &str {
        &self.descriptor().field_name
    }

    /// Link `record` into the index. Fails with `KeyViolation` if a unique
    /// index already holds a different record under the derived key(s).
    pub fn add(&mut self, record: &Record) -> Result<()> {
        match self {
            Index::Unique(i) => i.add(record),
            Index::Multi(i) => {
                i.add(record);
                Ok(())
            }
        }
    }

    /// Unlink `record`. A no-op if the record linked under the derived
    /// key is not (structurally) the one passed in — this guards against
    /// false removals during `IndexSet` rollback.
    pub fn remove(&mut self, record: &Record) {
        match self {
            Index::Unique(i) => i.remove(record),
            Index::Multi(i) => i.remove(record),
        }
    }

    pub fn find(&self, value: &Value) -> Vec<Record> {
        match self {
            Index::Unique(i) => i.find(value).into_iter().collect(),
            Index::Multi(i) => i.find(value),
        }
    }

    pub fn find_one(&self, value: &Value) -> Option<Record> {
        match self {
            Index::Unique(i) => i.find(value),
            Index::Multi(i) => i.find(value).into_iter().next(),
        }
    }

    pub fn clear(&mut self) {
        match self {
            Index::Unique(i) => i.map.clear(),
            Index::Multi(i) => i.map.clear(),
        }
    }

    /// All distinct records currently linked in this index, deduplicated
    /// (a record can be linked under several keys via array fan-out).
    pub fn dump(&self) -> Vec<Record> {
        match self {
            Index::Unique(i) => {
                let mut seen: Vec<Record> = Vec::new();
                for record in i.map.values() {
                    if !seen.contains(record) {
                        seen.push(record.clone());
                    }
                }
                seen
            }
            Index::Multi(i) => {
                let mut seen: Vec<Record> = Vec::new();
                for bucket in i.map.values() {
                    for record in bucket {
                        if !seen.contains(record) {
                            seen.push(record.clone());
                        }
                    }
                }
                seen
            }
        }
    }
}

/// Derive the set of keys a record should be linked under for a given
/// field path. An array value fans out to one key per element. A missing
/// or null value yields no keys when `sparse`, or a single `Null` key
/// (queryable) otherwise.
fn index_keys(value: Option<&Value>, sparse: bool) -> Vec<IndexValue> {
    match value {
        None | Some(Value::Null) => {
            if sparse {
                vec![]
            } else {
                vec![IndexValue::Null]
            }
        }
        Some(Value::Array(items)) => items.iter().map(IndexValue::from_json).collect(),
        Some(other) => vec![IndexValue::from_json(other)],
    }
}

#[derive(Debug)]
pub struct UniqueIndex {
    descriptor: IndexDescriptor,
    map: BTreeMap<IndexValue, Record>,
}

impl UniqueIndex {
    fn new(descriptor: IndexDescriptor) -> Self {
        Self {
            descriptor,
            map: BTreeMap::new(),
        }
    }

    fn add(&mut self, record: &Record) -> Result<()> {
        let value = record.get_field(&self.descriptor.field_name);
        let keys = index_keys(value, self.descriptor.sparse);

        for key in &keys {
            if let Some(existing) = self.map.get(key) {
                if existing != record {
                    return Err(Error::KeyViolation {
                        field: self.descriptor.field_name.clone(),
                        record: record.clone(),
                    });
                }
            }
        }
        for key in keys {
            self.map.insert(key, record.clone());
        }
        Ok(())
    }

    fn remove(&mut self, record: &Record) {
        let value = record.get_field(&self.descriptor.field_name);
        for key in index_keys(value, self.descriptor.sparse) {
            if self.map.get(&key) == Some(record) {
                self.map.remove(&key);
            }
        }
    }

    fn find(&self, value: &Value) -> Option<Record> {
        self.map.get(&IndexValue::from_json(value)).cloned()
    }
}

#[derive(Debug)]
pub struct MultiIndex {
    descriptor: IndexDescriptor,
    map: BTreeMap<IndexValue, Vec<Record>>,
}

impl MultiIndex {
    fn new(descriptor: IndexDescriptor) -> Self {
        Self {
            descriptor,
            map: BTreeMap::new(),
        }
    }

    fn add(&mut self, record: &Record) {
        let value = record.get_field(&self.descriptor.field_name);
        for key in index_keys(value, self.descriptor.sparse) {
            let bucket = self.map.entry(key).or_default();
            if !bucket.contains(record) {
                bucket.push(record.clone());
            }
        }
    }

    fn remove(&mut self, record: &Record) {
        let value = record.get_field(&self.descriptor.field_name);
        for key in index_keys(value, self.descriptor.sparse) {
            if let Some(bucket) = self.map.get_mut(&key) {
                bucket.retain(|r| r != record);
                if bucket.is_empty() {
                    self.map.remove(&key);
                }
            }
        }
    }

    fn find(&self, value: &Value) -> Vec<Record> {
        self.map
            .get(&IndexValue::from_json(value))
            .cloned()
            .unwrap_or_default()
    }
}
