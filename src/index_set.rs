use std::collections::BTreeMap;

use serde_json::Value;

use crate::codec::check_reserved;
use crate::error::{Error, Result};
use crate::index::{Index, IndexDescriptor};
use crate::record::{generate_key, Record};

/// Governs how [`IndexSet::upsert`] treats the primary key already present
/// (or absent) on the candidate record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyMode {
    /// `insert`: the key must not already exist. A missing key is generated.
    MustNotExist,
    /// `update`: the key must already exist.
    MustExist,
    /// `upsert`: either is fine; a missing key is generated.
    Any,
}

/// The full set of indexes (primary + secondary) over one store's records,
/// kept mutually consistent by routing every mutation through [`upsert`] or
/// [`remove`].
///
/// Owns every `Index`; this is the only place in the crate that mutates more
/// than one index at a time, and it is the boundary at which the
/// rollback-on-`KeyViolation` guarantee is implemented.
pub struct IndexSet {
    primary_field: String,
    indexes: BTreeMap<String, Index>,
}

impl IndexSet {
    pub fn new(primary_field: impl Into<String>) -> Self {
        let primary_field = primary_field.into();
        let mut indexes = BTreeMap::new();
        indexes.insert(
            primary_field.clone(),
            Index::new(IndexDescriptor::new(primary_field.clone()).unique()),
        );
        Self {
            primary_field,
            indexes,
        }
    }

    pub fn primary_field(&self) -> &str {
        &self.primary_field
    }

    pub fn descriptors(&self) -> Vec<IndexDescriptor> {
        self.indexes.values().map(|i| i.descriptor().clone()).collect()
    }

    pub fn has_index(&self, field: &str) -> bool {
        self.indexes.contains_key(field)
    }

    /// Declare a new secondary index and back-fill it from every record
    /// currently held in the primary index.
    ///
    /// Idempotent: calling this again with a descriptor identical to one
    /// already installed (same field, `unique`, and `sparse`) is a no-op
    /// that returns `Ok(())`. A field already indexed under a *different*
    /// descriptor fails with `IndexAlreadyExists`, as does back-filling a
    /// unique index over a pre-existing duplicate, in which case the set
    /// is left unmodified (`KeyViolation`).
    pub fn add_index(&mut self, descriptor: IndexDescriptor) -> Result<()> {
        if let Some(existing) = self.indexes.get(&descriptor.field_name) {
            if existing.descriptor() == &descriptor {
                return Ok(());
            }
            return Err(Error::IndexAlreadyExists {
                field: descriptor.field_name,
            });
        }
        let mut new_index = Index::new(descriptor);
        for record in self.all() {
            if let Err(e) = new_index.add(&record) {
                return Err(e);
            }
        }
        self.indexes
            .insert(new_index.field_name().to_string(), new_index);
        Ok(())
    }

    /// Remove a secondary index. The primary index can never actually be
    /// removed — asking to remove it is a no-op, not an error, regardless
    /// of `lenient`.
    ///
    /// Otherwise fails with `NoIndex` unless `lenient` is set, in which
    /// case a missing field is silently ignored (used when replaying a log
    /// that predates this check, and by callers that opt in explicitly).
    pub fn delete_index(&mut self, field: &str, lenient: bool) -> Result<()> {
        if field == self.primary_field {
            return Ok(());
        }
        if self.indexes.remove(field).is_none() && !lenient {
            return Err(Error::NoIndex {
                field: field.to_string(),
            });
        }
        Ok(())
    }

    /// Insert, update, or upsert `data` depending on `mode`, keeping every
    /// index consistent.
    ///
    /// Algorithm: normalize and freeze the candidate record (generating a
    /// primary key if needed), remove any existing record under that key
    /// from every index, then add the new record to every index in turn.
    /// If a secondary index rejects the add with `KeyViolation`, every
    /// index already touched in this call (including the just-removed old
    /// record) is rolled back to its prior state before the error
    /// propagates, so a failed mutation is invisible.
    pub fn upsert(&mut self, mut data: Value, mode: KeyMode) -> Result<Record> {
        let map = data
            .as_object_mut()
            .ok_or(Error::NotAnObject)?;

        let existing_key = map.get(&self.primary_field).cloned();

        let key = match (mode, existing_key) {
            (KeyMode::MustExist, None) => {
                let tmp = Record::new(data.clone())?;
                return Err(Error::NotExists { record: tmp });
            }
            (KeyMode::MustExist, Some(k)) => k,
            (KeyMode::MustNotExist, Some(k)) => {
                if self.find_primary(&k).is_some() {
                    let tmp = Record::new(data.clone())?;
                    return Err(Error::KeyViolation {
                        field: self.primary_field.clone(),
                        record: tmp,
                    });
                }
                k
            }
            (KeyMode::MustNotExist, None) | (KeyMode::Any, None) => {
                self.generate_primary_key(&data)?
            }
            (KeyMode::Any, Some(k)) => k,
        };

        data.as_object_mut()
            .unwrap()
            .insert(self.primary_field.clone(), key.clone());
        let record = Record::new(data)?;
        check_reserved(&record)?;

        if mode == KeyMode::MustExist && self.find_primary(&key).is_none() {
            return Err(Error::NotExists { record });
        }

        let old = self.find_primary(&key);

        let mut touched: Vec<&mut Index> = self.indexes.values_mut().collect();
        let mut applied = 0usize;
        let mut failure = None;

        for i in 0..touched.len() {
            let index = &mut *touched[i];
            if let Some(old_record) = &old {
                index.remove(old_record);
            }
            match index.add(&record) {
                Ok(()) => applied += 1,
                Err(err) => {
                    failure = Some(err);
                    break;
                }
            }
        }

        if let Some(err) = failure {
            // Roll back every index already touched in this call (the one
            // that just failed included, since its old link was already
            // removed above), re-linking the removed old record.
            for rollback in touched.iter_mut().take(applied + 1) {
                if let Some(old_record) = &old {
                    rollback.remove(&record);
                    let _ = rollback.add(old_record);
                } else {
                    rollback.remove(&record);
                }
            }
            return Err(err);
        }

        Ok(record)
    }

    /// Remove the record with the given primary key from every index.
    /// A no-op if no such record exists — used by log replay, where a
    /// tombstone for an already-absent key must be silently ignored.
    pub fn remove(&mut self, key: &Value) -> Option<Record> {
        let record = self.find_primary(key)?;
        for index in self.indexes.values_mut() {
            index.remove(&record);
        }
        Some(record)
    }

    /// Like [`remove`](Self::remove), but a missing key is `NotExists`
    /// rather than a silent no-op. Used by the live `Store::delete` path,
    /// where the caller needs to know the delete didn't happen.
    pub fn remove_checked(&mut self, key: &Value) -> Result<Record> {
        self.remove(key).ok_or_else(|| {
            let mut map = serde_json::Map::new();
            map.insert(self.primary_field.clone(), key.clone());
            Error::NotExists {
                record: Record::from_map(map),
            }
        })
    }

    pub fn find_primary(&self, key: &Value) -> Option<Record> {
        self.indexes.get(&self.primary_field)?.find_one(key)
    }

    pub fn find(&self, field: &str, value: &Value) -> Result<Vec<Record>> {
        let index = self
            .indexes
            .get(field)
            .ok_or_else(|| Error::NoIndex {
                field: field.to_string(),
            })?;
        Ok(index.find(value))
    }

    pub fn find_one(&self, field: &str, value: &Value) -> Result<Option<Record>> {
        let index = self
            .indexes
            .get(field)
            .ok_or_else(|| Error::NoIndex {
                field: field.to_string(),
            })?;
        Ok(index.find_one(value))
    }

    /// All records currently held, in primary-index order.
    pub fn all(&self) -> Vec<Record> {
        match self.indexes.get(&self.primary_field) {
            Some(Index::Unique(_)) => {
                // The primary index is always `Unique`; iterate via find on
                // every key is wasteful, so walk its internal map instead
                // through the shared `Index::find` contract by scanning all
                // distinct records it holds.
                self.collect_unique(&self.primary_field)
            }
            _ => Vec::new(),
        }
    }

    fn collect_unique(&self, field: &str) -> Vec<Record> {
        // `Index` intentionally exposes no iterator (teacher's design keeps
        // the map private), so collect through a full dump helper.
        match self.indexes.get(field) {
            Some(index) => index.dump(),
            None => Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.all().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&mut self) {
        for index in self.indexes.values_mut() {
            index.clear();
        }
    }

    fn generate_primary_key(&self, data: &Value) -> Result<Value> {
        generate_key(data, |candidate| {
            self.find_primary(&Value::String(candidate.to_string())).is_some()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn new_set() -> IndexSet {
        IndexSet::new("_id")
    }

    #[test]
    fn insert_generates_key() {
        let mut set = new_set();
        let record = set.upsert(json!({"name": "Alice"}), KeyMode::MustNotExist).unwrap();
        assert!(record.get("_id").is_some());
    }

    #[test]
    fn insert_duplicate_key_fails() {
        let mut set = new_set();
        set.upsert(json!({"_id": "a", "name": "Alice"}), KeyMode::MustNotExist)
            .unwrap();
        let err = set
            .upsert(json!({"_id": "a", "name": "Bob"}), KeyMode::MustNotExist)
            .unwrap_err();
        assert!(matches!(err, Error::KeyViolation { .. }));
    }

    #[test]
    fn update_missing_key_fails() {
        let mut set = new_set();
        let err = set
            .upsert(json!({"_id": "missing"}), KeyMode::MustExist)
            .unwrap_err();
        assert!(matches!(err, Error::NotExists { .. }));
    }

    #[test]
    fn upsert_replaces_existing() {
        let mut set = new_set();
        set.upsert(json!({"_id": "a", "name": "Alice"}), KeyMode::MustNotExist)
            .unwrap();
        set.upsert(json!({"_id": "a", "name": "Alicia"}), KeyMode::Any)
            .unwrap();
        let found = set.find_primary(&json!("a")).unwrap();
        assert_eq!(found.get("name"), Some(&json!("Alicia")));
    }

    #[test]
    fn secondary_unique_violation_rolls_back() {
        let mut set = new_set();
        set.add_index(IndexDescriptor::new("email").unique()).unwrap();
        set.upsert(json!({"_id": "a", "email": "a@b.c"}), KeyMode::MustNotExist)
            .unwrap();

        let err = set
            .upsert(json!({"_id": "b", "email": "a@b.c"}), KeyMode::MustNotExist)
            .unwrap_err();
        assert!(matches!(err, Error::KeyViolation { .. }));

        // Primary index must not have been left with a half-applied "b".
        assert!(set.find_primary(&json!("b")).is_none());
        // The original "a" record must remain fully intact in both indexes.
        assert!(set.find_primary(&json!("a")).is_some());
        assert_eq!(set.find_one("email", &json!("a@b.c")).unwrap().unwrap().get("_id"), Some(&json!("a")));
    }

    #[test]
    fn update_with_violation_restores_old_record() {
        let mut set = new_set();
        set.add_index(IndexDescriptor::new("email").unique()).unwrap();
        set.upsert(json!({"_id": "a", "email": "a@b.c"}), KeyMode::MustNotExist)
            .unwrap();
        set.upsert(json!({"_id": "b", "email": "b@b.c"}), KeyMode::MustNotExist)
            .unwrap();

        let err = set
            .upsert(json!({"_id": "b", "email": "a@b.c"}), KeyMode::Any)
            .unwrap_err();
        assert!(matches!(err, Error::KeyViolation { .. }));

        // "b" must still be findable by its original email.
        let b = set.find_primary(&json!("b")).unwrap();
        assert_eq!(b.get("email"), Some(&json!("b@b.c")));
    }

    #[test]
    fn remove_deletes_from_all_indexes() {
        let mut set = new_set();
        set.add_index(IndexDescriptor::new("email").unique()).unwrap();
        set.upsert(json!({"_id": "a", "email": "a@b.c"}), KeyMode::MustNotExist)
            .unwrap();
        set.remove(&json!("a"));
        assert!(set.find_primary(&json!("a")).is_none());
        assert!(set.find_one("email", &json!("a@b.c")).unwrap().is_none());
    }

    #[test]
    fn add_index_backfills_existing_records() {
        let mut set = new_set();
        set.upsert(json!({"_id": "a", "email": "a@b.c"}), KeyMode::MustNotExist)
            .unwrap();
        set.add_index(IndexDescriptor::new("email").unique()).unwrap();
        assert_eq!(set.find_one("email", &json!("a@b.c")).unwrap().unwrap().get("_id"), Some(&json!("a")));
    }

    #[test]
    fn add_index_duplicate_field_rejected() {
        let mut set = new_set();
        assert!(matches!(
            set.add_index(IndexDescriptor::new("_id")),
            Err(Error::IndexAlreadyExists { .. })
        ));
    }

    #[test]
    fn add_index_identical_descriptor_is_idempotent() {
        let mut set = new_set();
        set.add_index(IndexDescriptor::new("email").unique()).unwrap();
        set.add_index(IndexDescriptor::new("email").unique()).unwrap();
        assert!(set.has_index("email"));
    }

    #[test]
    fn ensure_index_on_primary_with_matching_descriptor_is_idempotent() {
        let mut set = new_set();
        set.add_index(IndexDescriptor::new("_id").unique()).unwrap();
    }

    #[test]
    fn delete_index_missing_field_errors_by_default() {
        let mut set = new_set();
        assert!(matches!(
            set.delete_index("nope", false),
            Err(Error::NoIndex { .. })
        ));
    }

    #[test]
    fn delete_index_missing_field_lenient_ok() {
        let mut set = new_set();
        assert!(set.delete_index("nope", true).is_ok());
    }

    #[test]
    fn primary_index_delete_is_noop() {
        let mut set = new_set();
        assert!(set.delete_index("_id", false).is_ok());
        assert!(set.has_index("_id"));
    }

    #[test]
    fn remove_checked_errors_on_missing_key() {
        let mut set = new_set();
        let err = set.remove_checked(&json!("nope")).unwrap_err();
        assert!(matches!(err, Error::NotExists { .. }));
    }

    #[test]
    fn remove_checked_succeeds_on_present_key() {
        let mut set = new_set();
        set.upsert(json!({"_id": "a"}), KeyMode::MustNotExist).unwrap();
        let removed = set.remove_checked(&json!("a")).unwrap();
        assert_eq!(removed.get("_id"), Some(&json!("a")));
        assert!(set.find_primary(&json!("a")).is_none());
    }

    #[test]
    fn reserved_field_rejected() {
        let mut set = new_set();
        let err = set
            .upsert(json!({"_id": "a", "$$x": 1}), KeyMode::MustNotExist)
            .unwrap_err();
        assert!(matches!(err, Error::ReservedField { .. }));
    }
}
