use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use serde_json::Value;

use crate::error::{Error, Result};
use crate::index::IndexDescriptor;
use crate::index_set::KeyMode;
use crate::log::{LogEntry, Sentinels, SortSpec};
use crate::record::Record;
use crate::serializer::{spawn_auto_compaction, Serializer};

/// Callback for forwarding store log messages to an external sink (e.g. a
/// structured logging pipeline). Only invoked when [`StoreOptions::verbose`]
/// is set, exactly like the diagnostic messages this crate also prints to
/// stderr.
pub type LogCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// The crate's diagnostic hook: prints to stderr and forwards to an
/// optional external callback at key lifecycle points (load, lock
/// acquisition, compaction, rollback), but only when `verbose` is set.
#[derive(Clone)]
pub struct Logger {
    verbose: bool,
    callback: Option<LogCallback>,
}

impl Logger {
    pub fn new(verbose: bool, callback: Option<LogCallback>) -> Self {
        Self { verbose, callback }
    }

    pub fn emit(&self, msg: &str) {
        if !self.verbose {
            return;
        }
        eprintln!("{msg}");
        if let Some(cb) = &self.callback {
            cb(msg);
        }
    }
}

/// Tunables for opening a [`Store`].
#[derive(Clone)]
pub struct StoreOptions {
    /// The field used as the primary key. Defaults to `"_id"`.
    pub primary_field: String,
    /// If set, a background thread periodically compacts the log at this
    /// interval. Off by default — call [`Store::set_auto_compaction`] to
    /// turn it on after opening.
    pub auto_compaction_interval: Option<Duration>,
    /// By default, deleting a secondary index that doesn't exist is an
    /// error (`NoIndex`). Set this to tolerate it silently instead.
    pub lenient_delete_index: bool,
    /// The envelope keys used to tag non-record log lines. Only worth
    /// changing from the default if an embedding application has its own
    /// reason to avoid the `$$`-prefixed names (the reserved-field check
    /// already keeps ordinary records from colliding with them).
    pub sentinels: Sentinels,
    /// Print diagnostic messages (load, lock acquisition, compaction,
    /// rollback) to stderr, and forward them to `log_callback` if set.
    pub verbose: bool,
    /// An optional external sink for the same diagnostic messages,
    /// forwarded only when `verbose` is set.
    pub log_callback: Option<LogCallback>,
}

impl std::fmt::Debug for StoreOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreOptions")
            .field("primary_field", &self.primary_field)
            .field("auto_compaction_interval", &self.auto_compaction_interval)
            .field("lenient_delete_index", &self.lenient_delete_index)
            .field("sentinels", &self.sentinels)
            .field("verbose", &self.verbose)
            .field("log_callback", &self.log_callback.is_some())
            .finish()
    }
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            primary_field: "_id".to_string(),
            auto_compaction_interval: None,
            lenient_delete_index: false,
            sentinels: Sentinels::default(),
            verbose: false,
            log_callback: None,
        }
    }
}

/// An embedded, single-process, file-backed JSON document store.
///
/// Every operation is funneled through a single serializer worker thread
/// (see [`crate::serializer`]), so concurrent callers observe a
/// linearized, FIFO-ordered view of the store regardless of how many
/// threads call into it.
pub struct Store {
    serializer: Arc<Serializer>,
    options: StoreOptions,
    auto_compaction: Option<(JoinHandle<()>, std::sync::mpsc::Sender<()>)>,
}

impl Store {
    /// Open (creating if absent) the store backed by the file at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with(path, StoreOptions::default())
    }

    pub fn open_with(path: impl AsRef<Path>, options: StoreOptions) -> Result<Self> {
        options.sentinels.validate()?;
        let path: PathBuf = path.as_ref().to_path_buf();
        let logger = Logger::new(options.verbose, options.log_callback.clone());
        let serializer = Arc::new(Serializer::start_with_sentinels(
            &path,
            &options.primary_field,
            logger,
            options.sentinels.clone(),
        )?);

        let mut store = Self {
            serializer,
            options,
            auto_compaction: None,
        };
        if let Some(interval) = store.options.auto_compaction_interval {
            store.set_auto_compaction(interval);
        }
        Ok(store)
    }

    /// Insert a new record. Fails with `KeyViolation` if the record
    /// carries a primary key that's already in use; otherwise one is
    /// generated.
    pub fn insert(&self, data: Value) -> Result<Record> {
        self.mutate(data, KeyMode::MustNotExist)
    }

    /// Replace an existing record in full. Fails with `NotExists` if no
    /// record with that primary key is present.
    pub fn update(&self, data: Value) -> Result<Record> {
        self.mutate(data, KeyMode::MustExist)
    }

    /// Insert or replace, whichever applies.
    pub fn upsert(&self, data: Value) -> Result<Record> {
        self.mutate(data, KeyMode::Any)
    }

    fn mutate(&self, data: Value, mode: KeyMode) -> Result<Record> {
        self.serializer.submit(move |engine| match engine.indexes.upsert(data, mode) {
            Ok(record) => {
                engine.log.append(&LogEntry::Upsert(record.clone().into_value()))?;
                Ok(record)
            }
            Err(err) => {
                if let Error::KeyViolation { field, .. } = &err {
                    engine
                        .logger
                        .emit(&format!("[verbose] rollback: key violation on field '{field}'"));
                }
                Err(err)
            }
        })
    }

    /// Delete the record with the given primary key. Fails with
    /// `NotExists` if no record with that key is present.
    pub fn delete(&self, key: Value) -> Result<Record> {
        self.serializer.submit(move |engine| {
            let removed = engine.indexes.remove_checked(&key)?;
            engine.log.append(&LogEntry::Deleted(key.clone()))?;
            Ok(removed)
        })
    }

    /// Insert every record in `items`, in order, stopping at the first
    /// failure. Records already inserted before the failure remain
    /// committed, in memory and on disk — only the failing record and
    /// anything after it is left out of the returned batch.
    pub fn insert_many(&self, items: Vec<Value>) -> Result<Vec<Record>> {
        self.mutate_many(items, KeyMode::MustNotExist)
    }

    /// Update every record in `items`, in order, stopping at the first
    /// failure (e.g. the first one with no matching existing record).
    pub fn update_many(&self, items: Vec<Value>) -> Result<Vec<Record>> {
        self.mutate_many(items, KeyMode::MustExist)
    }

    /// Insert or replace every record in `items`, in order, stopping at
    /// the first failure.
    pub fn upsert_many(&self, items: Vec<Value>) -> Result<Vec<Record>> {
        self.mutate_many(items, KeyMode::Any)
    }

    fn mutate_many(&self, items: Vec<Value>, mode: KeyMode) -> Result<Vec<Record>> {
        self.serializer.submit(move |engine| {
            let mut committed = Vec::with_capacity(items.len());
            for item in items {
                match engine.indexes.upsert(item, mode) {
                    Ok(record) => {
                        engine.log.append(&LogEntry::Upsert(record.clone().into_value()))?;
                        committed.push(record);
                    }
                    Err(err) => {
                        if let Error::KeyViolation { field, .. } = &err {
                            engine.logger.emit(&format!(
                                "[verbose] rollback: key violation on field '{field}'"
                            ));
                        }
                        return Err(err);
                    }
                }
            }
            Ok(committed)
        })
    }

    /// Delete every record keyed by `keys`, in order, stopping at the
    /// first missing key. Records already deleted before the failure
    /// remain deleted.
    pub fn delete_many(&self, keys: Vec<Value>) -> Result<Vec<Record>> {
        self.serializer.submit(move |engine| {
            let mut removed = Vec::with_capacity(keys.len());
            for key in keys {
                let record = engine.indexes.remove_checked(&key)?;
                engine.log.append(&LogEntry::Deleted(key.clone()))?;
                removed.push(record);
            }
            Ok(removed)
        })
    }

    pub fn get(&self, key: Value) -> Result<Option<Record>> {
        self.serializer
            .submit(move |engine| Ok(engine.indexes.find_primary(&key)))
    }

    pub fn get_all(&self) -> Result<Vec<Record>> {
        self.serializer.submit(|engine| Ok(engine.indexes.all()))
    }

    /// Like [`Store::get_all`], but orders the result according to `sort`
    /// before returning it. Sorting happens on the worker thread, over the
    /// same snapshot `get_all` would return.
    pub fn get_all_sorted(&self, sort: SortSpec) -> Result<Vec<Record>> {
        self.serializer.submit(move |engine| {
            let mut records = engine.indexes.all();
            sort.apply(&mut records, engine.indexes.primary_field());
            Ok(records)
        })
    }

    pub fn find(&self, field: impl Into<String>, value: Value) -> Result<Vec<Record>> {
        let field = field.into();
        self.serializer
            .submit(move |engine| engine.indexes.find(&field, &value))
    }

    pub fn find_one(&self, field: impl Into<String>, value: Value) -> Result<Option<Record>> {
        let field = field.into();
        self.serializer
            .submit(move |engine| engine.indexes.find_one(&field, &value))
    }

    /// Declare a secondary index, back-filling it from every existing
    /// record. Idempotent: calling this again with a descriptor identical
    /// to one already installed is a no-op.
    pub fn ensure_index(&self, descriptor: IndexDescriptor) -> Result<()> {
        let desc_for_log = descriptor.clone();
        self.serializer.submit(move |engine| {
            engine.indexes.add_index(descriptor)?;
            engine.log.append(&LogEntry::AddIndex(desc_for_log.clone()))
        })
    }

    /// Remove a secondary index. A no-op if `field` is the primary field —
    /// the primary index can never actually be removed.
    pub fn delete_index(&self, field: impl Into<String>) -> Result<()> {
        let field = field.into();
        let lenient = self.options.lenient_delete_index;
        self.serializer.submit(move |engine| {
            engine.indexes.delete_index(&field, lenient)?;
            engine.log.append(&LogEntry::DeleteIndex(field.clone()))
        })
    }

    /// Force an immediate compaction of the on-disk log to its minimal
    /// form, writing records in primary-index order.
    pub fn compact(&self) -> Result<()> {
        self.compact_sorted(None)
    }

    /// Like [`Store::compact`], but orders the records written to disk by
    /// `sort` instead of primary-index order.
    pub fn compact_sorted(&self, sort: Option<SortSpec>) -> Result<()> {
        self.serializer.submit(move |engine| {
            engine.logger.emit(&format!(
                "[verbose] compacting log at {}",
                engine.log.path().display()
            ));
            engine.log.rewrite(&engine.indexes, sort.as_ref())
        })
    }

    /// Discard the in-memory state and replay the on-disk log from
    /// scratch. Useful after another process has mutated the file, though
    /// ordinary operation never requires it.
    pub fn reload(&self) -> Result<()> {
        self.serializer.submit(|engine| {
            let reloaded = engine.log.hydrate(engine.indexes.primary_field())?;
            engine.indexes = reloaded;
            engine.logger.emit(&format!(
                "[verbose] reloaded store from {}",
                engine.log.path().display()
            ));
            Ok(())
        })
    }

    /// Start (or restart, at a new interval) periodic background
    /// compaction, writing records in primary-index order on every tick.
    pub fn set_auto_compaction(&mut self, interval: Duration) {
        self.set_auto_compaction_sorted(interval, None);
    }

    /// Like [`Store::set_auto_compaction`], but orders the records written
    /// on every tick by `sort` instead of primary-index order.
    pub fn set_auto_compaction_sorted(&mut self, interval: Duration, sort: Option<Arc<SortSpec>>) {
        self.stop_auto_compaction();
        self.auto_compaction = Some(spawn_auto_compaction(
            Arc::clone(&self.serializer),
            interval,
            sort,
        ));
    }

    /// Stop periodic background compaction, if running.
    pub fn stop_auto_compaction(&mut self) {
        if let Some((handle, stop_tx)) = self.auto_compaction.take() {
            let _ = stop_tx.send(());
            let _ = handle.join();
        }
    }
}

impl Drop for Store {
    fn drop(&mut self) {
        self.stop_auto_compaction();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    #[test]
    fn insert_get_delete_roundtrip() {
        let dir = tempdir().unwrap();
        let store = Store::open(dir.path().join("db.jsonl")).unwrap();

        let record = store.insert(json!({"name": "Alice"})).unwrap();
        let key = record.get("_id").cloned().unwrap();

        let found = store.get(key.clone()).unwrap().unwrap();
        assert_eq!(found.get("name"), Some(&json!("Alice")));

        let deleted = store.delete(key.clone()).unwrap();
        assert_eq!(deleted.get("name"), Some(&json!("Alice")));
        assert!(store.get(key).unwrap().is_none());
    }

    #[test]
    fn delete_missing_key_fails_with_not_exists() {
        let dir = tempdir().unwrap();
        let store = Store::open(dir.path().join("db.jsonl")).unwrap();
        let err = store.delete(json!("nope")).unwrap_err();
        assert!(matches!(err, crate::error::Error::NotExists { .. }));
    }

    #[test]
    fn insert_many_stops_at_first_failure_keeping_prior_successes() {
        let dir = tempdir().unwrap();
        let store = Store::open(dir.path().join("db.jsonl")).unwrap();

        let err = store
            .insert_many(vec![
                json!({"_id": "a"}),
                json!({"_id": "a"}),
                json!({"_id": "c"}),
            ])
            .unwrap_err();
        assert!(matches!(err, crate::error::Error::KeyViolation { .. }));

        assert!(store.get(json!("a")).unwrap().is_some());
        assert!(store.get(json!("c")).unwrap().is_none());
    }

    #[test]
    fn delete_many_removes_every_key_in_order() {
        let dir = tempdir().unwrap();
        let store = Store::open(dir.path().join("db.jsonl")).unwrap();
        store
            .insert_many(vec![json!({"_id": "a"}), json!({"_id": "b"})])
            .unwrap();

        let removed = store.delete_many(vec![json!("a"), json!("b")]).unwrap();
        assert_eq!(removed.len(), 2);
        assert!(store.get_all().unwrap().is_empty());
    }

    #[test]
    fn ensure_index_is_idempotent_for_identical_descriptor() {
        let dir = tempdir().unwrap();
        let store = Store::open(dir.path().join("db.jsonl")).unwrap();
        store
            .ensure_index(IndexDescriptor::new("email").unique())
            .unwrap();
        store
            .ensure_index(IndexDescriptor::new("email").unique())
            .unwrap();
    }

    #[test]
    fn delete_index_on_primary_is_noop() {
        let dir = tempdir().unwrap();
        let store = Store::open(dir.path().join("db.jsonl")).unwrap();
        store.delete_index("_id").unwrap();
        store.insert(json!({"_id": "a"})).unwrap();
        assert!(store.get(json!("a")).unwrap().is_some());
    }

    #[test]
    fn compact_sorted_orders_records_on_disk() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("db.jsonl");
        let store = Store::open(&path).unwrap();
        store.insert(json!({"_id": "b", "age": 30})).unwrap();
        store.insert(json!({"_id": "a", "age": 20})).unwrap();

        store
            .compact_sorted(Some(SortSpec::FieldAsc("age".to_string())))
            .unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().filter(|l| !l.trim().is_empty()).collect();
        assert!(lines[0].contains("\"_id\":\"a\""));
        assert!(lines[1].contains("\"_id\":\"b\""));
    }

    #[test]
    fn update_requires_existing_record() {
        let dir = tempdir().unwrap();
        let store = Store::open(dir.path().join("db.jsonl")).unwrap();
        let err = store.update(json!({"_id": "nope"})).unwrap_err();
        assert!(matches!(err, crate::error::Error::NotExists { .. }));
    }

    #[test]
    fn ensure_index_then_find() {
        let dir = tempdir().unwrap();
        let store = Store::open(dir.path().join("db.jsonl")).unwrap();
        store
            .ensure_index(IndexDescriptor::new("email").unique())
            .unwrap();
        store.insert(json!({"email": "a@b.c"})).unwrap();
        let found = store.find_one("email", json!("a@b.c")).unwrap();
        assert!(found.is_some());
    }

    #[test]
    fn data_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("db.jsonl");
        {
            let store = Store::open(&path).unwrap();
            store.insert(json!({"_id": "a", "name": "Alice"})).unwrap();
        }
        let store = Store::open(&path).unwrap();
        let found = store.get(json!("a")).unwrap().unwrap();
        assert_eq!(found.get("name"), Some(&json!("Alice")));
    }

    #[test]
    fn compact_preserves_queryable_state() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("db.jsonl");
        let store = Store::open(&path).unwrap();
        store.insert(json!({"_id": "a", "name": "Alice"})).unwrap();
        store.insert(json!({"_id": "b", "name": "Bob"})).unwrap();
        store.delete(json!("b")).unwrap();
        store.compact().unwrap();

        let all = store.get_all().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].get("_id"), Some(&json!("a")));
    }

    #[test]
    fn delete_index_missing_fails_by_default() {
        let dir = tempdir().unwrap();
        let store = Store::open(dir.path().join("db.jsonl")).unwrap();
        let err = store.delete_index("nope").unwrap_err();
        assert!(matches!(err, crate::error::Error::NoIndex { .. }));
    }

    #[test]
    fn delete_index_missing_lenient_ok() {
        let dir = tempdir().unwrap();
        let store = Store::open_with(
            dir.path().join("db.jsonl"),
            StoreOptions {
                lenient_delete_index: true,
                ..StoreOptions::default()
            },
        )
        .unwrap();
        store.delete_index("nope").unwrap();
    }

    #[test]
    fn reload_picks_up_identical_state() {
        let dir = tempdir().unwrap();
        let store = Store::open(dir.path().join("db.jsonl")).unwrap();
        store.insert(json!({"_id": "a"})).unwrap();
        store.reload().unwrap();
        assert!(store.get(json!("a")).unwrap().is_some());
    }

    #[test]
    fn custom_sentinels_survive_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("db.jsonl");
        let sentinels = crate::log::Sentinels {
            delete: "$$gone".to_string(),
            add_index: "$$newIndex".to_string(),
            delete_index: "$$dropIndex".to_string(),
        };
        {
            let store = Store::open_with(
                &path,
                StoreOptions {
                    sentinels: sentinels.clone(),
                    ..StoreOptions::default()
                },
            )
            .unwrap();
            store.insert(json!({"_id": "a"})).unwrap();
            store.delete(json!("a")).unwrap();
        }
        let store = Store::open_with(
            &path,
            StoreOptions {
                sentinels,
                ..StoreOptions::default()
            },
        )
        .unwrap();
        assert!(store.get(json!("a")).unwrap().is_none());
    }

    #[test]
    fn invalid_sentinels_rejected_at_open() {
        let dir = tempdir().unwrap();
        let bad = crate::log::Sentinels {
            delete: "not-reserved".to_string(),
            ..crate::log::Sentinels::default()
        };
        let err = Store::open_with(
            dir.path().join("db.jsonl"),
            StoreOptions {
                sentinels: bad,
                ..StoreOptions::default()
            },
        )
        .unwrap_err();
        assert!(matches!(err, crate::error::Error::Corrupt(_)));
    }

    #[test]
    fn get_all_sorted_orders_by_field() {
        let dir = tempdir().unwrap();
        let store = Store::open(dir.path().join("db.jsonl")).unwrap();
        store.insert(json!({"_id": "a", "age": 30})).unwrap();
        store.insert(json!({"_id": "b", "age": 20})).unwrap();
        store.insert(json!({"_id": "c", "age": 25})).unwrap();

        let sorted = store.get_all_sorted(SortSpec::FieldAsc("age".to_string())).unwrap();
        let ages: Vec<_> = sorted.iter().map(|r| r.get("age").cloned().unwrap()).collect();
        assert_eq!(ages, vec![json!(20), json!(25), json!(30)]);
    }

    #[test]
    fn verbose_log_callback_sees_rollback_message() {
        use std::sync::Mutex;

        let dir = tempdir().unwrap();
        let messages = Arc::new(Mutex::new(Vec::new()));
        let captured = Arc::clone(&messages);

        let store = Store::open_with(
            dir.path().join("db.jsonl"),
            StoreOptions {
                verbose: true,
                log_callback: Some(Arc::new(move |msg: &str| {
                    captured.lock().unwrap().push(msg.to_string());
                })),
                ..StoreOptions::default()
            },
        )
        .unwrap();

        store
            .ensure_index(IndexDescriptor::new("email").unique())
            .unwrap();
        store.insert(json!({"_id": "a", "email": "a@b.c"})).unwrap();
        let _ = store.insert(json!({"_id": "b", "email": "a@b.c"}));

        let log = messages.lock().unwrap();
        assert!(log.iter().any(|m| m.contains("rollback")));
        assert!(log.iter().any(|m| m.contains("acquired lock")));
    }
}
