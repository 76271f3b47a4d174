use std::cmp::Ordering;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use serde_json::{json, Value};

use crate::codec::{decode_line, encode_line, RESERVED_PREFIX};
use crate::error::{Error, Result};
use crate::index::IndexDescriptor;
use crate::index_set::{IndexSet, KeyMode};
use crate::record::Record;
use crate::value::IndexValue;

const OP_DELETE: &str = "$$delete";
const OP_ADD_INDEX: &str = "$$addIndex";
const OP_DELETE_INDEX: &str = "$$deleteIndex";

/// The envelope keys used to tag non-record log lines. Configurable via
/// [`crate::store::StoreOptions`] so an embedding application can avoid a
/// name collision with its own data, though the defaults match what
/// `codec::check_reserved` already bars ordinary records from using.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sentinels {
    pub delete: String,
    pub add_index: String,
    pub delete_index: String,
}

impl Default for Sentinels {
    fn default() -> Self {
        Self {
            delete: OP_DELETE.to_string(),
            add_index: OP_ADD_INDEX.to_string(),
            delete_index: OP_DELETE_INDEX.to_string(),
        }
    }
}

impl Sentinels {
    /// Each sentinel must carry the reserved prefix (so it can never
    /// collide with an ordinary record's top-level field) and the three
    /// must be pairwise distinct.
    pub fn validate(&self) -> Result<()> {
        for key in [&self.delete, &self.add_index, &self.delete_index] {
            if !key.starts_with(RESERVED_PREFIX) {
                return Err(Error::Corrupt(format!(
                    "sentinel key '{key}' must start with '{RESERVED_PREFIX}'"
                )));
            }
        }
        if self.delete == self.add_index
            || self.delete == self.delete_index
            || self.add_index == self.delete_index
        {
            return Err(Error::Corrupt("sentinel keys must be pairwise distinct".into()));
        }
        Ok(())
    }
}

fn envelope(key: &str, value: Value) -> Value {
    let mut map = serde_json::Map::new();
    map.insert(key.to_string(), value);
    Value::Object(map)
}

/// One envelope shape appended to the log. A record upsert is written as
/// its plain JSON object; the other three shapes are tagged with a
/// reserved `$$`-prefixed key so they can never collide with a real
/// record, which is barred from using that prefix (see
/// [`crate::codec::check_reserved`]).
#[derive(Debug, Clone)]
pub enum LogEntry {
    Upsert(Value),
    Deleted(Value),
    AddIndex(IndexDescriptor),
    DeleteIndex(String),
}

impl LogEntry {
    fn to_line(&self, sentinels: &Sentinels) -> Value {
        match self {
            LogEntry::Upsert(v) => v.clone(),
            LogEntry::Deleted(key) => envelope(&sentinels.delete, key.clone()),
            LogEntry::AddIndex(desc) => envelope(&sentinels.add_index, json!(desc)),
            LogEntry::DeleteIndex(field) => envelope(&sentinels.delete_index, json!(field)),
        }
    }

    fn from_line(value: Value, sentinels: &Sentinels) -> Result<Self> {
        if let Value::Object(map) = &value {
            if let Some(key) = map.get(&sentinels.delete) {
                return Ok(LogEntry::Deleted(key.clone()));
            }
            if let Some(desc) = map.get(&sentinels.add_index) {
                let desc: IndexDescriptor = serde_json::from_value(desc.clone())?;
                return Ok(LogEntry::AddIndex(desc));
            }
            if let Some(field) = map.get(&sentinels.delete_index) {
                let field = field
                    .as_str()
                    .ok_or_else(|| crate::error::Error::Corrupt("deleteIndex field not a string".into()))?
                    .to_string();
                return Ok(LogEntry::DeleteIndex(field));
            }
        }
        Ok(LogEntry::Upsert(value))
    }
}

/// How to order records returned by a query, mirroring the teacher's own
/// `SortOrder`/`FindOptions::sort` in `query.rs`, narrowed to a single sort
/// key (composite multi-field sort has no caller in this store) plus a
/// free-form comparator escape hatch.
pub enum SortSpec {
    FieldAsc(String),
    FieldDesc(String),
    PrimaryKey,
    By(Box<dyn Fn(&Record, &Record) -> Ordering + Send + Sync>),
}

impl SortSpec {
    pub fn apply(&self, records: &mut [Record], primary_field: &str) {
        match self {
            SortSpec::FieldAsc(field) => records.sort_by(|a, b| compare_field(a, b, field)),
            SortSpec::FieldDesc(field) => records.sort_by(|a, b| compare_field(b, a, field)),
            SortSpec::PrimaryKey => records.sort_by(|a, b| compare_field(a, b, primary_field)),
            SortSpec::By(cmp) => records.sort_by(|a, b| cmp(a, b)),
        }
    }
}

fn compare_field(a: &Record, b: &Record, field: &str) -> Ordering {
    let av = a.get(field).map(IndexValue::from_json).unwrap_or(IndexValue::Null);
    let bv = b.get(field).map(IndexValue::from_json).unwrap_or(IndexValue::Null);
    av.cmp(&bv)
}

/// The append-only, newline-delimited log backing a store's durability.
///
/// Every mutation is appended as one line and fsync'd before the call that
/// produced it returns success. Compaction (`rewrite`) replaces the file
/// atomically via a `<path>~` temp file, fsync, and rename.
pub struct Log {
    path: PathBuf,
    file: File,
    sentinels: Sentinels,
}

impl Log {
    pub fn open(path: &Path) -> Result<Self> {
        Self::open_with_sentinels(path, Sentinels::default())
    }

    pub fn open_with_sentinels(path: &Path, sentinels: Sentinels) -> Result<Self> {
        sentinels.validate()?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .read(true)
            .open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            file,
            sentinels,
        })
    }

    pub fn append(&mut self, entry: &LogEntry) -> Result<()> {
        let line = encode_line(&entry.to_line(&self.sentinels))?;
        writeln!(self.file, "{line}")?;
        self.file.sync_data()?;
        Ok(())
    }

    pub fn append_batch(&mut self, entries: &[LogEntry]) -> Result<()> {
        for entry in entries {
            let line = encode_line(&entry.to_line(&self.sentinels))?;
            writeln!(self.file, "{line}")?;
        }
        self.file.sync_data()?;
        Ok(())
    }

    /// Replay every entry in the log into a freshly-constructed `IndexSet`.
    ///
    /// Tolerant of a truncated final line (the result of a crash mid-write):
    /// if the *last* line fails to parse, it is silently dropped rather than
    /// treated as corruption. A malformed line anywhere else is a hard
    /// error.
    pub fn hydrate(&self, primary_field: &str) -> Result<IndexSet> {
        let mut set = IndexSet::new(primary_field);
        let reader = BufReader::new(File::open(&self.path)?);
        let lines: Vec<String> = reader.lines().collect::<std::io::Result<_>>()?;

        for (i, raw) in lines.iter().enumerate() {
            let trimmed = raw.trim();
            if trimmed.is_empty() {
                continue;
            }
            let value = match decode_line(trimmed) {
                Ok(v) => v,
                Err(e) => {
                    if i + 1 == lines.len() {
                        break;
                    }
                    return Err(e);
                }
            };
            match LogEntry::from_line(value, &self.sentinels)? {
                LogEntry::Upsert(v) => {
                    set.upsert(v, KeyMode::Any)?;
                }
                LogEntry::Deleted(key) => {
                    set.remove(&key);
                }
                LogEntry::AddIndex(desc) => {
                    // A replayed add-index of a field that already exists
                    // (e.g. the primary field, or a duplicate entry from a
                    // pre-compaction log) is a no-op, not an error.
                    if !set.has_index(&desc.field_name) {
                        set.add_index(desc)?;
                    }
                }
                LogEntry::DeleteIndex(field) => {
                    set.delete_index(&field, true)?;
                }
            }
        }
        Ok(set)
    }

    /// Atomically rewrite the log to hold exactly the current state of
    /// `set`: every non-primary index descriptor, then every record, each
    /// written as an `upsert` entry so the file replays to the same state
    /// in less space. If `sort` is given, records are ordered by it before
    /// being written; otherwise they're written in primary-index order.
    pub fn rewrite(&mut self, set: &IndexSet, sort: Option<&SortSpec>) -> Result<()> {
        let tmp_path = self.path.with_extension(tmp_extension(&self.path));
        let mut tmp = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp_path)?;

        for desc in set.descriptors() {
            if desc.field_name == set.primary_field() {
                continue;
            }
            let line = encode_line(&LogEntry::AddIndex(desc).to_line(&self.sentinels))?;
            writeln!(tmp, "{line}")?;
        }
        let mut records = set.all();
        if let Some(sort) = sort {
            sort.apply(&mut records, set.primary_field());
        }
        for record in records {
            let line = encode_line(&record.into_value())?;
            writeln!(tmp, "{line}")?;
        }
        tmp.sync_data()?;
        drop(tmp);

        fs::rename(&tmp_path, &self.path)?;
        self.file = OpenOptions::new()
            .create(true)
            .append(true)
            .read(true)
            .open(&self.path)?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn tmp_extension(path: &Path) -> String {
    match path.extension().and_then(|e| e.to_str()) {
        Some(ext) => format!("{ext}~"),
        None => "~".to_string(),
    }
}
