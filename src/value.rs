use std::cmp::Ordering;
use std::hash::{Hash, Hasher};

use serde_json::Value as JsonValue;

/// The default sentinel key under which date values are encoded:
/// `{"$date": <epoch-millis>}`. See [`crate::codec`].
pub const DATE_SENTINEL: &str = "$date";

/// Index value with type-aware ordering.
///
/// Dates — whether encoded as a `{"$date": millis}` sentinel object or as
/// a plain ISO-8601 string, both of which occur in real-world JSON data —
/// normalize to the same `DateTime` variant so a single index stays
/// internally consistent regardless of which representation produced a
/// given record.
#[derive(Debug, Clone)]
pub enum IndexValue {
    Null,
    Boolean(bool),
    Integer(i64),
    Float(f64),
    DateTime(i64),
    String(String),
}

impl Eq for IndexValue {}

impl Hash for IndexValue {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            IndexValue::Null => {}
            IndexValue::Boolean(b) => b.hash(state),
            IndexValue::Integer(i) => i.hash(state),
            IndexValue::Float(f) => f.to_bits().hash(state),
            IndexValue::DateTime(ms) => ms.hash(state),
            IndexValue::String(s) => s.hash(state),
        }
    }
}

impl PartialEq for IndexValue {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl PartialOrd for IndexValue {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for IndexValue {
    fn cmp(&self, other: &Self) -> Ordering {
        use IndexValue::*;
        match (self, other) {
            (Null, Null) => Ordering::Equal,
            (Null, _) => Ordering::Less,
            (_, Null) => Ordering::Greater,

            (Boolean(a), Boolean(b)) => a.cmp(b),
            (Boolean(_), _) => Ordering::Less,
            (_, Boolean(_)) => Ordering::Greater,

            (Integer(a), Integer(b)) => a.cmp(b),
            (Integer(a), Float(b)) => (*a as f64).total_cmp(b),
            (Float(a), Integer(b)) => a.total_cmp(&(*b as f64)),
            (Float(a), Float(b)) => a.total_cmp(b),
            (Integer(_) | Float(_), _) => Ordering::Less,
            (_, Integer(_) | Float(_)) => Ordering::Greater,

            (DateTime(a), DateTime(b)) => a.cmp(b),
            (DateTime(_), _) => Ordering::Less,
            (_, DateTime(_)) => Ordering::Greater,

            (String(a), String(b)) => a.cmp(b),
        }
    }
}

impl IndexValue {
    /// Convert a JSON value to an `IndexValue`. Recognizes the date
    /// sentinel object and date-shaped strings; everything else maps
    /// structurally.
    pub fn from_json(value: &JsonValue) -> Self {
        match value {
            JsonValue::Null => IndexValue::Null,
            JsonValue::Bool(b) => IndexValue::Boolean(*b),
            JsonValue::Number(n) => {
                if let Some(i) = n.as_i64() {
                    IndexValue::Integer(i)
                } else if let Some(f) = n.as_f64() {
                    IndexValue::Float(f)
                } else {
                    IndexValue::Null
                }
            }
            JsonValue::String(s) => Self::parse_string(s),
            JsonValue::Object(map) => {
                if map.len() == 1 {
                    if let Some(date) = map.get(DATE_SENTINEL) {
                        if let Some(v) = Self::from_date_sentinel(date) {
                            return v;
                        }
                    }
                }
                IndexValue::String(value.to_string())
            }
            other => IndexValue::String(other.to_string()),
        }
    }

    fn from_date_sentinel(date: &JsonValue) -> Option<IndexValue> {
        if let Some(ms) = date.as_i64() {
            return Some(IndexValue::DateTime(ms));
        }
        if let Some(s) = date.as_str() {
            if let IndexValue::DateTime(ms) = Self::parse_string(s) {
                return Some(IndexValue::DateTime(ms));
            }
        }
        None
    }

    pub fn parse_string(s: &str) -> Self {
        // Fast path: skip date parsing for strings that don't look like
        // dates. Valid date strings start with YYYY-MM.
        let b = s.as_bytes();
        if b.len() < 10
            || !b[0].is_ascii_digit()
            || !b[1].is_ascii_digit()
            || !b[2].is_ascii_digit()
            || !b[3].is_ascii_digit()
            || b[4] != b'-'
            || !b[5].is_ascii_digit()
            || !b[6].is_ascii_digit()
        {
            return IndexValue::String(s.to_string());
        }

        if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(s) {
            return IndexValue::DateTime(dt.timestamp_millis());
        }
        if let Ok(dt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S") {
            return IndexValue::DateTime(dt.and_utc().timestamp_millis());
        }
        if let Ok(dt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
            return IndexValue::DateTime(dt.and_utc().timestamp_millis());
        }
        if let Ok(d) = chrono::NaiveDate::parse_from_str(s, "%Y-%m-%d") {
            if let Some(dt) = d.and_hms_opt(0, 0, 0) {
                return IndexValue::DateTime(dt.and_utc().timestamp_millis());
            }
        }
        IndexValue::String(s.to_string())
    }

    /// Returns the immediate successor in the ordering, if computable.
    pub fn try_successor(&self) -> Option<IndexValue> {
        match self {
            IndexValue::Null => Some(IndexValue::Boolean(false)),
            IndexValue::Boolean(false) => Some(IndexValue::Boolean(true)),
            IndexValue::Boolean(true) => Some(IndexValue::Integer(i64::MIN)),
            IndexValue::Integer(n) if *n < i64::MAX => Some(IndexValue::Integer(n + 1)),
            IndexValue::DateTime(n) if *n < i64::MAX => Some(IndexValue::DateTime(n + 1)),
            IndexValue::DateTime(_) => Some(IndexValue::String(String::new())),
            IndexValue::String(s) => {
                let mut next = s.clone();
                next.push('\0');
                Some(IndexValue::String(next))
            }
            _ => None,
        }
    }
}
